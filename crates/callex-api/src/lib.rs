//! HTTP boundary for the call-exchange audit ledger.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
