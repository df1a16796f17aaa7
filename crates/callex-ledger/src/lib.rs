//! Call-exchange audit ledger.
//!
//! Append path, queries, integrity verification and the operational
//! surface, all written against the storage port in `callex-core`.

pub mod application;
pub mod config;
pub mod domain;

pub use config::LedgerConfig;
