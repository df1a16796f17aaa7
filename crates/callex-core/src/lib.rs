//! Shared abstractions for the call-exchange audit ledger.
//!
//! This crate defines the audit event, the hash chain, sequence allocation,
//! query predicates and the storage port. It contains no infrastructure code.

pub mod clock;
pub mod error;
pub mod event;
pub mod filter;
pub mod hash;
pub mod repository;
pub mod sequence;
