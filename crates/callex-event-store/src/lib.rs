//! PostgreSQL-backed storage for the call-exchange audit ledger.

pub mod pg_ledger_store;
pub mod schema;

pub use pg_ledger_store::PgLedgerStore;
