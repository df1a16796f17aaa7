//! A `LedgerStore` whose backend is unreachable.

use std::io;

use async_trait::async_trait;
use uuid::Uuid;

use callex_core::error::LedgerError;
use callex_core::event::AuditEvent;
use callex_core::filter::EventFilter;
use callex_core::repository::{LedgerStore, LedgerTransaction, StorageInfo};

fn connection_refused() -> LedgerError {
    LedgerError::internal(
        "connection refused",
        io::Error::new(io::ErrorKind::ConnectionRefused, "ledger backend is down"),
    )
}

/// A ledger store that fails every call with an internal error.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingLedgerStore;

#[async_trait]
impl LedgerStore for FailingLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        Err(connection_refused())
    }

    async fn get_by_id(&self, _id: Uuid) -> Result<Option<AuditEvent>, LedgerError> {
        Err(connection_refused())
    }

    async fn get_by_sequence(&self, _sequence: u64) -> Result<Option<AuditEvent>, LedgerError> {
        Err(connection_refused())
    }

    async fn scan_range(&self, _start: u64, _end: u64) -> Result<Vec<AuditEvent>, LedgerError> {
        Err(connection_refused())
    }

    async fn sequence_numbers(&self, _start: u64, _end: u64) -> Result<Vec<u64>, LedgerError> {
        Err(connection_refused())
    }

    async fn find(&self, _filter: &EventFilter) -> Result<Vec<AuditEvent>, LedgerError> {
        Err(connection_refused())
    }

    async fn count(&self, _filter: &EventFilter) -> Result<u64, LedgerError> {
        Err(connection_refused())
    }

    async fn latest_sequence(&self) -> Result<u64, LedgerError> {
        Err(connection_refused())
    }

    async fn latest_hash(&self) -> Result<String, LedgerError> {
        Err(connection_refused())
    }

    async fn mark_archived(&self, _id: Uuid, _archived: bool) -> Result<(), LedgerError> {
        Err(connection_refused())
    }

    async fn storage_info(&self) -> Result<StorageInfo, LedgerError> {
        Err(connection_refused())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Err(connection_refused())
    }
}
