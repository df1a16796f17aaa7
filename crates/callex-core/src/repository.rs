//! Ledger storage port.
//!
//! The ledger is written only through a [`LedgerTransaction`]. Opening one
//! serializes writers, so sequence allocation, the latest-hash read, hash
//! computation and the insert form a single atomic unit. Dropping a
//! transaction without committing discards everything staged in it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::event::AuditEvent;
use crate::filter::EventFilter;
use crate::sequence::SequenceAllocator;

/// One physical storage segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Segment name.
    pub name: String,
    /// Time bounds as reported by the backend, if it partitions by time.
    pub bounds: Option<String>,
    /// Approximate number of rows.
    pub row_count: u64,
    /// Size on disk in bytes.
    pub size_bytes: u64,
}

/// Storage footprint of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Backend name, e.g. `postgres`.
    pub backend: String,
    /// Number of persisted events.
    pub total_events: u64,
    /// Total size in bytes, indexes included.
    pub total_size_bytes: u64,
    /// Per-segment breakdown. Empty for unpartitioned storage.
    pub partitions: Vec<PartitionInfo>,
}

/// An open, exclusive write unit.
#[async_trait]
pub trait LedgerTransaction: SequenceAllocator {
    /// Hash of the highest-positioned event, including events staged in this
    /// transaction. The empty sentinel on an empty ledger.
    async fn latest_hash(&mut self) -> Result<String, LedgerError>;

    /// Stages a sealed event.
    ///
    /// Fails with `LedgerError::Conflict` if its sequence number or id is
    /// already taken. A preset sequence ahead of the allocator advances it.
    async fn insert(&mut self, event: &AuditEvent) -> Result<(), LedgerError>;

    /// Makes every staged event durable at once.
    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    /// Discards every staged event and releases the allocator.
    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

/// Append-only storage for audit events.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens an exclusive write transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError>;

    /// Loads one event by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<AuditEvent>, LedgerError>;

    /// Loads one event by position.
    async fn get_by_sequence(&self, sequence: u64) -> Result<Option<AuditEvent>, LedgerError>;

    /// Loads events with positions in `[start, end]`, ordered by position.
    async fn scan_range(&self, start: u64, end: u64) -> Result<Vec<AuditEvent>, LedgerError>;

    /// Positions present in `[start, end]`, ascending.
    async fn sequence_numbers(&self, start: u64, end: u64) -> Result<Vec<u64>, LedgerError>;

    /// One page of events matching `filter`, in the filter's order.
    async fn find(&self, filter: &EventFilter) -> Result<Vec<AuditEvent>, LedgerError>;

    /// Number of events matching `filter`, ignoring pagination.
    async fn count(&self, filter: &EventFilter) -> Result<u64, LedgerError>;

    /// Highest persisted position, or `GENESIS_SEQUENCE` when empty.
    async fn latest_sequence(&self) -> Result<u64, LedgerError>;

    /// Hash of the highest persisted position, or the empty sentinel.
    async fn latest_hash(&self) -> Result<String, LedgerError>;

    /// Sets the retention marker. Touches no other field.
    async fn mark_archived(&self, id: Uuid, archived: bool) -> Result<(), LedgerError>;

    /// Reports size and segment breakdown.
    async fn storage_info(&self) -> Result<StorageInfo, LedgerError>;

    /// Round-trips to the backend.
    async fn ping(&self) -> Result<(), LedgerError>;
}
