//! In-memory `LedgerStore` with a mutex-guarded in-process counter.
//!
//! Writers serialize on an async mutex that a transaction holds until it
//! commits or is dropped. Committed rows sit behind a separate lock that is
//! only taken briefly, so readers never wait for an open transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Datelike;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use callex_core::error::{EventLookup, LedgerError};
use callex_core::event::AuditEvent;
use callex_core::filter::EventFilter;
use callex_core::hash::GENESIS_PREVIOUS_HASH;
use callex_core::repository::{LedgerStore, LedgerTransaction, PartitionInfo, StorageInfo};
use callex_core::sequence::{SequenceAllocator, SequenceCounter};

#[derive(Debug, Default)]
struct Rows {
    by_sequence: BTreeMap<u64, AuditEvent>,
    by_id: HashMap<Uuid, u64>,
}

impl Rows {
    fn collides(&self, event: &AuditEvent, sequence: u64) -> Option<LedgerError> {
        if self.by_sequence.contains_key(&sequence) {
            return Some(LedgerError::Conflict {
                sequence: Some(sequence),
                message: format!("sequence {sequence} is already persisted"),
            });
        }
        if self.by_id.contains_key(&event.id) {
            return Some(LedgerError::Conflict {
                sequence: Some(sequence),
                message: format!("event {} is already persisted", event.id),
            });
        }
        None
    }
}

/// In-memory ledger storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    rows: Arc<RwLock<Rows>>,
    writer: Arc<Mutex<SequenceCounter>>,
}

impl InMemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Rows> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Rows> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of persisted events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_sequence.len()
    }

    /// True when nothing has been persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every persisted event in sequence order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.read().by_sequence.values().cloned().collect()
    }

    /// Rewrites a persisted row in place, bypassing every ledger guarantee.
    /// Simulates tampering with the underlying storage. Returns false when no
    /// row sits at `sequence`.
    pub fn tamper(&self, sequence: u64, edit: impl FnOnce(&mut AuditEvent)) -> bool {
        let mut rows = self.write();
        match rows.by_sequence.get_mut(&sequence) {
            Some(event) => {
                edit(event);
                true
            }
            None => false,
        }
    }

    /// Removes a persisted row, bypassing every ledger guarantee. Simulates an
    /// external deletion. Returns the removed event.
    pub fn purge(&self, sequence: u64) -> Option<AuditEvent> {
        let mut rows = self.write();
        let removed = rows.by_sequence.remove(&sequence)?;
        rows.by_id.remove(&removed.id);
        Some(removed)
    }
}

fn staged_sequence(event: &AuditEvent) -> Result<u64, LedgerError> {
    match (event.sequence_num, &event.event_hash) {
        (Some(sequence), Some(_)) => Ok(sequence),
        _ => Err(LedgerError::validation(
            "only sealed events with a sequence number can be inserted",
        )),
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let counter = *guard;
        Ok(Box::new(InMemoryTransaction {
            rows: Arc::clone(&self.rows),
            guard,
            counter,
            staged: Vec::new(),
        }))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<AuditEvent>, LedgerError> {
        let rows = self.read();
        Ok(rows
            .by_id
            .get(&id)
            .and_then(|sequence| rows.by_sequence.get(sequence))
            .cloned())
    }

    async fn get_by_sequence(&self, sequence: u64) -> Result<Option<AuditEvent>, LedgerError> {
        Ok(self.read().by_sequence.get(&sequence).cloned())
    }

    async fn scan_range(&self, start: u64, end: u64) -> Result<Vec<AuditEvent>, LedgerError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .read()
            .by_sequence
            .range(start..=end)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn sequence_numbers(&self, start: u64, end: u64) -> Result<Vec<u64>, LedgerError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .read()
            .by_sequence
            .range(start..=end)
            .map(|(sequence, _)| *sequence)
            .collect())
    }

    async fn find(&self, filter: &EventFilter) -> Result<Vec<AuditEvent>, LedgerError> {
        let mut matching: Vec<AuditEvent> = self
            .read()
            .by_sequence
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        matching.sort_by(|a, b| filter.compare(a, b));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn count(&self, filter: &EventFilter) -> Result<u64, LedgerError> {
        let count = self
            .read()
            .by_sequence
            .values()
            .filter(|event| filter.matches(event))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn latest_sequence(&self) -> Result<u64, LedgerError> {
        Ok(self
            .read()
            .by_sequence
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default())
    }

    async fn latest_hash(&self) -> Result<String, LedgerError> {
        Ok(self
            .read()
            .by_sequence
            .values()
            .next_back()
            .and_then(|event| event.event_hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_owned()))
    }

    async fn mark_archived(&self, id: Uuid, archived: bool) -> Result<(), LedgerError> {
        let mut rows = self.write();
        let sequence = rows
            .by_id
            .get(&id)
            .copied()
            .ok_or(LedgerError::NotFound(EventLookup::Id(id)))?;
        if let Some(event) = rows.by_sequence.get_mut(&sequence) {
            event.archived = archived;
        }
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, LedgerError> {
        let rows = self.read();
        let mut partitions: BTreeMap<(i32, u32), PartitionInfo> = BTreeMap::new();
        let mut total_size_bytes = 0_u64;

        for event in rows.by_sequence.values() {
            let size = u64::try_from(serde_json::to_vec(event).map_or(0, |bytes| bytes.len()))
                .unwrap_or(u64::MAX);
            total_size_bytes = total_size_bytes.saturating_add(size);

            let (year, month) = (event.timestamp.year(), event.timestamp.month());
            let partition = partitions.entry((year, month)).or_insert_with(|| {
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                PartitionInfo {
                    name: format!("audit_events_{year:04}_{month:02}"),
                    bounds: Some(format!(
                        "FROM ('{year:04}-{month:02}-01') TO ('{next_year:04}-{next_month:02}-01')"
                    )),
                    row_count: 0,
                    size_bytes: 0,
                }
            });
            partition.row_count += 1;
            partition.size_bytes = partition.size_bytes.saturating_add(size);
        }

        Ok(StorageInfo {
            backend: "memory".to_owned(),
            total_events: u64::try_from(rows.by_sequence.len()).unwrap_or(u64::MAX),
            total_size_bytes,
            partitions: partitions.into_values().collect(),
        })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Write transaction over [`InMemoryLedgerStore`].
struct InMemoryTransaction {
    rows: Arc<RwLock<Rows>>,
    guard: OwnedMutexGuard<SequenceCounter>,
    counter: SequenceCounter,
    staged: Vec<AuditEvent>,
}

impl InMemoryTransaction {
    fn read(&self) -> RwLockReadGuard<'_, Rows> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SequenceAllocator for InMemoryTransaction {
    async fn next(&mut self) -> Result<u64, LedgerError> {
        self.counter.advance()
    }

    async fn latest(&mut self) -> Result<u64, LedgerError> {
        Ok(self.counter.current())
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    async fn latest_hash(&mut self) -> Result<String, LedgerError> {
        let committed = self
            .read()
            .by_sequence
            .values()
            .next_back()
            .map(|event| (event.sequence_num, event.event_hash.clone()));
        let staged = self
            .staged
            .iter()
            .max_by_key(|event| event.sequence_num)
            .map(|event| (event.sequence_num, event.event_hash.clone()));

        let latest = match (committed, staged) {
            (Some(c), Some(s)) => Some(if s.0 > c.0 { s } else { c }),
            (c, s) => c.or(s),
        };
        Ok(latest
            .and_then(|(_, hash)| hash)
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_owned()))
    }

    async fn insert(&mut self, event: &AuditEvent) -> Result<(), LedgerError> {
        let sequence = staged_sequence(event)?;
        if let Some(conflict) = self.read().collides(event, sequence) {
            return Err(conflict);
        }
        if self
            .staged
            .iter()
            .any(|staged| staged.sequence_num == Some(sequence) || staged.id == event.id)
        {
            return Err(LedgerError::Conflict {
                sequence: Some(sequence),
                message: format!("sequence {sequence} is already staged"),
            });
        }
        self.counter.observe(sequence);
        self.staged.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let Self {
            rows,
            mut guard,
            counter,
            staged,
        } = *self;
        {
            let mut rows = rows.write().unwrap_or_else(PoisonError::into_inner);
            for event in &staged {
                let sequence = staged_sequence(event)?;
                if let Some(conflict) = rows.collides(event, sequence) {
                    return Err(conflict);
                }
            }
            for event in staged {
                let sequence = staged_sequence(&event)?;
                rows.by_id.insert(event.id, sequence);
                rows.by_sequence.insert(sequence, event);
            }
        }
        *guard = counter;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}
