//! `PostgreSQL` implementation of the `LedgerStore` port.
//!
//! Writers serialize on a row lock over the single `audit_sequence` row.
//! The lock is taken when a transaction begins and released on commit or
//! rollback, so allocation, the latest-hash read and the inserts happen in
//! one atomic unit. Readers go straight to the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use callex_core::error::{EventLookup, LedgerError};
use callex_core::event::{AuditEvent, ComplianceFlags, Metadata};
use callex_core::filter::EventFilter;
use callex_core::hash::GENESIS_PREVIOUS_HASH;
use callex_core::repository::{LedgerStore, LedgerTransaction, PartitionInfo, StorageInfo};
use callex_core::sequence::{SequenceAllocator, SequenceCounter};

use crate::schema::{EVENT_COLUMNS, EVENTS_TABLE, FILTER_PREDICATE};

/// Converts a position to its column value. Positions never exceed
/// `i64::MAX`; anything larger is clamped, which only widens range scans.
fn to_column(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

fn from_column(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn db_error(context: &str, error: sqlx::Error) -> LedgerError {
    LedgerError::internal(context, error)
}

/// Maps an insert failure, turning unique violations into conflicts.
fn insert_error(event: &AuditEvent, error: sqlx::Error) -> LedgerError {
    let unique = error
        .as_database_error()
        .filter(|db| db.is_unique_violation())
        .map(|db| db.constraint().unwrap_or_default().to_owned());
    match unique {
        Some(constraint) => {
            let message = if constraint.ends_with("_pkey") {
                format!("event {} is already persisted", event.id)
            } else {
                format!(
                    "sequence {} is already persisted",
                    event.sequence_num.unwrap_or_default()
                )
            };
            LedgerError::Conflict {
                sequence: event.sequence_num,
                message,
            }
        }
        None => db_error("failed to insert audit event", error),
    }
}

/// Escapes `ILIKE` wildcards and wraps the term for substring matching.
fn search_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[derive(Debug, FromRow)]
struct AuditEventRow {
    id: Uuid,
    sequence_num: i64,
    event_type: String,
    severity: String,
    action: String,
    result: String,
    actor_id: String,
    actor_type: String,
    target_id: String,
    target_type: String,
    metadata: Json<Metadata>,
    compliance_flags: Json<ComplianceFlags>,
    occurred_at: DateTime<Utc>,
    event_hash: String,
    previous_hash: String,
    archived: bool,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = LedgerError;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let malformed = move |error: LedgerError| {
            LedgerError::internal(format!("stored audit event {id} is malformed"), error)
        };
        Ok(Self {
            id: row.id,
            sequence_num: Some(from_column(row.sequence_num)),
            event_type: row.event_type.parse().map_err(malformed)?,
            severity: row.severity.parse().map_err(malformed)?,
            action: row.action,
            result: row.result.parse().map_err(malformed)?,
            actor_id: row.actor_id,
            actor_type: row.actor_type.parse().map_err(malformed)?,
            target_id: row.target_id,
            target_type: row.target_type.parse().map_err(malformed)?,
            metadata: row.metadata.0,
            compliance_flags: row.compliance_flags.0,
            timestamp: row.occurred_at,
            event_hash: Some(row.event_hash),
            previous_hash: row.previous_hash,
            archived: row.archived,
        })
    }
}

fn into_events(rows: Vec<AuditEventRow>) -> Result<Vec<AuditEvent>, LedgerError> {
    rows.into_iter().map(AuditEvent::try_from).collect()
}

/// `EventFilter` flattened into bind parameters for [`FILTER_PREDICATE`].
struct FilterParams {
    event_types: Vec<String>,
    severities: Vec<String>,
    actor_ids: Vec<String>,
    target_ids: Vec<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    compliance_flags: serde_json::Value,
    search: Option<String>,
    archived: Option<bool>,
}

impl FilterParams {
    fn new(filter: &EventFilter) -> Result<Self, LedgerError> {
        let compliance_flags = serde_json::to_value(&filter.compliance_flags)
            .map_err(|e| LedgerError::internal("failed to encode compliance flags", e))?;
        Ok(Self {
            event_types: filter
                .event_types
                .iter()
                .map(|t| t.as_str().to_owned())
                .collect(),
            severities: filter
                .severities
                .iter()
                .map(|s| s.as_str().to_owned())
                .collect(),
            actor_ids: filter.actor_ids.clone(),
            target_ids: filter.target_ids.clone(),
            start_time: filter.start_time,
            end_time: filter.end_time,
            compliance_flags,
            search: filter.search_term().map(|term| search_pattern(&term)),
            archived: filter.archived,
        })
    }
}

/// PostgreSQL-backed audit ledger.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Creates a new `PgLedgerStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("failed to begin ledger transaction", e))?;

        let (current,): (i64,) =
            sqlx::query_as("SELECT current_value FROM audit_sequence WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error("failed to lock sequence counter", e))?;

        // Rows written with preset positions outside this path still count.
        let (persisted,): (i64,) = sqlx::query_as(&format!(
            "SELECT COALESCE(MAX(sequence_num), 0) FROM {EVENTS_TABLE}"
        ))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("failed to read latest sequence", e))?;

        let mut counter = SequenceCounter::resume_after(from_column(current));
        counter.observe(from_column(persisted));
        debug!(latest = counter.current(), "ledger transaction opened");

        Ok(Box::new(PgLedgerTransaction { tx, counter }))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<AuditEvent>, LedgerError> {
        let row: Option<AuditEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM {EVENTS_TABLE} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("failed to load audit event", e))?;
        row.map(AuditEvent::try_from).transpose()
    }

    async fn get_by_sequence(&self, sequence: u64) -> Result<Option<AuditEvent>, LedgerError> {
        let row: Option<AuditEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM {EVENTS_TABLE} WHERE sequence_num = $1"
        ))
        .bind(to_column(sequence))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("failed to load audit event", e))?;
        row.map(AuditEvent::try_from).transpose()
    }

    async fn scan_range(&self, start: u64, end: u64) -> Result<Vec<AuditEvent>, LedgerError> {
        let rows: Vec<AuditEventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM {EVENTS_TABLE} \
             WHERE sequence_num BETWEEN $1 AND $2 ORDER BY sequence_num"
        ))
        .bind(to_column(start))
        .bind(to_column(end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("failed to scan audit events", e))?;
        into_events(rows)
    }

    async fn sequence_numbers(&self, start: u64, end: u64) -> Result<Vec<u64>, LedgerError> {
        let sequences: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT sequence_num FROM {EVENTS_TABLE} \
             WHERE sequence_num BETWEEN $1 AND $2 ORDER BY sequence_num"
        ))
        .bind(to_column(start))
        .bind(to_column(end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("failed to scan sequence numbers", e))?;
        Ok(sequences.into_iter().map(from_column).collect())
    }

    #[instrument(skip_all, fields(limit = filter.limit, offset = filter.offset))]
    async fn find(&self, filter: &EventFilter) -> Result<Vec<AuditEvent>, LedgerError> {
        let params = FilterParams::new(filter)?;
        let direction = filter.sort_direction.keyword();
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM {EVENTS_TABLE} WHERE {FILTER_PREDICATE} \
             ORDER BY {column} {direction}, sequence_num {direction} \
             LIMIT $10 OFFSET $11",
            column = filter.sort_by.column(),
        );
        let rows: Vec<AuditEventRow> = sqlx::query_as(&sql)
            .bind(&params.event_types)
            .bind(&params.severities)
            .bind(&params.actor_ids)
            .bind(&params.target_ids)
            .bind(params.start_time)
            .bind(params.end_time)
            .bind(&params.compliance_flags)
            .bind(&params.search)
            .bind(params.archived)
            .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("failed to query audit events", e))?;
        into_events(rows)
    }

    async fn count(&self, filter: &EventFilter) -> Result<u64, LedgerError> {
        let params = FilterParams::new(filter)?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {EVENTS_TABLE} WHERE {FILTER_PREDICATE}"
        ))
        .bind(&params.event_types)
        .bind(&params.severities)
        .bind(&params.actor_ids)
        .bind(&params.target_ids)
        .bind(params.start_time)
        .bind(params.end_time)
        .bind(&params.compliance_flags)
        .bind(&params.search)
        .bind(params.archived)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("failed to count audit events", e))?;
        Ok(from_column(count))
    }

    async fn latest_sequence(&self) -> Result<u64, LedgerError> {
        let latest: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(sequence_num), 0) FROM {EVENTS_TABLE}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("failed to read latest sequence", e))?;
        Ok(from_column(latest))
    }

    async fn latest_hash(&self) -> Result<String, LedgerError> {
        let hash: Option<String> = sqlx::query_scalar(&format!(
            "SELECT event_hash FROM {EVENTS_TABLE} ORDER BY sequence_num DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("failed to read latest hash", e))?;
        Ok(hash.unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_owned()))
    }

    async fn mark_archived(&self, id: Uuid, archived: bool) -> Result<(), LedgerError> {
        let result = sqlx::query(&format!(
            "UPDATE {EVENTS_TABLE} SET archived = $2 WHERE id = $1"
        ))
        .bind(id)
        .bind(archived)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to update archive marker", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(EventLookup::Id(id)));
        }
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, LedgerError> {
        let (total_events, total_size_bytes): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), pg_total_relation_size('{EVENTS_TABLE}')::BIGINT FROM {EVENTS_TABLE}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("failed to measure audit events", e))?;

        // Empty unless an external process has partitioned the table.
        let partitions: Vec<(String, Option<String>, i64, i64)> = sqlx::query_as(&format!(
            "SELECT c.relname::TEXT, pg_get_expr(c.relpartbound, c.oid), \
                    GREATEST(c.reltuples, 0)::BIGINT, pg_total_relation_size(c.oid)::BIGINT \
             FROM pg_inherits i JOIN pg_class c ON c.oid = i.inhrelid \
             WHERE i.inhparent = '{EVENTS_TABLE}'::regclass \
             ORDER BY c.relname"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("failed to list partitions", e))?;

        Ok(StorageInfo {
            backend: "postgres".to_owned(),
            total_events: from_column(total_events),
            total_size_bytes: from_column(total_size_bytes),
            partitions: partitions
                .into_iter()
                .map(|(name, bounds, row_count, size_bytes)| PartitionInfo {
                    name,
                    bounds,
                    row_count: from_column(row_count),
                    size_bytes: from_column(size_bytes),
                })
                .collect(),
        })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("ledger database is unreachable", e))?;
        Ok(())
    }
}

/// Write transaction holding the sequence counter lock.
struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
    counter: SequenceCounter,
}

#[async_trait]
impl SequenceAllocator for PgLedgerTransaction {
    async fn next(&mut self) -> Result<u64, LedgerError> {
        self.counter.advance()
    }

    async fn latest(&mut self) -> Result<u64, LedgerError> {
        Ok(self.counter.current())
    }
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn latest_hash(&mut self) -> Result<String, LedgerError> {
        let hash: Option<String> = sqlx::query_scalar(&format!(
            "SELECT event_hash FROM {EVENTS_TABLE} ORDER BY sequence_num DESC LIMIT 1"
        ))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("failed to read latest hash", e))?;
        Ok(hash.unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_owned()))
    }

    async fn insert(&mut self, event: &AuditEvent) -> Result<(), LedgerError> {
        let (Some(sequence), Some(event_hash)) = (event.sequence_num, event.event_hash.as_deref())
        else {
            return Err(LedgerError::validation(
                "only sealed events with a sequence number can be inserted",
            ));
        };

        sqlx::query(&format!(
            "INSERT INTO {EVENTS_TABLE} ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(event.id)
        .bind(to_column(sequence))
        .bind(event.event_type.as_str())
        .bind(event.severity.as_str())
        .bind(&event.action)
        .bind(event.result.as_str())
        .bind(&event.actor_id)
        .bind(event.actor_type.as_str())
        .bind(&event.target_id)
        .bind(event.target_type.as_str())
        .bind(Json(&event.metadata))
        .bind(Json(&event.compliance_flags))
        .bind(event.timestamp)
        .bind(event_hash)
        .bind(&event.previous_hash)
        .bind(event.archived)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| insert_error(event, e))?;

        self.counter.observe(sequence);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let Self { mut tx, counter } = *self;
        sqlx::query("UPDATE audit_sequence SET current_value = GREATEST(current_value, $1) WHERE id = 1")
            .bind(to_column(counter.current()))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("failed to advance sequence counter", e))?;
        tx.commit()
            .await
            .map_err(|e| db_error("failed to commit ledger transaction", e))?;
        debug!(latest = counter.current(), "ledger transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        let Self { tx, counter } = *self;
        if let Err(error) = tx.rollback().await {
            warn!(error = %error, "ledger rollback failed");
            return Err(db_error("failed to roll back ledger transaction", error));
        }
        debug!(discarded_after = counter.current(), "ledger transaction rolled back");
        Ok(())
    }
}
