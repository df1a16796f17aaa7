//! Integrity verifier.
//!
//! Everything here is read-only. Findings are reported, never repaired.

use std::time::{Duration, Instant};

use callex_core::clock::Clock;
use callex_core::error::{EventLookup, LedgerError};
use callex_core::event::AuditEvent;
use callex_core::filter::{EventFilter, SortDirection, SortField};
use callex_core::hash::{self, GENESIS_PREVIOUS_HASH};
use callex_core::repository::LedgerStore;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::integrity::{
    ChainCursor, ChainError, ChainErrorKind, ChainIntegrityResult, ChainLink, GapSeverity,
    IntegrityCriteria, IntegrityReport, IntegrityResult, IntegrityStatus, SequenceGap,
};

const FIRST_SEQUENCE: u64 = 1;

/// Controls for a long-running chain verification.
#[derive(Debug, Clone)]
pub struct ChainVerifyOptions {
    /// Events loaded per round-trip.
    pub chunk_size: u64,
    /// Stops between chunks once the watched value turns true.
    pub cancel: Option<watch::Receiver<bool>>,
    /// Stops between chunks once this much time has passed. At least one
    /// chunk is always verified per call.
    pub deadline: Option<Duration>,
}

impl ChainVerifyOptions {
    /// Uninterruptible verification with the configured chunk size.
    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            chunk_size: config.verify_chunk_size.max(1),
            cancel: None,
            deadline: None,
        }
    }

    /// Adds a cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Adds a deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|cancel| *cancel.borrow())
    }
}

impl Default for ChainVerifyOptions {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Re-hashes one already loaded event.
fn inspect(event: &AuditEvent) -> IntegrityResult {
    let stored_hash = event.event_hash.clone().unwrap_or_default();
    let computed_hash = hash::compute_event_hash(event, &event.previous_hash);
    let hash_valid = !stored_hash.is_empty() && stored_hash == computed_hash;

    let mut errors = Vec::new();
    if event.sequence_num.is_none() {
        errors.push("event has no sequence number".to_owned());
    }
    if stored_hash.is_empty() {
        errors.push("event has no stored hash".to_owned());
    } else if !hash_valid {
        errors.push(format!(
            "hash mismatch: stored {stored_hash}, computed {computed_hash}"
        ));
    }

    IntegrityResult {
        event_id: event.id,
        sequence_num: event.sequence_num,
        is_valid: hash_valid && errors.is_empty(),
        hash_valid,
        computed_hash,
        stored_hash,
        errors,
    }
}

/// Reloads one event and checks its stored hash against a fresh
/// computation over its stored fields and stored `previous_hash`.
///
/// # Errors
///
/// Returns `LedgerError::NotFound` if no event has this id.
#[instrument(skip(store))]
pub async fn verify_event(id: Uuid, store: &dyn LedgerStore) -> Result<IntegrityResult, LedgerError> {
    let event = store
        .get_by_id(id)
        .await?
        .ok_or(LedgerError::NotFound(EventLookup::Id(id)))?;
    let result = inspect(&event);
    if result.is_valid {
        debug!(sequence = event.sequence_num, "event hash verified");
    } else {
        warn!(
            sequence = event.sequence_num,
            errors = ?result.errors,
            "event failed verification"
        );
    }
    Ok(result)
}

/// Checks one event of a chain scan and returns the link it leaves behind.
fn check_chain_event(
    event: &AuditEvent,
    last_link: Option<&ChainLink>,
    result: &mut ChainIntegrityResult,
) -> Option<ChainLink> {
    let Some(sequence) = event.sequence_num else {
        result.record(ChainError {
            sequence: 0,
            event_id: event.id,
            kind: ChainErrorKind::VerificationError,
            message: "event has no sequence number".to_owned(),
        });
        return None;
    };
    let Some(stored_hash) = event.event_hash.clone() else {
        result.record(ChainError {
            sequence,
            event_id: event.id,
            kind: ChainErrorKind::VerificationError,
            message: "event has no stored hash".to_owned(),
        });
        return None;
    };

    let inspected = inspect(event);
    if !inspected.hash_valid {
        result.record(ChainError {
            sequence,
            event_id: event.id,
            kind: ChainErrorKind::HashMismatch,
            message: format!(
                "stored hash {} does not match computed hash {}",
                inspected.stored_hash, inspected.computed_hash
            ),
        });
    }

    match last_link {
        Some(link) if event.previous_hash != link.event_hash => {
            result.record(ChainError {
                sequence,
                event_id: event.id,
                kind: ChainErrorKind::ChainBreak,
                message: format!(
                    "previous_hash does not match event_hash of sequence {}",
                    link.sequence
                ),
            });
        }
        None if sequence == FIRST_SEQUENCE && event.previous_hash != GENESIS_PREVIOUS_HASH => {
            result.record(ChainError {
                sequence,
                event_id: event.id,
                kind: ChainErrorKind::ChainBreak,
                message: "first event of the ledger must link to the empty hash".to_owned(),
            });
        }
        _ => {}
    }

    Some(ChainLink {
        sequence,
        event_hash: stored_hash,
    })
}

async fn run_chain(
    mut result: ChainIntegrityResult,
    mut cursor: ChainCursor,
    store: &dyn LedgerStore,
    options: &ChainVerifyOptions,
) -> Result<ChainIntegrityResult, LedgerError> {
    let started = Instant::now();
    let end = result.end_sequence;
    let chunk_size = options.chunk_size.max(1);
    let mut chunks = 0_u64;
    result.resume_from = None;

    while cursor.next_sequence <= end {
        let deadline_passed = chunks > 0
            && options
                .deadline
                .is_some_and(|deadline| started.elapsed() >= deadline);
        if options.is_cancelled() || deadline_passed {
            warn!(
                next_sequence = cursor.next_sequence,
                end,
                cancelled = !deadline_passed,
                "chain verification interrupted"
            );
            result.resume_from = Some(cursor);
            break;
        }

        let chunk_start = cursor.next_sequence;
        let chunk_end = chunk_start.saturating_add(chunk_size - 1).min(end);
        let events = store.scan_range(chunk_start, chunk_end).await?;
        for event in &events {
            if let Some(link) = check_chain_event(event, cursor.last_link.as_ref(), &mut result) {
                cursor.last_link = Some(link);
            }
            result.events_checked += 1;
        }
        chunks += 1;
        debug!(
            chunk_start,
            chunk_end,
            loaded = events.len(),
            "chain chunk verified"
        );

        if chunk_end >= end {
            break;
        }
        cursor.next_sequence = chunk_end + 1;
    }

    result.check_time_ms = result.check_time_ms.saturating_add(elapsed_ms(started));
    if result.is_complete() {
        if result.is_valid {
            info!(
                start = result.start_sequence,
                end,
                events_checked = result.events_checked,
                "chain verified"
            );
        } else {
            warn!(
                start = result.start_sequence,
                end,
                errors = result.errors.len(),
                broken_at = result.broken_at,
                "chain verification found errors"
            );
        }
    }
    Ok(result)
}

/// Verifies every event in `[start, end]` and the links between adjacent
/// loaded events, in one uninterrupted pass.
///
/// # Errors
///
/// Returns `LedgerError::Validation` if `start > end`, or a storage error.
pub async fn verify_chain(
    start: u64,
    end: u64,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<ChainIntegrityResult, LedgerError> {
    verify_chain_with(start, end, store, &ChainVerifyOptions::from_config(config)).await
}

/// Like [`verify_chain`], loading `options.chunk_size` events at a time and
/// stopping between chunks on cancellation or deadline. An interrupted
/// result carries `resume_from`.
///
/// Position 0 is never allocated; a range starting there starts at 1.
///
/// # Errors
///
/// Returns `LedgerError::Validation` if `start > end`, or a storage error.
#[instrument(skip(store, options), fields(chunk_size = options.chunk_size))]
pub async fn verify_chain_with(
    start: u64,
    end: u64,
    store: &dyn LedgerStore,
    options: &ChainVerifyOptions,
) -> Result<ChainIntegrityResult, LedgerError> {
    if start > end {
        return Err(LedgerError::validation(format!(
            "start sequence {start} is after end sequence {end}"
        )));
    }
    let start = start.max(FIRST_SEQUENCE);
    let result = ChainIntegrityResult::new(start, end);
    let cursor = ChainCursor {
        next_sequence: start,
        last_link: None,
    };
    run_chain(result, cursor, store, options).await
}

/// Continues an interrupted verification from its cursor. Sub-ranges that
/// were already checked are not loaded again. A complete result is
/// returned unchanged.
///
/// # Errors
///
/// Returns a storage error.
pub async fn resume_chain(
    partial: ChainIntegrityResult,
    store: &dyn LedgerStore,
    options: &ChainVerifyOptions,
) -> Result<ChainIntegrityResult, LedgerError> {
    match partial.resume_from.clone() {
        Some(cursor) => run_chain(partial, cursor, store, options).await,
        None => Ok(partial),
    }
}

/// Finds runs of missing positions in `[start, end]`.
///
/// Positions are dense from 1, so every position in `[start, end]` up to the
/// latest persisted one must be present. Missing runs are reported clipped
/// to the range; positions after the latest persisted one are not gaps.
///
/// # Errors
///
/// Returns `LedgerError::Validation` if `start > end`, or a storage error.
#[instrument(skip(store, config))]
pub async fn find_gaps(
    start: u64,
    end: u64,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<Vec<SequenceGap>, LedgerError> {
    if start > end {
        return Err(LedgerError::validation(format!(
            "start sequence {start} is after end sequence {end}"
        )));
    }
    let start = start.max(FIRST_SEQUENCE);
    let end = end.min(store.latest_sequence().await?);
    let chunk_size = config.verify_chunk_size.max(1);

    let mut gaps = Vec::new();
    if start > end {
        return Ok(gaps);
    }
    let mut previous = start - 1;
    let mut chunk_start = start;
    loop {
        let chunk_end = chunk_start.saturating_add(chunk_size - 1).min(end);
        for sequence in store.sequence_numbers(chunk_start, chunk_end).await? {
            if sequence > previous + 1 {
                gaps.push(SequenceGap::new(previous + 1, sequence - 1));
            }
            previous = sequence;
        }
        if chunk_end >= end {
            break;
        }
        chunk_start = chunk_end + 1;
    }
    // `end` never exceeds the latest persisted position, so a run that
    // reaches it is still followed by a persisted event.
    if previous < end {
        gaps.push(SequenceGap::new(previous + 1, end));
    }

    for gap in &gaps {
        warn!(
            start = gap.start,
            end = gap.end,
            size = gap.size,
            severity = ?gap.severity,
            "sequence gap detected"
        );
    }
    Ok(gaps)
}

/// Resolves the criteria to a concrete `[start, end]`, or `None` when no
/// persisted event falls inside them.
async fn resolve_range(
    criteria: &IntegrityCriteria,
    store: &dyn LedgerStore,
) -> Result<Option<(u64, u64)>, LedgerError> {
    let latest = store.latest_sequence().await?;
    let mut start = criteria.start_sequence.unwrap_or(FIRST_SEQUENCE).max(FIRST_SEQUENCE);
    let mut end = criteria.end_sequence.unwrap_or(latest).min(latest);

    if criteria.start_time.is_some() || criteria.end_time.is_some() {
        let mut window = EventFilter::new().page(1, 0);
        window.start_time = criteria.start_time;
        window.end_time = criteria.end_time;

        let first = store
            .find(&window.clone().order_by(SortField::Sequence, SortDirection::Asc))
            .await?;
        let last = store
            .find(&window.order_by(SortField::Sequence, SortDirection::Desc))
            .await?;
        match (
            first.first().and_then(|e| e.sequence_num),
            last.first().and_then(|e| e.sequence_num),
        ) {
            (Some(first), Some(last)) => {
                start = start.max(first);
                end = end.min(last);
            }
            _ => return Ok(None),
        }
    }

    Ok((start <= end).then_some((start, end)))
}

fn status_for(chain: Option<&ChainIntegrityResult>, gaps: Option<&[SequenceGap]>) -> IntegrityStatus {
    let broken = chain.is_some_and(|chain| chain.errors.iter().any(|error| error.kind.is_break()));
    let large_gap = gaps.is_some_and(|gaps| gaps.iter().any(|gap| gap.severity == GapSeverity::High));
    if broken || large_gap {
        return IntegrityStatus::Critical;
    }

    let unverifiable = chain.is_some_and(|chain| {
        chain.count_of(ChainErrorKind::VerificationError) > 0 || !chain.is_complete()
    });
    let any_gap = gaps.is_some_and(|gaps| !gaps.is_empty());
    if unverifiable || any_gap {
        IntegrityStatus::Degraded
    } else {
        IntegrityStatus::Healthy
    }
}

fn recommendations_for(
    chain: Option<&ChainIntegrityResult>,
    gaps: Option<&[SequenceGap]>,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if let Some(chain) = chain {
        let mismatches = chain.count_of(ChainErrorKind::HashMismatch);
        if mismatches > 0 {
            recommendations.push(format!(
                "{mismatches} event(s) failed hash verification; treat them as tampered and escalate for forensic review"
            ));
        }
        let breaks = chain.count_of(ChainErrorKind::ChainBreak);
        if breaks > 0 {
            let at = chain
                .broken_at
                .map_or_else(String::new, |sequence| format!(" (first at sequence {sequence})"));
            recommendations.push(format!(
                "{breaks} chain break(s){at}; compare the range against backups before any authorized repair"
            ));
        }
        let unverifiable = chain.count_of(ChainErrorKind::VerificationError);
        if unverifiable > 0 {
            recommendations.push(format!(
                "{unverifiable} event(s) could not be verified; inspect them individually"
            ));
        }
        if let Some(cursor) = &chain.resume_from {
            recommendations.push(format!(
                "chain verification stopped before sequence {}; resume it to cover the rest of the range",
                cursor.next_sequence
            ));
        }
    }

    if let Some(gaps) = gaps.filter(|gaps| !gaps.is_empty()) {
        let missing: u64 = gaps.iter().map(|gap| gap.size).sum();
        recommendations.push(format!(
            "{} sequence gap(s) covering {missing} position(s); see each gap's remediation",
            gaps.len()
        ));
    }

    recommendations
}

/// Runs the checks selected by `criteria` and aggregates them into a
/// verdict with recommendations.
///
/// Chain verification gets half of `config.operation_timeout`; if it runs
/// out, the report is degraded and says where to resume.
///
/// # Errors
///
/// Returns a storage error. Findings are part of the report, not errors.
#[instrument(skip(store, config, clock))]
pub async fn generate_integrity_report(
    criteria: IntegrityCriteria,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
    clock: &dyn Clock,
) -> Result<IntegrityReport, LedgerError> {
    let generated_at = clock.now();
    let range = resolve_range(&criteria, store).await?;

    let (chain, gaps) = match range {
        Some((start, end)) => {
            let chain = if criteria.check_hash_chain {
                let options = ChainVerifyOptions::from_config(config)
                    .with_deadline(config.operation_timeout / 2);
                Some(verify_chain_with(start, end, store, &options).await?)
            } else {
                None
            };
            let gaps = if criteria.check_sequence_gaps {
                Some(find_gaps(start, end, store, config).await?)
            } else {
                None
            };
            (chain, gaps)
        }
        None => (
            None,
            criteria.check_sequence_gaps.then(Vec::new),
        ),
    };

    let status = status_for(chain.as_ref(), gaps.as_deref());
    let recommendations = recommendations_for(chain.as_ref(), gaps.as_deref());
    match status {
        IntegrityStatus::Healthy => info!(?range, "integrity report healthy"),
        _ => warn!(?range, ?status, findings = recommendations.len(), "integrity report unhealthy"),
    }

    Ok(IntegrityReport {
        status,
        generated_at,
        criteria,
        start_sequence: range.map(|(start, _)| start),
        end_sequence: range.map(|(_, end)| end),
        chain,
        gaps,
        recommendations,
    })
}
