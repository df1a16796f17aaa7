//! Command handlers for the ledger write path.
//!
//! Every write runs inside one storage transaction: sequence allocation, the
//! latest-hash read, hash computation and the insert either all commit or
//! none of them do.

use std::future::Future;
use std::time::Duration;

use callex_core::error::LedgerError;
use callex_core::event::AuditEvent;
use callex_core::hash;
use callex_core::repository::{LedgerStore, LedgerTransaction};
use callex_core::sequence::SequenceAllocator;
use rand::Rng;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const RETRY_BASE_DELAY_MS: u64 = 10;
const RETRY_MAX_DELAY_MS: u64 = 1000;

/// Assigns a position and hash if missing, then stages the event.
///
/// A pre-sealed event is accepted only if its hash recomputes and it links
/// to the current head of the chain.
async fn append(
    tx: &mut dyn LedgerTransaction,
    mut event: AuditEvent,
) -> Result<AuditEvent, LedgerError> {
    if event.sequence_num.is_none() {
        event.sequence_num = Some(tx.next().await?);
    }
    let head = tx.latest_hash().await?;
    if event.is_sealed() {
        if !hash::verify_event_hash(&event) {
            return Err(LedgerError::validation(format!(
                "event {} carries a hash that does not match its fields",
                event.id
            )));
        }
        if event.previous_hash != head {
            return Err(LedgerError::validation(format!(
                "event {} links to {:?} but the chain head is {head:?}",
                event.id, event.previous_hash
            )));
        }
    } else {
        event.seal(head)?;
    }
    tx.insert(&event).await?;
    Ok(event)
}

/// Rolls back `tx` and hands back the error that caused it.
async fn abandon(tx: Box<dyn LedgerTransaction>, error: LedgerError) -> LedgerError {
    if let Err(rollback_error) = tx.rollback().await {
        warn!(error = %rollback_error, "rollback failed");
    }
    warn!(error = %error, code = error.code(), "ledger write rolled back");
    error
}

/// Persists one event.
///
/// Allocates a sequence number if the event has none, links it to the latest
/// persisted hash if it is not sealed yet, and inserts it. A sealed event must
/// already hash correctly and link to the latest persisted hash. Returns the event
/// as persisted.
///
/// # Errors
///
/// Returns `LedgerError::Validation` before touching storage if the event is
/// malformed, `LedgerError::Conflict` if its sequence or id is taken, and
/// `LedgerError::Internal` on storage failure. Nothing is written on error.
#[instrument(skip(event, store), fields(event_id = %event.id, event_type = %event.event_type))]
pub async fn store_event(
    event: AuditEvent,
    store: &dyn LedgerStore,
) -> Result<AuditEvent, LedgerError> {
    event.validate()?;

    let mut tx = store.begin().await?;
    let stored = match append(tx.as_mut(), event).await {
        Ok(stored) => stored,
        Err(error) => return Err(abandon(tx, error).await),
    };
    tx.commit().await?;

    info!(
        sequence = stored.sequence_num,
        event_hash = stored.event_hash.as_deref(),
        "audit event stored"
    );
    Ok(stored)
}

/// Persists a batch atomically.
///
/// Sequence numbers and hash links continue across the whole batch in input
/// order. Either every event commits or none does. An empty batch is a no-op.
///
/// # Errors
///
/// Returns `LedgerError::Validation` carrying the index of the first
/// malformed event, before any storage access. Any storage error rolls back
/// the entire batch.
#[instrument(skip(events, store), fields(batch_size = events.len()))]
pub async fn store_events_batch(
    events: Vec<AuditEvent>,
    store: &dyn LedgerStore,
) -> Result<Vec<AuditEvent>, LedgerError> {
    for (index, event) in events.iter().enumerate() {
        event.validate().map_err(|error| error.at_index(index))?;
    }
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = store.begin().await?;
    let mut stored = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
        match append(tx.as_mut(), event).await {
            Ok(event) => stored.push(event),
            Err(error) => return Err(abandon(tx, error.at_index(index)).await),
        }
    }
    tx.commit().await?;

    info!(
        count = stored.len(),
        first_sequence = stored.first().and_then(|e| e.sequence_num),
        last_sequence = stored.last().and_then(|e| e.sequence_num),
        "audit batch stored"
    );
    Ok(stored)
}

/// Backoff before retry number `attempt` (0-indexed): exponential with
/// jitter, capped at one second.
fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = RETRY_BASE_DELAY_MS
        .saturating_mul(1_u64 << attempt.min(16))
        .min(RETRY_MAX_DELAY_MS);
    let millis = rand::rng().random_range(ceiling / 2..=ceiling);
    Duration::from_millis(millis)
}

async fn retry_on_conflict<T, F, Fut>(retries: u32, mut operation: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(error) if error.is_retryable() && attempt < retries => {
                let delay = backoff_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "retrying after sequence conflict"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Like [`store_event`], retrying up to `retries` times on
/// `LedgerError::Conflict` with a freshly allocated sequence.
///
/// Events that arrive with a preset sequence are never retried: a conflict
/// on a caller-chosen position will not go away.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-retryable error.
pub async fn store_event_with_retry(
    event: AuditEvent,
    store: &dyn LedgerStore,
    retries: u32,
) -> Result<AuditEvent, LedgerError> {
    let retries = if event.sequence_num.is_none() {
        retries
    } else {
        0
    };
    retry_on_conflict(retries, || store_event(event.clone(), store)).await
}

/// Sets or clears the retention marker on a persisted event. No other field
/// changes, so the event's hash and links stay valid.
///
/// # Errors
///
/// Returns `LedgerError::NotFound` if no event has this id.
#[instrument(skip(store))]
pub async fn archive_event(
    id: Uuid,
    archived: bool,
    store: &dyn LedgerStore,
) -> Result<(), LedgerError> {
    store.mark_archived(id, archived).await?;
    info!(%id, archived, "archive marker updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use callex_core::error::EventLookup;
    use callex_core::event::EventType;
    use callex_test_support::fixtures::{call_event, event, sealed_chain, sealed_event};
    use callex_test_support::{FailingLedgerStore, InMemoryLedgerStore};

    use super::*;

    #[tokio::test]
    async fn test_first_event_links_to_empty_hash() {
        // Arrange
        let store = InMemoryLedgerStore::new();

        // Act
        let stored = store_event(call_event(), &store).await.unwrap();

        // Assert
        assert_eq!(stored.sequence_num, Some(1));
        assert_eq!(stored.previous_hash, "");
        assert!(hash::verify_event_hash(&stored));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_second_event_links_to_first() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let first = store_event(call_event(), &store).await.unwrap();

        // Act
        let second = store_event(call_event(), &store).await.unwrap();

        // Assert
        assert_eq!(second.sequence_num, Some(2));
        assert_eq!(Some(second.previous_hash), first.event_hash);
    }

    #[tokio::test]
    async fn test_invalid_event_writes_nothing() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let mut invalid = call_event();
        invalid.actor_id = String::new();

        // Act
        let result = store_event(invalid, &store).await;

        // Assert
        assert!(matches!(result, Err(LedgerError::Validation { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_preset_sealed_event_is_stored_as_is() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let preset = sealed_event(1, "");

        // Act
        let stored = store_event(preset.clone(), &store).await.unwrap();

        // Assert
        assert_eq!(stored, preset);
    }

    #[tokio::test]
    async fn test_sealed_event_with_forged_hash_is_rejected() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let first = store_event(call_event(), &store).await.unwrap();
        let mut forged = sealed_event(2, first.event_hash.as_deref().unwrap());
        forged.event_hash = Some("cd".repeat(32));

        // Act
        let result = store_event(forged, &store).await;

        // Assert
        assert!(matches!(result, Err(LedgerError::Validation { .. })));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sealed_event_linked_to_wrong_head_is_rejected() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        store_event(call_event(), &store).await.unwrap();
        let mislinked = sealed_event(2, &"ab".repeat(32));

        // Act
        let result = store_event(mislinked, &store).await;

        // Assert
        match result {
            Err(LedgerError::Validation { message, .. }) => {
                assert!(message.contains("chain head"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_rejects_forged_and_mislinked_sealed_events() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let mut forged = sealed_event(2, "");
        forged.event_hash = Some("cd".repeat(32));
        let mislinked = sealed_event(2, &"ab".repeat(32));

        // Act
        let forged_result = store_events_batch(vec![call_event(), forged], &store).await;
        let mislinked_result = store_events_batch(vec![call_event(), mislinked], &store).await;

        // Assert
        for result in [forged_result, mislinked_result] {
            match result {
                Err(LedgerError::Validation { index, .. }) => assert_eq!(index, Some(1)),
                other => panic!("expected Validation, got {other:?}"),
            }
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_batch_accepts_sealed_event_linked_to_staged_head() {
        let store = InMemoryLedgerStore::new();
        let chain = sealed_chain(2);

        let stored = store_events_batch(chain.clone(), &store).await.unwrap();

        assert_eq!(stored, chain);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_preset_sequence_is_a_conflict() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        store_event(call_event(), &store).await.unwrap();
        let mut colliding = call_event();
        colliding.sequence_num = Some(1);

        // Act
        let result = store_event(colliding, &store).await;

        // Assert
        assert!(matches!(
            result,
            Err(LedgerError::Conflict {
                sequence: Some(1),
                ..
            })
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_propagates_backend_failure() {
        let result = store_event(call_event(), &FailingLedgerStore).await;

        match result {
            Err(LedgerError::Internal { message, .. }) => {
                assert_eq!(message, "connection refused");
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_links_continuously() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let first = store_event(call_event(), &store).await.unwrap();
        let batch = vec![
            event(EventType::BidPlaced, "buyer-2", "bid-1"),
            event(EventType::BidWon, "buyer-2", "bid-1"),
            event(EventType::CallRouted, "seller-1", "call-9"),
        ];

        // Act
        let stored = store_events_batch(batch, &store).await.unwrap();

        // Assert
        let sequences: Vec<_> = stored.iter().map(|e| e.sequence_num).collect();
        assert_eq!(sequences, vec![Some(2), Some(3), Some(4)]);
        assert_eq!(Some(stored[0].previous_hash.clone()), first.event_hash);
        for pair in stored.windows(2) {
            assert_eq!(Some(pair[1].previous_hash.clone()), pair[0].event_hash);
        }
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_batch_with_invalid_event_persists_nothing() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let mut invalid = call_event();
        invalid.action = "  ".into();
        let batch = vec![call_event(), call_event(), invalid, call_event()];

        // Act
        let result = store_events_batch(batch, &store).await;

        // Assert
        match result {
            Err(LedgerError::Validation { index, message }) => {
                assert_eq!(index, Some(2));
                assert!(message.starts_with("event[2]: "));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_batch_with_storage_conflict_rolls_back() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        store_event(call_event(), &store).await.unwrap();
        let mut colliding = call_event();
        colliding.sequence_num = Some(1);
        let batch = vec![call_event(), colliding];

        // Act
        let result = store_events_batch(batch, &store).await;

        // Assert
        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
        assert_eq!(store.len(), 1);
        let next = store_event(call_event(), &store).await.unwrap();
        assert_eq!(next.sequence_num, Some(2));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let stored = store_events_batch(Vec::new(), &FailingLedgerStore)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_retry_stops_after_configured_attempts() {
        // Arrange
        let attempts = AtomicU32::new(0);

        // Act
        let result: Result<(), LedgerError> = retry_on_conflict(2, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::Conflict {
                sequence: Some(1),
                message: "taken".into(),
            })
        })
        .await;

        // Assert
        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_conflict() {
        let attempts = AtomicU32::new(0);

        let result = retry_on_conflict(3, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LedgerError::Conflict {
                    sequence: None,
                    message: "taken".into(),
                })
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_validation_errors() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), LedgerError> = retry_on_conflict(3, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::validation("bad"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_with_retry_never_retries_preset_sequence() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        store_event(call_event(), &store).await.unwrap();
        let mut colliding = call_event();
        colliding.sequence_num = Some(1);

        // Act
        let result = store_event_with_retry(colliding, &store, 5).await;

        // Assert
        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        for attempt in 0..40 {
            let delay = backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(RETRY_MAX_DELAY_MS));
            assert!(delay >= Duration::from_millis(RETRY_BASE_DELAY_MS / 2));
        }
    }

    #[tokio::test]
    async fn test_archive_event_keeps_hash_valid() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let stored = store_event(call_event(), &store).await.unwrap();

        // Act
        archive_event(stored.id, true, &store).await.unwrap();

        // Assert
        let archived = store.get_by_id(stored.id).await.unwrap().unwrap();
        assert!(archived.archived);
        assert_eq!(archived.event_hash, stored.event_hash);
        assert!(hash::verify_event_hash(&archived));
    }

    #[tokio::test]
    async fn test_archive_unknown_event_is_not_found() {
        let id = Uuid::new_v4();

        let result = archive_event(id, true, &InMemoryLedgerStore::new()).await;

        assert!(matches!(
            result,
            Err(LedgerError::NotFound(EventLookup::Id(missing))) if missing == id
        ));
    }
}
