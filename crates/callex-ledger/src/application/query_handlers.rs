//! Query handlers for the ledger read path.
//!
//! Every projection is a filter builder over [`find_events`]. Reads never
//! take the writer lock.

use callex_core::error::{EventLookup, LedgerError};
use callex_core::event::AuditEvent;
use callex_core::filter::{EventFilter, EventPage, SortDirection, SortField};
use callex_core::repository::LedgerStore;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::LedgerConfig;

/// Returns one page of events matching `filter`, plus the total match count.
///
/// # Errors
///
/// Returns `LedgerError::Validation` if the page size is outside
/// `1..=config.max_page_size` or the time range is inverted.
#[instrument(skip(filter, store, config), fields(limit = filter.limit, offset = filter.offset))]
pub async fn find_events(
    filter: &EventFilter,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<EventPage, LedgerError> {
    filter.validate(config.max_page_size)?;
    let events = store.find(filter).await?;
    let total_count = store.count(filter).await?;
    debug!(returned = events.len(), total_count, "events found");
    Ok(EventPage::new(events, total_count, filter.limit, filter.offset))
}

/// Counts events matching `filter`. Pagination is ignored.
///
/// # Errors
///
/// Returns `LedgerError::Validation` for an inverted time range.
pub async fn count_events(
    filter: &EventFilter,
    store: &dyn LedgerStore,
) -> Result<u64, LedgerError> {
    if let (Some(start), Some(end)) = (filter.start_time, filter.end_time) {
        if start > end {
            return Err(LedgerError::validation(
                "start_time must not be after end_time",
            ));
        }
    }
    store.count(filter).await
}

/// Loads one event by id.
///
/// # Errors
///
/// Returns `LedgerError::NotFound` if no event has this id.
pub async fn get_event_by_id(id: Uuid, store: &dyn LedgerStore) -> Result<AuditEvent, LedgerError> {
    store
        .get_by_id(id)
        .await?
        .ok_or(LedgerError::NotFound(EventLookup::Id(id)))
}

/// Loads one event by ledger position.
///
/// # Errors
///
/// Returns `LedgerError::NotFound` if no event sits at `sequence`.
pub async fn get_event_by_sequence(
    sequence: u64,
    store: &dyn LedgerStore,
) -> Result<AuditEvent, LedgerError> {
    store
        .get_by_sequence(sequence)
        .await?
        .ok_or(LedgerError::NotFound(EventLookup::Sequence(sequence)))
}

fn newest_first(filter: EventFilter, limit: usize, offset: usize) -> EventFilter {
    filter
        .order_by(SortField::Timestamp, SortDirection::Desc)
        .page(limit, offset)
}

/// Everything `actor_id` did, newest first.
///
/// # Errors
///
/// See [`find_events`].
pub async fn find_by_actor(
    actor_id: &str,
    limit: usize,
    offset: usize,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<EventPage, LedgerError> {
    let filter = newest_first(EventFilter::new().actor(actor_id), limit, offset);
    find_events(&filter, store, config).await
}

/// Everything done to `target_id`, newest first.
///
/// # Errors
///
/// See [`find_events`].
pub async fn find_by_target(
    target_id: &str,
    limit: usize,
    offset: usize,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<EventPage, LedgerError> {
    let filter = newest_first(EventFilter::new().target(target_id), limit, offset);
    find_events(&filter, store, config).await
}

/// Events stamped inside `[start, end]`, in ledger order.
///
/// # Errors
///
/// See [`find_events`].
pub async fn find_by_time_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
    offset: usize,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<EventPage, LedgerError> {
    let filter = EventFilter::new().between(start, end).page(limit, offset);
    find_events(&filter, store, config).await
}

/// Events carrying compliance `flag` set to true, newest first.
///
/// # Errors
///
/// See [`find_events`].
pub async fn find_by_compliance_flag(
    flag: &str,
    limit: usize,
    offset: usize,
    store: &dyn LedgerStore,
    config: &LedgerConfig,
) -> Result<EventPage, LedgerError> {
    let filter = newest_first(EventFilter::new().compliance_flag(flag, true), limit, offset);
    find_events(&filter, store, config).await
}

#[cfg(test)]
mod tests {
    use callex_core::event::{EventType, Severity, compliance};
    use callex_test_support::fixtures::event;
    use callex_test_support::{FailingLedgerStore, InMemoryLedgerStore, fixture_time};
    use chrono::Duration;

    use super::*;
    use crate::application::command_handlers::store_event;

    async fn seeded_store() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        let events = [
            event(EventType::CallInitiated, "buyer-1", "call-1"),
            event(EventType::BidPlaced, "buyer-2", "bid-1"),
            event(EventType::FraudDetected, "fraud-engine", "call-1")
                .with_compliance_flag(compliance::GDPR_RELEVANT, true),
            event(EventType::CallCompleted, "buyer-1", "call-1")
                .with_metadata("disposition", "Answered"),
            event(EventType::ConsentRevoked, "buyer-3", "consent-1")
                .with_compliance_flag(compliance::GDPR_RELEVANT, false),
        ];
        for mut e in events {
            // Spread timestamps one minute apart.
            let minutes = i64::try_from(store.len()).unwrap();
            e.timestamp = fixture_time() + Duration::minutes(minutes);
            store_event(e, &store).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_find_returns_page_with_total_count() {
        // Arrange
        let store = seeded_store().await;
        let filter = EventFilter::new().page(2, 0);

        // Act
        let page = find_events(&filter, &store, &LedgerConfig::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.total_count, 5);
        assert!(page.has_more);
        assert_eq!(page.events[0].sequence_num, Some(1));
    }

    #[tokio::test]
    async fn test_last_page_has_no_more() {
        let store = seeded_store().await;
        let filter = EventFilter::new().page(2, 4);

        let page = find_events(&filter, &store, &LedgerConfig::default())
            .await
            .unwrap();

        assert_eq!(page.events.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_find_rejects_oversized_page() {
        let store = seeded_store().await;
        let config = LedgerConfig::default().with_page_sizes(10, 10);
        let filter = EventFilter::new().page(11, 0);

        let result = find_events(&filter, &store, &config).await;

        assert!(matches!(result, Err(LedgerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_filters_combine() {
        // Arrange
        let store = seeded_store().await;
        let filter = EventFilter::new()
            .actor("buyer-1")
            .severity(Severity::Info)
            .search("answered");

        // Act
        let page = find_events(&filter, &store, &LedgerConfig::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(page.total_count, 1);
        assert_eq!(page.events[0].event_type, EventType::CallCompleted);
    }

    #[tokio::test]
    async fn test_count_ignores_pagination() {
        let store = seeded_store().await;
        let filter = EventFilter::new().target("call-1").page(1, 0);

        assert_eq!(count_events(&filter, &store).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_count_rejects_inverted_range() {
        let store = seeded_store().await;
        let filter = EventFilter::new().between(fixture_time(), fixture_time() - Duration::hours(1));

        let result = count_events(&filter, &store).await;

        assert!(matches!(result, Err(LedgerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_by_actor_is_newest_first() {
        let store = seeded_store().await;

        let page = find_by_actor("buyer-1", 10, 0, &store, &LedgerConfig::default())
            .await
            .unwrap();

        let sequences: Vec<_> = page.events.iter().map(|e| e.sequence_num).collect();
        assert_eq!(sequences, vec![Some(4), Some(1)]);
    }

    #[tokio::test]
    async fn test_by_target_matches_exactly() {
        let store = seeded_store().await;

        let page = find_by_target("bid-1", 10, 0, &store, &LedgerConfig::default())
            .await
            .unwrap();

        assert_eq!(page.total_count, 1);
        assert_eq!(page.events[0].event_type, EventType::BidPlaced);
    }

    #[tokio::test]
    async fn test_by_time_range_is_inclusive() {
        let store = seeded_store().await;
        let start = fixture_time() + Duration::minutes(1);
        let end = fixture_time() + Duration::minutes(3);

        let page = find_by_time_range(start, end, 10, 0, &store, &LedgerConfig::default())
            .await
            .unwrap();

        let sequences: Vec<_> = page.events.iter().map(|e| e.sequence_num).collect();
        assert_eq!(sequences, vec![Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_by_compliance_flag_requires_true_value() {
        let store = seeded_store().await;

        let page = find_by_compliance_flag(
            compliance::GDPR_RELEVANT,
            10,
            0,
            &store,
            &LedgerConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(page.total_count, 1);
        assert_eq!(page.events[0].event_type, EventType::FraudDetected);
    }

    #[tokio::test]
    async fn test_get_by_id_and_sequence() {
        let store = seeded_store().await;
        let third = get_event_by_sequence(3, &store).await.unwrap();

        let by_id = get_event_by_id(third.id, &store).await.unwrap();

        assert_eq!(by_id, third);
    }

    #[tokio::test]
    async fn test_missing_lookups_are_not_found() {
        let store = seeded_store().await;

        let by_sequence = get_event_by_sequence(99, &store).await;
        let by_id = get_event_by_id(Uuid::new_v4(), &store).await;

        assert!(matches!(
            by_sequence,
            Err(LedgerError::NotFound(EventLookup::Sequence(99)))
        ));
        assert!(matches!(
            by_id,
            Err(LedgerError::NotFound(EventLookup::Id(_)))
        ));
    }

    #[tokio::test]
    async fn test_find_propagates_backend_failure() {
        let result = find_events(
            &EventFilter::new(),
            &FailingLedgerStore,
            &LedgerConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(LedgerError::Internal { .. })));
    }
}
