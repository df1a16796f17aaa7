//! Operational surface consumed by monitoring.

use std::collections::BTreeMap;
use std::time::Instant;

use callex_core::clock::Clock;
use callex_core::error::LedgerError;
use callex_core::event::{Severity, compliance};
use callex_core::filter::EventFilter;
use callex_core::repository::{LedgerStore, StorageInfo};
use chrono::Duration;
use tracing::{info, instrument, warn};

use crate::application::integrity::find_gaps;
use crate::config::LedgerConfig;
use crate::domain::operations::{ComponentHealth, HealthReport, LedgerStats};

/// Probes connectivity, measures query latency and looks for gaps in the
/// most recent `config.health_sample_size` positions.
///
/// Never fails: an unreachable backend is reported as unhealthy.
#[instrument(skip_all)]
pub async fn health_check(
    store: &dyn LedgerStore,
    config: &LedgerConfig,
    clock: &dyn Clock,
) -> HealthReport {
    let checked_at = clock.now();
    let started = Instant::now();
    let mut report = HealthReport {
        health: ComponentHealth::Healthy,
        latest_sequence: None,
        sample_range: None,
        gaps_in_sample: 0,
        missing_in_sample: 0,
        query_latency_ms: 0,
        checked_at,
    };

    let probe = async {
        store.ping().await?;
        store.latest_sequence().await
    };
    let latest = match probe.await {
        Ok(latest) => latest,
        Err(error) => {
            warn!(error = %error, "ledger backend unreachable");
            report.health = ComponentHealth::Unhealthy {
                reason: error.to_string(),
            };
            return report;
        }
    };
    report.latest_sequence = Some(latest);
    report.query_latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if latest > 0 {
        let sample_start = latest
            .saturating_sub(config.health_sample_size.max(1))
            .saturating_add(1);
        report.sample_range = Some((sample_start, latest));
        match find_gaps(sample_start, latest, store, config).await {
            Ok(gaps) => {
                report.gaps_in_sample = gaps.len();
                report.missing_in_sample = gaps.iter().map(|gap| gap.size).sum();
            }
            Err(error) => {
                report.health = ComponentHealth::Degraded {
                    reason: format!("gap sample failed: {error}"),
                };
                return report;
            }
        }
    }

    if report.gaps_in_sample > 0 {
        report.health = ComponentHealth::Degraded {
            reason: format!(
                "{} position(s) missing near the head of the ledger",
                report.missing_in_sample
            ),
        };
    }
    info!(
        latest_sequence = latest,
        gaps = report.gaps_in_sample,
        latency_ms = report.query_latency_ms,
        "ledger health checked"
    );
    report
}

/// Counts events by time window, severity and compliance flag.
///
/// # Errors
///
/// Returns a storage error.
#[instrument(skip_all)]
pub async fn ledger_stats(
    store: &dyn LedgerStore,
    clock: &dyn Clock,
) -> Result<LedgerStats, LedgerError> {
    let now = clock.now();
    let since = |window: Duration| {
        let mut filter = EventFilter::new();
        filter.start_time = Some(now - window);
        filter
    };

    let total_events = store.count(&EventFilter::new()).await?;
    let last_hour = store.count(&since(Duration::hours(1))).await?;
    let last_24_hours = store.count(&since(Duration::hours(24))).await?;
    let last_7_days = store.count(&since(Duration::days(7))).await?;

    let mut by_severity = BTreeMap::new();
    for severity in Severity::ALL {
        let count = store.count(&EventFilter::new().severity(severity)).await?;
        by_severity.insert(severity.as_str().to_owned(), count);
    }

    let mut by_compliance_flag = BTreeMap::new();
    for flag in compliance::ALL {
        let count = store
            .count(&EventFilter::new().compliance_flag(flag, true))
            .await?;
        by_compliance_flag.insert(flag.to_owned(), count);
    }

    let archived = store.count(&EventFilter::new().archived(true)).await?;
    let latest_sequence = store.latest_sequence().await?;

    Ok(LedgerStats {
        total_events,
        last_hour,
        last_24_hours,
        last_7_days,
        by_severity,
        by_compliance_flag,
        archived,
        latest_sequence,
        generated_at: now,
    })
}

/// Reports the ledger's storage footprint as the backend sees it.
///
/// # Errors
///
/// Returns a storage error.
#[instrument(skip_all)]
pub async fn storage_info(store: &dyn LedgerStore) -> Result<StorageInfo, LedgerError> {
    let info = store.storage_info().await?;
    info!(
        backend = %info.backend,
        total_events = info.total_events,
        partitions = info.partitions.len(),
        "storage info gathered"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use callex_core::event::EventType;
    use callex_test_support::fixtures::{call_event, event};
    use callex_test_support::{FailingLedgerStore, FixedClock, InMemoryLedgerStore, fixture_time};

    use super::*;
    use crate::application::command_handlers::{archive_event, store_event};

    #[tokio::test]
    async fn test_health_of_continuous_ledger() {
        let store = InMemoryLedgerStore::new();
        for _ in 0..5 {
            store_event(call_event(), &store).await.unwrap();
        }
        let config = LedgerConfig::default().with_health_sample_size(3);

        let report = health_check(&store, &config, &FixedClock::default()).await;

        assert!(report.health.is_healthy());
        assert_eq!(report.latest_sequence, Some(5));
        assert_eq!(report.sample_range, Some((3, 5)));
        assert_eq!(report.checked_at, fixture_time());
    }

    #[tokio::test]
    async fn test_health_degrades_on_gap_in_sample() {
        let store = InMemoryLedgerStore::new();
        for _ in 0..5 {
            store_event(call_event(), &store).await.unwrap();
        }
        store.purge(4);

        let report = health_check(&store, &LedgerConfig::default(), &FixedClock::default()).await;

        assert!(matches!(report.health, ComponentHealth::Degraded { .. }));
        assert_eq!(report.gaps_in_sample, 1);
        assert_eq!(report.missing_in_sample, 1);
    }

    #[tokio::test]
    async fn test_health_sees_gap_at_start_of_sample() {
        let store = InMemoryLedgerStore::new();
        for _ in 0..10 {
            store_event(call_event(), &store).await.unwrap();
        }
        for sequence in 5..=7 {
            store.purge(sequence);
        }
        let config = LedgerConfig::default().with_health_sample_size(6);

        let report = health_check(&store, &config, &FixedClock::default()).await;

        assert_eq!(report.sample_range, Some((5, 10)));
        assert!(matches!(report.health, ComponentHealth::Degraded { .. }));
        assert_eq!(report.gaps_in_sample, 1);
        assert_eq!(report.missing_in_sample, 3);
    }

    #[tokio::test]
    async fn test_health_of_empty_ledger() {
        let report = health_check(
            &InMemoryLedgerStore::new(),
            &LedgerConfig::default(),
            &FixedClock::default(),
        )
        .await;

        assert!(report.health.is_healthy());
        assert_eq!(report.latest_sequence, Some(0));
        assert_eq!(report.sample_range, None);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        let report = health_check(
            &FailingLedgerStore,
            &LedgerConfig::default(),
            &FixedClock::default(),
        )
        .await;

        assert!(report.health.is_unhealthy());
        assert_eq!(report.latest_sequence, None);
    }

    #[tokio::test]
    async fn test_stats_count_windows_severities_and_flags() {
        // Arrange
        let store = InMemoryLedgerStore::new();
        let mut old = call_event();
        old.timestamp = fixture_time() - Duration::days(3);
        store_event(old, &store).await.unwrap();
        let recent = store_event(call_event(), &store).await.unwrap();
        store_event(event(EventType::FraudDetected, "fraud-engine", "call-1"), &store)
            .await
            .unwrap();
        archive_event(recent.id, true, &store).await.unwrap();

        // Act
        let stats = ledger_stats(&store, &FixedClock::default()).await.unwrap();

        // Assert
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.last_hour, 2);
        assert_eq!(stats.last_24_hours, 2);
        assert_eq!(stats.last_7_days, 3);
        assert_eq!(stats.by_severity["info"], 2);
        assert_eq!(stats.by_severity["critical"], 1);
        assert_eq!(stats.by_severity["warning"], 0);
        assert_eq!(stats.by_compliance_flag[compliance::TCPA_RELEVANT], 3);
        assert_eq!(stats.by_compliance_flag[compliance::GDPR_RELEVANT], 0);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.latest_sequence, 3);
    }

    #[tokio::test]
    async fn test_storage_info_passes_through_backend_report() {
        let store = InMemoryLedgerStore::new();
        store_event(call_event(), &store).await.unwrap();

        let info = storage_info(&store).await.unwrap();

        assert_eq!(info.backend, "memory");
        assert_eq!(info.total_events, 1);
        assert!(info.total_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_stats_propagate_backend_failure() {
        let result = ledger_stats(&FailingLedgerStore, &FixedClock::default()).await;
        assert!(matches!(result, Err(LedgerError::Internal { .. })));
    }
}
