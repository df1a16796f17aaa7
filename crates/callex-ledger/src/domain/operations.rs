//! Operational views for monitoring.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of the ledger as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentHealth {
    /// Reachable with a continuous tail.
    Healthy,
    /// Reachable, but something needs attention.
    Degraded {
        /// What needs attention.
        reason: String,
    },
    /// Not usable.
    Unhealthy {
        /// Why.
        reason: String,
    },
}

impl ComponentHealth {
    /// True for [`ComponentHealth::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// True for [`ComponentHealth::Unhealthy`].
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy { .. })
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Verdict.
    #[serde(flatten)]
    pub health: ComponentHealth,
    /// Highest persisted position, if the backend answered.
    pub latest_sequence: Option<u64>,
    /// Positions inspected for gaps, `[start, end]`.
    pub sample_range: Option<(u64, u64)>,
    /// Gaps found in the sample.
    pub gaps_in_sample: usize,
    /// Positions missing from the sample.
    pub missing_in_sample: u64,
    /// Round-trip time of the probe queries.
    pub query_latency_ms: u64,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

/// Ledger volume summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Every persisted event.
    pub total_events: u64,
    /// Events stamped in the last hour.
    pub last_hour: u64,
    /// Events stamped in the last 24 hours.
    pub last_24_hours: u64,
    /// Events stamped in the last 7 days.
    pub last_7_days: u64,
    /// Events per severity.
    pub by_severity: BTreeMap<String, u64>,
    /// Events per well-known compliance flag set to true.
    pub by_compliance_flag: BTreeMap<String, u64>,
    /// Events carrying the retention marker.
    pub archived: u64,
    /// Highest persisted position.
    pub latest_sequence: u64,
    /// When the stats were gathered.
    pub generated_at: DateTime<Utc>,
}
