//! Integrity verification outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of re-hashing one stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityResult {
    /// The verified event.
    pub event_id: Uuid,
    /// Its ledger position.
    pub sequence_num: Option<u64>,
    /// True when the event passed every check.
    pub is_valid: bool,
    /// True when the recomputed hash equals the stored one.
    pub hash_valid: bool,
    /// Hash recomputed from the stored fields and stored `previous_hash`.
    pub computed_hash: String,
    /// Hash as persisted. Empty if none was stored.
    pub stored_hash: String,
    /// Human-readable findings. Empty when valid.
    pub errors: Vec<String>,
}

/// Classification of a chain finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    /// Stored hash differs from the recomputed one.
    HashMismatch,
    /// `previous_hash` does not match the preceding event's hash.
    ChainBreak,
    /// The event could not be checked at all.
    VerificationError,
}

impl ChainErrorKind {
    /// True for findings that indicate tampering rather than a gap in data.
    #[must_use]
    pub fn is_break(self) -> bool {
        matches!(self, Self::HashMismatch | Self::ChainBreak)
    }
}

/// One finding from a chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    /// Position of the offending event.
    pub sequence: u64,
    /// Id of the offending event.
    pub event_id: Uuid,
    /// What kind of finding this is.
    pub kind: ChainErrorKind,
    /// Details.
    pub message: String,
}

/// The last event a verification pass accepted as a link target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Its position.
    pub sequence: u64,
    /// Its stored hash.
    pub event_hash: String,
}

/// Where an interrupted chain verification picks up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    /// First position not yet verified.
    pub next_sequence: u64,
    /// Last event verified before the interruption.
    pub last_link: Option<ChainLink>,
}

/// Outcome of verifying a sequence range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIntegrityResult {
    /// First position of the requested range.
    pub start_sequence: u64,
    /// Last position of the requested range.
    pub end_sequence: u64,
    /// Events loaded and checked so far.
    pub events_checked: u64,
    /// True when nothing checked so far produced a finding.
    pub is_valid: bool,
    /// Findings in ledger order.
    pub errors: Vec<ChainError>,
    /// Position of the first hash mismatch or chain break.
    pub broken_at: Option<u64>,
    /// Wall time spent verifying, summed over resumed passes.
    pub check_time_ms: u64,
    /// Set when verification stopped early; pass the result to
    /// `resume_chain` to continue.
    pub resume_from: Option<ChainCursor>,
}

impl ChainIntegrityResult {
    /// An empty result for `[start, end]`.
    #[must_use]
    pub fn new(start_sequence: u64, end_sequence: u64) -> Self {
        Self {
            start_sequence,
            end_sequence,
            events_checked: 0,
            is_valid: true,
            errors: Vec::new(),
            broken_at: None,
            check_time_ms: 0,
            resume_from: None,
        }
    }

    /// True when the whole range has been verified.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.resume_from.is_none()
    }

    /// Number of findings of `kind`.
    #[must_use]
    pub fn count_of(&self, kind: ChainErrorKind) -> usize {
        self.errors.iter().filter(|error| error.kind == kind).count()
    }

    pub(crate) fn record(&mut self, error: ChainError) {
        if self.broken_at.is_none() && error.kind.is_break() {
            self.broken_at = Some(error.sequence);
        }
        self.is_valid = false;
        self.errors.push(error);
    }
}

/// How alarming a gap is, by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    /// Up to 10 missing positions.
    Low,
    /// Up to 100 missing positions.
    Medium,
    /// More than 100 missing positions.
    High,
}

impl GapSeverity {
    /// Classifies a gap of `size` missing positions.
    #[must_use]
    pub fn for_size(size: u64) -> Self {
        match size {
            0..=10 => Self::Low,
            11..=100 => Self::Medium,
            _ => Self::High,
        }
    }

    /// What an operator should do about a gap of this severity.
    #[must_use]
    pub fn remediation(self) -> &'static str {
        match self {
            Self::Low => {
                "likely a rolled-back write; confirm against application logs for the gap window"
            }
            Self::Medium => {
                "investigate writer failures around the gap window and check backups for the missing positions"
            }
            Self::High => {
                "possible bulk removal; freeze the affected range and start an incident review"
            }
        }
    }
}

/// A run of missing positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    /// First missing position.
    pub start: u64,
    /// Last missing position.
    pub end: u64,
    /// Number of missing positions.
    pub size: u64,
    /// Classification by size.
    pub severity: GapSeverity,
    /// Suggested next step.
    pub remediation: String,
}

impl SequenceGap {
    /// Describes the missing run `[start, end]`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        let size = end - start + 1;
        let severity = GapSeverity::for_size(size);
        Self {
            start,
            end,
            size,
            severity,
            remediation: severity.remediation().to_owned(),
        }
    }
}

/// What an integrity report should cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityCriteria {
    /// Re-hash events and check links.
    pub check_hash_chain: bool,
    /// Look for missing positions.
    pub check_sequence_gaps: bool,
    /// First position to cover. Defaults to the start of the ledger.
    pub start_sequence: Option<u64>,
    /// Last position to cover. Defaults to the latest position.
    pub end_sequence: Option<u64>,
    /// Narrow the range to events stamped at or after this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Narrow the range to events stamped at or before this time.
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for IntegrityCriteria {
    fn default() -> Self {
        Self {
            check_hash_chain: true,
            check_sequence_gaps: true,
            start_sequence: None,
            end_sequence: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Overall verdict of an integrity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityStatus {
    /// No findings.
    Healthy,
    /// Findings that need attention but do not prove tampering.
    Degraded,
    /// Tampering or a large loss of data.
    Critical,
}

/// Aggregated verification of a ledger range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Overall verdict.
    pub status: IntegrityStatus,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
    /// The criteria the report was run with.
    pub criteria: IntegrityCriteria,
    /// First position covered. `None` when the range is empty.
    pub start_sequence: Option<u64>,
    /// Last position covered. `None` when the range is empty.
    pub end_sequence: Option<u64>,
    /// Chain verification outcome, when requested.
    pub chain: Option<ChainIntegrityResult>,
    /// Gaps found, when requested.
    pub gaps: Option<Vec<SequenceGap>>,
    /// What to do next. Empty when healthy.
    pub recommendations: Vec<String>,
}
