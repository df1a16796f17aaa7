//! Query predicates and pagination.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::event::{AuditEvent, ComplianceFlags, EventType, MetadataValue, Severity};

/// Page size used when a filter does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a single query may return.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Column to order results by. Ties are always broken by sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Ledger position.
    #[default]
    Sequence,
    /// Event creation time.
    Timestamp,
    /// Event type name.
    EventType,
    /// Severity, lowest first.
    Severity,
    /// Actor identifier.
    ActorId,
    /// Target identifier.
    TargetId,
}

impl SortField {
    /// Backend column name.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Sequence => "sequence_num",
            Self::Timestamp => "occurred_at",
            Self::EventType => "event_type",
            Self::Severity => "severity_rank",
            Self::ActorId => "actor_id",
            Self::TargetId => "target_id",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

impl SortDirection {
    /// SQL keyword.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Predicate and pagination for event queries.
///
/// Empty sets and `None` bounds match everything. Time bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match any of these event types.
    pub event_types: Vec<EventType>,
    /// Match any of these severities.
    pub severities: Vec<Severity>,
    /// Match any of these actors.
    pub actor_ids: Vec<String>,
    /// Match any of these targets.
    pub target_ids: Vec<String>,
    /// Earliest timestamp, inclusive.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest timestamp, inclusive.
    pub end_time: Option<DateTime<Utc>>,
    /// Every flag here must be present on the event with the same value.
    pub compliance_flags: ComplianceFlags,
    /// Case-insensitive substring over actor, target, action and metadata.
    pub search: Option<String>,
    /// Restrict to archived (`Some(true)`) or live (`Some(false)`) events.
    pub archived: Option<bool>,
    /// Ordering column.
    pub sort_by: SortField,
    /// Ordering direction.
    pub sort_direction: SortDirection,
    /// Page size.
    pub limit: usize,
    /// Number of matching events to skip.
    pub offset: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            severities: Vec::new(),
            actor_ids: Vec::new(),
            target_ids: Vec::new(),
            start_time: None,
            end_time: None,
            compliance_flags: ComplianceFlags::new(),
            search: None,
            archived: None,
            sort_by: SortField::default(),
            sort_direction: SortDirection::default(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl EventFilter {
    /// A filter that matches everything, first page, sequence order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event type to match.
    #[must_use]
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    /// Adds a severity to match.
    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    /// Adds an actor to match.
    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_ids.push(actor_id.into());
        self
    }

    /// Adds a target to match.
    #[must_use]
    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_ids.push(target_id.into());
        self
    }

    /// Restricts to `[start, end]`.
    #[must_use]
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Requires `flag` to be recorded with `value`.
    #[must_use]
    pub fn compliance_flag(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.compliance_flags.set(flag, value);
        self
    }

    /// Sets the free-text search term.
    #[must_use]
    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    /// Restricts by archived state.
    #[must_use]
    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order_by(mut self, field: SortField, direction: SortDirection) -> Self {
        self.sort_by = field;
        self.sort_direction = direction;
        self
    }

    /// Sets limit and offset.
    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Checks pagination bounds and the time range.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if `limit` is outside
    /// `1..=max_page_size` or `start_time` is after `end_time`.
    pub fn validate(&self, max_page_size: usize) -> Result<(), LedgerError> {
        if self.limit == 0 || self.limit > max_page_size {
            return Err(LedgerError::validation(format!(
                "limit must be between 1 and {max_page_size}"
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(LedgerError::validation("start_time must not be after end_time"));
            }
        }
        Ok(())
    }

    /// The search term prepared for matching, if any.
    #[must_use]
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }

    /// True when `event` satisfies every predicate. Ignores pagination.
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&event.severity) {
            return false;
        }
        if !self.actor_ids.is_empty() && !self.actor_ids.contains(&event.actor_id) {
            return false;
        }
        if !self.target_ids.is_empty() && !self.target_ids.contains(&event.target_id) {
            return false;
        }
        if self.start_time.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        if !event.compliance_flags.contains(&self.compliance_flags) {
            return false;
        }
        if self.archived.is_some_and(|archived| event.archived != archived) {
            return false;
        }
        if let Some(term) = self.search_term() {
            let in_fields = [
                event.actor_id.as_str(),
                event.target_id.as_str(),
                event.action.as_str(),
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&term));
            if !in_fields
                && !event
                    .metadata
                    .values()
                    .any(|value| text_value_contains(value, &term))
            {
                return false;
            }
        }
        true
    }

    /// Orders two events the way a query with this filter returns them.
    #[must_use]
    pub fn compare(&self, a: &AuditEvent, b: &AuditEvent) -> Ordering {
        let primary = match self.sort_by {
            SortField::Sequence => Ordering::Equal,
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortField::EventType => a.event_type.as_str().cmp(b.event_type.as_str()),
            SortField::Severity => a.severity.cmp(&b.severity),
            SortField::ActorId => a.actor_id.cmp(&b.actor_id),
            SortField::TargetId => a.target_id.cmp(&b.target_id),
        };
        let ordering = primary.then_with(|| a.sequence_num.cmp(&b.sequence_num));
        match self.sort_direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

/// Searches string metadata values, including those nested in lists.
/// Keys and non-string values are not searched.
fn text_value_contains(value: &MetadataValue, term: &str) -> bool {
    match value {
        MetadataValue::Text(text) => text.to_lowercase().contains(term),
        MetadataValue::List(values) => values.iter().any(|v| text_value_contains(v, term)),
        _ => false,
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    /// Events on this page, in query order.
    pub events: Vec<AuditEvent>,
    /// Number of events matching the predicate, ignoring pagination.
    pub total_count: u64,
    /// Page size that was requested.
    pub limit: usize,
    /// Offset that was requested.
    pub offset: usize,
    /// Whether more matching events follow this page.
    pub has_more: bool,
}

impl EventPage {
    /// Assembles a page and derives `has_more`.
    #[must_use]
    pub fn new(events: Vec<AuditEvent>, total_count: u64, limit: usize, offset: usize) -> Self {
        let seen = u64::try_from(offset.saturating_add(events.len())).unwrap_or(u64::MAX);
        Self {
            has_more: seen < total_count,
            events,
            total_count,
            limit,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::Clock;
    use crate::event::compliance;

    struct StaticClock(DateTime<Utc>);

    impl Clock for StaticClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn event_at(sequence: u64, minutes: i64) -> AuditEvent {
        let clock = StaticClock(base_time() + Duration::minutes(minutes));
        let mut event =
            AuditEvent::new(EventType::BidPlaced, "buyer-1", "bid-1", "place_bid", &clock)
                .unwrap()
                .with_metadata("campaign", "Solar-Leads");
        event.sequence_num = Some(sequence);
        event
    }

    #[test]
    fn test_default_filter_matches_everything() {
        assert!(EventFilter::new().matches(&event_at(1, 0)));
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let event = event_at(1, 5);
        let exact = EventFilter::new().between(event.timestamp, event.timestamp);
        assert!(exact.matches(&event));

        let after = EventFilter::new().between(
            event.timestamp + Duration::microseconds(1),
            event.timestamp + Duration::minutes(1),
        );
        assert!(!after.matches(&event));
    }

    #[test]
    fn test_set_predicates_match_any_member() {
        let event = event_at(1, 0);
        assert!(EventFilter::new().actor("buyer-9").actor("buyer-1").matches(&event));
        assert!(!EventFilter::new().target("bid-2").matches(&event));
        assert!(!EventFilter::new().event_type(EventType::BidWon).matches(&event));
        assert!(!EventFilter::new().severity(Severity::Critical).matches(&event));
    }

    #[test]
    fn test_compliance_containment() {
        let event = event_at(1, 0).with_compliance_flag(compliance::TCPA_RELEVANT, true);
        assert!(
            EventFilter::new()
                .compliance_flag(compliance::TCPA_RELEVANT, true)
                .matches(&event)
        );
        assert!(
            !EventFilter::new()
                .compliance_flag(compliance::GDPR_RELEVANT, true)
                .matches(&event)
        );
    }

    #[test]
    fn test_search_is_case_insensitive_and_covers_metadata() {
        let event = event_at(1, 0);
        assert!(EventFilter::new().search("solar").matches(&event));
        assert!(EventFilter::new().search("PLACE_").matches(&event));
        assert!(!EventFilter::new().search("mortgage").matches(&event));
        assert!(EventFilter::new().search("   ").matches(&event));
    }

    #[test]
    fn test_search_ignores_metadata_keys_and_json_syntax() {
        let event = event_at(1, 0)
            .with_metadata("tags", MetadataValue::List(vec!["Inbound-Tier".into()]))
            .with_metadata("payout", 12.75);

        assert!(EventFilter::new().search("tier").matches(&event));
        assert!(!EventFilter::new().search("campaign").matches(&event));
        assert!(!EventFilter::new().search("\":\"").matches(&event));
        assert!(!EventFilter::new().search("12.75").matches(&event));
    }

    #[test]
    fn test_archived_filter() {
        let mut event = event_at(1, 0);
        assert!(EventFilter::new().archived(false).matches(&event));
        event.archived = true;
        assert!(!EventFilter::new().archived(false).matches(&event));
        assert!(EventFilter::new().archived(true).matches(&event));
    }

    #[test]
    fn test_compare_breaks_ties_by_sequence() {
        let first = event_at(1, 0);
        let second = event_at(2, 0);
        let filter = EventFilter::new().order_by(SortField::Timestamp, SortDirection::Desc);
        assert_eq!(filter.compare(&first, &second), Ordering::Greater);

        let asc = EventFilter::new().order_by(SortField::Timestamp, SortDirection::Asc);
        assert_eq!(asc.compare(&first, &second), Ordering::Less);
    }

    #[test]
    fn test_validate_rejects_bad_pages_and_ranges() {
        assert!(EventFilter::new().page(0, 0).validate(MAX_PAGE_SIZE).is_err());
        assert!(
            EventFilter::new()
                .page(MAX_PAGE_SIZE + 1, 0)
                .validate(MAX_PAGE_SIZE)
                .is_err()
        );
        let inverted = EventFilter::new().between(base_time(), base_time() - Duration::hours(1));
        assert!(inverted.validate(MAX_PAGE_SIZE).is_err());
        assert!(EventFilter::new().validate(MAX_PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_page_has_more() {
        let page = EventPage::new(vec![event_at(1, 0), event_at(2, 0)], 5, 2, 2);
        assert!(page.has_more);

        let last = EventPage::new(vec![event_at(5, 0)], 5, 2, 4);
        assert!(!last.has_more);

        let empty = EventPage::new(Vec::new(), 0, 10, 0);
        assert!(!empty.has_more);
    }
}
