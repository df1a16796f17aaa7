//! Ledger table layout shared by every query.

/// Table holding one row per audit event.
pub const EVENTS_TABLE: &str = "audit_events";

/// Columns selected for a full event, in row struct field order.
pub const EVENT_COLUMNS: &str = "id, sequence_num, event_type, severity, action, result, \
    actor_id, actor_type, target_id, target_type, metadata, compliance_flags, occurred_at, \
    event_hash, previous_hash, archived";

/// Predicate over an `EventFilter`, bound as `$1..=$9`:
/// event types, severities, actor ids, target ids, start, end, required
/// compliance flags, `ILIKE` search pattern, archived. The search covers
/// string metadata values at any depth, never keys.
pub const FILTER_PREDICATE: &str = "\
    (cardinality($1::text[]) = 0 OR event_type = ANY($1)) \
    AND (cardinality($2::text[]) = 0 OR severity = ANY($2)) \
    AND (cardinality($3::text[]) = 0 OR actor_id = ANY($3)) \
    AND (cardinality($4::text[]) = 0 OR target_id = ANY($4)) \
    AND ($5::timestamptz IS NULL OR occurred_at >= $5) \
    AND ($6::timestamptz IS NULL OR occurred_at <= $6) \
    AND compliance_flags @> $7::jsonb \
    AND ($8::text IS NULL OR actor_id ILIKE $8 OR target_id ILIKE $8 \
         OR action ILIKE $8 \
         OR EXISTS (SELECT 1 FROM jsonb_path_query(metadata, 'strict $.**') AS m(value) \
                    WHERE jsonb_typeof(m.value) = 'string' AND m.value #>> '{}' ILIKE $8)) \
    AND ($9::boolean IS NULL OR archived = $9)";
