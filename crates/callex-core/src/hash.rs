//! Hash chain engine.
//!
//! Each event's hash is SHA-256 over a domain-separated preimage of its
//! immutable fields followed by the hash of its predecessor. Variable-length
//! fields are length-prefixed (u32 big-endian) so no two distinct field
//! layouts can produce the same preimage. `archived` is not hashed.

use sha2::{Digest, Sha256};

use crate::event::AuditEvent;
use crate::sequence::GENESIS_SEQUENCE;

/// Domain prefix for audit event hashing.
pub const DOMAIN_AUDIT_EVENT: &[u8] = b"CALLEX_AUDIT_EVENT_V1";

/// `previous_hash` of the first event in the ledger.
pub const GENESIS_PREVIOUS_HASH: &str = "";

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

fn update_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    // Field lengths are bounded by validation well below u32::MAX.
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    hasher.update(len.to_be_bytes());
    hasher.update(bytes);
}

fn update_str(hasher: &mut Sha256, value: &str) {
    update_bytes(hasher, value.as_bytes());
}

/// Computes the hex-encoded hash of `event` linked to `previous_hash`.
///
/// Pure and deterministic: the event's own `event_hash`, `previous_hash` and
/// `archived` fields are ignored.
#[must_use]
pub fn compute_event_hash(event: &AuditEvent, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_AUDIT_EVENT);
    hasher.update(event.id.as_bytes());
    hasher.update(
        event
            .sequence_num
            .unwrap_or(GENESIS_SEQUENCE)
            .to_be_bytes(),
    );
    update_str(&mut hasher, event.event_type.as_str());
    update_str(&mut hasher, event.severity.as_str());
    update_str(&mut hasher, &event.action);
    update_str(&mut hasher, event.result.as_str());
    update_str(&mut hasher, &event.actor_id);
    update_str(&mut hasher, event.actor_type.as_str());
    update_str(&mut hasher, &event.target_id);
    update_str(&mut hasher, event.target_type.as_str());
    hasher.update(event.timestamp.timestamp_micros().to_be_bytes());
    // Ordered maps serialize with sorted keys; these cannot fail.
    let metadata = serde_json::to_vec(&event.metadata).unwrap_or_default();
    update_bytes(&mut hasher, &metadata);
    let flags = serde_json::to_vec(&event.compliance_flags).unwrap_or_default();
    update_bytes(&mut hasher, &flags);
    update_str(&mut hasher, previous_hash);
    hex::encode(hasher.finalize())
}

/// Recomputes the hash of a sealed event from its stored fields and stored
/// `previous_hash`. Returns `None` for an unsealed event.
#[must_use]
pub fn recompute(event: &AuditEvent) -> Option<String> {
    event
        .event_hash
        .as_ref()
        .map(|_| compute_event_hash(event, &event.previous_hash))
}

/// True when the stored hash matches a fresh computation.
#[must_use]
pub fn verify_event_hash(event: &AuditEvent) -> bool {
    match (&event.event_hash, recompute(event)) {
        (Some(stored), Some(computed)) => *stored == computed,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::clock::Clock;
    use crate::event::{EventType, MetadataValue, compliance};

    struct StaticClock(DateTime<Utc>);

    impl Clock for StaticClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn sample_event() -> AuditEvent {
        let clock = StaticClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        let mut event =
            AuditEvent::new(EventType::CallRouted, "seller-7", "call-42", "route_call", &clock)
                .unwrap()
                .with_metadata("buyer_id", "buyer-3")
                .with_compliance_flag(compliance::TCPA_RELEVANT, true);
        event.sequence_num = Some(1);
        event
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = compute_event_hash(&sample_event(), GENESIS_PREVIOUS_HASH);
        assert_eq!(hash.len(), HASH_HEX_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_depends_on_previous_hash() {
        let event = sample_event();
        let genesis = compute_event_hash(&event, GENESIS_PREVIOUS_HASH);
        let linked = compute_event_hash(&event, &"0".repeat(HASH_HEX_LEN));
        assert_ne!(genesis, linked);
    }

    #[test]
    fn test_hash_covers_sequence_and_metadata() {
        let event = sample_event();
        let base = compute_event_hash(&event, "");

        let mut moved = event.clone();
        moved.sequence_num = Some(2);
        assert_ne!(compute_event_hash(&moved, ""), base);

        let mut edited = event;
        edited
            .metadata
            .insert("buyer_id".into(), MetadataValue::from("buyer-4"));
        assert_ne!(compute_event_hash(&edited, ""), base);
    }

    #[test]
    fn test_archived_flag_does_not_change_hash() {
        let mut event = sample_event();
        event.seal("").unwrap();
        event.archived = true;
        assert!(verify_event_hash(&event));
    }

    #[test]
    fn test_verify_detects_flipped_hash_bit() {
        let mut event = sample_event();
        event.seal("").unwrap();

        let stored = event.event_hash.clone().unwrap();
        let mut bytes = hex::decode(&stored).unwrap();
        bytes[0] ^= 0x01;
        event.event_hash = Some(hex::encode(bytes));

        assert!(!verify_event_hash(&event));
    }

    #[test]
    fn test_verify_rejects_unsealed_event() {
        assert!(!verify_event_hash(&sample_event()));
        assert_eq!(recompute(&sample_event()), None);
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(
            actor in "[a-z0-9-]{1,40}",
            target in "[a-z0-9-]{1,40}",
            sequence in 1u64..1_000_000,
            previous in "[0-9a-f]{64}",
            amount in any::<i64>(),
        ) {
            let mut event = sample_event();
            event.actor_id = actor;
            event.target_id = target;
            event.sequence_num = Some(sequence);
            event.metadata.insert("amount".into(), MetadataValue::Integer(amount));

            let first = compute_event_hash(&event, &previous);
            let second = compute_event_hash(&event.clone(), &previous);
            prop_assert_eq!(first, second);
        }
    }
}
