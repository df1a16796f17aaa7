//! Event fixtures.
//!
//! Fixtures panic on invalid input; they are only ever called from tests.

use callex_core::event::{AuditEvent, EventType, compliance};

use crate::clock::FixedClock;

/// A valid, unsealed `call.initiated` event from `buyer-1` on `call-1`.
///
/// # Panics
///
/// Never, for the built-in field values.
#[must_use]
pub fn call_event() -> AuditEvent {
    event(EventType::CallInitiated, "buyer-1", "call-1")
}

/// A valid, unsealed event stamped with the fixture time.
///
/// # Panics
///
/// Panics if `actor_id` or `target_id` fails validation.
#[must_use]
pub fn event(event_type: EventType, actor_id: &str, target_id: &str) -> AuditEvent {
    AuditEvent::new(
        event_type,
        actor_id,
        target_id,
        event_type.as_str(),
        &FixedClock::default(),
    )
    .expect("fixture event must be valid")
    .with_metadata("source", "fixture")
    .with_compliance_flag(compliance::TCPA_RELEVANT, true)
}

/// A sealed event at `sequence` linked to `previous_hash`.
///
/// # Panics
///
/// Panics if `sequence` is zero.
#[must_use]
pub fn sealed_event(sequence: u64, previous_hash: &str) -> AuditEvent {
    let mut event = event(EventType::CallRouted, "seller-1", &format!("call-{sequence}"));
    event.sequence_num = Some(sequence);
    event
        .seal(previous_hash)
        .expect("fixture sequence must be positive");
    event
}

/// A correctly linked chain at positions `1..=len`.
#[must_use]
pub fn sealed_chain(len: u64) -> Vec<AuditEvent> {
    let mut previous = String::new();
    (1..=len)
        .map(|sequence| {
            let event = sealed_event(sequence, &previous);
            previous = event.event_hash.clone().unwrap_or_default();
            event
        })
        .collect()
}
