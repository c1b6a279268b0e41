//! uuid and nonce helpers.
//!
//! Event uuids are 32 hex chars, task uuids are 64 hex chars whose first
//! 32 chars equal the owning event's uuid (spec.md §3's one join key
//! between the global and per-event databases). Nonces (`art_up_nonce`,
//! `art_down_nonce`) are 32 hex chars, generated the same way as event
//! uuids but never interpreted as an event reference.

use uuid::Uuid;

/// Generate a fresh 32-hex-char event uuid.
pub fn gen_event_uuid() -> String {
    hex::encode(Uuid::new_v4().as_bytes())
}

/// Generate a fresh 32-hex-char nonce (art_up_nonce / art_down_nonce).
pub fn gen_nonce() -> String {
    gen_event_uuid()
}

/// Generate a task uuid for `event_uuid`: the event uuid followed by 32
/// more random hex chars.
pub fn gen_task_uuid(event_uuid: &str) -> String {
    let mut out = String::with_capacity(64);
    out.push_str(event_uuid);
    out.push_str(&hex::encode(Uuid::new_v4().as_bytes()));
    out
}

/// Recover the owning event's uuid from a task uuid (spec.md §3 invariant).
pub fn task_uuid_to_event_uuid(task_uuid: &str) -> Option<&str> {
    task_uuid.get(0..32)
}

fn is_lowercase_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn validate_event_uuid(s: &str) -> Result<(), String> {
    if s.len() != 32 || !is_lowercase_hex(s) {
        return Err(format!("event uuid must be 32 hex chars, got {s:?}"));
    }
    Ok(())
}

pub fn validate_task_uuid(s: &str) -> Result<(), String> {
    if s.len() != 64 || !is_lowercase_hex(s) {
        return Err(format!("task uuid must be 64 hex chars, got {s:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_uuid_roundtrips_into_task_uuid() {
        let event = gen_event_uuid();
        validate_event_uuid(&event).unwrap();
        let task = gen_task_uuid(&event);
        validate_task_uuid(&task).unwrap();
        assert_eq!(task_uuid_to_event_uuid(&task), Some(event.as_str()));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(validate_event_uuid("abc").is_err());
        assert!(validate_task_uuid(&"a".repeat(63)).is_err());
        assert!(validate_task_uuid(&"z".repeat(64)).is_err());
    }
}
