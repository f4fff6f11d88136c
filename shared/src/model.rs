use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid entry id: {0}")]
    InvalidId(String),
}

/// Opaque identifier of a queued entry, stable for the entry's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ModelError> {
        if id.trim().is_empty() {
            return Err(ModelError::InvalidId("id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ModelError::InvalidId(
                "id contains control characters".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<String> for EntryId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let delta_ms = u64::try_from(delta.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(delta_ms))
    }
}

/// One queued unit of work.
///
/// `flush_after` is the delivery deadline: once it has passed, an entry still
/// sitting in the shared backlog is presumed abandoned by the context that
/// enqueued it and may be adopted by any other context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    pub flush_after: UnixTimeMs,
    pub payload: Value,
    /// Set only on entries adopted from the shared backlog. Never persisted.
    #[serde(skip)]
    pub orphaned: bool,
}

impl Entry {
    pub fn new(payload: Value, now: UnixTimeMs, orphan_deadline: Duration) -> Self {
        Self {
            id: EntryId::generate(),
            flush_after: now.saturating_add(orphan_deadline),
            payload,
            orphaned: false,
        }
    }

    /// Parses one element of the persisted backlog. Elements without a
    /// well-formed id are treated as corrupt and yield `None`.
    pub fn from_stored(value: &Value) -> Option<Self> {
        Entry::deserialize(value).ok()
    }

    pub fn is_past_deadline(&self, now: UnixTimeMs) -> bool {
        now > self.flush_after
    }

    pub fn to_stored(&self) -> Value {
        serde_json::json!({
            "id": self.id.as_str(),
            "flushAfter": self.flush_after.0,
            "payload": self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_id_validation() {
        assert!(EntryId::new("abc123").is_ok());
        assert!(EntryId::new("").is_err());
        assert!(EntryId::new("   ").is_err());
        assert!(EntryId::new("a".repeat(129)).is_err());
        assert!(EntryId::new("bad\u{0}id").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = EntryId::generate();
        let b = EntryId::generate();
        assert_ne!(a, b);
        assert!(EntryId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_entry_deadline_from_hint() {
        let now = UnixTimeMs(1_700_000_000_000);
        let entry = Entry::new(json!({"event": "a"}), now, Duration::from_millis(10_000));
        assert_eq!(entry.flush_after, UnixTimeMs(1_700_000_010_000));
        assert!(!entry.is_past_deadline(UnixTimeMs(1_700_000_010_000)));
        assert!(entry.is_past_deadline(UnixTimeMs(1_700_000_010_001)));
    }

    #[test]
    fn test_stored_layout_uses_wire_names() {
        let now = UnixTimeMs(1000);
        let entry = Entry::new(json!({"k": 1}), now, Duration::from_millis(5));
        let stored = entry.to_stored();
        assert_eq!(stored["flushAfter"], json!(1005));
        assert_eq!(stored["payload"], json!({"k": 1}));
        assert!(stored.get("orphaned").is_none());

        let parsed = Entry::from_stored(&stored).unwrap();
        assert_eq!(parsed.id, entry.id);
        assert!(!parsed.orphaned);
    }

    #[test]
    fn test_malformed_stored_entries_rejected() {
        assert!(Entry::from_stored(&json!({"flushAfter": 1, "payload": {}})).is_none());
        assert!(Entry::from_stored(&json!({"id": "", "flushAfter": 1, "payload": {}})).is_none());
        assert!(Entry::from_stored(&json!("not an object")).is_none());
        assert!(Entry::from_stored(&json!({"id": 7, "flushAfter": 1, "payload": {}})).is_none());
    }
}
