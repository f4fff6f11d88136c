use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_KEY_LENGTH: usize = 512;

pub(crate) const PROBE_KEY_PREFIX: &str = "__beacon_probe_";
const PROBE_VALUE: &str = "xyz";

/// Asynchronous key-value contract over one origin-scoped durable store.
///
/// Implementations may fail a write silently in the underlying medium;
/// callers that depend on a write for correctness re-read it.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn init(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    async fn set(&self, key: &str, value: &Value) -> Result<(), KvError>;

    async fn remove(&self, key: &str) -> Result<(), KvError>;

    async fn list_all(&self) -> Result<Vec<Value>, KvError> {
        Err(KvError::Unsupported { operation: "list_all" })
    }
}

pub fn validate_key(key: &str) -> Result<(), KvError> {
    if key.trim().is_empty() {
        return Err(KvError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(KvError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
        });
    }

    if key.chars().any(|c| c.is_control() && c != '\t') {
        return Err(KvError::InvalidKey {
            key: key.escape_default().to_string(),
            reason: "key contains invalid control characters".to_string(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("quota exceeded: {used}/{limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("operation not supported by this backend: {operation}")]
    Unsupported { operation: &'static str },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Unavailable,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::IoError)
    }
}

/// Write/read/delete self-test over a backend, with the verdict cached on
/// the probe instance rather than in process-wide state.
pub struct StorageProbe {
    backend: Arc<dyn StorageBackend>,
    // 0 = unknown, 1 = usable, 2 = unusable
    verdict: AtomicU8,
}

impl StorageProbe {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            verdict: AtomicU8::new(0),
        }
    }

    /// Returns whether the backend currently accepts writes. The first call
    /// runs the self-test; later calls reuse the verdict unless `force`.
    pub async fn check(&self, force: bool) -> bool {
        if !force {
            match self.verdict.load(Ordering::Acquire) {
                1 => return true,
                2 => return false,
                _ => {}
            }
        }

        let usable = self.self_test().await;
        self.verdict
            .store(if usable { 1 } else { 2 }, Ordering::Release);
        if !usable {
            warn!("storage self-test failed; backend is not accepting writes");
        }
        usable
    }

    pub fn cached(&self) -> Option<bool> {
        match self.verdict.load(Ordering::Acquire) {
            1 => Some(true),
            2 => Some(false),
            _ => None,
        }
    }

    async fn self_test(&self) -> bool {
        // fresh key per run so concurrent probes never read each other's writes
        let key = format!("{PROBE_KEY_PREFIX}{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let expected = Value::String(PROBE_VALUE.to_string());
        if let Err(e) = self.backend.set(&key, &expected).await {
            debug!(error = %e, "probe write failed");
            return false;
        }
        let stuck = matches!(self.backend.get(&key).await, Ok(Some(ref v)) if *v == expected);
        let removed = self.backend.remove(&key).await.is_ok();
        stuck && removed
    }
}

/// In-memory store. Clones share one map, so several contexts built over
/// clones of the same `MemoryStorage` see one origin's storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    map: Mutex<HashMap<String, Value>>,
    fail_writes: AtomicBool,
    drop_writes: AtomicBool,
    quota_bytes: Mutex<Option<u64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(limit_bytes: u64) -> Self {
        let storage = Self::default();
        *lock_ignoring_poison(&storage.inner.quota_bytes) = Some(limit_bytes);
        storage
    }

    /// Writes and removals return an error while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes and removals report success but do not stick while set.
    pub fn set_drop_writes(&self, drop: bool) {
        self.inner.drop_writes.store(drop, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock_ignoring_poison(&self.inner.map).clone()
    }

    pub fn insert_raw(&self, key: impl Into<String>, value: Value) {
        lock_ignoring_poison(&self.inner.map).insert(key.into(), value);
    }

    fn check_writable(&self) -> Result<bool, KvError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::storage(
                StorageErrorCode::Unavailable,
                "writes disabled",
            ));
        }
        Ok(!self.inner.drop_writes.load(Ordering::SeqCst))
    }
}

pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encoded_len(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        validate_key(key)?;
        tokio::task::yield_now().await;
        Ok(lock_ignoring_poison(&self.inner.map).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), KvError> {
        validate_key(key)?;
        tokio::task::yield_now().await;
        if !self.check_writable()? {
            return Ok(());
        }

        let quota = *lock_ignoring_poison(&self.inner.quota_bytes);
        let mut map = lock_ignoring_poison(&self.inner.map);
        if let Some(limit) = quota {
            let used: u64 = map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| encoded_len(k, v))
                .sum();
            let needed = used + encoded_len(key, value);
            if needed > limit {
                return Err(KvError::QuotaExceeded {
                    used: needed,
                    limit,
                });
            }
        }
        map.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        tokio::task::yield_now().await;
        if !self.check_writable()? {
            return Ok(());
        }
        lock_ignoring_poison(&self.inner.map).remove(key);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Value>, KvError> {
        tokio::task::yield_now().await;
        Ok(lock_ignoring_poison(&self.inner.map).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_validation_empty() {
        let result = validate_key("");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
        assert!(validate_key("   ").is_err());
    }

    #[test]
    fn test_key_validation_control_chars() {
        assert!(validate_key("key\x01value").is_err());
        assert!(validate_key("key\0value").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(validate_key(&long_key).is_err());
    }

    #[test]
    fn test_key_validation_valid() {
        assert!(validate_key("__mpq_token_ev").is_ok());
        assert!(validate_key("__mpq_token_ev:X").is_ok());
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::QuotaExceeded { used: 2, limit: 1 }.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_storage_clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();

        a.set("k", &json!([1, 2])).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(json!([1, 2])));

        b.remove("k").await.unwrap();
        assert_eq!(a.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_storage_fault_injection() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        assert!(storage.set("k", &json!(1)).await.is_err());

        storage.set_fail_writes(false);
        storage.set_drop_writes(true);
        storage.set("k", &json!(1)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_storage_quota() {
        let storage = MemoryStorage::with_quota(16);
        storage.set("a", &json!("small")).await.unwrap();
        let err = storage
            .set("b", &json!("this value does not fit"))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { limit: 16, .. }));
        // overwriting an existing key only counts the new value
        storage.set("a", &json!("other")).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_caches_verdict_until_forced() {
        let storage = MemoryStorage::new();
        let probe = StorageProbe::new(Arc::new(storage.clone()));

        assert_eq!(probe.cached(), None);
        assert!(probe.check(false).await);
        assert!(storage.snapshot().is_empty(), "probe must clean up after itself");

        storage.set_drop_writes(true);
        assert!(probe.check(false).await, "cached verdict is reused");
        assert!(!probe.check(true).await, "forced re-check sees dropped writes");
        assert_eq!(probe.cached(), Some(false));
    }

    #[tokio::test]
    async fn test_probes_are_independent() {
        let healthy = StorageProbe::new(Arc::new(MemoryStorage::new()));
        let broken_storage = MemoryStorage::new();
        broken_storage.set_fail_writes(true);
        let broken = StorageProbe::new(Arc::new(broken_storage));

        assert!(!broken.check(false).await);
        assert!(healthy.check(false).await);
    }
}
