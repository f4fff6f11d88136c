//! Cooperative mutual exclusion over a [`StorageBackend`] that offers no
//! compare-and-swap.
//!
//! The protocol is a three-slot fast lock (`<key>:X`, `<key>:Y`, `<key>:Z`).
//! Every wait is bounded: once the window elapses the waiter clears `Z` and
//! `Y` and starts over, so a context that died inside the critical section
//! cannot wedge the lock. That reclamation means two holders can overlap in
//! a pathological interleaving; everything guarded by this lock must stay
//! correct under a duplicate holder (all queue mutations are keyed by entry
//! id and idempotent).

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::capabilities::kv::{KvError, StorageBackend, StorageProbe};
use crate::config::ConfigError;
use crate::model::UnixTimeMs;

const IN_CRITICAL_SECTION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_ms: 2_000,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("lock.poll_interval_ms", "must be > 0"));
        }
        if self.timeout_ms < self.poll_interval_ms {
            return Err(ConfigError::invalid(
                "lock.timeout_ms",
                "must be at least the poll interval",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The backend is not accepting writes at all; callers fall back to
    /// their unlocked path.
    #[error("storage is not accepting writes; cannot acquire lock on {key}")]
    StorageUnavailable { key: String },

    #[error("lock storage operation failed: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockPhase {
    Idle = 0,
    AcquiringX = 1,
    AcquiringY = 2,
    InCriticalSection = 3,
    Releasing = 4,
}

impl LockPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LockPhase::AcquiringX,
            2 => LockPhase::AcquiringY,
            3 => LockPhase::InCriticalSection,
            4 => LockPhase::Releasing,
            _ => LockPhase::Idle,
        }
    }
}

/// Acquisition steps. `AcquiringX` covers `WriteX`; everything up to
/// `Enter` reports as `AcquiringY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    WriteX,
    ClaimY,
    CheckX,
    RecheckY,
    AwaitZ,
    Enter,
}

enum Pause {
    Waited,
    Reclaimed,
}

pub struct SharedLock {
    key: String,
    key_x: String,
    key_y: String,
    key_z: String,
    storage: Arc<dyn StorageBackend>,
    probe: Arc<StorageProbe>,
    config: LockConfig,
    phase: AtomicU8,
    in_flight: AtomicUsize,
}

impl SharedLock {
    pub fn new(
        key: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        probe: Arc<StorageProbe>,
        config: LockConfig,
    ) -> Self {
        let key = key.into();
        Self {
            key_x: format!("{key}:X"),
            key_y: format!("{key}:Y"),
            key_z: format!("{key}:Z"),
            key,
            storage,
            probe,
            config,
            phase: AtomicU8::new(LockPhase::Idle as u8),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest transition of any acquisition running on this lock. Reports
    /// `Idle` only once no acquisition is in flight.
    pub fn phase(&self) -> LockPhase {
        LockPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Runs `critical` while holding the lock under a fresh contestant id.
    pub async fn with_lock<F, Fut, T, E>(&self, critical: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.with_lock_as(generate_pid(), critical).await
    }

    /// Like [`with_lock`](Self::with_lock) with a caller-chosen contestant
    /// id. A context that already holds `Y` under `pid` passes straight
    /// through the `Y` check.
    #[instrument(skip(self, critical, pid), fields(key = %self.key, pid = %pid))]
    pub async fn with_lock_as<F, Fut, T, E>(&self, pid: String, critical: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let _in_flight = InFlight::enter(self);

        // storage may have stopped accepting writes since the last check
        if !self.probe.check(true).await {
            return Err(LockError::StorageUnavailable {
                key: self.key.clone(),
            }
            .into());
        }

        self.acquire(&pid).await?;

        self.set_phase(LockPhase::InCriticalSection);
        let outcome = critical().await;

        self.set_phase(LockPhase::Releasing);
        if let Err(e) = self.release(&pid).await {
            warn!(error = %e, "failed to release lock slots");
        }
        outcome
    }

    async fn acquire(&self, pid: &str) -> Result<(), LockError> {
        let mut window = Instant::now();
        let mut step = Step::WriteX;

        while step != Step::Enter {
            step = match step {
                Step::WriteX => {
                    self.set_phase(LockPhase::AcquiringX);
                    self.storage.set(&self.key_x, &pid_value(pid)).await?;
                    self.set_phase(LockPhase::AcquiringY);
                    Step::ClaimY
                }
                Step::ClaimY => {
                    if self.try_claim_y(pid).await? {
                        Step::CheckX
                    } else {
                        match self.pause(&mut window, pid).await? {
                            Pause::Waited => Step::ClaimY,
                            Pause::Reclaimed => Step::WriteX,
                        }
                    }
                }
                Step::CheckX => {
                    if self.slot_is(&self.key_x, pid).await? {
                        Step::Enter
                    } else {
                        // contended: let the other contestant finish its writes
                        match self.pause(&mut window, pid).await? {
                            Pause::Waited => Step::RecheckY,
                            Pause::Reclaimed => Step::WriteX,
                        }
                    }
                }
                Step::RecheckY => {
                    if self.slot_is(&self.key_y, pid).await? {
                        Step::AwaitZ
                    } else {
                        Step::WriteX
                    }
                }
                Step::AwaitZ => {
                    if self.storage.get(&self.key_z).await?.is_none() {
                        Step::Enter
                    } else {
                        match self.pause(&mut window, pid).await? {
                            Pause::Waited => Step::AwaitZ,
                            Pause::Reclaimed => Step::WriteX,
                        }
                    }
                }
                Step::Enter => Step::Enter,
            };
        }

        self.storage
            .set(&self.key_z, &Value::String(IN_CRITICAL_SECTION.to_string()))
            .await?;
        debug!("lock acquired");
        Ok(())
    }

    /// Claims `Y` if it is free (or already ours) and verifies the write.
    async fn try_claim_y(&self, pid: &str) -> Result<bool, LockError> {
        match self.storage.get(&self.key_y).await? {
            Some(Value::String(ref holder)) if holder != pid => return Ok(false),
            Some(Value::String(_)) | None => {}
            // anything else in the slot is garbage left by a foreign writer
            Some(_) => return Ok(false),
        }

        self.storage.set(&self.key_y, &pid_value(pid)).await?;
        if self.slot_is(&self.key_y, pid).await? {
            return Ok(true);
        }

        if !self.probe.check(true).await {
            return Err(LockError::StorageUnavailable {
                key: self.key.clone(),
            });
        }
        Ok(false)
    }

    /// Sleeps one jittered poll interval, or reclaims the lock if the
    /// waiting window has elapsed. A reclaim opens a fresh window.
    async fn pause(&self, window: &mut Instant, pid: &str) -> Result<Pause, LockError> {
        if window.elapsed() > self.config.timeout() {
            error!(key = %self.key, pid = %pid, "timed out waiting for lock; clearing it");
            self.storage.remove(&self.key_z).await?;
            self.storage.remove(&self.key_y).await?;
            *window = Instant::now();
            return Ok(Pause::Reclaimed);
        }

        tokio::time::sleep(self.jittered_poll()).await;
        Ok(Pause::Waited)
    }

    async fn release(&self, pid: &str) -> Result<(), LockError> {
        self.storage.remove(&self.key_z).await?;
        if self.slot_is(&self.key_y, pid).await? {
            self.storage.remove(&self.key_y).await?;
        }
        if self.slot_is(&self.key_x, pid).await? {
            self.storage.remove(&self.key_x).await?;
        }
        Ok(())
    }

    async fn slot_is(&self, key: &str, pid: &str) -> Result<bool, LockError> {
        Ok(matches!(self.storage.get(key).await?, Some(Value::String(ref v)) if v == pid))
    }

    fn jittered_poll(&self) -> Duration {
        let factor = rand::thread_rng().gen::<f64>() + 0.1;
        Duration::from_millis(self.config.poll_interval_ms).mul_f64(factor)
    }

    fn set_phase(&self, phase: LockPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Counts acquisitions in flight; the last one out resets the phase, also
/// when its future is dropped mid-acquisition.
struct InFlight<'a>(&'a SharedLock);

impl<'a> InFlight<'a> {
    fn enter(lock: &'a SharedLock) -> Self {
        lock.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(lock)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.set_phase(LockPhase::Idle);
        }
    }
}

fn pid_value(pid: &str) -> Value {
    Value::String(pid.to_string())
}

fn generate_pid() -> String {
    format!("{}|{}", UnixTimeMs::now().as_millis(), rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn make_lock(storage: &MemoryStorage) -> SharedLock {
        let backend: Arc<dyn StorageBackend> = Arc::new(storage.clone());
        let probe = Arc::new(StorageProbe::new(backend.clone()));
        SharedLock::new("__mpq_tok_ev", backend, probe, LockConfig::default())
    }

    #[test]
    fn test_config_validation() {
        assert!(LockConfig::default().validate().is_ok());
        assert!(LockConfig {
            poll_interval_ms: 0,
            timeout_ms: 10
        }
        .validate()
        .is_err());
        assert!(LockConfig {
            poll_interval_ms: 100,
            timeout_ms: 50
        }
        .validate()
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncontended_lock_cleans_up() {
        let storage = MemoryStorage::new();
        let lock = make_lock(&storage);

        let value = lock
            .with_lock(|| async {
                Ok::<_, LockError>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(lock.phase(), LockPhase::Idle);
        assert!(storage.snapshot().is_empty(), "all lock slots are removed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_section_error_still_releases() {
        #[derive(Debug)]
        enum TestError {
            Lock(LockError),
            Body,
        }
        impl From<LockError> for TestError {
            fn from(e: LockError) -> Self {
                TestError::Lock(e)
            }
        }

        let storage = MemoryStorage::new();
        let lock = make_lock(&storage);

        let result: Result<(), TestError> = lock.with_lock(|| async { Err(TestError::Body) }).await;
        assert!(matches!(result, Err(TestError::Body)));
        assert!(storage.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contenders_never_overlap() {
        let storage = MemoryStorage::new();
        let lock_a = Arc::new(make_lock(&storage));
        let lock_b = Arc::new(make_lock(&storage));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for (lock, pid) in [(lock_a, "pid-a"), (lock_b, "pid-b")] {
            for round in 0..3 {
                let lock = lock.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                let completed = completed.clone();
                let storage = storage.clone();
                let pid = format!("{pid}-{round}");
                handles.push(tokio::spawn(async move {
                    lock.with_lock_as(pid, move || async move {
                        let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now_inside, Ordering::SeqCst);
                        assert_eq!(
                            storage.snapshot().get("__mpq_tok_ev:Z"),
                            Some(&json!("1"))
                        );
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, LockError>(())
                    })
                    .await
                }));
            }
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 6);
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_is_reclaimed_after_timeout() {
        let storage = MemoryStorage::new();
        // a context died inside its critical section
        storage.insert_raw("__mpq_tok_ev:X", json!("dead"));
        storage.insert_raw("__mpq_tok_ev:Y", json!("dead"));
        storage.insert_raw("__mpq_tok_ev:Z", json!("1"));

        let lock = make_lock(&storage);
        let started = Instant::now();
        lock.with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap();

        assert!(started.elapsed() >= LockConfig::default().timeout());
        assert!(storage.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_holder_of_y_passes_through() {
        let storage = MemoryStorage::new();
        storage.insert_raw("__mpq_tok_ev:Y", json!("pid-1"));
        let lock = make_lock(&storage);

        let started = Instant::now();
        lock.with_lock_as("pid-1".to_string(), || async { Ok::<_, LockError>(()) })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_storage_fails_fast() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let lock = make_lock(&storage);

        let err = lock
            .with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::StorageUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_dropped_mid_acquisition_fail() {
        let storage = MemoryStorage::new();
        let lock = make_lock(&storage);
        // warm the probe while storage is healthy
        lock.with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap();

        storage.set_drop_writes(true);
        let err = lock
            .with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::StorageUnavailable { .. }));
        assert_eq!(lock.phase(), LockPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failing_after_warm_up_is_unavailable() {
        let storage = MemoryStorage::new();
        let lock = make_lock(&storage);
        lock.with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap();

        storage.set_fail_writes(true);
        let err = lock
            .with_lock(|| async { Ok::<_, LockError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::StorageUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_stays_busy_while_another_acquisition_waits() {
        let storage = MemoryStorage::new();
        let lock = Arc::new(make_lock(&storage));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let holder = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.with_lock(move || async move {
                    let _ = released.await;
                    Ok::<_, LockError>(())
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lock.phase(), LockPhase::InCriticalSection);

        let waiter = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.with_lock(|| async { Ok::<_, LockError>(()) })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_ne!(lock.phase(), LockPhase::Idle, "the waiter is still acquiring");

        waiter.await.unwrap().unwrap();
        assert_eq!(lock.phase(), LockPhase::Idle);
        assert!(storage.snapshot().is_empty());
    }
}
