use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::capabilities::kv::{lock_ignoring_poison, KvError, StorageBackend, StorageProbe};
use crate::config::ConfigError;
use crate::lock::{LockConfig, LockError, SharedLock};
use crate::model::{Entry, EntryId, UnixTimeMs};
use crate::reporting::ErrorReporter;
use crate::throttle::BatchedThrottle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub use_persistence: bool,
    /// Coalesce persisted enqueues arriving within this window into one
    /// lock acquisition.
    pub enqueue_throttle_ms: Option<u64>,
    /// An entry's orphan deadline is this many flush intervals after it
    /// was enqueued.
    pub orphan_deadline_multiplier: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            use_persistence: true,
            enqueue_throttle_ms: None,
            orphan_deadline_multiplier: 2,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orphan_deadline_multiplier == 0 {
            return Err(ConfigError::invalid(
                "queue.orphan_deadline_multiplier",
                "must be > 0",
            ));
        }
        if self.enqueue_throttle_ms == Some(0) {
            return Err(ConfigError::invalid(
                "queue.enqueue_throttle_ms",
                "must be > 0 when set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("removal of {count} entries from {key} could not be confirmed")]
    RemovalUnconfirmed { key: String, count: usize },

    #[error("coalesced enqueue was abandoned before it was written")]
    Abandoned,
}

/// This context's own entries: an arena keyed by id plus the FIFO order.
#[derive(Default)]
struct LocalView {
    entries: HashMap<EntryId, Entry>,
    order: VecDeque<EntryId>,
}

impl LocalView {
    fn push(&mut self, entry: Entry) {
        if self.entries.insert(entry.id.clone(), entry.clone()).is_none() {
            self.order.push_back(entry.id);
        }
    }

    fn front(&self, max: usize) -> Vec<Entry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .take(max)
            .cloned()
            .collect()
    }

    fn remove(&mut self, ids: &HashSet<EntryId>) {
        self.entries.retain(|id, _| !ids.contains(id));
        self.order.retain(|id| !ids.contains(id));
    }

    fn update(&mut self, updates: &HashMap<EntryId, Option<Value>>) {
        let mut dropped = HashSet::new();
        for (id, replacement) in updates {
            match replacement {
                Some(payload) => {
                    if let Some(entry) = self.entries.get_mut(id) {
                        entry.payload = payload.clone();
                    }
                }
                None => {
                    dropped.insert(id.clone());
                }
            }
        }
        if !dropped.is_empty() {
            self.remove(&dropped);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Ordered entries mirrored between this context and a shared persisted
/// backlog.
///
/// Every write to the backlog happens under a [`SharedLock`]. Reads for
/// [`fill_batch`](Self::fill_batch) take no lock and may see entries that
/// another context is adopting at the same moment; duplicates are resolved
/// downstream by entry id.
pub struct DurableQueue {
    key: String,
    storage: Arc<dyn StorageBackend>,
    probe: Arc<StorageProbe>,
    lock: SharedLock,
    config: QueueConfig,
    local: Mutex<LocalView>,
    persistence: OnceCell<bool>,
    throttle: Option<BatchedThrottle<Entry, Result<(), QueueError>>>,
    reporter: ErrorReporter,
}

impl DurableQueue {
    pub fn new(
        key: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        probe: Arc<StorageProbe>,
        config: QueueConfig,
        lock_config: LockConfig,
        reporter: ErrorReporter,
    ) -> Self {
        let key = key.into();
        let lock = SharedLock::new(key.clone(), storage.clone(), probe.clone(), lock_config);
        let throttle = config
            .enqueue_throttle_ms
            .map(|ms| BatchedThrottle::new(Duration::from_millis(ms)));
        Self {
            key,
            storage,
            probe,
            lock,
            config,
            local: Mutex::new(LocalView::default()),
            persistence: OnceCell::new(),
            throttle,
            reporter,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock(&self) -> &SharedLock {
        &self.lock
    }

    /// Initialises the backend and probes it on first use. A failure turns
    /// persistence off for the rest of this queue's life.
    pub async fn ensure_init(&self) -> bool {
        *self
            .persistence
            .get_or_init(|| async {
                if !self.config.use_persistence {
                    return false;
                }
                if let Err(e) = self.storage.init().await {
                    self.reporter
                        .report(format!("failed to initialise storage for {}", self.key), Some(&e));
                    return false;
                }
                if !self.probe.check(false).await {
                    self.reporter.report(
                        format!("storage for {} is not writable; queue is in-memory only", self.key),
                        None,
                    );
                    return false;
                }
                true
            })
            .await
    }

    /// `None` until [`ensure_init`](Self::ensure_init) has settled whether
    /// the backend is usable.
    pub fn uses_persistence(&self) -> Option<bool> {
        if !self.config.use_persistence {
            return Some(false);
        }
        self.persistence.get().copied()
    }

    /// Appends a payload. The entry is visible to this context's
    /// [`fill_batch`](Self::fill_batch) immediately; if the persisted write
    /// then fails it is withdrawn again and the error returned.
    #[instrument(skip(self, payload), fields(key = %self.key))]
    pub async fn enqueue(
        &self,
        payload: Value,
        flush_interval_hint: Duration,
    ) -> Result<EntryId, QueueError> {
        let deadline = flush_interval_hint.saturating_mul(self.config.orphan_deadline_multiplier);
        let entry = Entry::new(payload, UnixTimeMs::now(), deadline);
        let id = entry.id.clone();
        lock_ignoring_poison(&self.local).push(entry.clone());

        if !self.ensure_init().await {
            return Ok(id);
        }

        let persisted = match &self.throttle {
            Some(throttle) => throttle
                .submit(entry, |entries| self.append_persisted(entries))
                .await
                .unwrap_or(Err(QueueError::Abandoned)),
            None => self.append_persisted(vec![entry]).await,
        };

        if let Err(e) = persisted {
            let mut withdrawn = HashSet::new();
            withdrawn.insert(id.clone());
            lock_ignoring_poison(&self.local).remove(&withdrawn);
            self.reporter.report("error enqueueing item", Some(&e));
            return Err(e);
        }
        Ok(id)
    }

    async fn append_persisted(&self, entries: Vec<Entry>) -> Result<(), QueueError> {
        let count = entries.len();
        self.lock
            .with_lock(|| async {
                let mut stored = self.read_stored().await;
                stored.extend(entries);
                self.save(&stored).await
            })
            .await?;
        debug!(count, "appended to persisted backlog");
        Ok(())
    }

    pub async fn fill_batch(&self, max: usize) -> Vec<Entry> {
        self.fill_batch_at(max, UnixTimeMs::now()).await
    }

    /// Up to `max` entries: this context's own first, in enqueue order, then
    /// backlog entries whose deadline passed before `now`, marked orphaned.
    pub async fn fill_batch_at(&self, max: usize, now: UnixTimeMs) -> Vec<Entry> {
        let mut batch = lock_ignoring_poison(&self.local).front(max);
        if batch.len() >= max || !self.ensure_init().await {
            return batch;
        }

        let stored = self.read_stored().await;
        let mut seen: HashSet<EntryId> = batch.iter().map(|e| e.id.clone()).collect();
        for mut entry in stored {
            if batch.len() >= max {
                break;
            }
            if entry.is_past_deadline(now) && seen.insert(entry.id.clone()) {
                entry.orphaned = true;
                batch.push(entry);
            }
        }
        batch
    }

    /// Drops every entry whose id is in `ids`, locally and from the backlog,
    /// then re-reads the backlog to confirm.
    #[instrument(skip(self, ids), fields(key = %self.key, count = ids.len()))]
    pub async fn remove_items_by_id(&self, ids: &[EntryId]) -> Result<(), QueueError> {
        let ids: HashSet<EntryId> = ids.iter().cloned().collect();
        lock_ignoring_poison(&self.local).remove(&ids);
        if !self.ensure_init().await {
            return Ok(());
        }

        let err = match self.lock.with_lock(|| self.remove_persisted(&ids)).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(error = %err, "locked removal failed");

        if self.probe.check(true).await {
            return Err(err);
        }

        // Nobody can write or take the lock while storage is refusing
        // writes, so removing without it cannot race a writer.
        warn!("storage is not writable; removing without the lock");
        match self.remove_persisted(&ids).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(remove_err) = self.storage.remove(&self.key).await {
                    warn!(error = %remove_err, "could not drop the backlog either");
                }
                self.reporter.report("error removing items from queue", Some(&e));
                Err(e)
            }
        }
    }

    async fn remove_persisted(&self, ids: &HashSet<EntryId>) -> Result<(), QueueError> {
        let stored = self.read_stored().await;
        let kept: Vec<Entry> = stored.into_iter().filter(|e| !ids.contains(&e.id)).collect();
        self.save(&kept).await?;

        let remaining = self
            .read_stored()
            .await
            .iter()
            .filter(|e| ids.contains(&e.id))
            .count();
        if remaining > 0 {
            return Err(QueueError::RemovalUnconfirmed {
                key: self.key.clone(),
                count: remaining,
            });
        }
        Ok(())
    }

    /// Replaces payloads by id; `None` deletes the entry.
    #[instrument(skip(self, updates), fields(key = %self.key, count = updates.len()))]
    pub async fn update_payloads(
        &self,
        updates: &HashMap<EntryId, Option<Value>>,
    ) -> Result<(), QueueError> {
        lock_ignoring_poison(&self.local).update(updates);
        if !self.ensure_init().await {
            return Ok(());
        }

        self.lock
            .with_lock(|| async {
                let mut stored = self.read_stored().await;
                stored.retain_mut(|entry| match updates.get(&entry.id) {
                    Some(Some(payload)) => {
                        entry.payload = payload.clone();
                        true
                    }
                    Some(None) => false,
                    None => true,
                });
                self.save(&stored).await
            })
            .await
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        lock_ignoring_poison(&self.local).clear();
        if !self.ensure_init().await {
            return Ok(());
        }
        self.storage.remove(&self.key).await?;
        Ok(())
    }

    pub fn local_len(&self) -> usize {
        lock_ignoring_poison(&self.local).len()
    }

    pub async fn persisted_len(&self) -> Result<usize, QueueError> {
        if !self.ensure_init().await {
            return Ok(0);
        }
        Ok(self.read_stored().await.len())
    }

    /// Well-formed backlog entries. An unreadable or malformed backlog reads
    /// as empty (or loses its bad elements) and is replaced by the next
    /// locked write.
    async fn read_stored(&self) -> Vec<Entry> {
        let raw = match self.storage.get(&self.key).await {
            Ok(None) => return Vec::new(),
            Ok(Some(Value::Array(items))) => items,
            Ok(Some(_)) => {
                self.reporter
                    .report(format!("invalid backlog found under {}; ignoring", self.key), None);
                return Vec::new();
            }
            Err(e) => {
                self.reporter.report("error retrieving queue", Some(&e));
                return Vec::new();
            }
        };

        let total = raw.len();
        let entries: Vec<Entry> = raw.iter().filter_map(Entry::from_stored).collect();
        if entries.len() < total {
            warn!(key = %self.key, skipped = total - entries.len(), "skipping malformed backlog entries");
        }
        entries
    }

    async fn save(&self, entries: &[Entry]) -> Result<(), QueueError> {
        let value = Value::Array(entries.iter().map(Entry::to_stored).collect());
        self.storage.set(&self.key, &value).await?;
        Ok(())
    }
}
