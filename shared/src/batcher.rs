use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::capabilities::http::{classify, BatchResponse, RequestOptions, ResponseClass, Transport, TransportKind};
use crate::capabilities::kv::lock_ignoring_poison;
use crate::config::ConfigError;
use crate::model::{Entry, EntryId};
use crate::queue::{DurableQueue, QueueError};
use crate::reporting::ErrorReporter;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub autostart: bool,
    /// Always wait for the timer between batches, even with a backlog.
    pub flush_only_on_interval: bool,
    pub max_retry_interval_ms: u64,
    /// An entry removed more than this many times is considered stuck.
    pub max_send_attempts: u32,
    pub max_consecutive_removal_failures: u32,
    pub sent_ids_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 5_000,
            request_timeout_ms: 90_000,
            autostart: true,
            flush_only_on_interval: false,
            max_retry_interval_ms: 10 * 60 * 1000,
            max_send_attempts: 5,
            max_consecutive_removal_failures: 5,
            sent_ids_capacity: 10_000,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch.batch_size", "must be > 0"));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::invalid("batch.flush_interval_ms", "must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("batch.request_timeout_ms", "must be > 0"));
        }
        if self.max_retry_interval_ms < self.flush_interval_ms {
            return Err(ConfigError::invalid(
                "batch.max_retry_interval_ms",
                "must be at least the flush interval",
            ));
        }
        if self.sent_ids_capacity == 0 {
            return Err(ConfigError::invalid("batch.sent_ids_capacity", "must be > 0"));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Next flush delay after a retryable failure: double the current interval,
/// or the server's hint when it sent one, never above `max`.
pub fn retry_interval(current: Duration, retry_after: Option<Duration>, max: Duration) -> Duration {
    retry_after
        .unwrap_or_else(|| current.saturating_mul(2))
        .min(max)
}

/// Batch size after a payload-too-large response to a batch of `batch_len`
/// entries that was filled with `attempted` as its limit.
pub fn shrink_batch_size(current: usize, attempted: usize, batch_len: usize) -> usize {
    let halved = (attempted / 2).max(1);
    current.min(halved).min(batch_len.saturating_sub(1)).max(1)
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub batches_sent: AtomicU64,
    pub entries_delivered: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub payload_too_large: AtomicU64,
    pub entries_dropped: AtomicU64,
    pub removal_failures: AtomicU64,
}

impl SenderMetrics {
    pub fn snapshot(&self) -> SenderMetricsSnapshot {
        SenderMetricsSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            entries_delivered: self.entries_delivered.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            payload_too_large: self.payload_too_large.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            removal_failures: self.removal_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderMetricsSnapshot {
    pub batches_sent: u64,
    pub entries_delivered: u64,
    pub retries_scheduled: u64,
    pub payload_too_large: u64,
    pub entries_dropped: u64,
    pub removal_failures: u64,
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Halts every registered sender once the system can no longer confirm
/// that delivered entries leave the backlog. Stays open until the process
/// restarts.
pub struct CircuitBreaker {
    tripped: AtomicBool,
    senders: Mutex<Vec<Weak<BatchSender>>>,
    reporter: ErrorReporter,
}

impl CircuitBreaker {
    pub fn new(reporter: ErrorReporter) -> Self {
        Self {
            tripped: AtomicBool::new(false),
            senders: Mutex::new(Vec::new()),
            reporter,
        }
    }

    pub fn register(&self, sender: Weak<BatchSender>) {
        lock_ignoring_poison(&self.senders).push(sender);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub async fn trip(&self, reason: &str) {
        if self.tripped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reporter
            .report(format!("{reason}; disabling batching system"), None);

        let senders: Vec<Arc<BatchSender>> = lock_ignoring_poison(&self.senders)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for sender in senders {
            sender.stop();
            if let Err(e) = sender.clear().await {
                warn!(sender = %sender.name(), error = %e, "failed to clear queue after trip");
            }
        }
    }
}

// ============================================================================
// Batch sender
// ============================================================================

/// Pre-send transform. Returning `None` suppresses the payload.
pub type BeforeSendHook = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// The host is going away: send one-way and record transforms instead
    /// of waiting for a response.
    pub unloading: bool,
}

#[derive(Default)]
pub struct SenderHooks {
    pub before_send: Option<BeforeSendHook>,
    pub reporter: ErrorReporter,
    /// Shared breaker; a private one is created when absent.
    pub breaker: Option<Arc<CircuitBreaker>>,
}

struct SenderState {
    stopped: bool,
    batch_size: usize,
    flush_interval: Duration,
    consecutive_removal_failures: u32,
    // dropping the sender cancels the pending timer
    timer: Option<oneshot::Sender<()>>,
}

enum Next {
    Again,
    Done,
}

/// Drives flush cycles for one stream: fills a batch from the queue, sends
/// it and reconciles the outcome.
pub struct BatchSender {
    name: String,
    queue: Arc<DurableQueue>,
    transport: Arc<dyn Transport>,
    config: BatchConfig,
    state: Mutex<SenderState>,
    sent_counts: Mutex<lru::LruCache<EntryId, u32>>,
    in_progress: AtomicBool,
    before_send: Option<BeforeSendHook>,
    breaker: Arc<CircuitBreaker>,
    reporter: ErrorReporter,
    metrics: SenderMetrics,
    weak_self: Weak<BatchSender>,
}

impl BatchSender {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<DurableQueue>,
        transport: Arc<dyn Transport>,
        config: BatchConfig,
        hooks: SenderHooks,
    ) -> Arc<Self> {
        let SenderHooks {
            before_send,
            reporter,
            breaker,
        } = hooks;
        let breaker = breaker.unwrap_or_else(|| Arc::new(CircuitBreaker::new(reporter.clone())));
        let capacity = NonZeroUsize::new(config.sent_ids_capacity).unwrap_or(NonZeroUsize::MIN);

        Arc::new_cyclic(|weak_self| {
            breaker.register(weak_self.clone());
            Self {
                name: name.into(),
                queue,
                transport,
                state: Mutex::new(SenderState {
                    stopped: !config.autostart,
                    batch_size: config.batch_size,
                    flush_interval: config.flush_interval(),
                    consecutive_removal_failures: 0,
                    timer: None,
                }),
                config,
                sent_counts: Mutex::new(lru::LruCache::new(capacity)),
                in_progress: AtomicBool::new(false),
                before_send,
                breaker,
                reporter,
                metrics: SenderMetrics::default(),
                weak_self: weak_self.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> SenderMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn batch_size(&self) -> usize {
        lock_ignoring_poison(&self.state).batch_size
    }

    pub fn flush_interval(&self) -> Duration {
        lock_ignoring_poison(&self.state).flush_interval
    }

    pub fn is_stopped(&self) -> bool {
        lock_ignoring_poison(&self.state).stopped
    }

    pub fn has_pending_flush(&self) -> bool {
        lock_ignoring_poison(&self.state).timer.is_some()
    }

    pub fn consecutive_removal_failures(&self) -> u32 {
        lock_ignoring_poison(&self.state).consecutive_removal_failures
    }

    /// Queues a payload, using the current flush interval as the basis of
    /// its orphan deadline.
    pub async fn enqueue(&self, payload: Value) -> Result<EntryId, QueueError> {
        let interval = self.flush_interval();
        self.queue.enqueue(payload, interval).await
    }

    pub async fn start(&self) {
        {
            let mut state = lock_ignoring_poison(&self.state);
            state.stopped = false;
            state.consecutive_removal_failures = 0;
        }
        self.flush(FlushOptions::default()).await;
    }

    /// Cancels the pending timer. An in-flight send still reconciles.
    pub fn stop(&self) {
        let mut state = lock_ignoring_poison(&self.state);
        state.stopped = true;
        state.timer = None;
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        self.queue.clear().await
    }

    pub fn reset_batch_size(&self) {
        lock_ignoring_poison(&self.state).batch_size = self.config.batch_size;
    }

    /// Restores the configured interval and schedules the next flush.
    /// Must be called inside a tokio runtime.
    pub fn reset_flush(&self) {
        self.schedule_flush(self.config.flush_interval());
    }

    fn schedule_flush(&self, interval: Duration) {
        let cancelled = {
            let mut state = lock_ignoring_poison(&self.state);
            state.flush_interval = interval;
            if state.stopped {
                state.timer = None;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.timer = Some(tx);
            rx
        };

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled => return,
            }
            let Some(sender) = weak.upgrade() else {
                return;
            };
            {
                let mut state = lock_ignoring_poison(&sender.state);
                if state.stopped {
                    return;
                }
                state.timer = None;
            }
            sender.flush(FlushOptions::default()).await;
        });
    }

    /// Sends one batch, and keeps going while the backlog is larger than a
    /// batch. At most one flush runs at a time per sender.
    #[instrument(skip(self), fields(sender = %self.name))]
    pub async fn flush(&self, options: FlushOptions) {
        if self.breaker.is_tripped() {
            debug!("circuit breaker is open; not flushing");
            return;
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("flush already in progress");
            return;
        }
        let _guard = InProgress(&self.in_progress);

        while let Next::Again = self.flush_once(options).await {
            if self.breaker.is_tripped() {
                break;
            }
        }
    }

    async fn flush_once(&self, options: FlushOptions) -> Next {
        let attempted = self.batch_size();
        let timeout = self.config.request_timeout();
        let started = Instant::now();

        let batch = self.queue.fill_batch(attempted).await;
        let full_batch = batch.len() == attempted;
        let (payloads, transformed) = self.prepare(&batch);

        if payloads.is_empty() {
            if !batch.is_empty() {
                // every entry was suppressed or stuck; drop them so they
                // cannot block the head of the queue
                let ids = entry_ids(&batch);
                if let Err(e) = self.queue.remove_items_by_id(&ids).await {
                    warn!(error = %e, "failed to remove unsendable entries");
                }
            }
            self.reset_flush();
            return Next::Done;
        }

        let request = RequestOptions {
            kind: if options.unloading {
                TransportKind::Beacon
            } else {
                TransportKind::Request
            },
            timeout,
        };
        debug!(batch_len = payloads.len(), unloading = options.unloading, "sending batch");
        let response = match tokio::time::timeout(timeout, self.transport.send(&payloads, &request)).await {
            Ok(response) => response,
            Err(_) => BatchResponse::timeout(),
        };
        self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);

        if options.unloading {
            if let Err(e) = self.queue.update_payloads(&transformed).await {
                warn!(error = %e, "failed to persist transformed payloads on unload");
            }
            return Next::Done;
        }

        if response.is_timeout() && started.elapsed() >= timeout {
            warn!("network timeout; retrying now");
            return Next::Again;
        }

        match classify(&response, self.transport.is_online()) {
            ResponseClass::Success | ResponseClass::Terminal => {
                self.remove_sent(&batch, full_batch).await
            }
            ResponseClass::Retry { retry_after } => {
                let retry = retry_interval(
                    self.flush_interval(),
                    retry_after,
                    self.config.max_retry_interval(),
                );
                self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                warn!(
                    status = ?response.http_status_code,
                    error = ?response.error,
                    retry_ms = retry.as_millis() as u64,
                    "retryable failure; backing off"
                );
                self.schedule_flush(retry);
                Next::Done
            }
            ResponseClass::PayloadTooLarge if batch.len() > 1 => {
                let reduced = {
                    let mut state = lock_ignoring_poison(&self.state);
                    state.batch_size = shrink_batch_size(state.batch_size, attempted, batch.len());
                    state.batch_size
                };
                self.metrics.payload_too_large.fetch_add(1, Ordering::Relaxed);
                warn!(batch_size = reduced, "413 response; reducing batch size");
                self.reset_flush();
                Next::Done
            }
            ResponseClass::PayloadTooLarge => {
                self.metrics.payload_too_large.fetch_add(1, Ordering::Relaxed);
                self.metrics.entries_dropped.fetch_add(1, Ordering::Relaxed);
                let id = batch.first().map(|e| e.id.to_string()).unwrap_or_default();
                self.reporter
                    .report(format!("single entry {id} too large to send; dropping"), None);
                self.reset_batch_size();
                self.remove_sent(&batch, false).await
            }
        }
    }

    /// Applies the pre-send hook (never to orphans, whose original context
    /// already ran it) and skips entries that were sent too often.
    fn prepare(&self, batch: &[Entry]) -> (Vec<Value>, HashMap<EntryId, Option<Value>>) {
        let mut payloads = Vec::with_capacity(batch.len());
        let mut transformed = HashMap::with_capacity(batch.len());
        let mut counts = lock_ignoring_poison(&self.sent_counts);

        for entry in batch {
            let payload = match &self.before_send {
                Some(hook) if !entry.orphaned => hook(entry.payload.clone()),
                _ => Some(entry.payload.clone()),
            };
            if let Some(payload) = &payload {
                let times_sent = counts.peek(&entry.id).copied().unwrap_or(0);
                if times_sent > self.config.max_send_attempts {
                    self.metrics.entries_dropped.fetch_add(1, Ordering::Relaxed);
                    self.reporter.report(
                        format!(
                            "entry {} sent {times_sent} times already; not sending",
                            entry.id
                        ),
                        None,
                    );
                } else {
                    payloads.push(payload.clone());
                }
            }
            transformed.insert(entry.id.clone(), payload);
        }
        (payloads, transformed)
    }

    async fn remove_sent(&self, batch: &[Entry], full_batch: bool) -> Next {
        let ids = entry_ids(batch);
        let removed = self.queue.remove_items_by_id(&ids).await;

        {
            let mut counts = lock_ignoring_poison(&self.sent_counts);
            for id in &ids {
                let times = counts.get(id).copied().unwrap_or(0) + 1;
                counts.put(id.clone(), times);
                if times > self.config.max_send_attempts {
                    warn!(id = %id, times, "entry sent too many times");
                }
            }
        }

        match removed {
            Ok(()) => {
                lock_ignoring_poison(&self.state).consecutive_removal_failures = 0;
                self.metrics
                    .entries_delivered
                    .fetch_add(ids.len() as u64, Ordering::Relaxed);
                if full_batch && !self.config.flush_only_on_interval {
                    Next::Again
                } else {
                    self.reset_flush();
                    Next::Done
                }
            }
            Err(e) => {
                self.metrics.removal_failures.fetch_add(1, Ordering::Relaxed);
                let failures = {
                    let mut state = lock_ignoring_poison(&self.state);
                    state.consecutive_removal_failures += 1;
                    state.consecutive_removal_failures
                };
                warn!(error = %e, failures, "could not confirm removal of sent entries");
                if failures > self.config.max_consecutive_removal_failures {
                    self.breaker.trip("too many queue failures").await;
                } else {
                    self.reset_flush();
                }
                Next::Done
            }
        }
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn entry_ids(batch: &[Entry]) -> Vec<EntryId> {
    batch.iter().map(|e| e.id.clone()).collect()
}
