//! Durable, batched delivery of telemetry records from contexts that can
//! die at any moment and that share nothing but a key-value store.
//!
//! Records go into a [`DurableQueue`] (an in-process view mirrored into a
//! persisted backlog), and a [`BatchSender`] drains it to the collector in
//! batches with backoff. Writes to the backlog are serialised across
//! contexts by a [`SharedLock`]; entries a dead context left behind are
//! adopted by the survivors once their deadline passes.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod batcher;
pub mod capabilities;
pub mod config;
pub mod lock;
pub mod model;
pub mod offline_store;
pub mod queue;
pub mod reporting;
pub mod system;
pub mod throttle;

pub use batcher::{
    retry_interval, shrink_batch_size, BatchConfig, BatchSender, BeforeSendHook, CircuitBreaker,
    FlushOptions, SenderHooks, SenderMetricsSnapshot,
};
pub use capabilities::http::{BatchResponse, ResponseClass, Transport, TransportKind};
pub use capabilities::kv::{KvError, MemoryStorage, StorageBackend, StorageProbe};
pub use config::{ConfigError, OutboxConfig};
pub use lock::{LockConfig, LockError, LockPhase, SharedLock};
pub use model::{Entry, EntryId, UnixTimeMs};
pub use offline_store::FileStorage;
pub use queue::{DurableQueue, QueueConfig, QueueError};
pub use reporting::{ErrorReport, ErrorReporter};
pub use system::{OutboxError, OutboxParts, OutboxSystem, StreamKind};

#[cfg(feature = "http")]
pub use capabilities::http::HttpTransport;
