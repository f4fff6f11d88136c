use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::batcher::{BatchSender, BeforeSendHook, CircuitBreaker, FlushOptions, SenderHooks};
use crate::capabilities::http::Transport;
use crate::capabilities::kv::{StorageBackend, StorageProbe};
use crate::config::{ConfigError, OutboxConfig};
use crate::model::EntryId;
use crate::queue::{DurableQueue, QueueError};
use crate::reporting::ErrorReporter;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("no sender is configured for the {0} stream")]
    StreamNotConfigured(StreamKind),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Logical record streams, each with its own backlog and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Events,
    People,
    Groups,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Events, StreamKind::People, StreamKind::Groups];

    pub fn key_suffix(self) -> &'static str {
        match self {
            StreamKind::Events => "_ev",
            StreamKind::People => "_pp",
            StreamKind::Groups => "_gr",
        }
    }

    /// Storage key of this stream's backlog for `token`. The lock slots
    /// live under the same key with `:X`, `:Y` and `:Z` appended.
    pub fn queue_key(self, token: &str) -> String {
        format!("__mpq_{token}{}", self.key_suffix())
    }

    pub fn route(self, config: &OutboxConfig) -> &str {
        match self {
            StreamKind::Events => &config.api_routes.events,
            StreamKind::People => &config.api_routes.people,
            StreamKind::Groups => &config.api_routes.groups,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Events => "events",
            StreamKind::People => "people",
            StreamKind::Groups => "groups",
        };
        f.write_str(name)
    }
}

/// Collaborators supplied by the host.
pub struct OutboxParts {
    pub storage: Arc<dyn StorageBackend>,
    pub transports: HashMap<StreamKind, Arc<dyn Transport>>,
    pub before_send: HashMap<StreamKind, BeforeSendHook>,
    pub reporter: ErrorReporter,
}

impl OutboxParts {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            transports: HashMap::new(),
            before_send: HashMap::new(),
            reporter: ErrorReporter::default(),
        }
    }

    #[must_use]
    pub fn transport(mut self, stream: StreamKind, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(stream, transport);
        self
    }

    #[must_use]
    pub fn before_send(mut self, stream: StreamKind, hook: BeforeSendHook) -> Self {
        self.before_send.insert(stream, hook);
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }
}

/// One queue and sender per stream over a shared backend, all wired to one
/// circuit breaker.
pub struct OutboxSystem {
    config: OutboxConfig,
    senders: HashMap<StreamKind, Arc<BatchSender>>,
    breaker: Arc<CircuitBreaker>,
}

impl OutboxSystem {
    /// Builds every stream that has a transport. Starts them when
    /// `batch.autostart` is set.
    #[instrument(skip(config, parts), fields(token = %config.token))]
    pub async fn new(config: OutboxConfig, parts: OutboxParts) -> Result<Self, ConfigError> {
        config.validate()?;
        let OutboxParts {
            storage,
            transports,
            mut before_send,
            reporter,
        } = parts;

        let probe = Arc::new(StorageProbe::new(storage.clone()));
        let breaker = Arc::new(CircuitBreaker::new(reporter.clone()));
        let mut senders = HashMap::new();

        for stream in StreamKind::ALL {
            let Some(transport) = transports.get(&stream).cloned() else {
                continue;
            };
            let queue = Arc::new(DurableQueue::new(
                stream.queue_key(&config.token),
                storage.clone(),
                probe.clone(),
                config.queue.clone(),
                config.lock,
                reporter.clone(),
            ));
            let sender = BatchSender::new(
                stream.to_string(),
                queue,
                transport,
                config.batch.clone(),
                SenderHooks {
                    before_send: before_send.remove(&stream),
                    reporter: reporter.clone(),
                    breaker: Some(breaker.clone()),
                },
            );
            senders.insert(stream, sender);
        }
        info!(streams = senders.len(), "outbox system ready");

        let system = Self {
            config,
            senders,
            breaker,
        };
        if system.config.batch.autostart {
            system.start_all().await;
        }
        Ok(system)
    }

    /// Wires each configured stream to a reqwest transport at
    /// `<api_host>/<route>`.
    #[cfg(feature = "http")]
    pub async fn with_http(config: OutboxConfig, parts: OutboxParts) -> Result<Self, ConfigError> {
        use crate::capabilities::http::HttpTransport;

        config.validate()?;
        let host = config.api_host_url()?;
        let mut parts = parts;
        for stream in StreamKind::ALL {
            let endpoint = host
                .join(stream.route(&config))
                .map_err(|e| ConfigError::invalid("api_routes", e.to_string()))?;
            let transport = HttpTransport::new(endpoint)
                .map_err(|e| ConfigError::invalid("api_host", e.to_string()))?;
            parts.transports.insert(stream, Arc::new(transport));
        }
        Self::new(config, parts).await
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn sender(&self, stream: StreamKind) -> Option<&Arc<BatchSender>> {
        self.senders.get(&stream)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn enqueue(&self, stream: StreamKind, payload: Value) -> Result<EntryId, OutboxError> {
        let sender = self
            .senders
            .get(&stream)
            .ok_or(OutboxError::StreamNotConfigured(stream))?;
        Ok(sender.enqueue(payload).await?)
    }

    pub async fn start_all(&self) {
        for stream in StreamKind::ALL {
            if let Some(sender) = self.senders.get(&stream) {
                sender.start().await;
            }
        }
    }

    /// Stops every sender and clears its queue.
    pub async fn stop_all(&self) {
        for stream in StreamKind::ALL {
            if let Some(sender) = self.senders.get(&stream) {
                sender.stop();
                if let Err(e) = sender.clear().await {
                    warn!(stream = %stream, error = %e, "failed to clear queue");
                }
            }
        }
    }

    pub async fn flush_all(&self, options: FlushOptions) {
        for stream in StreamKind::ALL {
            if let Some(sender) = self.senders.get(&stream) {
                sender.flush(options).await;
            }
        }
    }
}
