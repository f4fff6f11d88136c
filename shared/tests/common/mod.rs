#![allow(dead_code)]

use async_trait::async_trait;
use beacon_outbox::capabilities::{RequestOptions, StorageBackend};
use beacon_outbox::{
    BatchConfig, BatchResponse, BatchSender, DurableQueue, ErrorReporter, LockConfig,
    MemoryStorage, QueueConfig, SenderHooks, StorageProbe, Transport, TransportKind,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const EVENTS_KEY: &str = "__mpq_tok_ev";

/// Collector stand-in: replays scripted responses (then succeeds) and keeps
/// every batch it was handed.
#[derive(Default)]
pub struct RecordingTransport {
    responses: Mutex<VecDeque<BatchResponse>>,
    batches: Mutex<Vec<(Vec<Value>, TransportKind)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(responses: impl IntoIterator<Item = BatchResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|(payloads, _)| payloads.clone())
            .collect()
    }

    pub fn delivered(&self) -> Vec<Value> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payloads: &[Value], options: &RequestOptions) -> BatchResponse {
        self.batches
            .lock()
            .unwrap()
            .push((payloads.to_vec(), options.kind));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(BatchResponse::ok)
    }
}

/// One execution context's queue over the shared storage.
pub fn context_queue(storage: &MemoryStorage, queue: QueueConfig, lock: LockConfig) -> Arc<DurableQueue> {
    let backend: Arc<dyn StorageBackend> = Arc::new(storage.clone());
    let probe = Arc::new(StorageProbe::new(backend.clone()));
    Arc::new(DurableQueue::new(
        EVENTS_KEY,
        backend,
        probe,
        queue,
        lock,
        ErrorReporter::default(),
    ))
}

pub fn context_sender(
    storage: &MemoryStorage,
    transport: Arc<RecordingTransport>,
    config: BatchConfig,
) -> Arc<BatchSender> {
    BatchSender::new(
        "events",
        context_queue(storage, QueueConfig::default(), LockConfig::default()),
        transport,
        config,
        SenderHooks::default(),
    )
}
