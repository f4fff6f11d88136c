mod common;

use beacon_outbox::{
    BatchConfig, BatchResponse, ErrorReporter, FileStorage, FlushOptions, MemoryStorage,
    OutboxConfig, OutboxParts, OutboxSystem, StreamKind,
};
use common::{context_sender, RecordingTransport, EVENTS_KEY};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn manual_config() -> BatchConfig {
    BatchConfig {
        autostart: false,
        ..BatchConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn three_entries_go_out_in_one_batch() {
    let storage = MemoryStorage::new();
    let transport = RecordingTransport::new();
    let sender = context_sender(&storage, transport.clone(), manual_config());

    for n in 1..=3 {
        sender.enqueue(json!({"event": "e", "n": n})).await.unwrap();
    }
    sender.flush(FlushOptions::default()).await;

    assert_eq!(transport.batches().len(), 1);
    assert_eq!(
        transport.delivered(),
        vec![
            json!({"event": "e", "n": 1}),
            json!({"event": "e", "n": 2}),
            json!({"event": "e", "n": 3}),
        ]
    );
    assert_eq!(sender.queue().local_len(), 0);
    assert_eq!(storage.snapshot()[EVENTS_KEY], json!([]));
    assert_eq!(sender.metrics().entries_delivered, 3);
}

#[tokio::test(start_paused = true)]
async fn unavailable_collector_doubles_interval_then_delivers() {
    let storage = MemoryStorage::new();
    let transport = RecordingTransport::scripted([BatchResponse::status(503)]);
    let sender = context_sender(&storage, transport.clone(), BatchConfig::default());
    sender.stop();

    sender.enqueue(json!({"event": "late"})).await.unwrap();
    sender.start().await;

    assert_eq!(transport.batches().len(), 1);
    assert_eq!(sender.flush_interval(), Duration::from_millis(10_000));
    assert_eq!(sender.queue().local_len(), 1);

    tokio::time::sleep(Duration::from_millis(10_001)).await;

    assert_eq!(transport.batches().len(), 2);
    assert_eq!(sender.queue().local_len(), 0);
    assert_eq!(sender.flush_interval(), Duration::from_millis(5_000));
}

#[tokio::test(start_paused = true)]
async fn breaker_stops_every_stream() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let reporter = ErrorReporter::new(Arc::new(move |report: &beacon_outbox::ErrorReport| {
        sink.lock().unwrap().push(report.message.clone());
    }));

    let events = RecordingTransport::new();
    let people = RecordingTransport::new();
    let parts = OutboxParts::new(Arc::new(MemoryStorage::new()))
        .transport(StreamKind::Events, events.clone())
        .transport(StreamKind::People, people.clone())
        .reporter(reporter);
    let mut config = OutboxConfig::new("tok", "https://api.example.com");
    config.batch.autostart = true;
    let system = OutboxSystem::new(config, parts).await.unwrap();

    system.enqueue(StreamKind::Events, json!({"event": "a"})).await.unwrap();
    system.enqueue(StreamKind::People, json!({"$set": {"a": 1}})).await.unwrap();

    system.breaker().trip("storage keeps rejecting removals").await;
    system.breaker().trip("second trip is ignored").await;

    for stream in [StreamKind::Events, StreamKind::People] {
        let sender = system.sender(stream).unwrap();
        assert!(sender.is_stopped());
        assert!(!sender.has_pending_flush());
    }
    system.flush_all(FlushOptions::default()).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(events.batches().is_empty());
    assert!(people.batches().is_empty());
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("storage keeps rejecting removals"));
}

#[tokio::test(start_paused = true)]
async fn page_unload_sends_with_beacon_and_keeps_entries() {
    let storage = MemoryStorage::new();
    let transport = RecordingTransport::new();
    let sender = context_sender(&storage, transport.clone(), manual_config());

    sender.enqueue(json!({"event": "closing"})).await.unwrap();
    sender.flush(FlushOptions { unloading: true }).await;

    assert_eq!(transport.delivered(), vec![json!({"event": "closing"})]);
    // unload sends are fire-and-forget; the entry stays for a later context
    assert_eq!(sender.queue().persisted_len().await.unwrap(), 1);
}

// Real clock: adoption waits on wall-clock deadlines.
#[tokio::test]
async fn backlog_on_disk_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OutboxConfig::new("tok", "https://api.example.com");
    config.batch.autostart = false;
    config.batch.flush_interval_ms = 50;

    let first = RecordingTransport::new();
    {
        let parts = OutboxParts::new(Arc::new(FileStorage::new(dir.path())))
            .transport(StreamKind::Events, first.clone());
        let system = OutboxSystem::new(config.clone(), parts).await.unwrap();
        system.enqueue(StreamKind::Events, json!({"event": "before crash"})).await.unwrap();
    }
    assert!(first.batches().is_empty());

    let second = RecordingTransport::new();
    let parts = OutboxParts::new(Arc::new(FileStorage::new(dir.path())))
        .transport(StreamKind::Events, second.clone());
    let system = OutboxSystem::new(config, parts).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    system.flush_all(FlushOptions::default()).await;

    assert_eq!(second.delivered(), vec![json!({"event": "before crash"})]);
    let sender = system.sender(StreamKind::Events).unwrap();
    assert_eq!(sender.queue().persisted_len().await.unwrap(), 0);
}
