//! Integration tests for partitioning, chunking and capacity limits.
//!
//! These drive the buffer manager and flush controller directly (no
//! background threads) so every step is deterministic.

use std::sync::Arc;
use std::time::Duration;

use redpub::codec::{self, PayloadFormat};
use redpub::config::{BufferConfig, FlushConfig};
use redpub::{
    BufferManager, ChannelTemplate, FlushController, MemoryConnector, PartitionKey, Publisher, Record,
};
use serde_json::{Map, Value, json};

fn record(tag: &str, time: i64, seq: i64) -> Record {
    let mut fields = Map::new();
    fields.insert("seq".to_string(), json!(seq));
    Record::new(tag, time, fields)
}

fn setup(
    buffer: BufferConfig,
    template: &str,
) -> (FlushController<MemoryConnector>, MemoryConnector) {
    let broker = MemoryConnector::new();
    let controller = FlushController::new(
        Arc::new(BufferManager::new(&buffer).unwrap()),
        Publisher::new(ChannelTemplate::parse(template), PayloadFormat::Envelope, Duration::from_secs(1)),
        broker.clone(),
        FlushConfig::default(),
    );
    (controller, broker)
}

#[test]
fn test_same_tag_same_bucket_flushes_as_one_batch() {
    let (controller, broker) = setup(
        BufferConfig {
            chunk_max_age: Duration::from_millis(50),
            ..BufferConfig::default()
        },
        "events.${tag}",
    );

    controller.buffer().ingest(&record("app.log", 10, 0)).unwrap();
    controller.buffer().ingest(&record("app.log", 15, 1)).unwrap();
    assert_eq!(controller.buffer().stats().open_chunks, 1);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(controller.buffer().seal_expired(), 1);

    let outcomes = controller.flush_ready();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].key(), &PartitionKey::new("app.log", 0));

    let batches = broker.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert!(batches[0].iter().all(|m| m.channel == "events.app.log"));

    let times: Vec<i64> = batches[0]
        .iter()
        .map(|m| serde_json::from_str::<Value>(&m.payload).unwrap()["time"].as_i64().unwrap())
        .collect();
    assert_eq!(times, vec![10, 15]);
}

#[test]
fn test_partitioning_by_tag_and_bucket() {
    let (controller, _broker) = setup(BufferConfig::default(), "${tag}");
    let buffer = controller.buffer();

    buffer.ingest(&record("a", 0, 0)).unwrap();
    buffer.ingest(&record("a", 59, 1)).unwrap();
    buffer.ingest(&record("a", 60, 2)).unwrap();
    buffer.ingest(&record("b", 0, 3)).unwrap();
    buffer.ingest(&record("a", -1, 4)).unwrap();

    assert_eq!(buffer.stats().open_chunks, 4);

    buffer.flush_all();
    let mut keys = Vec::new();
    while let Some(chunk) = buffer.take_next(|_| true) {
        keys.push(chunk.key().clone());
        buffer.release(&chunk);
    }
    keys.sort();
    assert_eq!(
        keys,
        vec![
            PartitionKey::new("a", -60),
            PartitionKey::new("a", 0),
            PartitionKey::new("a", 60),
            PartitionKey::new("b", 0),
        ]
    );
}

#[test]
fn test_records_publish_in_ingest_order_across_chunks() {
    let sample_len = codec::encode(&record("app", 0, 100)).unwrap().len() as u64;
    let (controller, broker) = setup(
        BufferConfig {
            chunk_limit_size: sample_len * 3,
            chunk_max_age: Duration::from_secs(3600),
            ..BufferConfig::default()
        },
        "${tag}",
    );

    for seq in 100..120 {
        controller.buffer().ingest(&record("app", 0, seq)).unwrap();
    }
    controller.buffer().flush_all();

    let outcomes = controller.flush_ready();
    assert!(outcomes.len() > 1);
    assert!(outcomes.iter().all(|o| o.is_flushed()));

    let seqs: Vec<i64> = broker
        .messages()
        .iter()
        .map(|m| serde_json::from_str::<Value>(&m.payload).unwrap()["record"]["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (100..120).collect::<Vec<_>>());
}

#[test]
fn test_overflow_is_backpressure_until_flushed() {
    let sample_len = codec::encode(&record("app", 0, 0)).unwrap().len() as u64;
    let (controller, broker) = setup(
        BufferConfig {
            chunk_limit_size: sample_len * 2,
            total_limit_size: sample_len * 4,
            chunk_max_age: Duration::from_secs(3600),
            ..BufferConfig::default()
        },
        "${tag}",
    );
    let buffer = controller.buffer();

    for seq in 0..4 {
        buffer.ingest(&record("app", 0, seq)).unwrap();
    }
    let err = buffer.ingest(&record("app", 0, 4)).unwrap_err();
    assert!(err.is_overflow());
    assert_eq!(buffer.stats().buffered_bytes, sample_len * 4);

    // Sealed chunks stay counted until they are flushed.
    buffer.flush_all();
    assert!(buffer.ingest(&record("app", 0, 4)).unwrap_err().is_overflow());

    controller.flush_ready();
    assert_eq!(broker.messages().len(), 4);
    buffer.ingest(&record("app", 0, 4)).unwrap();
}

#[test]
fn test_no_chunk_exceeds_limit() {
    let (controller, _broker) = setup(
        BufferConfig {
            chunk_limit_size: 256,
            chunk_max_age: Duration::from_secs(3600),
            ..BufferConfig::default()
        },
        "${tag}",
    );
    let buffer = controller.buffer();

    for seq in 0..200 {
        let mut fields = Map::new();
        fields.insert("pad".to_string(), json!("x".repeat((seq % 40) as usize)));
        buffer.ingest(&Record::new("app", 0, fields)).unwrap();
    }
    buffer.flush_all();

    let mut total = 0;
    while let Some(chunk) = buffer.take_next(|_| true) {
        assert!(chunk.len() <= 256, "chunk {} is {} bytes", chunk.id(), chunk.len());
        total += chunk.record_count();
        buffer.release(&chunk);
    }
    assert_eq!(total, 200);
}
