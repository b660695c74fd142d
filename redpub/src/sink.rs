//! The sink: top-level handle with background flush threads.
//!
//! [`Sink::start`] wires a [`BufferManager`], a [`FlushController`] and a
//! [`Publisher`] together and spawns:
//!
//! - `flush.thread_count` flush threads, each repeatedly calling
//!   [`FlushController::flush_next`] and sleeping on the buffer's work
//!   signal when nothing is eligible;
//! - one enqueue thread that seals chunks past `chunk_max_age` every
//!   `flush.thread_interval`.
//!
//! [`Sink::shutdown`] stops the threads, seals every open chunk and drains
//! the queue before closing broker connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::buffer::{BufferManager, BufferStats};
use crate::config::SinkConfig;
use crate::connection::Connector;
use crate::error::{RedpubError, Result};
use crate::flush::{FlushController, FlushOutcome, FlushPhase};
use crate::partition::{ChannelTemplate, PartitionKey};
use crate::publisher::Publisher;
use crate::record::Record;

/// What happened during [`Sink::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Chunks flushed while draining.
    pub flushed_chunks: usize,
    /// Chunks discarded as corrupt while draining.
    pub discarded_chunks: usize,
    /// Keys left stalled after their retry budget ran out.
    pub stalled_keys: Vec<PartitionKey>,
    /// Chunks still queued (all belonging to stalled keys).
    pub remaining_chunks: usize,
    /// Bytes still buffered.
    pub remaining_bytes: u64,
}

impl ShutdownReport {
    /// Returns `true` if everything buffered was flushed.
    pub fn is_clean(&self) -> bool {
        self.remaining_chunks == 0 && self.remaining_bytes == 0
    }
}

/// A running buffered publisher.
///
/// # Example
///
/// ```rust
/// use redpub::{MemoryConnector, Sink, SinkConfig};
/// use serde_json::{Map, json};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryConnector::new();
/// let sink = Sink::start(SinkConfig::default(), broker.clone())?;
///
/// let mut fields = Map::new();
/// fields.insert("message".to_string(), json!("hello"));
/// sink.submit("app.log", 1_700_000_000, fields)?;
///
/// let report = sink.shutdown();
/// assert!(report.is_clean());
/// assert_eq!(broker.messages()[0].channel, "app.log");
/// # Ok(())
/// # }
/// ```
pub struct Sink<C: Connector + 'static> {
    config: SinkConfig,
    buffer: Arc<BufferManager>,
    controller: Arc<FlushController<C>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<C: Connector + 'static> Sink<C> {
    /// Validates `config`, recovers any spooled chunks and starts the
    /// background threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the spool cannot
    /// be opened or read, or a thread cannot be spawned.
    pub fn start(config: SinkConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let buffer = Arc::new(BufferManager::new(&config.buffer)?);
        let recovered = buffer.recover()?;

        let publisher = Publisher::new(
            ChannelTemplate::parse(&config.channel),
            config.format,
            config.flush.timeout,
        );
        let controller = Arc::new(FlushController::new(
            Arc::clone(&buffer),
            publisher,
            connector,
            config.flush.clone(),
        ));

        let mut sink = Self {
            config,
            buffer,
            controller,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };

        if let Err(e) = sink.spawn_threads() {
            sink.stop_threads();
            return Err(e);
        }

        info!(
            endpoint = %sink.config.endpoint(),
            channel = %sink.config.channel,
            flush_threads = sink.config.flush.thread_count,
            durable = sink.buffer.is_durable(),
            recovered,
            "sink started"
        );
        Ok(sink)
    }

    /// Returns the configuration the sink was started with.
    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Buffers one record.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`](crate::error::BufferError::Overflow)
    /// when the buffer is full; callers should back off, optionally call
    /// [`Sink::flush`], and resubmit. Other errors mean the record can never
    /// be accepted.
    pub fn submit(&self, tag: impl Into<String>, time: i64, fields: Map<String, Value>) -> Result<()> {
        self.submit_record(Record::new(tag, time, fields))
    }

    /// Buffers an already-built record, applying the configured injection.
    ///
    /// # Errors
    ///
    /// Same as [`Sink::submit`].
    pub fn submit_record(&self, mut record: Record) -> Result<()> {
        self.config.inject.apply(&mut record);
        self.buffer.ingest(&record)
    }

    /// Seals every open chunk and wakes the flush threads. Returns the
    /// number of chunks queued.
    pub fn flush(&self) -> usize {
        let queued = self.buffer.flush_all();
        self.buffer.wake_all();
        queued
    }

    /// Returns current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Returns the flush phase of `key`.
    pub fn phase(&self, key: &PartitionKey) -> FlushPhase {
        self.controller.phase(key)
    }

    /// Returns the keys whose retry budget is exhausted.
    pub fn stalled(&self) -> Vec<PartitionKey> {
        self.controller.stalled()
    }

    /// Gives a stalled key a fresh retry budget. Returns `false` if the key
    /// was not stalled.
    pub fn resume(&self, key: &PartitionKey) -> bool {
        self.controller.resume(key)
    }

    /// Stops the background threads, flushes everything that can be
    /// flushed and closes broker connections.
    ///
    /// Chunks of stalled keys are left in the buffer; with a spool they are
    /// recovered on the next start.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop_threads();

        self.buffer.flush_all();
        let outcomes = self.controller.drain();
        self.controller.close();

        let stats = self.buffer.stats();
        let report = ShutdownReport {
            flushed_chunks: outcomes.iter().filter(|o| o.is_flushed()).count(),
            discarded_chunks: outcomes
                .iter()
                .filter(|o| matches!(o, FlushOutcome::Corrupt { .. }))
                .count(),
            stalled_keys: self.controller.stalled(),
            remaining_chunks: stats.queued_chunks,
            remaining_bytes: stats.buffered_bytes,
        };

        if report.is_clean() {
            info!(flushed = report.flushed_chunks, "sink shut down cleanly");
        } else {
            warn!(
                flushed = report.flushed_chunks,
                stalled = report.stalled_keys.len(),
                remaining_chunks = report.remaining_chunks,
                remaining_bytes = report.remaining_bytes,
                "sink shut down with undelivered chunks"
            );
        }
        report
    }

    fn spawn_threads(&mut self) -> Result<()> {
        let interval = self.config.flush.thread_interval;

        for i in 0..self.config.flush.thread_count {
            let controller = Arc::clone(&self.controller);
            let stop = Arc::clone(&self.stop);
            let handle = spawn_named(format!("redpub-flush-{i}"), move || {
                flush_loop(&controller, &stop, interval);
            })?;
            self.threads.push(handle);
        }

        let buffer = Arc::clone(&self.buffer);
        let stop = Arc::clone(&self.stop);
        let handle = spawn_named("redpub-enqueue".to_string(), move || {
            enqueue_loop(&buffer, &stop, interval);
        })?;
        self.threads.push(handle);
        Ok(())
    }

    fn stop_threads(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.buffer.wake_all();
        for handle in &self.threads {
            handle.thread().unpark();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }
    }
}

impl<C: Connector + 'static> Drop for Sink<C> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop_threads();
            self.controller.close();
        }
    }
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| RedpubError::Spawn { name, source })
}

/// Flushes eligible chunks until stopped, sleeping on the buffer's work
/// signal (bounded by the next retry deadline) when idle.
fn flush_loop<C: Connector>(controller: &FlushController<C>, stop: &AtomicBool, interval: Duration) {
    while !stop.load(Ordering::Acquire) {
        let epoch = controller.buffer().epoch();
        if controller.flush_next().is_some() {
            continue;
        }

        let wait = controller
            .next_retry_in()
            .map_or(interval, |retry| retry.min(interval))
            .max(Duration::from_millis(1));
        controller.buffer().wait_for_work(epoch, wait);
    }
}

/// Seals aged-out chunks every `interval` until stopped.
fn enqueue_loop(buffer: &BufferManager, stop: &AtomicBool, interval: Duration) {
    while !stop.load(Ordering::Acquire) {
        buffer.seal_expired();
        thread::park_timeout(interval);
    }
}
