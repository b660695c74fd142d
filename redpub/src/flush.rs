//! The flush controller: per-key state machine, retries and connection pool.
//!
//! Each partition key moves through four phases:
//!
//! ```text
//!          take_next               publish ok
//!   Idle ────────────▶ Flushing ──────────────▶ Idle
//!                        │  ▲
//!        publish failed  │  │ backoff elapsed
//!        (within budget) ▼  │
//!                       Backoff
//!                        │
//!        budget exhausted│ (from Flushing)
//!                        ▼
//!                      Stalled ──resume()──▶ Idle
//! ```
//!
//! At most one chunk per key is ever `Flushing`, and a failed chunk goes
//! back to the head of the queue, so a key's chunks are published strictly
//! in the order they were sealed. A key that is backing off or stalled only
//! blocks its own chunks.
//!
//! Lock order is always the key-state map first, then the buffer lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::buffer::BufferManager;
use crate::chunk::SealedChunk;
use crate::codec;
use crate::config::FlushConfig;
use crate::connection::{Connection, Connector};
use crate::error::{RedpubError, Result};
use crate::partition::PartitionKey;
use crate::publisher::Publisher;

/// Poll interval used by [`FlushController::drain`] when no retry deadline
/// is pending.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Where a partition key is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPhase {
    /// No chunk of this key is in flight.
    #[default]
    Idle,
    /// A chunk of this key is being published.
    Flushing,
    /// The last attempt failed; the head chunk waits for its retry deadline.
    Backoff,
    /// The retry budget is exhausted; the head chunk waits for
    /// [`FlushController::resume`].
    Stalled,
}

/// The result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every record was published and the chunk released.
    Flushed {
        /// Chunk id.
        chunk_id: u64,
        /// Partition key.
        key: PartitionKey,
        /// Records published.
        records: usize,
    },
    /// Publishing failed; the chunk will be retried after `delay`.
    Retrying {
        /// Chunk id.
        chunk_id: u64,
        /// Partition key.
        key: PartitionKey,
        /// Consecutive failures so far.
        failures: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Publishing failed and the retry budget is spent; the key is stalled.
    Exhausted {
        /// Chunk id.
        chunk_id: u64,
        /// Partition key.
        key: PartitionKey,
        /// Consecutive failures.
        failures: u32,
    },
    /// The chunk could not be decoded and was discarded.
    Corrupt {
        /// Chunk id.
        chunk_id: u64,
        /// Partition key.
        key: PartitionKey,
        /// Decoder error.
        reason: String,
    },
}

impl FlushOutcome {
    /// Returns the partition key the outcome refers to.
    pub fn key(&self) -> &PartitionKey {
        match self {
            Self::Flushed { key, .. }
            | Self::Retrying { key, .. }
            | Self::Exhausted { key, .. }
            | Self::Corrupt { key, .. } => key,
        }
    }

    /// Returns `true` for [`FlushOutcome::Flushed`].
    pub fn is_flushed(&self) -> bool {
        matches!(self, Self::Flushed { .. })
    }
}

#[derive(Debug, Default)]
struct KeyState {
    phase: FlushPhase,
    failures: u32,
    retry_at: Option<Instant>,
}

impl KeyState {
    fn is_eligible(&self, now: Instant) -> bool {
        match self.phase {
            FlushPhase::Idle => true,
            FlushPhase::Backoff => self.retry_at.is_none_or(|at| at <= now),
            FlushPhase::Flushing | FlushPhase::Stalled => false,
        }
    }
}

/// Takes sealed chunks off the buffer and publishes them.
///
/// All methods take `&self`; any number of threads may call
/// [`FlushController::flush_next`] concurrently.
pub struct FlushController<C: Connector> {
    buffer: Arc<BufferManager>,
    publisher: Publisher,
    connector: C,
    policy: FlushConfig,
    /// Keys absent from the map are idle.
    keys: Mutex<HashMap<PartitionKey, KeyState>>,
    pool: Mutex<Vec<C::Connection>>,
}

impl<C: Connector> FlushController<C> {
    /// Creates a controller draining `buffer` through `connector`.
    pub fn new(buffer: Arc<BufferManager>, publisher: Publisher, connector: C, policy: FlushConfig) -> Self {
        Self {
            buffer,
            publisher,
            connector,
            policy,
            keys: Mutex::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Returns the buffer this controller drains.
    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    /// Flushes the oldest chunk whose key is idle or due for a retry.
    ///
    /// Returns `None` if no queued chunk is eligible right now.
    pub fn flush_next(&self) -> Option<FlushOutcome> {
        let now = Instant::now();
        let chunk = {
            let mut keys = self.lock_keys();
            let chunk = self
                .buffer
                .take_next(|key| keys.get(key).is_none_or(|state| state.is_eligible(now)))?;
            keys.entry(chunk.key().clone()).or_default().phase = FlushPhase::Flushing;
            chunk
        };
        Some(self.attempt_flush(chunk))
    }

    /// Flushes every chunk that is eligible now. Chunks that fail are left
    /// backing off or stalled.
    pub fn flush_ready(&self) -> Vec<FlushOutcome> {
        std::iter::from_fn(|| self.flush_next()).collect()
    }

    /// Flushes until nothing is queued except chunks of stalled keys,
    /// sleeping through retry backoffs.
    pub fn drain(&self) -> Vec<FlushOutcome> {
        let mut outcomes = Vec::new();
        loop {
            outcomes.extend(self.flush_ready());

            let pending = {
                let keys = self.lock_keys();
                self.buffer.any_queued(|key| {
                    keys.get(key)
                        .is_none_or(|state| state.phase != FlushPhase::Stalled)
                })
            };
            if !pending {
                return outcomes;
            }

            std::thread::sleep(self.next_retry_in().unwrap_or(DRAIN_POLL).max(Duration::from_millis(1)));
        }
    }

    /// Returns the time until the earliest pending retry, if any key is
    /// backing off.
    pub fn next_retry_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock_keys()
            .values()
            .filter(|state| state.phase == FlushPhase::Backoff)
            .filter_map(|state| state.retry_at)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    /// Returns the current phase of `key`.
    pub fn phase(&self, key: &PartitionKey) -> FlushPhase {
        self.lock_keys().get(key).map_or(FlushPhase::Idle, |state| state.phase)
    }

    /// Returns the keys whose retry budget is exhausted, sorted.
    pub fn stalled(&self) -> Vec<PartitionKey> {
        let mut stalled: Vec<PartitionKey> = self
            .lock_keys()
            .iter()
            .filter(|(_, state)| state.phase == FlushPhase::Stalled)
            .map(|(key, _)| key.clone())
            .collect();
        stalled.sort();
        stalled
    }

    /// Returns a stalled key to idle with a fresh retry budget.
    ///
    /// Returns `false` if the key was not stalled.
    pub fn resume(&self, key: &PartitionKey) -> bool {
        let mut keys = self.lock_keys();
        if keys.get(key).is_none_or(|state| state.phase != FlushPhase::Stalled) {
            return false;
        }
        keys.remove(key);
        drop(keys);

        debug!(tag = %key.tag, bucket = key.bucket, "resumed stalled key");
        self.buffer.wake_all();
        true
    }

    /// Closes every pooled connection.
    pub fn close(&self) {
        let connections = std::mem::take(&mut *self.lock_pool());
        let count = connections.len();
        for connection in connections {
            connection.close();
        }
        if count > 0 {
            debug!(connections = count, "closed broker connections");
        }
    }

    /// Decodes and publishes one chunk already marked `Flushing`.
    fn attempt_flush(&self, chunk: SealedChunk) -> FlushOutcome {
        let chunk_id = chunk.id();
        let key = chunk.key().clone();

        let records = match codec::decode_chunk(chunk.data()) {
            Ok(records) => records,
            Err(e) => {
                error!(chunk_id, tag = %key.tag, bucket = key.bucket, "discarding corrupt chunk: {e}");
                self.buffer.release(&chunk);
                self.lock_keys().remove(&key);
                return FlushOutcome::Corrupt {
                    chunk_id,
                    key,
                    reason: e.to_string(),
                };
            }
        };

        match self.with_connection(|connection| self.publisher.publish(&records, connection)) {
            Ok(published) => {
                self.buffer.release(&chunk);
                self.lock_keys().remove(&key);
                debug!(chunk_id, tag = %key.tag, bucket = key.bucket, records = published, "flushed chunk");
                FlushOutcome::Flushed {
                    chunk_id,
                    key,
                    records: published,
                }
            }
            Err(e) => self.record_failure(chunk, &e),
        }
    }

    /// Puts a failed chunk back at the head of its key and moves the key to
    /// `Backoff` or `Stalled`.
    fn record_failure(&self, chunk: SealedChunk, cause: &RedpubError) -> FlushOutcome {
        let chunk_id = chunk.id();
        let key = chunk.key().clone();

        let mut keys = self.lock_keys();
        let state = keys.entry(key.clone()).or_default();
        state.failures += 1;
        let failures = state.failures;

        if failures > self.policy.max_retries {
            state.phase = FlushPhase::Stalled;
            state.retry_at = None;
            self.buffer.requeue_front(chunk);
            error!(
                chunk_id,
                tag = %key.tag,
                bucket = key.bucket,
                failures,
                "retries exhausted, key stalled: {cause}"
            );
            FlushOutcome::Exhausted {
                chunk_id,
                key,
                failures,
            }
        } else {
            let delay = self.policy.backoff(failures);
            state.phase = FlushPhase::Backoff;
            state.retry_at = Some(Instant::now() + delay);
            self.buffer.requeue_front(chunk);
            warn!(
                chunk_id,
                tag = %key.tag,
                bucket = key.bucket,
                failures,
                "flush failed, retrying in {delay:?}: {cause}"
            );
            FlushOutcome::Retrying {
                chunk_id,
                key,
                failures,
                delay,
            }
        }
    }

    /// Runs `f` on a pooled connection, opening one if the pool is empty.
    /// The connection is returned to the pool on success and closed on
    /// failure.
    fn with_connection<T>(&self, f: impl FnOnce(&mut C::Connection) -> Result<T>) -> Result<T> {
        let pooled = self.lock_pool().pop();
        let mut connection = match pooled {
            Some(connection) => connection,
            None => {
                let connection = self.connector.open()?;
                debug!("opened broker connection");
                connection
            }
        };

        match f(&mut connection) {
            Ok(value) => {
                self.lock_pool().push(connection);
                Ok(value)
            }
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    fn lock_keys(&self) -> MutexGuard<'_, HashMap<PartitionKey, KeyState>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pool(&self) -> MutexGuard<'_, Vec<C::Connection>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
