//! The buffer manager: open chunks per partition key plus the sealed queue.
//!
//! [`BufferManager`] owns all buffered data behind a single mutex. The ingest
//! path appends encoded records to the open chunk of their partition key and
//! seals chunks when they fill up or age out; the flush path takes sealed
//! chunks off the queue, and either releases them after a successful publish
//! or puts them back at the head of the queue.
//!
//! ```text
//!             ingest()                 seal            take_next()
//! record ──▶ open[key] (one per key) ──────▶ queue ────────────────▶ in flight
//!                                          ▲  (FIFO)                   │
//!                                          └──── requeue_front() ◀─────┤
//!                                                         release() ◀──┘
//! ```
//!
//! Buffered bytes count open, queued and in-flight chunks. Ingest is refused
//! with [`BufferError::Overflow`] once that total would pass
//! `total_limit_size`.
//!
//! With a spool, a sealed chunk enters the queue at once but is held back
//! from [`BufferManager::take_next`] until the caller that sealed it has
//! written it to disk. Spool writes happen after the lock is released; a
//! held chunk also holds back every later chunk of its key.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chunk::{Chunk, SealedChunk};
use crate::codec;
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};
use crate::partition::PartitionKey;
use crate::record::Record;
use crate::spool::ChunkSpool;

/// A point-in-time view of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Chunks still accepting records.
    pub open_chunks: usize,
    /// Sealed chunks waiting to be flushed.
    pub queued_chunks: usize,
    /// Bytes held by open, queued and in-flight chunks.
    pub buffered_bytes: u64,
}

/// A sealed chunk waiting in the queue.
#[derive(Debug)]
struct Queued {
    chunk: SealedChunk,
    /// Set while the chunk is being written to the spool.
    persisting: bool,
}

impl Queued {
    fn ready(chunk: SealedChunk) -> Self {
        Self {
            chunk,
            persisting: false,
        }
    }
}

/// Everything guarded by the buffer lock.
#[derive(Debug, Default)]
struct BufferState {
    open: HashMap<PartitionKey, Chunk>,
    queue: VecDeque<Queued>,
    total_bytes: u64,
    next_chunk_id: u64,
    /// Bumped whenever a chunk enters the queue.
    epoch: u64,
}

/// Accumulates records into chunks and queues sealed chunks for flushing.
#[derive(Debug)]
pub struct BufferManager {
    chunk_limit_size: u64,
    chunk_max_age: Duration,
    total_limit_size: u64,
    timekey_secs: i64,
    state: Mutex<BufferState>,
    work: Condvar,
    spool: Option<ChunkSpool>,
}

impl BufferManager {
    /// Creates a buffer manager.
    ///
    /// When `config.path` is set the spool directory is opened (created if
    /// needed), but nothing is loaded until [`BufferManager::recover`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the spool
    /// directory cannot be created.
    pub fn new(config: &BufferConfig) -> Result<Self> {
        config.validate()?;

        let spool = config.path.as_ref().map(ChunkSpool::open).transpose()?;

        Ok(Self {
            chunk_limit_size: config.chunk_limit_size,
            chunk_max_age: config.chunk_max_age,
            total_limit_size: config.total_limit_size,
            timekey_secs: config.timekey_secs(),
            state: Mutex::new(BufferState::default()),
            work: Condvar::new(),
            spool,
        })
    }

    /// Returns `true` if sealed chunks are written to disk.
    pub fn is_durable(&self) -> bool {
        self.spool.is_some()
    }

    /// Loads chunks left in the spool by a previous run into the queue.
    ///
    /// Recovered chunks keep their ids and are queued in id order; new
    /// chunks get ids after the highest recovered one. Returns the number of
    /// chunks recovered (always `0` without a spool).
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError`](crate::error::SpoolError) if the spool cannot
    /// be read.
    pub fn recover(&self) -> Result<usize> {
        let Some(spool) = &self.spool else {
            return Ok(0);
        };

        let chunks = spool.recover()?;
        let count = chunks.len();

        let mut state = self.lock();
        for chunk in chunks {
            state.next_chunk_id = state.next_chunk_id.max(chunk.id());
            state.total_bytes += chunk.len();
            state.queue.push_back(Queued::ready(chunk));
        }
        if count > 0 {
            state.epoch += 1;
            info!(
                chunks = count,
                bytes = state.total_bytes,
                dir = %spool.dir().display(),
                "recovered spooled chunks"
            );
            self.work.notify_all();
        }
        Ok(count)
    }

    /// Appends a record to the open chunk of its partition key.
    ///
    /// The record is encoded before the lock is taken. If the key's open
    /// chunk cannot take the record without growing past `chunk_limit_size`
    /// it is sealed first and a fresh chunk is started; a chunk that reaches
    /// the size or age limit after the append is sealed right away.
    ///
    /// # Errors
    ///
    /// - [`BufferError::RecordTooLarge`] if the encoded record alone exceeds
    ///   `chunk_limit_size`.
    /// - [`BufferError::Overflow`] if accepting the record would push the
    ///   buffered bytes past `total_limit_size`. Nothing is modified.
    /// - A codec error if the record cannot be encoded.
    pub fn ingest(&self, record: &Record) -> Result<()> {
        let key = PartitionKey::for_record(record, self.timekey_secs);
        let encoded = codec::encode(record)?;
        let len = encoded.len() as u64;

        if len > self.chunk_limit_size {
            return Err(BufferError::RecordTooLarge {
                size: len,
                limit: self.chunk_limit_size,
            }
            .into());
        }

        let mut sealed = Vec::new();
        let result = self.append_locked(&key, &encoded, &mut sealed);
        self.persist_sealed(sealed);
        result
    }

    fn append_locked(&self, key: &PartitionKey, encoded: &[u8], sealed: &mut Vec<SealedChunk>) -> Result<()> {
        let len = encoded.len() as u64;
        let mut state = self.lock();

        if state.total_bytes + len > self.total_limit_size {
            return Err(BufferError::Overflow {
                buffered: state.total_bytes,
                requested: len,
                limit: self.total_limit_size,
            }
            .into());
        }

        let rolls = state
            .open
            .get(key)
            .is_some_and(|chunk| chunk.would_overflow(len, self.chunk_limit_size));
        if rolls {
            self.seal_key(&mut state, key, sealed);
        }

        let seal_now = {
            let BufferState {
                open,
                next_chunk_id,
                total_bytes,
                ..
            } = &mut *state;
            let chunk = match open.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    *next_chunk_id += 1;
                    entry.insert(Chunk::new(*next_chunk_id, key.clone()))
                }
            };
            chunk.append(encoded)?;
            *total_bytes += len;
            chunk.should_seal(self.chunk_limit_size, self.chunk_max_age)
        };

        if seal_now {
            self.seal_key(&mut state, key, sealed);
        }
        Ok(())
    }

    /// Seals and queues every open chunk. Returns the number queued.
    pub fn flush_all(&self) -> usize {
        let mut sealed = Vec::new();
        let count = {
            let mut state = self.lock();
            let keys: Vec<PartitionKey> = state.open.keys().cloned().collect();
            keys.iter()
                .filter(|key| self.seal_key(&mut state, key, &mut sealed))
                .count()
        };
        self.persist_sealed(sealed);
        count
    }

    /// Seals and queues open chunks that reached `chunk_max_age`. Returns
    /// the number queued.
    pub fn seal_expired(&self) -> usize {
        let now = Instant::now();
        let mut sealed = Vec::new();
        let count = {
            let mut state = self.lock();
            let expired: Vec<PartitionKey> = state
                .open
                .values()
                .filter(|chunk| chunk.should_seal_at(now, self.chunk_limit_size, self.chunk_max_age))
                .map(|chunk| chunk.key().clone())
                .collect();
            expired
                .iter()
                .filter(|key| self.seal_key(&mut state, key, &mut sealed))
                .count()
        };
        self.persist_sealed(sealed);
        count
    }

    /// Removes and returns the oldest queued chunk whose key passes
    /// `eligible`.
    ///
    /// Eligibility is decided per key, so the chunk returned is always the
    /// head of its key's sequence. A key whose head is still being written
    /// to the spool is skipped.
    pub fn take_next(&self, mut eligible: impl FnMut(&PartitionKey) -> bool) -> Option<SealedChunk> {
        let mut state = self.lock();
        let position = {
            let mut held: Vec<&PartitionKey> = Vec::new();
            state.queue.iter().position(|entry| {
                let key = entry.chunk.key();
                if held.contains(&key) {
                    return false;
                }
                if entry.persisting {
                    held.push(key);
                    return false;
                }
                eligible(key)
            })?
        };
        state.queue.remove(position).map(|entry| entry.chunk)
    }

    /// Puts a chunk that failed to flush back at the head of the queue.
    pub fn requeue_front(&self, chunk: SealedChunk) {
        let mut state = self.lock();
        state.queue.push_front(Queued::ready(chunk));
        state.epoch += 1;
        self.work.notify_one();
    }

    /// Returns `true` if any queued chunk's key passes `predicate`.
    pub fn any_queued(&self, mut predicate: impl FnMut(&PartitionKey) -> bool) -> bool {
        self.lock().queue.iter().any(|entry| predicate(entry.chunk.key()))
    }

    /// Forgets a chunk taken with [`BufferManager::take_next`], freeing its
    /// bytes and deleting its spool file.
    pub fn release(&self, chunk: &SealedChunk) {
        {
            let mut state = self.lock();
            state.total_bytes = state.total_bytes.saturating_sub(chunk.len());
        }

        if let Some(spool) = &self.spool
            && let Err(e) = spool.remove(chunk)
        {
            warn!(chunk_id = chunk.id(), "failed to remove spooled chunk: {e}");
        }
    }

    /// Returns a counter that changes whenever work is queued.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Blocks until work is queued after `seen_epoch` or `timeout` elapses.
    ///
    /// Returns `true` if new work arrived.
    pub fn wait_for_work(&self, seen_epoch: u64, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .work
            .wait_timeout_while(state, timeout, |s| s.epoch == seen_epoch)
            .unwrap_or_else(PoisonError::into_inner);
        state.epoch != seen_epoch
    }

    /// Wakes every thread blocked in [`BufferManager::wait_for_work`].
    pub fn wake_all(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        self.work.notify_all();
    }

    /// Returns current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            open_chunks: state.open.len(),
            queued_chunks: state.queue.len(),
            buffered_bytes: state.total_bytes,
        }
    }

    /// Seals the open chunk for `key` and queues it. Returns `false` if
    /// there was no open chunk or it was empty.
    ///
    /// With a spool the chunk is queued as persisting and pushed onto
    /// `sealed`; the caller must hand `sealed` to
    /// [`BufferManager::persist_sealed`] once the lock is dropped.
    fn seal_key(&self, state: &mut BufferState, key: &PartitionKey, sealed: &mut Vec<SealedChunk>) -> bool {
        let Some(mut chunk) = state.open.remove(key) else {
            return false;
        };
        if chunk.is_empty() {
            return false;
        }

        let chunk = match chunk.seal() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(chunk_id = chunk.id(), "dropping chunk that failed to seal: {e}");
                state.total_bytes = state.total_bytes.saturating_sub(chunk.len());
                return false;
            }
        };

        debug!(
            chunk_id = chunk.id(),
            tag = %key.tag,
            bucket = key.bucket,
            records = chunk.record_count(),
            bytes = chunk.len(),
            "sealed chunk"
        );

        if self.spool.is_some() {
            sealed.push(chunk.clone());
            state.queue.push_back(Queued {
                chunk,
                persisting: true,
            });
        } else {
            state.queue.push_back(Queued::ready(chunk));
            state.epoch += 1;
            self.work.notify_one();
        }
        true
    }

    /// Writes freshly sealed chunks to the spool, then makes them available
    /// to [`BufferManager::take_next`]. Must be called without the lock.
    ///
    /// A chunk that cannot be written stays queued in memory only.
    fn persist_sealed(&self, sealed: Vec<SealedChunk>) {
        let Some(spool) = &self.spool else {
            return;
        };
        if sealed.is_empty() {
            return;
        }

        for chunk in &sealed {
            if let Err(e) = spool.persist(chunk) {
                warn!(
                    chunk_id = chunk.id(),
                    tag = %chunk.key().tag,
                    bucket = chunk.key().bucket,
                    "keeping chunk in memory only: {e}"
                );
            }
        }

        let mut state = self.lock();
        for entry in state.queue.iter_mut().filter(|entry| entry.persisting) {
            if sealed.iter().any(|chunk| chunk.id() == entry.chunk.id()) {
                entry.persisting = false;
            }
        }
        state.epoch += 1;
        self.work.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
