//! Chunks: append-only accumulators of encoded records for one partition key.
//!
//! A [`Chunk`] is open while the buffer manager appends to it. Sealing takes
//! its bytes out and produces an immutable [`SealedChunk`] that is queued for
//! flushing; the open chunk then rejects every further append.
//!
//! ```text
//! open ──seal()──▶ sealed (queued) ──flush ok──▶ flushed (released)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::Mmap;

use crate::error::{BufferError, Result};
use crate::partition::PartitionKey;

/// An open chunk accepting appends for a single partition key.
#[derive(Debug)]
pub struct Chunk {
    /// Sequence number; lower ids were created earlier.
    id: u64,
    /// Partition key shared by every record in the chunk.
    key: PartitionKey,
    /// When the chunk was created (drives age-based sealing).
    created_at: Instant,
    /// Concatenated length-delimited records.
    data: Vec<u8>,
    /// Number of records appended.
    records: usize,
    /// Set once by [`Chunk::seal`].
    sealed: bool,
}

impl Chunk {
    /// Creates an empty open chunk created now.
    pub fn new(id: u64, key: PartitionKey) -> Self {
        Self::created_at(id, key, Instant::now())
    }

    /// Creates an empty open chunk with an explicit creation time.
    pub fn created_at(id: u64, key: PartitionKey, created_at: Instant) -> Self {
        Self {
            id,
            key,
            created_at,
            data: Vec::new(),
            records: 0,
            sealed: false,
        }
    }

    /// Returns the chunk's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the partition key.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Returns the number of bytes appended so far.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns `true` if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of records appended so far.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Returns `true` once the chunk has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns how long ago the chunk was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Appends one encoded record.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::ChunkSealed`] if the chunk was already sealed.
    pub fn append(&mut self, encoded: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(BufferError::ChunkSealed { chunk_id: self.id }.into());
        }
        self.data.extend_from_slice(encoded);
        self.records += 1;
        Ok(())
    }

    /// Returns `true` if appending `additional` bytes would push a non-empty
    /// chunk past `max_bytes`.
    pub fn would_overflow(&self, additional: u64, max_bytes: u64) -> bool {
        !self.is_empty() && self.len() + additional > max_bytes
    }

    /// Returns `true` if the chunk reached `max_bytes` or `max_age`.
    pub fn should_seal(&self, max_bytes: u64, max_age: Duration) -> bool {
        self.should_seal_at(Instant::now(), max_bytes, max_age)
    }

    /// Like [`Chunk::should_seal`], evaluated at `now`.
    pub fn should_seal_at(&self, now: Instant, max_bytes: u64, max_age: Duration) -> bool {
        self.len() >= max_bytes || now.saturating_duration_since(self.created_at) >= max_age
    }

    /// Seals the chunk, moving its contents into a [`SealedChunk`].
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::ChunkSealed`] if called more than once.
    pub fn seal(&mut self) -> Result<SealedChunk> {
        if self.sealed {
            return Err(BufferError::ChunkSealed { chunk_id: self.id }.into());
        }
        self.sealed = true;
        Ok(SealedChunk::from_parts(
            self.id,
            self.key.clone(),
            std::mem::take(&mut self.data),
            self.records,
        ))
    }
}

/// Backing storage of a sealed chunk. Clones share the bytes.
#[derive(Clone)]
enum ChunkData {
    /// Sealed in this process.
    Heap(Arc<[u8]>),
    /// Recovered from a spool file; the records start at `offset`.
    Mapped { map: Arc<Mmap>, offset: usize },
}

impl ChunkData {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(bytes) => &bytes[..],
            Self::Mapped { map, offset } => &map[*offset..],
        }
    }
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Heap(_) => "heap",
            Self::Mapped { .. } => "mapped",
        };
        write!(f, "{kind}({} bytes)", self.as_slice().len())
    }
}

/// An immutable chunk waiting to be flushed.
///
/// Cloning is cheap: clones share the encoded records.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    id: u64,
    key: PartitionKey,
    data: ChunkData,
    records: usize,
}

impl PartialEq for SealedChunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.key == other.key
            && self.records == other.records
            && self.data() == other.data()
    }
}

impl Eq for SealedChunk {}

impl SealedChunk {
    /// Builds a sealed chunk from its parts.
    pub fn from_parts(id: u64, key: PartitionKey, data: Vec<u8>, records: usize) -> Self {
        Self {
            id,
            key,
            data: ChunkData::Heap(data.into()),
            records,
        }
    }

    /// Builds a sealed chunk over a mapped spool file whose records start at
    /// `offset`. Returns `None` if `offset` is past the end of the map.
    pub(crate) fn mapped(id: u64, key: PartitionKey, map: Mmap, offset: usize, records: usize) -> Option<Self> {
        if offset > map.len() {
            return None;
        }
        Some(Self {
            id,
            key,
            data: ChunkData::Mapped {
                map: Arc::new(map),
                offset,
            },
            records,
        })
    }

    /// Returns `true` if the records are read from a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.data, ChunkData::Mapped { .. })
    }

    /// Returns the chunk's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the partition key.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Returns the encoded records.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Returns the size of the encoded records in bytes.
    pub fn len(&self) -> u64 {
        self.data().len() as u64
    }

    /// Returns `true` if the chunk holds no records.
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Returns the number of records in the chunk.
    pub fn record_count(&self) -> usize {
        self.records
    }
}
