//! Durable chunk spool: one file per sealed chunk.
//!
//! When a buffer path is configured, every sealed chunk is written to the
//! spool right after it is sealed and removed once it has been flushed (or
//! dropped as corrupt). Chunks still on disk at startup are recovered into
//! the flush queue, which gives at-least-once delivery across restarts.
//!
//! # File Layout
//!
//! ```text
//! spool_dir/
//! ├── 00000000000000000001.0.5c1b2e73.chunk   <- id 1, bucket 0, crc32 of the tag
//! ├── 00000000000000000002.60.5c1b2e73.chunk
//! └── ...
//! ```
//!
//! The file name is `{id:020}.{bucket}.{crc32(tag):08x}.chunk`, so its length
//! does not depend on the tag. The partition key itself lives in the header:
//!
//! ```text
//! +----------------------------------------------------------------+
//! | magic "RPCK" (4) | version u16 (2) | flags u16 (2)               |
//! | id u64 (8) | bucket i64 (8) | records u64 (8)                   |
//! | body crc32 u32 (4) | tag_len u64 (8)                           |
//! +----------------------------------------------------------------+
//! | tag (tag_len bytes, UTF-8)                                      |
//! +----------------------------------------------------------------+
//! | body: the chunk's length-delimited records, byte for byte       |
//! +----------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian. Files are written under a `.tmp` name
//! and renamed into place, so a crash never leaves a half-written `.chunk`
//! file behind. Files that fail validation at recovery are renamed to
//! `.corrupt` and left for the operator.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, error, warn};

use crate::chunk::SealedChunk;
use crate::error::{Result, SpoolError};
use crate::partition::PartitionKey;

/// Extension of committed chunk files.
const CHUNK_EXTENSION: &str = "chunk";

/// Extension of files still being written.
const TEMP_EXTENSION: &str = "tmp";

/// Extension given to chunk files that failed validation.
pub const CORRUPT_EXTENSION: &str = "corrupt";

/// Magic bytes identifying a chunk file.
const CHUNK_MAGIC: [u8; 4] = *b"RPCK";

/// Current chunk file format version.
const CHUNK_VERSION: u16 = 1;

/// Size of the fixed part of the header, before the tag.
const HEADER_SIZE: usize = 44;

/// Header of a chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkHeader {
    id: u64,
    key: PartitionKey,
    records: u64,
    checksum: u32,
}

impl ChunkHeader {
    fn for_chunk(chunk: &SealedChunk) -> Self {
        Self {
            id: chunk.id(),
            key: chunk.key().clone(),
            records: chunk.record_count() as u64,
            checksum: crc32fast::hash(chunk.data()),
        }
    }

    /// Serializes the header, tag included.
    fn encode(&self) -> Vec<u8> {
        let tag = self.key.tag.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_SIZE + tag.len());
        buf.extend_from_slice(&CHUNK_MAGIC);
        buf.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.key.bucket.to_le_bytes());
        buf.extend_from_slice(&self.records.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&(tag.len() as u64).to_le_bytes());
        buf.extend_from_slice(tag);
        buf
    }

    /// Parses a header from the start of `bytes`. Returns the header and the
    /// offset of the body.
    fn decode(bytes: &[u8]) -> std::result::Result<(Self, usize), String> {
        let mut reader = HeaderReader { bytes, at: 0 };

        let magic: [u8; 4] = reader.take()?;
        if magic != CHUNK_MAGIC {
            return Err(format!(
                "invalid magic bytes: expected {CHUNK_MAGIC:?}, found {magic:?}"
            ));
        }
        let version = u16::from_le_bytes(reader.take()?);
        if version != CHUNK_VERSION {
            return Err(format!(
                "unsupported version: expected {CHUNK_VERSION}, found {version}"
            ));
        }
        let _flags: [u8; 2] = reader.take()?;

        let id = u64::from_le_bytes(reader.take()?);
        let bucket = i64::from_le_bytes(reader.take()?);
        let records = u64::from_le_bytes(reader.take()?);
        let checksum = u32::from_le_bytes(reader.take()?);
        let tag_len = usize::try_from(u64::from_le_bytes(reader.take()?))
            .map_err(|_| "tag length does not fit in memory".to_string())?;

        let tag = reader.slice(tag_len)?;
        let tag = std::str::from_utf8(tag)
            .map_err(|e| format!("tag is not valid UTF-8: {e}"))?
            .to_string();

        let header = Self {
            id,
            key: PartitionKey::new(tag, bucket),
            records,
            checksum,
        };
        Ok((header, reader.at))
    }
}

/// Bounds-checked cursor over header bytes.
struct HeaderReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> HeaderReader<'a> {
    fn slice(&mut self, len: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .at
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| format!("header truncated at byte {}", self.at))?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn take<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let slice = self.slice(N)?;
        let mut out = [0; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

/// A directory holding one file per sealed chunk.
#[derive(Debug, Clone)]
pub struct ChunkSpool {
    dir: PathBuf,
}

impl ChunkSpool {
    /// Opens a spool directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::DirectoryAccess`] if the directory cannot be
    /// created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| SpoolError::DirectoryAccess {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    /// Returns the spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path used for a chunk.
    pub fn path_for(&self, chunk: &SealedChunk) -> PathBuf {
        self.dir.join(file_name(chunk.id(), chunk.key()))
    }

    /// Writes a sealed chunk to its file.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::WriteFailed`] if the file cannot be written,
    /// synced or renamed into place.
    pub fn persist(&self, chunk: &SealedChunk) -> Result<PathBuf> {
        let path = self.path_for(chunk);
        let temp = path.with_extension(TEMP_EXTENSION);
        let header = ChunkHeader::for_chunk(chunk).encode();

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&header)?;
            file.write_all(chunk.data())?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&temp);
            return Err(SpoolError::WriteFailed { path, source: e }.into());
        }

        debug!(chunk_id = chunk.id(), path = %path.display(), "spooled chunk");
        Ok(path)
    }

    /// Deletes a chunk's file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::RemoveFailed`] if the file exists but cannot be
    /// removed.
    pub fn remove(&self, chunk: &SealedChunk) -> Result<()> {
        let path = self.path_for(chunk);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::RemoveFailed { path, source: e }.into()),
        }
    }

    /// Loads every committed chunk file, ordered by chunk id.
    ///
    /// Leftover temporary files are deleted. Files that fail header or
    /// checksum validation are renamed to `.corrupt` and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError`] if the directory cannot be listed or a chunk
    /// file cannot be opened or mapped.
    pub fn recover(&self) -> Result<Vec<SealedChunk>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| SpoolError::DirectoryAccess {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut chunks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SpoolError::DirectoryAccess {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();

            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXTENSION) => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), "failed to remove stray temp file: {e}");
                    }
                    continue;
                }
                Some(CHUNK_EXTENSION) => {}
                _ => continue,
            }

            match read_chunk_file(&path) {
                Ok(chunk) => chunks.push(chunk),
                Err(crate::RedpubError::Spool(SpoolError::CorruptFile { reason, .. })) => {
                    error!(path = %path.display(), "quarantining corrupt chunk file: {reason}");
                    if let Err(e) = fs::rename(&path, path.with_extension(CORRUPT_EXTENSION)) {
                        warn!(path = %path.display(), "failed to quarantine chunk file: {e}");
                    }
                }
                Err(e) => return Err(e),
            }
        }

        chunks.sort_by_key(SealedChunk::id);
        Ok(chunks)
    }
}

/// Builds the file name for a chunk.
pub fn file_name(id: u64, key: &PartitionKey) -> String {
    let tag_hash = crc32fast::hash(key.tag.as_bytes());
    format!("{id:020}.{}.{tag_hash:08x}.{CHUNK_EXTENSION}", key.bucket)
}

/// Reads and validates a chunk file. The returned chunk keeps the file
/// memory-mapped until it is dropped.
///
/// # Errors
///
/// - [`SpoolError::ReadFailed`] if the file cannot be opened or mapped.
/// - [`SpoolError::CorruptFile`] if the header is invalid or the body does
///   not match its checksum.
pub fn read_chunk_file(path: &Path) -> Result<SealedChunk> {
    let read_err = |e| SpoolError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let corrupt = |reason: String| SpoolError::CorruptFile {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(read_err)?;
    let len = file.metadata().map_err(read_err)?.len();
    if len < HEADER_SIZE as u64 {
        return Err(corrupt(format!("{len} bytes is shorter than the {HEADER_SIZE}-byte header")).into());
    }

    // SAFETY: chunk files are written under a temporary name and renamed
    // into place; nothing in this process writes to or truncates them
    // afterwards. The file is only unlinked, which leaves the mapping valid.
    let map = unsafe { Mmap::map(&file) }.map_err(read_err)?;

    let (header, offset) = ChunkHeader::decode(&map).map_err(corrupt)?;
    let checksum = crc32fast::hash(&map[offset..]);
    if checksum != header.checksum {
        return Err(corrupt(format!(
            "body checksum {checksum:08x} does not match header {:08x}",
            header.checksum
        ))
        .into());
    }
    let records = usize::try_from(header.records)
        .map_err(|_| corrupt(format!("record count {} does not fit in memory", header.records)))?;

    SealedChunk::mapped(header.id, header.key, map, offset, records)
        .ok_or_else(|| corrupt("body offset past end of file".to_string()).into())
}
