//! Error types for the redpub buffered publisher.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all redpub operations.
///
/// Each variant wraps the error enum of one concern so callers can match on
/// the broad category (e.g. backpressure from the buffer) without caring
/// about the details.
#[derive(Error, Debug)]
pub enum RedpubError {
    /// Configuration is invalid or could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error on the ingest path (capacity, chunk state).
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Error encoding or decoding records.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error talking to the message broker.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Error reading or writing the durable chunk spool.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// A background thread could not be started.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// The thread name.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl RedpubError {
    /// Returns `true` if this error is the buffer's backpressure signal.
    ///
    /// Callers should slow down (or trigger a flush) and resubmit.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Buffer(BufferError::Overflow { .. }))
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A chunk key the partitioning relies on is missing.
    #[error("'{key}' in chunk_keys is required")]
    MissingChunkKey {
        /// The missing key.
        key: String,
    },

    /// A chunk key that cannot be used for partitioning.
    #[error("unsupported chunk key '{key}': only 'tag' and 'time' are supported")]
    UnsupportedChunkKey {
        /// The rejected key.
        key: String,
    },

    /// A duration setting is out of range or malformed.
    #[error("invalid duration for {name}: {reason}")]
    InvalidDuration {
        /// The setting name.
        name: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// A numeric limit is out of range.
    #[error("invalid {name}: {reason}")]
    InvalidLimit {
        /// The setting name.
        name: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors that can occur on the ingest path.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Accepting the record would push buffered bytes past the ceiling.
    #[error("buffer full: {buffered} bytes buffered + {requested} requested > limit {limit}")]
    Overflow {
        /// Bytes currently held by open, queued and in-flight chunks.
        buffered: u64,
        /// Encoded size of the rejected record.
        requested: u64,
        /// The configured ceiling.
        limit: u64,
    },

    /// A single record is larger than the chunk size limit.
    #[error("record of {size} bytes exceeds chunk limit of {limit} bytes")]
    RecordTooLarge {
        /// Encoded size of the record.
        size: u64,
        /// The configured chunk limit.
        limit: u64,
    },

    /// Append or seal on a chunk that was already sealed.
    ///
    /// This indicates a bug in the buffer manager.
    #[error("chunk {chunk_id} is already sealed")]
    ChunkSealed {
        /// The chunk sequence number.
        chunk_id: u64,
    },
}

/// Errors that can occur while encoding or decoding records.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A chunk's bytes do not parse as a sequence of encoded records.
    #[error("corrupt chunk at record {record}: {reason}")]
    CorruptChunk {
        /// Index of the record that failed to decode.
        record: usize,
        /// Description of the failure.
        reason: String,
    },

    /// The record nests values deeper than a chunk can hold and still be
    /// decoded.
    #[error("record nesting exceeds the limit of {limit} levels")]
    TooDeep {
        /// Maximum number of nested messages a record may need.
        limit: usize,
    },

    /// Protobuf encoding failed.
    #[error("failed to encode record: {source}")]
    Encode {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Rendering a record for the wire failed.
    #[error("failed to serialize record payload: {source}")]
    Serialize {
        /// The JSON serialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur when talking to the broker.
///
/// The flush controller treats every variant as transient: the whole batch
/// is retried with backoff.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Could not establish a connection.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// The `host:port` endpoint.
        endpoint: String,
        /// The client error.
        #[source]
        source: redis::RedisError,
    },

    /// The connection failed mid-batch.
    #[error("connection I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The batch did not complete within the caller's timeout.
    #[error("publish timed out after {timeout:?}")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
    },

    /// Authentication or database selection was rejected.
    #[error("authentication failed: {message}")]
    Auth {
        /// The server's error message.
        message: String,
    },

    /// The server answered a command with an error reply.
    #[error("server error: {message}")]
    Server {
        /// The server's error message.
        message: String,
    },

    /// The server sent something that is not a valid reply.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Description of what was unexpected.
        reason: String,
    },

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,

    /// Any other failure reported by the Redis client.
    #[error("redis client error: {source}")]
    Redis {
        /// The client error.
        #[source]
        source: redis::RedisError,
    },
}

/// Errors that can occur in the durable chunk spool.
#[derive(Error, Debug)]
pub enum SpoolError {
    /// The spool directory could not be created or listed.
    #[error("failed to access spool directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The spool directory.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A chunk file could not be written.
    #[error("failed to write chunk file '{}': {source}", path.display())]
    WriteFailed {
        /// The chunk file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A chunk file could not be read or mapped.
    #[error("failed to read chunk file '{}': {source}", path.display())]
    ReadFailed {
        /// The chunk file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A chunk file has a bad header or its body fails the checksum.
    #[error("corrupt chunk file '{}': {reason}", path.display())]
    CorruptFile {
        /// The chunk file path.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// A chunk file could not be removed.
    #[error("failed to remove chunk file '{}': {source}", path.display())]
    RemoveFailed {
        /// The chunk file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, RedpubError>`.
pub type Result<T> = std::result::Result<T, RedpubError>;
