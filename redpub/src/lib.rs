//! # redpub
//!
//! Buffered, chunked event forwarding to Redis pub/sub channels.
//!
//! redpub accepts a continuous stream of timestamped, tagged records,
//! groups them into chunks keyed by tag and time bucket, and publishes each
//! chunk as one pipelined batch of `PUBLISH` commands. The channel of every
//! record comes from a template such as `logs.${tag}`.
//!
//! ## Key Properties
//!
//! - Bounded memory: ingest returns an overflow error instead of growing
//!   past `total_limit_size`
//! - At-least-once delivery: failed chunks are retried with exponential
//!   backoff and never dropped silently
//! - Per-key ordering: a key's chunks publish strictly in creation order,
//!   one at a time
//! - Optional durability: sealed chunks can be spooled to disk and recovered
//!   after a restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redpub::{RedisConnector, Sink, SinkConfig};
//! use serde_json::{Map, json};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SinkConfig::from_json_str(r#"{
//!     "host": "127.0.0.1",
//!     "channel": "logs.${tag[-1]}",
//!     "buffer": { "timekey": "60s", "chunk_max_age": "5s" }
//! }"#)?;
//!
//! let sink = Sink::start(config.clone(), RedisConnector::from_config(&config))?;
//!
//! let mut fields = Map::new();
//! fields.insert("message".to_string(), json!("user logged in"));
//! sink.submit("web.auth", 1_700_000_000, fields)?;
//!
//! let report = sink.shutdown();
//! println!("flushed {} chunk(s)", report.flushed_chunks);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Sink`]: top-level handle; start, submit, flush, shutdown
//! - [`SinkConfig`]: serde configuration with defaults
//! - [`BufferManager`]: open chunks per [`PartitionKey`] and the sealed
//!   queue
//! - [`FlushController`]: per-key flush phases, retries, connection pool
//! - [`Connector`] / [`Connection`]: the broker seam, implemented by
//!   [`RedisConnector`] and [`MemoryConnector`]
//!
//! ## Modules
//!
//! - [`record`]: the record type and tag/time injection
//! - [`codec`]: binary chunk encoding and wire payloads
//! - [`partition`]: partition keys and channel templates
//! - [`chunk`]: open and sealed chunks
//! - [`buffer`]: the buffer manager
//! - [`spool`]: durable chunk files
//! - [`flush`]: the flush controller
//! - [`publisher`]: chunk-to-batch publishing
//! - [`connection`]: the broker capability and in-memory broker
//! - [`redis_client`]: the Redis client
//! - [`sink`]: lifecycle and background threads
//! - [`config`]: configuration types
//! - [`error`]: error types

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flush;
pub mod partition;
pub mod publisher;
pub mod record;
pub mod redis_client;
pub mod sink;
pub mod spool;

pub use buffer::{BufferManager, BufferStats};
pub use codec::PayloadFormat;
pub use config::{BufferConfig, FlushConfig, SinkConfig};
pub use connection::{Connection, Connector, MemoryConnector, Message};
pub use error::{RedpubError, Result};
pub use flush::{FlushController, FlushOutcome, FlushPhase};
pub use partition::{ChannelTemplate, PartitionKey};
pub use publisher::Publisher;
pub use record::{InjectConfig, Record};
pub use redis_client::RedisConnector;
pub use sink::{ShutdownReport, Sink};
