//! Configuration types for the redpub sink.
//!
//! Configuration is plain serde data, usually loaded from a JSON file.
//! Every field has a default, so `{}` is a valid configuration that
//! publishes to `localhost:6379` on the channel named after each record's
//! tag.
//!
//! # Example
//!
//! ```rust
//! use redpub::config::SinkConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SinkConfig::from_json_str(r#"{
//!     "host": "redis.internal",
//!     "channel": "logs.${tag}",
//!     "buffer": { "timekey": "5m", "chunk_max_age": "10s" },
//!     "flush": { "max_retries": 5, "retry_backoff": "500ms" }
//! }"#)?;
//!
//! assert_eq!(config.buffer.timekey_secs(), 300);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::PayloadFormat;
use crate::error::{ConfigError, Result};
use crate::record::InjectConfig;

/// Chunk keys every configuration must partition by.
const REQUIRED_CHUNK_KEYS: [&str; 2] = ["tag", "time"];

/// Top-level configuration for a [`Sink`](crate::sink::Sink).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    /// Redis host name or address.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Database index selected after connecting.
    pub db_number: u32,
    /// Password sent with `AUTH`, if any.
    pub password: Option<String>,
    /// Channel template; `${tag}` is replaced by the record tag.
    pub channel: String,
    /// How records are rendered as message payloads.
    pub format: PayloadFormat,
    /// Chunking and capacity settings.
    pub buffer: BufferConfig,
    /// Flush scheduling and retry settings.
    pub flush: FlushConfig,
    /// Fields copied into each record before buffering.
    pub inject: InjectConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db_number: 0,
            password: None,
            channel: "${tag}".to_string(),
            format: PayloadFormat::default(),
            buffer: BufferConfig::default(),
            flush: FlushConfig::default(),
            inject: InjectConfig::default(),
        }
    }
}

impl SinkConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields,
    /// or any validation error from [`SinkConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise
    /// the same errors as [`SinkConfig::from_json_str`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&json)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidLimit {
                name: "host",
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "port",
                reason: "must be non-zero".to_string(),
            }
            .into());
        }
        self.buffer.validate()?;
        self.flush.validate()?;
        Ok(())
    }

    /// Returns the `host:port` endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Chunking and capacity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Partitioning keys; must contain `tag` and `time`.
    pub chunk_keys: Vec<String>,
    /// Width of a time bucket. Must be a whole number of seconds.
    #[serde(with = "humantime_serde")]
    pub timekey: Duration,
    /// Maximum encoded size of a single chunk in bytes.
    pub chunk_limit_size: u64,
    /// Age after which an open chunk is sealed.
    #[serde(with = "humantime_serde")]
    pub chunk_max_age: Duration,
    /// Maximum bytes held across all chunks before ingest is refused.
    pub total_limit_size: u64,
    /// Directory for durable chunk files; memory only when unset.
    pub path: Option<PathBuf>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_keys: REQUIRED_CHUNK_KEYS.iter().map(|k| (*k).to_string()).collect(),
            timekey: Duration::from_secs(60),
            chunk_limit_size: 8 * 1024 * 1024,
            chunk_max_age: Duration::from_secs(60),
            total_limit_size: 512 * 1024 * 1024,
            path: None,
        }
    }
}

impl BufferConfig {
    /// Validates the buffer settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required chunk key is missing, an
    /// unsupported key is present, the bucket width is not a positive whole
    /// number of seconds, or the size limits are inconsistent.
    pub fn validate(&self) -> Result<()> {
        for required in REQUIRED_CHUNK_KEYS {
            if !self.chunk_keys.iter().any(|k| k == required) {
                return Err(ConfigError::MissingChunkKey {
                    key: required.to_string(),
                }
                .into());
            }
        }
        if let Some(key) = self
            .chunk_keys
            .iter()
            .find(|k| !REQUIRED_CHUNK_KEYS.contains(&k.as_str()))
        {
            return Err(ConfigError::UnsupportedChunkKey { key: key.clone() }.into());
        }

        if self.timekey.is_zero() || self.timekey.subsec_nanos() != 0 {
            return Err(ConfigError::InvalidDuration {
                name: "timekey",
                reason: format!("must be a positive whole number of seconds, got {:?}", self.timekey),
            }
            .into());
        }
        if i64::try_from(self.timekey.as_secs()).is_err() {
            return Err(ConfigError::InvalidDuration {
                name: "timekey",
                reason: "too large".to_string(),
            }
            .into());
        }

        if self.chunk_limit_size == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "chunk_limit_size",
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        if self.total_limit_size < self.chunk_limit_size {
            return Err(ConfigError::InvalidLimit {
                name: "total_limit_size",
                reason: format!(
                    "{} is smaller than chunk_limit_size {}",
                    self.total_limit_size, self.chunk_limit_size
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the bucket width in seconds.
    #[allow(clippy::cast_possible_wrap)] // validate() bounds timekey to i64
    pub fn timekey_secs(&self) -> i64 {
        self.timekey.as_secs() as i64
    }
}

/// Flush scheduling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlushConfig {
    /// Retries after the first failed attempt before a chunk stalls.
    ///
    /// `0` disables automatic retries: a failed chunk waits for an explicit
    /// resume, which avoids duplicate publishes from blind retries.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further failure.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay.
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// Timeout for one pipelined publish batch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of background flush threads.
    pub thread_count: usize,
    /// How often background threads check for expired chunks and due retries.
    #[serde(with = "humantime_serde")]
    pub thread_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            thread_count: 1,
            thread_interval: Duration::from_secs(1),
        }
    }
}

impl FlushConfig {
    /// Validates the flush settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a duration or the thread count is out of
    /// range.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                name: "timeout",
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        if self.thread_interval.is_zero() {
            return Err(ConfigError::InvalidDuration {
                name: "thread_interval",
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        if self.max_retry_backoff < self.retry_backoff {
            return Err(ConfigError::InvalidDuration {
                name: "max_retry_backoff",
                reason: format!(
                    "{:?} is shorter than retry_backoff {:?}",
                    self.max_retry_backoff, self.retry_backoff
                ),
            }
            .into());
        }
        if self.thread_count == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "thread_count",
                reason: "must be >= 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Returns the delay before retrying after `failures` consecutive
    /// failures: `retry_backoff * 2^(failures - 1)`, capped at
    /// `max_retry_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.retry_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_retry_backoff, |d| d.min(self.max_retry_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedpubError;

    #[test]
    fn test_defaults_match_plugin_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6379);
        assert_eq!(config.db_number, 0);
        assert_eq!(config.channel, "${tag}");
        assert_eq!(config.buffer.chunk_keys, vec!["tag", "time"]);
        assert_eq!(config.buffer.timekey_secs(), 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = SinkConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SinkConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = SinkConfig::from_json_str(
            r#"{
                "host": "10.0.0.5",
                "port": 6380,
                "db_number": 2,
                "password": "secret",
                "channel": "fluent.${tag}",
                "format": "fields",
                "buffer": {
                    "timekey": "2m",
                    "chunk_limit_size": 1024,
                    "chunk_max_age": "250ms",
                    "total_limit_size": 4096,
                    "path": "/var/spool/redpub"
                },
                "flush": {
                    "max_retries": 0,
                    "retry_backoff": "100ms",
                    "max_retry_backoff": "2s",
                    "timeout": "1s",
                    "thread_count": 4,
                    "thread_interval": "50ms"
                },
                "inject": { "tag_key": "tag", "time_key": "time" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoint(), "10.0.0.5:6380");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.format, PayloadFormat::Fields);
        assert_eq!(config.buffer.timekey, Duration::from_secs(120));
        assert_eq!(config.buffer.chunk_max_age, Duration::from_millis(250));
        assert_eq!(config.buffer.path, Some(PathBuf::from("/var/spool/redpub")));
        assert_eq!(config.flush.max_retries, 0);
        assert_eq!(config.flush.thread_count, 4);
        assert_eq!(config.inject.time_key.as_deref(), Some("time"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SinkConfig::from_json_str(r#"{"hots": "x"}"#).unwrap_err();
        assert!(matches!(err, RedpubError::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_chunk_key() {
        let mut config = SinkConfig::default();
        config.buffer.chunk_keys = vec!["tag".to_string()];

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RedpubError::Config(ConfigError::MissingChunkKey { ref key }) if key == "time"
        ));
    }

    #[test]
    fn test_unsupported_chunk_key() {
        let mut config = SinkConfig::default();
        config.buffer.chunk_keys.push("host".to_string());

        assert!(matches!(
            config.validate().unwrap_err(),
            RedpubError::Config(ConfigError::UnsupportedChunkKey { .. })
        ));
    }

    #[test]
    fn test_fractional_timekey_rejected() {
        let mut config = SinkConfig::default();
        config.buffer.timekey = Duration::from_millis(1500);
        assert!(config.validate().is_err());

        config.buffer.timekey = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_total_limit_below_chunk_limit_rejected() {
        let mut config = SinkConfig::default();
        config.buffer.chunk_limit_size = 100;
        config.buffer.total_limit_size = 99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut config = SinkConfig::default();
        config.flush.thread_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let flush = FlushConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(500),
            ..FlushConfig::default()
        };

        assert_eq!(flush.backoff(1), Duration::from_millis(100));
        assert_eq!(flush.backoff(2), Duration::from_millis(200));
        assert_eq!(flush.backoff(3), Duration::from_millis(400));
        assert_eq!(flush.backoff(4), Duration::from_millis(500));
        assert_eq!(flush.backoff(100), Duration::from_millis(500));
    }

    #[test]
    fn test_duration_strings() {
        let parse = |json: &str| SinkConfig::from_json_str(json).map(|c| c.flush.retry_backoff);
        assert_eq!(parse(r#"{"flush": {"retry_backoff": "500ms"}}"#).unwrap(), Duration::from_millis(500));
        assert_eq!(parse(r#"{"flush": {"retry_backoff": "30s"}}"#).unwrap(), Duration::from_secs(30));
        assert_eq!(parse(r#"{"flush": {"retry_backoff": "1m 30s"}}"#).unwrap(), Duration::from_secs(90));
        assert_eq!(parse(r#"{"flush": {"retry_backoff": "2h"}}"#).unwrap(), Duration::from_secs(7200));

        for bad in [r#""""#, r#""5 parsecs""#, r#""-5s""#, "30"] {
            let json = format!(r#"{{"flush": {{"retry_backoff": {bad}}}}}"#);
            let err = parse(&json).unwrap_err();
            assert!(matches!(err, RedpubError::Config(ConfigError::Parse(_))), "{bad} accepted");
        }
    }

    #[test]
    fn test_duration_serialization_roundtrip() {
        let config = SinkConfig {
            flush: FlushConfig {
                retry_backoff: Duration::from_millis(250),
                ..FlushConfig::default()
            },
            ..SinkConfig::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""retry_backoff":"250ms""#));
        assert!(json.contains(r#""timekey":"1m""#));

        let parsed = SinkConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
