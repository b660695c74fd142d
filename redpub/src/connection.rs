//! The broker connection capability.
//!
//! The flush path only needs three things from a message bus client: open a
//! connection, publish a batch of messages as one pipelined unit, and close
//! the connection. [`Connector`] and [`Connection`] capture exactly that, so
//! the buffering core can be driven by the Redis client in
//! [`redis`](crate::redis) or by the in-memory [`MemoryConnector`] used in
//! tests and benchmarks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{PublishError, Result};

/// One message destined for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Resolved channel name.
    pub channel: String,
    /// Text payload.
    pub payload: String,
}

impl Message {
    /// Creates a message.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Opens connections to the broker.
pub trait Connector: Send + Sync {
    /// The connection type produced by this connector.
    type Connection: Connection;

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the broker cannot be reached or rejects
    /// the handshake.
    fn open(&self) -> Result<Self::Connection>;
}

/// A live broker connection.
pub trait Connection: Send {
    /// Publishes every message as one pipelined batch.
    ///
    /// Succeeds only if every publish in the batch was acknowledged within
    /// `timeout`. There is no partial-success signal: on error the caller
    /// must assume none, some or all messages reached the broker.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] on I/O failure, timeout or an error reply.
    fn pipeline_publish(&mut self, messages: &[Message], timeout: Duration) -> Result<()>;

    /// Closes the connection, ignoring errors.
    fn close(self);
}

/// Observable state of a [`MemoryConnector`].
#[derive(Debug, Default)]
struct MemoryBroker {
    /// Acknowledged batches, in acknowledgement order.
    batches: Vec<Vec<Message>>,
    /// Publishes still to fail.
    fail_publishes: u32,
    /// Opens still to fail.
    fail_opens: u32,
    /// Connections opened.
    opened: usize,
    /// Connections closed.
    closed: usize,
    /// Channels with a batch currently in progress, and how many.
    in_progress: HashMap<String, usize>,
    /// Highest concurrent batch count seen for any single channel.
    max_concurrent_per_channel: usize,
    /// Time each publish spends "on the wire".
    publish_delay: Duration,
}

/// An in-process broker that records every acknowledged batch.
///
/// Clones share the same broker, so a test can keep one clone for
/// assertions while the sink owns another.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use redpub::connection::{Connection, Connector, MemoryConnector, Message};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryConnector::new();
/// broker.fail_next_publishes(1);
///
/// let mut conn = broker.open()?;
/// let batch = [Message::new("app.log", "{}")];
/// assert!(conn.pipeline_publish(&batch, Duration::from_secs(1)).is_err());
/// conn.pipeline_publish(&batch, Duration::from_secs(1))?;
///
/// assert_eq!(broker.batches().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<Mutex<MemoryBroker>>,
}

impl MemoryConnector {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes each publish sleep for `delay` before it is acknowledged.
    #[must_use]
    pub fn with_publish_delay(self, delay: Duration) -> Self {
        self.lock().publish_delay = delay;
        self
    }

    /// Fails the next `n` publish calls with an I/O error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    /// Fails the next `n` open calls with a connect error.
    pub fn fail_next_opens(&self, n: u32) {
        self.lock().fail_opens = n;
    }

    /// Returns every acknowledged batch.
    pub fn batches(&self) -> Vec<Vec<Message>> {
        self.lock().batches.clone()
    }

    /// Returns every acknowledged message, flattened in order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Forgets every recorded batch.
    pub fn clear(&self) {
        self.lock().batches.clear();
    }

    /// Returns how many connections were opened.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Returns how many connections were closed.
    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    /// Returns the highest number of batches seen in progress at the same
    /// time for any one channel.
    pub fn max_concurrent_per_channel(&self) -> usize {
        self.lock().max_concurrent_per_channel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBroker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn open(&self) -> Result<MemoryConnection> {
        let mut broker = self.lock();
        if broker.fail_opens > 0 {
            broker.fail_opens -= 1;
            return Err(PublishError::Connect {
                endpoint: "memory".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "injected connect failure",
                )
                .into(),
            }
            .into());
        }
        broker.opened += 1;
        Ok(MemoryConnection {
            broker: Arc::clone(&self.broker),
        })
    }
}

/// A connection to a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: Arc<Mutex<MemoryBroker>>,
}

impl MemoryConnection {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBroker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for MemoryConnection {
    fn pipeline_publish(&mut self, messages: &[Message], _timeout: Duration) -> Result<()> {
        let mut channels: Vec<&str> = messages.iter().map(|m| m.channel.as_str()).collect();
        channels.sort_unstable();
        channels.dedup();

        let delay = {
            let mut broker = self.lock();
            if broker.fail_publishes > 0 {
                broker.fail_publishes -= 1;
                return Err(PublishError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "injected publish failure",
                    ),
                }
                .into());
            }
            for channel in &channels {
                let count = broker.in_progress.entry((*channel).to_string()).or_insert(0);
                *count += 1;
                let count = *count;
                broker.max_concurrent_per_channel = broker.max_concurrent_per_channel.max(count);
            }
            broker.publish_delay
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut broker = self.lock();
        for channel in &channels {
            if let Some(count) = broker.in_progress.get_mut(*channel) {
                *count -= 1;
            }
        }
        broker.batches.push(messages.to_vec());
        Ok(())
    }

    fn close(self) {
        self.lock().closed += 1;
    }
}
