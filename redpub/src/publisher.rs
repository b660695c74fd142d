//! Turns a decoded chunk into one pipelined publish batch.

use std::time::Duration;

use crate::codec::{self, PayloadFormat};
use crate::connection::{Connection, Message};
use crate::error::Result;
use crate::partition::ChannelTemplate;
use crate::record::Record;

/// Publishes records to their templated channels.
#[derive(Debug, Clone)]
pub struct Publisher {
    template: ChannelTemplate,
    format: PayloadFormat,
    timeout: Duration,
}

impl Publisher {
    /// Creates a publisher.
    ///
    /// `timeout` bounds each pipelined batch; expiry is reported as a
    /// publish failure.
    pub fn new(template: ChannelTemplate, format: PayloadFormat, timeout: Duration) -> Self {
        Self {
            template,
            format,
            timeout,
        }
    }

    /// Returns the channel template.
    pub fn template(&self) -> &ChannelTemplate {
        &self.template
    }

    /// Resolves channel and payload for every record, preserving order.
    ///
    /// # Errors
    ///
    /// Returns a codec error if a record cannot be rendered.
    pub fn build_batch(&self, records: &[Record]) -> Result<Vec<Message>> {
        records
            .iter()
            .map(|record| -> Result<Message> {
                Ok(Message {
                    channel: self.template.resolve(&record.tag).into_owned(),
                    payload: codec::to_wire(record, self.format)?,
                })
            })
            .collect()
    }

    /// Publishes `records` over `connection` as a single pipelined batch.
    ///
    /// Returns the number of messages published. An empty slice succeeds
    /// without touching the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the batch is not fully
    /// acknowledged; the batch must then be retried as a whole.
    pub fn publish<C: Connection>(&self, records: &[Record], connection: &mut C) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let batch = self.build_batch(records)?;
        connection.pipeline_publish(&batch, self.timeout)?;
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connector, MemoryConnector};
    use serde_json::{Map, json};

    fn record(tag: &str, time: i64, seq: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("seq".to_string(), json!(seq));
        Record::new(tag, time, fields)
    }

    fn publisher(template: &str) -> Publisher {
        Publisher::new(
            ChannelTemplate::parse(template),
            PayloadFormat::Envelope,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_build_batch_resolves_channels_in_order() {
        let publisher = publisher("logs.${tag}");
        let records = vec![record("a", 1, 0), record("b", 2, 1), record("a", 3, 2)];

        let batch = publisher.build_batch(&records).unwrap();

        let channels: Vec<_> = batch.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["logs.a", "logs.b", "logs.a"]);

        let first: serde_json::Value = serde_json::from_str(&batch[0].payload).unwrap();
        assert_eq!(first, json!({"tag": "a", "time": 1, "record": {"seq": 0}}));
    }

    #[test]
    fn test_static_channel() {
        let publisher = publisher("events");
        let batch = publisher.build_batch(&[record("x.y", 0, 0)]).unwrap();
        assert_eq!(batch[0].channel, "events");
    }

    #[test]
    fn test_publish_single_batch() {
        let broker = MemoryConnector::new();
        let mut conn = broker.open().unwrap();
        let records: Vec<_> = (0..3).map(|i| record("app.log", 10, i)).collect();

        let count = publisher("${tag}").publish(&records, &mut conn).unwrap();

        assert_eq!(count, 3);
        let batches = broker.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn test_publish_empty_is_noop() {
        let broker = MemoryConnector::new();
        let mut conn = broker.open().unwrap();

        assert_eq!(publisher("${tag}").publish(&[], &mut conn).unwrap(), 0);
        assert!(broker.batches().is_empty());
    }

    #[test]
    fn test_publish_failure_propagates() {
        let broker = MemoryConnector::new();
        let mut conn = broker.open().unwrap();
        broker.fail_next_publishes(1);

        let result = publisher("${tag}").publish(&[record("a", 0, 0)], &mut conn);
        assert!(result.is_err());
        assert!(broker.batches().is_empty());
    }
}
