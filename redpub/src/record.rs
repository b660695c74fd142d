//! The record type flowing through the buffer.
//!
//! A [`Record`] is the `(tag, time, fields)` triple produced by the host.
//! Its serde representation is the envelope published on the wire:
//!
//! ```text
//! {"tag": "app.log", "time": 1700000000, "record": {"message": "hello"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single timestamped, tagged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Routing tag, e.g. `app.log`.
    pub tag: String,
    /// Event time in seconds since the Unix epoch.
    pub time: i64,
    /// Structured payload.
    #[serde(rename = "record", default)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Creates a record from its parts.
    pub fn new(tag: impl Into<String>, time: i64, fields: Map<String, Value>) -> Self {
        Self {
            tag: tag.into(),
            time,
            fields,
        }
    }
}

/// Optionally copies the tag and time into the record's fields before it is
/// buffered, so subscribers that only see the fields still get them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InjectConfig {
    /// Field name to store the tag under.
    pub tag_key: Option<String>,
    /// Field name to store the event time under.
    pub time_key: Option<String>,
}

impl InjectConfig {
    /// Returns `true` if nothing is injected.
    pub fn is_noop(&self) -> bool {
        self.tag_key.is_none() && self.time_key.is_none()
    }

    /// Writes the configured fields into `record`, overwriting existing
    /// values with the same name.
    pub fn apply(&self, record: &mut Record) {
        if let Some(key) = &self.tag_key {
            record
                .fields
                .insert(key.clone(), Value::String(record.tag.clone()));
        }
        if let Some(key) = &self.time_key {
            record.fields.insert(key.clone(), Value::from(record.time));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_envelope_serialization() {
        let record = Record::new("app.log", 42, fields(json!({"msg": "hi"})));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"tag": "app.log", "time": 42, "record": {"msg": "hi"}})
        );

        let parsed: Record = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_missing_record_defaults_to_empty() {
        let parsed: Record = serde_json::from_str(r#"{"tag":"a","time":1}"#).unwrap();
        assert!(parsed.fields.is_empty());
    }

    #[test]
    fn test_inject_tag_and_time() {
        let inject = InjectConfig {
            tag_key: Some("tag".to_string()),
            time_key: Some("@timestamp".to_string()),
        };
        let mut record = Record::new("web.access", 1_700_000_000, Map::new());
        inject.apply(&mut record);

        assert_eq!(record.fields["tag"], json!("web.access"));
        assert_eq!(record.fields["@timestamp"], json!(1_700_000_000));
    }

    #[test]
    fn test_inject_noop() {
        let inject = InjectConfig::default();
        assert!(inject.is_noop());

        let mut record = Record::new("a", 1, fields(json!({"k": 1})));
        let before = record.clone();
        inject.apply(&mut record);
        assert_eq!(record, before);
    }
}
