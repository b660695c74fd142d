//! Binary record codec and wire payload rendering.
//!
//! Records are buffered in a compact binary form: each record is a
//! length-delimited protobuf message, and a chunk is the plain concatenation
//! of its records.
//!
//! # Chunk Layout
//!
//! ```text
//! [varint len][Entry bytes][varint len][Entry bytes]...
//! ```
//!
//! Field values are `serde_json::Value`s mapped onto a oneof, so every JSON
//! value (including `u64` above `i64::MAX` and exact `f64` bits) survives
//! the round trip unchanged. Fields are encoded in key order, which makes
//! the encoding deterministic.
//!
//! Every JSON object adds three nested messages (`Value`, `MapValue`,
//! `Field`) and every array two. prost refuses to decode more than
//! [`MAX_MESSAGE_DEPTH`] nested messages, so [`encode`] rejects records that
//! would need more.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{CodecError, Result};
use crate::record::Record;

/// Protobuf message types for buffered records.
///
/// Hand-written prost types; there is no `.proto` file to keep in sync.
pub mod proto {
    /// One buffered record.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Entry {
        /// Routing tag.
        #[prost(string, tag = "1")]
        pub tag: String,
        /// Event time in seconds since the Unix epoch.
        #[prost(sint64, tag = "2")]
        pub time: i64,
        /// Record fields, ordered by key.
        #[prost(message, repeated, tag = "3")]
        pub fields: Vec<Field>,
    }

    /// A named value.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Field {
        /// Field name.
        #[prost(string, tag = "1")]
        pub key: String,
        /// Field value.
        #[prost(message, optional, tag = "2")]
        pub value: Option<Value>,
    }

    /// A JSON value.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Value {
        /// The populated variant.
        #[prost(oneof = "Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
        pub kind: Option<Kind>,
    }

    /// Variants of a JSON value.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        /// JSON `null`. The payload is ignored.
        #[prost(bool, tag = "1")]
        Null(bool),
        /// JSON boolean.
        #[prost(bool, tag = "2")]
        Bool(bool),
        /// Integer representable as `i64`.
        #[prost(sint64, tag = "3")]
        Int(i64),
        /// Integer above `i64::MAX`.
        #[prost(uint64, tag = "4")]
        Uint(u64),
        /// Finite floating point number.
        #[prost(double, tag = "5")]
        Float(f64),
        /// JSON string.
        #[prost(string, tag = "6")]
        Str(String),
        /// JSON array.
        #[prost(message, tag = "7")]
        List(ListValue),
        /// JSON object.
        #[prost(message, tag = "8")]
        Map(MapValue),
    }

    /// A JSON array.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListValue {
        /// Array elements in order.
        #[prost(message, repeated, tag = "1")]
        pub values: Vec<Value>,
    }

    /// A JSON object.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MapValue {
        /// Object members ordered by key.
        #[prost(message, repeated, tag = "1")]
        pub fields: Vec<Field>,
    }
}

/// Deepest message nesting the decoder accepts below an `Entry`.
pub const MAX_MESSAGE_DEPTH: usize = 100;

/// How a record is rendered as a message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// JSON envelope `{"tag", "time", "record"}`.
    #[default]
    Envelope,
    /// JSON object of the record's fields only.
    Fields,
}

/// Encodes a record as one length-delimited frame.
///
/// # Errors
///
/// - [`CodecError::TooDeep`] if the fields nest deeper than
///   [`MAX_MESSAGE_DEPTH`] allows.
/// - [`CodecError::Encode`] if protobuf encoding fails.
pub fn encode(record: &Record) -> Result<Vec<u8>> {
    // Each top-level field is one `Field` message.
    let budget = MAX_MESSAGE_DEPTH - 1;
    if record.fields.values().any(|value| exceeds_depth(value, budget)) {
        return Err(CodecError::TooDeep {
            limit: MAX_MESSAGE_DEPTH,
        }
        .into());
    }

    let entry = proto::Entry {
        tag: record.tag.clone(),
        time: record.time,
        fields: fields_to_proto(&record.fields),
    };

    let len = entry.encoded_len();
    let mut buf = Vec::with_capacity(prost::length_delimiter_len(len) + len);
    entry
        .encode_length_delimited(&mut buf)
        .map_err(|e| CodecError::Encode { source: e })?;
    Ok(buf)
}

/// Decodes a chunk blob back into its records, in order.
///
/// # Errors
///
/// Returns [`CodecError::CorruptChunk`] if the bytes are not a well-formed
/// sequence of encoded records.
pub fn decode_chunk(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut buf = bytes;
    let mut records = Vec::new();

    while !buf.is_empty() {
        let index = records.len();
        let entry = proto::Entry::decode_length_delimited(&mut buf).map_err(|e| {
            CodecError::CorruptChunk {
                record: index,
                reason: e.to_string(),
            }
        })?;

        let fields = fields_from_proto(entry.fields).map_err(|reason| {
            CodecError::CorruptChunk {
                record: index,
                reason,
            }
        })?;

        records.push(Record {
            tag: entry.tag,
            time: entry.time,
            fields,
        });
    }

    Ok(records)
}

/// Counts the frames in a chunk blob by walking the length prefixes only.
///
/// Returns `None` if the framing is broken.
pub fn frame_count(bytes: &[u8]) -> Option<usize> {
    let mut buf = bytes;
    let mut count = 0;

    while !buf.is_empty() {
        let len = usize::try_from(prost::encoding::decode_varint(&mut buf).ok()?).ok()?;
        if len > buf.len() {
            return None;
        }
        buf = &buf[len..];
        count += 1;
    }

    Some(count)
}

/// Renders a record as the text payload published to the broker.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if JSON serialization fails.
pub fn to_wire(record: &Record, format: PayloadFormat) -> Result<String> {
    let rendered = match format {
        PayloadFormat::Envelope => serde_json::to_string(record),
        PayloadFormat::Fields => serde_json::to_string(&record.fields),
    };
    rendered
        .map_err(|e| CodecError::Serialize { source: e })
        .map_err(Into::into)
}

/// Returns `true` if encoding `value` needs more than `budget` nested
/// messages. Stops descending once the budget is spent.
fn exceeds_depth(value: &Value, budget: usize) -> bool {
    // The `Value` message itself.
    let Some(budget) = budget.checked_sub(1) else {
        return true;
    };
    match value {
        Value::Array(items) => match budget.checked_sub(1) {
            None => true,
            Some(budget) => items.iter().any(|item| exceeds_depth(item, budget)),
        },
        Value::Object(map) => match budget.checked_sub(1) {
            None => true,
            Some(_) if map.is_empty() => false,
            // One `Field` per member.
            Some(budget) => match budget.checked_sub(1) {
                None => true,
                Some(budget) => map.values().any(|member| exceeds_depth(member, budget)),
            },
        },
        _ => false,
    }
}

fn fields_to_proto(fields: &Map<String, Value>) -> Vec<proto::Field> {
    fields
        .iter()
        .map(|(key, value)| proto::Field {
            key: key.clone(),
            value: Some(value_to_proto(value)),
        })
        .collect()
}

fn value_to_proto(value: &Value) -> proto::Value {
    use proto::Kind;

    let kind = match value {
        Value::Null => Kind::Null(true),
        Value::Bool(b) => Kind::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::Int(i)
            } else if let Some(u) = n.as_u64() {
                Kind::Uint(u)
            } else {
                Kind::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Kind::Str(s.clone()),
        Value::Array(items) => Kind::List(proto::ListValue {
            values: items.iter().map(value_to_proto).collect(),
        }),
        Value::Object(map) => Kind::Map(proto::MapValue {
            fields: fields_to_proto(map),
        }),
    };

    proto::Value { kind: Some(kind) }
}

fn fields_from_proto(fields: Vec<proto::Field>) -> std::result::Result<Map<String, Value>, String> {
    let mut map = Map::new();
    for field in fields {
        let value = field
            .value
            .ok_or_else(|| format!("field '{}' has no value", field.key))?;
        map.insert(field.key, value_from_proto(value)?);
    }
    Ok(map)
}

fn value_from_proto(value: proto::Value) -> std::result::Result<Value, String> {
    use proto::Kind;

    let kind = value.kind.ok_or_else(|| "value has no kind".to_string())?;
    let value = match kind {
        Kind::Null(_) => Value::Null,
        Kind::Bool(b) => Value::Bool(b),
        Kind::Int(i) => Value::from(i),
        Kind::Uint(u) => Value::from(u),
        Kind::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite float {f}"))?,
        Kind::Str(s) => Value::String(s),
        Kind::List(list) => Value::Array(
            list.values
                .into_iter()
                .map(value_from_proto)
                .collect::<std::result::Result<Vec<_>, String>>()?,
        ),
        Kind::Map(map) => Value::Object(fields_from_proto(map.fields)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(tag: &str, time: i64, fields: Value) -> Record {
        let Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        Record::new(tag, time, fields)
    }

    #[test]
    fn test_roundtrip_all_value_kinds() {
        let original = record(
            "app.log",
            -5,
            json!({
                "null": null,
                "bool": true,
                "neg": -42,
                "big": u64::MAX,
                "float": 1.5,
                "whole_float": 3.0,
                "string": "héllo",
                "list": [1, "two", [3.25], {"four": false}],
                "nested": {"a": {"b": null}},
            }),
        );

        let bytes = encode(&original).unwrap();
        let decoded = decode_chunk(&bytes).unwrap();

        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut a = Map::new();
        a.insert("z".to_string(), json!(1));
        a.insert("a".to_string(), json!(2));
        let mut b = Map::new();
        b.insert("a".to_string(), json!(2));
        b.insert("z".to_string(), json!(1));

        let first = encode(&Record::new("t", 1, a)).unwrap();
        let second = encode(&Record::new("t", 1, b)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_concatenation_preserves_order() {
        let records: Vec<_> = (0..5)
            .map(|i| record("t", i, json!({"seq": i})))
            .collect();

        let mut chunk = Vec::new();
        for r in &records {
            chunk.extend_from_slice(&encode(r).unwrap());
        }

        assert_eq!(decode_chunk(&chunk).unwrap(), records);
        assert_eq!(frame_count(&chunk), Some(5));
    }

    #[test]
    fn test_decode_empty_chunk() {
        assert!(decode_chunk(&[]).unwrap().is_empty());
        assert_eq!(frame_count(&[]), Some(0));
    }

    #[test]
    fn test_truncated_chunk_is_corrupt() {
        let mut chunk = encode(&record("a", 1, json!({"k": "v"}))).unwrap();
        chunk.extend_from_slice(&encode(&record("a", 2, json!({"k": "w"}))).unwrap());
        chunk.pop();

        let err = decode_chunk(&chunk).unwrap_err();
        match err {
            crate::RedpubError::Codec(CodecError::CorruptChunk { record, .. }) => {
                assert_eq!(record, 1);
            }
            other => panic!("expected CorruptChunk, got {other}"),
        }
        assert_eq!(frame_count(&chunk), None);
    }

    #[test]
    fn test_value_without_kind_is_corrupt() {
        let entry = proto::Entry {
            tag: "a".to_string(),
            time: 0,
            fields: vec![proto::Field {
                key: "k".to_string(),
                value: Some(proto::Value { kind: None }),
            }],
        };
        let mut bytes = Vec::new();
        entry.encode_length_delimited(&mut bytes).unwrap();

        assert!(decode_chunk(&bytes).is_err());
    }

    /// Wraps `1` in `levels` single-member objects.
    fn nested(levels: usize) -> Value {
        (0..levels).fold(json!(1), |inner, _| json!({"a": inner}))
    }

    #[test]
    fn test_deepest_decodable_record_roundtrips() {
        // Field + 32 * (Value, MapValue, Field) + Value = 98 messages.
        let deep = record("t", 0, json!({"a": nested(32)}));
        let bytes = encode(&deep).unwrap();
        assert_eq!(decode_chunk(&bytes).unwrap(), vec![deep]);

        let wide_list = record("t", 0, json!({"a": [[[[[[[[[[1]]]]]]]]]]}));
        assert_eq!(decode_chunk(&encode(&wide_list).unwrap()).unwrap(), vec![wide_list]);
    }

    #[test]
    fn test_too_deep_record_is_rejected_at_encode() {
        for levels in [33, 40, 100] {
            let err = encode(&record("t", 0, json!({"a": nested(levels)}))).unwrap_err();
            assert!(
                matches!(err, crate::RedpubError::Codec(CodecError::TooDeep { limit: MAX_MESSAGE_DEPTH })),
                "{levels} levels: {err}"
            );
        }

        let lists = (0..60).fold(json!(1), |inner, _| json!([inner]));
        assert!(encode(&record("t", 0, json!({"a": lists}))).is_err());
    }

    #[test]
    fn test_depth_check_counts_empty_containers() {
        let empty_leaf = (0..32).fold(json!({}), |inner, _| json!({"a": inner}));
        assert!(encode(&record("t", 0, json!({"a": empty_leaf}))).is_ok());
    }

    #[test]
    fn test_wire_formats() {
        let r = record("app.log", 10, json!({"msg": "hi"}));

        let envelope: Value = serde_json::from_str(&to_wire(&r, PayloadFormat::Envelope).unwrap()).unwrap();
        assert_eq!(envelope, json!({"tag": "app.log", "time": 10, "record": {"msg": "hi"}}));

        let fields: Value = serde_json::from_str(&to_wire(&r, PayloadFormat::Fields).unwrap()).unwrap();
        assert_eq!(fields, json!({"msg": "hi"}));
    }
}
