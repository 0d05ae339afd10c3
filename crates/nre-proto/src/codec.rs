// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Body encodings.
//!
//! BSON has no top-level array, so arrays travel as a document keyed by
//! decimal index (`{"0": .., "1": ..}`) and are unwrapped on decode.

use bson::{Bson, Document};
use serde_json::{Map, Value};
use thiserror::Error;

/// Encoding failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Value could not be represented as BSON.
    #[error("bson encode: {0}")]
    BsonEncode(#[from] bson::ser::Error),
    /// Bytes were not a BSON document.
    #[error("bson decode: {0}")]
    BsonDecode(#[from] bson::de::Error),
    /// Only objects and arrays can be sent as BSON bodies.
    #[error("cannot encode a bare scalar as bson")]
    Scalar,
}

/// Content encoding for request and response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// `application/perfsonar+json`
    #[default]
    Json,
    /// `application/perfsonar+bson`
    Bson,
}

impl Codec {
    /// MIME type for `Content-Type` and `Accept`.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/perfsonar+json",
            Self::Bson => "application/perfsonar+bson",
        }
    }

    /// Pick the codec advertised by a `Content-Type` header. Unknown types
    /// fall back to JSON.
    pub fn from_content_type(header: &str) -> Self {
        if header.contains("bson") {
            Self::Bson
        } else {
            Self::Json
        }
    }

    /// Encode a body.
    pub fn encode(self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Bson => {
                let doc = match bson::to_bson(value)? {
                    Bson::Document(doc) => doc,
                    Bson::Array(items) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| (i.to_string(), item))
                        .collect(),
                    _ => return Err(CodecError::Scalar),
                };
                let mut out = Vec::new();
                doc.to_writer(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Decode a body. Empty input decodes to `null`.
    pub fn decode(self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Bson => {
                let doc = Document::from_reader(bytes)?;
                Ok(unwrap_indexed(Bson::Document(doc).into_relaxed_extjson()))
            }
        }
    }
}

fn unwrap_indexed(value: Value) -> Value {
    match value {
        Value::Object(mut map) if is_indexed(&map) => Value::Array(
            (0..map.len())
                .filter_map(|i| map.remove(&i.to_string()))
                .collect(),
        ),
        other => other,
    }
}

// Map iteration is lexical (`"10"` before `"2"`), so test the key set.
fn is_indexed(map: &Map<String, Value>) -> bool {
    !map.is_empty() && (0..map.len()).all(|i| map.contains_key(&i.to_string()))
}

/// Normalize a response body into a list of records: arrays as-is, a
/// single object as a one-element list, `null`/`{}` as empty.
pub fn records(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(map) if map.is_empty() => Vec::new(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn content_types_match_store_protocol() {
        assert_eq!(Codec::Json.content_type(), "application/perfsonar+json");
        assert_eq!(
            Codec::from_content_type("application/perfsonar+bson; charset=binary"),
            Codec::Bson
        );
        assert_eq!(Codec::from_content_type("text/plain"), Codec::Json);
    }

    #[test]
    fn bson_record_survives_the_wire() {
        let record = json!({"id": "n1", "ts": 1_700_000_000_000_000_i64, "name": "a", "ports": [{"href": "ports/p1"}]});
        let bytes = Codec::Bson.encode(&record).unwrap();
        assert_eq!(Codec::Bson.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn bson_arrays_are_index_keyed_documents() {
        let items: Vec<Value> = (0..12).map(|i| json!({"id": format!("r{i}")})).collect();
        let body = Value::Array(items);
        let bytes = Codec::Bson.encode(&body).unwrap();
        let raw = Document::from_reader(bytes.as_slice()).unwrap();
        assert!(raw.contains_key("11"));
        assert_eq!(Codec::Bson.decode(&bytes).unwrap(), body);
    }

    #[test]
    fn scalars_cannot_be_bson_bodies() {
        assert!(matches!(
            Codec::Bson.encode(&json!(3)),
            Err(CodecError::Scalar)
        ));
    }

    #[test]
    fn records_normalizes_bodies() {
        assert_eq!(records(json!(null)), Vec::<Value>::new());
        assert_eq!(records(json!({})), Vec::<Value>::new());
        assert_eq!(records(json!({"id": "a"})), vec![json!({"id": "a"})]);
        assert_eq!(records(json!([1, 2])).len(), 2);
    }
}
