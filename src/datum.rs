//! Datum value types and their queue wire encoding.
//!
//! A datum is either a *stream* datum (opaque stream id plus positional
//! property arrays) or an *object* datum (node/location object id plus a
//! source id and named samples). Both forms encode to a JSON object with a
//! `"type"` discriminator so any collector instance can decode a message
//! produced by any other.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the JSON discriminator field.
pub const TYPE_FIELD: &str = "type";

/// Discriminator value for stream datum.
pub const STREAM_TYPE: &str = "stream";

/// Discriminator value for object datum.
pub const OBJECT_TYPE: &str = "object";

/// Namespace for deterministic storage ids derived from datum keys.
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_2c3a_8b4e_4f10_9a7c_52e1_d0b3_c9a4);

/// Kind of object a datum belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Node,
    Location,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Node => write!(f, "node"),
            ObjectKind::Location => write!(f, "location"),
        }
    }
}

/// Identity of a datum.
///
/// Two datum with equal keys are the same logical record. Storage is an
/// upsert on this key, so duplicate delivery is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatumKey {
    Stream {
        stream_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Object {
        kind: ObjectKind,
        object_id: i64,
        source_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DatumKey {
    /// Timestamp component of the key.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DatumKey::Stream { timestamp, .. } | DatumKey::Object { timestamp, .. } => *timestamp,
        }
    }

    /// Deterministic UUID for this key, stable across processes.
    pub fn storage_id(&self) -> Uuid {
        Uuid::new_v5(&KEY_NAMESPACE, self.to_string().as_bytes())
    }
}

impl std::fmt::Display for DatumKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatumKey::Stream {
                stream_id,
                timestamp,
            } => write!(f, "stream {} @ {}", stream_id, timestamp.to_rfc3339()),
            DatumKey::Object {
                kind,
                object_id,
                source_id,
                timestamp,
            } => write!(
                f,
                "{} {} {} @ {}",
                kind,
                object_id,
                source_id,
                timestamp.to_rfc3339()
            ),
        }
    }
}

/// Raw stream datum: property values positionally aligned to a stream schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDatum {
    pub stream_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instantaneous: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accumulating: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl StreamDatum {
    pub fn new(stream_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            stream_id,
            timestamp,
            instantaneous: Vec::new(),
            accumulating: Vec::new(),
            status: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_instantaneous(mut self, values: Vec<f64>) -> Self {
        self.instantaneous = values;
        self
    }

    pub fn with_accumulating(mut self, values: Vec<f64>) -> Self {
        self.accumulating = values;
        self
    }

    pub fn with_status(mut self, values: Vec<String>) -> Self {
        self.status = values;
        self
    }
}

/// Named sample values of an object datum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatumSamples {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instantaneous: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accumulating: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
}

impl DatumSamples {
    pub fn is_empty(&self) -> bool {
        self.instantaneous.is_empty() && self.accumulating.is_empty() && self.status.is_empty()
    }
}

/// Datum keyed by object kind, object id and source id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDatum {
    pub kind: ObjectKind,
    pub object_id: i64,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "DatumSamples::is_empty")]
    pub samples: DatumSamples,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl ObjectDatum {
    pub fn new(
        kind: ObjectKind,
        object_id: i64,
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            object_id,
            source_id: source_id.into(),
            timestamp,
            samples: DatumSamples::default(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_instantaneous(mut self, name: impl Into<String>, value: f64) -> Self {
        self.samples.instantaneous.insert(name.into(), value);
        self
    }

    pub fn with_accumulating(mut self, name: impl Into<String>, value: f64) -> Self {
        self.samples.accumulating.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.samples.status.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// A unit of collector work. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Datum {
    Stream(StreamDatum),
    Object(ObjectDatum),
}

impl Datum {
    /// Derive the key from the value alone.
    pub fn key(&self) -> DatumKey {
        match self {
            Datum::Stream(d) => DatumKey::Stream {
                stream_id: d.stream_id,
                timestamp: d.timestamp,
            },
            Datum::Object(d) => DatumKey::Object {
                kind: d.kind,
                object_id: d.object_id,
                source_id: d.source_id.clone(),
                timestamp: d.timestamp,
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Datum::Stream(d) => d.timestamp,
            Datum::Object(d) => d.timestamp,
        }
    }

    /// Encode as a queue message body.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a queue message body, dispatching on the `"type"` field.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(DecodeError::Json)?;

        match value.get(TYPE_FIELD).and_then(|t| t.as_str()) {
            Some(STREAM_TYPE) | Some(OBJECT_TYPE) => {
                serde_json::from_value(value).map_err(DecodeError::Json)
            }
            Some(other) => Err(DecodeError::UnknownShape(format!(
                "unrecognized datum type '{}'",
                other
            ))),
            None => Err(DecodeError::UnknownShape(
                "missing datum type discriminator".to_string(),
            )),
        }
    }
}

impl From<StreamDatum> for Datum {
    fn from(datum: StreamDatum) -> Self {
        Datum::Stream(datum)
    }
}

impl From<ObjectDatum> for Datum {
    fn from(datum: ObjectDatum) -> Self {
        Datum::Object(datum)
    }
}

/// Errors decoding a queue message into a datum.
#[derive(Debug)]
pub enum DecodeError {
    /// Body is not JSON, or a recognized shape has invalid fields
    Json(serde_json::Error),

    /// Body is JSON but not a recognized datum shape
    UnknownShape(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "Invalid datum JSON: {}", e),
            DecodeError::UnknownShape(msg) => write!(f, "Unknown datum shape: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Json(e) => Some(e),
            DecodeError::UnknownShape(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    fn node_datum() -> Datum {
        ObjectDatum::new(ObjectKind::Node, 42, "/meter/1", ts())
            .with_instantaneous("watts", 1234.5)
            .with_accumulating("wattHours", 98765.0)
            .with_status("phase", "A")
            .with_tag("billing")
            .into()
    }

    #[test]
    fn test_stream_key_derivation() {
        let stream_id = Uuid::new_v4();
        let datum: Datum = StreamDatum::new(stream_id, ts())
            .with_instantaneous(vec![1.0, 2.0])
            .into();

        assert_eq!(
            datum.key(),
            DatumKey::Stream {
                stream_id,
                timestamp: ts()
            }
        );
    }

    #[test]
    fn test_key_ignores_payload() {
        let a: Datum = ObjectDatum::new(ObjectKind::Location, 7, "weather", ts())
            .with_instantaneous("temp", 21.0)
            .into();
        let b: Datum = ObjectDatum::new(ObjectKind::Location, 7, "weather", ts())
            .with_instantaneous("temp", 25.0)
            .into();

        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().storage_id(), b.key().storage_id());
    }

    #[test]
    fn test_storage_id_differs_by_kind() {
        let node = ObjectDatum::new(ObjectKind::Node, 7, "s", ts());
        let location = ObjectDatum::new(ObjectKind::Location, 7, "s", ts());

        assert_ne!(
            Datum::from(node).key().storage_id(),
            Datum::from(location).key().storage_id()
        );
    }

    #[test]
    fn test_encoding_has_discriminator() {
        let json = node_datum().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();

        assert_eq!(value["type"], "object");
        assert_eq!(value["kind"], "node");
        assert_eq!(value["objectId"], 42);
        assert_eq!(value["sourceId"], "/meter/1");
        assert_eq!(value["samples"]["instantaneous"]["watts"], 1234.5);
        assert_eq!(value["tags"][0], "billing");
    }

    #[test]
    fn test_stream_encoding_omits_empty_arrays() {
        let datum: Datum = StreamDatum::new(Uuid::new_v4(), ts())
            .with_accumulating(vec![10.0])
            .into();
        let value: serde_json::Value = serde_json::from_slice(&datum.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "stream");
        assert!(value.get("instantaneous").is_none());
        assert_eq!(value["accumulating"][0], 10.0);
    }

    #[test]
    fn test_decode_matches_original() {
        let datum = node_datum();
        let decoded = Datum::from_json(&datum.to_json().unwrap()).unwrap();

        assert_eq!(decoded, datum);
        assert_eq!(decoded.key(), datum.key());
    }

    #[test]
    fn test_decode_stream_shape() {
        let json = br#"{
            "type": "stream",
            "streamId": "8d3c1a52-7a0e-4b53-9c59-7e8b8d2d0f11",
            "timestamp": "2024-03-01T12:30:00Z",
            "instantaneous": [1.5, 2.5],
            "status": ["ok"]
        }"#;

        let datum = Datum::from_json(json).unwrap();
        match datum {
            Datum::Stream(d) => {
                assert_eq!(d.timestamp, ts());
                assert_eq!(d.instantaneous, vec![1.5, 2.5]);
                assert!(d.accumulating.is_empty());
                assert_eq!(d.status, vec!["ok".to_string()]);
            }
            other => panic!("expected stream datum, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let result = Datum::from_json(br#"{"type": "weather", "id": 1}"#);
        assert!(matches!(result, Err(DecodeError::UnknownShape(_))));
    }

    #[test]
    fn test_decode_missing_type() {
        let result = Datum::from_json(br#"{"nodeId": 1, "sourceId": "a"}"#);
        assert!(matches!(result, Err(DecodeError::UnknownShape(_))));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Datum::from_json(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            Datum::from_json(br#"{"type": "object", "kind": "node"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_key_display() {
        let key = node_datum().key();
        assert_eq!(
            key.to_string(),
            "node 42 /meter/1 @ 2024-03-01T12:30:00+00:00"
        );
    }
}
