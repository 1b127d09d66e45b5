//! Structured telemetry/control documents.
//!
//! A [`Document`] is a string-keyed mapping of JSON-like values. On the wire it
//! is encoded whole as BSON, the format the existing sensor and camera nodes
//! speak, and is never split across datagrams or messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value; only objects are documents.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Decode(format!(
                "document must be a mapping, got {}",
                value_kind(&other)
            ))),
        }
    }

    /// Converts any serializable type whose representation is a mapping.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(|e| Error::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    /// Default telemetry skeleton: identity, location and metadata fields that
    /// publishers fill once and reuse through templated sends.
    pub fn sensor_template() -> Self {
        let value = json!({
            "sensor_id": null,
            "sensor_type": null,
            "data_type": null,
            "timestamp": null,
            "location": { "lat": null, "lon": null },
            "metadata": { "units": null, "schema_version": "1.0", "tags": [] },
            "data": {}
        });
        match value {
            Value::Object(map) => Self(map),
            _ => unreachable!("json! object literal"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Follows a dotted path through nested mappings, e.g. `"metadata.units"`.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Deep copy of `self` with `overrides` applied.
    ///
    /// Nested mappings merge key by key; any other value (arrays included)
    /// replaces the template's value. Fields absent from the template are added.
    pub fn merged(&self, overrides: &Document) -> Document {
        let mut out = self.0.clone();
        merge_map(&mut out, &overrides.0);
        Document(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bson::to_vec(&self.0)?)
    }

    /// Decodes a whole buffer.
    ///
    /// The little-endian length prefix must cover `bytes` exactly and the
    /// last byte must be the document terminator, so trailing bytes fail.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let declared = bytes.first_chunk::<4>().map(|len| i32::from_le_bytes(*len));
        if declared != i32::try_from(bytes.len()).ok() || bytes.last() != Some(&0) {
            return Err(Error::Decode(format!(
                "{} bytes do not frame one BSON document",
                bytes.len()
            )));
        }
        let map: Map<String, Value> = bson::from_slice(bytes)?;
        Ok(Self(map))
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

fn merge_map(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_map(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_encode_decode_all_value_kinds() {
        let original = doc(json!({
            "sensor_id": "T1",
            "count": 42,
            "offset": -7,
            "reading": 21.5,
            "ok": true,
            "missing": null,
            "tags": ["ambient", 3, false],
            "data": { "value": 22.0, "nested": { "deep": "yes" } }
        }));

        let bytes = original.encode().unwrap();
        let decoded = Document::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(Document::from_value(json!([1, 2, 3])).is_err());
        assert!(Document::decode(&[]).is_err());
        assert!(Document::decode(&[5, 0, 0]).is_err());
    }

    #[test]
    fn test_wire_layout_is_bson() {
        let bytes = doc(json!({"a": "b"})).encode().unwrap();
        assert_eq!(&bytes[..4], &(bytes.len() as i32).to_le_bytes());
        assert_eq!(bytes[4], 0x02);
        assert_eq!(&bytes[5..7], b"a\0");
        assert_eq!(bytes.last(), Some(&0));

        assert!(Document::decode(&[5, 0, 0, 0, 0]).unwrap().is_empty());
    }

    #[test]
    fn test_decodes_document_from_existing_nodes() {
        // {"sensor_id": "T1", "n": 7} as a Python BSON encoder writes it
        let mut bytes = vec![30, 0, 0, 0];
        bytes.push(0x02);
        bytes.extend_from_slice(b"sensor_id\0");
        bytes.extend_from_slice(&[3, 0, 0, 0]);
        bytes.extend_from_slice(b"T1\0");
        bytes.push(0x10);
        bytes.extend_from_slice(b"n\0");
        bytes.extend_from_slice(&[7, 0, 0, 0]);
        bytes.push(0);
        assert_eq!(bytes.len(), 30);

        let decoded = Document::decode(&bytes).unwrap();
        assert_eq!(decoded, doc(json!({"sensor_id": "T1", "n": 7})));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = doc(json!({"a": 1})).encode().unwrap();
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        assert!(Document::decode(&bytes).is_err());
    }

    #[test]
    fn test_jpeg_bytes_are_not_documents() {
        assert!(Document::decode(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).is_err());
    }

    #[test]
    fn test_merge_keeps_template_and_adds_overrides() {
        let template = doc(json!({"sensor_id": "T1", "metadata": {"units": "C"}}));
        let overrides = doc(json!({"data": {"value": 22.0}}));

        let merged = template.merged(&overrides);
        assert_eq!(merged.pointer("metadata.units"), Some(&json!("C")));
        assert_eq!(merged.pointer("data.value"), Some(&json!(22.0)));
        assert_eq!(merged.get("sensor_id"), Some(&json!("T1")));

        // the template itself is untouched
        assert!(template.get("data").is_none());
    }

    #[test]
    fn test_merge_nested_and_replace_arrays() {
        let template = doc(json!({
            "location": {"lat": 27.99, "lon": -82.63},
            "metadata": {"tags": ["a", "b"]}
        }));
        let overrides = doc(json!({
            "location": {"lat": 28.5},
            "metadata": {"tags": ["c"]}
        }));

        let merged = template.merged(&overrides);
        assert_eq!(merged.pointer("location.lat"), Some(&json!(28.5)));
        assert_eq!(merged.pointer("location.lon"), Some(&json!(-82.63)));
        assert_eq!(merged.pointer("metadata.tags"), Some(&json!(["c"])));
    }

    #[test]
    fn test_sensor_template_shape() {
        let template = Document::sensor_template();
        assert_eq!(template.pointer("metadata.schema_version"), Some(&json!("1.0")));
        assert_eq!(template.pointer("location.lat"), Some(&Value::Null));
        assert!(template.pointer("data").unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_from_serializable() {
        #[derive(Serialize)]
        struct Reading {
            sensor_id: &'static str,
            value: f64,
        }

        let document =
            Document::from_serializable(&Reading { sensor_id: "S9", value: 1.5 }).unwrap();
        assert_eq!(document.get("value"), Some(&json!(1.5)));
        assert!(Document::from_serializable(&5u8).is_err());
    }
}
