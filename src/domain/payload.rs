//! Application payloads carried by messages and the job protocol
//!
//! A payload is a tagged union of scalars, lists and string-keyed mappings.
//! Anything that crosses a process boundary is built from these shapes, so
//! serialization never has to guess at an arbitrary object graph.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::domain::error::DispatchError;

/// String-keyed mapping of payloads (results, keyword arguments, ...)
pub type PayloadMap = BTreeMap<String, Payload>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Payload>),
    Map(PayloadMap)
}

impl Payload {
    pub fn str(value: impl Into<String>) -> Self {
        Payload::Str(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = Payload>) -> Self {
        Payload::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Payload)>) -> Self {
        Payload::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Str(s) => Some(s),
            _ => None
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Int(i) => Some(*i),
            _ => None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(b) => Some(*b),
            _ => None
        }
    }

    pub fn as_list(&self) -> Option<&[Payload]> {
        match self {
            Payload::List(items) => Some(items),
            _ => None
        }
    }

    pub fn as_map(&self) -> Option<&PayloadMap> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut PayloadMap> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None
        }
    }

    /// Look up a key when this payload is a mapping
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Look up a required string field of a mapping payload
    pub fn require_str(&self, key: &str) -> Result<&str, DispatchError> {
        self.get(key)
            .and_then(Payload::as_str)
            .ok_or_else(|| DispatchError::Validation(format!("payload field '{}' missing or not a string", key)))
    }

    /// Render as a command-line argument: strings verbatim, everything else as JSON
    pub fn to_arg(&self) -> String {
        match self {
            Payload::Str(s) => s.clone(),
            other => serde_json::Value::from(other.clone()).to_string()
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self.clone()))
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Str(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Str(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Int(value as i64)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Float(value)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(value: Vec<Payload>) -> Self {
        Payload::List(value)
    }
}

impl From<PayloadMap> for Payload {
    fn from(value: PayloadMap) -> Self {
        Payload::Map(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Int(i),
                None => Payload::Float(n.as_f64().unwrap_or_default())
            },
            Value::String(s) => Payload::Str(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Map(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
        }
    }
}

impl From<Payload> for serde_json::Value {
    fn from(value: Payload) -> Self {
        use serde_json::Value;

        match value {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(b),
            Payload::Int(i) => Value::from(i),
            Payload::Float(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            Payload::Str(s) => Value::String(s),
            Payload::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Payload::Map(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
        }
    }
}

/// Versioned binary encoding for payloads crossing process boundaries
///
/// Layout: one version byte followed by a MessagePack document.
pub struct PayloadCodec;

impl PayloadCodec {
    pub const VERSION: u8 = 1;

    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError> {
        let mut buf = vec![Self::VERSION];
        buf.extend(rmp_serde::to_vec(value)?);
        Ok(buf)
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, DispatchError> {
        match bytes.split_first() {
            Some((&Self::VERSION, body)) => Ok(rmp_serde::from_slice(body)?),
            Some((version, _)) => {
                Err(DispatchError::Serialization(format!("unsupported payload encoding version {}", version)))
            }
            None => Err(DispatchError::Serialization("empty payload blob".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Payload {
        Payload::map([
            ("ok", Payload::Bool(true)),
            ("count", Payload::Int(42)),
            ("ratio", Payload::Float(0.25)),
            ("files", Payload::list([Payload::str("a.MS"), Payload::str("b.MS")])),
            ("inner", Payload::map([("none", Payload::Null), ("negative", Payload::Int(-7))]))
        ])
    }

    #[test]
    fn test_codec_preserves_nested_shapes() {
        let value = nested();
        let bytes = PayloadCodec::encode(&value).unwrap();
        assert_eq!(bytes[0], PayloadCodec::VERSION);
        let decoded: Payload = PayloadCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_codec_preserves_argument_lists() {
        let args = vec![Payload::str("/data/L1.MS"), Payload::Int(3), nested()];
        let decoded: Vec<Payload> = PayloadCodec::decode(&PayloadCodec::encode(&args).unwrap()).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_codec_rejects_unknown_version() {
        let mut bytes = PayloadCodec::encode(&Payload::Int(1)).unwrap();
        bytes[0] = 9;
        let err = PayloadCodec::decode::<Payload>(&bytes).unwrap_err();
        assert!(matches!(err, DispatchError::Serialization(_)));
        assert!(PayloadCodec::decode::<Payload>(&[]).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let json: serde_json::Value = serde_json::json!({"ok": true, "n": 2, "x": 1.5, "l": [null, "s"]});
        let payload = Payload::from(json.clone());
        assert_eq!(payload.get("n"), Some(&Payload::Int(2)));
        assert_eq!(payload.get("x"), Some(&Payload::Float(1.5)));
        assert_eq!(serde_json::Value::from(payload), json);
    }

    #[test]
    fn test_to_arg_renders_strings_verbatim() {
        assert_eq!(Payload::str("in.MS").to_arg(), "in.MS");
        assert_eq!(Payload::Int(5).to_arg(), "5");
        assert_eq!(Payload::list([Payload::Int(1)]).to_arg(), "[1]");
    }
}
