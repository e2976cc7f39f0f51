//! Dynamically typed protocol value.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix used to smuggle binary payloads through text formats.
pub const BINARY_PREFIX: &str = "\u{1b}bytes:";

/// A value carried on the wire or stored in a node.
///
/// Text formats encode [`Variant::Binary`] as a [`BINARY_PREFIX`]ed base64
/// string; binary formats use their native byte type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Map(IndexMap<String, Variant>),
    List(Vec<Variant>),
    Binary(Vec<u8>),
}

impl Variant {
    /// Name of the value type as advertised in a node's `$type` config.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Null => "dynamic",
            Variant::Bool(_) => "bool",
            Variant::Int(_) | Variant::Float(_) => "number",
            Variant::String(_) => "string",
            Variant::Map(_) => "map",
            Variant::List(_) => "array",
            Variant::Binary(_) => "binary",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; floats with no fractional part are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            Variant::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Int(i) => Some(*i as f64),
            Variant::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Variant>> {
        match self {
            Variant::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Variant::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a key when this is a map.
    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::String(s) => f.write_str(s),
            other => match serde_json::to_string(other) {
                Ok(s) => f.write_str(&s),
                Err(_) => f.write_str("<unprintable>"),
            },
        }
    }
}

// ── Conversions ─────────────────────────────────────────────────────

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v.into())
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(v: Vec<Variant>) -> Self {
        Variant::List(v)
    }
}

impl From<IndexMap<String, Variant>> for Variant {
    fn from(v: IndexMap<String, Variant>) -> Self {
        Variant::Map(v)
    }
}

impl From<serde_json::Value> for Variant {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Variant::Null,
            Value::Bool(b) => Variant::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Variant::Int(i),
                None => Variant::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => decode_text(s),
            Value::Array(items) => Variant::List(items.into_iter().map(Variant::from).collect()),
            Value::Object(map) => {
                Variant::Map(map.into_iter().map(|(k, v)| (k, Variant::from(v))).collect())
            }
        }
    }
}

fn decode_text(s: String) -> Variant {
    match s.strip_prefix(BINARY_PREFIX) {
        Some(encoded) => match STANDARD.decode(encoded) {
            Ok(bytes) => Variant::Binary(bytes),
            Err(_) => Variant::String(s),
        },
        None => Variant::String(s),
    }
}

// ── Serde ───────────────────────────────────────────────────────────

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Variant::Null => serializer.serialize_unit(),
            Variant::Bool(b) => serializer.serialize_bool(*b),
            Variant::Int(i) => serializer.serialize_i64(*i),
            Variant::Float(f) => serializer.serialize_f64(*f),
            Variant::String(s) => serializer.serialize_str(s),
            Variant::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Variant::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Variant::Binary(bytes) => {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&format!("{BINARY_PREFIX}{}", STANDARD.encode(bytes)))
                } else {
                    serializer.serialize_bytes(bytes)
                }
            }
        }
    }
}

struct VariantVisitor;

impl<'de> Visitor<'de> for VariantVisitor {
    type Value = Variant;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any protocol value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Variant, E> {
        Ok(Variant::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Variant, E> {
        Ok(Variant::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Variant, D::Error> {
        Variant::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Variant, E> {
        Ok(Variant::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Variant, E> {
        Ok(Variant::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Variant, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => Variant::Int(i),
            Err(_) => Variant::Float(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Variant, E> {
        Ok(Variant::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Variant, E> {
        Ok(decode_text(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Variant, E> {
        Ok(decode_text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Variant, E> {
        Ok(Variant::Binary(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Variant, E> {
        Ok(Variant::Binary(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Variant, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Variant::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Variant, A::Error> {
        let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((k, v)) = access.next_entry::<String, Variant>()? {
            map.insert(k, v);
        }
        Ok(Variant::Map(map))
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(VariantVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_uses_prefixed_base64_in_json() {
        let v = Variant::Binary(vec![1, 2, 3]);
        let text = serde_json::to_string(&v).unwrap();
        assert_eq!(text, "\"\\u001bbytes:AQID\"");
        let back: Variant = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn binary_uses_native_bytes_in_msgpack() {
        let v = Variant::Binary(vec![0xde, 0xad]);
        let packed = rmp_serde::to_vec(&v).unwrap();
        // bin8 marker, length 2
        assert_eq!(&packed[..2], &[0xc4, 0x02]);
        let back: Variant = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn from_json_keeps_integers_and_maps() {
        let v = Variant::from(json!({"a": 1, "b": [true, 2.5, null], "c": "x"}));
        assert_eq!(v.get("a"), Some(&Variant::Int(1)));
        assert_eq!(
            v.get("b"),
            Some(&Variant::List(vec![
                Variant::Bool(true),
                Variant::Float(2.5),
                Variant::Null
            ]))
        );
        assert_eq!(v.get("c").and_then(Variant::as_str), Some("x"));
    }

    #[test]
    fn malformed_binary_text_stays_a_string() {
        let v: Variant = serde_json::from_str("\"\\u001bbytes:@@@\"").unwrap();
        assert!(matches!(v, Variant::String(_)));
    }

    #[test]
    fn whole_floats_read_as_integers() {
        assert_eq!(Variant::Float(3.0).as_i64(), Some(3));
        assert_eq!(Variant::Float(3.5).as_i64(), None);
        assert_eq!(Variant::Int(7).as_f64(), Some(7.0));
    }

    #[test]
    fn type_names_match_dsa_types() {
        assert_eq!(Variant::Int(1).type_name(), "number");
        assert_eq!(Variant::Float(1.5).type_name(), "number");
        assert_eq!(Variant::from("s").type_name(), "string");
        assert_eq!(Variant::Null.type_name(), "dynamic");
    }
}
