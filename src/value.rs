//! Dynamic values carried in hub messages and the shapes they bind to.
//!
//! Message bytes are untyped until a handler or caller declares what it
//! expects. Both wire formats decode into [`Value`]; a [`Shape`] then checks
//! and normalises a decoded value against the declared decode target.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
    de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor},
};

/// A decoded argument, result or stream item.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value (`null` / `nil`).
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Raw bytes. The text protocol carries these as base64 strings.
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// String-keyed map; insertion order is preserved.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Human-readable name of the variant, used in binding errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool { matches!(self, Value::Nil) }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up `key` in a [`Value::Map`].
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Build a [`Value`] from any serialisable type.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be represented as JSON data.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Value::from)
    }

    /// Deserialize this value into a concrete type.
    ///
    /// Byte strings are presented as sequences of integers.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the shape of `T`.
    pub fn deserialize_into<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::from(self))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Value::Float(n.as_f64().unwrap_or_default()), Value::Int),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.into_iter().map(serde_json::Value::from).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self { Value::Int(i64::from(value)) }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(value: bool) -> Self { Value::Bool(value) }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self { Value::Float(value) }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self { Value::String(value.to_owned()) }
}

impl From<String> for Value {
    fn from(value: String) -> Self { Value::String(value) }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self { Value::Array(value) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self { value.map_or(Value::Nil, Into::into) }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => serializer.serialize_bytes(bytes),
            Value::Array(items) => serializer.collect_seq(items),
            Value::Map(entries) => serializer.collect_map(entries.iter().map(|(k, v)| (k, v))),
        }
    }
}

/// Serialises a [`Value`] for text formats, where bytes travel as base64.
pub(crate) struct TextValue<'a>(pub(crate) &'a Value);

impl Serialize for TextValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Bytes(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            Value::Array(items) => serializer.collect_seq(items.iter().map(TextValue)),
            Value::Map(entries) => {
                serializer.collect_map(entries.iter().map(|(k, v)| (k, TextValue(v))))
            }
            other => other.serialize(serializer),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any hub protocol value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> { Ok(Value::Bool(v)) }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> { Ok(Value::Int(v)) }

    #[expect(
        clippy::cast_precision_loss,
        reason = "integers beyond i64 only survive as floats"
    )]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Float(v as f64), Value::Int))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> { Ok(Value::Float(v)) }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> { Ok(Value::String(v.to_owned())) }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> { Ok(Value::String(v)) }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> { Ok(Value::Bytes(v.to_vec())) }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> { Ok(Value::Bytes(v)) }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> { Ok(Value::Nil) }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> { Ok(Value::Nil) }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<Value, Value>()? {
            let key = match key {
                Value::String(s) => s,
                Value::Int(i) => i.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "map keys must be strings, found {}",
                        other.kind()
                    )));
                }
            };
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Declared decode target for an argument, result or stream item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shape {
    /// Accept any value unchanged.
    #[default]
    Any,
    Bool,
    Int,
    /// Floating point; integers are widened.
    Float,
    String,
    /// Byte array; base64 strings are decoded.
    Bytes,
    /// Homogeneous list of the inner shape.
    List(Box<Shape>),
    /// String-keyed map whose values have the inner shape.
    Map(Box<Shape>),
    /// Any map-like object, left as is.
    Structured,
}

/// Failure to bind a decoded value to a [`Shape`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BindError {
    #[error("Cannot bind {found} to {expected}.")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Invalid base64 byte string: {0}")]
    Base64(String),
}

impl Shape {
    /// Name of the decode target, used in binding errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Shape::Any => "any",
            Shape::Bool => "bool",
            Shape::Int => "integer",
            Shape::Float => "float",
            Shape::String => "string",
            Shape::Bytes => "bytes",
            Shape::List(_) => "list",
            Shape::Map(_) => "map",
            Shape::Structured => "structured value",
        }
    }

    /// Shorthand for `Shape::List(Box::new(inner))`.
    #[must_use]
    pub fn list(inner: Shape) -> Self { Shape::List(Box::new(inner)) }

    /// Shorthand for `Shape::Map(Box::new(inner))`.
    #[must_use]
    pub fn map(inner: Shape) -> Self { Shape::Map(Box::new(inner)) }

    /// Check `value` against this shape, converting where the formats differ.
    ///
    /// # Errors
    ///
    /// Returns [`BindError`] when the value cannot represent this shape.
    #[expect(
        clippy::cast_precision_loss,
        reason = "integer values widen when bound to float parameters"
    )]
    pub fn bind(&self, value: Value) -> Result<Value, BindError> {
        match (self, value) {
            (Shape::Any, v) => Ok(v),
            (
                Shape::String | Shape::Bytes | Shape::List(_) | Shape::Map(_) | Shape::Structured,
                Value::Nil,
            ) => Ok(Value::Nil),
            (Shape::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Shape::Bool, v @ Value::Bool(_))
            | (Shape::Int, v @ Value::Int(_))
            | (Shape::Float, v @ Value::Float(_))
            | (Shape::String, v @ Value::String(_))
            | (Shape::Bytes, v @ Value::Bytes(_))
            | (Shape::Structured, v @ Value::Map(_)) => Ok(v),
            (Shape::Bytes, Value::String(encoded)) => STANDARD
                .decode(encoded.as_bytes())
                .map(Value::Bytes)
                .map_err(|e| BindError::Base64(e.to_string())),
            (Shape::List(inner), Value::Array(items)) => items
                .into_iter()
                .map(|item| inner.bind(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (Shape::Map(inner), Value::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| inner.bind(v).map(|v| (k, v)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Map),
            (shape, found) => Err(BindError::Mismatch {
                expected: shape.name(),
                found: found.kind(),
            }),
        }
    }
}
