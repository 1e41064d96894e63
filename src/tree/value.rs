//! Attribute values bound during decode.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    #[serde(serialize_with = "serialize_hex")]
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) => Some(v),
            Value::Int(v)  => u64::try_from(v).ok(),
            _              => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v)  => Some(v),
            Value::Uint(v) => i64::try_from(v).ok(),
            _              => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _              => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _               => None,
        }
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v)  => write!(f, "{v}"),
            Value::Int(v)   => write!(f, "{v}"),
            Value::Uint(v)  => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v)  => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<u64> for Value { fn from(v: u64) -> Self { Value::Uint(v) } }
impl From<u32> for Value { fn from(v: u32) -> Self { Value::Uint(v.into()) } }
impl From<u16> for Value { fn from(v: u16) -> Self { Value::Uint(v.into()) } }
impl From<u8> for Value { fn from(v: u8) -> Self { Value::Uint(v.into()) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::Text(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::Text(v.to_owned()) } }
impl From<Vec<u8>> for Value { fn from(v: Vec<u8>) -> Self { Value::Bytes(v) } }
