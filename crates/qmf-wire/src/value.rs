//! Variant value model for map-encoded QMF bodies.
//!
//! Every QMFv2 body is a map or list of loosely typed values. [`Value`]
//! is the closed set of shapes the agent emits or accepts; maps are
//! `BTreeMap` so iteration (and therefore emission) order is
//! deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use uuid::Uuid;

use crate::error::ConversionError;

/// Ordered string-keyed map of values.
pub type ValueMap = BTreeMap<String, Value>;

/// Ordered list of values.
pub type ValueList = Vec<Value>;

/// A single loosely typed wire value.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    String(String),
    Uuid(Uuid),
    Bytes(#[serde_as(as = "Bytes")] Vec<u8>),
    Map(ValueMap),
    List(ValueList),
}

impl Value {
    /// Name of the variant, used in conversion error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::U64(_) => "u64",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Uuid(_) => "uuid",
            Value::Bytes(_) => "bytes",
            Value::Map(_) => "map",
            Value::List(_) => "list",
        }
    }

    pub fn as_str(&self) -> Result<&str, ConversionError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(ConversionError::UnexpectedType {
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_map(&self) -> Result<&ValueMap, ConversionError> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(ConversionError::UnexpectedType {
                expected: "map",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_list(&self) -> Result<&ValueList, ConversionError> {
        match self {
            Value::List(l) => Ok(l),
            other => Err(ConversionError::UnexpectedType {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }

    /// Read as an unsigned integer. Signed values convert when
    /// non-negative, the usual shape of console-originated numbers.
    pub fn as_u64(&self) -> Result<u64, ConversionError> {
        match self {
            Value::U64(v) => Ok(*v),
            Value::I64(v) if *v >= 0 => Ok(*v as u64),
            other => Err(ConversionError::UnexpectedType {
                expected: "u64",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_u32(&self) -> Result<u32, ConversionError> {
        let v = self.as_u64()?;
        u32::try_from(v).map_err(|_| ConversionError::OutOfRange(v, "u32"))
    }

    pub fn as_u16(&self) -> Result<u16, ConversionError> {
        let v = self.as_u64()?;
        u16::try_from(v).map_err(|_| ConversionError::OutOfRange(v, "u16"))
    }

    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ConversionError::UnexpectedType {
                expected: "bool",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_uuid(&self) -> Result<Uuid, ConversionError> {
        match self {
            Value::Uuid(u) => Ok(*u),
            other => Err(ConversionError::UnexpectedType {
                expected: "uuid",
                found: other.type_name(),
            }),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U64(u64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U64(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<ValueList> for Value {
    fn from(v: ValueList) -> Self {
        Value::List(v)
    }
}

/// Fetch a required key from a map, with a descriptive error when absent.
pub fn require<'a>(map: &'a ValueMap, key: &str) -> Result<&'a Value, ConversionError> {
    map.get(key)
        .ok_or_else(|| ConversionError::MissingKey(key.to_string()))
}
