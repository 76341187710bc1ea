//! In-memory representation of marshaled values.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::error::{Error, Result};

/// One decoded or to-be-encoded value. Containers nest; `ay` bodies travel as
/// [`Value::Bytes`] rather than a per-element array, arrays of dict entries
/// travel as a single [`Value::Dict`] mapping, and variants keep their inner
/// signature so the concrete type stays recoverable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Fd(u32),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(BTreeMap<DictKey, Value>),
    Variant(String, Box<Value>),
}

/// Dict keys are restricted to basic types. Doubles are stored by their IEEE
/// bit pattern so the map ordering stays total.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DictKey {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64Bits(u64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Fd(u32),
}

impl Value {
    /// A short name for the value's shape, used in type errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::U8(_) => "u8",
            Value::Bool(_) => "bool",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Fd(_) => "fd",
            Value::Bytes(_) => "byte buffer",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_, _) => "variant",
        }
    }

    /// Widens any integer variant. `Bool`, `F64` and containers are not
    /// integers; the codec rejects them separately so range errors and shape
    /// errors stay distinct.
    pub(crate) fn as_int(&self) -> Option<i128> {
        match *self {
            Value::U8(v) => Some(v.into()),
            Value::I16(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::I32(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::I64(v) => Some(v.into()),
            Value::U64(v) => Some(v.into()),
            Value::Fd(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }
}

impl From<DictKey> for Value {
    fn from(key: DictKey) -> Value {
        match key {
            DictKey::U8(v) => Value::U8(v),
            DictKey::Bool(v) => Value::Bool(v),
            DictKey::I16(v) => Value::I16(v),
            DictKey::U16(v) => Value::U16(v),
            DictKey::I32(v) => Value::I32(v),
            DictKey::U32(v) => Value::U32(v),
            DictKey::I64(v) => Value::I64(v),
            DictKey::U64(v) => Value::U64(v),
            DictKey::F64Bits(bits) => Value::F64(f64::from_bits(bits)),
            DictKey::Str(s) => Value::Str(s),
            DictKey::ObjectPath(s) => Value::ObjectPath(s),
            DictKey::Signature(s) => Value::Signature(s),
            DictKey::Fd(v) => Value::Fd(v),
        }
    }
}

impl TryFrom<Value> for DictKey {
    type Error = Error;

    fn try_from(value: Value) -> Result<DictKey> {
        match value {
            Value::U8(v) => Ok(DictKey::U8(v)),
            Value::Bool(v) => Ok(DictKey::Bool(v)),
            Value::I16(v) => Ok(DictKey::I16(v)),
            Value::U16(v) => Ok(DictKey::U16(v)),
            Value::I32(v) => Ok(DictKey::I32(v)),
            Value::U32(v) => Ok(DictKey::U32(v)),
            Value::I64(v) => Ok(DictKey::I64(v)),
            Value::U64(v) => Ok(DictKey::U64(v)),
            Value::F64(v) => Ok(DictKey::F64Bits(v.to_bits())),
            Value::Str(s) => Ok(DictKey::Str(s)),
            Value::ObjectPath(s) => Ok(DictKey::ObjectPath(s)),
            Value::Signature(s) => Ok(DictKey::Signature(s)),
            Value::Fd(v) => Ok(DictKey::Fd(v)),
            other => Err(Error::TypeMismatch {
                expected: "basic dict key",
                found: other.kind_name(),
            }),
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Value {
        Value::U8(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Value {
        Value::I16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Value {
        Value::U16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::U32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}
