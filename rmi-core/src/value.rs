//! Application payload values and the pluggable codec that (de)serializes
//! them.
//!
//! Spec §1 treats object serialization as an out-of-scope black box: "the
//! core only requires value round-trip, custom hooks for stub values, and
//! class-descriptor carriage." [`RmiValue`] is that round-trippable value;
//! [`ValueCodec`] is the plug point. [`JsonValueCodec`] is the default
//! implementation, grounded in the teacher's pervasive `serde`/`serde_json`
//! use.
//!
//! `I32` vs `BoxedI32` exist specifically to support spec §8's overload
//! resolution property: a primitive int argument and a boxed-Integer
//! argument must route to distinct method implementations even though both
//! hold the number `5`.

use serde::{Deserialize, Serialize};

use crate::error::RmiError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RmiValue {
    Unit,
    Bool(bool),
    I32(i32),
    /// The boxed/object counterpart of `I32` — same representation, a
    /// distinct type for overload-resolution purposes.
    BoxedI32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<RmiValue>),
}

impl RmiValue {
    /// The type descriptor used for skeleton overload resolution (spec
    /// §4.2: "`(methodName, parameterTypeDescriptors)` and prefers exact
    /// parameter-type match").
    pub fn type_descriptor(&self) -> &'static str {
        match self {
            RmiValue::Unit => "unit",
            RmiValue::Bool(_) => "bool",
            RmiValue::I32(_) => "i32",
            RmiValue::BoxedI32(_) => "boxed_i32",
            RmiValue::I64(_) => "i64",
            RmiValue::Str(_) => "str",
            RmiValue::Bytes(_) => "bytes",
            RmiValue::List(_) => "list",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RmiValue::I32(v) | RmiValue::BoxedI32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RmiValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// The black-box object-serialization codec.
///
/// Applications may swap this out; `rmi-core` ships [`JsonValueCodec`] as
/// the default plugged implementation so the crate is runnable without
/// bringing your own wire format.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &RmiValue) -> Result<Vec<u8>, RmiError>;
    fn decode(&self, bytes: &[u8]) -> Result<RmiValue, RmiError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValueCodec;

impl ValueCodec for JsonValueCodec {
    fn encode(&self, value: &RmiValue) -> Result<Vec<u8>, RmiError> {
        serde_json::to_vec(value).map_err(|e| RmiError::UnmarshalableArgument(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<RmiValue, RmiError> {
        serde_json::from_slice(bytes).map_err(|e| RmiError::Protocol(e.to_string()))
    }
}
