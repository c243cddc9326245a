// CMRT - cmrt-canonical
// Module: Host value model
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Host-side value representation.
//!
//! [`Value`] is the typed currency of the codec: lifting produces it,
//! lowering consumes it. The shape mirrors [`crate::types::ValType`];
//! the codec traps when a value does not match its declared descriptor.
//!
//! `option` and `result` are kept distinct from general variants so
//! that `result<_, E>`, `result<T, _>` and `result<_, _>` do not
//! collapse into one another.

use crate::prelude::*;
use crate::types::{variant_payloads, ValType};

/// A host-side Component Model value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Signed 8-bit integer
    S8(i8),
    /// Unsigned 8-bit integer
    U8(u8),
    /// Signed 16-bit integer
    S16(i16),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Signed 32-bit integer
    S32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Signed 64-bit integer
    S64(i64),
    /// Unsigned 64-bit integer
    U64(u64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Unicode scalar value
    Char(char),
    /// String (UTF-8 on the host side)
    String(String),
    /// List of values
    List(Vec<Value>),
    /// Record field values in declaration order
    Record(Vec<Value>),
    /// Tuple elements
    Tuple(Vec<Value>),
    /// Variant case index plus optional payload
    Variant {
        /// Zero-based case index
        case: u32,
        /// Case payload; `None` for unit cases
        payload: Option<Box<Value>>,
    },
    /// Enumeration discriminant
    Enum(u32),
    /// Optional value
    Option(Option<Box<Value>>),
    /// Result value; the payload is absent for unit sides
    Result {
        /// Which side this value is on
        is_ok: bool,
        /// Payload of the selected side, if that side has one
        payload: Option<Box<Value>>,
    },
    /// Flag bits, LSB-first in label declaration order
    Flags(u32),
    /// Owned resource, carrying its representation value
    Own(u32),
    /// Borrowed resource, carrying its representation value
    Borrow(u32),
    /// Readable stream end, carrying its instance-table index
    Stream(u32),
    /// Future end, carrying its instance-table index
    Future(u32),
    /// Error context handle
    ErrorContext(u32),
}

impl Value {
    /// Short name of the value family, for trap messages
    pub fn family_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::S8(_) => "s8",
            Value::U8(_) => "u8",
            Value::S16(_) => "s16",
            Value::U16(_) => "u16",
            Value::S32(_) => "s32",
            Value::U32(_) => "u32",
            Value::S64(_) => "s64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Tuple(_) => "tuple",
            Value::Variant { .. } => "variant",
            Value::Enum(_) => "enum",
            Value::Option(_) => "option",
            Value::Result { .. } => "result",
            Value::Flags(_) => "flags",
            Value::Own(_) => "own",
            Value::Borrow(_) => "borrow",
            Value::Stream(_) => "stream",
            Value::Future(_) => "future",
            Value::ErrorContext(_) => "error-context",
        }
    }

    /// Build an `ok` result value
    pub fn result_ok(payload: Option<Value>) -> Self {
        Value::Result { is_ok: true, payload: payload.map(Box::new) }
    }

    /// Build an `err` result value
    pub fn result_err(payload: Option<Value>) -> Self {
        Value::Result { is_ok: false, payload: payload.map(Box::new) }
    }

    /// Build a `some` option value
    pub fn some(payload: Value) -> Self {
        Value::Option(Some(Box::new(payload)))
    }

    /// Build a `none` option value
    pub fn none() -> Self {
        Value::Option(None)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::S32(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
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

/// Decompose a variant-like value into (case index, payload).
///
/// Traps when the value family does not match the descriptor or the
/// case index is out of range.
pub(crate) fn variant_value_parts<'a>(
    v: &'a Value,
    ty: &ValType,
) -> Result<(u32, Option<&'a Value>)> {
    let case_count = variant_payloads(ty)
        .ok_or(Error::type_mismatch("variant descriptor expected"))?
        .len() as u32;
    let (case, payload) = match (v, ty) {
        (Value::Variant { case, payload }, ValType::Variant(_)) => {
            (*case, payload.as_deref())
        }
        (Value::Enum(case), ValType::Enum(_)) => (*case, None),
        (Value::Option(None), ValType::Option(_)) => (0, None),
        (Value::Option(Some(payload)), ValType::Option(_)) => (1, Some(payload.as_ref())),
        (Value::Result { is_ok, payload }, ValType::Result { .. }) => {
            (u32::from(!*is_ok), payload.as_deref())
        }
        _ => return Err(Error::type_mismatch("value does not match variant descriptor")),
    };
    trap_if(case >= case_count, "variant case index out of range")?;
    Ok((case, payload))
}

/// Rebuild a variant-like value from (case index, payload).
pub(crate) fn make_variant_value(
    ty: &ValType,
    case: u32,
    payload: Option<Value>,
) -> Result<Value> {
    Ok(match ty {
        ValType::Variant(_) => Value::Variant { case, payload: payload.map(Box::new) },
        ValType::Enum(_) => Value::Enum(case),
        ValType::Option(_) => match case {
            0 => Value::none(),
            _ => Value::Option(payload.map(Box::new)),
        },
        ValType::Result { .. } => Value::Result {
            is_ok: case == 0,
            payload: payload.map(Box::new),
        },
        _ => return Err(Error::type_mismatch("variant descriptor expected")),
    })
}
