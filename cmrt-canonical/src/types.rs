// CMRT - cmrt-canonical
// Module: Value type catalog
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Value type catalog for the canonical ABI.
//!
//! Every Component Model type is described by a [`ValType`], a closed
//! sum type the codec dispatches on. Layout queries (byte size,
//! alignment, flat slot sequence) live in [`crate::memory_layout`].

use crate::prelude::*;

/// Stable identifier of a resource type.
///
/// Stands in for pointer identity of the resource-type descriptor:
/// handle tables are keyed by this id, and `own`/`borrow` descriptors
/// name the table they index.
pub type ResourceTypeId = u32;

/// A named record field
#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    /// Field label
    pub name: String,
    /// Field type
    pub ty: ValType,
}

/// A variant case, possibly carrying a payload
#[derive(Debug, Clone, PartialEq)]
pub struct VariantCase {
    /// Case label
    pub name: String,
    /// Payload type; `None` for unit cases
    pub ty: Option<ValType>,
}

/// Component Model value types
#[derive(Debug, Clone, PartialEq)]
pub enum ValType {
    /// Boolean
    Bool,
    /// Signed 8-bit integer
    S8,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 16-bit integer
    S16,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 32-bit integer
    S32,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 64-bit integer
    S64,
    /// Unsigned 64-bit integer
    U64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Unicode scalar value
    Char,
    /// String
    String,
    /// Homogeneous list
    List(Box<ValType>),
    /// Record with named fields
    Record(Vec<RecordField>),
    /// Tuple
    Tuple(Vec<ValType>),
    /// Variant with named cases
    Variant(Vec<VariantCase>),
    /// Enumeration (a variant whose cases carry no payload)
    Enum(Vec<String>),
    /// Optional value, equivalent to `variant { none, some(T) }`
    Option(Box<ValType>),
    /// Result value; either side may carry no payload
    Result {
        /// Payload of the `ok` case, if any
        ok: Option<Box<ValType>>,
        /// Payload of the `err` case, if any
        err: Option<Box<ValType>>,
    },
    /// Bit flags with named labels
    Flags(Vec<String>),
    /// Owned resource handle
    Own(ResourceTypeId),
    /// Borrowed resource handle
    Borrow(ResourceTypeId),
    /// Readable stream end carrying elements of the inner type
    Stream(Box<ValType>),
    /// Future carrying a value of the inner type
    Future(Box<ValType>),
    /// Opaque error context handle
    ErrorContext,
}

impl ValType {
    /// Build an `option<ty>` descriptor
    pub fn option(ty: ValType) -> Self {
        ValType::Option(Box::new(ty))
    }

    /// Build a `list<ty>` descriptor
    pub fn list(ty: ValType) -> Self {
        ValType::List(Box::new(ty))
    }

    /// Build a `result<ok, err>` descriptor from optional payloads
    pub fn result(ok: Option<ValType>, err: Option<ValType>) -> Self {
        ValType::Result { ok: ok.map(Box::new), err: err.map(Box::new) }
    }

    /// Does this type lower to a variant layout?
    pub fn is_variant_like(&self) -> bool {
        matches!(
            self,
            ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. }
        )
    }

    /// Short name of the type family, for trap messages
    pub fn family_name(&self) -> &'static str {
        match self {
            ValType::Bool => "bool",
            ValType::S8 => "s8",
            ValType::U8 => "u8",
            ValType::S16 => "s16",
            ValType::U16 => "u16",
            ValType::S32 => "s32",
            ValType::U32 => "u32",
            ValType::S64 => "s64",
            ValType::U64 => "u64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::Char => "char",
            ValType::String => "string",
            ValType::List(_) => "list",
            ValType::Record(_) => "record",
            ValType::Tuple(_) => "tuple",
            ValType::Variant(_) => "variant",
            ValType::Enum(_) => "enum",
            ValType::Option(_) => "option",
            ValType::Result { .. } => "result",
            ValType::Flags(_) => "flags",
            ValType::Own(_) => "own",
            ValType::Borrow(_) => "borrow",
            ValType::Stream(_) => "stream",
            ValType::Future(_) => "future",
            ValType::ErrorContext => "error-context",
        }
    }
}

/// View a variant-like type as its ordered case payloads.
///
/// `variant`, `enum`, `option`, and `result` all share the variant
/// layout; this is the one place that mapping is written down.
pub(crate) fn variant_payloads(ty: &ValType) -> Option<Vec<Option<&ValType>>> {
    match ty {
        ValType::Variant(cases) => Some(cases.iter().map(|c| c.ty.as_ref()).collect()),
        ValType::Enum(labels) => Some(labels.iter().map(|_| None).collect()),
        ValType::Option(some) => Some(vec![None, Some(some.as_ref())]),
        ValType::Result { ok, err } => Some(vec![ok.as_deref(), err.as_deref()]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_payloads_of_option() {
        let ty = ValType::option(ValType::U32);
        let payloads = variant_payloads(&ty).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].is_none());
        assert_eq!(payloads[1], Some(&ValType::U32));
    }

    #[test]
    fn test_variant_payloads_of_result_keeps_unit_sides() {
        // result<_, string>: ok side is a unit, not an absent case
        let ty = ValType::result(None, Some(ValType::String));
        let payloads = variant_payloads(&ty).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].is_none());
        assert_eq!(payloads[1], Some(&ValType::String));
    }

    #[test]
    fn test_variant_payloads_of_enum() {
        let ty = ValType::Enum(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let payloads = variant_payloads(&ty).unwrap();
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(|p| p.is_none()));
    }

    #[test]
    fn test_family_names() {
        assert_eq!(ValType::Bool.family_name(), "bool");
        assert_eq!(ValType::list(ValType::U8).family_name(), "list");
        assert_eq!(ValType::result(None, None).family_name(), "result");
    }
}
