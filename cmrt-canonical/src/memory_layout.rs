// CMRT - cmrt-canonical
// Module: Memory layout derivation
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Memory layout and flat-slot derivation for the canonical ABI.
//!
//! Every [`ValType`] has a byte size, a power-of-two alignment, and an
//! ordered list of flat core-value slots. Primitives carry fixed
//! descriptors; composites derive theirs from their parts:
//!
//! - tuple/record: fields at successively aligned offsets, overall
//!   alignment the maximum field alignment
//! - variant: discriminant followed by the widened pointwise join of
//!   the case slot lists
//! - list/string: `{i32 ptr, i32 tagged-length}`

use crate::flat::{join, FlatType};
use crate::prelude::*;
use crate::types::{variant_payloads, ValType};

/// Align `ptr` up to `alignment` (a power of two).
pub const fn align_to(ptr: u32, alignment: u32) -> u32 {
    (ptr + alignment - 1) & !(alignment - 1)
}

/// Byte size and alignment of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Size of the type in bytes
    pub size: u32,
    /// Alignment requirement in bytes, a power of two >= 1
    pub alignment: u32,
}

impl MemoryLayout {
    /// Create a new memory layout
    pub const fn new(size: u32, alignment: u32) -> Self {
        Self { size, alignment }
    }
}

/// Discriminant byte width for a variant with `case_count` cases
pub fn discriminant_size(case_count: usize) -> u32 {
    if case_count <= 256 {
        1
    } else if case_count <= 65536 {
        2
    } else {
        4
    }
}

/// Byte width of a flags value with `label_count` labels.
///
/// The codec rejects label counts outside 1..=32 before packing.
pub fn flags_byte_size(label_count: usize) -> u32 {
    if label_count <= 8 {
        1
    } else if label_count <= 16 {
        2
    } else {
        4
    }
}

/// Layout of an optional case payload; unit payloads occupy no space
fn payload_layout(payload: Option<&ValType>) -> MemoryLayout {
    match payload {
        Some(ty) => layout_of(ty),
        None => MemoryLayout::new(0, 1),
    }
}

fn record_layout<'a>(fields: impl Iterator<Item = &'a ValType>) -> MemoryLayout {
    let mut size = 0;
    let mut alignment = 1;
    for ty in fields {
        let field = layout_of(ty);
        size = align_to(size, field.alignment) + field.size;
        alignment = cmp::max(alignment, field.alignment);
    }
    MemoryLayout::new(align_to(size, alignment), alignment)
}

fn variant_layout(payloads: &[Option<&ValType>]) -> MemoryLayout {
    let disc_size = discriminant_size(payloads.len());
    let mut max_case_size = 0;
    let mut max_case_alignment = 1;
    for payload in payloads {
        let case = payload_layout(*payload);
        max_case_size = cmp::max(max_case_size, case.size);
        max_case_alignment = cmp::max(max_case_alignment, case.alignment);
    }
    let alignment = cmp::max(disc_size, max_case_alignment);
    let size = align_to(disc_size, max_case_alignment) + max_case_size;
    MemoryLayout::new(align_to(size, alignment), alignment)
}

/// Compute the memory layout of a type
pub fn layout_of(ty: &ValType) -> MemoryLayout {
    match ty {
        ValType::Bool | ValType::S8 | ValType::U8 => MemoryLayout::new(1, 1),
        ValType::S16 | ValType::U16 => MemoryLayout::new(2, 2),
        ValType::S32 | ValType::U32 | ValType::F32 | ValType::Char => MemoryLayout::new(4, 4),
        ValType::S64 | ValType::U64 | ValType::F64 => MemoryLayout::new(8, 8),
        ValType::String | ValType::List(_) => MemoryLayout::new(8, 4),
        ValType::Record(fields) => record_layout(fields.iter().map(|f| &f.ty)),
        ValType::Tuple(types) => record_layout(types.iter()),
        ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. } => {
            let payloads =
                variant_payloads(ty).expect("variant-like type has case payloads");
            variant_layout(&payloads)
        }
        ValType::Flags(labels) => {
            let width = flags_byte_size(labels.len());
            MemoryLayout::new(width, width)
        }
        ValType::Own(_)
        | ValType::Borrow(_)
        | ValType::Stream(_)
        | ValType::Future(_)
        | ValType::ErrorContext => MemoryLayout::new(4, 4),
    }
}

/// Byte size of a type, after internal padding
pub fn elem_size(ty: &ValType) -> u32 {
    layout_of(ty).size
}

/// Alignment of a type
pub fn alignment_of(ty: &ValType) -> u32 {
    layout_of(ty).alignment
}

/// Maximum alignment across a variant's case payloads
pub(crate) fn max_case_alignment(payloads: &[Option<&ValType>]) -> u32 {
    payloads
        .iter()
        .map(|p| payload_layout(*p).alignment)
        .max()
        .unwrap_or(1)
}

/// Flat slot list of an optional payload
fn payload_flat_types(payload: Option<&ValType>) -> Vec<FlatType> {
    match payload {
        Some(ty) => flat_types(ty),
        None => Vec::new(),
    }
}

/// Compute the ordered flat slot sequence of a type
pub fn flat_types(ty: &ValType) -> Vec<FlatType> {
    match ty {
        ValType::Bool
        | ValType::S8
        | ValType::U8
        | ValType::S16
        | ValType::U16
        | ValType::S32
        | ValType::U32
        | ValType::Char
        | ValType::Flags(_)
        | ValType::Own(_)
        | ValType::Borrow(_)
        | ValType::Stream(_)
        | ValType::Future(_)
        | ValType::ErrorContext => vec![FlatType::I32],
        ValType::S64 | ValType::U64 => vec![FlatType::I64],
        ValType::F32 => vec![FlatType::F32],
        ValType::F64 => vec![FlatType::F64],
        ValType::String | ValType::List(_) => vec![FlatType::I32, FlatType::I32],
        ValType::Record(fields) => {
            fields.iter().flat_map(|f| flat_types(&f.ty)).collect()
        }
        ValType::Tuple(types) => types.iter().flat_map(flat_types).collect(),
        ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. } => {
            let payloads =
                variant_payloads(ty).expect("variant-like type has case payloads");
            variant_flat_types(&payloads)
        }
    }
}

/// Flat slots of a variant: discriminant, then the pointwise join of
/// the case slot lists, padded to the longest case.
pub(crate) fn variant_flat_types(payloads: &[Option<&ValType>]) -> Vec<FlatType> {
    let mut joined: Vec<FlatType> = Vec::new();
    for payload in payloads {
        for (i, ft) in payload_flat_types(*payload).into_iter().enumerate() {
            match joined.get(i) {
                Some(existing) => joined[i] = join(*existing, ft),
                None => joined.push(ft),
            }
        }
    }
    let mut flat = Vec::with_capacity(joined.len() + 1);
    flat.push(FlatType::I32);
    flat.extend(joined);
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordField, VariantCase};

    fn variant(cases: &[Option<ValType>]) -> ValType {
        ValType::Variant(
            cases
                .iter()
                .enumerate()
                .map(|(i, ty)| VariantCase { name: format!("c{i}"), ty: ty.clone() })
                .collect(),
        )
    }

    #[test]
    fn test_primitive_layouts() {
        assert_eq!(layout_of(&ValType::Bool), MemoryLayout::new(1, 1));
        assert_eq!(layout_of(&ValType::U16), MemoryLayout::new(2, 2));
        assert_eq!(layout_of(&ValType::Char), MemoryLayout::new(4, 4));
        assert_eq!(layout_of(&ValType::U64), MemoryLayout::new(8, 8));
        assert_eq!(layout_of(&ValType::String), MemoryLayout::new(8, 4));
        assert_eq!(layout_of(&ValType::list(ValType::F64)), MemoryLayout::new(8, 4));
    }

    #[test]
    fn test_record_layout_respects_field_alignment() {
        // u8 at 0, padding to 4, u32 at 4, u8 at 8, padded size 12
        let ty = ValType::Record(vec![
            RecordField { name: "a".into(), ty: ValType::U8 },
            RecordField { name: "b".into(), ty: ValType::U32 },
            RecordField { name: "c".into(), ty: ValType::U8 },
        ]);
        assert_eq!(layout_of(&ty), MemoryLayout::new(12, 4));
    }

    #[test]
    fn test_empty_record_is_zero_sized() {
        assert_eq!(layout_of(&ValType::Record(Vec::new())), MemoryLayout::new(0, 1));
    }

    #[test]
    fn test_variant_layout() {
        // discriminant byte, padding to 4, u32 payload: size 8, align 4
        let ty = variant(&[Some(ValType::U32), None]);
        assert_eq!(layout_of(&ty), MemoryLayout::new(8, 4));
    }

    #[test]
    fn test_option_matches_two_case_variant() {
        let opt = ValType::option(ValType::F64);
        let var = variant(&[None, Some(ValType::F64)]);
        assert_eq!(layout_of(&opt), layout_of(&var));
        assert_eq!(flat_types(&opt), flat_types(&var));
    }

    #[test]
    fn test_discriminant_widths() {
        assert_eq!(discriminant_size(1), 1);
        assert_eq!(discriminant_size(256), 1);
        assert_eq!(discriminant_size(257), 2);
        assert_eq!(discriminant_size(65536), 2);
        assert_eq!(discriminant_size(65537), 4);
    }

    #[test]
    fn test_flags_widths() {
        assert_eq!(flags_byte_size(1), 1);
        assert_eq!(flags_byte_size(8), 1);
        assert_eq!(flags_byte_size(9), 2);
        assert_eq!(flags_byte_size(16), 2);
        assert_eq!(flags_byte_size(17), 4);
        assert_eq!(flags_byte_size(32), 4);
    }

    #[test]
    fn test_variant_flat_join_widens() {
        // case 0: f32, case 1: i32 -> join is i32; plus discriminant
        let ty = variant(&[Some(ValType::F32), Some(ValType::U32)]);
        assert_eq!(flat_types(&ty), vec![FlatType::I32, FlatType::I32]);

        // f32 vs f64 -> i64
        let ty = variant(&[Some(ValType::F32), Some(ValType::F64)]);
        assert_eq!(flat_types(&ty), vec![FlatType::I32, FlatType::I64]);
    }

    #[test]
    fn test_variant_flat_pads_to_longest_case() {
        let ty = variant(&[Some(ValType::String), None]);
        assert_eq!(
            flat_types(&ty),
            vec![FlatType::I32, FlatType::I32, FlatType::I32]
        );
    }

    #[test]
    fn test_tuple_flat_concatenates() {
        let ty = ValType::Tuple(vec![ValType::U64, ValType::F32, ValType::String]);
        assert_eq!(
            flat_types(&ty),
            vec![FlatType::I64, FlatType::F32, FlatType::I32, FlatType::I32]
        );
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(4, 4), 4);
        assert_eq!(align_to(9, 8), 16);
        assert_eq!(align_to(7, 1), 7);
    }
}
