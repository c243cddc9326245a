// CMRT - cmrt-canonical
// Module: Lowering (host to guest)
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Lowering: host values into guest form.
//!
//! [`store`] writes the canonical layout at an aligned pointer;
//! [`lower_flat`] emits the flat slot sequence of the type. Variant
//! lowering widens each case slot to the joined slot kind and pads
//! missing trailing slots with zeroes.

use crate::call_context::LiftLowerContext;
use crate::flat::{i32_reinterpret_f32, i64_reinterpret_f64, FlatType, FlatValue};
use crate::instance::TableEntry;
use crate::memory_layout::{
    align_to,
    alignment_of,
    discriminant_size,
    elem_size,
    flags_byte_size,
    layout_of,
    max_case_alignment,
    variant_flat_types,
};
use crate::prelude::*;
use crate::resources::{lower_borrow, lower_own};
use crate::string_encoding::store_string_into_range;
use crate::types::{variant_payloads, ValType};
use crate::values::{variant_value_parts, Value};

fn type_mismatch(v: &Value, ty: &ValType) -> Error {
    log::debug!("lower mismatch: {} value against {} descriptor", v.family_name(), ty.family_name());
    Error::type_mismatch("value does not match descriptor")
}

fn store_int_le(cx: &LiftLowerContext, value: u64, ptr: u32, nbytes: u32) -> Result<()> {
    let bytes = value.to_le_bytes();
    cx.opts.memory.write(ptr, &bytes[..nbytes as usize])
}

fn flags_bits(cx: &LiftLowerContext, v: &Value, labels: &[String]) -> Result<u32> {
    cx.trap_if(labels.is_empty() || labels.len() > 32, || {
        Error::type_mismatch("flags need between 1 and 32 labels")
    })?;
    let Value::Flags(bits) = v else {
        return Err(cx.trap(Error::type_mismatch("flags value expected")));
    };
    let mask = if labels.len() == 32 { u32::MAX } else { (1 << labels.len()) - 1 };
    Ok(bits & mask)
}

fn check_table_entry(cx: &LiftLowerContext, index: u32, ty: &ValType) -> Result<()> {
    let inst = cx
        .inst
        .as_ref()
        .ok_or(Error::runtime_trap("table handle codec requires an instance context"))?;
    let entry = inst.table().get(index).map_err(|e| cx.trap(e))?;
    let matches = match (ty, &entry) {
        (ValType::Stream(elem), TableEntry::StreamReadable(end)) => {
            end.descriptor().element_type == **elem
        }
        (ValType::Stream(elem), TableEntry::StreamWritable(end)) => {
            end.descriptor().element_type == **elem
        }
        (ValType::Future(elem), TableEntry::FutureReadable(end)) => {
            end.descriptor().element_type == **elem
        }
        (ValType::Future(elem), TableEntry::FutureWritable(end)) => {
            end.descriptor().element_type == **elem
        }
        (ValType::ErrorContext, TableEntry::ErrorContext(_)) => true,
        _ => false,
    };
    cx.trap_if(!matches, || {
        Error::invalid_value(codes::DESCRIPTOR_MISMATCH, "table entry does not match descriptor")
    })
}

/// Lower a list into freshly allocated memory, returning `(ptr, len)`
fn store_list_into_range(
    cx: &LiftLowerContext,
    items: &[Value],
    elem_ty: &ValType,
) -> Result<(u32, u32)> {
    let layout = layout_of(elem_ty);
    let len = items.len() as u32;
    cx.trap_if(layout.size == 0 && len > 0, || {
        Error::new(
            ErrorCategory::Memory,
            codes::ZERO_SIZE_ALLOCATION,
            "zero-size allocation for non-empty list",
        )
    })?;
    if len == 0 {
        return Ok((0, 0));
    }
    let byte_length = u64::from(len) * u64::from(layout.size);
    let byte_length = u32::try_from(byte_length)
        .map_err(|_| Error::invalid_value(codes::STRING_TOO_LONG, "list too long"))?;
    let ptr = cx.opts.realloc(0, 0, layout.alignment, byte_length)?;
    for (i, item) in items.iter().enumerate() {
        store(cx, item, elem_ty, ptr + i as u32 * layout.size)?;
    }
    Ok((ptr, len))
}

fn store_variant(cx: &LiftLowerContext, v: &Value, ty: &ValType, ptr: u32) -> Result<()> {
    let payloads = variant_payloads(ty).expect("variant-like descriptor");
    let (case, payload) = variant_value_parts(v, ty).map_err(|e| cx.trap(e))?;
    let disc_size = discriminant_size(payloads.len());
    store_int_le(cx, u64::from(case), ptr, disc_size)?;
    let payload_ptr = ptr + align_to(disc_size, max_case_alignment(&payloads));
    match (payloads[case as usize], payload) {
        (Some(payload_ty), Some(payload)) => store(cx, payload, payload_ty, payload_ptr),
        (None, None) => Ok(()),
        _ => Err(cx.trap(Error::type_mismatch("variant payload does not match case"))),
    }
}

/// Store `v` with layout `ty` at `ptr` in guest memory
pub fn store(cx: &LiftLowerContext, v: &Value, ty: &ValType, ptr: u32) -> Result<()> {
    let layout = layout_of(ty);
    cx.opts.memory.check_aligned(ptr, layout.alignment).map_err(|e| cx.trap(e))?;
    cx.opts
        .memory
        .check_range(ptr, u64::from(layout.size))
        .map_err(|e| cx.trap(e))?;

    match (ty, v) {
        (ValType::Bool, Value::Bool(b)) => store_int_le(cx, u64::from(*b), ptr, 1),
        (ValType::U8, Value::U8(x)) => store_int_le(cx, u64::from(*x), ptr, 1),
        (ValType::S8, Value::S8(x)) => store_int_le(cx, *x as u8 as u64, ptr, 1),
        (ValType::U16, Value::U16(x)) => store_int_le(cx, u64::from(*x), ptr, 2),
        (ValType::S16, Value::S16(x)) => store_int_le(cx, *x as u16 as u64, ptr, 2),
        (ValType::U32, Value::U32(x)) => store_int_le(cx, u64::from(*x), ptr, 4),
        (ValType::S32, Value::S32(x)) => store_int_le(cx, *x as u32 as u64, ptr, 4),
        (ValType::U64, Value::U64(x)) => store_int_le(cx, *x, ptr, 8),
        (ValType::S64, Value::S64(x)) => store_int_le(cx, *x as u64, ptr, 8),
        (ValType::F32, Value::F32(x)) => store_int_le(cx, u64::from(x.to_bits()), ptr, 4),
        (ValType::F64, Value::F64(x)) => store_int_le(cx, x.to_bits(), ptr, 8),
        (ValType::Char, Value::Char(c)) => store_int_le(cx, u64::from(*c as u32), ptr, 4),
        (ValType::String, Value::String(s)) => {
            let (data_ptr, tagged) = store_string_into_range(cx, s)?;
            cx.opts.memory.write_u32(ptr, data_ptr)?;
            cx.opts.memory.write_u32(ptr + 4, tagged)
        }
        (ValType::List(elem_ty), Value::List(items)) => {
            let (data_ptr, len) = store_list_into_range(cx, items, elem_ty)?;
            cx.opts.memory.write_u32(ptr, data_ptr)?;
            cx.opts.memory.write_u32(ptr + 4, len)
        }
        (ValType::Record(fields), Value::Record(values)) => {
            cx.trap_if(fields.len() != values.len(), || {
                Error::type_mismatch("record arity mismatch")
            })?;
            let mut offset = ptr;
            for (field, value) in fields.iter().zip(values) {
                offset = align_to(offset, alignment_of(&field.ty));
                store(cx, value, &field.ty, offset)?;
                offset += elem_size(&field.ty);
            }
            Ok(())
        }
        (ValType::Tuple(types), Value::Tuple(values)) => {
            cx.trap_if(types.len() != values.len(), || {
                Error::type_mismatch("tuple arity mismatch")
            })?;
            let mut offset = ptr;
            for (elem_ty, value) in types.iter().zip(values) {
                offset = align_to(offset, alignment_of(elem_ty));
                store(cx, value, elem_ty, offset)?;
                offset += elem_size(elem_ty);
            }
            Ok(())
        }
        (ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. }, _) => {
            store_variant(cx, v, ty, ptr)
        }
        (ValType::Flags(labels), _) => {
            let bits = flags_bits(cx, v, labels)?;
            store_int_le(cx, u64::from(bits), ptr, flags_byte_size(labels.len()))
        }
        (ValType::Own(rt), Value::Own(rep)) => {
            let index = lower_own(cx, *rt, *rep)?;
            cx.opts.memory.write_u32(ptr, index)
        }
        (ValType::Borrow(rt), Value::Borrow(rep)) => {
            let index = lower_borrow(cx, *rt, *rep)?;
            cx.opts.memory.write_u32(ptr, index)
        }
        (ValType::Stream(_), Value::Stream(index))
        | (ValType::Future(_), Value::Future(index))
        | (ValType::ErrorContext, Value::ErrorContext(index)) => {
            check_table_entry(cx, *index, ty)?;
            cx.opts.memory.write_u32(ptr, *index)
        }
        _ => Err(cx.trap(type_mismatch(v, ty))),
    }
}

/// Widen one lowered slot to the joined slot kind
fn widen(value: FlatValue, want: FlatType) -> Result<FlatValue> {
    Ok(match (value, want) {
        (FlatValue::F32(x), FlatType::I32) => FlatValue::I32(i32_reinterpret_f32(x)),
        (FlatValue::I32(x), FlatType::I64) => FlatValue::I64(i64::from(x as u32)),
        (FlatValue::F32(x), FlatType::I64) => {
            FlatValue::I64(i64::from(i32_reinterpret_f32(x) as u32))
        }
        (FlatValue::F64(x), FlatType::I64) => FlatValue::I64(i64_reinterpret_f64(x)),
        (value, want) => {
            trap_if(value.ty() != want, "variant slot cannot widen to joined kind")?;
            value
        }
    })
}

const fn zero_of(ty: FlatType) -> FlatValue {
    match ty {
        FlatType::I32 => FlatValue::I32(0),
        FlatType::I64 => FlatValue::I64(0),
        FlatType::F32 => FlatValue::F32(0.0),
        FlatType::F64 => FlatValue::F64(0.0),
    }
}

fn lower_flat_variant(
    cx: &LiftLowerContext,
    v: &Value,
    ty: &ValType,
    out: &mut Vec<FlatValue>,
) -> Result<()> {
    let payloads = variant_payloads(ty).expect("variant-like descriptor");
    let (case, payload) = variant_value_parts(v, ty).map_err(|e| cx.trap(e))?;
    let joined = variant_flat_types(&payloads);
    out.push(FlatValue::I32(case as i32));

    let mut case_slots = Vec::new();
    match (payloads[case as usize], payload) {
        (Some(payload_ty), Some(payload)) => {
            lower_flat_into(cx, payload, payload_ty, &mut case_slots)?
        }
        (None, None) => {}
        _ => return Err(cx.trap(Error::type_mismatch("variant payload does not match case"))),
    }

    for (i, want) in joined[1..].iter().enumerate() {
        match case_slots.get(i) {
            Some(slot) => out.push(widen(*slot, *want)?),
            None => out.push(zero_of(*want)),
        }
    }
    Ok(())
}

fn lower_flat_into(
    cx: &LiftLowerContext,
    v: &Value,
    ty: &ValType,
    out: &mut Vec<FlatValue>,
) -> Result<()> {
    match (ty, v) {
        (ValType::Bool, Value::Bool(b)) => out.push(FlatValue::I32(i32::from(*b))),
        (ValType::U8, Value::U8(x)) => out.push(FlatValue::I32(i32::from(*x))),
        (ValType::S8, Value::S8(x)) => out.push(FlatValue::I32(i32::from(*x))),
        (ValType::U16, Value::U16(x)) => out.push(FlatValue::I32(i32::from(*x))),
        (ValType::S16, Value::S16(x)) => out.push(FlatValue::I32(i32::from(*x))),
        (ValType::U32, Value::U32(x)) => out.push(FlatValue::I32(*x as i32)),
        (ValType::S32, Value::S32(x)) => out.push(FlatValue::I32(*x)),
        (ValType::U64, Value::U64(x)) => out.push(FlatValue::I64(*x as i64)),
        (ValType::S64, Value::S64(x)) => out.push(FlatValue::I64(*x)),
        (ValType::F32, Value::F32(x)) => out.push(FlatValue::F32(canonicalize_nan32(*x))),
        (ValType::F64, Value::F64(x)) => out.push(FlatValue::F64(canonicalize_nan64(*x))),
        (ValType::Char, Value::Char(c)) => out.push(FlatValue::I32(*c as u32 as i32)),
        (ValType::String, Value::String(s)) => {
            let (ptr, tagged) = store_string_into_range(cx, s)?;
            out.push(FlatValue::I32(ptr as i32));
            out.push(FlatValue::I32(tagged as i32));
        }
        (ValType::List(elem_ty), Value::List(items)) => {
            let (ptr, len) = store_list_into_range(cx, items, elem_ty)?;
            out.push(FlatValue::I32(ptr as i32));
            out.push(FlatValue::I32(len as i32));
        }
        (ValType::Record(fields), Value::Record(values)) => {
            cx.trap_if(fields.len() != values.len(), || {
                Error::type_mismatch("record arity mismatch")
            })?;
            for (field, value) in fields.iter().zip(values) {
                lower_flat_into(cx, value, &field.ty, out)?;
            }
        }
        (ValType::Tuple(types), Value::Tuple(values)) => {
            cx.trap_if(types.len() != values.len(), || {
                Error::type_mismatch("tuple arity mismatch")
            })?;
            for (elem_ty, value) in types.iter().zip(values) {
                lower_flat_into(cx, value, elem_ty, out)?;
            }
        }
        (ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. }, _) => {
            lower_flat_variant(cx, v, ty, out)?
        }
        (ValType::Flags(labels), _) => {
            out.push(FlatValue::I32(flags_bits(cx, v, labels)? as i32))
        }
        (ValType::Own(rt), Value::Own(rep)) => {
            out.push(FlatValue::I32(lower_own(cx, *rt, *rep)? as i32))
        }
        (ValType::Borrow(rt), Value::Borrow(rep)) => {
            out.push(FlatValue::I32(lower_borrow(cx, *rt, *rep)? as i32))
        }
        (ValType::Stream(_), Value::Stream(index))
        | (ValType::Future(_), Value::Future(index))
        | (ValType::ErrorContext, Value::ErrorContext(index)) => {
            check_table_entry(cx, *index, ty)?;
            out.push(FlatValue::I32(*index as i32));
        }
        _ => return Err(cx.trap(type_mismatch(v, ty))),
    }
    Ok(())
}

/// Replace any NaN with the canonical f32 NaN pattern
pub(crate) fn canonicalize_nan32(x: f32) -> f32 {
    if x.is_nan() {
        f32::from_bits(0x7FC0_0000)
    } else {
        x
    }
}

/// Replace any NaN with the canonical f64 NaN pattern
pub(crate) fn canonicalize_nan64(x: f64) -> f64 {
    if x.is_nan() {
        f64::from_bits(0x7FF8_0000_0000_0000)
    } else {
        x
    }
}

/// Lower `v` into the flat slot sequence declared by `ty`
pub fn lower_flat(cx: &LiftLowerContext, v: &Value, ty: &ValType) -> Result<Vec<FlatValue>> {
    let mut out = Vec::new();
    lower_flat_into(cx, v, ty, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string_encoding::StringEncoding;
    use crate::test_support::test_context;
    use crate::types::VariantCase;

    #[test]
    fn test_store_integers_little_endian() {
        let cx = test_context(64, StringEncoding::Utf8);
        store(&cx, &Value::U32(0x0102_0304), &ValType::U32, 8).unwrap();
        assert_eq!(cx.opts.memory.read(8, 4).unwrap(), [4, 3, 2, 1]);
        store(&cx, &Value::S16(-2), &ValType::S16, 4).unwrap();
        assert_eq!(cx.opts.memory.read(4, 2).unwrap(), [0xFE, 0xFF]);
    }

    #[test]
    fn test_store_misaligned_traps() {
        let cx = test_context(64, StringEncoding::Utf8);
        let err = store(&cx, &Value::U32(1), &ValType::U32, 2).unwrap_err();
        assert!(err.is_memory_error());
    }

    #[test]
    fn test_store_out_of_bounds_traps() {
        let cx = test_context(8, StringEncoding::Utf8);
        assert!(store(&cx, &Value::U64(1), &ValType::U64, 8).is_err());
    }

    #[test]
    fn test_store_value_type_mismatch_traps() {
        let cx = test_context(64, StringEncoding::Utf8);
        let err = store(&cx, &Value::U8(1), &ValType::U32, 0).unwrap_err();
        assert_eq!(err.code, codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_store_variant_writes_discriminant_and_payload() {
        let cx = test_context(64, StringEncoding::Utf8);
        let ty = ValType::Variant(vec![
            VariantCase { name: "ok".into(), ty: Some(ValType::U32) },
            VariantCase { name: "err".into(), ty: None },
        ]);
        let v = Value::Variant { case: 0, payload: Some(Box::new(Value::U32(9))) };
        store(&cx, &v, &ty, 8).unwrap();
        assert_eq!(cx.opts.memory.read(8, 1).unwrap(), [0]);
        assert_eq!(cx.opts.memory.read_u32(12).unwrap(), 9);
    }

    #[test]
    fn test_store_flags_packs_lsb_first() {
        let cx = test_context(64, StringEncoding::Utf8);
        let ty = ValType::Flags(vec!["a".into(), "b".into(), "c".into()]);
        store(&cx, &Value::Flags(0b101), &ty, 0).unwrap();
        assert_eq!(cx.opts.memory.read(0, 1).unwrap(), [0b101]);
    }

    #[test]
    fn test_flags_high_bits_masked() {
        let cx = test_context(64, StringEncoding::Utf8);
        let ty = ValType::Flags(vec!["a".into()]);
        store(&cx, &Value::Flags(0xFF), &ty, 0).unwrap();
        assert_eq!(cx.opts.memory.read(0, 1).unwrap(), [1]);
    }

    #[test]
    fn test_lower_flat_primitives() {
        let cx = test_context(64, StringEncoding::Utf8);
        assert_eq!(
            lower_flat(&cx, &Value::Bool(true), &ValType::Bool).unwrap(),
            vec![FlatValue::I32(1)]
        );
        assert_eq!(
            lower_flat(&cx, &Value::S8(-1), &ValType::S8).unwrap(),
            vec![FlatValue::I32(-1)]
        );
        assert_eq!(
            lower_flat(&cx, &Value::U64(5), &ValType::U64).unwrap(),
            vec![FlatValue::I64(5)]
        );
    }

    #[test]
    fn test_lower_flat_tuple_concatenates() {
        let cx = test_context(64, StringEncoding::Utf8);
        let ty = ValType::Tuple(vec![ValType::U32, ValType::F64]);
        let v = Value::Tuple(vec![Value::U32(1), Value::F64(2.0)]);
        assert_eq!(
            lower_flat(&cx, &v, &ty).unwrap(),
            vec![FlatValue::I32(1), FlatValue::F64(2.0)]
        );
    }

    #[test]
    fn test_lower_flat_variant_widens_and_pads() {
        let cx = test_context(64, StringEncoding::Utf8);
        // join(f32, string-flats) = [i32, i32]; f32 case widens slot 0,
        // pads slot 1
        let ty = ValType::Variant(vec![
            VariantCase { name: "num".into(), ty: Some(ValType::F32) },
            VariantCase { name: "text".into(), ty: Some(ValType::String) },
        ]);
        let v = Value::Variant { case: 0, payload: Some(Box::new(Value::F32(1.5))) };
        let flat = lower_flat(&cx, &v, &ty).unwrap();
        assert_eq!(
            flat,
            vec![
                FlatValue::I32(0),
                FlatValue::I32(0x3FC0_0000),
                FlatValue::I32(0),
            ]
        );
    }

    #[test]
    fn test_lower_flat_canonicalizes_nan() {
        let cx = test_context(64, StringEncoding::Utf8);
        let signalling = f32::from_bits(0x7F80_0001);
        let flat = lower_flat(&cx, &Value::F32(signalling), &ValType::F32).unwrap();
        let FlatValue::F32(out) = flat[0] else { panic!("f32 slot expected") };
        assert_eq!(out.to_bits(), 0x7FC0_0000);
    }

    #[test]
    fn test_zero_size_element_list_traps() {
        let cx = test_context(64, StringEncoding::Utf8);
        let unit = ValType::Record(Vec::new());
        let ty = ValType::list(unit);
        let v = Value::List(vec![Value::Record(Vec::new())]);
        let err = lower_flat(&cx, &v, &ty).unwrap_err();
        assert_eq!(err.code, codes::ZERO_SIZE_ALLOCATION);
    }
}
