// CMRT - cmrt-canonical
// Module: Lifting (guest to host)
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Lifting: guest form into host values.
//!
//! [`load`] reads the canonical layout at an aligned pointer;
//! [`lift_flat`] consumes a pull-iterator over incoming flat slots.
//! Variant lifting reads the payload through a coerce iterator that
//! narrows the joined slot kinds back to the selected case, then
//! drains the slots the case did not use. Floats canonicalize NaN
//! payloads on the way in.

use crate::call_context::LiftLowerContext;
use crate::canonical_abi::lower::{canonicalize_nan32, canonicalize_nan64};
use crate::flat::{CoerceValueIter, FlatSource, FlatType};
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
use crate::resources::{lift_borrow, lift_own};
use crate::string_encoding::load_string_from_range;
use crate::types::{variant_payloads, ValType};
use crate::values::{make_variant_value, Value};

fn load_int_le(cx: &LiftLowerContext, ptr: u32, nbytes: u32) -> Result<u64> {
    let bytes = cx.opts.memory.read(ptr, nbytes)?;
    let mut buffer = [0u8; 8];
    buffer[..nbytes as usize].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(buffer))
}

fn lift_char(cx: &LiftLowerContext, code_point: u32) -> Result<char> {
    char::from_u32(code_point).ok_or_else(|| {
        cx.trap(Error::invalid_value(
            codes::INVALID_CHAR,
            "char outside Unicode scalar range",
        ))
    })
}

fn flags_mask(cx: &LiftLowerContext, labels: &[String]) -> Result<u32> {
    cx.trap_if(labels.is_empty() || labels.len() > 32, || {
        Error::type_mismatch("flags need between 1 and 32 labels")
    })?;
    Ok(if labels.len() == 32 { u32::MAX } else { (1 << labels.len()) - 1 })
}

fn lift_table_index(cx: &LiftLowerContext, index: u32, ty: &ValType) -> Result<Value> {
    let inst = cx
        .inst
        .as_ref()
        .ok_or(Error::runtime_trap("table handle codec requires an instance context"))?;
    let entry = inst.table().get(index).map_err(|e| cx.trap(e))?;
    let value = match (ty, &entry) {
        (ValType::Stream(elem), TableEntry::StreamReadable(end))
            if end.descriptor().element_type == **elem =>
        {
            Value::Stream(index)
        }
        (ValType::Stream(elem), TableEntry::StreamWritable(end))
            if end.descriptor().element_type == **elem =>
        {
            Value::Stream(index)
        }
        (ValType::Future(elem), TableEntry::FutureReadable(end))
            if end.descriptor().element_type == **elem =>
        {
            Value::Future(index)
        }
        (ValType::Future(elem), TableEntry::FutureWritable(end))
            if end.descriptor().element_type == **elem =>
        {
            Value::Future(index)
        }
        (ValType::ErrorContext, TableEntry::ErrorContext(_)) => Value::ErrorContext(index),
        _ => {
            return Err(cx.trap(Error::invalid_value(
                codes::DESCRIPTOR_MISMATCH,
                "table entry does not match descriptor",
            )))
        }
    };
    Ok(value)
}

fn load_list_from_range(
    cx: &LiftLowerContext,
    ptr: u32,
    length: u32,
    elem_ty: &ValType,
) -> Result<Value> {
    let layout = layout_of(elem_ty);
    cx.opts.memory.check_aligned(ptr, layout.alignment).map_err(|e| cx.trap(e))?;
    cx.opts
        .memory
        .check_range(ptr, u64::from(length) * u64::from(layout.size))
        .map_err(|e| cx.trap(e))?;
    let mut items = Vec::with_capacity(length as usize);
    for i in 0..length {
        items.push(load(cx, elem_ty, ptr + i * layout.size)?);
    }
    Ok(Value::List(items))
}

fn load_variant(cx: &LiftLowerContext, ty: &ValType, ptr: u32) -> Result<Value> {
    let payloads = variant_payloads(ty).expect("variant-like descriptor");
    let disc_size = discriminant_size(payloads.len());
    let case = load_int_le(cx, ptr, disc_size)? as u32;
    cx.trap_if(case as usize >= payloads.len(), || {
        Error::invalid_value(codes::INVALID_DISCRIMINANT, "variant discriminant out of range")
    })?;
    let payload_ptr = ptr + align_to(disc_size, max_case_alignment(&payloads));
    let payload = match payloads[case as usize] {
        Some(payload_ty) => Some(load(cx, payload_ty, payload_ptr)?),
        None => None,
    };
    make_variant_value(ty, case, payload)
}

/// Load a value of type `ty` from `ptr` in guest memory
pub fn load(cx: &LiftLowerContext, ty: &ValType, ptr: u32) -> Result<Value> {
    let layout = layout_of(ty);
    cx.opts.memory.check_aligned(ptr, layout.alignment).map_err(|e| cx.trap(e))?;
    cx.opts
        .memory
        .check_range(ptr, u64::from(layout.size))
        .map_err(|e| cx.trap(e))?;

    match ty {
        ValType::Bool => Ok(Value::Bool(load_int_le(cx, ptr, 1)? != 0)),
        ValType::U8 => Ok(Value::U8(load_int_le(cx, ptr, 1)? as u8)),
        ValType::S8 => Ok(Value::S8(load_int_le(cx, ptr, 1)? as u8 as i8)),
        ValType::U16 => Ok(Value::U16(load_int_le(cx, ptr, 2)? as u16)),
        ValType::S16 => Ok(Value::S16(load_int_le(cx, ptr, 2)? as u16 as i16)),
        ValType::U32 => Ok(Value::U32(load_int_le(cx, ptr, 4)? as u32)),
        ValType::S32 => Ok(Value::S32(load_int_le(cx, ptr, 4)? as u32 as i32)),
        ValType::U64 => Ok(Value::U64(load_int_le(cx, ptr, 8)?)),
        ValType::S64 => Ok(Value::S64(load_int_le(cx, ptr, 8)? as i64)),
        ValType::F32 => Ok(Value::F32(canonicalize_nan32(f32::from_bits(
            load_int_le(cx, ptr, 4)? as u32,
        )))),
        ValType::F64 => Ok(Value::F64(canonicalize_nan64(f64::from_bits(
            load_int_le(cx, ptr, 8)?,
        )))),
        ValType::Char => {
            let code_point = load_int_le(cx, ptr, 4)? as u32;
            Ok(Value::Char(lift_char(cx, code_point)?))
        }
        ValType::String => {
            let data_ptr = cx.opts.memory.read_u32(ptr)?;
            let tagged = cx.opts.memory.read_u32(ptr + 4)?;
            Ok(Value::String(load_string_from_range(cx, data_ptr, tagged)?))
        }
        ValType::List(elem_ty) => {
            let data_ptr = cx.opts.memory.read_u32(ptr)?;
            let length = cx.opts.memory.read_u32(ptr + 4)?;
            load_list_from_range(cx, data_ptr, length, elem_ty)
        }
        ValType::Record(fields) => {
            let mut offset = ptr;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                offset = align_to(offset, alignment_of(&field.ty));
                values.push(load(cx, &field.ty, offset)?);
                offset += elem_size(&field.ty);
            }
            Ok(Value::Record(values))
        }
        ValType::Tuple(types) => {
            let mut offset = ptr;
            let mut values = Vec::with_capacity(types.len());
            for elem_ty in types {
                offset = align_to(offset, alignment_of(elem_ty));
                values.push(load(cx, elem_ty, offset)?);
                offset += elem_size(elem_ty);
            }
            Ok(Value::Tuple(values))
        }
        ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. } => {
            load_variant(cx, ty, ptr)
        }
        ValType::Flags(labels) => {
            let mask = flags_mask(cx, labels)?;
            let bits = load_int_le(cx, ptr, flags_byte_size(labels.len()))? as u32;
            Ok(Value::Flags(bits & mask))
        }
        ValType::Own(rt) => {
            let index = cx.opts.memory.read_u32(ptr)?;
            Ok(Value::Own(lift_own(cx, *rt, index)?))
        }
        ValType::Borrow(rt) => {
            let index = cx.opts.memory.read_u32(ptr)?;
            Ok(Value::Borrow(lift_borrow(cx, *rt, index)?))
        }
        ValType::Stream(_) | ValType::Future(_) | ValType::ErrorContext => {
            let index = cx.opts.memory.read_u32(ptr)?;
            lift_table_index(cx, index, ty)
        }
    }
}

fn lift_flat_variant(
    cx: &LiftLowerContext,
    source: &mut dyn FlatSource,
    ty: &ValType,
) -> Result<Value> {
    let payloads = variant_payloads(ty).expect("variant-like descriptor");
    let case = source.next(FlatType::I32)?.as_i32()? as u32;
    cx.trap_if(case as usize >= payloads.len(), || {
        Error::invalid_value(codes::INVALID_DISCRIMINANT, "variant discriminant out of range")
    })?;
    let joined = variant_flat_types(&payloads);
    let mut coerce = CoerceValueIter::new(source, &joined[1..]);
    let payload = match payloads[case as usize] {
        Some(payload_ty) => Some(lift_flat(cx, &mut coerce, payload_ty)?),
        None => None,
    };
    coerce.drain()?;
    make_variant_value(ty, case, payload)
}

/// Lift a value of type `ty` from incoming flat slots
pub fn lift_flat(
    cx: &LiftLowerContext,
    source: &mut dyn FlatSource,
    ty: &ValType,
) -> Result<Value> {
    match ty {
        ValType::Bool => Ok(Value::Bool(source.next(FlatType::I32)?.as_i32()? != 0)),
        ValType::U8 => Ok(Value::U8(source.next(FlatType::I32)?.as_i32()? as u8)),
        ValType::S8 => Ok(Value::S8(source.next(FlatType::I32)?.as_i32()? as u8 as i8)),
        ValType::U16 => Ok(Value::U16(source.next(FlatType::I32)?.as_i32()? as u16)),
        ValType::S16 => Ok(Value::S16(source.next(FlatType::I32)?.as_i32()? as u16 as i16)),
        ValType::U32 => Ok(Value::U32(source.next(FlatType::I32)?.as_i32()? as u32)),
        ValType::S32 => Ok(Value::S32(source.next(FlatType::I32)?.as_i32()?)),
        ValType::U64 => Ok(Value::U64(source.next(FlatType::I64)?.as_i64()? as u64)),
        ValType::S64 => Ok(Value::S64(source.next(FlatType::I64)?.as_i64()?)),
        ValType::F32 => Ok(Value::F32(canonicalize_nan32(source.next(FlatType::F32)?.as_f32()?))),
        ValType::F64 => Ok(Value::F64(canonicalize_nan64(source.next(FlatType::F64)?.as_f64()?))),
        ValType::Char => {
            let code_point = source.next(FlatType::I32)?.as_i32()? as u32;
            Ok(Value::Char(lift_char(cx, code_point)?))
        }
        ValType::String => {
            let data_ptr = source.next(FlatType::I32)?.as_i32()? as u32;
            let tagged = source.next(FlatType::I32)?.as_i32()? as u32;
            Ok(Value::String(load_string_from_range(cx, data_ptr, tagged)?))
        }
        ValType::List(elem_ty) => {
            let data_ptr = source.next(FlatType::I32)?.as_i32()? as u32;
            let length = source.next(FlatType::I32)?.as_i32()? as u32;
            load_list_from_range(cx, data_ptr, length, elem_ty)
        }
        ValType::Record(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push(lift_flat(cx, source, &field.ty)?);
            }
            Ok(Value::Record(values))
        }
        ValType::Tuple(types) => {
            let mut values = Vec::with_capacity(types.len());
            for elem_ty in types {
                values.push(lift_flat(cx, source, elem_ty)?);
            }
            Ok(Value::Tuple(values))
        }
        ValType::Variant(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result { .. } => {
            lift_flat_variant(cx, source, ty)
        }
        ValType::Flags(labels) => {
            let mask = flags_mask(cx, labels)?;
            let bits = source.next(FlatType::I32)?.as_i32()? as u32;
            Ok(Value::Flags(bits & mask))
        }
        ValType::Own(rt) => {
            let index = source.next(FlatType::I32)?.as_i32()? as u32;
            Ok(Value::Own(lift_own(cx, *rt, index)?))
        }
        ValType::Borrow(rt) => {
            let index = source.next(FlatType::I32)?.as_i32()? as u32;
            Ok(Value::Borrow(lift_borrow(cx, *rt, index)?))
        }
        ValType::Stream(_) | ValType::Future(_) | ValType::ErrorContext => {
            let index = source.next(FlatType::I32)?.as_i32()? as u32;
            lift_table_index(cx, index, ty)
        }
    }
}
