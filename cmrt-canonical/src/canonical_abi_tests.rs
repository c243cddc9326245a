// CMRT - cmrt-canonical
// Module: Canonical ABI scenario tests
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Cross-cutting scenario and invariant tests for the codec and the
//! instance runtime.

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::async_::events::{unpack_copy_result, CopyResult, EventCode, BLOCKED};
use crate::async_::scheduler::Store;
use crate::async_::streams::{
    canon_stream_drop_writable,
    canon_stream_new,
    canon_stream_read,
    canon_stream_write,
    ElementDescriptor,
};
use crate::async_::task::{spawn_task, Task, TaskPoll};
use crate::call_context::CanonicalOptions;
use crate::canonical_abi::{lift_flat, load, lower_flat, store};
use crate::flat::CoreValueIter;
use crate::instance::ComponentInstance;
use crate::memory_layout::{alignment_of, elem_size};
use crate::prelude::*;
use crate::resources::{
    canon_resource_drop,
    canon_resource_new,
    lift_borrow,
    lower_borrow,
    ResourceType,
};
use crate::string_encoding::{StringEncoding, UTF16_TAG};
use crate::test_support::{async_context, test_context, test_context_with_instance};
use crate::types::{RecordField, ValType, VariantCase};
use crate::values::Value;

fn round_trip_memory(ty: &ValType, v: &Value) -> Value {
    let cx = test_context(4096, StringEncoding::Utf8);
    let ptr = 1024;
    store(&cx, v, ty, ptr).unwrap();
    load(&cx, ty, ptr).unwrap()
}

fn round_trip_flat(ty: &ValType, v: &Value) -> Value {
    let cx = test_context(4096, StringEncoding::Utf8);
    let flat = lower_flat(&cx, v, ty).unwrap();
    let mut it = CoreValueIter::new(&flat);
    let lifted = lift_flat(&cx, &mut it, ty).unwrap();
    assert!(it.done(), "flat slots fully consumed");
    lifted
}

fn sample_pairs() -> Vec<(ValType, Value)> {
    let point = ValType::Record(vec![
        RecordField { name: "x".into(), ty: ValType::U8 },
        RecordField { name: "y".into(), ty: ValType::U32 },
    ]);
    let mixed = ValType::Variant(vec![
        VariantCase { name: "none".into(), ty: None },
        VariantCase { name: "num".into(), ty: Some(ValType::F64) },
        VariantCase { name: "text".into(), ty: Some(ValType::String) },
    ]);
    vec![
        (ValType::Bool, Value::Bool(true)),
        (ValType::S8, Value::S8(-128)),
        (ValType::U16, Value::U16(0xBEEF)),
        (ValType::S32, Value::S32(i32::MIN)),
        (ValType::U64, Value::U64(u64::MAX)),
        (ValType::F32, Value::F32(1.5)),
        (ValType::F64, Value::F64(-2.25)),
        (ValType::Char, Value::Char('\u{10FFFF}')),
        (ValType::String, Value::from("héllo wörld")),
        (ValType::list(ValType::U16), Value::List(vec![Value::U16(1), Value::U16(2)])),
        (
            point.clone(),
            Value::Record(vec![Value::U8(3), Value::U32(70_000)]),
        ),
        (
            ValType::Tuple(vec![ValType::Bool, ValType::S64]),
            Value::Tuple(vec![Value::Bool(false), Value::S64(-9)]),
        ),
        (
            mixed.clone(),
            Value::Variant { case: 2, payload: Some(Box::new(Value::from("deep"))) },
        ),
        (mixed, Value::Variant { case: 0, payload: None }),
        (ValType::Enum(vec!["a".into(), "b".into(), "c".into()]), Value::Enum(2)),
        (ValType::option(ValType::U32), Value::some(Value::U32(7))),
        (ValType::option(ValType::U32), Value::none()),
        (
            ValType::result(Some(ValType::U32), Some(ValType::String)),
            Value::result_err(Some(Value::from("oops"))),
        ),
        (ValType::result(None, None), Value::result_ok(None)),
        (
            ValType::Flags(vec!["r".into(), "w".into(), "x".into()]),
            Value::Flags(0b110),
        ),
        (
            ValType::list(point),
            Value::List(vec![
                Value::Record(vec![Value::U8(1), Value::U32(2)]),
                Value::Record(vec![Value::U8(3), Value::U32(4)]),
            ]),
        ),
    ]
}

#[test]
fn test_memory_round_trips() {
    for (ty, v) in sample_pairs() {
        assert_eq!(round_trip_memory(&ty, &v), v, "memory round trip for {}", ty.family_name());
    }
}

#[test]
fn test_flat_round_trips() {
    for (ty, v) in sample_pairs() {
        assert_eq!(round_trip_flat(&ty, &v), v, "flat round trip for {}", ty.family_name());
    }
}

#[test]
fn test_memory_and_flat_modes_agree() {
    for (ty, v) in sample_pairs() {
        assert_eq!(
            round_trip_memory(&ty, &v),
            round_trip_flat(&ty, &v),
            "modes agree for {}",
            ty.family_name()
        );
    }
}

// Scenario A: list<string> round trip with aligned, non-overlapping
// element buffers
#[test]
fn test_scenario_list_of_strings() {
    let cx = test_context(4096, StringEncoding::Utf8);
    let ty = ValType::list(ValType::String);
    let v = Value::List(vec![Value::from("hello"), Value::from("world"), Value::from("!")]);

    let flat = lower_flat(&cx, &v, &ty).unwrap();
    let list_ptr = flat[0].as_i32().unwrap() as u32;
    let list_len = flat[1].as_i32().unwrap() as u32;
    assert_eq!(list_len, 3);

    // Each element is a (ptr, len) pair; collect and check the buffers
    // do not overlap
    let mut ranges = Vec::new();
    for i in 0..3 {
        let base = list_ptr + i * 8;
        let ptr = cx.opts.memory.read_u32(base).unwrap();
        let len = cx.opts.memory.read_u32(base + 4).unwrap();
        ranges.push((ptr, len));
    }
    assert_eq!(ranges[0].1, 5);
    assert_eq!(ranges[1].1, 5);
    assert_eq!(ranges[2].1, 1);
    let mut sorted = ranges.clone();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "string buffers overlap");
    }

    let mut it = CoreValueIter::new(&flat);
    assert_eq!(lift_flat(&cx, &mut it, &ty).unwrap(), v);
}

// Scenario B: variant { ok(u32), err(string) } lowered as err("oops")
#[test]
fn test_scenario_result_err_layout() {
    let cx = test_context(1024, StringEncoding::Utf8);
    let ty = ValType::result(Some(ValType::U32), Some(ValType::String));
    let v = Value::result_err(Some(Value::from("oops")));

    let ptr = 512;
    store(&cx, &v, &ty, ptr).unwrap();
    // Discriminant byte is 1 (err); payload is aligned to the widest
    // case
    assert_eq!(cx.opts.memory.read(ptr, 1).unwrap(), [1]);
    let payload_ptr = cx.opts.memory.read_u32(ptr + 4).unwrap();
    let payload_len = cx.opts.memory.read_u32(ptr + 8).unwrap();
    assert_eq!(payload_len, 4);
    assert_eq!(cx.opts.memory.read(payload_ptr, 4).unwrap(), b"oops");

    assert_eq!(load(&cx, &ty, ptr).unwrap(), v);
}

// Scenario C: async stream of u8
#[test]
fn test_scenario_async_u8_stream() {
    let inst = Rc::new(ComponentInstance::new());
    let descriptor = ElementDescriptor::new(ValType::U8);
    let packed = canon_stream_new(&inst, descriptor.clone()).unwrap();
    let readable = (packed & 0xFFFF_FFFF) as u32;
    let writable = (packed >> 32) as u32;
    let (cx, _) = async_context(512, &inst);

    // Writer writes [1,2,3,4]
    cx.opts.memory.write(64, &[1, 2, 3, 4]).unwrap();
    let payload = canon_stream_write(&inst, &descriptor, writable, &cx, 64, 4).unwrap();
    assert_eq!(unpack_copy_result(payload).unwrap(), (CopyResult::Completed, 4));

    // Reader asks for 10, gets the 4 available, stays idle, queue
    // drains
    let payload = canon_stream_read(&inst, &descriptor, readable, &cx, 128, 10, false).unwrap();
    assert_eq!(unpack_copy_result(payload).unwrap(), (CopyResult::Completed, 4));
    assert_eq!(cx.opts.memory.read(128, 4).unwrap(), [1, 2, 3, 4]);

    // Writer drops; the next read reports Dropped(0)
    canon_stream_drop_writable(&inst, writable).unwrap();
    let payload = canon_stream_read(&inst, &descriptor, readable, &cx, 128, 1, false).unwrap();
    assert_eq!(unpack_copy_result(payload).unwrap(), (CopyResult::Dropped, 0));
}

// Scenario D: borrow discipline across a call
#[test]
fn test_scenario_borrow_discipline() {
    let (cx, inst) = test_context_with_instance(256, StringEncoding::Utf8);
    const RT: u32 = 1;
    let rt = ResourceType::new(RT, &inst, None);

    let own_index = canon_resource_new(&inst, &rt, 42).unwrap();

    // Lift the own handle as a borrow into this call
    let rep = lift_borrow(&cx, RT, own_index).unwrap();
    assert_eq!(rep, 42);
    let borrow_index = lower_borrow(&cx, RT, rep).unwrap();
    assert_eq!(inst.handles().get(RT, own_index).unwrap().lend_count, 1);
    assert_eq!(cx.borrow_count(), 1);

    // The borrow is released, then the call exits
    canon_resource_drop(&inst, &rt, borrow_index).unwrap();
    assert_eq!(cx.borrow_count(), 0);
    cx.exit_call().unwrap();
    assert_eq!(inst.handles().get(RT, own_index).unwrap().lend_count, 0);

    // After the call the drop succeeds
    canon_resource_drop(&inst, &rt, own_index).unwrap();
}

// Scenario D, trap side: dropping a lent resource during the call
// traps, and the drop consumes the handle regardless
#[test]
fn test_scenario_drop_of_lent_resource_traps() {
    let (cx, inst) = test_context_with_instance(256, StringEncoding::Utf8);
    const RT: u32 = 1;
    let rt = ResourceType::new(RT, &inst, None);

    let own_index = canon_resource_new(&inst, &rt, 7).unwrap();
    lift_borrow(&cx, RT, own_index).unwrap();
    assert_eq!(inst.handles().get(RT, own_index).unwrap().lend_count, 1);

    let err = canon_resource_drop(&inst, &rt, own_index).unwrap_err();
    assert_eq!(err.code, codes::RESOURCE_LENT);
    assert!(inst.handles().get(RT, own_index).is_err());
}

// Scenario E: backpressure between two exclusive tasks
#[test]
fn test_scenario_exclusive_backpressure() {
    let inst = Rc::new(ComponentInstance::new());
    let store_rc = Store::new();

    let sync_options = CanonicalOptions::default();
    let t1 = Task::new(
        Rc::clone(&inst),
        sync_options.clone(),
        None,
        Box::new(|_| {}),
    );
    let mut t1_steps = 0;
    spawn_task(
        &store_rc,
        Rc::clone(&t1),
        Box::new(move |task, _| {
            t1_steps += 1;
            if t1_steps < 2 {
                return Ok(TaskPoll::Pending);
            }
            task.return_result(vec![]).unwrap();
            Ok(TaskPoll::Done)
        }),
    );

    let t2 = Task::new(Rc::clone(&inst), sync_options, None, Box::new(|_| {}));
    let t2_entered = Rc::new(Cell::new(false));
    let entered = Rc::clone(&t2_entered);
    spawn_task(
        &store_rc,
        Rc::clone(&t2),
        Box::new(move |task, _| {
            entered.set(true);
            task.return_result(vec![]).unwrap();
            Ok(TaskPoll::Done)
        }),
    );

    // T1 enters exclusively; T2 joins the waiters
    assert!(store_rc.tick());
    assert!(inst.exclusive());
    assert!(store_rc.tick());
    assert_eq!(inst.num_waiting_to_enter(), 1);
    assert!(!t2_entered.get());

    // T1 exits; the store finds T2 ready, T2 enters
    store_rc.tick_until_idle();
    assert!(t2_entered.get());
    assert_eq!(inst.num_waiting_to_enter(), 0);
    assert!(!inst.exclusive());
}

// Scenario F: NaN canonicalization through memory
#[test]
fn test_scenario_nan_canonicalization() {
    let cx = test_context(64, StringEncoding::Utf8);
    let signalling = f32::from_bits(0x7F80_0001);
    store(&cx, &Value::F32(signalling), &ValType::F32, 0).unwrap();
    let Value::F32(out) = load(&cx, &ValType::F32, 0).unwrap() else {
        panic!("f32 expected")
    };
    assert_eq!(out.to_bits(), 0x7FC0_0000);

    store(&cx, &Value::F32(1.5), &ValType::F32, 4).unwrap();
    let Value::F32(out) = load(&cx, &ValType::F32, 4).unwrap() else {
        panic!("f32 expected")
    };
    assert_eq!(out.to_bits(), 0x3FC0_0000);
}

#[test]
fn test_adaptive_tag_set_iff_wide_code_point() {
    let narrow = test_context(1024, StringEncoding::Latin1Utf16);
    let (_, tagged) =
        crate::string_encoding::store_string_into_range(&narrow, "plain ascii été").unwrap();
    assert_eq!(tagged & UTF16_TAG, 0);

    let wide = test_context(1024, StringEncoding::Latin1Utf16);
    let (_, tagged) =
        crate::string_encoding::store_string_into_range(&wide, "wide → here").unwrap();
    assert_ne!(tagged & UTF16_TAG, 0);
}

#[test]
fn test_stream_handle_values_round_trip_through_codec() {
    let inst = Rc::new(ComponentInstance::new());
    let descriptor = ElementDescriptor::new(ValType::U8);
    let packed = canon_stream_new(&inst, descriptor).unwrap();
    let readable = (packed & 0xFFFF_FFFF) as u32;

    let cx = test_context(64, StringEncoding::Utf8).with_instance(Rc::clone(&inst));
    let ty = ValType::Stream(Box::new(ValType::U8));
    store(&cx, &Value::Stream(readable), &ty, 0).unwrap();
    assert_eq!(load(&cx, &ty, 0).unwrap(), Value::Stream(readable));

    // A mismatched element type traps
    let wrong = ValType::Stream(Box::new(ValType::U32));
    assert!(store(&cx, &Value::Stream(readable), &wrong, 0).is_err());
}

#[test]
fn test_blocked_sentinel_reaches_guest() {
    let inst = Rc::new(ComponentInstance::new());
    let descriptor = ElementDescriptor::new(ValType::U8);
    let packed = canon_stream_new(&inst, descriptor.clone()).unwrap();
    let readable = (packed & 0xFFFF_FFFF) as u32;
    let (cx, events) = async_context(256, &inst);
    assert_eq!(
        canon_stream_read(&inst, &descriptor, readable, &cx, 16, 1, false).unwrap(),
        BLOCKED
    );
    assert!(events.borrow().is_empty());
}

#[test]
fn test_async_completion_is_delivered_via_callback() {
    let inst = Rc::new(ComponentInstance::new());
    let descriptor = ElementDescriptor::new(ValType::U8);
    let packed = canon_stream_new(&inst, descriptor.clone()).unwrap();
    let readable = (packed & 0xFFFF_FFFF) as u32;
    let writable = (packed >> 32) as u32;
    let (cx, events) = async_context(256, &inst);

    canon_stream_read(&inst, &descriptor, readable, &cx, 16, 2, false).unwrap();
    cx.opts.memory.write(32, &[6, 7]).unwrap();
    canon_stream_write(&inst, &descriptor, writable, &cx, 32, 2).unwrap();

    let delivered = events.borrow();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, EventCode::StreamRead);
}

proptest! {
    #[test]
    fn prop_strings_round_trip_all_encodings(s in "\\PC*") {
        for encoding in [
            StringEncoding::Utf8,
            StringEncoding::Utf16Le,
            StringEncoding::Latin1Utf16,
        ] {
            let cx = test_context(s.len() * 4 + 64, encoding);
            let (ptr, tagged) =
                crate::string_encoding::store_string_into_range(&cx, &s).unwrap();
            let loaded =
                crate::string_encoding::load_string_from_range(&cx, ptr, tagged).unwrap();
            prop_assert_eq!(&loaded, &s);
        }
    }

    #[test]
    fn prop_integers_round_trip(x in any::<u32>(), y in any::<i64>()) {
        prop_assert_eq!(
            round_trip_memory(&ValType::U32, &Value::U32(x)),
            Value::U32(x)
        );
        prop_assert_eq!(
            round_trip_flat(&ValType::S64, &Value::S64(y)),
            Value::S64(y)
        );
    }

    #[test]
    fn prop_chars_round_trip(c in any::<char>()) {
        prop_assert_eq!(round_trip_memory(&ValType::Char, &Value::Char(c)), Value::Char(c));
        prop_assert_eq!(round_trip_flat(&ValType::Char, &Value::Char(c)), Value::Char(c));
    }

    #[test]
    fn prop_layout_size_is_aligned(n in 1usize..24) {
        let ty = ValType::Tuple(
            (0..n).map(|i| if i % 2 == 0 { ValType::U8 } else { ValType::U64 }).collect(),
        );
        let size = elem_size(&ty);
        let alignment = alignment_of(&ty);
        prop_assert!(alignment.is_power_of_two());
        prop_assert_eq!(size % alignment, 0);
    }
}
