// CMRT - cmrt-canonical
// Module: Shared test fixtures
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Shared fixtures for unit and scenario tests: a bump allocator over
//! a [`GuestMemory`] and context constructors.

use crate::async_::events::EventCode;
use crate::call_context::{
    CanonicalOptions,
    GuestMemory,
    GuestRealloc,
    LiftLowerContext,
    LiftLowerOptions,
};
use crate::instance::ComponentInstance;
use crate::memory_layout::align_to;
use crate::prelude::*;
use crate::string_encoding::{default_transcoder, StringEncoding};

/// Bump allocator over the given memory.
///
/// Shrinks in place; growth allocates a fresh aligned block and copies
/// the old contents, like a real guest realloc would.
pub(crate) fn bump_realloc(memory: GuestMemory, next: Rc<Cell<u32>>) -> GuestRealloc {
    Rc::new(move |old_ptr, old_size, alignment, new_size| {
        if new_size <= old_size && old_ptr != 0 {
            return Ok(old_ptr);
        }
        let ptr = align_to(next.get(), alignment.max(1));
        if u64::from(ptr) + u64::from(new_size) > memory.len() as u64 {
            return Err(Error::allocation_failed("test arena exhausted"));
        }
        next.set(ptr + new_size);
        if old_ptr != 0 && old_size > 0 {
            let keep = old_size.min(new_size);
            let bytes = memory.read(old_ptr, keep)?;
            memory.write(ptr, &bytes)?;
        }
        Ok(ptr)
    })
}

/// Options over a fresh memory with a bump allocator starting at 8
pub(crate) fn test_options(size: usize, encoding: StringEncoding) -> LiftLowerOptions {
    let memory = GuestMemory::new(size);
    let next = Rc::new(Cell::new(8));
    LiftLowerOptions {
        string_encoding: encoding,
        realloc: Some(bump_realloc(memory.clone(), next)),
        memory,
    }
}

/// A plain synchronous context over a fresh memory
pub(crate) fn test_context(size: usize, encoding: StringEncoding) -> LiftLowerContext {
    LiftLowerContext::new(test_options(size, encoding), default_transcoder())
}

/// A context bound to an instance
pub(crate) fn test_context_with_instance(
    size: usize,
    encoding: StringEncoding,
) -> (LiftLowerContext, Rc<ComponentInstance>) {
    let inst = Rc::new(ComponentInstance::new());
    let cx = test_context(size, encoding).with_instance(Rc::clone(&inst));
    (cx, inst)
}

/// Events delivered through an async context's callback
pub(crate) type RecordedEvents = Rc<RefCell<Vec<(EventCode, u32, u32)>>>;

/// An asynchronous context whose callback records delivered events
pub(crate) fn async_context(
    size: usize,
    inst: &Rc<ComponentInstance>,
) -> (Rc<LiftLowerContext>, RecordedEvents) {
    let events: RecordedEvents = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let base = test_options(size, StringEncoding::Utf8);
    let options = CanonicalOptions {
        base,
        post_return: None,
        sync: false,
        callback: Some(Rc::new(move |code, index, payload| {
            sink.borrow_mut().push((code, index, payload));
        })),
        always_task_return: false,
    };
    let mut cx = LiftLowerContext::new(options.base.clone(), default_transcoder())
        .with_instance(Rc::clone(inst));
    cx.set_canonical_options(options);
    (Rc::new(cx), events)
}
