// CMRT - cmrt-canonical
// Module: Async futures
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Async futures: single-shot streams.
//!
//! The shared state holds one value slot. The writer resolves it
//! exactly once; a second write traps. A reader before resolution
//! records a pending read (synchronous readers trap); writer drop
//! before resolution completes the reader with `Dropped(0)`.

use crate::async_::events::{
    pack_copy_result,
    CopyResult,
    CopyState,
    Event,
    EventCode,
    Waitable,
    BLOCKED,
};
use crate::async_::streams::{ensure_element_range, ElementDescriptor};
use crate::async_::waitable::detach_waitable;
use crate::call_context::LiftLowerContext;
use crate::instance::{ensure_may_leave, ComponentInstance, TableEntry};
use crate::prelude::*;

struct PendingRead {
    cx: Rc<LiftLowerContext>,
    ptr: u32,
    handle_index: u32,
    endpoint: Weak<ReadableFutureEnd>,
}

/// State shared by the two ends of a future
pub struct SharedFutureState {
    descriptor: ElementDescriptor,
    value: RefCell<Vec<u8>>,
    value_ready: Cell<bool>,
    readable_dropped: Cell<bool>,
    writable_dropped: Cell<bool>,
    pending_read: RefCell<Option<PendingRead>>,
}

impl SharedFutureState {
    fn new(descriptor: ElementDescriptor) -> Self {
        let size = descriptor.element_size as usize;
        Self {
            descriptor,
            value: RefCell::new(vec![0; size]),
            value_ready: Cell::new(false),
            readable_dropped: Cell::new(false),
            writable_dropped: Cell::new(false),
            pending_read: RefCell::new(None),
        }
    }

    /// Has the writer resolved the value?
    pub fn value_ready(&self) -> bool {
        self.value_ready.get()
    }
}

/// The readable end of a future
pub struct ReadableFutureEnd {
    shared: Rc<SharedFutureState>,
    state: Cell<CopyState>,
    waitable: Waitable,
}

impl ReadableFutureEnd {
    fn new(shared: Rc<SharedFutureState>) -> Rc<Self> {
        Rc::new(Self { shared, state: Cell::new(CopyState::Idle), waitable: Waitable::new() })
    }

    /// The element descriptor fixed at creation
    pub fn descriptor(&self) -> &ElementDescriptor {
        &self.shared.descriptor
    }

    /// The waitable part of this end
    pub fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    fn emit_sync(&self, handle_index: u32, result: CopyResult, progress: u32) -> Result<u32> {
        let payload = pack_copy_result(result, progress);
        self.waitable.set_pending_event(Event {
            code: EventCode::FutureRead,
            index: handle_index,
            payload,
        })?;
        Ok(self.waitable.take_pending_event()?.payload)
    }

    /// Read the value into memory at `ptr` once it is ready.
    ///
    /// Delivers `Completed(1)` when the value is there, `Dropped(0)`
    /// once the writer is gone, and otherwise records a pending read
    /// and reports [`BLOCKED`]. Synchronous contexts trap instead of
    /// blocking.
    pub fn read(
        self: &Rc<Self>,
        cx: &Rc<LiftLowerContext>,
        handle_index: u32,
        ptr: u32,
        sync: bool,
    ) -> Result<u32> {
        trap_if(self.shared.descriptor.element_size == 0, "invalid future descriptor")?;
        cx.trap_if(self.state.get() != CopyState::Idle, || {
            Error::concurrency_violation(codes::COPY_IN_PROGRESS, "future read busy")
        })?;

        if self.shared.value_ready.get() {
            ensure_element_range(cx, ptr, 1, &self.shared.descriptor)?;
            cx.opts.memory.write(ptr, &self.shared.value.borrow())?;
            return self.emit_sync(handle_index, CopyResult::Completed, 1);
        }

        if self.shared.writable_dropped.get() {
            self.state.set(CopyState::Done);
            return self.emit_sync(handle_index, CopyResult::Dropped, 0);
        }

        cx.trap_if(sync, || {
            Error::concurrency_violation(codes::WOULD_BLOCK, "sync future read would block")
        })?;
        ensure_element_range(cx, ptr, 1, &self.shared.descriptor)?;
        *self.shared.pending_read.borrow_mut() = Some(PendingRead {
            cx: Rc::clone(cx),
            ptr,
            handle_index,
            endpoint: Rc::downgrade(self),
        });
        self.state.set(CopyState::Copying);
        Ok(BLOCKED)
    }

    /// Cancel the pending read, reporting `Cancelled(0)`
    pub fn cancel(&self, sync: bool) -> Result<u32> {
        if self.state.get() != CopyState::Copying {
            return Err(Error::concurrency_violation(
                codes::NO_PENDING_OPERATION,
                "no pending future read",
            ));
        }
        let pending = self.shared.pending_read.borrow_mut().take().ok_or(
            Error::concurrency_violation(codes::NO_PENDING_OPERATION, "no pending future read"),
        )?;
        let payload = pack_copy_result(CopyResult::Cancelled, 0);
        self.waitable.set_pending_event(Event {
            code: EventCode::FutureRead,
            index: pending.handle_index,
            payload,
        })?;
        self.state.set(CopyState::Done);
        if sync {
            return Ok(self.waitable.take_pending_event()?.payload);
        }
        pending.cx.notify_async_event(EventCode::FutureRead, pending.handle_index, payload)?;
        Ok(BLOCKED)
    }

    fn complete_async(
        &self,
        cx: &Rc<LiftLowerContext>,
        handle_index: u32,
        result: CopyResult,
        progress: u32,
    ) -> Result<()> {
        let payload = pack_copy_result(result, progress);
        self.waitable.set_pending_event(Event {
            code: EventCode::FutureRead,
            index: handle_index,
            payload,
        })?;
        self.state.set(if result == CopyResult::Completed {
            CopyState::Idle
        } else {
            CopyState::Done
        });
        cx.notify_async_event(EventCode::FutureRead, handle_index, payload)
    }

    fn drop_end(&self, inst: &ComponentInstance, index: u32) -> Result<()> {
        trap_if(self.state.get() == CopyState::Copying, "cannot drop pending future read")?;
        trap_if(
            self.shared.pending_read.borrow().is_some(),
            "pending future read must complete before drop",
        )?;
        self.shared.readable_dropped.set(true);
        self.state.set(CopyState::Done);
        detach_waitable(inst, index, &self.waitable)
    }
}

/// The writable end of a future
pub struct WritableFutureEnd {
    shared: Rc<SharedFutureState>,
    state: Cell<CopyState>,
    waitable: Waitable,
}

impl WritableFutureEnd {
    fn new(shared: Rc<SharedFutureState>) -> Rc<Self> {
        Rc::new(Self { shared, state: Cell::new(CopyState::Idle), waitable: Waitable::new() })
    }

    /// The element descriptor fixed at creation
    pub fn descriptor(&self) -> &ElementDescriptor {
        &self.shared.descriptor
    }

    /// The waitable part of this end
    pub fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    /// Write the one value, resolving any pending reader.
    ///
    /// A second write traps.
    pub fn write(&self, cx: &Rc<LiftLowerContext>, handle_index: u32, ptr: u32) -> Result<u32> {
        trap_if(self.shared.descriptor.element_size == 0, "invalid future descriptor")?;
        cx.trap_if(self.shared.value_ready.get(), || {
            Error::concurrency_violation(
                codes::FUTURE_ALREADY_RESOLVED,
                "future already resolved",
            )
        })?;
        ensure_element_range(cx, ptr, 1, &self.shared.descriptor)?;
        let bytes = cx.opts.memory.read(ptr, self.shared.descriptor.element_size)?;
        *self.shared.value.borrow_mut() = bytes;
        self.shared.value_ready.set(true);

        let pending = self.shared.pending_read.borrow_mut().take();
        if let Some(pending) = pending {
            ensure_element_range(&pending.cx, pending.ptr, 1, &self.shared.descriptor)?;
            pending.cx.opts.memory.write(pending.ptr, &self.shared.value.borrow())?;
            if let Some(endpoint) = pending.endpoint.upgrade() {
                endpoint.complete_async(
                    &pending.cx,
                    pending.handle_index,
                    CopyResult::Completed,
                    1,
                )?;
            }
        }

        let payload = pack_copy_result(CopyResult::Completed, 1);
        self.waitable.set_pending_event(Event {
            code: EventCode::FutureWrite,
            index: handle_index,
            payload,
        })?;
        self.state.set(CopyState::Idle);
        Ok(self.waitable.take_pending_event()?.payload)
    }

    /// Writes complete synchronously, so there is never one to cancel
    pub fn cancel(&self, _sync: bool) -> Result<u32> {
        Err(Error::concurrency_violation(
            codes::NO_PENDING_OPERATION,
            "no pending future write",
        ))
    }

    fn drop_end(&self, inst: &ComponentInstance, index: u32) -> Result<()> {
        if !self.shared.value_ready.get() {
            let pending = self.shared.pending_read.borrow_mut().take();
            if let Some(pending) = pending {
                if let Some(endpoint) = pending.endpoint.upgrade() {
                    endpoint.complete_async(
                        &pending.cx,
                        pending.handle_index,
                        CopyResult::Dropped,
                        0,
                    )?;
                }
            }
            self.shared.writable_dropped.set(true);
        }
        self.state.set(CopyState::Done);
        detach_waitable(inst, index, &self.waitable)
    }
}

fn get_readable(inst: &ComponentInstance, index: u32) -> Result<Rc<ReadableFutureEnd>> {
    match inst.table().get(index)? {
        TableEntry::FutureReadable(end) => Ok(end),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "readable future end expected",
        )),
    }
}

fn get_writable(inst: &ComponentInstance, index: u32) -> Result<Rc<WritableFutureEnd>> {
    match inst.table().get(index)? {
        TableEntry::FutureWritable(end) => Ok(end),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "writable future end expected",
        )),
    }
}

/// `future.new`: create both ends, returning `(writable << 32) |
/// readable`
pub fn canon_future_new(
    inst: &ComponentInstance,
    descriptor: ElementDescriptor,
) -> Result<u64> {
    ensure_may_leave(inst)?;
    trap_if(descriptor.element_size == 0, "future descriptor invalid")?;
    let shared = Rc::new(SharedFutureState::new(descriptor));
    let readable = ReadableFutureEnd::new(Rc::clone(&shared));
    let writable = WritableFutureEnd::new(shared);
    let readable_index = inst.table().add(TableEntry::FutureReadable(readable))?;
    let writable_index = inst.table().add(TableEntry::FutureWritable(writable))?;
    Ok((u64::from(writable_index) << 32) | u64::from(readable_index))
}

/// `future.read`
pub fn canon_future_read(
    inst: &ComponentInstance,
    descriptor: &ElementDescriptor,
    readable_index: u32,
    cx: &Rc<LiftLowerContext>,
    ptr: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let readable = get_readable(inst, readable_index)?;
    descriptor.validate(readable.descriptor())?;
    readable.read(cx, readable_index, ptr, sync)
}

/// `future.write`
pub fn canon_future_write(
    inst: &ComponentInstance,
    descriptor: &ElementDescriptor,
    writable_index: u32,
    cx: &Rc<LiftLowerContext>,
    ptr: u32,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let writable = get_writable(inst, writable_index)?;
    descriptor.validate(writable.descriptor())?;
    writable.write(cx, writable_index, ptr)
}

/// `future.cancel-read`
pub fn canon_future_cancel_read(
    inst: &ComponentInstance,
    readable_index: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    get_readable(inst, readable_index)?.cancel(sync)
}

/// `future.cancel-write`
pub fn canon_future_cancel_write(
    inst: &ComponentInstance,
    writable_index: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    get_writable(inst, writable_index)?.cancel(sync)
}

/// `future.drop-readable`
pub fn canon_future_drop_readable(inst: &ComponentInstance, readable_index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    let TableEntry::FutureReadable(end) = inst.table().remove(readable_index)? else {
        return Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "readable future end expected",
        ));
    };
    end.drop_end(inst, readable_index)
}

/// `future.drop-writable`
pub fn canon_future_drop_writable(inst: &ComponentInstance, writable_index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    let TableEntry::FutureWritable(end) = inst.table().remove(writable_index)? else {
        return Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "writable future end expected",
        ));
    };
    end.drop_end(inst, writable_index)
}
