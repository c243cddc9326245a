// CMRT - cmrt-canonical
// Module: Async streams
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Async streams.
//!
//! Two endpoints share one state object: a FIFO of element-sized byte
//! blobs, drop flags for each side, and at most one pending read.
//! Writes complete synchronously and feed the pending read; a
//! fulfilled reader is completed asynchronously through its context's
//! callback. Cancellation moves the local copy state to done and
//! reports the partial progress.

use crate::async_::events::{
    pack_copy_result,
    CopyResult,
    CopyState,
    Event,
    EventCode,
    Waitable,
    BLOCKED,
};
use crate::async_::waitable::detach_waitable;
use crate::call_context::LiftLowerContext;
use crate::instance::{ensure_may_leave, ComponentInstance, TableEntry};
use crate::memory_layout::layout_of;
use crate::prelude::*;
use crate::types::ValType;

/// Element descriptor fixed at stream or future creation
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDescriptor {
    /// Element byte size
    pub element_size: u32,
    /// Element alignment
    pub alignment: u32,
    /// Element type
    pub element_type: ValType,
}

impl ElementDescriptor {
    /// Descriptor for elements of `ty`
    pub fn new(ty: ValType) -> Self {
        let layout = layout_of(&ty);
        Self { element_size: layout.size, alignment: layout.alignment, element_type: ty }
    }

    /// Trap unless `other` matches this descriptor exactly
    pub fn validate(&self, other: &ElementDescriptor) -> Result<()> {
        if self != other {
            return Err(Error::invalid_value(
                codes::DESCRIPTOR_MISMATCH,
                "element descriptor mismatch",
            ));
        }
        Ok(())
    }
}

/// Bounds- and alignment-check a span of `count` elements at `ptr`
pub(crate) fn ensure_element_range(
    cx: &LiftLowerContext,
    ptr: u32,
    count: u32,
    descriptor: &ElementDescriptor,
) -> Result<()> {
    cx.opts.memory.check_aligned(ptr, descriptor.alignment)?;
    cx.opts
        .memory
        .check_range(ptr, u64::from(count) * u64::from(descriptor.element_size))
}

/// A read recorded while the queue could not satisfy it
struct PendingRead {
    cx: Rc<LiftLowerContext>,
    ptr: u32,
    requested: u32,
    progress: u32,
    handle_index: u32,
    endpoint: Weak<ReadableStreamEnd>,
}

/// State shared by the two ends of a stream
pub struct SharedStreamState {
    descriptor: ElementDescriptor,
    queue: RefCell<VecDeque<Vec<u8>>>,
    readable_dropped: Cell<bool>,
    writable_dropped: Cell<bool>,
    pending_read: RefCell<Option<PendingRead>>,
}

impl SharedStreamState {
    fn new(descriptor: ElementDescriptor) -> Self {
        Self {
            descriptor,
            queue: RefCell::new(VecDeque::new()),
            readable_dropped: Cell::new(false),
            writable_dropped: Cell::new(false),
            pending_read: RefCell::new(None),
        }
    }

    /// Elements currently queued
    pub fn queued_len(&self) -> usize {
        self.queue.borrow().len()
    }
}

fn copy_into_queue(
    cx: &LiftLowerContext,
    ptr: u32,
    count: u32,
    state: &SharedStreamState,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    ensure_element_range(cx, ptr, count, &state.descriptor)?;
    let elem_size = state.descriptor.element_size;
    let mut queue = state.queue.borrow_mut();
    for i in 0..count {
        let bytes = cx.opts.memory.read(ptr + i * elem_size, elem_size)?;
        queue.push_back(bytes);
    }
    Ok(())
}

/// Copy up to `max_count` queued elements to `ptr`, skipping the first
/// `offset` element slots already filled by earlier progress
fn copy_from_queue(
    cx: &LiftLowerContext,
    ptr: u32,
    offset: u32,
    max_count: u32,
    state: &SharedStreamState,
) -> Result<u32> {
    if max_count == 0 {
        return Ok(0);
    }
    let mut queue = state.queue.borrow_mut();
    let available = cmp::min(max_count as usize, queue.len()) as u32;
    if available == 0 {
        return Ok(0);
    }
    ensure_element_range(cx, ptr, offset + available, &state.descriptor)?;
    let elem_size = state.descriptor.element_size;
    let base = ptr + offset * elem_size;
    for i in 0..available {
        let bytes = queue.pop_front().expect("queue length checked above");
        trap_if(bytes.len() as u32 != elem_size, "stream element size mismatch")?;
        cx.opts.memory.write(base + i * elem_size, &bytes)?;
    }
    Ok(available)
}

/// Feed the pending read from the queue, completing it when satisfied
fn satisfy_pending_read(state: &SharedStreamState) -> Result<()> {
    let completed = {
        let mut slot = state.pending_read.borrow_mut();
        let Some(pending) = slot.as_mut() else {
            return Ok(());
        };
        let remaining = pending.requested - pending.progress;
        let consumed =
            copy_from_queue(&pending.cx, pending.ptr, pending.progress, remaining, state)?;
        pending.progress += consumed;
        if pending.progress < pending.requested {
            return Ok(());
        }
        slot.take().expect("pending read present")
    };
    if let Some(endpoint) = completed.endpoint.upgrade() {
        endpoint.complete_async(
            Some(&completed.cx),
            completed.handle_index,
            CopyResult::Completed,
            completed.progress,
        )?;
    }
    Ok(())
}

/// The readable end of a stream
pub struct ReadableStreamEnd {
    shared: Rc<SharedStreamState>,
    state: Cell<CopyState>,
    waitable: Waitable,
}

impl ReadableStreamEnd {
    fn new(shared: Rc<SharedStreamState>) -> Rc<Self> {
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

    /// Local copy state
    pub fn copy_state(&self) -> CopyState {
        self.state.get()
    }

    fn emit_sync(&self, handle_index: u32, result: CopyResult, progress: u32) -> Result<u32> {
        let payload = pack_copy_result(result, progress);
        self.waitable.set_pending_event(Event {
            code: EventCode::StreamRead,
            index: handle_index,
            payload,
        })?;
        Ok(self.waitable.take_pending_event()?.payload)
    }

    /// Copy up to `n` elements into memory at `ptr`.
    ///
    /// Delivers `Completed(count)` synchronously when anything (or
    /// nothing, for `n = 0`) could be copied, `Dropped(0)` once the
    /// writer is gone, and otherwise records a pending read and
    /// reports [`BLOCKED`]. A synchronous context traps instead of
    /// blocking.
    pub fn read(
        self: &Rc<Self>,
        cx: &Rc<LiftLowerContext>,
        handle_index: u32,
        ptr: u32,
        n: u32,
        sync: bool,
    ) -> Result<u32> {
        trap_if(self.shared.descriptor.element_size == 0, "invalid stream descriptor")?;
        cx.trap_if(self.state.get() != CopyState::Idle, || {
            Error::concurrency_violation(codes::COPY_IN_PROGRESS, "stream read busy")
        })?;

        let consumed = copy_from_queue(cx, ptr, 0, n, &self.shared)?;
        if consumed > 0 || n == 0 {
            return self.emit_sync(handle_index, CopyResult::Completed, consumed);
        }

        if self.shared.writable_dropped.get() {
            self.state.set(CopyState::Done);
            return self.emit_sync(handle_index, CopyResult::Dropped, 0);
        }

        cx.trap_if(sync, || {
            Error::concurrency_violation(codes::WOULD_BLOCK, "sync stream read would block")
        })?;
        ensure_element_range(cx, ptr, n, &self.shared.descriptor)?;
        *self.shared.pending_read.borrow_mut() = Some(PendingRead {
            cx: Rc::clone(cx),
            ptr,
            requested: n,
            progress: 0,
            handle_index,
            endpoint: Rc::downgrade(self),
        });
        self.state.set(CopyState::Copying);
        log::trace!("stream read blocked: handle {handle_index}, want {n}");
        Ok(BLOCKED)
    }

    /// Cancel the pending read, reporting `Cancelled(progress)`.
    ///
    /// Synchronous cancels return the payload directly; async cancels
    /// deliver it through the reader's callback and report
    /// [`BLOCKED`].
    pub fn cancel(&self, sync: bool) -> Result<u32> {
        if self.state.get() != CopyState::Copying {
            return Err(Error::concurrency_violation(
                codes::NO_PENDING_OPERATION,
                "no pending stream read",
            ));
        }
        let pending = self.shared.pending_read.borrow_mut().take().ok_or(
            Error::concurrency_violation(codes::NO_PENDING_OPERATION, "no pending stream read"),
        )?;
        let payload = pack_copy_result(CopyResult::Cancelled, pending.progress);
        self.waitable.set_pending_event(Event {
            code: EventCode::StreamRead,
            index: pending.handle_index,
            payload,
        })?;
        self.state.set(CopyState::Done);
        if sync {
            return Ok(self.waitable.take_pending_event()?.payload);
        }
        pending.cx.notify_async_event(EventCode::StreamRead, pending.handle_index, payload)?;
        Ok(BLOCKED)
    }

    /// Complete a previously blocked read and notify the reader
    fn complete_async(
        &self,
        cx: Option<&Rc<LiftLowerContext>>,
        handle_index: u32,
        result: CopyResult,
        progress: u32,
    ) -> Result<()> {
        let payload = pack_copy_result(result, progress);
        self.waitable.set_pending_event(Event {
            code: EventCode::StreamRead,
            index: handle_index,
            payload,
        })?;
        self.state.set(if result == CopyResult::Completed {
            CopyState::Idle
        } else {
            CopyState::Done
        });
        if let Some(cx) = cx {
            cx.notify_async_event(EventCode::StreamRead, handle_index, payload)?;
        }
        Ok(())
    }

    fn drop_end(&self, inst: &ComponentInstance, index: u32) -> Result<()> {
        trap_if(self.state.get() == CopyState::Copying, "cannot drop pending stream read")?;
        trap_if(
            self.shared.pending_read.borrow().is_some(),
            "pending read must complete before drop",
        )?;
        self.shared.readable_dropped.set(true);
        self.state.set(CopyState::Done);
        detach_waitable(inst, index, &self.waitable)
    }
}

/// The writable end of a stream
pub struct WritableStreamEnd {
    shared: Rc<SharedStreamState>,
    state: Cell<CopyState>,
    waitable: Waitable,
}

impl WritableStreamEnd {
    fn new(shared: Rc<SharedStreamState>) -> Rc<Self> {
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

    /// Copy `n` elements from memory into the queue, feed any pending
    /// read, and deliver `Completed(n)` synchronously.
    pub fn write(
        &self,
        cx: &Rc<LiftLowerContext>,
        handle_index: u32,
        ptr: u32,
        n: u32,
    ) -> Result<u32> {
        trap_if(self.shared.descriptor.element_size == 0, "invalid stream descriptor")?;
        cx.trap_if(self.state.get() != CopyState::Idle, || {
            Error::concurrency_violation(codes::COPY_IN_PROGRESS, "stream write busy")
        })?;
        copy_into_queue(cx, ptr, n, &self.shared)?;
        satisfy_pending_read(&self.shared)?;
        let payload = pack_copy_result(CopyResult::Completed, n);
        self.waitable.set_pending_event(Event {
            code: EventCode::StreamWrite,
            index: handle_index,
            payload,
        })?;
        Ok(self.waitable.take_pending_event()?.payload)
    }

    /// Writes complete synchronously, so there is never one to cancel
    pub fn cancel(&self, _sync: bool) -> Result<u32> {
        Err(Error::concurrency_violation(
            codes::NO_PENDING_OPERATION,
            "no pending stream write",
        ))
    }

    fn drop_end(&self, inst: &ComponentInstance, index: u32) -> Result<()> {
        trap_if(self.state.get() == CopyState::Copying, "cannot drop pending stream write")?;
        let pending = self.shared.pending_read.borrow_mut().take();
        if let Some(pending) = pending {
            if let Some(endpoint) = pending.endpoint.upgrade() {
                endpoint.complete_async(
                    Some(&pending.cx),
                    pending.handle_index,
                    CopyResult::Dropped,
                    pending.progress,
                )?;
            }
        }
        self.shared.writable_dropped.set(true);
        self.state.set(CopyState::Done);
        detach_waitable(inst, index, &self.waitable)
    }
}

fn get_readable(inst: &ComponentInstance, index: u32) -> Result<Rc<ReadableStreamEnd>> {
    match inst.table().get(index)? {
        TableEntry::StreamReadable(end) => Ok(end),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "readable stream end expected",
        )),
    }
}

fn get_writable(inst: &ComponentInstance, index: u32) -> Result<Rc<WritableStreamEnd>> {
    match inst.table().get(index)? {
        TableEntry::StreamWritable(end) => Ok(end),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "writable stream end expected",
        )),
    }
}

/// `stream.new`: create both ends, returning `(writable << 32) |
/// readable`
pub fn canon_stream_new(
    inst: &ComponentInstance,
    descriptor: ElementDescriptor,
) -> Result<u64> {
    ensure_may_leave(inst)?;
    trap_if(descriptor.element_size == 0, "stream descriptor invalid")?;
    let shared = Rc::new(SharedStreamState::new(descriptor));
    let readable = ReadableStreamEnd::new(Rc::clone(&shared));
    let writable = WritableStreamEnd::new(shared);
    let readable_index = inst.table().add(TableEntry::StreamReadable(readable))?;
    let writable_index = inst.table().add(TableEntry::StreamWritable(writable))?;
    Ok((u64::from(writable_index) << 32) | u64::from(readable_index))
}

/// `stream.read`
pub fn canon_stream_read(
    inst: &ComponentInstance,
    descriptor: &ElementDescriptor,
    readable_index: u32,
    cx: &Rc<LiftLowerContext>,
    ptr: u32,
    n: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let readable = get_readable(inst, readable_index)?;
    descriptor.validate(readable.descriptor())?;
    readable.read(cx, readable_index, ptr, n, sync)
}

/// `stream.write`
pub fn canon_stream_write(
    inst: &ComponentInstance,
    descriptor: &ElementDescriptor,
    writable_index: u32,
    cx: &Rc<LiftLowerContext>,
    ptr: u32,
    n: u32,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let writable = get_writable(inst, writable_index)?;
    descriptor.validate(writable.descriptor())?;
    writable.write(cx, writable_index, ptr, n)
}

/// `stream.cancel-read`
pub fn canon_stream_cancel_read(
    inst: &ComponentInstance,
    readable_index: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    get_readable(inst, readable_index)?.cancel(sync)
}

/// `stream.cancel-write`
pub fn canon_stream_cancel_write(
    inst: &ComponentInstance,
    writable_index: u32,
    sync: bool,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    get_writable(inst, writable_index)?.cancel(sync)
}

/// `stream.drop-readable`
pub fn canon_stream_drop_readable(inst: &ComponentInstance, readable_index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    let TableEntry::StreamReadable(end) = inst.table().remove(readable_index)? else {
        return Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "readable stream end expected",
        ));
    };
    end.drop_end(inst, readable_index)
}

/// `stream.drop-writable`
pub fn canon_stream_drop_writable(inst: &ComponentInstance, writable_index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    let TableEntry::StreamWritable(end) = inst.table().remove(writable_index)? else {
        return Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "writable stream end expected",
        ));
    };
    end.drop_end(inst, writable_index)
}
