// CMRT - cmrt-canonical
// Module: Async events
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Events, copy results, and the waitable base state.
//!
//! A [`Waitable`] carries at most one pending [`Event`] and belongs to
//! at most one waitable set at a time. Copy operations report their
//! outcome as a packed payload: the low 4 bits hold the
//! [`CopyResult`], the high 28 bits the progress count.

use crate::call_context::GuestMemory;
use crate::prelude::*;

/// Sentinel: the async operation did not complete synchronously
pub const BLOCKED: u32 = 0xFFFF_FFFF;

/// Event codes delivered to guests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// No event
    None = 0,
    /// A subtask resolved
    Subtask = 1,
    /// A stream read completed
    StreamRead = 2,
    /// A stream write completed
    StreamWrite = 3,
    /// A future read completed
    FutureRead = 4,
    /// A future write completed
    FutureWrite = 5,
    /// The task was cancelled
    TaskCancelled = 6,
}

/// A pending event on a waitable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// What happened
    pub code: EventCode,
    /// Which table entry it happened to
    pub index: u32,
    /// Packed result payload
    pub payload: u32,
}

/// Outcome of a stream or future copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CopyResult {
    /// The copy finished
    Completed = 0,
    /// The other end was dropped
    Dropped = 1,
    /// The copy was cancelled
    Cancelled = 2,
}

/// Local copy state of a stream or future end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    /// No copy in progress
    Idle,
    /// An async copy is pending
    Copying,
    /// The end is finished
    Done,
}

/// Pack a copy outcome and its progress count into a result payload
pub const fn pack_copy_result(result: CopyResult, progress: u32) -> u32 {
    result as u32 | (progress << 4)
}

/// Split a packed result payload back into outcome and progress
pub fn unpack_copy_result(payload: u32) -> Result<(CopyResult, u32)> {
    let result = match payload & 0xF {
        0 => CopyResult::Completed,
        1 => CopyResult::Dropped,
        2 => CopyResult::Cancelled,
        _ => return Err(Error::invalid_value(codes::TYPE_MISMATCH, "bad copy result code")),
    };
    Ok((result, payload >> 4))
}

/// Write a delivered event's `{index, payload}` pair at `out_ptr`
pub fn write_event_fields(
    memory: &GuestMemory,
    out_ptr: u32,
    index: u32,
    payload: u32,
) -> Result<()> {
    memory.write_u32(out_ptr, index)?;
    memory.write_u32(out_ptr + 4, payload)
}

/// The waitable part of a table entry.
///
/// Pending events are single-producer: setting one while another is
/// pending is a protocol violation and traps.
#[derive(Debug, Default)]
pub struct Waitable {
    pending: RefCell<Option<Event>>,
    joined: Cell<Option<u32>>,
}

impl Waitable {
    /// A fresh waitable, unjoined and without a pending event
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending event
    pub fn set_pending_event(&self, event: Event) -> Result<()> {
        let mut pending = self.pending.borrow_mut();
        if pending.is_some() {
            return Err(Error::concurrency_violation(
                codes::COPY_IN_PROGRESS,
                "waitable already has a pending event",
            ));
        }
        *pending = Some(event);
        Ok(())
    }

    /// Is an event pending?
    pub fn has_pending_event(&self) -> bool {
        self.pending.borrow().is_some()
    }

    /// Take the pending event, trapping when none is present
    pub fn take_pending_event(&self) -> Result<Event> {
        self.pending
            .borrow_mut()
            .take()
            .ok_or(Error::concurrency_violation(
                codes::NO_PENDING_OPERATION,
                "waitable pending event missing",
            ))
    }

    /// Drop any pending event
    pub fn clear_pending_event(&self) {
        self.pending.borrow_mut().take();
    }

    /// The set this waitable is joined to, if any
    pub fn joined_set(&self) -> Option<u32> {
        self.joined.get()
    }

    /// Record set membership; `None` means unjoined
    pub fn set_joined(&self, set: Option<u32>) {
        self.joined.set(set);
    }
}
