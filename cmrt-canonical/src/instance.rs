// CMRT - cmrt-canonical
// Module: Component instance state
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Per-instance runtime state.
//!
//! A [`ComponentInstance`] owns the reentrance flags, the backpressure
//! counter, the per-resource-type handle tables, and the generic
//! [`InstanceTable`] holding waitables, waitable sets, stream and
//! future ends, subtasks, and error contexts.
//!
//! Both tables hand out dense slot indices starting at 1; index 0 is
//! reserved as the null index. Freed slots are reused through a free
//! list; tables cap at 2^30 entries.

use crate::async_::events::Waitable;
use crate::async_::futures::{ReadableFutureEnd, WritableFutureEnd};
use crate::async_::scheduler::Store;
use crate::async_::streams::{ReadableStreamEnd, WritableStreamEnd};
use crate::async_::task::Subtask;
use crate::async_::waitable::WaitableSet;
use crate::error_context_builtins::ErrorContextEntry;
use crate::prelude::*;
use crate::resources::HandleTables;

/// Maximum number of slots in any instance table
pub const MAX_TABLE_LENGTH: usize = 1 << 30;

/// Backpressure counter ceiling; increments past it trap
const MAX_BACKPRESSURE: u32 = 0x1_0000;

/// An entry in the generic instance table
#[derive(Clone)]
pub enum TableEntry {
    /// A waitable set
    WaitableSet(Rc<WaitableSet>),
    /// The readable end of a stream
    StreamReadable(Rc<ReadableStreamEnd>),
    /// The writable end of a stream
    StreamWritable(Rc<WritableStreamEnd>),
    /// The readable end of a future
    FutureReadable(Rc<ReadableFutureEnd>),
    /// The writable end of a future
    FutureWritable(Rc<WritableFutureEnd>),
    /// An in-flight subtask call
    Subtask(Rc<Subtask>),
    /// An error context
    ErrorContext(Rc<ErrorContextEntry>),
}

impl TableEntry {
    /// The waitable part of this entry, when it has one.
    ///
    /// Waitable sets and error contexts are not waitables themselves.
    pub fn waitable(&self) -> Option<&Waitable> {
        match self {
            TableEntry::StreamReadable(e) => Some(e.waitable()),
            TableEntry::StreamWritable(e) => Some(e.waitable()),
            TableEntry::FutureReadable(e) => Some(e.waitable()),
            TableEntry::FutureWritable(e) => Some(e.waitable()),
            TableEntry::Subtask(e) => Some(e.waitable()),
            TableEntry::WaitableSet(_) | TableEntry::ErrorContext(_) => None,
        }
    }

    /// Entry kind, for trap messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            TableEntry::WaitableSet(_) => "waitable-set",
            TableEntry::StreamReadable(_) => "stream-readable",
            TableEntry::StreamWritable(_) => "stream-writable",
            TableEntry::FutureReadable(_) => "future-readable",
            TableEntry::FutureWritable(_) => "future-writable",
            TableEntry::Subtask(_) => "subtask",
            TableEntry::ErrorContext(_) => "error-context",
        }
    }
}

/// Generic slot table for waitables, streams, futures, and error
/// contexts
pub struct InstanceTable {
    entries: RefCell<Vec<Option<TableEntry>>>,
    free: RefCell<Vec<u32>>,
}

impl Default for InstanceTable {
    fn default() -> Self {
        // Slot 0 is the reserved null index
        Self { entries: RefCell::new(vec![None]), free: RefCell::new(Vec::new()) }
    }
}

impl InstanceTable {
    /// Insert an entry, reusing a freed slot when one exists
    pub fn add(&self, entry: TableEntry) -> Result<u32> {
        let mut entries = self.entries.borrow_mut();
        if let Some(index) = self.free.borrow_mut().pop() {
            entries[index as usize] = Some(entry);
            return Ok(index);
        }
        if entries.len() >= MAX_TABLE_LENGTH {
            return Err(Error::table_violation(
                codes::TABLE_OVERFLOW,
                "instance table overflow",
            ));
        }
        entries.push(Some(entry));
        Ok((entries.len() - 1) as u32)
    }

    /// Fetch the entry at `index`
    pub fn get(&self, index: u32) -> Result<TableEntry> {
        let entries = self.entries.borrow();
        if index == 0 || index as usize >= entries.len() {
            return Err(Error::table_violation(
                codes::TABLE_INDEX_OUT_OF_BOUNDS,
                "table index out of bounds",
            ));
        }
        entries[index as usize]
            .clone()
            .ok_or(Error::table_violation(codes::TABLE_SLOT_EMPTY, "table slot empty"))
    }

    /// Remove and return the entry at `index`
    pub fn remove(&self, index: u32) -> Result<TableEntry> {
        let entry = self.get(index)?;
        self.entries.borrow_mut()[index as usize] = None;
        self.free.borrow_mut().push(index);
        Ok(entry)
    }

    /// Number of live entries
    pub fn live_count(&self) -> usize {
        self.entries.borrow().iter().filter(|e| e.is_some()).count()
    }
}

/// Per-instance runtime state
pub struct ComponentInstance {
    store: RefCell<Weak<Store>>,
    may_leave: Cell<bool>,
    may_enter: Cell<bool>,
    exclusive: Cell<bool>,
    backpressure: Cell<u32>,
    num_waiting_to_enter: Cell<u32>,
    handles: HandleTables,
    table: InstanceTable,
}

impl ComponentInstance {
    /// A fresh instance with all flags permissive
    pub fn new() -> Self {
        Self {
            store: RefCell::new(Weak::new()),
            may_leave: Cell::new(true),
            may_enter: Cell::new(true),
            exclusive: Cell::new(false),
            backpressure: Cell::new(0),
            num_waiting_to_enter: Cell::new(0),
            handles: HandleTables::default(),
            table: InstanceTable::default(),
        }
    }

    /// Bind the instance to the store that schedules its tasks
    pub fn set_store(&self, store: &Rc<Store>) {
        *self.store.borrow_mut() = Rc::downgrade(store);
    }

    /// The backing store, while it is alive
    pub fn store(&self) -> Option<Rc<Store>> {
        self.store.borrow().upgrade()
    }

    /// May calls leave this instance?
    pub fn may_leave(&self) -> bool {
        self.may_leave.get()
    }

    /// Set the may-leave flag
    pub fn set_may_leave(&self, value: bool) {
        self.may_leave.set(value);
    }

    /// May calls enter this instance?
    pub fn may_enter(&self) -> bool {
        self.may_enter.get()
    }

    /// Set the may-enter flag
    pub fn set_may_enter(&self, value: bool) {
        self.may_enter.set(value);
    }

    /// Is an exclusive task running?
    pub fn exclusive(&self) -> bool {
        self.exclusive.get()
    }

    /// Mark or clear exclusive use
    pub fn set_exclusive(&self, value: bool) {
        self.exclusive.set(value);
    }

    /// Current backpressure counter
    pub fn backpressure(&self) -> u32 {
        self.backpressure.get()
    }

    /// Tasks currently waiting to enter
    pub fn num_waiting_to_enter(&self) -> u32 {
        self.num_waiting_to_enter.get()
    }

    pub(crate) fn incr_waiting_to_enter(&self) {
        self.num_waiting_to_enter.set(self.num_waiting_to_enter.get() + 1);
    }

    pub(crate) fn decr_waiting_to_enter(&self) {
        let n = self.num_waiting_to_enter.get();
        self.num_waiting_to_enter.set(n.saturating_sub(1));
    }

    /// The per-resource-type handle tables
    pub fn handles(&self) -> &HandleTables {
        &self.handles
    }

    /// The generic instance table
    pub fn table(&self) -> &InstanceTable {
        &self.table
    }
}

impl Default for ComponentInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("may_leave", &self.may_leave.get())
            .field("may_enter", &self.may_enter.get())
            .field("exclusive", &self.exclusive.get())
            .field("backpressure", &self.backpressure.get())
            .field("num_waiting_to_enter", &self.num_waiting_to_enter.get())
            .finish()
    }
}

/// Trap unless the instance may currently be left.
///
/// Every guest-facing builtin runs this guard first.
pub fn ensure_may_leave(inst: &ComponentInstance) -> Result<()> {
    if !inst.may_leave() {
        return Err(Error::new(
            ErrorCategory::RuntimeTrap,
            codes::MAY_NOT_LEAVE,
            "component may not leave",
        ));
    }
    Ok(())
}

/// `backpressure.set`: force the counter to one or zero
pub fn canon_backpressure_set(inst: &ComponentInstance, enabled: bool) {
    inst.backpressure.set(u32::from(enabled));
}

/// `backpressure.inc`: bump the counter, trapping at the ceiling
pub fn canon_backpressure_inc(inst: &ComponentInstance) -> Result<()> {
    let value = inst.backpressure.get();
    if value >= MAX_BACKPRESSURE {
        return Err(Error::concurrency_violation(
            codes::BACKPRESSURE_RANGE,
            "backpressure overflow",
        ));
    }
    inst.backpressure.set(value + 1);
    Ok(())
}

/// `backpressure.dec`: lower the counter, trapping at zero
pub fn canon_backpressure_dec(inst: &ComponentInstance) -> Result<()> {
    let value = inst.backpressure.get();
    if value == 0 {
        return Err(Error::concurrency_violation(
            codes::BACKPRESSURE_RANGE,
            "backpressure underflow",
        ));
    }
    inst.backpressure.set(value - 1);
    Ok(())
}
