// CMRT - cmrt-canonical
// Module: Waitable sets
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Waitable sets and their builtins.
//!
//! A set groups waitables by table index so a task can wait on all of
//! them at once. Membership is exclusive: joining a waitable to a new
//! set leaves its old one. Wait and poll scan members in insertion
//! order and deliver the first pending event they find; the scan order
//! is an implementation detail callers must not rely on.

use crate::async_::events::{
    write_event_fields,
    Event,
    EventCode,
    Waitable,
    BLOCKED,
};
use crate::call_context::GuestMemory;
use crate::instance::{ensure_may_leave, ComponentInstance, TableEntry};
use crate::prelude::*;

/// A set of waitables plus the count of tasks blocked on it
#[derive(Debug, Default)]
pub struct WaitableSet {
    members: RefCell<Vec<u32>>,
    num_waiting: Cell<u32>,
}

impl WaitableSet {
    /// A fresh, empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member by table index
    pub fn add_member(&self, index: u32) {
        let mut members = self.members.borrow_mut();
        if !members.contains(&index) {
            members.push(index);
        }
    }

    /// Remove a member by table index
    pub fn remove_member(&self, index: u32) {
        self.members.borrow_mut().retain(|&m| m != index);
    }

    /// Member indices in insertion order
    pub fn members(&self) -> Vec<u32> {
        self.members.borrow().clone()
    }

    /// Does the set have any members?
    pub fn has_members(&self) -> bool {
        !self.members.borrow().is_empty()
    }

    /// A task started waiting on this set
    pub fn begin_wait(&self) {
        self.num_waiting.set(self.num_waiting.get() + 1);
    }

    /// A task stopped waiting on this set
    pub fn end_wait(&self) {
        let n = self.num_waiting.get();
        self.num_waiting.set(n.saturating_sub(1));
    }

    /// Number of tasks currently blocked on this set
    pub fn num_waiting(&self) -> u32 {
        self.num_waiting.get()
    }
}

fn get_set(inst: &ComponentInstance, index: u32) -> Result<Rc<WaitableSet>> {
    match inst.table().get(index)? {
        TableEntry::WaitableSet(set) => Ok(set),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "waitable set expected",
        )),
    }
}

/// First member of `set` with a pending event, as (member index,
/// event)
fn first_pending(inst: &ComponentInstance, set: &WaitableSet) -> Result<Option<u32>> {
    for member in set.members() {
        let entry = inst.table().get(member)?;
        let waitable = entry.waitable().ok_or(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "set member is not a waitable",
        ))?;
        if waitable.has_pending_event() {
            return Ok(Some(member));
        }
    }
    Ok(None)
}

fn take_pending(inst: &ComponentInstance, set: &WaitableSet) -> Result<Option<Event>> {
    match first_pending(inst, set)? {
        Some(member) => {
            let entry = inst.table().get(member)?;
            let waitable = entry.waitable().ok_or(Error::table_violation(
                codes::TABLE_ENTRY_KIND_MISMATCH,
                "set member is not a waitable",
            ))?;
            Ok(Some(waitable.take_pending_event()?))
        }
        None => Ok(None),
    }
}

/// Detach a waitable that is about to leave the table.
///
/// Traps while an event is still pending; otherwise removes the
/// waitable from its joined set.
pub(crate) fn detach_waitable(
    inst: &ComponentInstance,
    index: u32,
    waitable: &Waitable,
) -> Result<()> {
    trap_if(waitable.has_pending_event(), "waitable dropped with pending event")?;
    if let Some(set_index) = waitable.joined_set() {
        get_set(inst, set_index)?.remove_member(index);
        waitable.set_joined(None);
    }
    Ok(())
}

/// `waitable-set.new`: add an empty set, returning its index
pub fn canon_waitable_set_new(inst: &ComponentInstance) -> Result<u32> {
    ensure_may_leave(inst)?;
    inst.table().add(TableEntry::WaitableSet(Rc::new(WaitableSet::new())))
}

/// `waitable.join`: move a waitable into `set_index`, or out of any
/// set when `set_index` is 0
pub fn canon_waitable_join(
    inst: &ComponentInstance,
    waitable_index: u32,
    set_index: u32,
) -> Result<()> {
    ensure_may_leave(inst)?;
    let entry = inst.table().get(waitable_index)?;
    let waitable = entry.waitable().ok_or(Error::table_violation(
        codes::TABLE_ENTRY_KIND_MISMATCH,
        "join target is not a waitable",
    ))?;
    let current = waitable.joined_set();
    let target = (set_index != 0).then_some(set_index);
    if current == target {
        return Ok(());
    }
    if let Some(old) = current {
        get_set(inst, old)?.remove_member(waitable_index);
    }
    if let Some(new) = target {
        get_set(inst, new)?.add_member(waitable_index);
    }
    waitable.set_joined(target);
    Ok(())
}

/// `waitable-set.wait`: deliver a pending event, or write zeroes and
/// report [`BLOCKED`] so the task suspends and retries
pub fn canon_waitable_set_wait(
    inst: &ComponentInstance,
    memory: &GuestMemory,
    set_index: u32,
    out_ptr: u32,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let set = get_set(inst, set_index)?;
    set.begin_wait();
    let event = take_pending(inst, &set);
    set.end_wait();
    match event? {
        Some(event) => {
            write_event_fields(memory, out_ptr, event.index, event.payload)?;
            Ok(event.code as u32)
        }
        None => {
            write_event_fields(memory, out_ptr, 0, 0)?;
            Ok(BLOCKED)
        }
    }
}

/// `waitable-set.poll`: like wait, but reports `none` instead of
/// blocking
pub fn canon_waitable_set_poll(
    inst: &ComponentInstance,
    memory: &GuestMemory,
    set_index: u32,
    out_ptr: u32,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let set = get_set(inst, set_index)?;
    match take_pending(inst, &set)? {
        Some(event) => {
            write_event_fields(memory, out_ptr, event.index, event.payload)?;
            Ok(event.code as u32)
        }
        None => {
            write_event_fields(memory, out_ptr, 0, 0)?;
            Ok(EventCode::None as u32)
        }
    }
}

/// `waitable-set.drop`: remove the set, which must be empty and
/// unwaited
pub fn canon_waitable_set_drop(inst: &ComponentInstance, set_index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    let entry = inst.table().remove(set_index)?;
    let TableEntry::WaitableSet(set) = entry else {
        return Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "waitable set expected",
        ));
    };
    if set.has_members() || set.num_waiting() > 0 {
        return Err(Error::concurrency_violation(
            codes::WAITABLE_SET_NOT_EMPTY,
            "waitable set dropped while in use",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_::task::Subtask;

    fn subtask(inst: &ComponentInstance) -> u32 {
        inst.table().add(TableEntry::Subtask(Rc::new(Subtask::new()))).unwrap()
    }

    fn subtask_event(inst: &ComponentInstance, index: u32, payload: u32) {
        let entry = inst.table().get(index).unwrap();
        entry
            .waitable()
            .unwrap()
            .set_pending_event(Event { code: EventCode::Subtask, index, payload })
            .unwrap();
    }

    #[test]
    fn test_wait_with_no_event_blocks_and_zeroes_out() {
        let inst = ComponentInstance::new();
        let memory = GuestMemory::new(16);
        memory.write_u32(0, 0xAAAA_AAAA).unwrap();
        memory.write_u32(4, 0xBBBB_BBBB).unwrap();
        let set = canon_waitable_set_new(&inst).unwrap();
        let w = subtask(&inst);
        canon_waitable_join(&inst, w, set).unwrap();
        let code = canon_waitable_set_wait(&inst, &memory, set, 0).unwrap();
        assert_eq!(code, BLOCKED);
        assert_eq!(memory.read_u32(0).unwrap(), 0);
        assert_eq!(memory.read_u32(4).unwrap(), 0);
    }

    #[test]
    fn test_wait_delivers_pending_event() {
        let inst = ComponentInstance::new();
        let memory = GuestMemory::new(16);
        let set = canon_waitable_set_new(&inst).unwrap();
        let w = subtask(&inst);
        canon_waitable_join(&inst, w, set).unwrap();
        subtask_event(&inst, w, 55);
        let code = canon_waitable_set_wait(&inst, &memory, set, 8).unwrap();
        assert_eq!(code, EventCode::Subtask as u32);
        assert_eq!(memory.read_u32(8).unwrap(), w);
        assert_eq!(memory.read_u32(12).unwrap(), 55);
        // The event is consumed
        assert_eq!(canon_waitable_set_poll(&inst, &memory, set, 8).unwrap(), 0);
    }

    #[test]
    fn test_join_moves_between_sets() {
        let inst = ComponentInstance::new();
        let set_a = canon_waitable_set_new(&inst).unwrap();
        let set_b = canon_waitable_set_new(&inst).unwrap();
        let w = subtask(&inst);
        canon_waitable_join(&inst, w, set_a).unwrap();
        canon_waitable_join(&inst, w, set_b).unwrap();
        let TableEntry::WaitableSet(a) = inst.table().get(set_a).unwrap() else {
            unreachable!()
        };
        let TableEntry::WaitableSet(b) = inst.table().get(set_b).unwrap() else {
            unreachable!()
        };
        assert!(!a.has_members());
        assert_eq!(b.members(), vec![w]);
    }

    #[test]
    fn test_join_zero_unjoins() {
        let inst = ComponentInstance::new();
        let set = canon_waitable_set_new(&inst).unwrap();
        let w = subtask(&inst);
        canon_waitable_join(&inst, w, set).unwrap();
        canon_waitable_join(&inst, w, 0).unwrap();
        canon_waitable_set_drop(&inst, set).unwrap();
    }

    #[test]
    fn test_drop_with_members_traps() {
        let inst = ComponentInstance::new();
        let set = canon_waitable_set_new(&inst).unwrap();
        let w = subtask(&inst);
        canon_waitable_join(&inst, w, set).unwrap();
        let err = canon_waitable_set_drop(&inst, set).unwrap_err();
        assert_eq!(err.code, codes::WAITABLE_SET_NOT_EMPTY);
    }

    #[test]
    fn test_wait_picks_first_pending_member() {
        let inst = ComponentInstance::new();
        let memory = GuestMemory::new(16);
        let set = canon_waitable_set_new(&inst).unwrap();
        let first = subtask(&inst);
        let second = subtask(&inst);
        canon_waitable_join(&inst, first, set).unwrap();
        canon_waitable_join(&inst, second, set).unwrap();
        subtask_event(&inst, second, 2);
        subtask_event(&inst, first, 1);
        // Insertion order, not event order
        canon_waitable_set_wait(&inst, &memory, set, 0).unwrap();
        assert_eq!(memory.read_u32(0).unwrap(), first);
    }
}
