// CMRT - cmrt-canonical
// Module: Resource handles
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Resource handle tables and the own/borrow discipline.
//!
//! Each resource type gets its own handle table inside the owning
//! instance, keyed by the type's stable id. A slot is either an own
//! handle (no scope, a lend count) or a borrow handle (a scope, no
//! lends); the invariants are enforced on every transfer:
//!
//! - an own handle may only be dropped or transferred at lend count 0
//! - a borrow must be released before its scope exits
//! - dropping an own handle runs the destructor exactly once, and only
//!   if the defining instance may currently be entered

use crate::call_context::{CallScope, LiftLowerContext};
use crate::instance::ComponentInstance;
use crate::prelude::*;
use crate::types::ResourceTypeId;

/// A resource type: its stable id, defining instance, and optional
/// destructor.
#[derive(Clone)]
pub struct ResourceType {
    id: ResourceTypeId,
    defining_instance: Weak<ComponentInstance>,
    dtor: Option<Rc<dyn Fn(u32)>>,
}

impl ResourceType {
    /// Declare a resource type defined by `instance`
    pub fn new(
        id: ResourceTypeId,
        instance: &Rc<ComponentInstance>,
        dtor: Option<Rc<dyn Fn(u32)>>,
    ) -> Self {
        Self { id, defining_instance: Rc::downgrade(instance), dtor }
    }

    /// The stable id keying this type's handle tables
    pub fn id(&self) -> ResourceTypeId {
        self.id
    }

    /// The instance that defined this type, while it is alive
    pub fn defining_instance(&self) -> Option<Rc<ComponentInstance>> {
        self.defining_instance.upgrade()
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("id", &self.id)
            .field("has_dtor", &self.dtor.is_some())
            .finish()
    }
}

/// One handle table slot
#[derive(Clone)]
pub struct HandleSlot {
    /// Representation value, opaque to everyone but the defining
    /// component
    pub rep: u32,
    /// Own handle? Otherwise a borrow.
    pub own: bool,
    /// Borrow scope; present exactly when `own` is false
    pub scope: Option<Rc<CallScope>>,
    /// Number of borrows currently lifted from this own handle
    pub lend_count: u32,
}

impl HandleSlot {
    /// A fresh own handle around `rep`
    pub fn own(rep: u32) -> Self {
        Self { rep, own: true, scope: None, lend_count: 0 }
    }

    /// A borrow of `rep` scoped to `scope`
    pub fn borrow(rep: u32, scope: Rc<CallScope>) -> Self {
        Self { rep, own: false, scope: Some(scope), lend_count: 0 }
    }
}

impl fmt::Debug for HandleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleSlot")
            .field("rep", &self.rep)
            .field("own", &self.own)
            .field("lend_count", &self.lend_count)
            .finish()
    }
}

/// Maximum number of slots in a handle table
pub const MAX_HANDLE_TABLE_LENGTH: usize = 1 << 30;

/// Handle table of a single resource type
#[derive(Default)]
struct HandleTable {
    // Slot 0 is the reserved null index
    slots: Vec<Option<HandleSlot>>,
    free: Vec<u32>,
}

impl HandleTable {
    fn add(&mut self, slot: HandleSlot) -> Result<u32> {
        if self.slots.is_empty() {
            self.slots.push(None);
        }
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            return Ok(index);
        }
        if self.slots.len() >= MAX_HANDLE_TABLE_LENGTH {
            return Err(Error::table_violation(
                codes::TABLE_OVERFLOW,
                "handle table overflow",
            ));
        }
        self.slots.push(Some(slot));
        Ok((self.slots.len() - 1) as u32)
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut HandleSlot> {
        if index == 0 || index as usize >= self.slots.len() {
            return Err(Error::table_violation(
                codes::TABLE_INDEX_OUT_OF_BOUNDS,
                "handle index out of bounds",
            ));
        }
        self.slots[index as usize]
            .as_mut()
            .ok_or(Error::table_violation(codes::TABLE_SLOT_EMPTY, "handle slot empty"))
    }

    fn remove(&mut self, index: u32) -> Result<HandleSlot> {
        let slot = self.slot_mut(index)?.clone();
        self.slots[index as usize] = None;
        self.free.push(index);
        Ok(slot)
    }
}

/// All handle tables of an instance, keyed by resource type id.
///
/// Tables are created lazily on first use and live as long as the
/// instance.
#[derive(Default)]
pub struct HandleTables {
    tables: RefCell<BTreeMap<ResourceTypeId, HandleTable>>,
}

impl HandleTables {
    /// Insert a slot into the table of `rt`
    pub fn add(&self, rt: ResourceTypeId, slot: HandleSlot) -> Result<u32> {
        self.tables.borrow_mut().entry(rt).or_default().add(slot)
    }

    /// Snapshot the slot at `index` in the table of `rt`
    pub fn get(&self, rt: ResourceTypeId, index: u32) -> Result<HandleSlot> {
        self.with_slot(rt, index, |slot| slot.clone())
    }

    /// Remove and return the slot at `index` in the table of `rt`
    pub fn remove(&self, rt: ResourceTypeId, index: u32) -> Result<HandleSlot> {
        let mut tables = self.tables.borrow_mut();
        let table = tables.get_mut(&rt).ok_or(Error::table_violation(
            codes::TABLE_SLOT_EMPTY,
            "no handle table for resource type",
        ))?;
        table.remove(index)
    }

    /// Run `f` over the slot at `index` in the table of `rt`
    pub fn with_slot<R>(
        &self,
        rt: ResourceTypeId,
        index: u32,
        f: impl FnOnce(&mut HandleSlot) -> R,
    ) -> Result<R> {
        let mut tables = self.tables.borrow_mut();
        let table = tables.get_mut(&rt).ok_or(Error::table_violation(
            codes::TABLE_SLOT_EMPTY,
            "no handle table for resource type",
        ))?;
        Ok(f(table.slot_mut(index)?))
    }

    /// Return one lend of the own handle at `index`
    pub fn release_lend(&self, rt: ResourceTypeId, index: u32) -> Result<()> {
        self.with_slot(rt, index, |slot| {
            if slot.lend_count > 0 {
                slot.lend_count -= 1;
            }
        })
    }
}

/// `resource.new`: insert a fresh own handle, returning its index
pub fn canon_resource_new(
    inst: &ComponentInstance,
    rt: &ResourceType,
    rep: u32,
) -> Result<u32> {
    inst.handles().add(rt.id(), HandleSlot::own(rep))
}

/// `resource.drop`: remove the handle at `index`.
///
/// The slot is consumed before validation, like every handle-consuming
/// operation here: a trapped drop still destroys the handle. Own
/// handles must have no outstanding lends; their destructor runs with
/// the representation, unless the defining instance may not be entered
/// (a cross-instance drop then traps). Borrows release their scope's
/// borrow count.
pub fn canon_resource_drop(
    inst: &Rc<ComponentInstance>,
    rt: &ResourceType,
    index: u32,
) -> Result<()> {
    let slot = inst.handles().remove(rt.id(), index)?;
    if slot.own {
        trap_if(slot.scope.is_some(), "own handle cannot carry a borrow scope")?;
        if slot.lend_count != 0 {
            return Err(Error::resource_violation(
                codes::RESOURCE_LENT,
                "resource dropped with outstanding lends",
            ));
        }
        if let Some(defining) = rt.defining_instance() {
            if !Rc::ptr_eq(&defining, inst) && !defining.may_enter() {
                return Err(Error::resource_violation(
                    codes::REENTRANCE_VIOLATION,
                    "defining instance may not be entered for drop",
                ));
            }
        }
        if let Some(dtor) = rt.dtor.as_ref() {
            dtor(slot.rep);
        }
    } else {
        let scope = slot.scope.ok_or(Error::resource_violation(
            codes::BORROW_VIOLATION,
            "borrow handle missing its scope",
        ))?;
        scope.release_borrow().map_err(|_| {
            Error::resource_violation(codes::BORROW_VIOLATION, "borrow scope underflow")
        })?;
    }
    Ok(())
}

/// `resource.rep`: read the representation of the handle at `index`
pub fn canon_resource_rep(
    inst: &ComponentInstance,
    rt: &ResourceType,
    index: u32,
) -> Result<u32> {
    Ok(inst.handles().get(rt.id(), index)?.rep)
}

fn context_instance(cx: &LiftLowerContext) -> Result<&Rc<ComponentInstance>> {
    cx.inst
        .as_ref()
        .ok_or(Error::runtime_trap("handle codec requires an instance context"))
}

/// Lift an own handle out of the context's instance.
///
/// Ownership transfers to the host value: the slot is removed and its
/// representation returned. Traps on borrows and on outstanding lends.
pub fn lift_own(cx: &LiftLowerContext, rt: ResourceTypeId, index: u32) -> Result<u32> {
    let inst = context_instance(cx)?;
    let slot = inst.handles().remove(rt, index).map_err(|e| cx.trap(e))?;
    cx.trap_if(!slot.own, || {
        Error::resource_violation(
            codes::HANDLE_KIND_MISMATCH,
            "own handle expected, found borrow",
        )
    })?;
    cx.trap_if(slot.lend_count != 0, || {
        Error::resource_violation(
            codes::RESOURCE_LENT,
            "own handle transferred with outstanding lends",
        )
    })?;
    Ok(slot.rep)
}

/// Lower an own handle into the context's instance, returning its new
/// index
pub fn lower_own(cx: &LiftLowerContext, rt: ResourceTypeId, rep: u32) -> Result<u32> {
    let inst = context_instance(cx)?;
    inst.handles().add(rt, HandleSlot::own(rep))
}

/// Lift a borrow out of the context's instance.
///
/// Borrowing from an own handle records the lender: its lend count
/// rises by one and is returned by [`LiftLowerContext::exit_call`].
/// Borrowing from an existing borrow passes the representation through.
pub fn lift_borrow(cx: &LiftLowerContext, rt: ResourceTypeId, index: u32) -> Result<u32> {
    let inst = context_instance(cx)?;
    let (rep, lent) = inst
        .handles()
        .with_slot(rt, index, |slot| {
            if slot.own {
                slot.lend_count += 1;
            }
            (slot.rep, slot.own)
        })
        .map_err(|e| cx.trap(e))?;
    if lent {
        cx.push_lender(rt, index);
    }
    Ok(rep)
}

/// Lower a borrow into the context's instance.
///
/// The new slot is scoped to the current call, whose borrow count
/// rises by one and must return to zero before the call exits.
pub fn lower_borrow(cx: &LiftLowerContext, rt: ResourceTypeId, rep: u32) -> Result<u32> {
    let inst = context_instance(cx)?;
    let index = inst.handles().add(rt, HandleSlot::borrow(rep, cx.scope()))?;
    cx.scope().add_borrow();
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string_encoding::StringEncoding;
    use crate::test_support::test_context_with_instance;

    const RT: ResourceTypeId = 7;

    fn resource_type(inst: &Rc<ComponentInstance>) -> (ResourceType, Rc<RefCell<Vec<u32>>>) {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&dropped);
        let rt = ResourceType::new(
            RT,
            inst,
            Some(Rc::new(move |rep| sink.borrow_mut().push(rep))),
        );
        (rt, dropped)
    }

    #[test]
    fn test_new_rep_drop_runs_destructor_once() {
        let inst = Rc::new(ComponentInstance::new());
        let (rt, dropped) = resource_type(&inst);
        let index = canon_resource_new(&inst, &rt, 42).unwrap();
        assert_eq!(canon_resource_rep(&inst, &rt, index).unwrap(), 42);
        canon_resource_drop(&inst, &rt, index).unwrap();
        assert_eq!(*dropped.borrow(), vec![42]);
        // The slot is gone
        assert!(canon_resource_rep(&inst, &rt, index).is_err());
    }

    #[test]
    fn test_drop_with_outstanding_lend_traps() {
        let (cx, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let (rt, dropped) = resource_type(&inst);
        let index = canon_resource_new(&inst, &rt, 9).unwrap();
        assert_eq!(lift_borrow(&cx, RT, index).unwrap(), 9);
        let err = canon_resource_drop(&inst, &rt, index).unwrap_err();
        assert_eq!(err.code, codes::RESOURCE_LENT);
        // The destructor did not run, but the slot is consumed anyway
        assert!(dropped.borrow().is_empty());
        assert!(canon_resource_rep(&inst, &rt, index).is_err());
    }

    #[test]
    fn test_exit_call_releases_lenders() {
        let (cx, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let (rt, _) = resource_type(&inst);
        let index = canon_resource_new(&inst, &rt, 3).unwrap();
        lift_borrow(&cx, RT, index).unwrap();
        assert_eq!(inst.handles().get(RT, index).unwrap().lend_count, 1);
        cx.exit_call().unwrap();
        assert_eq!(inst.handles().get(RT, index).unwrap().lend_count, 0);
        canon_resource_drop(&inst, &rt, index).unwrap();
    }

    #[test]
    fn test_borrow_drop_releases_scope() {
        let (cx, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let (rt, _) = resource_type(&inst);
        let index = lower_borrow(&cx, RT, 11).unwrap();
        assert_eq!(cx.borrow_count(), 1);
        canon_resource_drop(&inst, &rt, index).unwrap();
        assert_eq!(cx.borrow_count(), 0);
        cx.exit_call().unwrap();
    }

    #[test]
    fn test_cross_instance_drop_requires_may_enter() {
        let defining = Rc::new(ComponentInstance::new());
        let (rt, dropped) = resource_type(&defining);
        let other = Rc::new(ComponentInstance::new());
        let index = canon_resource_new(&other, &rt, 5).unwrap();
        defining.set_may_enter(false);
        let err = canon_resource_drop(&other, &rt, index).unwrap_err();
        assert_eq!(err.code, codes::REENTRANCE_VIOLATION);
        assert!(dropped.borrow().is_empty());
        assert!(canon_resource_rep(&other, &rt, index).is_err());
        // Dropping inside the defining instance is always allowed
        let home = canon_resource_new(&defining, &rt, 6).unwrap();
        canon_resource_drop(&defining, &rt, home).unwrap();
        assert_eq!(*dropped.borrow(), vec![6]);
    }

    #[test]
    fn test_lift_own_transfers_out_of_table() {
        let (cx, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let (rt, _) = resource_type(&inst);
        let index = canon_resource_new(&inst, &rt, 21).unwrap();
        assert_eq!(lift_own(&cx, RT, index).unwrap(), 21);
        assert!(inst.handles().get(RT, index).is_err());
    }

    #[test]
    fn test_lift_own_of_borrow_traps() {
        let (cx, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let (_, _) = resource_type(&inst);
        let index = lower_borrow(&cx, RT, 1).unwrap();
        let err = lift_own(&cx, RT, index).unwrap_err();
        assert_eq!(err.code, codes::HANDLE_KIND_MISMATCH);
        // Consumed by the failed transfer, like a trapped drop
        assert!(inst.handles().get(RT, index).is_err());
    }

    #[test]
    fn test_handle_indices_reuse_freed_slots() {
        let inst = Rc::new(ComponentInstance::new());
        let (rt, _) = resource_type(&inst);
        let a = canon_resource_new(&inst, &rt, 1).unwrap();
        let b = canon_resource_new(&inst, &rt, 2).unwrap();
        assert_eq!((a, b), (1, 2));
        canon_resource_drop(&inst, &rt, a).unwrap();
        assert_eq!(canon_resource_new(&inst, &rt, 3).unwrap(), a);
    }
}
