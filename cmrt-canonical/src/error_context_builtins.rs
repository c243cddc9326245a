// CMRT - cmrt-canonical
// Module: Error contexts
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Error contexts: opaque handles carrying a debug message.
//!
//! These are a surface feature, not an error mechanism of the runtime;
//! they live in the instance table like any other entry and are
//! dropped explicitly.

use crate::call_context::LiftLowerContext;
use crate::instance::{ensure_may_leave, ComponentInstance, TableEntry};
use crate::prelude::*;
use crate::string_encoding::{load_string_from_range, store_string_into_range};

/// An error context entry
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContextEntry {
    message: String,
}

impl ErrorContextEntry {
    /// A context around `message`
    pub fn new(message: String) -> Self {
        Self { message }
    }

    /// The debug message
    pub fn debug_message(&self) -> &str {
        &self.message
    }
}

fn get_error_context(inst: &ComponentInstance, index: u32) -> Result<Rc<ErrorContextEntry>> {
    match inst.table().get(index)? {
        TableEntry::ErrorContext(entry) => Ok(entry),
        _ => Err(Error::table_violation(
            codes::TABLE_ENTRY_KIND_MISMATCH,
            "error context expected",
        )),
    }
}

/// `error-context.new`: lift the message string and store a fresh
/// context, returning its index
pub fn canon_error_context_new(
    inst: &ComponentInstance,
    cx: &LiftLowerContext,
    ptr: u32,
    tagged_code_units: u32,
) -> Result<u32> {
    ensure_may_leave(inst)?;
    let message = load_string_from_range(cx, ptr, tagged_code_units)?;
    inst.table().add(TableEntry::ErrorContext(Rc::new(ErrorContextEntry::new(message))))
}

/// `error-context.debug-message`: lower the message and write its
/// `(ptr, tagged length)` pair at `out_ptr`
pub fn canon_error_context_debug_message(
    inst: &ComponentInstance,
    cx: &LiftLowerContext,
    index: u32,
    out_ptr: u32,
) -> Result<()> {
    ensure_may_leave(inst)?;
    let entry = get_error_context(inst, index)?;
    let (data_ptr, tagged) = store_string_into_range(cx, entry.debug_message())?;
    cx.opts.memory.write_u32(out_ptr, data_ptr)?;
    cx.opts.memory.write_u32(out_ptr + 4, tagged)
}

/// `error-context.drop`: remove the context from the table
pub fn canon_error_context_drop(inst: &ComponentInstance, index: u32) -> Result<()> {
    ensure_may_leave(inst)?;
    get_error_context(inst, index)?;
    inst.table().remove(index)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string_encoding::StringEncoding;
    use crate::test_support::test_context_with_instance;

    #[test]
    fn test_new_debug_message_round_trip() {
        let (cx, inst) = test_context_with_instance(512, StringEncoding::Utf8);
        let (ptr, tagged) = store_string_into_range(&cx, "it broke").unwrap();
        let index = canon_error_context_new(&inst, &cx, ptr, tagged).unwrap();

        canon_error_context_debug_message(&inst, &cx, index, 200).unwrap();
        let msg_ptr = cx.opts.memory.read_u32(200).unwrap();
        let msg_tagged = cx.opts.memory.read_u32(204).unwrap();
        assert_eq!(load_string_from_range(&cx, msg_ptr, msg_tagged).unwrap(), "it broke");
    }

    #[test]
    fn test_drop_removes_entry() {
        let (cx, inst) = test_context_with_instance(256, StringEncoding::Utf8);
        let (ptr, tagged) = store_string_into_range(&cx, "gone").unwrap();
        let index = canon_error_context_new(&inst, &cx, ptr, tagged).unwrap();
        canon_error_context_drop(&inst, index).unwrap();
        assert!(canon_error_context_drop(&inst, index).is_err());
    }

    #[test]
    fn test_drop_of_wrong_kind_traps() {
        let (_, inst) = test_context_with_instance(64, StringEncoding::Utf8);
        let set = crate::async_::waitable::canon_waitable_set_new(&inst).unwrap();
        let err = canon_error_context_drop(&inst, set).unwrap_err();
        assert_eq!(err.code, codes::TABLE_ENTRY_KIND_MISMATCH);
    }
}
