// CMRT - cmrt-error
// Module: Error codes
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Stable error codes for canonical ABI traps.
//!
//! Codes are grouped by category in blocks of one hundred so a code is
//! meaningful on its own in engine logs.

// Memory errors (1000-1099)

/// Unaligned load or store
pub const MISALIGNED_ACCESS: u16 = 1000;
/// Load or store outside the guest linear memory
pub const MEMORY_OUT_OF_BOUNDS: u16 = 1001;
/// Guest realloc returned a null or misaligned pointer
pub const ALLOCATION_FAILED: u16 = 1002;
/// Zero-size allocation requested for a non-empty value
pub const ZERO_SIZE_ALLOCATION: u16 = 1003;

// Value errors (1100-1199)

/// Char outside the Unicode scalar range or in the surrogate range
pub const INVALID_CHAR: u16 = 1100;
/// Variant discriminant at or beyond the case count
pub const INVALID_DISCRIMINANT: u16 = 1101;
/// String byte length beyond 2^31-1
pub const STRING_TOO_LONG: u16 = 1102;
/// Stream or future element descriptor mismatch
pub const DESCRIPTOR_MISMATCH: u16 = 1103;
/// Value does not match the declared type descriptor
pub const TYPE_MISMATCH: u16 = 1104;
/// Malformed string payload for the selected encoding
pub const INVALID_ENCODING: u16 = 1105;

// Resource errors (1200-1299)

/// Drop of an own handle with outstanding lends
pub const RESOURCE_LENT: u16 = 1200;
/// Borrow scope exited with a non-zero borrow count
pub const BORROW_SCOPE_LEAK: u16 = 1201;
/// Borrow bookkeeping underflow or missing scope
pub const BORROW_VIOLATION: u16 = 1202;
/// Resource operation against the wrong handle kind
pub const HANDLE_KIND_MISMATCH: u16 = 1203;
/// Cross-instance drop while the defining instance may not be entered
pub const REENTRANCE_VIOLATION: u16 = 1204;

// Table errors (1300-1399)

/// Use of index zero or an index past the table end
pub const TABLE_INDEX_OUT_OF_BOUNDS: u16 = 1300;
/// Use of a freed table slot
pub const TABLE_SLOT_EMPTY: u16 = 1301;
/// Table grown past its maximum length
pub const TABLE_OVERFLOW: u16 = 1302;
/// Typed fetch found an entry of another kind
pub const TABLE_ENTRY_KIND_MISMATCH: u16 = 1303;

// Async errors (1400-1499)

/// Synchronous read or write that would block
pub const WOULD_BLOCK: u16 = 1400;
/// Cancel with no pending operation
pub const NO_PENDING_OPERATION: u16 = 1401;
/// Second write to a future
pub const FUTURE_ALREADY_RESOLVED: u16 = 1402;
/// Waitable-set drop while members or waiters remain
pub const WAITABLE_SET_NOT_EMPTY: u16 = 1403;
/// Async builtin invoked from a synchronous context
pub const SYNC_CONTEXT_VIOLATION: u16 = 1404;
/// Task resolved twice, or resolution with outstanding borrows
pub const TASK_RESOLUTION_VIOLATION: u16 = 1405;
/// Operation while a copy is already in progress
pub const COPY_IN_PROGRESS: u16 = 1406;
/// Backpressure counter overflow or underflow
pub const BACKPRESSURE_RANGE: u16 = 1407;
/// Scheduler cannot make progress
pub const DEADLOCK: u16 = 1408;

// Runtime traps (1500-1599)

/// Generic trap raised through `trap_if`
pub const TRAP: u16 = 1500;
/// Instance may-leave flag cleared
pub const MAY_NOT_LEAVE: u16 = 1501;
/// Context-local storage index out of range
pub const CONTEXT_INDEX_OUT_OF_BOUNDS: u16 = 1502;
