// CMRT - cmrt-canonical
// Module: Canonical ABI host runtime
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Canonical ABI host runtime for the WebAssembly Component Model.
//!
//! This crate marshals values of the Component Model type system into
//! and out of a guest's linear memory (lifting and lowering, in both
//! memory and flat-slot form) and administers the per-instance runtime
//! state the Component Model requires: resource handle tables, borrow
//! bookkeeping, cooperative task scheduling, async streams and futures,
//! and waitable sets.
//!
//! It does not execute guest code. The embedding engine supplies a
//! memory view, a `realloc` thunk, and (optionally) a trap hook; the
//! runtime exposes the canonical built-ins the engine binds into the
//! guest's import table (see [`builtins`]).

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]

#[cfg(not(feature = "std"))]
extern crate alloc;

// Export our prelude module for consistent imports
pub mod prelude;

// Core modules
pub mod call_context;
pub mod canonical_abi;
pub mod flat;
pub mod instance;
pub mod memory_layout;
pub mod resources;
pub mod string_encoding;
pub mod types;
pub mod values;

// Async support
pub mod async_;

// Host surface
pub mod builtins;
pub mod error_context_builtins;

#[cfg(test)]
mod canonical_abi_tests;
#[cfg(test)]
pub(crate) mod test_support;

// Essential re-exports
pub use call_context::{
    CanonicalOptions,
    GuestMemory,
    LiftLowerContext,
    LiftLowerOptions,
};
pub use canonical_abi::{
    lift_flat,
    load,
    lower_flat,
    store,
};
pub use instance::ComponentInstance;
pub use resources::ResourceType;
pub use types::ValType;
pub use values::Value;

// Type alias for convenience
pub type CmrtResult<T> = cmrt_error::Result<T>;
