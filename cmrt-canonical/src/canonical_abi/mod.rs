// CMRT - cmrt-canonical
// Module: Canonical ABI codec
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! The canonical ABI codec.
//!
//! Every type family lifts and lowers in two modes. Memory mode
//! ([`store`]/[`load`]) reads and writes the canonical layout at a
//! pointer into guest memory. Flat mode ([`lower_flat`]/[`lift_flat`])
//! spreads the value over core value slots on the function boundary.
//! [`flatten`] computes the core signature a lifted or lowered
//! function presents.

pub mod flatten;
pub mod lift;
pub mod lower;

pub use flatten::{
    flatten_functype,
    CoreFuncType,
    FlattenContext,
    MAX_FLAT_ASYNC_PARAMS,
    MAX_FLAT_PARAMS,
    MAX_FLAT_RESULTS,
};
pub use lift::{lift_flat, load};
pub use lower::{lower_flat, store};
