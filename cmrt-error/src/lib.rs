// CMRT - cmrt-error
// Module: Error handling for the canonical ABI runtime
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Error handling for the Component Model canonical ABI runtime.
//!
//! The runtime has a single failure mode: the trap. A trap is an
//! [`Error`] value carrying a category, a stable numeric code, and a
//! static message. Nothing is retried and nothing is recovered
//! internally; callers propagate traps to the embedding engine with `?`.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

pub mod codes;
mod errors;

pub use errors::{Error, ErrorCategory, Result};
