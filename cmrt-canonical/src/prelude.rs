// CMRT - cmrt-canonical
// Module: Prelude
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Prelude module for cmrt-canonical.
//!
//! Provides a unified set of imports for both std and no_std
//! environments, so individual modules can `use crate::prelude::*`
//! instead of repeating feature-gated import blocks.

// Re-export from alloc when building without std
#[cfg(not(feature = "std"))]
pub use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    format,
    rc::{Rc, Weak},
    string::{String, ToString},
    vec,
    vec::Vec,
};
pub use core::{
    cell::{Cell, RefCell},
    cmp,
    fmt,
    fmt::{Debug, Display},
    mem,
};
// Re-export from std when the std feature is enabled
#[cfg(feature = "std")]
pub use std::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    format,
    rc::{Rc, Weak},
    string::{String, ToString},
    vec,
    vec::Vec,
};

// Re-export from cmrt-error
pub use cmrt_error::{codes, Error, ErrorCategory, Result};

/// Trap when `condition` holds.
///
/// The single producer of uncategorized traps; sites with a more
/// specific category use the matching `Error` constructor directly.
#[inline]
pub fn trap_if(condition: bool, message: &'static str) -> Result<()> {
    if condition {
        return Err(Error::runtime_trap(message));
    }
    Ok(())
}
