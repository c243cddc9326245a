// CMRT - cmrt-error
// Module: Error type
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! The [`Error`] struct, its categories, and factory constructors.

use core::fmt;

use crate::codes;

/// Error categories for canonical ABI traps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Memory errors (misalignment, out-of-bounds, failed allocation)
    Memory = 1,
    /// Value errors (invalid char, discriminant overflow, oversized string)
    Validation = 2,
    /// Resource handle errors (lend/borrow discipline violations)
    Resource = 3,
    /// Table errors (bad index, freed slot, overflow, kind mismatch)
    Capacity = 4,
    /// Async errors (would-block, double resolution, set misuse)
    Concurrency = 5,
    /// Uncategorized runtime traps
    RuntimeTrap = 6,
}

impl ErrorCategory {
    /// Human-readable category name
    pub const fn name(&self) -> &'static str {
        match self {
            ErrorCategory::Memory => "memory",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Concurrency => "concurrency",
            ErrorCategory::RuntimeTrap => "trap",
        }
    }
}

/// A canonical ABI trap.
///
/// Messages are static: every trap site names its condition with a
/// string literal, which keeps the type usable without an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    /// Error category
    pub category: ErrorCategory,
    /// Stable error code, see [`crate::codes`]
    pub code: u16,
    /// Static description of the trap condition
    pub message: &'static str,
}

/// Result alias used across the runtime
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Create an error from its parts
    pub const fn new(category: ErrorCategory, code: u16, message: &'static str) -> Self {
        Self { category, code, message }
    }

    // Factory methods, one per trap family

    /// Unaligned load or store
    pub const fn memory_misaligned(message: &'static str) -> Self {
        Self::new(ErrorCategory::Memory, codes::MISALIGNED_ACCESS, message)
    }

    /// Access outside the guest linear memory
    pub const fn memory_out_of_bounds(message: &'static str) -> Self {
        Self::new(ErrorCategory::Memory, codes::MEMORY_OUT_OF_BOUNDS, message)
    }

    /// Guest realloc failure
    pub const fn allocation_failed(message: &'static str) -> Self {
        Self::new(ErrorCategory::Memory, codes::ALLOCATION_FAILED, message)
    }

    /// Invalid value for the declared type
    pub const fn invalid_value(code: u16, message: &'static str) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    /// Value/type shape mismatch
    pub const fn type_mismatch(message: &'static str) -> Self {
        Self::new(ErrorCategory::Validation, codes::TYPE_MISMATCH, message)
    }

    /// Handle discipline violation
    pub const fn resource_violation(code: u16, message: &'static str) -> Self {
        Self::new(ErrorCategory::Resource, code, message)
    }

    /// Table misuse
    pub const fn table_violation(code: u16, message: &'static str) -> Self {
        Self::new(ErrorCategory::Capacity, code, message)
    }

    /// Async protocol violation
    pub const fn concurrency_violation(code: u16, message: &'static str) -> Self {
        Self::new(ErrorCategory::Concurrency, code, message)
    }

    /// Generic trap
    pub const fn runtime_trap(message: &'static str) -> Self {
        Self::new(ErrorCategory::RuntimeTrap, codes::TRAP, message)
    }

    /// Check whether this trap is a memory error
    pub fn is_memory_error(&self) -> bool {
        self.category == ErrorCategory::Memory
    }

    /// Check whether this trap is a resource error
    pub fn is_resource_error(&self) -> bool {
        self.category == ErrorCategory::Resource
    }

    /// Check whether this trap is an async protocol error
    pub fn is_concurrency_error(&self) -> bool {
        self.category == ErrorCategory::Concurrency
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.category.name(), self.code, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
