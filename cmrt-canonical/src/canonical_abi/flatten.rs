// CMRT - cmrt-canonical
// Module: Function flattening
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Function flattening: the core signature of a lifted or lowered
//! function.
//!
//! Oversized parameter lists collapse to a single memory pointer;
//! oversized results go through memory too, but the two directions
//! differ: a lift reads its results through a returned pointer, while
//! a lower passes an out-pointer parameter and returns nothing.

use crate::flat::FlatType;
use crate::memory_layout::flat_types;
use crate::prelude::*;
use crate::types::ValType;

/// Most parameters a synchronous function passes in registers
pub const MAX_FLAT_PARAMS: usize = 16;

/// Most results a synchronous function returns in registers
pub const MAX_FLAT_RESULTS: usize = 1;

/// Most parameters an asynchronous lowered call passes in registers
pub const MAX_FLAT_ASYNC_PARAMS: usize = 4;

/// Which side of the boundary the signature is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenContext {
    /// A guest export lifted for host calls
    Lift,
    /// A host import lowered for guest calls
    Lower,
}

/// A core WebAssembly function signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreFuncType {
    /// Core parameter kinds
    pub params: Vec<FlatType>,
    /// Core result kinds
    pub results: Vec<FlatType>,
}

fn pointer() -> Vec<FlatType> {
    vec![FlatType::I32]
}

/// Compute the core signature of a function with the given parameter
/// and result types.
pub fn flatten_functype(
    params: &[ValType],
    results: &[ValType],
    sync: bool,
    has_callback: bool,
    context: FlattenContext,
) -> CoreFuncType {
    let mut flat_params: Vec<FlatType> = params.iter().flat_map(flat_types).collect();
    let mut flat_results: Vec<FlatType> = results.iter().flat_map(flat_types).collect();
    let raw_param_count = flat_params.len();
    let raw_result_count = flat_results.len();

    if sync {
        if raw_param_count > MAX_FLAT_PARAMS {
            flat_params = pointer();
        }
        if raw_result_count > MAX_FLAT_RESULTS {
            match context {
                FlattenContext::Lift => flat_results = pointer(),
                FlattenContext::Lower => {
                    flat_params.push(FlatType::I32);
                    flat_results = Vec::new();
                }
            }
        }
    } else {
        match context {
            FlattenContext::Lift => {
                if raw_param_count > MAX_FLAT_PARAMS {
                    flat_params = pointer();
                }
                flat_results = if has_callback { pointer() } else { Vec::new() };
            }
            FlattenContext::Lower => {
                if raw_param_count > MAX_FLAT_ASYNC_PARAMS {
                    flat_params = pointer();
                }
                if raw_result_count > 0 {
                    flat_params.push(FlatType::I32);
                }
                flat_results = pointer();
            }
        }
    }

    CoreFuncType { params: flat_params, results: flat_results }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn many(n: usize, ty: ValType) -> Vec<ValType> {
        (0..n).map(|_| ty.clone()).collect()
    }

    #[test]
    fn test_small_sync_signature_passes_through() {
        let sig = flatten_functype(
            &[ValType::U32, ValType::F64],
            &[ValType::U32],
            true,
            false,
            FlattenContext::Lift,
        );
        assert_eq!(sig.params, vec![FlatType::I32, FlatType::F64]);
        assert_eq!(sig.results, vec![FlatType::I32]);
    }

    #[test]
    fn test_oversized_params_collapse_to_pointer() {
        let sig = flatten_functype(
            &many(17, ValType::U32),
            &[],
            true,
            false,
            FlattenContext::Lift,
        );
        assert_eq!(sig.params, vec![FlatType::I32]);

        // Exactly at the limit: unchanged
        let sig = flatten_functype(
            &many(16, ValType::U32),
            &[],
            true,
            false,
            FlattenContext::Lift,
        );
        assert_eq!(sig.params.len(), 16);
    }

    #[test]
    fn test_oversized_results_differ_by_direction() {
        // string has two flat slots, past MAX_FLAT_RESULTS
        let lift = flatten_functype(&[], &[ValType::String], true, false, FlattenContext::Lift);
        assert_eq!(lift.params, Vec::<FlatType>::new());
        assert_eq!(lift.results, vec![FlatType::I32]);

        let lower =
            flatten_functype(&[], &[ValType::String], true, false, FlattenContext::Lower);
        assert_eq!(lower.params, vec![FlatType::I32]);
        assert_eq!(lower.results, Vec::<FlatType>::new());
    }

    #[test]
    fn test_async_lift_results_depend_on_callback() {
        let with_callback =
            flatten_functype(&[], &[ValType::U32], false, true, FlattenContext::Lift);
        assert_eq!(with_callback.results, vec![FlatType::I32]);

        let without_callback =
            flatten_functype(&[], &[ValType::U32], false, false, FlattenContext::Lift);
        assert_eq!(without_callback.results, Vec::<FlatType>::new());
    }

    #[test]
    fn test_async_lower_appends_out_pointer() {
        let sig = flatten_functype(
            &many(5, ValType::U32),
            &[ValType::U32],
            false,
            false,
            FlattenContext::Lower,
        );
        // 5 > MAX_FLAT_ASYNC_PARAMS: pointer, plus the result
        // out-pointer
        assert_eq!(sig.params, vec![FlatType::I32, FlatType::I32]);
        assert_eq!(sig.results, vec![FlatType::I32]);

        let no_results = flatten_functype(
            &many(2, ValType::U32),
            &[],
            false,
            false,
            FlattenContext::Lower,
        );
        assert_eq!(no_results.params, vec![FlatType::I32, FlatType::I32]);
        assert_eq!(no_results.results, vec![FlatType::I32]);
    }
}
