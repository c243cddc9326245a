// CMRT - cmrt-canonical
// Module: Flat core values
//
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Flat core-value kinds and iteration.
//!
//! On the core function boundary every Component Model value is spread
//! over the four WebAssembly value kinds. Lowering emits a
//! [`FlatValue`] sequence; lifting consumes one through a pull
//! iterator. Variant lifting additionally reads through a
//! [`CoerceValueIter`], which narrows the joined slot types back down
//! to what the selected case expects.

use crate::prelude::*;

/// The four core WebAssembly value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatType {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl fmt::Display for FlatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatType::I32 => write!(f, "i32"),
            FlatType::I64 => write!(f, "i64"),
            FlatType::F32 => write!(f, "f32"),
            FlatType::F64 => write!(f, "f64"),
        }
    }
}

/// A core WebAssembly value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl FlatValue {
    /// The kind of this value
    pub fn ty(&self) -> FlatType {
        match self {
            FlatValue::I32(_) => FlatType::I32,
            FlatValue::I64(_) => FlatType::I64,
            FlatValue::F32(_) => FlatType::F32,
            FlatValue::F64(_) => FlatType::F64,
        }
    }

    /// Extract an i32, trapping on kind mismatch
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            FlatValue::I32(v) => Ok(*v),
            _ => Err(Error::type_mismatch("flat value is not an i32")),
        }
    }

    /// Extract an i64, trapping on kind mismatch
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            FlatValue::I64(v) => Ok(*v),
            _ => Err(Error::type_mismatch("flat value is not an i64")),
        }
    }

    /// Extract an f32, trapping on kind mismatch
    pub fn as_f32(&self) -> Result<f32> {
        match self {
            FlatValue::F32(v) => Ok(*v),
            _ => Err(Error::type_mismatch("flat value is not an f32")),
        }
    }

    /// Extract an f64, trapping on kind mismatch
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            FlatValue::F64(v) => Ok(*v),
            _ => Err(Error::type_mismatch("flat value is not an f64")),
        }
    }
}

/// Pointwise widening of two slot kinds.
///
/// Equal kinds stay; i32 and f32 meet at i32; any other mix widens to
/// i64.
pub fn join(a: FlatType, b: FlatType) -> FlatType {
    if a == b {
        return a;
    }
    if matches!(
        (a, b),
        (FlatType::I32, FlatType::F32) | (FlatType::F32, FlatType::I32)
    ) {
        return FlatType::I32;
    }
    FlatType::I64
}

/// Pull source of flat values during lifting
pub trait FlatSource {
    /// Take the next value, which must have kind `want`
    fn next(&mut self, want: FlatType) -> Result<FlatValue>;
}

/// Iterator over a slice of incoming flat values
pub struct CoreValueIter<'a> {
    values: &'a [FlatValue],
    pos: usize,
}

impl<'a> CoreValueIter<'a> {
    /// Iterate over `values`
    pub fn new(values: &'a [FlatValue]) -> Self {
        Self { values, pos: 0 }
    }

    /// Have all values been consumed?
    pub fn done(&self) -> bool {
        self.pos == self.values.len()
    }
}

impl FlatSource for CoreValueIter<'_> {
    fn next(&mut self, want: FlatType) -> Result<FlatValue> {
        let value = self
            .values
            .get(self.pos)
            .copied()
            .ok_or(Error::type_mismatch("flat value sequence exhausted"))?;
        self.pos += 1;
        trap_if(value.ty() != want, "flat value kind mismatch")?;
        Ok(value)
    }
}

/// Reinterpret i32 bits as f32
pub fn f32_reinterpret_i32(i: i32) -> f32 {
    f32::from_bits(i as u32)
}

/// Reinterpret f32 bits as i32
pub fn i32_reinterpret_f32(f: f32) -> i32 {
    f.to_bits() as i32
}

/// Reinterpret i64 bits as f64
pub fn f64_reinterpret_i64(i: i64) -> f64 {
    f64::from_bits(i as u64)
}

/// Reinterpret f64 bits as i64
pub fn i64_reinterpret_f64(f: f64) -> i64 {
    f.to_bits() as i64
}

/// Narrowing adapter used when lifting variant cases.
///
/// The underlying source yields the joined slot kinds; each `next`
/// consumes one joined slot and narrows it to the kind the case
/// demands: i32→f32 by bit reinterpret, i64→i32 by truncation, i64→f32
/// by truncate-then-reinterpret, i64→f64 by bit reinterpret.
pub struct CoerceValueIter<'a, 'b> {
    inner: &'a mut dyn FlatSource,
    have: core::slice::Iter<'b, FlatType>,
}

impl<'a, 'b> CoerceValueIter<'a, 'b> {
    /// Adapt `inner`, whose upcoming values have kinds `have`
    pub fn new(inner: &'a mut dyn FlatSource, have: &'b [FlatType]) -> Self {
        Self { inner, have: have.iter() }
    }

    /// Consume every slot not taken by the lifted case
    pub fn drain(mut self) -> Result<()> {
        while let Some(have) = self.have.next() {
            self.inner.next(*have)?;
        }
        Ok(())
    }
}

impl FlatSource for CoerceValueIter<'_, '_> {
    fn next(&mut self, want: FlatType) -> Result<FlatValue> {
        let have = *self
            .have
            .next()
            .ok_or(Error::type_mismatch("variant case reads past joined slots"))?;
        let value = self.inner.next(have)?;
        Ok(match (have, want) {
            (FlatType::I32, FlatType::F32) => FlatValue::F32(f32_reinterpret_i32(value.as_i32()?)),
            (FlatType::I64, FlatType::I32) => FlatValue::I32(value.as_i64()? as i32),
            (FlatType::I64, FlatType::F32) => {
                FlatValue::F32(f32_reinterpret_i32(value.as_i64()? as i32))
            }
            (FlatType::I64, FlatType::F64) => FlatValue::F64(f64_reinterpret_i64(value.as_i64()?)),
            _ => {
                trap_if(have != want, "variant case slot kind mismatch")?;
                value
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rules() {
        assert_eq!(join(FlatType::I32, FlatType::I32), FlatType::I32);
        assert_eq!(join(FlatType::I32, FlatType::F32), FlatType::I32);
        assert_eq!(join(FlatType::F32, FlatType::I32), FlatType::I32);
        assert_eq!(join(FlatType::F32, FlatType::F64), FlatType::I64);
        assert_eq!(join(FlatType::I32, FlatType::I64), FlatType::I64);
        assert_eq!(join(FlatType::F64, FlatType::F64), FlatType::F64);
    }

    #[test]
    fn test_core_iter_checks_kinds() {
        let values = [FlatValue::I32(1), FlatValue::F64(2.0)];
        let mut it = CoreValueIter::new(&values);
        assert_eq!(it.next(FlatType::I32).unwrap(), FlatValue::I32(1));
        assert!(it.next(FlatType::I64).is_err());
    }

    #[test]
    fn test_core_iter_exhaustion_traps() {
        let mut it = CoreValueIter::new(&[]);
        assert!(it.next(FlatType::I32).is_err());
    }

    #[test]
    fn test_coerce_narrows_i32_to_f32() {
        let values = [FlatValue::I32(0x3FC0_0000)];
        let mut inner = CoreValueIter::new(&values);
        let have = [FlatType::I32];
        let mut it = CoerceValueIter::new(&mut inner, &have);
        let v = it.next(FlatType::F32).unwrap();
        assert_eq!(v, FlatValue::F32(1.5));
    }

    #[test]
    fn test_coerce_truncates_i64_to_i32() {
        let values = [FlatValue::I64(0x1_0000_0007)];
        let mut inner = CoreValueIter::new(&values);
        let have = [FlatType::I64];
        let mut it = CoerceValueIter::new(&mut inner, &have);
        assert_eq!(it.next(FlatType::I32).unwrap(), FlatValue::I32(7));
    }

    #[test]
    fn test_coerce_drain_consumes_leftovers() {
        let values = [FlatValue::I32(1), FlatValue::I64(2)];
        let mut inner = CoreValueIter::new(&values);
        let have = [FlatType::I32, FlatType::I64];
        let mut it = CoerceValueIter::new(&mut inner, &have);
        it.next(FlatType::I32).unwrap();
        it.drain().unwrap();
        assert!(inner.done());
    }
}
