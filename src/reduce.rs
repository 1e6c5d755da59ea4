// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Element-wise reduction of writer contributions.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F64,
}

impl Dtype {
    pub const fn size(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }
}

pub type ReduceFn = Arc<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Combines `src` into `acc`, both in native byte order.
#[derive(Clone)]
pub enum Reducer {
    Builtin { op: ReduceOp, dtype: Dtype },
    Custom(ReduceFn),
}

impl Reducer {
    pub fn builtin(op: ReduceOp, dtype: Dtype) -> Self {
        Reducer::Builtin { op, dtype }
    }

    pub fn custom(f: impl Fn(&mut [u8], &[u8]) + Send + Sync + 'static) -> Self {
        Reducer::Custom(Arc::new(f))
    }

    /// Reduce the common prefix of `acc` and `src`. Builtin operators skip a
    /// trailing partial element.
    pub fn apply(&self, acc: &mut [u8], src: &[u8]) {
        let n = acc.len().min(src.len());
        let (acc, src) = (&mut acc[..n], &src[..n]);
        match self {
            Reducer::Builtin { op, dtype: Dtype::F32 } => {
                for (a, s) in acc.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    let x = f32::from_ne_bytes([a[0], a[1], a[2], a[3]]);
                    let y = f32::from_ne_bytes([s[0], s[1], s[2], s[3]]);
                    a.copy_from_slice(&combine_f32(*op, x, y).to_ne_bytes());
                }
            }
            Reducer::Builtin { op, dtype: Dtype::F64 } => {
                for (a, s) in acc.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
                    let mut xb = [0u8; 8];
                    let mut yb = [0u8; 8];
                    xb.copy_from_slice(a);
                    yb.copy_from_slice(s);
                    let r = combine_f64(*op, f64::from_ne_bytes(xb), f64::from_ne_bytes(yb));
                    a.copy_from_slice(&r.to_ne_bytes());
                }
            }
            Reducer::Custom(f) => f(acc, src),
        }
    }
}

#[inline]
fn combine_f32(op: ReduceOp, x: f32, y: f32) -> f32 {
    match op {
        ReduceOp::Sum => x + y,
        ReduceOp::Min => x.min(y),
        ReduceOp::Max => x.max(y),
    }
}

#[inline]
fn combine_f64(op: ReduceOp, x: f64, y: f64) -> f64 {
    match op {
        ReduceOp::Sum => x + y,
        ReduceOp::Min => x.min(y),
        ReduceOp::Max => x.max(y),
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Builtin { op, dtype } => write!(f, "Builtin({op:?}, {dtype:?})"),
            Reducer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Encode `values` as native-endian bytes.
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Decode native-endian bytes; a trailing partial value is ignored.
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_f32() {
        let r = Reducer::builtin(ReduceOp::Sum, Dtype::F32);
        let mut acc = f32_bytes(&[1.0, 10.0]);
        r.apply(&mut acc, &f32_bytes(&[2.0, 20.0]));
        r.apply(&mut acc, &f32_bytes(&[3.0, 30.0]));
        assert_eq!(f32_values(&acc), vec![6.0, 60.0]);
    }

    #[test]
    fn min_max_f64() {
        let enc = |v: &[f64]| -> Vec<u8> { v.iter().flat_map(|x| x.to_ne_bytes()).collect() };
        let mut lo = enc(&[4.0, -1.0]);
        let mut hi = lo.clone();
        Reducer::builtin(ReduceOp::Min, Dtype::F64).apply(&mut lo, &enc(&[2.0, 5.0]));
        Reducer::builtin(ReduceOp::Max, Dtype::F64).apply(&mut hi, &enc(&[2.0, 5.0]));
        assert_eq!(lo, enc(&[2.0, -1.0]));
        assert_eq!(hi, enc(&[4.0, 5.0]));
    }

    #[test]
    fn partial_element_untouched() {
        let r = Reducer::builtin(ReduceOp::Sum, Dtype::F32);
        let mut acc = f32_bytes(&[1.0]);
        acc.push(0xAA);
        let mut src = f32_bytes(&[1.0]);
        src.push(0x01);
        r.apply(&mut acc, &src);
        assert_eq!(f32_values(&acc), vec![2.0]);
        assert_eq!(acc[4], 0xAA);
    }

    #[test]
    fn custom_xor() {
        let r = Reducer::custom(|acc, src| {
            for (a, s) in acc.iter_mut().zip(src) {
                *a ^= *s;
            }
        });
        let mut acc = vec![0b1100u8, 0xFF];
        r.apply(&mut acc, &[0b1010, 0x0F]);
        assert_eq!(acc, vec![0b0110, 0xF0]);
    }
}
