//! Tabulated sine/cosine lookup tables.
//!
//! Phase-shift application touches every Fourier sample of every
//! translation hypothesis; evaluating `sin`/`cos` per sample dominates that
//! loop. These tables trade a bounded quantization error (one table step,
//! `2π / len`) for a plain indexed load.

use crate::Real;

/// Tabulated sin/cos over one period, looked up by wrapped angle.
#[derive(Debug, Clone)]
pub struct TrigTables {
    sin: Vec<Real>,
    cos: Vec<Real>,
    /// Radians per table step.
    step: f64,
}

/// Default table length; step ≈ 0.8 mrad.
pub const DEFAULT_TRIG_TABLE_LEN: usize = 8192;

impl TrigTables {
    /// Build tables with `len` entries spanning [0, 2π).
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "trig table length must be non-zero");
        let step = std::f64::consts::TAU / len as f64;
        let mut sin = Vec::with_capacity(len);
        let mut cos = Vec::with_capacity(len);
        for i in 0..len {
            let (s, c) = (i as f64 * step).sin_cos();
            sin.push(s as Real);
            cos.push(c as Real);
        }
        Self { sin, cos, step }
    }

    #[inline]
    fn index(&self, x: f64) -> usize {
        (x.abs() / self.step) as usize % self.sin.len()
    }

    /// Tabulated sine; sign follows the argument.
    #[inline]
    pub fn sin(&self, x: f64) -> Real {
        let v = self.sin[self.index(x)];
        if x.is_sign_negative() {
            -v
        } else {
            v
        }
    }

    /// Tabulated cosine (even, sign-independent).
    #[inline]
    pub fn cos(&self, x: f64) -> Real {
        self.cos[self.index(x)]
    }
}

impl Default for TrigTables {
    fn default() -> Self {
        Self::new(DEFAULT_TRIG_TABLE_LEN)
    }
}
