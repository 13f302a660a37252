// src/softplus.rs
//
// Positive parameters stored unconstrained.
//
// A `SoftplusParam` keeps the raw values an optimiser sees and exposes the effective
// (strictly positive) view through softplus(x) = ln(1 + e^x). This is the only place
// the forward map, its inverse and its derivative are written down.

use serde::{Deserialize, Serialize};

use crate::error::{HysteresisError, Result};

/// Values at or below this cannot be inverted through softplus in f64.
pub const SOFTPLUS_FLOOR: f64 = 1e-12;

#[inline]
pub fn softplus(x: f64) -> f64 {
    // max(x, 0) + ln(1 + e^{-|x|}) avoids overflow for large |x|
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

#[inline]
pub fn inverse_softplus(y: f64) -> f64 {
    // ln(e^y - 1); the second form avoids overflow for large y
    if y < 20.0 {
        y.exp_m1().ln()
    } else {
        y + (-(-y).exp()).ln_1p()
    }
}

/// d softplus / dx = logistic(x).
#[inline]
pub fn softplus_derivative(x: f64) -> f64 {
    crate::states::sigmoid(x)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftplusParam {
    raw: Vec<f64>,
}

impl SoftplusParam {
    pub fn from_raw(raw: Vec<f64>) -> Self {
        Self { raw }
    }

    /// Build from effective values. Fails on any value at or below `SOFTPLUS_FLOOR`.
    pub fn from_effective(values: &[f64]) -> Result<Self> {
        let mut raw = Vec::with_capacity(values.len());
        for (index, &value) in values.iter().enumerate() {
            if !value.is_finite() || value <= SOFTPLUS_FLOOR {
                return Err(HysteresisError::InvalidDensity { index, value });
            }
            raw.push(inverse_softplus(value));
        }
        Ok(Self { raw })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw(&self) -> &[f64] {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut [f64] {
        &mut self.raw
    }

    pub fn effective(&self) -> Vec<f64> {
        self.raw.iter().map(|&x| softplus(x)).collect()
    }

    /// d effective_i / d raw_i.
    pub fn jacobian_diagonal(&self) -> Vec<f64> {
        self.raw.iter().map(|&x| softplus_derivative(x)).collect()
    }
}
