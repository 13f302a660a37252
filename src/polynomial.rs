// src/polynomial.rs
//
// Least-squares polynomial baseline used by the response normalisation.
//
// The abscissa is rescaled to [-1, 1] over the fit range before building the normal
// equations, which keeps the Vandermonde system well conditioned up to the small
// degrees used here. The solve is direct (Gaussian elimination with partial pivoting),
// so there is no iteration budget to exhaust and no convergence failure to report.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HysteresisError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    /// Coefficients in the scaled variable u = (x - center) / half_width, lowest order first.
    pub coefficients: Vec<f64>,
    pub center: f64,
    pub half_width: f64,
}

impl Polynomial {
    /// The zero polynomial of a given degree.
    pub fn zeros(degree: usize) -> Self {
        Self {
            coefficients: vec![0.0; degree + 1],
            center: 0.0,
            half_width: 1.0,
        }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Least-squares fit of `y ≈ p(x)`.
    ///
    /// If there are fewer distinct samples than coefficients the system is singular; the
    /// degree is lowered until it is solvable (a constant always is).
    pub fn fit(x: &[f64], y: &[f64], degree: usize) -> Result<Self> {
        if x.len() != y.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "polynomial fit samples",
                expected: x.len(),
                got: y.len(),
            });
        }
        if x.is_empty() {
            return Err(HysteresisError::EmptyData("polynomial fit"));
        }

        let (lo, hi) = min_max(x);
        let center = 0.5 * (lo + hi);
        let half_width = if hi > lo { 0.5 * (hi - lo) } else { 1.0 };
        let u: Vec<f64> = x.iter().map(|&xi| (xi - center) / half_width).collect();

        let mut d = degree;
        loop {
            if let Some(c) = solve_normal_equations(&u, y, d) {
                if d < degree {
                    warn!(requested = degree, used = d, "polynomial fit degree lowered");
                }
                let mut coefficients = c;
                coefficients.resize(degree + 1, 0.0);
                return Ok(Self {
                    coefficients,
                    center,
                    half_width,
                });
            }
            if d == 0 {
                // unreachable for non-empty input: a constant fit is always solvable
                return Ok(Self::zeros(degree));
            }
            d -= 1;
        }
    }

    #[inline]
    fn scaled(&self, x: f64) -> f64 {
        (x - self.center) / self.half_width
    }

    /// Evaluate p(x) (Horner).
    pub fn eval(&self, x: f64) -> f64 {
        let u = self.scaled(x);
        self.coefficients.iter().rev().fold(0.0, |acc, &c| acc * u + c)
    }

    /// Evaluate dp/dx.
    pub fn derivative(&self, x: f64) -> f64 {
        let u = self.scaled(x);
        let mut acc = 0.0;
        for (k, &c) in self.coefficients.iter().enumerate().skip(1).rev() {
            acc = acc * u + k as f64 * c;
        }
        acc / self.half_width
    }

    /// Evaluate p at every sample of `x`.
    pub fn eval_many(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&xi| self.eval(xi)).collect()
    }
}

fn min_max(x: &[f64]) -> (f64, f64) {
    x.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Solve (VᵀV) c = Vᵀy for a degree-d Vandermonde V. Returns None if singular.
fn solve_normal_equations(u: &[f64], y: &[f64], d: usize) -> Option<Vec<f64>> {
    let k = d + 1;

    // power sums Σ u^p for p in 0..=2d, and moments Σ y u^p for p in 0..=d
    let mut sums = vec![0.0; 2 * d + 1];
    let mut rhs = vec![0.0; k];
    for (&ui, &yi) in u.iter().zip(y) {
        let mut p = 1.0;
        for (q, s) in sums.iter_mut().enumerate() {
            *s += p;
            if q < k {
                rhs[q] += yi * p;
            }
            p *= ui;
        }
    }

    let mut a: Vec<Vec<f64>> = (0..k)
        .map(|r| {
            let mut row: Vec<f64> = (0..k).map(|c| sums[r + c]).collect();
            row.push(rhs[r]);
            row
        })
        .collect();

    let scale = sums[0].max(1.0);
    for col in 0..k {
        let pivot = (col..k).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() <= 1e-12 * scale {
            return None;
        }
        a.swap(col, pivot);
        for r in (col + 1)..k {
            let f = a[r][col] / a[col][col];
            for c in col..=k {
                let delta = f * a[col][c];
                a[r][c] -= delta;
            }
        }
    }

    let mut c = vec![0.0; k];
    for r in (0..k).rev() {
        let mut acc = a[r][k];
        for j in (r + 1)..k {
            acc -= a[r][j] * c[j];
        }
        c[r] = acc / a[r][r];
    }
    Some(c)
}
