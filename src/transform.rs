// src/transform.rs
//
// Normalisation between physical (h, m) and the model's unit domain.
//
//   field:    h_n = (h - h_min) / (h_max - h_min)
//   response: m_n = (m - p(h) - offset_m) / scale_m
//
// p is a least-squares polynomial baseline; offset_m / scale_m are the mean and sample
// std of the residual m - p(h) on the fit data. The field part can be fitted on its own
// (e.g. from a commanded field range) before any response is known; in that case the
// response map is the identity.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HysteresisError, Result};
use crate::polynomial::Polynomial;

/// Tolerance on the [0, 1] precondition of `untransform`.
pub const DOMAIN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRange {
    pub min: f64,
    pub max: f64,
}

impl FieldRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) || max <= min {
            return Err(HysteresisError::InvalidFieldRange { min, max });
        }
        Ok(Self { min, max })
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFit {
    pub baseline: Polynomial,
    pub offset: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisTransform {
    pub polynomial_degree: usize,
    field: Option<FieldRange>,
    response: Option<ResponseFit>,
}

impl HysteresisTransform {
    /// Unfitted transform.
    pub fn new(polynomial_degree: usize) -> Self {
        Self {
            polynomial_degree,
            field: None,
            response: None,
        }
    }

    /// Fit from training data; `m` may be omitted to fit the field part only.
    pub fn fitted(h: &[f64], m: Option<&[f64]>, polynomial_degree: usize) -> Result<Self> {
        let mut t = Self::new(polynomial_degree);
        t.fit(h, m)?;
        Ok(t)
    }

    /// Field normalisation from an explicit range, no response fit.
    pub fn with_field_range(min: f64, max: f64, polynomial_degree: usize) -> Result<Self> {
        let mut t = Self::new(polynomial_degree);
        t.field = Some(FieldRange::new(min, max)?);
        Ok(t)
    }

    pub fn fit(&mut self, h: &[f64], m: Option<&[f64]>) -> Result<()> {
        self.fit_field(h)?;
        if let Some(m) = m {
            self.fit_response(h, m)?;
        }
        Ok(())
    }

    pub fn fit_field(&mut self, h: &[f64]) -> Result<()> {
        let (min, max) = h
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        self.field = Some(FieldRange::new(min, max)?);
        debug!(min, max, "fitted field normalisation");
        Ok(())
    }

    /// Fit the polynomial baseline and residual statistics. Does not touch the field range.
    pub fn fit_response(&mut self, h: &[f64], m: &[f64]) -> Result<()> {
        let baseline = Polynomial::fit(h, m, self.polynomial_degree)?;

        let residual: Vec<f64> = baseline
            .eval_many(h)
            .iter()
            .zip(m)
            .map(|(b, &mi)| mi - b)
            .collect();
        let n = residual.len() as f64;
        let offset = residual.iter().sum::<f64>() / n;
        let var = if residual.len() > 1 {
            residual.iter().map(|r| (r - offset).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        let m_abs = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let mut scale = var.sqrt();
        if !(scale > 1e-12 * (1.0 + m_abs)) {
            warn!(scale, "residual std is zero; using unit response scale");
            scale = 1.0;
        }

        debug!(
            degree = self.polynomial_degree,
            offset, scale, "fitted response normalisation"
        );
        self.response = Some(ResponseFit {
            baseline,
            offset,
            scale,
        });
        Ok(())
    }

    pub fn is_field_fitted(&self) -> bool {
        self.field.is_some()
    }

    pub fn is_response_fitted(&self) -> bool {
        self.response.is_some()
    }

    pub fn field_range(&self) -> Result<FieldRange> {
        self.field.ok_or(HysteresisError::UnfittedTransform)
    }

    pub fn response_fit(&self) -> Option<&ResponseFit> {
        self.response.as_ref()
    }

    /// (h_min, h_max) the field normalisation was fitted on.
    pub fn valid_domain(&self) -> Result<(f64, f64)> {
        let r = self.field_range()?;
        Ok((r.min, r.max))
    }

    /// Polynomial baseline p(h); zero without a response fit.
    pub fn baseline(&self, h: f64) -> f64 {
        self.response.as_ref().map_or(0.0, |r| r.baseline.eval(h))
    }

    pub fn baseline_derivative(&self, h: f64) -> f64 {
        self.response
            .as_ref()
            .map_or(0.0, |r| r.baseline.derivative(h))
    }

    /// Multiplier taking a normalised-response increment to physical units.
    pub fn response_scale(&self) -> f64 {
        self.response.as_ref().map_or(1.0, |r| r.scale)
    }

    // -------------------------
    // Scalar maps
    // -------------------------

    #[inline]
    pub fn transform_field(&self, h: f64) -> Result<f64> {
        let r = self.field_range()?;
        Ok((h - r.min) / r.width())
    }

    #[inline]
    fn untransform_field_unchecked(r: &FieldRange, hn: f64) -> f64 {
        hn * r.width() + r.min
    }

    #[inline]
    fn transform_response(&self, h: f64, m: f64) -> f64 {
        match &self.response {
            Some(r) => (m - r.baseline.eval(h) - r.offset) / r.scale,
            None => m,
        }
    }

    #[inline]
    pub(crate) fn untransform_response(&self, h: f64, mn: f64) -> f64 {
        match &self.response {
            Some(r) => r.scale * mn + r.baseline.eval(h) + r.offset,
            None => mn,
        }
    }

    // -------------------------
    // Sequence maps
    // -------------------------

    pub fn transform(&self, h: &[f64], m: Option<&[f64]>) -> Result<(Vec<f64>, Option<Vec<f64>>)> {
        let r = self.field_range()?;
        let hn: Vec<f64> = h.iter().map(|&v| (v - r.min) / r.width()).collect();
        let mn = match m {
            Some(m) => {
                check_len("response", h.len(), m.len())?;
                Some(
                    h.iter()
                        .zip(m)
                        .map(|(&hi, &mi)| self.transform_response(hi, mi))
                        .collect(),
                )
            }
            None => None,
        };
        Ok((hn, mn))
    }

    /// Exact inverse of `transform`.
    ///
    /// Every `hn` must lie in [0, 1] within `DOMAIN_EPSILON`; anything else means the caller
    /// passed un-normalised data and is reported as `OutOfDomain`, never clamped.
    pub fn untransform(
        &self,
        hn: &[f64],
        mn: Option<&[f64]>,
    ) -> Result<(Vec<f64>, Option<Vec<f64>>)> {
        check_domain(hn)?;
        let r = self.field_range()?;
        let h: Vec<f64> = hn
            .iter()
            .map(|&v| Self::untransform_field_unchecked(&r, v))
            .collect();
        let m = match mn {
            Some(mn) => {
                check_len("normalised response", hn.len(), mn.len())?;
                Some(
                    h.iter()
                        .zip(mn)
                        .map(|(&hi, &mi)| self.untransform_response(hi, mi))
                        .collect(),
                )
            }
            None => None,
        };
        Ok((h, m))
    }
}

/// Cheap range check for the normalised domain.
pub fn check_domain(hn: &[f64]) -> Result<()> {
    let (min, max) = hn
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let nan = hn.iter().any(|v| v.is_nan());
    if nan || min + DOMAIN_EPSILON < 0.0 || max - DOMAIN_EPSILON > 1.0 {
        return Err(HysteresisError::OutOfDomain { min, max });
    }
    Ok(())
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(HysteresisError::LengthMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| a + (b - a) * i as f64 / (n - 1) as f64)
            .collect()
    }

    #[test]
    fn field_only_transform_is_linear_and_invertible() {
        let h = linspace(-1.0, 5.0, 20);
        let t = HysteresisTransform::fitted(&h, None, 1).unwrap();
        let (hn, mn) = t.transform(&h, None).unwrap();
        assert!(mn.is_none());
        for (a, b) in hn.iter().zip(linspace(0.0, 1.0, 20)) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-12);
        }
        let (back, _) = t.untransform(&hn, None).unwrap();
        for (a, b) in back.iter().zip(&h) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn response_round_trip_with_cubic_baseline() {
        let h = linspace(-1.0, 5.0, 20);
        let m: Vec<f64> = h
            .iter()
            .map(|&x| 0.01 * x * x * x - 0.5 * x * x + x)
            .collect();
        let t = HysteresisTransform::fitted(&h, Some(m.as_slice()), 1).unwrap();
        let (hn, mn) = t.transform(&h, Some(m.as_slice())).unwrap();
        let (h2, m2) = t.untransform(&hn, mn.as_deref()).unwrap();
        let m2 = m2.unwrap();
        for i in 0..h.len() {
            assert_abs_diff_eq!(h2[i], h[i], epsilon = 1e-3);
            assert_abs_diff_eq!(m2[i], m[i], epsilon = 1e-2);
        }
    }

    #[test]
    fn quadratic_baseline_on_a_loop() {
        let up = linspace(0.0, 10.0, 100);
        let mut h = up.clone();
        h.extend(up.iter().rev());
        let m: Vec<f64> = h.iter().map(|x| x * x).collect();
        let t = HysteresisTransform::fitted(&h, Some(m.as_slice()), 2).unwrap();

        for (&hi, &mi) in h.iter().zip(&m) {
            assert_abs_diff_eq!(t.baseline(hi), mi, epsilon = 1e-2);
        }

        // points inside the fit range survive a full circle
        let test_h = [0.13, 0.92, 0.47, 0.05, 0.71, 0.33, 0.58, 0.99, 0.21, 0.64];
        let test_m = [0.5, 0.11, 0.87, 0.3, 0.02, 0.66, 0.41, 0.95, 0.18, 0.73];
        let (hn, mn) = t.transform(&test_h, Some(test_m.as_slice())).unwrap();
        let (h2, m2) = t.untransform(&hn, mn.as_deref()).unwrap();
        let m2 = m2.unwrap();
        for i in 0..test_h.len() {
            assert_abs_diff_eq!(h2[i], test_h[i], epsilon = 1e-2);
            assert_abs_diff_eq!(m2[i], test_m[i], epsilon = 1e-2);
        }
    }

    #[test]
    fn untransform_rejects_values_outside_unit_interval() {
        let t = HysteresisTransform::with_field_range(0.0, 10.0, 1).unwrap();
        let raw = linspace(0.0, 100.0, 100);
        assert!(matches!(
            t.untransform(&raw, None),
            Err(HysteresisError::OutOfDomain { .. })
        ));
        assert!(t.untransform(&[-2e-6, 0.5], None).is_err());
        assert!(t.untransform(&[0.5, 1.0 + 2e-6], None).is_err());
        // within epsilon is fine
        assert!(t.untransform(&[-5e-7, 1.0 + 5e-7], None).is_ok());
    }

    #[test]
    fn unfitted_transform_reports_error() {
        let t = HysteresisTransform::new(1);
        assert!(matches!(
            t.transform(&[1.0], None),
            Err(HysteresisError::UnfittedTransform)
        ));
    }

    #[test]
    fn constant_field_is_rejected() {
        assert!(matches!(
            HysteresisTransform::fitted(&[2.0, 2.0, 2.0], None, 1),
            Err(HysteresisError::InvalidFieldRange { .. })
        ));
    }
}
