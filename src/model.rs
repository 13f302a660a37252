// src/model.rs
//
// Hysteresis model: hysterion density on the mesh + linear regression terms.
//
//   m_n = scale * (Σ ρ_i s_i) / (Σ ρ_i) + offset + slope * h_n
//
// ρ = softplus(raw density). The model keeps a normalised training history and its
// precomputed state tensor. How an input field sequence is consumed depends on `Mode`:
//
//   Train  : x must reproduce the stored history; precomputed states are reused.
//   Future : x continues the stored history (one continuation from the last state).
//   Next   : x is a batch of independent one-step candidates, shape [batch, 1, 1].
//
// Evaluation never mutates the model. Only `set_history` and the parameter setters do,
// and the model is not meant to be shared between concurrent writers.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::ModelConfig;
use crate::error::{HysteresisError, Result};
use crate::mesh::{build_mesh, Mesh};
use crate::softplus::SoftplusParam;
use crate::states::{
    compute_states, predict_batched_continuation, predict_continuation, switch_sensitivity,
    StateSnapshot, StateTensor,
};
use crate::transform::{check_domain, HysteresisTransform};

// isclose defaults used for the train-mode history check
const HISTORY_RTOL: f64 = 1e-5;
const HISTORY_ATOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Future,
    Next,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Future => "future",
            Self::Next => "next",
        }
    }
}

/// Units of returned magnetisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Normalized,
    Physical,
}

/// Field input with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBatch {
    values: Vec<f64>,
    shape: Vec<usize>,
}

impl FieldBatch {
    pub fn new(values: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "field batch",
                expected,
                got: values.len(),
            });
        }
        Ok(Self { values, shape })
    }

    /// A plain field sequence, shape [n].
    pub fn sequence(values: Vec<f64>) -> Self {
        let n = values.len();
        Self {
            values,
            shape: vec![n],
        }
    }

    /// Independent one-step candidates, shape [n, 1, 1].
    pub fn candidates(values: Vec<f64>) -> Self {
        let n = values.len();
        Self {
            values,
            shape: vec![n, 1, 1],
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Gradient of a scalar loss with respect to the model's raw parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGradient {
    pub raw_density: Vec<f64>,
    pub offset: f64,
    pub scale: f64,
    pub slope: f64,
}

impl ParamGradient {
    /// Same layout as `HysteresisModel::parameters`.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut v = self.raw_density.clone();
        v.extend([self.offset, self.scale, self.slope]);
        v
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainingHistory {
    pub(crate) h_norm: Vec<f64>,
    pub(crate) m_norm: Option<Vec<f64>>,
    pub(crate) states: StateTensor,
}

#[derive(Debug, Clone)]
pub struct HysteresisModel {
    pub(crate) config: ModelConfig,
    pub(crate) mesh: Mesh,
    pub(crate) density: SoftplusParam,
    pub(crate) offset: f64,
    pub(crate) scale: f64,
    pub(crate) slope: f64,
    pub(crate) transform: HysteresisTransform,
    pub(crate) history: Option<TrainingHistory>,
    pub(crate) mode: Mode,
}

impl HysteresisModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Like `new`, with a density-shaping function refining the mesh.
    pub fn with_density_fn(config: ModelConfig, density_fn: &dyn Fn(f64, f64) -> f64) -> Result<Self> {
        Self::build(config, Some(density_fn))
    }

    fn build(config: ModelConfig, density_fn: Option<&dyn Fn(f64, f64) -> f64>) -> Result<Self> {
        config.validate()?;
        let mesh = build_mesh(config.mesh_scale, density_fn)?;
        let transform = match config.field_range {
            Some((lo, hi)) => {
                HysteresisTransform::with_field_range(lo, hi, config.polynomial_degree)?
            }
            None => HysteresisTransform::new(config.polynomial_degree),
        };

        // raw 0 -> softplus = ln 2 everywhere, never degenerate
        let density = SoftplusParam::from_raw(vec![0.0; mesh.len()]);

        Ok(Self {
            config,
            mesh,
            density,
            offset: 0.0,
            scale: 1.0,
            slope: 0.0,
            transform,
            history: None,
            mode: Mode::Train,
        })
    }

    /// Construct and set an initial training history in one go.
    pub fn with_history(config: ModelConfig, h: &[f64], m: Option<&[f64]>) -> Result<Self> {
        let mut model = Self::new(config)?;
        model.set_history(h, m, true)?;
        Ok(model)
    }

    // -------------------------
    // History
    // -------------------------

    /// Replace the training history and recompute hysterion states.
    ///
    /// With `retrain_normalization` the transform is refitted on `h` (and `m` if given);
    /// otherwise the existing transform is used and `h` must fall inside its field range.
    pub fn set_history(
        &mut self,
        h: &[f64],
        m: Option<&[f64]>,
        retrain_normalization: bool,
    ) -> Result<()> {
        if retrain_normalization {
            self.transform = HysteresisTransform::fitted(h, m, self.config.polynomial_degree)?;
        }

        let (h_norm, m_norm) = self.transform.transform(h, m)?;
        check_domain(&h_norm)?;
        let states = compute_states(&h_norm, &self.mesh, self.config.temperature)?;

        debug!(
            samples = h_norm.len(),
            with_response = m_norm.is_some(),
            retrain_normalization,
            "set hysteresis history"
        );
        self.history = Some(TrainingHistory {
            h_norm,
            m_norm,
            states,
        });
        Ok(())
    }

    /// Extend the training history by `h`, continuing from the last trained state.
    ///
    /// The transform is not refitted and the new fields carry no response, so a stored
    /// response buffer is dropped. On error the history is left unchanged.
    pub fn append_history(&mut self, h: &[f64]) -> Result<()> {
        let (tail, _) = self.transform.transform(h, None)?;
        check_domain(&tail)?;
        let snapshot = self.snapshot();
        let new_states =
            predict_continuation(&tail, &self.mesh, &snapshot, self.config.temperature)?;

        match self.history.as_mut() {
            Some(hist) => {
                hist.h_norm.extend_from_slice(&tail);
                hist.m_norm = None;
                hist.states.data.extend_from_slice(&new_states.data);
                hist.states.rows += new_states.rows;
            }
            None => {
                self.history = Some(TrainingHistory {
                    h_norm: tail,
                    m_norm: None,
                    states: new_states,
                });
            }
        }
        trace!(appended = h.len(), "extended hysteresis history");
        Ok(())
    }

    fn history_ref(&self) -> Result<&TrainingHistory> {
        self.history.as_ref().ok_or(HysteresisError::EmptyHistory)
    }

    /// Training fields in physical units.
    pub fn history_h(&self) -> Result<Vec<f64>> {
        let hist = self.history_ref()?;
        Ok(self.transform.untransform(&hist.h_norm, None)?.0)
    }

    /// Training response in physical units, if one was given.
    pub fn history_m(&self) -> Result<Option<Vec<f64>>> {
        let hist = self.history_ref()?;
        Ok(self
            .transform
            .untransform(&hist.h_norm, hist.m_norm.as_deref())?
            .1)
    }

    pub fn history_h_norm(&self) -> Option<&[f64]> {
        self.history.as_ref().map(|h| h.h_norm.as_slice())
    }

    pub fn history_m_norm(&self) -> Option<&[f64]> {
        self.history.as_ref().and_then(|h| h.m_norm.as_deref())
    }

    pub fn states(&self) -> Option<&StateTensor> {
        self.history.as_ref().map(|h| &h.states)
    }

    /// Last trained state, or all-down at field 0 without history.
    pub fn snapshot(&self) -> StateSnapshot {
        self.history
            .as_ref()
            .and_then(|h| {
                h.h_norm
                    .last()
                    .and_then(|&field| h.states.snapshot(field))
            })
            .unwrap_or_else(|| StateSnapshot::initial(self.mesh.len()))
    }

    // -------------------------
    // Mode
    // -------------------------

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn future(&mut self) {
        self.mode = Mode::Future;
    }

    pub fn next(&mut self) {
        self.mode = Mode::Next;
    }

    /// Evaluate under the current mode.
    pub fn forward(&self, x: &FieldBatch, units: Units) -> Result<Vec<f64>> {
        self.evaluate(self.mode, x, units)
    }

    /// Evaluate under an explicit mode without touching the stored one.
    pub fn evaluate(&self, mode: Mode, x: &FieldBatch, units: Units) -> Result<Vec<f64>> {
        trace!(mode = mode.as_str(), n = x.values().len(), "evaluate");
        match mode {
            Mode::Train => self.forward_train(x.values(), units),
            Mode::Future => self.forward_future(x.values(), units),
            Mode::Next => {
                let shape = x.shape();
                if shape.len() != 3 || shape[1] != 1 || shape[2] != 1 {
                    return Err(HysteresisError::Shape(shape.to_vec()));
                }
                self.forward_next(x.values(), units)
            }
        }
    }

    fn forward_train(&self, x: &[f64], units: Units) -> Result<Vec<f64>> {
        let hist = self.history_ref()?;
        let (expected, _) = self.transform.untransform(&hist.h_norm, None)?;
        if x.len() != expected.len() {
            return Err(HysteresisError::HistoryMismatch(format!(
                "expected {} fields, got {}",
                expected.len(),
                x.len()
            )));
        }
        if let Some((i, (&a, &b))) = x
            .iter()
            .zip(&expected)
            .enumerate()
            .find(|&(_, (&a, &b))| (a - b).abs() > HISTORY_ATOL + HISTORY_RTOL * b.abs())
        {
            return Err(HysteresisError::HistoryMismatch(format!(
                "field {} differs: got {}, history has {}",
                i, a, b
            )));
        }

        let m_norm = self.predict_normalized(&hist.states, &hist.h_norm)?;
        self.finish(&hist.h_norm, m_norm, units)
    }

    fn forward_future(&self, x: &[f64], units: Units) -> Result<Vec<f64>> {
        let (h_norm, _) = self.transform.transform(x, None)?;
        check_domain(&h_norm)?;
        let states = predict_continuation(
            &h_norm,
            &self.mesh,
            &self.snapshot(),
            self.config.temperature,
        )?;
        let m_norm = self.predict_normalized(&states, &h_norm)?;
        self.finish(&h_norm, m_norm, units)
    }

    fn forward_next(&self, x: &[f64], units: Units) -> Result<Vec<f64>> {
        let (h_norm, _) = self.transform.transform(x, None)?;
        check_domain(&h_norm)?;
        let states = predict_batched_continuation(
            &h_norm,
            &self.mesh,
            &self.snapshot(),
            self.config.temperature,
        )?;
        let m_norm = self.predict_normalized(&states, &h_norm)?;
        self.finish(&h_norm, m_norm, units)
    }

    fn finish(&self, h_norm: &[f64], m_norm: Vec<f64>, units: Units) -> Result<Vec<f64>> {
        match units {
            Units::Normalized => Ok(m_norm),
            Units::Physical => Ok(self
                .transform
                .untransform(h_norm, Some(m_norm.as_slice()))?
                .1
                .unwrap_or_default()),
        }
    }

    // -------------------------
    // Prediction
    // -------------------------

    fn density_total(&self, rho: &[f64]) -> Result<f64> {
        let total: f64 = rho.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(HysteresisError::DegenerateDensity(total));
        }
        Ok(total)
    }

    /// Normalised magnetisation for each row of `states`.
    pub fn predict_normalized(&self, states: &StateTensor, h_norm: &[f64]) -> Result<Vec<f64>> {
        if states.rows != h_norm.len() || states.cols != self.mesh.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "state rows",
                expected: h_norm.len(),
                got: states.rows,
            });
        }
        let rho = self.density.effective();
        let total = self.density_total(&rho)?;

        Ok(states
            .iter_rows()
            .zip(h_norm)
            .map(|(row, &h)| {
                let weighted: f64 = rho.iter().zip(row).map(|(r, s)| r * s).sum();
                self.scale * weighted / total + self.offset + self.slope * h
            })
            .collect())
    }

    /// Physical magnetisation along an arbitrary field sequence, walked from all-down.
    ///
    /// Pure: the stored history is neither used nor modified.
    pub fn predict_magnetization(&self, h: &[f64]) -> Result<Vec<f64>> {
        let (h_norm, _) = self.transform.transform(h, None)?;
        check_domain(&h_norm)?;
        let states = compute_states(&h_norm, &self.mesh, self.config.temperature)?;
        let m_norm = self.predict_normalized(&states, &h_norm)?;
        self.finish(&h_norm, m_norm, Units::Physical)
    }

    /// Physical magnetisation at h_min with every hysterion down.
    pub fn negative_saturation(&self) -> Result<f64> {
        let (_, m) = self.transform.untransform(&[0.0], Some(&[self.offset]))?;
        Ok(m.map_or(self.offset, |m| m[0]))
    }

    // -------------------------
    // Derivatives
    // -------------------------

    /// Sum-of-squares loss on the training history and its gradient w.r.t. raw parameters.
    pub fn mse_gradient(&self, target_m_norm: &[f64]) -> Result<(f64, ParamGradient)> {
        if !self.config.trainable {
            return Err(HysteresisError::Frozen);
        }
        let hist = self.history_ref()?;
        if target_m_norm.len() != hist.h_norm.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "target magnetisation",
                expected: hist.h_norm.len(),
                got: target_m_norm.len(),
            });
        }

        let rho = self.density.effective();
        let total = self.density_total(&rho)?;
        let n = self.mesh.len();

        let mut loss = 0.0;
        let mut g_rho = vec![0.0; n];
        let mut g_offset = 0.0;
        let mut g_scale = 0.0;
        let mut g_slope = 0.0;

        for ((row, &h), &target) in hist.states.iter_rows().zip(&hist.h_norm).zip(target_m_norm) {
            let frac = rho.iter().zip(row).map(|(r, s)| r * s).sum::<f64>() / total;
            let pred = self.scale * frac + self.offset + self.slope * h;
            let resid = pred - target;
            loss += resid * resid;

            let r2 = 2.0 * resid;
            g_offset += r2;
            g_scale += r2 * frac;
            g_slope += r2 * h;

            // d frac / d rho_i = (s_i - frac) / total
            let k = r2 * self.scale / total;
            for (g, &s) in g_rho.iter_mut().zip(row) {
                *g += k * (s - frac);
            }
        }

        let raw_density = g_rho
            .iter()
            .zip(self.density.jacobian_diagonal())
            .map(|(g, d)| g * d)
            .collect();

        Ok((
            loss,
            ParamGradient {
                raw_density,
                offset: g_offset,
                scale: g_scale,
                slope: g_slope,
            },
        ))
    }

    /// Next-mode prediction with the derivative dm/dh for each candidate (physical units).
    pub fn predict_next_with_gradient(&self, candidates: &[f64]) -> Result<Vec<(f64, f64)>> {
        let field = self.transform.field_range()?;
        let (h_norm, _) = self.transform.transform(candidates, None)?;
        check_domain(&h_norm)?;

        let snapshot = self.snapshot();
        let temperature = self.config.temperature;
        let rho = self.density.effective();
        let total = self.density_total(&rho)?;
        let states = predict_batched_continuation(&h_norm, &self.mesh, &snapshot, temperature)?;
        let m_norm = self.predict_normalized(&states, &h_norm)?;

        let rs = self.transform.response_scale();
        h_norm
            .par_iter()
            .zip(candidates.par_iter())
            .zip(m_norm.par_iter())
            .map(|((&hn, &h), &mn)| -> Result<(f64, f64)> {
                let ds = switch_sensitivity(hn, &self.mesh, &snapshot, temperature)?;
                let dfrac = rho.iter().zip(&ds).map(|(r, d)| r * d).sum::<f64>() / total;
                let dmn_dhn = self.scale * dfrac + self.slope;

                let m = self.transform.untransform_response(h, mn);
                let dm_dh = rs * dmn_dhn / field.width() + self.transform.baseline_derivative(h);
                Ok((m, dm_dh))
            })
            .collect()
    }

    // -------------------------
    // Parameters
    // -------------------------

    pub fn trainable(&self) -> bool {
        self.config.trainable
    }

    pub fn hysterion_density(&self) -> Vec<f64> {
        self.density.effective()
    }

    /// Set the effective density; every value must be above the softplus floor.
    pub fn set_hysterion_density(&mut self, values: &[f64]) -> Result<()> {
        self.check_mesh_len("hysterion density", values.len())?;
        self.density = SoftplusParam::from_effective(values)?;
        Ok(())
    }

    pub fn raw_density(&self) -> &[f64] {
        self.density.raw()
    }

    pub fn set_raw_density(&mut self, raw: Vec<f64>) -> Result<()> {
        self.check_mesh_len("raw density", raw.len())?;
        self.density = SoftplusParam::from_raw(raw);
        Ok(())
    }

    fn check_mesh_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.mesh.len() {
            return Err(HysteresisError::LengthMismatch {
                what,
                expected: self.mesh.len(),
                got,
            });
        }
        Ok(())
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn set_offset(&mut self, v: f64) {
        self.offset = v;
    }

    pub fn set_scale(&mut self, v: f64) {
        self.scale = v;
    }

    pub fn set_slope(&mut self, v: f64) {
        self.slope = v;
    }

    /// Flat raw parameter vector `[raw_density.., offset, scale, slope]` for external optimisers.
    pub fn parameters(&self) -> Vec<f64> {
        let mut v = self.density.raw().to_vec();
        v.extend([self.offset, self.scale, self.slope]);
        v
    }

    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if !self.config.trainable {
            return Err(HysteresisError::Frozen);
        }
        let n = self.mesh.len();
        if values.len() != n + 3 {
            return Err(HysteresisError::LengthMismatch {
                what: "parameter vector",
                expected: n + 3,
                got: values.len(),
            });
        }
        self.density.raw_mut().copy_from_slice(&values[..n]);
        self.offset = values[n];
        self.scale = values[n + 1];
        self.slope = values[n + 2];
        Ok(())
    }

    // -------------------------
    // Accessors
    // -------------------------

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn transform(&self) -> &HysteresisTransform {
        &self.transform
    }

    pub fn temperature(&self) -> f64 {
        self.config.temperature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn major_loop() -> Vec<f64> {
        vec![-1.0, -0.5, 0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0]
    }

    fn loop_model() -> HysteresisModel {
        let cfg = ModelConfig {
            mesh_scale: 0.1,
            ..ModelConfig::default()
        };
        HysteresisModel::with_history(cfg, &major_loop(), None).unwrap()
    }

    #[test]
    fn train_mode_requires_history_fields() {
        let model = loop_model();
        let ok = model.forward(&FieldBatch::sequence(major_loop()), Units::Normalized);
        assert_eq!(ok.unwrap().len(), 9);

        let mut other = major_loop();
        other[3] = 0.4;
        assert!(matches!(
            model.forward(&FieldBatch::sequence(other), Units::Normalized),
            Err(HysteresisError::HistoryMismatch(_))
        ));
        assert!(matches!(
            model.forward(&FieldBatch::sequence(vec![-1.0]), Units::Normalized),
            Err(HysteresisError::HistoryMismatch(_))
        ));
    }

    #[test]
    fn next_mode_validates_shape() {
        let mut model = loop_model();
        model.next();
        let bad = FieldBatch::new(vec![0.0, 0.5], vec![1, 2, 1]).unwrap();
        assert!(matches!(
            model.forward(&bad, Units::Normalized),
            Err(HysteresisError::Shape(_))
        ));
        let seq = FieldBatch::sequence(vec![0.0]);
        assert!(matches!(
            model.forward(&seq, Units::Normalized),
            Err(HysteresisError::Shape(_))
        ));
        let good = FieldBatch::candidates(vec![-0.5, 0.0, 0.5]);
        assert_eq!(model.forward(&good, Units::Physical).unwrap().len(), 3);
    }

    #[test]
    fn next_mode_equals_one_step_future() {
        let mut model = loop_model();
        let candidates = vec![-0.8, -0.2, 0.3, 0.9];
        model.next();
        let batched = model
            .forward(&FieldBatch::candidates(candidates.clone()), Units::Normalized)
            .unwrap();
        model.future();
        for (&c, &b) in candidates.iter().zip(&batched) {
            let single = model
                .forward(&FieldBatch::sequence(vec![c]), Units::Normalized)
                .unwrap();
            assert_abs_diff_eq!(single[0], b, epsilon = 1e-12);
        }
    }

    #[test]
    fn future_mode_continues_from_trained_state() {
        let model = loop_model();
        let mut full = major_loop();
        let tail = vec![-0.25, 0.25, 0.75];
        full.extend(&tail);

        let whole = model.predict_magnetization(&full).unwrap();
        let cont = model
            .evaluate(Mode::Future, &FieldBatch::sequence(tail), Units::Physical)
            .unwrap();
        for (k, &c) in cont.iter().enumerate() {
            assert_abs_diff_eq!(c, whole[9 + k], epsilon = 1e-12);
        }
    }

    #[test]
    fn density_setter_round_trips_and_rejects_zero() {
        let mut model = loop_model();
        let n = model.mesh().len();
        let dens: Vec<f64> = (0..n).map(|i| 0.1 + i as f64 / n as f64).collect();
        model.set_hysterion_density(&dens).unwrap();
        for (a, b) in model.hysterion_density().iter().zip(&dens) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }

        let mut bad = dens.clone();
        bad[4] = 0.0;
        assert!(matches!(
            model.set_hysterion_density(&bad),
            Err(HysteresisError::InvalidDensity { index: 4, .. })
        ));
        assert!(model.set_hysterion_density(&dens[1..]).is_err());
    }

    #[test]
    fn underflowed_density_is_degenerate() {
        let mut model = loop_model();
        let n = model.mesh().len();
        model.set_raw_density(vec![-1.0e4; n]).unwrap();
        assert!(matches!(
            model.forward(&FieldBatch::sequence(major_loop()), Units::Normalized),
            Err(HysteresisError::DegenerateDensity(_))
        ));
    }

    #[test]
    fn mse_gradient_matches_finite_difference() {
        let mut model = loop_model();
        let n = model.mesh().len();
        let raw: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64 / 11.0 - 0.5).collect();
        model.set_raw_density(raw).unwrap();
        model.set_scale(1.3);
        model.set_offset(-0.2);
        model.set_slope(0.4);

        let target: Vec<f64> = (0..9).map(|k| (k as f64 * 0.7).sin()).collect();
        let (_, grad) = model.mse_gradient(&target).unwrap();
        let flat = grad.to_flat();
        let p0 = model.parameters();

        let eps = 1e-6;
        for &j in &[0usize, n / 3, n - 1, n, n + 1, n + 2] {
            let mut plus = p0.clone();
            plus[j] += eps;
            let mut minus = p0.clone();
            minus[j] -= eps;
            model.set_parameters(&plus).unwrap();
            let lp = model.mse_gradient(&target).unwrap().0;
            model.set_parameters(&minus).unwrap();
            let lm = model.mse_gradient(&target).unwrap().0;
            let fd = (lp - lm) / (2.0 * eps);
            assert_abs_diff_eq!(flat[j], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn frozen_model_refuses_gradients() {
        let cfg = ModelConfig {
            mesh_scale: 0.25,
            trainable: false,
            ..ModelConfig::default()
        };
        let model = HysteresisModel::with_history(cfg, &major_loop(), None).unwrap();
        assert!(matches!(
            model.mse_gradient(&[0.0; 9]),
            Err(HysteresisError::Frozen)
        ));
    }

    #[test]
    fn next_gradient_matches_finite_difference() {
        let cfg = ModelConfig {
            mesh_scale: 0.1,
            temperature: 0.05,
            ..ModelConfig::default()
        };
        let h = major_loop();
        let m: Vec<f64> = h.iter().map(|x| 2.0 * x + 0.3 * x * x).collect();
        let mut model = HysteresisModel::with_history(cfg, &h[..7], Some(&m[..7])).unwrap();
        model.set_slope(0.2);

        let eps = 1e-6;
        for &c in &[-0.6, -0.1, 0.4] {
            let (_, d) = model.predict_next_with_gradient(&[c]).unwrap()[0];
            let mp = model.predict_next_with_gradient(&[c + eps]).unwrap()[0].0;
            let mm = model.predict_next_with_gradient(&[c - eps]).unwrap()[0].0;
            assert_abs_diff_eq!(d, (mp - mm) / (2.0 * eps), epsilon = 1e-4);
        }
    }

    #[test]
    fn appended_history_matches_full_recompute() {
        let cfg = ModelConfig {
            mesh_scale: 0.1,
            field_range: Some((-1.0, 1.0)),
            ..ModelConfig::default()
        };
        let h = major_loop();
        let mut incremental = HysteresisModel::new(cfg.clone()).unwrap();
        for &x in &h[..4] {
            incremental.append_history(&[x]).unwrap();
        }
        incremental.append_history(&h[4..]).unwrap();

        let mut full = HysteresisModel::new(cfg).unwrap();
        full.set_history(&h, None, false).unwrap();

        assert_eq!(incremental.history_h_norm(), full.history_h_norm());
        assert_eq!(incremental.states(), full.states());
        assert_eq!(incremental.snapshot(), full.snapshot());
    }

    #[test]
    fn failed_append_keeps_history() {
        let cfg = ModelConfig {
            mesh_scale: 0.2,
            field_range: Some((-1.0, 1.0)),
            ..ModelConfig::default()
        };
        let mut model = HysteresisModel::new(cfg).unwrap();
        model.append_history(&[0.0, 0.5]).unwrap();
        let before = model.states().cloned();
        assert!(matches!(
            model.append_history(&[0.2, 4.0]),
            Err(HysteresisError::OutOfDomain { .. })
        ));
        assert_eq!(model.history_h_norm().map(|h| h.len()), Some(2));
        assert_eq!(model.states().cloned(), before);
    }

    #[test]
    fn negative_saturation_is_all_down_response() {
        let model = loop_model();
        assert_abs_diff_eq!(model.negative_saturation().unwrap(), 0.0, epsilon = 1e-12);
    }
}
