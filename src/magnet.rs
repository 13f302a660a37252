// src/magnet.rs
//
// Magnet adapter: one hysteresis model per physical magnet.
//
// The magnet owns the applied-field history (the fields actually set on the machine) and
// keeps its model's training history in sync with it. A *fantasy* field is a candidate
// setpoint an optimiser wants scored; fantasy evaluations run the model in next mode from
// the last applied state and never touch the history.
//
// The beam-transport physics is not modelled here: the consumer supplies a `BeamOptics`
// implementation turning an integrated strength into a first-order transport matrix.

use tracing::debug;

use crate::error::{HysteresisError, Result};
use crate::model::{FieldBatch, HysteresisModel, Mode, Units};
use crate::transform::check_domain;

/// First-order 6×6 transport matrix (x, x', y, y', z, δ).
pub type TransportMatrix = [[f64; 6]; 6];

pub fn identity_matrix() -> TransportMatrix {
    let mut m = [[0.0; 6]; 6];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

/// `a · b`
pub fn matmul(a: &TransportMatrix, b: &TransportMatrix) -> TransportMatrix {
    let mut c = [[0.0; 6]; 6];
    for i in 0..6 {
        for j in 0..6 {
            c[i][j] = (0..6).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    c
}

/// Element optics supplied by the beam-transport layer.
pub trait BeamOptics: Send + Sync {
    /// Transport matrix of an element of `length` at integrated strength `strength`.
    fn transport_matrix(&self, length: f64, strength: f64) -> TransportMatrix;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagnetMode {
    /// Evaluate at the last applied field.
    Current,
    /// Evaluate at `fantasy_h` appended to the applied history.
    Fantasy,
}

pub struct HysteresisMagnet {
    pub name: String,
    pub length: f64,
    /// Magnetisation → strength conversion factor.
    pub scale: f64,
    /// Candidate setpoint scored in fantasy mode.
    pub fantasy_h: f64,
    mode: MagnetMode,
    model: HysteresisModel,
    optics: Box<dyn BeamOptics>,
    history: Vec<f64>,
}

impl HysteresisMagnet {
    /// The model must already have a field normalisation (fitted history or `field_range`).
    pub fn new(
        name: impl Into<String>,
        length: f64,
        model: HysteresisModel,
        optics: Box<dyn BeamOptics>,
    ) -> Self {
        Self {
            name: name.into(),
            length,
            scale: 1.0,
            fantasy_h: -1.0,
            mode: MagnetMode::Fantasy,
            model,
            optics,
            history: Vec::new(),
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn mode(&self) -> MagnetMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MagnetMode) {
        self.mode = mode;
    }

    pub fn model(&self) -> &HysteresisModel {
        &self.model
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Last applied field.
    pub fn state(&self) -> Option<f64> {
        self.history.last().copied()
    }

    /// Fails with `OutOfDomain` if `h` is outside the model's field range. Mutates nothing.
    pub fn check_field(&self, h: f64) -> Result<()> {
        let hn = self.model.transform().transform_field(h)?;
        check_domain(&[hn])
    }

    /// Commit a field to the machine history. On error the history is left unchanged.
    ///
    /// The first field replaces whatever history the model was built with; later fields
    /// extend the model's states by one step from its last snapshot.
    pub fn apply_field(&mut self, h: f64) -> Result<()> {
        if self.history.is_empty() {
            self.model.set_history(&[h], None, false)?;
        } else {
            self.model.append_history(&[h])?;
        }
        self.history.push(h);
        debug!(magnet = %self.name, h, n = self.history.len(), "applied field");
        Ok(())
    }

    fn matrix_at(&self, magnetization: f64) -> TransportMatrix {
        self.optics
            .transport_matrix(self.length, magnetization * self.scale)
    }

    /// Magnetisation after walking an arbitrary history from scratch (pure).
    pub fn magnetization_for(&self, h: &[f64]) -> Result<f64> {
        let m = self.model.predict_magnetization(h)?;
        m.last().copied().ok_or(HysteresisError::EmptyHistory)
    }

    pub fn transport_matrix_for(&self, h: &[f64]) -> Result<TransportMatrix> {
        Ok(self.matrix_at(self.magnetization_for(h)?))
    }

    /// Magnetisation at the last applied field, from the model's precomputed states.
    pub fn current_magnetization(&self) -> Result<f64> {
        if self.history.is_empty() {
            return Err(HysteresisError::EmptyHistory);
        }
        let x = FieldBatch::sequence(self.history.clone());
        let m = self.model.evaluate(Mode::Train, &x, Units::Physical)?;
        m.last().copied().ok_or(HysteresisError::EmptyHistory)
    }

    pub fn current_transport_matrix(&self) -> Result<TransportMatrix> {
        Ok(self.matrix_at(self.current_magnetization()?))
    }

    /// Magnetisation if `candidate` were applied next. Does not mutate anything.
    pub fn fantasy_magnetization(&self, candidate: f64) -> Result<f64> {
        Ok(self.fantasy_magnetizations(&[candidate])?[0])
    }

    /// Independent fantasy evaluation of many candidates.
    pub fn fantasy_magnetizations(&self, candidates: &[f64]) -> Result<Vec<f64>> {
        let x = FieldBatch::candidates(candidates.to_vec());
        self.model.evaluate(Mode::Next, &x, Units::Physical)
    }

    pub fn fantasy_transport_matrix(&self, candidate: f64) -> Result<TransportMatrix> {
        Ok(self.matrix_at(self.fantasy_magnetization(candidate)?))
    }

    /// Matrix under the current mode.
    pub fn matrix(&self) -> Result<TransportMatrix> {
        match self.mode {
            MagnetMode::Current => self.current_transport_matrix(),
            MagnetMode::Fantasy => self.fantasy_transport_matrix(self.fantasy_h),
        }
    }
}

/// Ordered collection of named hysteresis magnets.
#[derive(Default)]
pub struct MagnetLattice {
    magnets: Vec<HysteresisMagnet>,
}

impl MagnetLattice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, magnet: HysteresisMagnet) -> Result<()> {
        if self.get(&magnet.name).is_some() {
            return Err(HysteresisError::InvalidConfig(format!(
                "duplicate magnet name `{}`",
                magnet.name
            )));
        }
        self.magnets.push(magnet);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.magnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&HysteresisMagnet> {
        self.magnets.iter().find(|m| m.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HysteresisMagnet> {
        self.magnets.iter_mut().find(|m| m.name == name)
    }

    /// Apply fields by magnet name.
    ///
    /// Every name and field is checked before anything is applied, so a failed call leaves
    /// all magnets unchanged.
    pub fn apply_fields(&mut self, fields: &[(&str, f64)]) -> Result<()> {
        for &(name, h) in fields {
            match self.get(name) {
                Some(m) => m.check_field(h)?,
                None => return Err(HysteresisError::UnknownMagnet(name.to_string())),
            }
        }
        for &(name, h) in fields {
            if let Some(m) = self.get_mut(name) {
                m.apply_field(h)?;
            }
        }
        Ok(())
    }

    /// Per-element matrices with every magnet temporarily switched to `mode`.
    pub fn transport(&mut self, mode: MagnetMode) -> Result<Vec<TransportMatrix>> {
        let saved: Vec<MagnetMode> = self.magnets.iter().map(|m| m.mode()).collect();
        for m in &mut self.magnets {
            m.set_mode(mode);
        }
        let result: Result<Vec<TransportMatrix>> =
            self.magnets.iter().map(|m| m.matrix()).collect();
        for (m, s) in self.magnets.iter_mut().zip(saved) {
            m.set_mode(s);
        }
        result
    }

    /// Product of all element matrices (last element leftmost).
    pub fn total_transport(&mut self, mode: MagnetMode) -> Result<TransportMatrix> {
        Ok(self
            .transport(mode)?
            .iter()
            .fold(identity_matrix(), |acc, m| matmul(m, &acc)))
    }
}
