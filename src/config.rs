use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::error::{HysteresisError, Result};

/// Construction parameters of a `HysteresisModel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Mesh lattice spacing in normalised units (smaller = finer).
    pub mesh_scale: f64,
    /// Degree of the response baseline polynomial.
    pub polynomial_degree: usize,
    /// Softening temperature of the switching sigmoid (0 = hard relay).
    pub temperature: f64,
    /// If false, density/offset/scale/slope are frozen.
    pub trainable: bool,
    /// Field range used for normalisation before any history is set.
    pub field_range: Option<(f64, f64)>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            mesh_scale: 1.0,
            polynomial_degree: 1,
            temperature: 1e-2,
            trainable: true,
            field_range: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.mesh_scale.is_finite() || self.mesh_scale <= 0.0 {
            return Err(HysteresisError::InvalidResolution(self.mesh_scale));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(HysteresisError::InvalidTemperature(self.temperature));
        }
        if self.polynomial_degree > 10 {
            return Err(HysteresisError::InvalidConfig(format!(
                "polynomial_degree {} is too high for the normal-equation fit",
                self.polynomial_degree
            )));
        }
        if let Some((lo, hi)) = self.field_range {
            if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
                return Err(HysteresisError::InvalidFieldRange { min: lo, max: hi });
            }
        }
        Ok(())
    }
}

/// Provenance written next to driver outputs (`config.json`).
#[derive(Serialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub run: RunInfo,
}

#[derive(Serialize)]
pub struct DataConfig {
    /// Source table, or None for the built-in major loop.
    pub source: Option<String>,
    pub samples: usize,
    pub h_min: f64,
    pub h_max: f64,
}

#[derive(Serialize)]
pub struct RunInfo {
    pub binary: String,
    pub run_id: String,

    // Optional provenance (can be filled later)
    pub git_commit: Option<String>,
    pub timestamp_utc: Option<String>,
}

impl RunConfig {
    pub fn write_to_dir(&self, out_dir: &Path) -> std::io::Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_deserialise_partially() {
        ModelConfig::default().validate().unwrap();
        let cfg: ModelConfig = serde_json::from_str(r#"{ "mesh_scale": 0.1 }"#).unwrap();
        assert_eq!(cfg.mesh_scale, 0.1);
        assert_eq!(cfg.polynomial_degree, 1);
        assert!(cfg.trainable);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ModelConfig::default();
        cfg.mesh_scale = 0.0;
        assert!(matches!(cfg.validate(), Err(HysteresisError::InvalidResolution(_))));

        let mut cfg = ModelConfig::default();
        cfg.temperature = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ModelConfig::default();
        cfg.field_range = Some((1.0, 1.0));
        assert!(matches!(cfg.validate(), Err(HysteresisError::InvalidFieldRange { .. })));
    }
}
