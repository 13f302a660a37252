// src/io.rs
//
// Persistence and data files.
//
//  - model.json : full model snapshot (config, mesh, parameters, transform, normalised
//                 history). States are not stored; they are recomputed on load, which is
//                 deterministic, so a reloaded model predicts bit-for-bit the same.
//  - tables     : two numeric columns (h, m), whitespace or comma separated, `#` comments.
//  - loop.csv   : h,m rows written with full precision; readable by `load_table`.

use std::fs::{self, create_dir_all, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{HysteresisError, Result};
use crate::mesh::Mesh;
use crate::model::{HysteresisModel, Mode, TrainingHistory};
use crate::softplus::SoftplusParam;
use crate::states::compute_states;
use crate::transform::HysteresisTransform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub config: ModelConfig,
    pub mesh: Mesh,
    pub raw_density: Vec<f64>,
    pub offset: f64,
    pub scale: f64,
    pub slope: f64,
    pub transform: HysteresisTransform,
    pub history_h_norm: Option<Vec<f64>>,
    pub history_m_norm: Option<Vec<f64>>,
}

impl ModelSnapshot {
    pub fn from_model(model: &HysteresisModel) -> Self {
        Self {
            config: model.config.clone(),
            mesh: model.mesh.clone(),
            raw_density: model.density.raw().to_vec(),
            offset: model.offset,
            scale: model.scale,
            slope: model.slope,
            transform: model.transform.clone(),
            history_h_norm: model.history.as_ref().map(|h| h.h_norm.clone()),
            history_m_norm: model.history.as_ref().and_then(|h| h.m_norm.clone()),
        }
    }

    pub fn into_model(self) -> Result<HysteresisModel> {
        self.config.validate()?;
        if self.raw_density.len() != self.mesh.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "raw density",
                expected: self.mesh.len(),
                got: self.raw_density.len(),
            });
        }

        let history = match self.history_h_norm {
            Some(h_norm) => {
                if let Some(m) = &self.history_m_norm {
                    if m.len() != h_norm.len() {
                        return Err(HysteresisError::LengthMismatch {
                            what: "history magnetisation",
                            expected: h_norm.len(),
                            got: m.len(),
                        });
                    }
                }
                let states = compute_states(&h_norm, &self.mesh, self.config.temperature)?;
                Some(TrainingHistory {
                    h_norm,
                    m_norm: self.history_m_norm,
                    states,
                })
            }
            None => None,
        };

        Ok(HysteresisModel {
            config: self.config,
            mesh: self.mesh,
            density: SoftplusParam::from_raw(self.raw_density),
            offset: self.offset,
            scale: self.scale,
            slope: self.slope,
            transform: self.transform,
            history,
            mode: Mode::Train,
        })
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    Ok(())
}

pub fn save_model_json(model: &HysteresisModel, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &ModelSnapshot::from_model(model))?;
    debug!(path = %path.display(), points = model.mesh.len(), "saved model");
    Ok(())
}

pub fn load_model_json(path: &Path) -> Result<HysteresisModel> {
    let reader = BufReader::new(File::open(path)?);
    let snapshot: ModelSnapshot = serde_json::from_reader(reader)?;
    snapshot.into_model()
}

// ---------------------------
// Tables
// ---------------------------

/// Parse a two-column table. Line numbers in errors are 1-based.
pub fn parse_table(text: &str) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut h = Vec::new();
    let mut m = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        if cols.len() != 2 {
            return Err(HysteresisError::Parse {
                line: i + 1,
                msg: format!("expected 2 columns, found {}", cols.len()),
            });
        }
        let parse = |s: &str| {
            s.parse::<f64>().map_err(|e| HysteresisError::Parse {
                line: i + 1,
                msg: format!("`{s}`: {e}"),
            })
        };
        h.push(parse(cols[0])?);
        m.push(parse(cols[1])?);
    }
    Ok((h, m))
}

pub fn load_table(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let text = fs::read_to_string(path)?;
    let (h, m) = parse_table(&text)?;
    debug!(path = %path.display(), rows = h.len(), "loaded table");
    Ok((h, m))
}

pub fn write_loop_csv(path: &Path, h: &[f64], m: &[f64]) -> Result<()> {
    if h.len() != m.len() {
        return Err(HysteresisError::LengthMismatch {
            what: "loop magnetisation",
            expected: h.len(),
            got: m.len(),
        });
    }
    ensure_parent_dir(path)?;
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# h,m")?;
    for (a, b) in h.iter().zip(m) {
        writeln!(w, "{:.16e},{:.16e}", a, b)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldBatch, Units};

    #[test]
    fn table_accepts_commas_whitespace_and_comments() {
        let text = "# h m\n\n-1.0, 0.5\n0.0\t1e-3\n  2 ,  -4.5  \n";
        let (h, m) = parse_table(text).unwrap();
        assert_eq!(h, vec![-1.0, 0.0, 2.0]);
        assert_eq!(m, vec![0.5, 1e-3, -4.5]);
    }

    #[test]
    fn table_reports_bad_line_number() {
        let err = parse_table("1 2\n# ok\n3 x\n").unwrap_err();
        assert!(matches!(err, HysteresisError::Parse { line: 3, .. }), "{err}");
        let err = parse_table("1 2 3\n").unwrap_err();
        assert!(matches!(err, HysteresisError::Parse { line: 1, .. }));
    }

    #[test]
    fn loop_csv_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/loop.csv");
        let h = vec![-1.0, 0.123456789012345, 1.0];
        let m = vec![0.1, -2.5e-7, 3.0];
        write_loop_csv(&path, &h, &m).unwrap();
        let (h2, m2) = load_table(&path).unwrap();
        assert_eq!(h, h2);
        assert_eq!(m, m2);
        assert!(write_loop_csv(&path, &h, &m[..2]).is_err());
    }

    #[test]
    fn model_json_round_trip_is_exact() {
        let cfg = ModelConfig {
            mesh_scale: 0.2,
            temperature: 0.03,
            ..ModelConfig::default()
        };
        let h = vec![-2.0, -1.0, 0.5, 2.0, 0.7, -0.4];
        let m: Vec<f64> = h.iter().map(|x| (x * 1.3f64).tanh()).collect();
        let mut model = HysteresisModel::with_history(cfg, &h, Some(m.as_slice())).unwrap();
        let n = model.mesh().len();
        model
            .set_raw_density((0..n).map(|i| (i as f64).sin() / 3.0).collect())
            .unwrap();
        model.set_offset(0.125);
        model.set_slope(-0.3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        save_model_json(&model, &path).unwrap();
        let loaded = load_model_json(&path).unwrap();

        assert_eq!(loaded.parameters(), model.parameters());
        assert_eq!(loaded.states(), model.states());
        assert_eq!(loaded.transform(), model.transform());

        let x = FieldBatch::sequence(h.clone());
        assert_eq!(
            loaded.forward(&x, Units::Physical).unwrap(),
            model.forward(&x, Units::Physical).unwrap()
        );
    }

    #[test]
    fn snapshot_rejects_inconsistent_density() {
        let cfg = ModelConfig {
            mesh_scale: 0.5,
            field_range: Some((0.0, 1.0)),
            ..ModelConfig::default()
        };
        let model = HysteresisModel::new(cfg).unwrap();
        let mut snap = ModelSnapshot::from_model(&model);
        snap.raw_density.pop();
        assert!(matches!(
            snap.into_model(),
            Err(HysteresisError::LengthMismatch { .. })
        ));
    }
}
