// src/states.rs
//
// Preisach state engine.
//
// For every mesh point (alpha, beta) we track the switched-up fraction s in [0, 1].
// Walking a normalised field history h_0, h_1, ... from an initial snapshot (all down,
// field 0):
//
//   h > h_prev :  s <- max(s, σ((h - alpha) / T))     (switch up)
//   h < h_prev :  s <- min(s, σ((h - beta) / T))      (switch down)
//   h = h_prev :  s unchanged
//
// T = 0 gives the classical hard relay (up if h >= alpha, down if h <= beta). A monotone
// run of fields only depends on its endpoint, so refining the sampling of a sweep does
// not move the states.
//
// Each step depends only on the previous row and the previous field, so continuing
// from a snapshot reproduces a full walk exactly; that is what makes fantasy
// evaluation cheap.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{HysteresisError, Result};
use crate::mesh::{Mesh, MeshPoint};

/// Numerically stable logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[inline]
fn sigmoid_prime(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// Up fraction a rising field `h` drives the hysterion to (at least).
#[inline]
fn up_weight(h: f64, alpha: f64, temperature: f64) -> f64 {
    if temperature == 0.0 {
        if h >= alpha {
            1.0
        } else {
            0.0
        }
    } else {
        sigmoid((h - alpha) / temperature)
    }
}

/// Up fraction a falling field `h` leaves the hysterion with (at most).
#[inline]
fn keep_weight(h: f64, beta: f64, temperature: f64) -> f64 {
    if temperature == 0.0 {
        if h > beta {
            1.0
        } else {
            0.0
        }
    } else {
        sigmoid((h - beta) / temperature)
    }
}

/// Row-major (rows × mesh size) matrix of hysterion states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl StateTensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn last_row(&self) -> Option<&[f64]> {
        if self.rows == 0 {
            None
        } else {
            Some(self.row(self.rows - 1))
        }
    }

    /// Trajectory of one hysterion across all rows.
    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().skip(col).step_by(self.cols.max(1)).copied()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    /// Snapshot of the last row together with the field that produced it.
    pub fn snapshot(&self, field: f64) -> Option<StateSnapshot> {
        self.last_row().map(|row| StateSnapshot {
            state: row.to_vec(),
            field,
        })
    }
}

/// Last hysterion state and last normalised field of a processed history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: Vec<f64>,
    pub field: f64,
}

impl StateSnapshot {
    /// All hysterions down at field 0 (the bottom of the normalised domain).
    pub fn initial(n_points: usize) -> Self {
        Self {
            state: vec![0.0; n_points],
            field: 0.0,
        }
    }
}

fn check_temperature(temperature: f64) -> Result<()> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(HysteresisError::InvalidTemperature(temperature));
    }
    Ok(())
}

fn check_snapshot(mesh: &Mesh, snapshot: &StateSnapshot) -> Result<()> {
    if snapshot.state.len() != mesh.len() {
        return Err(HysteresisError::LengthMismatch {
            what: "snapshot state",
            expected: mesh.len(),
            got: snapshot.state.len(),
        });
    }
    Ok(())
}

/// One history step for every mesh point.
#[inline]
fn step_into(
    prev: &[f64],
    h_prev: f64,
    h: f64,
    points: &[MeshPoint],
    temperature: f64,
    out: &mut [f64],
) {
    debug_assert_eq!(prev.len(), out.len());
    if h > h_prev {
        for ((o, &s), p) in out.iter_mut().zip(prev).zip(points) {
            *o = s.max(up_weight(h, p.alpha, temperature));
        }
    } else if h < h_prev {
        for ((o, &s), p) in out.iter_mut().zip(prev).zip(points) {
            *o = s.min(keep_weight(h, p.beta, temperature));
        }
    } else {
        out.copy_from_slice(prev);
    }
}

/// States along a full normalised history, starting from all-down at field 0.
pub fn compute_states(h_norm: &[f64], mesh: &Mesh, temperature: f64) -> Result<StateTensor> {
    predict_continuation(h_norm, mesh, &StateSnapshot::initial(mesh.len()), temperature)
}

/// States along `tail`, continuing from `snapshot` without re-walking earlier history.
pub fn predict_continuation(
    tail: &[f64],
    mesh: &Mesh,
    snapshot: &StateSnapshot,
    temperature: f64,
) -> Result<StateTensor> {
    check_temperature(temperature)?;
    check_snapshot(mesh, snapshot)?;

    let n = mesh.len();
    let mut states = StateTensor::zeros(tail.len(), n);
    let mut h_prev = snapshot.field;

    for (i, &h) in tail.iter().enumerate() {
        let (done, rest) = states.data.split_at_mut(i * n);
        let prev: &[f64] = if i == 0 {
            &snapshot.state
        } else {
            &done[(i - 1) * n..]
        };
        step_into(prev, h_prev, h, &mesh.points, temperature, &mut rest[..n]);
        h_prev = h;
    }

    trace!(steps = tail.len(), points = n, "walked hysterion states");
    Ok(states)
}

/// One step for each candidate field, every candidate starting from the same snapshot.
///
/// Row `k` of the result equals `predict_continuation(&[candidates[k]], ..)`. Candidates are
/// independent and evaluated in parallel; the snapshot is only read.
pub fn predict_batched_continuation(
    candidates: &[f64],
    mesh: &Mesh,
    snapshot: &StateSnapshot,
    temperature: f64,
) -> Result<StateTensor> {
    check_temperature(temperature)?;
    check_snapshot(mesh, snapshot)?;

    let n = mesh.len();
    let mut states = StateTensor::zeros(candidates.len(), n);
    if n == 0 {
        return Ok(states);
    }

    states
        .data
        .par_chunks_mut(n)
        .zip(candidates.par_iter())
        .for_each(|(row, &h)| {
            step_into(&snapshot.state, snapshot.field, h, &mesh.points, temperature, row);
        });

    Ok(states)
}

/// d s / d h for a single step from `snapshot` to field `h`.
///
/// Nonzero only for hysterions the step actually moves. Always zero for the hard relay
/// and at `h == snapshot.field`, where the soft update is discontinuous.
pub fn switch_sensitivity(
    h: f64,
    mesh: &Mesh,
    snapshot: &StateSnapshot,
    temperature: f64,
) -> Result<Vec<f64>> {
    check_temperature(temperature)?;
    check_snapshot(mesh, snapshot)?;

    if temperature == 0.0 || h == snapshot.field {
        return Ok(vec![0.0; mesh.len()]);
    }

    let inv_t = 1.0 / temperature;
    let rising = h > snapshot.field;
    Ok(snapshot
        .state
        .iter()
        .zip(mesh.iter())
        .map(|(&s, p)| {
            let x = if rising {
                (h - p.alpha) * inv_t
            } else {
                (h - p.beta) * inv_t
            };
            let target = sigmoid(x);
            let moves = if rising { target > s } else { target < s };
            if moves {
                sigmoid_prime(x) * inv_t
            } else {
                0.0
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::build_mesh;
    use approx::assert_abs_diff_eq;

    fn tiny_mesh() -> Mesh {
        // (alpha, beta): one wide and one narrow hysterion
        Mesh {
            resolution: 1.0,
            divisions: 1,
            refined: true,
            points: vec![
                MeshPoint { alpha: 0.8, beta: 0.2 },
                MeshPoint { alpha: 0.5, beta: 0.45 },
            ],
        }
    }

    #[test]
    fn hard_relay_follows_preisach_rules() {
        let mesh = tiny_mesh();
        let h = [0.1, 0.6, 0.9, 0.4, 0.3, 0.1, 0.6];
        let s = compute_states(&h, &mesh, 0.0).unwrap();
        let wide: Vec<f64> = s.column(0).collect();
        let narrow: Vec<f64> = s.column(1).collect();
        assert_eq!(wide, vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(narrow, vec![0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn sweep_result_ignores_sampling_density() {
        // alpha is never reached, so the hysterion only sees its sub-threshold tail
        let mesh = Mesh {
            resolution: 1.0,
            divisions: 1,
            refined: false,
            points: vec![MeshPoint { alpha: 0.55, beta: 0.0 }],
        };
        let t = 1e-2;
        let coarse = compute_states(&[0.5], &mesh, t).unwrap();
        let fine: Vec<f64> = (1..=1000).map(|k| 0.5 * k as f64 / 1000.0).collect();
        let dense = compute_states(&fine, &mesh, t).unwrap();
        assert_abs_diff_eq!(
            coarse.last_row().unwrap()[0],
            dense.last_row().unwrap()[0],
            epsilon = 1e-15
        );
        assert!(dense.last_row().unwrap()[0] < 0.01);
    }

    #[test]
    fn initial_state_is_down_and_flat_field_keeps_it() {
        let mesh = build_mesh(0.25, None).unwrap();
        let s = compute_states(&[0.0, 0.0], &mesh, 1e-2).unwrap();
        assert!(s.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn continuation_matches_full_walk() {
        let mesh = build_mesh(0.1, None).unwrap();
        let h = [0.2, 0.7, 0.95, 0.4, 0.15, 0.6, 0.3, 0.8];
        let t = 1e-2;
        let full = compute_states(&h, &mesh, t).unwrap();

        let split = 5;
        let head = compute_states(&h[..split], &mesh, t).unwrap();
        let snap = head.snapshot(h[split - 1]).unwrap();
        let tail = predict_continuation(&h[split..], &mesh, &snap, t).unwrap();

        for (k, row) in tail.iter_rows().enumerate() {
            let expected = full.row(split + k);
            for (a, b) in row.iter().zip(expected) {
                assert!((a - b).abs() < 1e-12, "row {}: {} vs {}", split + k, a, b);
            }
        }
    }

    #[test]
    fn batched_rows_match_single_candidates() {
        let mesh = build_mesh(0.1, None).unwrap();
        let t = 5e-3;
        let hist = compute_states(&[0.3, 0.9, 0.5], &mesh, t).unwrap();
        let snap = hist.snapshot(0.5).unwrap();

        let candidates = [0.0, 0.25, 0.5, 0.75, 1.0];
        let batch = predict_batched_continuation(&candidates, &mesh, &snap, t).unwrap();
        assert_eq!(batch.rows, candidates.len());
        for (k, &c) in candidates.iter().enumerate() {
            let single = predict_continuation(&[c], &mesh, &snap, t).unwrap();
            assert_eq!(batch.row(k), single.row(0), "candidate {}", c);
        }
    }

    #[test]
    fn sensitivity_matches_finite_difference() {
        let mesh = build_mesh(0.2, None).unwrap();
        let t = 0.05;
        let snap = compute_states(&[0.7, 0.4], &mesh, t)
            .unwrap()
            .snapshot(0.4)
            .unwrap();
        let eps = 1e-6;
        for &h in &[0.2, 0.65] {
            let ds = switch_sensitivity(h, &mesh, &snap, t).unwrap();
            let up = predict_continuation(&[h + eps], &mesh, &snap, t).unwrap();
            let dn = predict_continuation(&[h - eps], &mesh, &snap, t).unwrap();
            for j in 0..mesh.len() {
                let fd = (up.row(0)[j] - dn.row(0)[j]) / (2.0 * eps);
                assert!((fd - ds[j]).abs() < 1e-5, "h={} j={}: fd={} an={}", h, j, fd, ds[j]);
            }
        }
    }

    #[test]
    fn rejects_bad_temperature_and_snapshot() {
        let mesh = build_mesh(0.5, None).unwrap();
        assert!(matches!(
            compute_states(&[0.5], &mesh, -1.0),
            Err(HysteresisError::InvalidTemperature(_))
        ));
        let bad = StateSnapshot::initial(mesh.len() + 1);
        assert!(matches!(
            predict_continuation(&[0.5], &mesh, &bad, 0.01),
            Err(HysteresisError::LengthMismatch { .. })
        ));
    }
}
