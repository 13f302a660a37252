// src/mesh.rs
//
// Triangular mesh over the Preisach plane.
//
// Points live on the upper triangle (alpha >= beta) of the unit square, diagonal included.
// The base mesh is a regular lattice with spacing ~resolution; an optional density
// function refines individual lattice cells where more hysterions are expected.
//
// All points are keyed on the finest integer lattice, so the mesh is duplicate-free and
// its order (alpha index, then beta index) is identical for identical inputs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HysteresisError, Result};

/// Maximum number of times a base cell may be bisected (per axis).
pub const MAX_REFINE_LEVEL: u32 = 3;

/// Largest base lattice (divisions per axis) `build_mesh` accepts.
pub const MAX_DIVISIONS: usize = 1024;

/// One hysterion: switches up at `alpha`, down at `beta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshPoint {
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    /// Resolution the mesh was built with.
    pub resolution: f64,
    /// Base lattice divisions per axis.
    pub divisions: usize,
    /// True if a density function refined any cell.
    pub refined: bool,
    pub points: Vec<MeshPoint>,
}

/// Number of lattice nodes on (and above) the diagonal of an n×n lattice.
pub fn upper_triangle_size(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Build the mesh at a given resolution (lattice spacing in normalised units).
///
/// Halving `resolution` roughly quadruples the number of points. `density_fn(alpha, beta)`
/// returns a relative density at a cell centre; a cell with density `f` is bisected
/// `round(log2 f)` times, clamped to `[0, MAX_REFINE_LEVEL]`.
pub fn build_mesh(resolution: f64, density_fn: Option<&dyn Fn(f64, f64) -> f64>) -> Result<Mesh> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(HysteresisError::InvalidResolution(resolution));
    }

    // Small slack so 1/0.1 lands on 10 rather than 11.
    let divisions = ((1.0 / resolution) - 1e-9).ceil().max(1.0);
    if divisions > MAX_DIVISIONS as f64 {
        return Err(HysteresisError::InvalidResolution(resolution));
    }
    let n = divisions as usize;
    let fine = 1usize << MAX_REFINE_LEVEL;
    let n_fine = n * fine;

    let mut keys: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut refined = false;

    // cell (ia, ib) spans alpha in [ia/n, (ia+1)/n], beta in [ib/n, (ib+1)/n]
    for ia in 0..n {
        for ib in 0..=ia {
            let level = match density_fn {
                Some(f) => {
                    let alpha_c = (ia as f64 + 0.5) / n as f64;
                    let beta_c = (ib as f64 + 0.5) / n as f64;
                    refine_level(f(alpha_c, beta_c))
                }
                None => 0,
            };
            if level > 0 {
                refined = true;
            }

            let sub = 1usize << level;
            let stride = fine / sub;
            for a in 0..=sub {
                for b in 0..=sub {
                    let ka = ia * fine + a * stride;
                    let kb = ib * fine + b * stride;
                    if ka >= kb {
                        keys.insert((ka, kb));
                    }
                }
            }
        }
    }

    let inv = 1.0 / n_fine as f64;
    let points: Vec<MeshPoint> = keys
        .into_iter()
        .map(|(ka, kb)| MeshPoint {
            alpha: ka as f64 * inv,
            beta: kb as f64 * inv,
        })
        .collect();

    debug!(
        resolution,
        divisions = n,
        refined,
        points = points.len(),
        "built triangular mesh"
    );

    Ok(Mesh {
        resolution,
        divisions: n,
        refined,
        points,
    })
}

fn refine_level(f: f64) -> u32 {
    if !f.is_finite() || f <= 1.0 {
        return 0;
    }
    f.log2().round().clamp(0.0, MAX_REFINE_LEVEL as f64) as u32
}

impl Mesh {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MeshPoint> {
        self.points.iter()
    }

    /// Side length of the dense (alpha, beta) grid of an unrefined mesh.
    pub fn lattice_size(&self) -> usize {
        self.divisions + 1
    }

    /// Scatter one value per mesh point into a dense grid `[alpha][beta]`,
    /// zero where alpha < beta. Only defined for unrefined meshes.
    pub fn to_dense(&self, values: &[f64]) -> Result<Vec<Vec<f64>>> {
        self.check_dense()?;
        if values.len() != self.len() {
            return Err(HysteresisError::LengthMismatch {
                what: "mesh values",
                expected: self.len(),
                got: values.len(),
            });
        }
        let n = self.lattice_size();
        let mut grid = vec![vec![0.0; n]; n];
        for (p, &v) in self.points.iter().zip(values) {
            let (ia, ib) = self.lattice_index(p);
            grid[ia][ib] = v;
        }
        Ok(grid)
    }

    /// Gather the upper triangle of a dense `[alpha][beta]` grid back into mesh order.
    pub fn from_dense(&self, grid: &[Vec<f64>]) -> Result<Vec<f64>> {
        self.check_dense()?;
        let n = self.lattice_size();
        if grid.len() != n || grid.iter().any(|row| row.len() != n) {
            return Err(HysteresisError::LengthMismatch {
                what: "dense grid side",
                expected: n,
                got: grid.len(),
            });
        }
        Ok(self
            .points
            .iter()
            .map(|p| {
                let (ia, ib) = self.lattice_index(p);
                grid[ia][ib]
            })
            .collect())
    }

    fn check_dense(&self) -> Result<()> {
        if self.refined {
            return Err(HysteresisError::InvalidConfig(
                "dense grid conversion requires an unrefined mesh".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    fn lattice_index(&self, p: &MeshPoint) -> (usize, usize) {
        let n = self.divisions as f64;
        ((p.alpha * n).round() as usize, (p.beta * n).round() as usize)
    }
}
