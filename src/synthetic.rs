// src/synthetic.rs
//
// Synthetic calibration data.
//
// Field sweeps (major / minor loops) and reference hysterion densities, plus a helper
// that runs a model with a known density over a sweep and adds seeded noise. Used by the
// driver's demo run and by the tests; the generator is deterministic for a given seed.

use crate::error::Result;
use crate::mesh::Mesh;
use crate::model::HysteresisModel;

/// `n` points from -h_sat to +h_sat and back, turning point not duplicated.
pub fn major_loop(h_sat: f64, n: usize) -> Vec<f64> {
    let n = n.max(2);
    let up: Vec<f64> = (0..n)
        .map(|i| -h_sat + 2.0 * h_sat * i as f64 / (n - 1) as f64)
        .collect();
    let mut h = up.clone();
    h.extend(up.iter().rev().skip(1));
    h
}

/// Decaying alternating sweep: ±h_sat, ±h_sat·decay, ... (`cycles` reversals).
pub fn minor_loops(h_sat: f64, decay: f64, cycles: usize) -> Vec<f64> {
    let mut h = Vec::with_capacity(cycles);
    let mut amp = h_sat;
    for k in 0..cycles {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        h.push(sign * amp);
        amp *= decay;
    }
    h
}

/// Isotropic Gaussian bump on the Preisach plane centred at (0.5, 0.5).
pub fn gaussian_density(alpha: f64, beta: f64, width: f64) -> f64 {
    let da = alpha - 0.5;
    let db = beta - 0.5;
    (-(da * da + db * db) / (2.0 * width * width)).exp()
}

/// Density concentrated near the diagonal: exp(-(alpha - beta) / length).
pub fn diagonal_density(alpha: f64, beta: f64, length: f64) -> f64 {
    (-(alpha - beta) / length).exp()
}

/// Evaluate a density function on every mesh point.
pub fn density_on_mesh(mesh: &Mesh, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    mesh.iter().map(|p| f(p.alpha, p.beta)).collect()
}

/// Physical response of `model` along `h` with additive uniform noise in ±noise.
pub fn generate_response(model: &HysteresisModel, h: &[f64], noise: f64, seed: u64) -> Result<Vec<f64>> {
    let mut m = model.predict_magnetization(h)?;
    if noise > 0.0 {
        let mut rng = XorShift64::new(seed);
        for v in &mut m {
            *v += noise * (2.0 * rng.next_f64() - 1.0);
        }
    }
    Ok(m)
}

// ---------------------------

pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        let s = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn next_f64(&mut self) -> f64 {
        // Map top 53 bits to [0,1)
        let u = self.next_u64() >> 11;
        (u as f64) * (1.0 / ((1u64 << 53) as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    #[test]
    fn major_loop_is_symmetric() {
        let h = major_loop(1.0, 5);
        assert_eq!(h, vec![-1.0, -0.5, 0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0]);
    }

    #[test]
    fn minor_loops_decay() {
        let h = minor_loops(2.0, 0.5, 4);
        assert_eq!(h, vec![2.0, -1.0, 0.5, -0.25]);
    }

    #[test]
    fn noise_is_seeded() {
        let cfg = ModelConfig {
            mesh_scale: 0.25,
            field_range: Some((-1.0, 1.0)),
            ..ModelConfig::default()
        };
        let model = HysteresisModel::new(cfg).unwrap();
        let h = major_loop(1.0, 6);
        let a = generate_response(&model, &h, 0.01, 7).unwrap();
        let b = generate_response(&model, &h, 0.01, 7).unwrap();
        let c = generate_response(&model, &h, 0.0, 7).unwrap();
        assert_eq!(a, b);
        for (x, y) in a.iter().zip(&c) {
            assert!((x - y).abs() <= 0.01);
        }
    }
}
