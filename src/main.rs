// src/main.rs
//
// This binary provides a small CLI around the hysteresis model for exploratory runs
// (quick looks at a measured loop, synthetic demos, checking normalisation fits).
//
// Outputs from this driver are written to `runs/` (or the directory
// specified via `out=`) and are not committed to version control.
//
// Examples:
//
//   cargo run --release
//       -> synthetic major loop from a Gaussian hysterion density (with noise),
//          model rebuilt from the noisy data and evaluated in train mode.
//
//   cargo run --release -- data=measurements/q1.txt mesh=0.05 degree=3
//       -> fit the normalisation on a measured (h, m) table and evaluate
//          the model with a uniform density on it.
//
//   cargo run --release -- minor density=diagonal temp=1e-3 run=minor_demo
//       -> decaying minor-loop sweep through a diagonal-heavy density.
//
// Logging goes through `tracing`; set RUST_LOG=debug for fit/mesh details.
//
// Typical outputs (per run directory):
//   runs/<run_id>/
//     ├── config.json
//     ├── loop.csv
//     ├── model.json
//     └── loop.png

use std::env;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hysteresis_sim::config::{DataConfig, ModelConfig, RunConfig, RunInfo};
use hysteresis_sim::io::{load_table, save_model_json, write_loop_csv};
use hysteresis_sim::synthetic::{
    density_on_mesh, diagonal_density, gaussian_density, generate_response, major_loop,
    minor_loops,
};
use hysteresis_sim::visualisation::save_loop_plot;
use hysteresis_sim::{FieldBatch, HysteresisModel, Result, Units};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    Major,
    Minor,
}

impl Sweep {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DensityKind {
    Uniform,
    Gaussian,
    Diagonal,
}

impl DensityKind {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "uniform" | "flat" => Some(Self::Uniform),
            "gaussian" | "gauss" => Some(Self::Gaussian),
            "diagonal" | "diag" => Some(Self::Diagonal),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Gaussian => "gaussian",
            Self::Diagonal => "diagonal",
        }
    }

    fn eval(&self, alpha: f64, beta: f64) -> f64 {
        match self {
            Self::Uniform => 1.0,
            Self::Gaussian => gaussian_density(alpha, beta, 0.2),
            Self::Diagonal => diagonal_density(alpha, beta, 0.25),
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"Usage:
  cargo run -- [major|minor] [data=FILE]
             [mesh=VAL] [degree=N] [temp=VAL] [density=uniform|gaussian|diagonal]
             [samples=N] [noise=VAL] [seed=N]
             [out=DIR] [run=RUN_ID]

Notes:
  - Without data=FILE a synthetic loop is generated (field range [-1, 1]).
  - FILE holds two columns (h m), whitespace or comma separated; '#' starts a comment line.
  - density= shapes the hysterion density of the synthetic source and of the model.
"#
    );
}

fn sanitize_run_id(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn default_run_id(source: &str, density: DensityKind) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    let ts = format!("{}{:03}", now.as_secs(), now.subsec_millis());
    format!("{}_{}_{}", ts, source, density.as_str())
}

fn unique_run_dir(out_root: &str, run_id: &str) -> PathBuf {
    let base = PathBuf::from(out_root);
    let mut dir = base.join(run_id);
    if !dir.exists() {
        return dir;
    }
    for k in 1..1000 {
        let cand = base.join(format!("{}_{}", run_id, k));
        if !cand.exists() {
            dir = cand;
            break;
        }
    }
    dir
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let argv: Vec<String> = env::args().collect();

    let mut model_cfg = ModelConfig {
        mesh_scale: 0.05,
        ..ModelConfig::default()
    };
    let mut sweep = Sweep::Major;
    let mut density = DensityKind::Gaussian;
    let mut data_path: Option<String> = None;
    let mut samples: usize = 101;
    let mut noise: f64 = 0.01;
    let mut seed: u64 = 42;

    // Output controls
    let mut out_root_override: Option<String> = None;
    let mut run_id_override: Option<String> = None;

    for arg in argv.iter().skip(1) {
        if arg == "-h" || arg == "--help" || arg == "help" {
            print_usage();
            return Ok(());
        }

        if arg == "major" {
            sweep = Sweep::Major;
            continue;
        }
        if arg == "minor" {
            sweep = Sweep::Minor;
            continue;
        }

        if let Some(v) = arg.strip_prefix("data=") {
            data_path = Some(v.to_string());
            continue;
        }
        if let Some(v) = arg.strip_prefix("mesh=") {
            match v.parse::<f64>() {
                Ok(val) => model_cfg.mesh_scale = val,
                Err(_) => warn!("could not parse mesh value '{v}', ignoring"),
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("degree=") {
            match v.parse::<usize>() {
                Ok(val) => model_cfg.polynomial_degree = val,
                Err(_) => warn!("could not parse degree value '{v}', ignoring"),
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("temp=") {
            match v.parse::<f64>() {
                Ok(val) => model_cfg.temperature = val,
                Err(_) => warn!("could not parse temp value '{v}', ignoring"),
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("density=") {
            density = DensityKind::from_str(v).unwrap_or_else(|| {
                warn!("unknown density '{v}', using gaussian");
                DensityKind::Gaussian
            });
            continue;
        }
        if let Some(v) = arg.strip_prefix("samples=") {
            samples = v.parse::<usize>().unwrap_or(samples);
            continue;
        }
        if let Some(v) = arg.strip_prefix("noise=") {
            noise = v.parse::<f64>().unwrap_or(noise);
            continue;
        }
        if let Some(v) = arg.strip_prefix("seed=") {
            seed = v.parse::<u64>().unwrap_or(seed);
            continue;
        }

        if let Some(v) = arg.strip_prefix("out=") {
            out_root_override = Some(v.to_string());
            continue;
        }
        if let Some(v) = arg.strip_prefix("run=") {
            run_id_override = Some(v.to_string());
            continue;
        }

        warn!("ignoring unknown argument '{arg}'");
    }
    model_cfg.validate()?;

    // ---- input loop: measured table or synthetic sweep ----
    let (h, m_measured) = match &data_path {
        Some(path) => load_table(&PathBuf::from(path))?,
        None => {
            let h = match sweep {
                Sweep::Major => major_loop(1.0, samples.div_ceil(2)),
                Sweep::Minor => {
                    let mut h = vec![-1.0];
                    h.extend(minor_loops(1.0, 0.8, samples.max(2) - 1));
                    h
                }
            };
            let source_cfg = ModelConfig {
                field_range: Some((-1.0, 1.0)),
                ..model_cfg.clone()
            };
            let mut source = HysteresisModel::new(source_cfg)?;
            let rho = density_on_mesh(source.mesh(), |a, b| density.eval(a, b));
            source.set_hysterion_density(&rho)?;
            let m = generate_response(&source, &h, noise, seed)?;
            (h, m)
        }
    };

    // ---- model: normalisation fitted on the loop, density from `density=` ----
    let mut model =
        HysteresisModel::with_history(model_cfg.clone(), &h, Some(m_measured.as_slice()))?;
    let rho = density_on_mesh(model.mesh(), |a, b| density.eval(a, b));
    model.set_hysterion_density(&rho)?;
    let m_model = model.forward(&FieldBatch::sequence(h.clone()), Units::Physical)?;

    let rms = (m_model
        .iter()
        .zip(&m_measured)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        / h.len().max(1) as f64)
        .sqrt();

    // ---- output directory + provenance ----
    let source_name = match &data_path {
        Some(_) => "data".to_string(),
        None => sweep.as_str().to_string(),
    };
    let run_id = run_id_override
        .map(|s| sanitize_run_id(&s))
        .unwrap_or_else(|| default_run_id(&source_name, density));
    let out_root = out_root_override.unwrap_or_else(|| "runs".to_string());
    let run_dir = unique_run_dir(&out_root, &run_id);
    create_dir_all(&run_dir)?;

    let (h_min, h_max) = model
        .transform()
        .field_range()
        .map(|r| (r.min, r.max))
        .unwrap_or((f64::NAN, f64::NAN));

    let run_config = RunConfig {
        model: model_cfg.clone(),
        data: DataConfig {
            source: data_path.clone(),
            samples: h.len(),
            h_min,
            h_max,
        },
        run: RunInfo {
            binary: "hysteresis-sim".to_string(),
            run_id: run_id.clone(),
            git_commit: None,
            timestamp_utc: None,
        },
    };
    run_config.write_to_dir(&run_dir)?;

    println!("--- hysteresis-sim run config ---");
    println!("run_dir: {}", run_dir.to_string_lossy());
    println!(
        "source: {}  samples: {}  field: [{:.4e}, {:.4e}]",
        source_name,
        h.len(),
        h_min,
        h_max
    );
    println!(
        "mesh: scale={} points={}  degree={}  temperature={:.3e}  density={}",
        model_cfg.mesh_scale,
        model.mesh().len(),
        model_cfg.polynomial_degree,
        model_cfg.temperature,
        density.as_str()
    );
    println!("--------------------------");

    write_loop_csv(&run_dir.join("loop.csv"), &h, &m_model)?;
    save_model_json(&model, &run_dir.join("model.json"))?;

    let png = run_dir.join("loop.png");
    let png = png.to_string_lossy();
    if let Err(e) = save_loop_plot(&h, Some(m_measured.as_slice()), &m_model, &png) {
        warn!("could not render loop plot: {e}");
    }

    info!(rms, saturation = model.negative_saturation()?, "model evaluated");
    println!("rms(model - data) = {:.4e}", rms);
    println!("Done. Outputs in {}", run_dir.to_string_lossy());
    Ok(())
}
