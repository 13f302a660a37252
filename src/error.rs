// src/error.rs
//
// Error taxonomy for the hysteresis model.
//
// Every variant is a caller/programmer error surfaced immediately: the core does no
// network I/O, so there is no transient class and nothing is retried. File I/O only
// happens in `io.rs` and is wrapped in `Io` / `Json` / `Parse`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HysteresisError {
    /// Mesh resolution was zero, negative, not finite, or finer than `MAX_DIVISIONS` allows.
    #[error("mesh resolution must be finite, > 0 and at least 1/MAX_DIVISIONS, got {0}")]
    InvalidResolution(f64),

    /// `untransform` received a normalised field outside [0, 1] (within 1e-6).
    #[error("normalised field outside [0, 1]: min={min}, max={max} (is h normalised?)")]
    OutOfDomain { min: f64, max: f64 },

    /// Train-mode input does not reproduce the stored history.
    #[error("train mode must be evaluated on the history fields: {0}")]
    HistoryMismatch(String),

    /// Next-mode input was not shaped [batch, 1, 1].
    #[error("shape of x must be [-1, 1, 1] for next mode, current shape is {0:?}")]
    Shape(Vec<usize>),

    /// The effective density sums to zero (or non-finite); magnetisation is undefined.
    #[error("hysterion density is degenerate (sum = {0})")]
    DegenerateDensity(f64),

    /// A density value cannot be inverted through the softplus map.
    #[error("density value {value} at index {index} is at or below the softplus floor")]
    InvalidDensity { index: usize, value: f64 },

    #[error("no samples given for {0}")]
    EmptyData(&'static str),

    #[error("field range is degenerate: min={min}, max={max}")]
    InvalidFieldRange { min: f64, max: f64 },

    #[error("temperature must be finite and >= 0, got {0}")]
    InvalidTemperature(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("length mismatch for {what}: expected {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("transform has no field normalisation; fit it or set a field range first")]
    UnfittedTransform,

    #[error("model parameters are frozen (trainable = false)")]
    Frozen,

    #[error("no field has been applied yet")]
    EmptyHistory,

    #[error("unknown magnet `{0}`")]
    UnknownMagnet(String),

    #[error("parse error on line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HysteresisError>;
