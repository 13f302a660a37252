// src/lib.rs

pub mod config;
pub mod error;
pub mod io;
pub mod magnet;
pub mod mesh;
pub mod model;
pub mod polynomial;
pub mod softplus;
pub mod states;
pub mod synthetic;
pub mod transform;
pub mod visualisation;

pub use error::{HysteresisError, Result};
pub use model::{FieldBatch, HysteresisModel, Mode, Units};
