// src/lib.rs
//
// FFT-accelerated demagnetising (magnetostatic) field solver for
// finite-difference magnetisation grids, with periodic boundaries, an
// evaluation-speedup extrapolation cache and optional macrocell coarsening.

pub mod backend;
pub mod config;
pub mod convolution;
pub mod demag;
pub mod error;
pub mod grid;
pub mod history;
pub mod kernel;
pub mod macrocell;
pub mod tensor;
pub mod vec3;
pub mod vector_field;

pub use config::{DemagConfig, MAX_SPEEDUP_ORDER};
pub use demag::DemagModule;
pub use error::DemagError;
pub use grid::{Grid3D, PbcImages};
pub use vector_field::VectorField3D;

/// Vacuum permeability (T·m/A).
pub const MU0: f64 = 4.0e-7 * std::f64::consts::PI;
