mod statistics;
pub use statistics::*;

pub mod design_matrix;
pub mod regression;
pub mod spectrum;

pub use design_matrix::{DesignMatrix, DesignMatrixError};
pub use regression::{RegressionCorrector, RegressionError, RegressionParams};
pub use spectrum::{amplitude_spectrum, AmplitudeSpectrum, SpectrumError, SpectrumParams};
