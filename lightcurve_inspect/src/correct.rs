use std::fmt;

use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::{
    percentile, DesignMatrix, DesignMatrixError, RegressionCorrector, RegressionError,
    RegressionParams,
};
use crate::cutout::{ApertureMask, Cutout, CutoutError};
use crate::lightcurve::{LightCurve, LightCurveError};
use crate::quality::QualityBitmask;

/// Steps of a correction run that can leave nothing behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    FilterInvalid,
    Regressors,
    Clean,
    QualityFilter,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "flux extraction",
            Stage::FilterInvalid => "invalid cadence filtering",
            Stage::Regressors => "regressor construction",
            Stage::Clean => "non-finite sample removal",
            Stage::QualityFilter => "quality filtering",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub enum CorrectionError {
    EmptyAperture,
    EmptyAfter(Stage),
    Cutout(CutoutError),
    LightCurve(LightCurveError),
    DesignMatrix(DesignMatrixError),
    Regression(RegressionError),
}

impl fmt::Display for CorrectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionError::EmptyAperture => write!(f, "No pixels pass the aperture threshold"),
            CorrectionError::EmptyAfter(stage) => {
                write!(f, "Light curve is empty after {}", stage)
            }
            CorrectionError::Cutout(e) => write!(f, "Cutout error: {}", e),
            CorrectionError::LightCurve(e) => write!(f, "Light curve error: {}", e),
            CorrectionError::DesignMatrix(e) => write!(f, "Design matrix error: {}", e),
            CorrectionError::Regression(e) => write!(f, "Regression error: {}", e),
        }
    }
}

impl std::error::Error for CorrectionError {}

impl From<CutoutError> for CorrectionError {
    fn from(value: CutoutError) -> Self {
        CorrectionError::Cutout(value)
    }
}

impl From<LightCurveError> for CorrectionError {
    fn from(value: LightCurveError) -> Self {
        CorrectionError::LightCurve(value)
    }
}

impl From<DesignMatrixError> for CorrectionError {
    fn from(value: DesignMatrixError) -> Self {
        CorrectionError::DesignMatrix(value)
    }
}

impl From<RegressionError> for CorrectionError {
    fn from(value: RegressionError) -> Self {
        CorrectionError::Regression(value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CorrectionParams {
    /// Aperture threshold in robust standard deviations above the median.
    pub threshold: f64,
    /// Number of principal components of the background pixels.
    pub npca: usize,
    pub regression: RegressionParams,
    /// Percentile of the model added back after subtraction.
    pub model_percentile: f64,
    /// Cadences with these quality flags are dropped from the result.
    pub quality_bitmask: QualityBitmask,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        CorrectionParams {
            threshold: 60.0,
            npca: 5,
            regression: RegressionParams::default(),
            model_percentile: 5.0,
            quality_bitmask: QualityBitmask::Hard,
        }
    }
}

/// A corrected light curve and the products behind it.
#[derive(Debug, Clone)]
pub struct Correction {
    pub lightcurve: LightCurve,
    pub aperture: ApertureMask,
    pub raw: LightCurve,
    pub design_matrix: DesignMatrix,
    pub regression: RegressionCorrector,
}

/// Removes scattered light from a cutout's aperture photometry.
///
/// The background model is a PCA of the pixels outside the aperture plus an
/// offset. After subtraction the model's low percentile is added back so the
/// flux stays on its original level, then the curve is normalized and
/// cadences failing `params.quality_bitmask` are dropped.
#[tracing::instrument(skip_all, fields(label = cutout.label(), sector = cutout.sector()))]
pub fn correct_cutout<C: Cutout + ?Sized>(
    cutout: &C,
    params: &CorrectionParams,
) -> Result<Correction, CorrectionError> {
    let aperture = ApertureMask::threshold_mask(cutout, params.threshold);
    if aperture.is_empty() {
        return Err(CorrectionError::EmptyAperture);
    }
    debug!(pixels = aperture.count(), "Aperture");

    let raw = aperture.to_lightcurve(cutout)?;
    non_empty(&raw, Stage::Extract)?;

    let valid: Array1<bool> = Zip::from(&raw.flux)
        .and(&raw.flux_err)
        .map_collect(|f, e| f.is_finite() && e.is_finite() && *f > 0.0 && *e > 0.0);
    let raw = raw.select(valid.view())?;
    non_empty(&raw, Stage::FilterInvalid)?;
    debug!(cadences = raw.len(), "Valid cadences");

    let design_matrix = background_regressors(cutout, &aperture, &valid)?
        .pca(params.npca)?
        .append_constant();
    debug!(components = design_matrix.ncols(), "Design matrix");

    let regression = RegressionCorrector::correct(&raw, &design_matrix, &params.regression)?;
    let offset = percentile(regression.model.view(), params.model_percentile).unwrap_or(0.0);
    let corrected = raw.subtract_model(regression.model.view(), offset)?;

    let corrected = corrected.remove_nans();
    non_empty(&corrected, Stage::Clean)?;
    let corrected = corrected.normalize()?;

    let good_quality = corrected
        .meta
        .mission
        .quality_mask(corrected.quality.view(), params.quality_bitmask);
    let lightcurve = corrected.select(good_quality.view())?;
    non_empty(&lightcurve, Stage::QualityFilter)?;
    debug!(cadences = lightcurve.len(), "Corrected");

    Ok(Correction {
        lightcurve,
        aperture,
        raw,
        design_matrix,
        regression,
    })
}

fn non_empty(lc: &LightCurve, stage: Stage) -> Result<(), CorrectionError> {
    if lc.is_empty() {
        Err(CorrectionError::EmptyAfter(stage))
    } else {
        Ok(())
    }
}

/// Pixels outside the aperture on the valid cadences, one column per pixel,
/// keeping only pixels that are finite on every one of those cadences.
fn background_regressors<C: Cutout + ?Sized>(
    cutout: &C,
    aperture: &ApertureMask,
    valid: &Array1<bool>,
) -> Result<DesignMatrix, CorrectionError> {
    let frames: Vec<usize> = valid
        .iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .map(|(i, _)| i)
        .collect();
    let pixels: Vec<(usize, usize)> = aperture
        .mask
        .indexed_iter()
        .filter(|(_, inside)| !**inside)
        .map(|(index, _)| index)
        .collect();

    let flux = cutout.flux();
    let flux = flux.select(Axis(0), &frames);
    let values = Array2::from_shape_fn((frames.len(), pixels.len()), |(t, p)| {
        let (r, c) = pixels[p];
        flux[[t, r, c]]
    });
    let dm = DesignMatrix::new(values, "regressors").drop_nonfinite_columns();
    if dm.ncols() == 0 {
        return Err(CorrectionError::EmptyAfter(Stage::Regressors));
    }
    Ok(dm)
}
