use std::fmt;

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::design_matrix::DesignMatrix;
use super::statistics::{median, sigma_clip};
use crate::lightcurve::{LightCurve, LightCurveError};

#[derive(Debug)]
pub enum RegressionError {
    ShapeMismatch { cadences: usize, rows: usize },
    /// Fewer usable cadences than regressors.
    Underdetermined { cadences: usize, regressors: usize },
    Singular,
    LightCurve(LightCurveError),
}

impl fmt::Display for RegressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegressionError::ShapeMismatch { cadences, rows } => write!(
                f,
                "Design matrix has {} rows but the light curve has {} cadences",
                rows, cadences
            ),
            RegressionError::Underdetermined {
                cadences,
                regressors,
            } => write!(
                f,
                "{} cadences cannot constrain {} regressors",
                cadences, regressors
            ),
            RegressionError::Singular => write!(f, "Normal equations are singular"),
            RegressionError::LightCurve(e) => write!(f, "Light curve error: {}", e),
        }
    }
}

impl std::error::Error for RegressionError {}

impl From<LightCurveError> for RegressionError {
    fn from(value: LightCurveError) -> Self {
        RegressionError::LightCurve(value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegressionParams {
    /// Outlier rejection threshold in standard deviations.
    pub sigma: f64,
    /// Number of fit and reject rounds.
    pub niters: usize,
    /// Clipping passes inside each round.
    pub clip_iters: usize,
}

impl Default for RegressionParams {
    fn default() -> Self {
        RegressionParams {
            sigma: 5.0,
            niters: 5,
            clip_iters: 5,
        }
    }
}

/// Weighted least-squares fit of a design matrix to a light curve.
#[derive(Debug, Clone)]
pub struct RegressionCorrector {
    /// The light curve that was fitted.
    pub lc: LightCurve,
    pub coefficients: Array1<f64>,
    /// `X · coefficients` for every cadence.
    pub model: Array1<f64>,
    /// `false` for cadences rejected as outliers.
    pub cadence_mask: Array1<bool>,
    pub corrected: LightCurve,
}

impl RegressionCorrector {
    #[tracing::instrument(skip_all, fields(cadences = lc.len(), regressors = dm.ncols()))]
    pub fn correct(
        lc: &LightCurve,
        dm: &DesignMatrix,
        params: &RegressionParams,
    ) -> Result<RegressionCorrector, RegressionError> {
        if dm.nrows() != lc.len() {
            return Err(RegressionError::ShapeMismatch {
                cadences: lc.len(),
                rows: dm.nrows(),
            });
        }

        let weights = lc.flux_err.mapv(|e| 1.0 / (e * e));
        let mut cadence_mask: Array1<bool> = lc
            .flux
            .iter()
            .zip(weights.iter())
            .map(|(f, w)| f.is_finite() && w.is_finite())
            .collect();

        let mut coefficients = Array1::zeros(dm.ncols());
        let mut model = Array1::zeros(lc.len());
        for iteration in 0..params.niters.max(1) {
            coefficients = fit_coefficients(dm, &lc.flux, &weights, &cadence_mask)?;
            model = dm.values.dot(&coefficients);

            let residuals = &lc.flux - &model;
            let kept = sigma_clip(
                residuals.view(),
                cadence_mask.view(),
                params.sigma,
                params.clip_iters,
            );
            cadence_mask &= &kept;
            debug!(
                iteration,
                outliers = cadence_mask.iter().filter(|k| !**k).count(),
                "Regression iteration"
            );
        }

        let corrected = lc.subtract_model(model.view(), 0.0)?;
        Ok(RegressionCorrector {
            lc: lc.clone(),
            coefficients,
            model,
            cadence_mask,
            corrected,
        })
    }

    /// The model shifted to the median level of the fitted light curve.
    pub fn diagnostic_model(&self) -> Array1<f64> {
        let model_median = median(self.model.view()).unwrap_or(0.0);
        let flux_median = median(self.lc.flux.view()).unwrap_or(0.0);
        self.model.mapv(|m| m - model_median + flux_median)
    }

    /// Cadences of the corrected light curve rejected as outliers.
    pub fn outliers(&self) -> Result<LightCurve, LightCurveError> {
        let rejected = self.cadence_mask.mapv(|k| !k);
        self.corrected.select(rejected.view())
    }
}

const CONDITION_TOLERANCE: f64 = 1e-12;

fn is_well_conditioned(l: &DMatrix<f64>) -> bool {
    let (min, max) = l
        .diagonal()
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(min, max), d| (min.min(*d), max.max(*d)));
    min > 0.0 && (min / max).powi(2) > CONDITION_TOLERANCE
}

/// Solves `(XᵀWX) β = XᵀWy` over the unmasked cadences.
fn fit_coefficients(
    dm: &DesignMatrix,
    flux: &Array1<f64>,
    weights: &Array1<f64>,
    mask: &Array1<bool>,
) -> Result<Array1<f64>, RegressionError> {
    let rows: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .map(|(i, _)| i)
        .collect();
    if rows.len() < dm.ncols() || rows.is_empty() {
        return Err(RegressionError::Underdetermined {
            cadences: rows.len(),
            regressors: dm.ncols(),
        });
    }

    let x = dm.values.select(Axis(0), &rows);
    let y = flux.select(Axis(0), &rows);
    let w = weights.select(Axis(0), &rows);

    let weighted_x = &x * &w.view().insert_axis(Axis(1));
    let xtwx = x.t().dot(&weighted_x);
    let xtwy = weighted_x.t().dot(&y);

    let n = xtwx.nrows();
    let a = DMatrix::from_fn(n, n, |i, j| xtwx[[i, j]]);
    let b = DVector::from_iterator(n, xtwy.iter().copied());

    let solution = match a.clone().cholesky() {
        Some(cholesky) if is_well_conditioned(&cholesky.l()) => cholesky.solve(&b),
        _ => {
            let svd = a.svd(true, true);
            let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
            svd.solve(&b, largest * CONDITION_TOLERANCE)
                .map_err(|_| RegressionError::Singular)?
        }
    };
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::Singular);
    }
    Ok(solution.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    use super::*;
    use crate::lightcurve::LightCurveMeta;
    use crate::mission::Mission;

    fn lightcurve(flux: Array1<f64>) -> LightCurve {
        let n = flux.len();
        LightCurve::new(
            Array1::from_shape_fn(n, |i| i as f64 * 0.1),
            flux,
            Array1::ones(n),
            Array1::zeros(n),
            LightCurveMeta::new("test", Mission::Tess),
        )
        .unwrap()
    }

    fn trend_matrix(n: usize) -> DesignMatrix {
        let values = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { 1.0 });
        DesignMatrix::new(values, "trend")
    }

    #[test]
    fn test_exact_fit() {
        let n = 50;
        let flux = Array1::from_shape_fn(n, |i| 3.0 * i as f64 + 10.0);
        let rc = RegressionCorrector::correct(&lightcurve(flux), &trend_matrix(n), &Default::default())
            .unwrap();

        assert_abs_diff_eq!(rc.coefficients[0], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rc.coefficients[1], 10.0, epsilon = 1e-9);
        for f in rc.corrected.flux.iter() {
            assert_abs_diff_eq!(*f, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_outlier_is_masked_and_ignored() {
        let n = 100;
        let mut flux = Array1::from_shape_fn(n, |i| {
            2.0 * i as f64 + 5.0 + if i % 2 == 0 { 0.1 } else { -0.1 }
        });
        flux[37] += 50.0;

        let rc = RegressionCorrector::correct(&lightcurve(flux), &trend_matrix(n), &Default::default())
            .unwrap();

        assert!(!rc.cadence_mask[37]);
        assert_eq!(rc.cadence_mask.iter().filter(|k| !**k).count(), 1);
        assert_abs_diff_eq!(rc.coefficients[0], 2.0, epsilon = 1e-3);
        assert_eq!(rc.outliers().unwrap().len(), 1);
    }

    #[test]
    fn test_diagnostic_model_offset() {
        let n = 20;
        let flux = Array1::from_shape_fn(n, |i| i as f64 + 100.0);
        let rc = RegressionCorrector::correct(&lightcurve(flux.clone()), &trend_matrix(n), &Default::default())
            .unwrap();
        let diagnostic = rc.diagnostic_model();
        assert_abs_diff_eq!(
            median(diagnostic.view()).unwrap(),
            median(flux.view()).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_degenerate_design_falls_back() {
        let n = 30;
        // Two identical columns make the normal equations singular.
        let values = Array2::from_shape_fn((n, 2), |(i, _)| i as f64 + 1.0);
        let flux = Array1::from_shape_fn(n, |i| 4.0 * (i as f64 + 1.0));
        let rc = RegressionCorrector::correct(
            &lightcurve(flux),
            &DesignMatrix::new(values, "dup"),
            &Default::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(rc.coefficients.sum(), 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let result = RegressionCorrector::correct(
            &lightcurve(Array1::ones(10)),
            &trend_matrix(9),
            &Default::default(),
        );
        assert!(matches!(result, Err(RegressionError::ShapeMismatch { .. })));
    }
}
