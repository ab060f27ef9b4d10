use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use ndarray::{Array1, ArrayView1, Zip};
use serde::Serialize;

use crate::analysis::median;
use crate::mission::Mission;

#[derive(Debug)]
pub enum LightCurveError {
    LengthMismatch {
        column: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Time at this index is not greater than the previous one.
    NotIncreasing(usize),
    NonPositiveMedian(f64),
    Empty,
    Csv(csv::Error),
    Io(std::io::Error),
}

impl fmt::Display for LightCurveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightCurveError::LengthMismatch {
                column,
                expected,
                actual,
            } => write!(
                f,
                "Column {} has {} samples, expected {}",
                column, actual, expected
            ),
            LightCurveError::NotIncreasing(index) => {
                write!(f, "Time is not strictly increasing at index {}", index)
            }
            LightCurveError::NonPositiveMedian(median) => {
                write!(f, "Cannot normalize by non-positive median flux {}", median)
            }
            LightCurveError::Empty => write!(f, "Light curve is empty"),
            LightCurveError::Csv(e) => write!(f, "CSV error: {}", e),
            LightCurveError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for LightCurveError {}

impl From<csv::Error> for LightCurveError {
    fn from(value: csv::Error) -> Self {
        LightCurveError::Csv(value)
    }
}

impl From<std::io::Error> for LightCurveError {
    fn from(value: std::io::Error) -> Self {
        LightCurveError::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightCurveMeta {
    pub label: String,
    pub mission: Mission,
    pub sector: Option<u32>,
    /// Julian date of `time == 0`.
    pub time_offset_jd: f64,
}

impl LightCurveMeta {
    pub fn new(label: impl Into<String>, mission: Mission) -> Self {
        LightCurveMeta {
            label: label.into(),
            mission,
            sector: None,
            time_offset_jd: mission.params().time_offset_jd,
        }
    }
}

/// Flux time series with per-cadence uncertainty and quality flags.
///
/// Times are in the mission's barycentric day system and strictly increasing.
#[derive(Debug, Clone)]
pub struct LightCurve {
    pub time: Array1<f64>,
    pub flux: Array1<f64>,
    pub flux_err: Array1<f64>,
    pub quality: Array1<u32>,
    pub meta: LightCurveMeta,
}

#[derive(Serialize)]
struct CsvRecord {
    time: f64,
    flux: f64,
    flux_err: f64,
    quality: u32,
}

impl LightCurve {
    pub fn new(
        time: Array1<f64>,
        flux: Array1<f64>,
        flux_err: Array1<f64>,
        quality: Array1<u32>,
        meta: LightCurveMeta,
    ) -> Result<Self, LightCurveError> {
        let expected = time.len();
        for (column, actual) in [
            ("flux", flux.len()),
            ("flux_err", flux_err.len()),
            ("quality", quality.len()),
        ] {
            if actual != expected {
                return Err(LightCurveError::LengthMismatch {
                    column,
                    expected,
                    actual,
                });
            }
        }
        if let Some(index) = time
            .windows(2)
            .into_iter()
            .position(|w| !(w[1] > w[0]))
        {
            return Err(LightCurveError::NotIncreasing(index + 1));
        }

        Ok(LightCurve {
            time,
            flux,
            flux_err,
            quality,
            meta,
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Keeps the cadences where `mask` is `true`.
    pub fn select(&self, mask: ArrayView1<bool>) -> Result<LightCurve, LightCurveError> {
        if mask.len() != self.len() {
            return Err(LightCurveError::LengthMismatch {
                column: "mask",
                expected: self.len(),
                actual: mask.len(),
            });
        }
        Ok(LightCurve {
            time: select(self.time.view(), mask),
            flux: select(self.flux.view(), mask),
            flux_err: select(self.flux_err.view(), mask),
            quality: select(self.quality.view(), mask),
            meta: self.meta.clone(),
        })
    }

    /// Drops cadences whose flux or uncertainty is not finite.
    pub fn remove_nans(&self) -> LightCurve {
        let mask = Zip::from(&self.flux)
            .and(&self.flux_err)
            .map_collect(|f, e| f.is_finite() && e.is_finite());
        LightCurve {
            time: select(self.time.view(), mask.view()),
            flux: select(self.flux.view(), mask.view()),
            flux_err: select(self.flux_err.view(), mask.view()),
            quality: select(self.quality.view(), mask.view()),
            meta: self.meta.clone(),
        }
    }

    pub fn median_flux(&self) -> Option<f64> {
        median(self.flux.view())
    }

    /// Divides flux and uncertainty by the median flux.
    pub fn normalize(&self) -> Result<LightCurve, LightCurveError> {
        let median = self.median_flux().ok_or(LightCurveError::Empty)?;
        if !(median > 0.0) {
            return Err(LightCurveError::NonPositiveMedian(median));
        }
        Ok(LightCurve {
            time: self.time.clone(),
            flux: &self.flux / median,
            flux_err: &self.flux_err / median,
            quality: self.quality.clone(),
            meta: self.meta.clone(),
        })
    }

    /// Subtracts `model` and adds `offset`.
    ///
    /// The model is a fit to this curve, so its uncertainty is not added to
    /// `flux_err`, which is carried over unchanged.
    pub fn subtract_model(
        &self,
        model: ArrayView1<f64>,
        offset: f64,
    ) -> Result<LightCurve, LightCurveError> {
        if model.len() != self.len() {
            return Err(LightCurveError::LengthMismatch {
                column: "model",
                expected: self.len(),
                actual: model.len(),
            });
        }
        Ok(LightCurve {
            time: self.time.clone(),
            flux: &self.flux - &model + offset,
            flux_err: self.flux_err.clone(),
            quality: self.quality.clone(),
            meta: self.meta.clone(),
        })
    }

    /// Julian date of the first cadence.
    pub fn start_jd(&self) -> Option<f64> {
        self.time.first().map(|t| t + self.meta.time_offset_jd)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), LightCurveError> {
        let mut writer = csv::Writer::from_writer(writer);
        for i in 0..self.len() {
            writer.serialize(CsvRecord {
                time: self.time[i],
                flux: self.flux[i],
                flux_err: self.flux_err[i],
                quality: self.quality[i],
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv(&self, path: impl AsRef<Path>) -> Result<(), LightCurveError> {
        let file = File::create(path)?;
        self.write_csv(file)
    }
}

fn select<T: Clone>(data: ArrayView1<T>, mask: ArrayView1<bool>) -> Array1<T> {
    data.iter()
        .zip(mask.iter())
        .filter(|(_, keep)| **keep)
        .map(|(x, _)| x.clone())
        .collect()
}

/// Light curves of one target, in acquisition order.
#[derive(Debug, Clone, Default)]
pub struct LightCurveCollection {
    curves: Vec<LightCurve>,
}

impl LightCurveCollection {
    pub fn new(curves: Vec<LightCurve>) -> Self {
        LightCurveCollection { curves }
    }

    pub fn push(&mut self, curve: LightCurve) {
        self.curves.push(curve);
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LightCurve> {
        self.curves.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LightCurve> {
        self.curves.iter()
    }
}

impl<'a> IntoIterator for &'a LightCurveCollection {
    type Item = &'a LightCurve;
    type IntoIter = std::slice::Iter<'a, LightCurve>;

    fn into_iter(self) -> Self::IntoIter {
        self.curves.iter()
    }
}

impl IntoIterator for LightCurveCollection {
    type Item = LightCurve;
    type IntoIter = std::vec::IntoIter<LightCurve>;

    fn into_iter(self) -> Self::IntoIter {
        self.curves.into_iter()
    }
}

impl FromIterator<LightCurve> for LightCurveCollection {
    fn from_iter<I: IntoIterator<Item = LightCurve>>(iter: I) -> Self {
        LightCurveCollection {
            curves: iter.into_iter().collect(),
        }
    }
}
