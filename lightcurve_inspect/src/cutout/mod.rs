pub mod tesscut;
pub use tesscut::TessCut;

use std::collections::VecDeque;
use std::fmt;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis};

use crate::analysis::{median, Statistics};
use crate::lightcurve::{LightCurve, LightCurveError, LightCurveMeta};
use crate::mission::Mission;
use crate::wcs::{SkyPosition, TanWcs, WcsError, WorldToPixel};

#[derive(Debug)]
pub enum CutoutError {
    Http(reqwest::Error),
    Status(reqwest::StatusCode),
    Archive(zip::result::ZipError),
    Fits(fitsio::errors::Error),
    Io(std::io::Error),
    Wcs(WcsError),
    LightCurve(LightCurveError),
    MissingColumn(String),
    Shape(String),
    NoData(String),
}

impl fmt::Display for CutoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CutoutError::Http(e) => write!(f, "HTTP error: {}", e),
            CutoutError::Status(status) => write!(f, "Cutout service returned {}", status),
            CutoutError::Archive(e) => write!(f, "Archive error: {}", e),
            CutoutError::Fits(e) => write!(f, "FITS error: {}", e),
            CutoutError::Io(e) => write!(f, "IO error: {}", e),
            CutoutError::Wcs(e) => write!(f, "WCS error: {}", e),
            CutoutError::LightCurve(e) => write!(f, "Light curve error: {}", e),
            CutoutError::MissingColumn(name) => write!(f, "Missing table column {}", name),
            CutoutError::Shape(msg) => write!(f, "Inconsistent cutout shape: {}", msg),
            CutoutError::NoData(target) => write!(f, "No cutouts available for {}", target),
        }
    }
}

impl std::error::Error for CutoutError {}

impl From<reqwest::Error> for CutoutError {
    fn from(value: reqwest::Error) -> Self {
        CutoutError::Http(value)
    }
}

impl From<zip::result::ZipError> for CutoutError {
    fn from(value: zip::result::ZipError) -> Self {
        CutoutError::Archive(value)
    }
}

impl From<fitsio::errors::Error> for CutoutError {
    fn from(value: fitsio::errors::Error) -> Self {
        CutoutError::Fits(value)
    }
}

impl From<std::io::Error> for CutoutError {
    fn from(value: std::io::Error) -> Self {
        CutoutError::Io(value)
    }
}

impl From<WcsError> for CutoutError {
    fn from(value: WcsError) -> Self {
        CutoutError::Wcs(value)
    }
}

impl From<LightCurveError> for CutoutError {
    fn from(value: LightCurveError) -> Self {
        CutoutError::LightCurve(value)
    }
}

/// A time series of pixel frames around one target.
///
/// Frame stacks are indexed `(cadence, row, column)`.
pub trait Cutout {
    fn flux(&self) -> ArrayView3<'_, f64>;
    fn flux_err(&self) -> ArrayView3<'_, f64>;
    /// Mission time of each frame, in days.
    fn time(&self) -> ArrayView1<'_, f64>;
    fn quality(&self) -> ArrayView1<'_, u32>;
    fn wcs(&self) -> &dyn WorldToPixel;
    /// Full-frame `(column, row)` of the cutout's first pixel.
    fn origin(&self) -> (f64, f64);
    fn mission(&self) -> Mission;
    fn target(&self) -> SkyPosition;
    fn label(&self) -> &str;
    fn sector(&self) -> Option<u32>;

    /// Julian date of `time == 0`.
    fn time_offset_jd(&self) -> f64 {
        self.mission().params().time_offset_jd
    }

    /// `(rows, columns)` of one frame.
    fn shape(&self) -> (usize, usize) {
        let (_, rows, columns) = self.flux().dim();
        (rows, columns)
    }

    fn len(&self) -> usize {
        self.time().len()
    }

    fn is_empty(&self) -> bool {
        self.time().is_empty()
    }

    /// Julian date of the first frame.
    fn start_jd(&self) -> Option<f64> {
        self.time().first().map(|t| t + self.time_offset_jd())
    }

    /// Per-pixel median over time, ignoring non-finite samples.
    fn median_image(&self) -> Array2<f64> {
        let flux = self.flux();
        let (_, rows, columns) = flux.dim();
        Array2::from_shape_fn((rows, columns), |(r, c)| {
            median(flux.slice(ndarray::s![.., r, c])).unwrap_or(f64::NAN)
        })
    }
}

/// In-memory cutout.
#[derive(Debug, Clone)]
pub struct CutoutStack {
    pub time: Array1<f64>,
    pub flux: Array3<f64>,
    pub flux_err: Array3<f64>,
    pub quality: Array1<u32>,
    pub wcs: TanWcs,
    pub origin: (f64, f64),
    pub mission: Mission,
    pub target: SkyPosition,
    pub label: String,
    pub sector: Option<u32>,
    pub time_offset_jd: f64,
}

impl CutoutStack {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        time: Array1<f64>,
        flux: Array3<f64>,
        flux_err: Array3<f64>,
        quality: Array1<u32>,
        wcs: TanWcs,
        origin: (f64, f64),
        mission: Mission,
        target: SkyPosition,
        label: impl Into<String>,
    ) -> Result<Self, CutoutError> {
        if flux.dim() != flux_err.dim() {
            return Err(CutoutError::Shape(format!(
                "flux is {:?} but flux_err is {:?}",
                flux.dim(),
                flux_err.dim()
            )));
        }
        let frames = flux.len_of(Axis(0));
        if time.len() != frames || quality.len() != frames {
            return Err(CutoutError::Shape(format!(
                "{} frames, {} times and {} quality flags",
                frames,
                time.len(),
                quality.len()
            )));
        }

        Ok(CutoutStack {
            time,
            flux,
            flux_err,
            quality,
            wcs,
            origin,
            mission,
            target,
            label: label.into(),
            sector: None,
            time_offset_jd: mission.params().time_offset_jd,
        })
    }

    pub fn with_sector(mut self, sector: Option<u32>) -> Self {
        self.sector = sector;
        self
    }

    pub fn with_time_offset_jd(mut self, time_offset_jd: f64) -> Self {
        self.time_offset_jd = time_offset_jd;
        self
    }

    /// Keeps the frames where `mask` is `true`.
    pub fn select_frames(&self, mask: ArrayView1<bool>) -> CutoutStack {
        let frames: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, keep)| **keep)
            .map(|(i, _)| i)
            .collect();
        CutoutStack {
            time: self.time.select(Axis(0), &frames),
            flux: self.flux.select(Axis(0), &frames),
            flux_err: self.flux_err.select(Axis(0), &frames),
            quality: self.quality.select(Axis(0), &frames),
            wcs: self.wcs.clone(),
            origin: self.origin,
            mission: self.mission,
            target: self.target,
            label: self.label.clone(),
            sector: self.sector,
            time_offset_jd: self.time_offset_jd,
        }
    }
}

impl Cutout for CutoutStack {
    fn flux(&self) -> ArrayView3<'_, f64> {
        self.flux.view()
    }

    fn flux_err(&self) -> ArrayView3<'_, f64> {
        self.flux_err.view()
    }

    fn time(&self) -> ArrayView1<'_, f64> {
        self.time.view()
    }

    fn quality(&self) -> ArrayView1<'_, u32> {
        self.quality.view()
    }

    fn wcs(&self) -> &dyn WorldToPixel {
        &self.wcs
    }

    fn origin(&self) -> (f64, f64) {
        self.origin
    }

    fn mission(&self) -> Mission {
        self.mission
    }

    fn target(&self) -> SkyPosition {
        self.target
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn sector(&self) -> Option<u32> {
        self.sector
    }

    fn time_offset_jd(&self) -> f64 {
        self.time_offset_jd
    }
}

/// Provider of cutouts for a named target.
pub trait CutoutSource {
    type Output: Cutout;

    /// Every available cutout of `size × size` pixels, in acquisition order.
    fn download_all(&self, target: &str, size: usize) -> Result<Vec<Self::Output>, CutoutError>;
}

/// Pixels summed into a target's flux.
#[derive(Debug, Clone, PartialEq)]
pub struct ApertureMask {
    pub mask: Array2<bool>,
}

// Scales a median absolute deviation to a Gaussian standard deviation.
const MAD_TO_STD: f64 = 1.4826;

impl ApertureMask {
    pub fn new(mask: Array2<bool>) -> Self {
        ApertureMask { mask }
    }

    /// Pixels at least `threshold` robust standard deviations above the
    /// median of the median image, restricted to the 4-connected region
    /// closest to the cutout center.
    pub fn threshold_mask<C: Cutout + ?Sized>(cutout: &C, threshold: f64) -> ApertureMask {
        ApertureMask::from_image(&cutout.median_image(), threshold)
    }

    pub fn from_image(image: &Array2<f64>, threshold: f64) -> ApertureMask {
        let stats = match Statistics::new(&image.view().into_dyn()) {
            Some(stats) => stats,
            None => return ApertureMask::new(Array2::from_elem(image.dim(), false)),
        };
        let limit = threshold * MAD_TO_STD * stats.mad + stats.median;
        let above = image.mapv(|v| v >= limit);
        ApertureMask::new(closest_region(&above))
    }

    pub fn count(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contains(&self, row: usize, column: usize) -> bool {
        self.mask.get((row, column)).copied().unwrap_or(false)
    }

    /// Simple aperture photometry through this mask.
    ///
    /// Flux is the sum of the finite pixel values; uncertainty adds the
    /// finite pixel uncertainties in quadrature.
    pub fn to_lightcurve<C: Cutout + ?Sized>(&self, cutout: &C) -> Result<LightCurve, CutoutError> {
        let (rows, columns) = cutout.shape();
        if self.mask.dim() != (rows, columns) {
            return Err(CutoutError::Shape(format!(
                "aperture is {:?} but frames are {:?}",
                self.mask.dim(),
                (rows, columns)
            )));
        }

        let pixels: Vec<(usize, usize)> = self
            .mask
            .indexed_iter()
            .filter(|(_, m)| **m)
            .map(|(index, _)| index)
            .collect();

        let flux = cutout.flux();
        let flux_err = cutout.flux_err();
        let nframes = cutout.len();
        let mut sum = Array1::zeros(nframes);
        let mut err = Array1::zeros(nframes);
        for frame in 0..nframes {
            let mut total = 0.0;
            let mut variance = 0.0;
            for (r, c) in pixels.iter() {
                let value = flux[[frame, *r, *c]];
                if value.is_finite() {
                    total += value;
                }
                let sigma = flux_err[[frame, *r, *c]];
                if sigma.is_finite() {
                    variance += sigma * sigma;
                }
            }
            sum[frame] = total;
            err[frame] = variance.sqrt();
        }

        let mut meta = LightCurveMeta::new(cutout.label(), cutout.mission());
        meta.sector = cutout.sector();
        meta.time_offset_jd = cutout.time_offset_jd();
        Ok(LightCurve::new(
            cutout.time().to_owned(),
            sum,
            err,
            cutout.quality().to_owned(),
            meta,
        )?)
    }
}

/// The 4-connected component of `mask` holding the set pixel nearest to the
/// frame center `(rows / 2, columns / 2)`, measured in fractional pixels.
fn closest_region(mask: &Array2<bool>) -> Array2<bool> {
    let (rows, columns) = mask.dim();
    let (center_row, center_column) = (rows as f64 / 2.0, columns as f64 / 2.0);

    let seed = mask
        .indexed_iter()
        .filter(|(_, m)| **m)
        .map(|((r, c), _)| {
            let distance = (r as f64 - center_row).hypot(c as f64 - center_column);
            ((r, c), distance)
        })
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index);

    let mut region = Array2::from_elem((rows, columns), false);
    let Some(seed) = seed else {
        return region;
    };

    let mut queue = VecDeque::from([seed]);
    region[seed] = true;
    while let Some((r, c)) = queue.pop_front() {
        let neighbours = [
            (r.wrapping_sub(1), c),
            (r + 1, c),
            (r, c.wrapping_sub(1)),
            (r, c + 1),
        ];
        for next in neighbours {
            if next.0 < rows && next.1 < columns && mask[next] && !region[next] {
                region[next] = true;
                queue.push_back(next);
            }
        }
    }
    region
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Matrix2;
    use ndarray::{array, Array3};

    use super::*;

    fn stack(flux: Array3<f64>) -> CutoutStack {
        let frames = flux.len_of(Axis(0));
        let flux_err = flux.mapv(|v: f64| v.abs().sqrt());
        CutoutStack::new(
            Array1::from_shape_fn(frames, |i| 1500.0 + i as f64 * 0.02),
            flux,
            flux_err,
            Array1::zeros(frames),
            TanWcs::new([10.0, 20.0], [3.0, 3.0], Matrix2::new(-0.005, 0.0, 0.0, 0.005)).unwrap(),
            (100.0, 200.0),
            Mission::Tess,
            SkyPosition { ra: 10.0, dec: 20.0 },
            "test",
        )
        .unwrap()
    }

    #[test]
    fn test_closest_region() {
        let mask = array![
            [true, false, false, false, false],
            [false, false, false, false, false],
            [false, false, true, true, false],
            [false, false, false, true, false],
            [false, false, false, false, true],
        ];
        let region = closest_region(&mask);
        assert_eq!(
            region,
            array![
                [false, false, false, false, false],
                [false, false, false, false, false],
                [false, false, true, true, false],
                [false, false, false, true, false],
                [false, false, false, false, false],
            ]
        );
        assert!(!closest_region(&Array2::from_elem((3, 3), false))
            .iter()
            .any(|m| *m));
    }

    #[test]
    fn test_closest_region_uses_fractional_center() {
        // The center of a 5×5 frame is (2.5, 2.5): (3, 4) is nearer than (1, 1).
        let mask = array![
            [false, false, false, false, false],
            [false, true, false, false, false],
            [false, false, false, false, false],
            [false, false, false, false, true],
            [false, false, false, false, false],
        ];
        let region = closest_region(&mask);
        assert!(region[[3, 4]]);
        assert!(!region[[1, 1]]);
    }

    #[test]
    fn test_threshold_mask_picks_central_star() {
        let flux = Array3::from_shape_fn((4, 7, 7), |(_, r, c)| {
            let background = 10.0 + 0.1 * (r + c) as f64;
            let central = (2..=4).contains(&r) && (2..=4).contains(&c);
            let corner = r == 0 && c == 0;
            background + if central || corner { 1000.0 } else { 0.0 }
        });
        let cutout = stack(flux);

        let aperture = ApertureMask::threshold_mask(&cutout, 3.0);

        assert_eq!(aperture.count(), 9);
        assert!(aperture.contains(3, 3));
        assert!(!aperture.contains(0, 0));
    }

    #[test]
    fn test_to_lightcurve_sums_finite_pixels() {
        let mut flux = Array3::from_elem((3, 2, 2), 4.0);
        flux[[1, 0, 0]] = f64::NAN;
        let cutout = stack(flux);
        let aperture = ApertureMask::new(array![[true, true], [false, true]]);

        let lc = aperture.to_lightcurve(&cutout).unwrap();

        assert_eq!(lc.flux, array![12.0, 8.0, 12.0]);
        assert_relative_eq!(lc.flux_err[0], 12.0_f64.sqrt());
        assert_relative_eq!(lc.flux_err[1], 8.0_f64.sqrt());
        assert_eq!(lc.meta.label, "test");
    }

    #[test]
    fn test_shape_validation() {
        let flux = Array3::zeros((2, 3, 3));
        let result = CutoutStack::new(
            array![1.0],
            flux.clone(),
            flux,
            array![0],
            TanWcs::new([0.0, 0.0], [1.0, 1.0], Matrix2::identity()).unwrap(),
            (0.0, 0.0),
            Mission::Tess,
            SkyPosition { ra: 0.0, dec: 0.0 },
            "bad",
        );
        assert!(matches!(result, Err(CutoutError::Shape(_))));

        let cutout = stack(Array3::zeros((2, 3, 3)));
        let aperture = ApertureMask::new(Array2::from_elem((2, 2), true));
        assert!(matches!(
            aperture.to_lightcurve(&cutout),
            Err(CutoutError::Shape(_))
        ));
    }

    #[test]
    fn test_select_frames_and_start_jd() {
        let cutout = stack(Array3::zeros((3, 2, 2)));
        let selected = cutout.select_frames(array![false, true, true].view());
        assert_eq!(selected.len(), 2);
        assert_relative_eq!(selected.start_jd().unwrap(), 2457000.0 + 1500.02, epsilon = 1e-9);
    }
}
