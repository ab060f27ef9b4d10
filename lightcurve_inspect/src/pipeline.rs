use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analysis::{amplitude_spectrum, AmplitudeSpectrum, SpectrumError};
use crate::catalog::{cross_match, CatalogService, CrossMatch};
use crate::config::Config;
use crate::correct::{correct_cutout, Correction, CorrectionError};
use crate::cutout::{Cutout, CutoutError, CutoutSource};
use crate::lightcurve::LightCurveCollection;
use crate::plot;

#[derive(Debug)]
pub enum PipelineError {
    Cutout(CutoutError),
    Correction { label: String, error: CorrectionError },
    Spectrum(SpectrumError),
    Plot(String),
    Io(std::io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Cutout(e) => write!(f, "Unable to acquire cutouts: {}", e),
            PipelineError::Correction { label, error } => {
                write!(f, "Unable to correct {}: {}", label, error)
            }
            PipelineError::Spectrum(e) => write!(f, "Unable to compute spectrum: {}", e),
            PipelineError::Plot(e) => write!(f, "Unable to render diagnostics: {}", e),
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<CutoutError> for PipelineError {
    fn from(value: CutoutError) -> Self {
        PipelineError::Cutout(value)
    }
}

impl From<SpectrumError> for PipelineError {
    fn from(value: SpectrumError) -> Self {
        PipelineError::Spectrum(value)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::Io(value)
    }
}

/// Downloads every cutout of a target and removes scattered light from each.
pub struct Pipeline<S: CutoutSource, K: CatalogService> {
    target: String,
    source: S,
    catalog: K,
    config: Config,
    cutouts: Vec<S::Output>,
    corrected: Option<LightCurveCollection>,
}

impl<S: CutoutSource, K: CatalogService> Pipeline<S, K> {
    pub fn new(target: impl Into<String>, source: S, catalog: K, config: Config) -> Self {
        Pipeline {
            target: target.into(),
            source,
            catalog,
            config,
            cutouts: Vec::new(),
            corrected: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cutouts from the last call to [`Pipeline::correct`].
    pub fn cutouts(&self) -> &[S::Output] {
        &self.cutouts
    }

    pub fn corrected(&self) -> Option<&LightCurveCollection> {
        self.corrected.as_ref()
    }

    /// Corrects every cutout of the target, in acquisition order.
    ///
    /// When a diagnostics directory is configured one figure per cutout is
    /// written there.
    #[tracing::instrument(skip(self), fields(target = %self.target))]
    pub fn correct(&mut self) -> Result<&LightCurveCollection, PipelineError> {
        let size = self.config.tesscut.cutout_size;
        info!(size, "Downloading cutout");
        self.cutouts = self.source.download_all(&self.target, size)?;
        self.corrected = None;

        let mut collection = LightCurveCollection::default();
        for (index, cutout) in self.cutouts.iter().enumerate() {
            let correction = correct_cutout(cutout, &self.config.correction).map_err(|error| {
                PipelineError::Correction {
                    label: cutout.label().to_string(),
                    error,
                }
            })?;
            info!(
                label = cutout.label(),
                sector = cutout.sector(),
                cadences = correction.lightcurve.len(),
                aperture = correction.aperture.count(),
                "Corrected cutout"
            );

            if let Some(directory) = &self.config.diagnostics.directory {
                std::fs::create_dir_all(directory)?;
                let (spectrum, matched) = self.annotate(cutout, &correction)?;
                let path = figure_path(directory, cutout, index);
                plot::render(&path, cutout, &correction, &matched, &spectrum)
                    .map_err(|e| PipelineError::Plot(e.to_string()))?;
                info!(path = %path.display(), "Saved diagnostics");
            }

            collection.push(correction.lightcurve);
        }

        Ok(&*self.corrected.insert(collection))
    }

    /// Amplitude spectrum and catalog sources for a diagnostic figure.
    /// A failed cross-match is logged and drawn without sources.
    pub fn annotate(
        &self,
        cutout: &S::Output,
        correction: &Correction,
    ) -> Result<(AmplitudeSpectrum, CrossMatch), PipelineError> {
        let lc = &correction.lightcurve;
        let spectrum = amplitude_spectrum(lc.time.view(), lc.flux.view(), &self.config.spectrum)?;

        let matched = cross_match(cutout, &self.catalog, &self.config.catalog);
        match &matched {
            CrossMatch::Sources(sources) => info!(sources = sources.len(), "Cross-matched"),
            CrossMatch::Empty(reason) => info!(%reason, "No catalog sources"),
            CrossMatch::Failed(e) => warn!(error = %e, "Cross-match failed"),
        }
        Ok((spectrum, matched))
    }
}

fn figure_path<C: Cutout + ?Sized>(directory: &Path, cutout: &C, index: usize) -> PathBuf {
    let label: String = cutout
        .label()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let name = match cutout.sector() {
        Some(sector) => format!("{}_s{:04}.png", label, sector),
        None => format!("{}_{}.png", label, index),
    };
    directory.join(name)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use nalgebra::Matrix2;
    use ndarray::{Array1, Array3};
    use tracing_test::traced_test;

    use super::*;
    use crate::catalog::{CatalogError, CatalogRow, RegionQuery};
    use crate::correct::CorrectionParams;
    use crate::cutout::CutoutStack;
    use crate::mission::Mission;
    use crate::wcs::{SkyPosition, TanWcs};

    fn synthetic(sector: u32, frames: usize) -> CutoutStack {
        let flux = Array3::from_shape_fn((frames, 9, 9), |(t, r, c)| {
            let background = 50.0 + 0.1 * (r * c) as f64 + 20.0 * (t as f64 / 10.0).cos();
            let star = (3..=5).contains(&r) && (3..=5).contains(&c);
            background + if star { 2000.0 } else { 0.0 }
        });
        CutoutStack::new(
            Array1::from_shape_fn(frames, |i| 1500.0 + i as f64 / 48.0),
            flux.clone(),
            flux.mapv(f64::sqrt),
            Array1::zeros(frames),
            TanWcs::new([10.0, 20.0], [5.0, 5.0], Matrix2::new(-0.005, 0.0, 0.0, 0.005)).unwrap(),
            (100.0, 200.0),
            Mission::Tess,
            SkyPosition { ra: 10.0, dec: 20.0 },
            "TIC 1",
        )
        .unwrap()
        .with_sector(Some(sector))
    }

    struct Sectors(Vec<u32>);

    impl CutoutSource for Sectors {
        type Output = CutoutStack;

        fn download_all(&self, target: &str, _size: usize) -> Result<Vec<CutoutStack>, CutoutError> {
            if self.0.is_empty() {
                return Err(CutoutError::NoData(target.to_string()));
            }
            Ok(self.0.iter().map(|s| synthetic(*s, 60)).collect())
        }
    }

    #[derive(Default)]
    struct Unreachable {
        queries: Cell<usize>,
    }

    impl CatalogService for Unreachable {
        fn query_region(&self, _query: &RegionQuery) -> Result<Option<Vec<CatalogRow>>, CatalogError> {
            self.queries.set(self.queries.get() + 1);
            Err(CatalogError::Parse("connection refused".to_string()))
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.correction = CorrectionParams {
            threshold: 5.0,
            ..Default::default()
        };
        config
    }

    #[test]
    #[traced_test]
    fn test_correct_keeps_acquisition_order() {
        let mut pipeline = Pipeline::new("TIC 1", Sectors(vec![7, 3, 12]), Unreachable::default(), config());

        let corrected = pipeline.correct().unwrap();
        let sectors: Vec<Option<u32>> = corrected.iter().map(|lc| lc.meta.sector).collect();
        assert_eq!(sectors, vec![Some(7), Some(3), Some(12)]);

        assert_eq!(pipeline.cutouts().len(), 3);
        assert_eq!(pipeline.corrected().map(|c| c.len()), Some(3));
        // Without a diagnostics directory the catalog is never queried.
        assert_eq!(pipeline.catalog.queries.get(), 0);
        assert!(logs_contain("Downloading cutout"));
        assert!(logs_contain("Corrected cutout"));
    }

    #[test]
    fn test_download_failure_propagates() {
        let mut pipeline = Pipeline::new("nothing", Sectors(vec![]), Unreachable::default(), config());
        assert!(matches!(
            pipeline.correct(),
            Err(PipelineError::Cutout(CutoutError::NoData(_)))
        ));
        assert!(pipeline.corrected().is_none());
    }

    #[test]
    fn test_correction_failure_names_cutout() {
        let mut pipeline = Pipeline::new("TIC 1", Sectors(vec![1]), Unreachable::default(), config());
        pipeline.config.correction.threshold = 1e9;
        match pipeline.correct() {
            Err(PipelineError::Correction { label, error }) => {
                assert_eq!(label, "TIC 1");
                assert!(matches!(error, CorrectionError::EmptyAperture));
            }
            other => panic!("unexpected result {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    #[traced_test]
    fn test_failed_cross_match_is_logged() {
        let pipeline = Pipeline::new("TIC 1", Sectors(vec![4]), Unreachable::default(), config());
        let cutout = synthetic(4, 60);
        let correction = correct_cutout(&cutout, &pipeline.config.correction).unwrap();

        let (spectrum, matched) = pipeline.annotate(&cutout, &correction).unwrap();

        assert!(!spectrum.is_empty());
        assert!(matches!(matched, CrossMatch::Failed(CatalogError::Parse(_))));
        assert_eq!(pipeline.catalog.queries.get(), 1);
        assert!(logs_contain("Cross-match failed"));
    }

    #[test]
    fn test_figure_path() {
        let cutout = synthetic(9, 2);
        assert_eq!(
            figure_path(Path::new("plots"), &cutout, 0),
            PathBuf::from("plots/TIC_1_s0009.png")
        );
        let cutout = cutout.with_sector(None);
        assert_eq!(
            figure_path(Path::new("plots"), &cutout, 2),
            PathBuf::from("plots/TIC_1_2.png")
        );
    }
}
