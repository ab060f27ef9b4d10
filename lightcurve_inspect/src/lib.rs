pub mod analysis;
pub mod catalog;
pub mod config;
pub mod correct;
pub mod cutout;
pub mod lightcurve;
pub mod mission;
pub mod pipeline;
pub mod plot;
pub mod quality;
pub mod wcs;

pub use catalog::{cross_match, nearby_sources, CatalogService, CrossMatch, NearbySources};
pub use config::Config;
pub use correct::{correct_cutout, Correction, CorrectionError, CorrectionParams};
pub use cutout::{ApertureMask, Cutout, CutoutSource, CutoutStack, TessCut};
pub use lightcurve::{LightCurve, LightCurveCollection};
pub use mission::Mission;
pub use pipeline::{Pipeline, PipelineError};
