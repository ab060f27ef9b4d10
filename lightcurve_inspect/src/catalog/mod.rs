pub mod vizier;
pub use vizier::VizierCatalog;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cutout::Cutout;
use crate::wcs::{SkyPosition, WcsError};

const DAYS_PER_JULIAN_YEAR: f64 = 365.25;
const MAS_PER_DEGREE: f64 = 3.6e6;

#[derive(Debug)]
pub enum CatalogError {
    Http(reqwest::Error),
    Status(reqwest::StatusCode),
    Csv(csv::Error),
    Parse(String),
    Wcs(WcsError),
    /// The cutout has no frames to date the query.
    EmptyCutout,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Http(e) => write!(f, "HTTP error: {}", e),
            CatalogError::Status(status) => write!(f, "Catalog service returned {}", status),
            CatalogError::Csv(e) => write!(f, "Malformed catalog table: {}", e),
            CatalogError::Parse(msg) => write!(f, "Malformed catalog table: {}", msg),
            CatalogError::Wcs(e) => write!(f, "WCS error: {}", e),
            CatalogError::EmptyCutout => write!(f, "Cutout has no frames"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<reqwest::Error> for CatalogError {
    fn from(value: reqwest::Error) -> Self {
        CatalogError::Http(value)
    }
}

impl From<csv::Error> for CatalogError {
    fn from(value: csv::Error) -> Self {
        CatalogError::Csv(value)
    }
}

impl From<WcsError> for CatalogError {
    fn from(value: WcsError) -> Self {
        CatalogError::Wcs(value)
    }
}

/// Why a region yielded nothing to plot.
#[derive(Debug, Clone, PartialEq)]
pub enum NoSources {
    NoResult,
    NoneBrighterThan(f64),
}

impl fmt::Display for NoSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoSources::NoResult => write!(
                f,
                "Either no sources were found in the query region or Vizier is unavailable"
            ),
            NoSources::NoneBrighterThan(limit) => {
                write!(f, "No sources found brighter than {:.1}", limit)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowLimit {
    #[default]
    Unlimited,
    Limit(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionQuery {
    pub center: SkyPosition,
    pub radius_arcsec: f64,
    pub catalog: String,
    pub row_limit: RowLimit,
}

/// One catalog row as served, before any derived quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub source: String,
    pub ra: f64,
    pub dec: f64,
    /// Parallax in mas.
    pub plx: Option<f64>,
    /// Proper motion in mas/yr.
    pub pm_ra: Option<f64>,
    pub pm_dec: Option<f64>,
    pub gmag: Option<f64>,
}

/// Cone search against a remote catalog.
pub trait CatalogService {
    /// `Ok(None)` when the service returned no table for the region.
    fn query_region(&self, query: &RegionQuery) -> Result<Option<Vec<CatalogRow>>, CatalogError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    pub catalog: String,
    /// Sources must be strictly brighter than this magnitude.
    pub magnitude_limit: f64,
    /// Julian date of the catalog positions.
    pub reference_epoch_jd: f64,
    pub row_limit: RowLimit,
    pub timeout_secs: Option<u64>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            base_url: String::from("https://vizier.cds.unistra.fr/viz-bin/asu-tsv"),
            catalog: String::from("I/345/gaia2"),
            magnitude_limit: 20.0,
            reference_epoch_jd: 2457206.375,
            row_limit: RowLimit::Unlimited,
            timeout_secs: None,
        }
    }
}

/// A catalog source placed on the cutout.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub source: String,
    /// Position at the cutout epoch, in degrees.
    pub ra: f64,
    pub dec: f64,
    pub pm_ra: Option<f64>,
    pub pm_dec: Option<f64>,
    pub gmag: f64,
    pub plx: Option<f64>,
    /// Rough distance in parsecs.
    pub one_over_plx: Option<f64>,
    /// Full-frame pixel position.
    pub x: f64,
    pub y: f64,
    /// Marker size for plotting.
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NearbySources {
    Empty(NoSources),
    Found(Vec<SourceRecord>),
}

impl NearbySources {
    pub fn x(&self) -> Option<Vec<f64>> {
        self.column(|s| s.x)
    }

    pub fn y(&self) -> Option<Vec<f64>> {
        self.column(|s| s.y)
    }

    pub fn size(&self) -> Option<Vec<f64>> {
        self.column(|s| s.size)
    }

    fn column(&self, field: impl Fn(&SourceRecord) -> f64) -> Option<Vec<f64>> {
        match self {
            NearbySources::Empty(_) => None,
            NearbySources::Found(sources) => Some(sources.iter().map(field).collect()),
        }
    }
}

/// Outcome of a cross-match done for diagnostics only.
#[derive(Debug)]
pub enum CrossMatch {
    Sources(Vec<SourceRecord>),
    Empty(NoSources),
    Failed(CatalogError),
}

/// Adds `years` of proper motion (mas/yr) to a position in degrees.
/// Missing components count as zero.
pub fn propagate_proper_motion(
    ra: f64,
    dec: f64,
    pm_ra: Option<f64>,
    pm_dec: Option<f64>,
    years: f64,
) -> (f64, f64) {
    let shift = |pm: Option<f64>| {
        let pm = pm.filter(|v| v.is_finite()).unwrap_or(0.0);
        pm * years / MAS_PER_DEGREE
    };
    (ra + shift(pm_ra), dec + shift(pm_dec))
}

/// Marker size that shrinks by half every five magnitudes.
pub fn marker_size(gmag: f64) -> f64 {
    64.0 / 2f64.powf(gmag / 5.0)
}

/// Catalog sources around a cutout, brighter than the configured limit, at
/// the epoch of the cutout's first frame.
///
/// The query radius is the larger frame dimension in arcseconds, which
/// covers twice the area needed to reach the corners.
#[tracing::instrument(skip_all, fields(label = cutout.label()))]
pub fn nearby_sources<C, S>(
    cutout: &C,
    service: &S,
    config: &CatalogConfig,
) -> Result<NearbySources, CatalogError>
where
    C: Cutout + ?Sized,
    S: CatalogService + ?Sized,
{
    let start_jd = cutout.start_jd().ok_or(CatalogError::EmptyCutout)?;
    let (rows, columns) = cutout.shape();
    let query = RegionQuery {
        center: cutout.target(),
        radius_arcsec: rows.max(columns) as f64 * cutout.mission().params().pixel_scale,
        catalog: config.catalog.clone(),
        row_limit: config.row_limit,
    };

    let rows = match service.query_region(&query)? {
        Some(rows) if !rows.is_empty() => rows,
        _ => return Ok(NearbySources::Empty(NoSources::NoResult)),
    };
    let returned = rows.len();
    let bright: Vec<CatalogRow> = rows
        .into_iter()
        .filter(|row| row.gmag.is_some_and(|g| g < config.magnitude_limit))
        .collect();
    debug!(returned, bright = bright.len(), "Catalog query");
    if bright.is_empty() {
        return Ok(NearbySources::Empty(NoSources::NoneBrighterThan(
            config.magnitude_limit,
        )));
    }

    let years = (start_jd - config.reference_epoch_jd) / DAYS_PER_JULIAN_YEAR;
    let (column_origin, row_origin) = cutout.origin();
    let wcs = cutout.wcs();

    let mut sources = Vec::with_capacity(bright.len());
    for row in bright {
        let gmag = row.gmag.unwrap_or(f64::NAN);
        let (ra, dec) = propagate_proper_motion(row.ra, row.dec, row.pm_ra, row.pm_dec, years);
        let (x, y) = wcs.world_to_pixel(ra, dec)?;
        sources.push(SourceRecord {
            source: row.source,
            ra,
            dec,
            pm_ra: row.pm_ra,
            pm_dec: row.pm_dec,
            gmag,
            plx: row.plx,
            one_over_plx: row.plx.map(|plx| 1.0 / (plx / 1000.0)),
            x: x + column_origin,
            y: y + row_origin,
            size: marker_size(gmag),
        });
    }
    Ok(NearbySources::Found(sources))
}

/// Like [`nearby_sources`], folding every failure into the result.
pub fn cross_match<C, S>(cutout: &C, service: &S, config: &CatalogConfig) -> CrossMatch
where
    C: Cutout + ?Sized,
    S: CatalogService + ?Sized,
{
    match nearby_sources(cutout, service, config) {
        Ok(NearbySources::Found(sources)) => CrossMatch::Sources(sources),
        Ok(NearbySources::Empty(reason)) => CrossMatch::Empty(reason),
        Err(e) => CrossMatch::Failed(e),
    }
}
