use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::FitsFile;
use nalgebra::Matrix2;
use ndarray::{Array1, Array3};
use tracing::{debug, info, warn};

use super::{Cutout, CutoutError, CutoutSource, CutoutStack};
use crate::config::TessCutConfig;
use crate::mission::Mission;
use crate::quality::QualityBitmask;
use crate::wcs::{SkyPosition, TanWcs, WcsError};

/// Full-frame-image cutouts from the MAST TESScut service.
pub struct TessCut {
    client: reqwest::blocking::Client,
    base_url: String,
    cache_dir: PathBuf,
    bitmask: QualityBitmask,
}

impl TessCut {
    pub fn new(config: &TessCutConfig) -> Result<Self, CutoutError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        Ok(TessCut {
            client: builder.build()?,
            base_url: config.base_url.clone(),
            cache_dir: config.cache_dir.clone().unwrap_or_else(default_cache_dir),
            bitmask: config.bitmask,
        })
    }

    fn query(target: &str, size: usize) -> Vec<(&'static str, String)> {
        let mut query = match parse_coordinates(target) {
            Some(position) => vec![
                ("ra", position.ra.to_string()),
                ("dec", position.dec.to_string()),
            ],
            None => vec![("objectname", target.to_string())],
        };
        query.push(("x", size.to_string()));
        query.push(("y", size.to_string()));
        query.push(("units", "px".to_string()));
        query
    }

    /// Reads one TESScut target pixel file, dropping cadences with
    /// non-finite time or quality flags in `bitmask`.
    pub fn read_fits(path: &Path, bitmask: QualityBitmask) -> Result<CutoutStack, CutoutError> {
        let mut fptr = FitsFile::open(path)?;

        let primary = fptr.primary_hdu()?;
        let target = SkyPosition {
            ra: primary.read_key::<f64>(&mut fptr, "RA_OBJ")?,
            dec: primary.read_key::<f64>(&mut fptr, "DEC_OBJ")?,
        };
        let sector = primary
            .read_key::<i64>(&mut fptr, "SECTOR")
            .ok()
            .and_then(|s| u32::try_from(s).ok());
        let label = primary
            .read_key::<String>(&mut fptr, "OBJECT")
            .or_else(|_| primary.read_key::<String>(&mut fptr, "TICID"))
            .unwrap_or_else(|_| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        let aperture = fptr.hdu(2)?;
        let (rows, columns) = match &aperture.info {
            HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
            _ => {
                return Err(CutoutError::Shape(
                    "aperture extension is not a 2D image".to_string(),
                ))
            }
        };
        let wcs = read_wcs(&mut fptr, &aperture)?;

        let table = fptr.hdu(1)?;
        let time: Vec<f64> = table.read_col(&mut fptr, "TIME")?;
        let quality: Vec<i32> = table.read_col(&mut fptr, "QUALITY")?;
        let flux = read_frames(&mut fptr, 1, "FLUX", time.len(), rows, columns)?;
        let flux_err = read_frames(&mut fptr, 1, "FLUX_ERR", time.len(), rows, columns)?;
        let origin = (
            read_any_key(&mut fptr, &table, &["1CRV5P", "1CRV4P"]).unwrap_or(0.0),
            read_any_key(&mut fptr, &table, &["2CRV5P", "2CRV4P"]).unwrap_or(0.0),
        );
        let time_offset_jd = match (
            table.read_key::<f64>(&mut fptr, "BJDREFI"),
            table.read_key::<f64>(&mut fptr, "BJDREFF"),
        ) {
            (Ok(integer), Ok(fraction)) => integer + fraction,
            _ => Mission::Tess.params().time_offset_jd,
        };

        let time = Array1::from(time);
        let quality: Array1<u32> = quality.into_iter().map(|q| q as u32).collect();
        let stack = CutoutStack::new(
            time,
            flux,
            flux_err,
            quality,
            wcs,
            origin,
            Mission::Tess,
            target,
            label,
        )?
        .with_sector(sector)
        .with_time_offset_jd(time_offset_jd);

        let good_quality = Mission::Tess.quality_mask(stack.quality.view(), bitmask);
        let keep = ndarray::Zip::from(&stack.time)
            .and(&good_quality)
            .map_collect(|t, q| t.is_finite() && *q);
        let kept = stack.select_frames(keep.view());
        debug!(
            path = %path.display(),
            frames = stack.len(),
            kept = kept.len(),
            "Read cutout"
        );
        Ok(kept)
    }
}

impl CutoutSource for TessCut {
    type Output = CutoutStack;

    #[tracing::instrument(skip(self))]
    fn download_all(&self, target: &str, size: usize) -> Result<Vec<CutoutStack>, CutoutError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&TessCut::query(target, size))
            .send()?;
        if !response.status().is_success() {
            return Err(CutoutError::Status(response.status()));
        }
        let bytes = response.bytes()?;
        info!(bytes = bytes.len(), "Downloaded cutout archive");

        let dir = self.cache_dir.join(format!("{}_{}px", sanitize(target), size));
        fs::create_dir_all(&dir)?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        archive.extract(&dir)?;

        let mut paths: Vec<PathBuf> = archive
            .file_names()
            .filter(|name| name.to_ascii_lowercase().ends_with(".fits"))
            .map(|name| dir.join(name))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(CutoutError::NoData(target.to_string()));
        }

        let mut cutouts = Vec::with_capacity(paths.len());
        for path in paths.iter() {
            let cutout = TessCut::read_fits(path, self.bitmask)?;
            if cutout.is_empty() {
                warn!(path = %path.display(), "Cutout has no usable cadences");
                continue;
            }
            cutouts.push(cutout);
        }
        if cutouts.is_empty() {
            return Err(CutoutError::NoData(target.to_string()));
        }
        Ok(cutouts)
    }
}

pub fn default_cache_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cache").join("lightcurve_inspect")
}

/// `"ra dec"` in decimal degrees.
fn parse_coordinates(target: &str) -> Option<SkyPosition> {
    let mut parts = target.split(|c: char| c.is_whitespace() || c == ',').filter(|p| !p.is_empty());
    let ra = parts.next()?.parse::<f64>().ok()?;
    let dec = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || !(-90.0..=90.0).contains(&dec) {
        return None;
    }
    Some(SkyPosition { ra, dec })
}

fn sanitize(target: &str) -> String {
    target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn read_any_key(fptr: &mut FitsFile, hdu: &FitsHdu, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| hdu.read_key::<f64>(fptr, key).ok())
}

fn read_wcs(fptr: &mut FitsFile, hdu: &FitsHdu) -> Result<TanWcs, CutoutError> {
    let mut key = |name: &str| {
        hdu.read_key::<f64>(fptr, name)
            .map_err(|_| WcsError::MissingKey(name.to_string()))
    };
    let crval = [key("CRVAL1")?, key("CRVAL2")?];
    let crpix = [key("CRPIX1")?, key("CRPIX2")?];

    let wcs = match key("CD1_1") {
        Ok(cd11) => TanWcs::new(
            crval,
            crpix,
            Matrix2::new(
                cd11,
                key("CD1_2").unwrap_or(0.0),
                key("CD2_1").unwrap_or(0.0),
                key("CD2_2")?,
            ),
        )?,
        Err(_) => TanWcs::from_pc(
            crval,
            crpix,
            Matrix2::new(
                key("PC1_1").unwrap_or(1.0),
                key("PC1_2").unwrap_or(0.0),
                key("PC2_1").unwrap_or(0.0),
                key("PC2_2").unwrap_or(1.0),
            ),
            [key("CDELT1")?, key("CDELT2")?],
        )?,
    };
    Ok(wcs)
}

/// Reads a vector column holding one `rows × columns` image per table row.
fn read_frames(
    fptr: &mut FitsFile,
    extension: usize,
    name: &str,
    frames: usize,
    rows: usize,
    columns: usize,
) -> Result<Array3<f64>, CutoutError> {
    // Selecting the extension also makes it current for the raw read below.
    let hdu = fptr.hdu(extension)?;
    let colnum = match &hdu.info {
        HduInfo::TableInfo {
            column_descriptions,
            ..
        } => column_descriptions
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(|index| index + 1)
            .ok_or_else(|| CutoutError::MissingColumn(name.to_string()))?,
        _ => return Err(CutoutError::MissingColumn(name.to_string())),
    };

    let nelem = frames * rows * columns;
    let mut data = vec![0.0_f64; nelem];
    if nelem > 0 {
        let mut anynul = 0;
        let mut status = 0;
        unsafe {
            fitsio::sys::ffgcvd(
                fptr.as_raw(),
                colnum as i32,
                1,
                1,
                nelem as i64,
                0.0,
                data.as_mut_ptr(),
                &mut anynul,
                &mut status,
            );
        }
        fitsio::errors::check_status(status)?;
    }

    Array3::from_shape_vec((frames, rows, columns), data)
        .map_err(|e| CutoutError::Shape(format!("{} column: {}", name, e)))
}
