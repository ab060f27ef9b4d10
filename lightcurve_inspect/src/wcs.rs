use std::fmt;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// ICRS position in degrees.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition {
    pub ra: f64,
    pub dec: f64,
}

#[derive(Debug, PartialEq)]
pub enum WcsError {
    SingularMatrix,
    /// The sky position is on or behind the tangent plane.
    OutOfProjection { ra: f64, dec: f64 },
    MissingKey(String),
}

impl fmt::Display for WcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcsError::SingularMatrix => write!(f, "CD matrix is singular"),
            WcsError::OutOfProjection { ra, dec } => {
                write!(f, "({}, {}) cannot be projected onto the tangent plane", ra, dec)
            }
            WcsError::MissingKey(key) => write!(f, "Missing WCS header keyword {}", key),
        }
    }
}

impl std::error::Error for WcsError {}

/// Maps sky coordinates in degrees to 0-based pixel coordinates.
pub trait WorldToPixel {
    fn world_to_pixel(&self, ra: f64, dec: f64) -> Result<(f64, f64), WcsError>;
}

/// Gnomonic (TAN) world coordinate system without distortion terms.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    /// Reference sky position (RA, Dec) in degrees.
    pub crval: [f64; 2],
    /// Reference pixel, 1-based as in FITS headers.
    pub crpix: [f64; 2],
    /// Degrees per pixel.
    pub cd: Matrix2<f64>,
    cd_inv: Matrix2<f64>,
}

impl TanWcs {
    pub fn new(crval: [f64; 2], crpix: [f64; 2], cd: Matrix2<f64>) -> Result<Self, WcsError> {
        let cd_inv = cd.try_inverse().ok_or(WcsError::SingularMatrix)?;
        Ok(TanWcs {
            crval,
            crpix,
            cd,
            cd_inv,
        })
    }

    /// Builds the CD matrix from a PC matrix and per-axis CDELT scales.
    pub fn from_pc(
        crval: [f64; 2],
        crpix: [f64; 2],
        pc: Matrix2<f64>,
        cdelt: [f64; 2],
    ) -> Result<Self, WcsError> {
        let scale = Matrix2::from_diagonal(&Vector2::new(cdelt[0], cdelt[1]));
        TanWcs::new(crval, crpix, scale * pc)
    }

    /// Inverse of `world_to_pixel`.
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let offset = Vector2::new(x + 1.0 - self.crpix[0], y + 1.0 - self.crpix[1]);
        let plane = self.cd * offset;
        let (xi, eta) = (plane.x.to_radians(), plane.y.to_radians());
        let (ra0, dec0) = (self.crval[0].to_radians(), self.crval[1].to_radians());

        let rho = xi.hypot(eta);
        if rho < 1e-15 {
            return (self.crval[0], self.crval[1]);
        }
        let c = rho.atan();
        let (sin_c, cos_c) = c.sin_cos();
        let dec = (cos_c * dec0.sin() + eta * sin_c * dec0.cos() / rho).asin();
        let ra = ra0 + (xi * sin_c).atan2(rho * dec0.cos() * cos_c - eta * dec0.sin() * sin_c);
        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }
}

impl WorldToPixel for TanWcs {
    fn world_to_pixel(&self, ra: f64, dec: f64) -> Result<(f64, f64), WcsError> {
        let (ra_r, dec_r) = (ra.to_radians(), dec.to_radians());
        let (ra0, dec0) = (self.crval[0].to_radians(), self.crval[1].to_radians());
        let da = ra_r - ra0;

        let denom = dec_r.sin() * dec0.sin() + dec_r.cos() * dec0.cos() * da.cos();
        if denom <= 1e-12 {
            return Err(WcsError::OutOfProjection { ra, dec });
        }
        let xi = dec_r.cos() * da.sin() / denom;
        let eta = (dec_r.sin() * dec0.cos() - dec_r.cos() * dec0.sin() * da.cos()) / denom;

        let pixel = self.cd_inv * Vector2::new(xi.to_degrees(), eta.to_degrees());
        Ok((pixel.x + self.crpix[0] - 1.0, pixel.y + self.crpix[1] - 1.0))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn tess_like() -> TanWcs {
        let scale = 21.0 / 3600.0;
        TanWcs::new(
            [83.82, -5.39],
            [25.5, 25.5],
            Matrix2::new(-scale, 0.0, 0.0, scale),
        )
        .unwrap()
    }

    #[test]
    fn test_reference_pixel() {
        let wcs = tess_like();
        let (x, y) = wcs.world_to_pixel(83.82, -5.39).unwrap();
        assert_abs_diff_eq!(x, 24.5, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 24.5, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip() {
        let wcs = tess_like();
        let (ra, dec) = wcs.pixel_to_world(3.0, 40.0);
        let (x, y) = wcs.world_to_pixel(ra, dec).unwrap();
        assert_abs_diff_eq!(x, 3.0, epsilon = 1e-8);
        assert_abs_diff_eq!(y, 40.0, epsilon = 1e-8);
    }

    #[test]
    fn test_axis_directions() {
        let wcs = tess_like();
        // RA increases to the east, which this CD matrix maps to decreasing x.
        let (x, _) = wcs.world_to_pixel(83.83, -5.39).unwrap();
        assert!(x < 24.5);
        let (_, y) = wcs.world_to_pixel(83.82, -5.38).unwrap();
        assert!(y > 24.5);
    }

    #[test]
    fn test_pc_cdelt_matches_cd() {
        let scale = 21.0 / 3600.0;
        let from_pc = TanWcs::from_pc(
            [10.0, 20.0],
            [1.0, 1.0],
            Matrix2::identity(),
            [-scale, scale],
        )
        .unwrap();
        let from_cd = TanWcs::new(
            [10.0, 20.0],
            [1.0, 1.0],
            Matrix2::new(-scale, 0.0, 0.0, scale),
        )
        .unwrap();
        assert_eq!(from_pc, from_cd);
    }

    #[test]
    fn test_singular_and_opposite_side() {
        assert_eq!(
            TanWcs::new([0.0, 0.0], [1.0, 1.0], Matrix2::zeros()),
            Err(WcsError::SingularMatrix)
        );
        assert!(matches!(
            tess_like().world_to_pixel(263.82, 5.39),
            Err(WcsError::OutOfProjection { .. })
        ));
    }
}
