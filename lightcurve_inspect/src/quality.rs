use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Which set of quality flags counts as a rejected cadence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityBitmask {
    None,
    #[default]
    Default,
    Hard,
    Hardest,
    Custom(u32),
}

/// Bit-flag taxonomy of one instrument.
pub trait QualityFlags {
    /// Every named flag as `(bit, name)`.
    const FLAGS: &'static [(u32, &'static str)];
    const DEFAULT_BITMASK: u32;
    const HARD_BITMASK: u32;

    fn bits(bitmask: QualityBitmask) -> u32 {
        match bitmask {
            QualityBitmask::None => 0,
            QualityBitmask::Default => Self::DEFAULT_BITMASK,
            QualityBitmask::Hard => Self::HARD_BITMASK,
            QualityBitmask::Hardest => Self::FLAGS.iter().fold(0, |acc, (bit, _)| acc | bit),
            QualityBitmask::Custom(bits) => bits,
        }
    }

    /// `true` for every cadence whose flags do not intersect `bitmask`.
    fn create_quality_mask(quality: ArrayView1<u32>, bitmask: QualityBitmask) -> Array1<bool> {
        let bits = Self::bits(bitmask);
        quality.mapv(|flags| flags & bits == 0)
    }

    /// Names of the flags set in `flags`.
    fn decode(flags: u32) -> Vec<&'static str> {
        Self::FLAGS
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

pub struct TessQualityFlags;

impl TessQualityFlags {
    pub const ATTITUDE_TWEAK: u32 = 1;
    pub const SAFE_MODE: u32 = 2;
    pub const COARSE_POINT: u32 = 4;
    pub const EARTH_POINT: u32 = 8;
    pub const ARGABRIGHTENING: u32 = 16;
    pub const DESAT: u32 = 32;
    pub const APERTURE_COSMIC: u32 = 64;
    pub const MANUAL_EXCLUDE: u32 = 128;
    pub const DISCONTINUITY: u32 = 256;
    pub const IMPULSIVE_OUTLIER: u32 = 512;
    pub const COLLATERAL_COSMIC: u32 = 1024;
    pub const STRAYLIGHT: u32 = 2048;
    pub const STRAYLIGHT2: u32 = 4096;
    pub const PLANET_SEARCH_EXCLUDE: u32 = 8192;
    pub const BAD_CALIBRATION_EXCLUDE: u32 = 16384;
    pub const INSUFFICIENT_TARGETS: u32 = 32768;
}

impl QualityFlags for TessQualityFlags {
    const FLAGS: &'static [(u32, &'static str)] = &[
        (Self::ATTITUDE_TWEAK, "Attitude tweak"),
        (Self::SAFE_MODE, "Safe mode"),
        (Self::COARSE_POINT, "Coarse point"),
        (Self::EARTH_POINT, "Earth point"),
        (Self::ARGABRIGHTENING, "Argabrightening event"),
        (Self::DESAT, "Reaction wheel desaturation event"),
        (Self::APERTURE_COSMIC, "Cosmic ray in optimal aperture pixel"),
        (Self::MANUAL_EXCLUDE, "Manual exclude"),
        (Self::DISCONTINUITY, "Discontinuity corrected between this cadence and the next one"),
        (Self::IMPULSIVE_OUTLIER, "Impulsive outlier removed before cotrending"),
        (Self::COLLATERAL_COSMIC, "Cosmic ray detected on collateral pixel row or column"),
        (Self::STRAYLIGHT, "Straylight from Earth or Moon in camera FOV"),
        (Self::STRAYLIGHT2, "Scattered light exclude"),
        (Self::PLANET_SEARCH_EXCLUDE, "Planet search exclude"),
        (Self::BAD_CALIBRATION_EXCLUDE, "Bad calibration exclude"),
        (Self::INSUFFICIENT_TARGETS, "Insufficient targets for error correction exclude"),
    ];

    const DEFAULT_BITMASK: u32 = Self::ATTITUDE_TWEAK
        | Self::SAFE_MODE
        | Self::COARSE_POINT
        | Self::EARTH_POINT
        | Self::DESAT
        | Self::MANUAL_EXCLUDE;

    const HARD_BITMASK: u32 = Self::DEFAULT_BITMASK
        | Self::APERTURE_COSMIC
        | Self::COLLATERAL_COSMIC
        | Self::STRAYLIGHT;
}

pub struct KeplerQualityFlags;

impl KeplerQualityFlags {
    pub const ATTITUDE_TWEAK: u32 = 1;
    pub const SAFE_MODE: u32 = 2;
    pub const COARSE_POINT: u32 = 4;
    pub const EARTH_POINT: u32 = 8;
    pub const ZERO_CROSSING: u32 = 16;
    pub const DESAT: u32 = 32;
    pub const ARGABRIGHTENING: u32 = 64;
    pub const APERTURE_COSMIC: u32 = 128;
    pub const MANUAL_EXCLUDE: u32 = 256;
    pub const SENSITIVITY_DROPOUT: u32 = 1024;
    pub const IMPULSIVE_OUTLIER: u32 = 2048;
    pub const ARGABRIGHTENING2: u32 = 4096;
    pub const COLLATERAL_COSMIC: u32 = 8192;
    pub const DETECTOR_ANOMALY: u32 = 16384;
    pub const NO_FINE_POINT: u32 = 32768;
    pub const NO_DATA: u32 = 65536;
    pub const ROLLING_BAND_IN_APERTURE: u32 = 131072;
    pub const ROLLING_BAND_IN_MASK: u32 = 262144;
    pub const POSSIBLE_THRUSTER_FIRING: u32 = 524288;
    pub const THRUSTER_FIRING: u32 = 1048576;
}

impl QualityFlags for KeplerQualityFlags {
    const FLAGS: &'static [(u32, &'static str)] = &[
        (Self::ATTITUDE_TWEAK, "Attitude tweak"),
        (Self::SAFE_MODE, "Safe mode"),
        (Self::COARSE_POINT, "Coarse point"),
        (Self::EARTH_POINT, "Earth point"),
        (Self::ZERO_CROSSING, "Zero crossing"),
        (Self::DESAT, "Desaturation event"),
        (Self::ARGABRIGHTENING, "Argabrightening"),
        (Self::APERTURE_COSMIC, "Cosmic ray in optimal aperture"),
        (Self::MANUAL_EXCLUDE, "Manual exclude"),
        (Self::SENSITIVITY_DROPOUT, "Sudden sensitivity dropout"),
        (Self::IMPULSIVE_OUTLIER, "Impulsive outlier"),
        (Self::ARGABRIGHTENING2, "Argabrightening on CCD"),
        (Self::COLLATERAL_COSMIC, "Cosmic ray in collateral data"),
        (Self::DETECTOR_ANOMALY, "Detector anomaly"),
        (Self::NO_FINE_POINT, "No fine point"),
        (Self::NO_DATA, "No data"),
        (Self::ROLLING_BAND_IN_APERTURE, "Rolling band in optimal aperture"),
        (Self::ROLLING_BAND_IN_MASK, "Rolling band in full mask"),
        (Self::POSSIBLE_THRUSTER_FIRING, "Possible thruster firing"),
        (Self::THRUSTER_FIRING, "Thruster firing"),
    ];

    const DEFAULT_BITMASK: u32 = Self::ATTITUDE_TWEAK
        | Self::SAFE_MODE
        | Self::COARSE_POINT
        | Self::EARTH_POINT
        | Self::DESAT
        | Self::MANUAL_EXCLUDE
        | Self::DETECTOR_ANOMALY
        | Self::NO_DATA
        | Self::THRUSTER_FIRING;

    const HARD_BITMASK: u32 = Self::DEFAULT_BITMASK
        | Self::SENSITIVITY_DROPOUT
        | Self::APERTURE_COSMIC
        | Self::COLLATERAL_COSMIC
        | Self::POSSIBLE_THRUSTER_FIRING;
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_tess_bitmasks() {
        assert_eq!(TessQualityFlags::DEFAULT_BITMASK, 175);
        assert_eq!(TessQualityFlags::HARD_BITMASK, 3311);
        assert_eq!(TessQualityFlags::bits(QualityBitmask::Hardest), 65535);
        assert_eq!(TessQualityFlags::bits(QualityBitmask::None), 0);
    }

    #[test]
    fn test_kepler_bitmasks() {
        assert_eq!(KeplerQualityFlags::DEFAULT_BITMASK, 1130799);
        assert_eq!(KeplerQualityFlags::HARD_BITMASK, 1664431);
    }

    #[test]
    fn test_hard_mask_removes_exactly_intersecting() {
        let quality = array![
            0,
            TessQualityFlags::STRAYLIGHT,
            TessQualityFlags::DISCONTINUITY,
            TessQualityFlags::DESAT | TessQualityFlags::DISCONTINUITY,
            TessQualityFlags::STRAYLIGHT2,
            TessQualityFlags::APERTURE_COSMIC,
            TessQualityFlags::COLLATERAL_COSMIC,
            TessQualityFlags::IMPULSIVE_OUTLIER,
        ];

        let mask = TessQualityFlags::create_quality_mask(quality.view(), QualityBitmask::Hard);

        assert_eq!(mask, array![true, false, true, false, true, false, false, true]);
        for (flags, keep) in quality.iter().zip(mask.iter()) {
            assert_eq!(*keep, flags & TessQualityFlags::HARD_BITMASK == 0);
        }
    }

    #[test]
    fn test_hard_contains_default() {
        assert_eq!(
            TessQualityFlags::HARD_BITMASK & TessQualityFlags::DEFAULT_BITMASK,
            TessQualityFlags::DEFAULT_BITMASK
        );
        assert_eq!(
            KeplerQualityFlags::HARD_BITMASK & KeplerQualityFlags::DEFAULT_BITMASK,
            KeplerQualityFlags::DEFAULT_BITMASK
        );
    }

    #[test]
    fn test_custom_mask() {
        let quality = array![1, 2, 3, 4];
        let mask = KeplerQualityFlags::create_quality_mask(quality.view(), QualityBitmask::Custom(2));
        assert_eq!(mask, array![true, false, false, true]);
    }

    #[test]
    fn test_decode() {
        let names = TessQualityFlags::decode(TessQualityFlags::SAFE_MODE | TessQualityFlags::STRAYLIGHT);
        assert_eq!(names, vec!["Safe mode", "Straylight from Earth or Moon in camera FOV"]);
        assert!(TessQualityFlags::decode(0).is_empty());
    }
}
