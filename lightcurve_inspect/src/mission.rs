use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::quality::{KeplerQualityFlags, QualityBitmask, QualityFlags, TessQualityFlags};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mission {
    Kepler,
    K2,
    Tess,
}

/// Which flag table an instrument's quality column follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTaxonomy {
    Kepler,
    Tess,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionParams {
    /// Arcseconds per pixel.
    pub pixel_scale: f64,
    /// Julian date of time zero for the mission's barycentric time column.
    pub time_offset_jd: f64,
    pub quality: QualityTaxonomy,
}

impl Mission {
    pub fn params(&self) -> MissionParams {
        match self {
            Mission::Kepler | Mission::K2 => MissionParams {
                pixel_scale: 4.0,
                time_offset_jd: 2454833.0,
                quality: QualityTaxonomy::Kepler,
            },
            Mission::Tess => MissionParams {
                pixel_scale: 21.0,
                time_offset_jd: 2457000.0,
                quality: QualityTaxonomy::Tess,
            },
        }
    }

    pub fn quality_bits(&self, bitmask: QualityBitmask) -> u32 {
        match self.params().quality {
            QualityTaxonomy::Kepler => KeplerQualityFlags::bits(bitmask),
            QualityTaxonomy::Tess => TessQualityFlags::bits(bitmask),
        }
    }

    pub fn quality_mask(&self, quality: ArrayView1<u32>, bitmask: QualityBitmask) -> Array1<bool> {
        match self.params().quality {
            QualityTaxonomy::Kepler => KeplerQualityFlags::create_quality_mask(quality, bitmask),
            QualityTaxonomy::Tess => TessQualityFlags::create_quality_mask(quality, bitmask),
        }
    }

    pub fn decode_quality(&self, flags: u32) -> Vec<&'static str> {
        match self.params().quality {
            QualityTaxonomy::Kepler => KeplerQualityFlags::decode(flags),
            QualityTaxonomy::Tess => TessQualityFlags::decode(flags),
        }
    }
}

impl fmt::Display for Mission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mission::Kepler => write!(f, "Kepler"),
            Mission::K2 => write!(f, "K2"),
            Mission::Tess => write!(f, "TESS"),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct UnknownMission(pub String);

impl fmt::Display for UnknownMission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown mission: {}", self.0)
    }
}

impl std::error::Error for UnknownMission {}

impl FromStr for Mission {
    type Err = UnknownMission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kepler" => Ok(Mission::Kepler),
            "k2" => Ok(Mission::K2),
            "tess" => Ok(Mission::Tess),
            _ => Err(UnknownMission(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_pixel_scales() {
        assert_eq!(Mission::Kepler.params().pixel_scale, 4.0);
        assert_eq!(Mission::K2.params().pixel_scale, 4.0);
        assert_eq!(Mission::Tess.params().pixel_scale, 21.0);
    }

    #[test]
    fn test_parse() {
        assert_eq!("TESS".parse::<Mission>(), Ok(Mission::Tess));
        assert_eq!(" k2 ".parse::<Mission>(), Ok(Mission::K2));
        assert!("hubble".parse::<Mission>().is_err());
    }

    #[test]
    fn test_quality_dispatch() {
        // 128 is manual exclude for TESS but a cosmic ray for Kepler.
        let quality = array![0, 128];
        assert_eq!(
            Mission::Tess.quality_mask(quality.view(), QualityBitmask::Default),
            array![true, false]
        );
        assert_eq!(
            Mission::Kepler.quality_mask(quality.view(), QualityBitmask::Default),
            array![true, true]
        );
        assert_eq!(Mission::Tess.quality_bits(QualityBitmask::Hard), 3311);
    }
}
