use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analysis::SpectrumParams;
use crate::catalog::CatalogConfig;
use crate::correct::CorrectionParams;
use crate::quality::QualityBitmask;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Unable to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Unable to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Parse(value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TessCutConfig {
    pub base_url: String,
    /// Where downloaded archives are unpacked; `$HOME/.cache/lightcurve_inspect` when unset.
    pub cache_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    /// Cadences flagged with these bits are dropped when a cutout is read.
    pub bitmask: QualityBitmask,
    /// Cutout width and height in pixels.
    pub cutout_size: usize,
}

impl Default for TessCutConfig {
    fn default() -> Self {
        TessCutConfig {
            base_url: String::from("https://mast.stsci.edu/tesscut/api/v0.1/astrocut"),
            cache_dir: None,
            timeout_secs: None,
            bitmask: QualityBitmask::Default,
            cutout_size: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// One figure per cutout is written here when set.
    pub directory: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub correction: CorrectionParams,
    pub spectrum: SpectrumParams,
    pub catalog: CatalogConfig,
    pub tesscut: TessCutConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
