use std::path::PathBuf;

use clap::Parser;
use lightcurve_inspect::catalog::VizierCatalog;
use lightcurve_inspect::{Config, LightCurve, Pipeline, TessCut};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Removes scattered light from every TESS cutout of a target.
#[derive(Parser, Debug)]
struct Args {
    /// Object name or "ra dec" in decimal degrees.
    target: String,

    /// JSON configuration file.  Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Aperture threshold in robust standard deviations above the median.
    #[arg(long)]
    threshold: Option<f64>,

    /// Number of principal components used as regressors.
    #[arg(long)]
    npca: Option<usize>,

    /// Cutout width and height in pixels.
    #[arg(long)]
    cutout_size: Option<usize>,

    /// Faintest Gaia G magnitude shown on the diagnostics.
    #[arg(long)]
    magnitude_limit: Option<f64>,

    /// Write one diagnostic figure per cutout into this directory.
    #[arg(short, long)]
    diagnostics: Option<PathBuf>,

    /// Directory for the corrected light curves.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(threshold) = self.threshold {
            config.correction.threshold = threshold;
        }
        if let Some(npca) = self.npca {
            config.correction.npca = npca;
        }
        if let Some(size) = self.cutout_size {
            config.tesscut.cutout_size = size;
        }
        if let Some(limit) = self.magnitude_limit {
            config.catalog.magnitude_limit = limit;
        }
        if let Some(directory) = &self.diagnostics {
            config.diagnostics.directory = Some(directory.clone());
        }
        Ok(config)
    }
}

fn file_name(lc: &LightCurve, index: usize) -> String {
    let label: String = lc
        .meta
        .label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    match lc.meta.sector {
        Some(sector) => format!("{}_s{:04}.csv", label, sector),
        None => format!("{}_{}.csv", label, index),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = args.config()?;
    let source = TessCut::new(&config.tesscut)?;
    let catalog = VizierCatalog::new(&config.catalog)?;
    let mut pipeline = Pipeline::new(args.target.clone(), source, catalog, config);

    let corrected = pipeline.correct()?;
    std::fs::create_dir_all(&args.output)?;
    for (index, lc) in corrected.iter().enumerate() {
        let path = args.output.join(file_name(lc, index));
        lc.to_csv(&path)?;
        info!(path = %path.display(), cadences = lc.len(), "Wrote light curve");
    }

    Ok(())
}
