use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use lightcurve_inspect::analysis::{amplitude_spectrum, SpectrumParams};
use ndarray::Array1;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Amplitude spectrum of a light curve CSV with `time` and `flux` columns.
#[derive(Parser, Debug)]
struct Args {
    /// Input CSV.
    input: PathBuf,

    /// Output CSV; standard output when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Lowest frequency in 1/day.  Defaults to one over the time span.
    #[arg(long)]
    fmin: Option<f64>,

    /// Highest frequency in 1/day.  Defaults to the Nyquist frequency.
    #[arg(long)]
    fmax: Option<f64>,

    #[arg(long, default_value_t = 10.0)]
    oversample_factor: f64,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize)]
struct Sample {
    time: f64,
    flux: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .init();

    let mut reader = csv::Reader::from_path(&args.input)?;
    let (time, flux): (Vec<f64>, Vec<f64>) = reader
        .deserialize::<Sample>()
        .filter_map(|sample| match sample {
            Ok(s) if s.time.is_finite() && s.flux.is_finite() => Some(Ok((s.time, s.flux))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .unzip();
    info!(samples = time.len(), "Read light curve");

    let params = SpectrumParams {
        fmin: args.fmin,
        fmax: args.fmax,
        oversample_factor: args.oversample_factor,
    };
    let spectrum = amplitude_spectrum(
        Array1::from(time).view(),
        Array1::from(flux).view(),
        &params,
    )?;
    if let Some((frequency, amplitude)) = spectrum.peak() {
        info!(frequency, amplitude, "Peak");
    }

    let output: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(["frequency", "amplitude"])?;
    for (f, a) in spectrum.frequency.iter().zip(spectrum.amplitude.iter()) {
        writer.write_record([f.to_string(), a.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}
