use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use super::statistics::median;

#[derive(Debug, PartialEq)]
pub enum SpectrumError {
    InvalidInput(String),
}

impl fmt::Display for SpectrumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpectrumError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for SpectrumError {}

/// Frequency grid bounds and density.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpectrumParams {
    /// Lowest frequency; defaults to the frequency resolution `1 / span`.
    pub fmin: Option<f64>,
    /// Highest frequency (exclusive); defaults to the Nyquist frequency of the median cadence.
    pub fmax: Option<f64>,
    pub oversample_factor: f64,
}

impl Default for SpectrumParams {
    fn default() -> Self {
        SpectrumParams {
            fmin: None,
            fmax: None,
            oversample_factor: 10.0,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct AmplitudeSpectrum {
    pub frequency: Array1<f64>,
    pub amplitude: Array1<f64>,
}

impl AmplitudeSpectrum {
    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    /// Frequency and amplitude of the highest peak.
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.frequency
            .iter()
            .zip(self.amplitude.iter())
            .filter(|(_, a)| a.is_finite())
            .max_by(|(_, a1), (_, a2)| a1.total_cmp(a2))
            .map(|(f, a)| (*f, *a))
    }
}

/// Frequency grid derived from a time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyGrid {
    /// Frequency resolution, `1 / (max(t) - min(t))`.
    pub df: f64,
    pub fmin: f64,
    pub fmax: f64,
    pub step: f64,
}

impl FrequencyGrid {
    pub fn new(time: ArrayView1<f64>, params: &SpectrumParams) -> Result<Self, SpectrumError> {
        if time.len() < 2 {
            return Err(SpectrumError::InvalidInput(format!(
                "need at least 2 samples, got {}",
                time.len()
            )));
        }
        if time.iter().any(|t| !t.is_finite()) {
            return Err(SpectrumError::InvalidInput(
                "time contains non-finite values".to_string(),
            ));
        }
        if !(params.oversample_factor > 0.0) {
            return Err(SpectrumError::InvalidInput(format!(
                "oversample factor must be positive, got {}",
                params.oversample_factor
            )));
        }

        let tmin = time.iter().copied().fold(f64::INFINITY, f64::min);
        let tmax = time.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if tmax <= tmin {
            return Err(SpectrumError::InvalidInput(
                "time needs at least 2 distinct values".to_string(),
            ));
        }
        let df = 1.0 / (tmax - tmin);

        let fmin = params.fmin.unwrap_or(df);
        let fmax = match params.fmax {
            Some(fmax) => fmax,
            None => {
                let cadence: Array1<f64> = time
                    .windows(2)
                    .into_iter()
                    .map(|w| w[1] - w[0])
                    .collect();
                let cadence = median(cadence.view()).unwrap_or(0.0);
                if cadence <= 0.0 {
                    return Err(SpectrumError::InvalidInput(
                        "median cadence must be positive".to_string(),
                    ));
                }
                0.5 / cadence
            }
        };

        Ok(FrequencyGrid {
            df,
            fmin,
            fmax,
            step: df / params.oversample_factor,
        })
    }

    /// Number of grid points in `[fmin, fmax)`.
    pub fn len(&self) -> usize {
        if self.fmax <= self.fmin {
            return 0;
        }
        let span = (self.fmax - self.fmin) / self.step;
        // Ratios that are integral up to rounding noise must not gain a point at fmax.
        let nearest = span.round();
        if (span - nearest).abs() <= 1e-9 * nearest.max(1.0) {
            nearest as usize
        } else {
            span.ceil() as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frequencies(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.len(), |k| self.fmin + k as f64 * self.step)
    }
}

/// Amplitude spectrum of `y(t)` from a floating-mean Lomb-Scargle periodogram.
///
/// Power uses the PSD normalization and is converted to amplitude with
/// `sqrt(power) * sqrt(4 / N)`, so a sinusoid of amplitude `A` peaks near `A`.
pub fn amplitude_spectrum(
    time: ArrayView1<f64>,
    flux: ArrayView1<f64>,
    params: &SpectrumParams,
) -> Result<AmplitudeSpectrum, SpectrumError> {
    if time.len() != flux.len() {
        return Err(SpectrumError::InvalidInput(format!(
            "time has {} samples but flux has {}",
            time.len(),
            flux.len()
        )));
    }
    if flux.iter().any(|y| !y.is_finite()) {
        return Err(SpectrumError::InvalidInput(
            "flux contains non-finite values".to_string(),
        ));
    }

    let grid = FrequencyGrid::new(time, params)?;
    let frequency = grid.frequencies();
    let power = lomb_scargle_psd(time, flux, frequency.view());

    let factor = (4.0 / time.len() as f64).sqrt();
    let amplitude = power.mapv(|p| p.max(0.0).sqrt() * factor);

    Ok(AmplitudeSpectrum {
        frequency,
        amplitude,
    })
}

/// Generalized Lomb-Scargle power with unit weights and PSD normalization.
pub fn lomb_scargle_psd(
    time: ArrayView1<f64>,
    flux: ArrayView1<f64>,
    frequency: ArrayView1<f64>,
) -> Array1<f64> {
    let n = time.len() as f64;
    let w = 1.0 / n;
    let mean = flux.mean().unwrap_or(0.0);
    let centered = flux.mapv(|y| y - mean);

    frequency.mapv(|f| {
        let omega = 2.0 * PI * f;

        let (mut s, mut c, mut s2, mut c2) = (0.0, 0.0, 0.0, 0.0);
        for t in time.iter() {
            let (sin, cos) = (omega * t).sin_cos();
            s += sin;
            c += cos;
            s2 += 2.0 * sin * cos;
            c2 += cos * cos - sin * sin;
        }
        let (s, c, s2, c2) = (s * w, c * w, s2 * w, c2 * w);

        let omega_tau = 0.5 * (s2 - 2.0 * c * s).atan2(c2 - (c * c - s * s));
        let (sin_tau, cos_tau) = omega_tau.sin_cos();

        let (mut sum_c, mut sum_s) = (0.0, 0.0);
        let (mut yc, mut ys, mut cc, mut ss) = (0.0, 0.0, 0.0, 0.0);
        Zip::from(&time).and(&centered).for_each(|t, y| {
            let (sin, cos) = (omega * t).sin_cos();
            let cos_shift = cos * cos_tau + sin * sin_tau;
            let sin_shift = sin * cos_tau - cos * sin_tau;
            sum_c += cos_shift;
            sum_s += sin_shift;
            yc += y * cos_shift;
            ys += y * sin_shift;
            cc += cos_shift * cos_shift;
            ss += sin_shift * sin_shift;
        });
        let (sum_c, sum_s) = (sum_c * w, sum_s * w);
        let (yc, ys) = (yc * w, ys * w);
        let cc = cc * w - sum_c * sum_c;
        let ss = ss * w - sum_s * sum_s;

        let mut power = 0.0;
        if cc > f64::EPSILON {
            power += yc * yc / cc;
        }
        if ss > f64::EPSILON {
            power += ys * ys / ss;
        }
        0.5 * n * power
    })
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array1;

    use super::*;

    fn uniform_time(n: usize, cadence: f64) -> Array1<f64> {
        Array1::from_shape_fn(n, |i| 1000.0 + i as f64 * cadence)
    }

    #[test]
    fn test_default_bounds() {
        let cadence = 0.02;
        let time = uniform_time(501, cadence);
        let span = 500.0 * cadence;

        let grid = FrequencyGrid::new(time.view(), &SpectrumParams::default()).unwrap();

        assert_relative_eq!(grid.fmin, 1.0 / span, max_relative = 1e-9);
        assert_relative_eq!(grid.fmax, 0.5 / cadence, max_relative = 1e-9);
        assert_relative_eq!(grid.step, grid.df / 10.0, max_relative = 1e-12);
    }

    #[test]
    fn test_grid_length_and_spacing() {
        let time = uniform_time(201, 0.1);
        let flux = time.mapv(|t| (t * 3.0).sin());

        let spectrum = amplitude_spectrum(time.view(), flux.view(), &Default::default()).unwrap();
        let grid = FrequencyGrid::new(time.view(), &Default::default()).unwrap();

        let ratio = (grid.fmax - grid.fmin) / grid.step;
        assert_abs_diff_eq!(ratio, ratio.round(), epsilon = 1e-6);
        assert_eq!(spectrum.len(), ratio.round() as usize);
        assert_eq!(spectrum.amplitude.len(), spectrum.len());
        for pair in spectrum.frequency.windows(2) {
            assert_relative_eq!(pair[1] - pair[0], grid.step, max_relative = 1e-6);
        }
        assert!(spectrum.frequency.iter().all(|f| *f < grid.fmax));
    }

    #[test]
    fn test_fractional_grid_rounds_up() {
        // (4.55 - 0.0) / 0.1 is 45.5: arange keeps the partial step, every point below fmax.
        let grid = FrequencyGrid {
            df: 1.0,
            fmin: 0.0,
            fmax: 4.55,
            step: 0.1,
        };
        assert_eq!(grid.len(), 46);

        let frequencies = grid.frequencies();
        assert_relative_eq!(frequencies[45], 4.5, max_relative = 1e-12);
        assert!(frequencies.iter().all(|f| *f < grid.fmax));

        let integral = FrequencyGrid { fmax: 4.5, ..grid };
        assert_eq!(integral.len(), 45);
    }

    #[test]
    fn test_serialize_spectrum() {
        let spectrum = AmplitudeSpectrum {
            frequency: Array1::from(vec![0.5, 1.0, 1.5]),
            amplitude: Array1::from(vec![0.1, 0.4, 0.2]),
        };

        let value = serde_json::to_value(&spectrum).unwrap();

        assert_eq!(value["frequency"]["dim"], serde_json::json!([3]));
        assert_eq!(value["frequency"]["data"], serde_json::json!([0.5, 1.0, 1.5]));
        assert_eq!(value["amplitude"]["data"], serde_json::json!([0.1, 0.4, 0.2]));
    }

    #[test]
    fn test_overrides() {
        let time = uniform_time(100, 0.5);
        let flux = Array1::zeros(100);
        let params = SpectrumParams {
            fmin: Some(0.1),
            fmax: Some(0.2),
            oversample_factor: 5.0,
        };

        let spectrum = amplitude_spectrum(time.view(), flux.view(), &params).unwrap();

        assert_relative_eq!(spectrum.frequency[0], 0.1);
        assert!(spectrum.frequency.iter().all(|f| *f < 0.2));
    }

    #[test]
    fn test_constant_flux_has_no_power() {
        let time = uniform_time(300, 0.05);
        let flux = Array1::from_elem(300, 42.0);

        let spectrum = amplitude_spectrum(time.view(), flux.view(), &Default::default()).unwrap();

        assert!(!spectrum.is_empty());
        for a in spectrum.amplitude.iter() {
            assert_abs_diff_eq!(*a, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_sinusoid_amplitude_recovered() {
        let time = uniform_time(1000, 0.02);
        let frequency = 3.7;
        let flux = time.mapv(|t| 1.0 + 0.004 * (2.0 * PI * frequency * t).sin());

        let spectrum = amplitude_spectrum(time.view(), flux.view(), &Default::default()).unwrap();
        let (peak_f, peak_a) = spectrum.peak().unwrap();

        assert_abs_diff_eq!(peak_f, frequency, epsilon = 0.01);
        assert_relative_eq!(peak_a, 0.004, max_relative = 0.02);
    }

    #[test]
    fn test_rejects_degenerate_time() {
        let time = Array1::from_elem(10, 5.0);
        let flux = Array1::ones(10);
        assert!(matches!(
            amplitude_spectrum(time.view(), flux.view(), &Default::default()),
            Err(SpectrumError::InvalidInput(_))
        ));

        let single = Array1::from_elem(1, 5.0);
        assert!(matches!(
            amplitude_spectrum(single.view(), single.view(), &Default::default()),
            Err(SpectrumError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let time = uniform_time(10, 1.0);
        let flux = Array1::ones(9);
        assert!(amplitude_spectrum(time.view(), flux.view(), &Default::default()).is_err());
    }
}
