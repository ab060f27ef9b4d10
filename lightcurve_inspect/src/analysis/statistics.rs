use ndarray::{Array1, ArrayView1, ArrayViewD, Zip};
use ndarray_stats::{interpolate::Linear, Quantile1dExt};
use noisy_float::types::{n64, N64};

/// Summary of the finite samples of an image or series.
pub struct Statistics {
    pub count: usize,
    pub median: f64,
    pub mean: f64,
    pub mad: f64,
    pub std_dev: f64,
}

impl Statistics {
    /// Returns `None` when there are no finite samples.
    pub fn new(data: &ArrayViewD<f64>) -> Option<Statistics> {
        let finite = Statistics::finite_values(data.iter());
        if finite.is_empty() {
            return None;
        }

        let median = Statistics::calculate_median(&finite)?;
        let mad = median_absolute_deviation(finite.view())?;

        let mean = finite.mean()?;
        let std_dev = finite.std(0.0);

        Some(Statistics {
            count: finite.len(),
            median,
            mean,
            mad,
            std_dev,
        })
    }

    fn finite_values<'a>(data: impl Iterator<Item = &'a f64>) -> Array1<f64> {
        data.filter(|x| x.is_finite()).copied().collect()
    }

    fn calculate_median(data: &Array1<f64>) -> Option<f64> {
        quantile(data.view(), 0.5)
    }
}

fn quantile(data: ArrayView1<f64>, q: f64) -> Option<f64> {
    let mut sortable: Array1<N64> = data
        .iter()
        .filter(|x| x.is_finite())
        .map(|x| n64(*x))
        .collect();
    if sortable.is_empty() {
        return None;
    }
    sortable.quantile_mut(n64(q), &Linear).ok().map(|x| x.raw())
}

/// Median of the finite values, interpolating between the two middle samples.
pub fn median(data: ArrayView1<f64>) -> Option<f64> {
    quantile(data, 0.5)
}

/// Percentile `q` in `[0, 100]` of the finite values with linear interpolation.
pub fn percentile(data: ArrayView1<f64>, q: f64) -> Option<f64> {
    if !(0.0..=100.0).contains(&q) {
        return None;
    }
    quantile(data, q / 100.0)
}

/// Median absolute deviation of the finite values.
pub fn median_absolute_deviation(data: ArrayView1<f64>) -> Option<f64> {
    let center = median(data)?;
    let abs_dev = data.mapv(|x| (x - center).abs());
    median(abs_dev.view())
}

/// Iterative median/standard-deviation clipping.
///
/// Starts from the samples marked `true` in `keep` and returns the samples
/// that survive. A sample is rejected when it lies more than `sigma` standard
/// deviations from the median of the surviving samples. Non-finite samples are
/// always rejected. Stops after `max_iters` passes or when a pass rejects
/// nothing.
pub fn sigma_clip(
    data: ArrayView1<f64>,
    keep: ArrayView1<bool>,
    sigma: f64,
    max_iters: usize,
) -> Array1<bool> {
    let mut keep: Array1<bool> = Zip::from(&data)
        .and(&keep)
        .map_collect(|x, k| *k && x.is_finite());

    for _ in 0..max_iters {
        let kept: Array1<f64> = Zip::from(&data)
            .and(&keep)
            .fold(Vec::new(), |mut acc, x, k| {
                if *k {
                    acc.push(*x);
                }
                acc
            })
            .into();
        let center = match median(kept.view()) {
            Some(center) => center,
            None => break,
        };
        let spread = kept.std(0.0);

        let mut rejected = 0;
        Zip::from(&mut keep).and(&data).for_each(|k, x| {
            if *k && (x - center).abs() > sigma * spread {
                *k = false;
                rejected += 1;
            }
        });
        if rejected == 0 {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_median_even_and_odd() {
        assert_relative_eq!(median(array![3.0, 1.0, 2.0].view()).unwrap(), 2.0);
        assert_relative_eq!(median(array![4.0, 1.0, 3.0, 2.0].view()).unwrap(), 2.5);
    }

    #[test]
    fn test_median_ignores_nan() {
        let data = array![1.0, f64::NAN, 5.0, 3.0, f64::INFINITY];
        assert_relative_eq!(median(data.view()).unwrap(), 3.0);
        assert!(median(array![f64::NAN].view()).is_none());
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let data: Array1<f64> = (1..=11).map(f64::from).collect();
        assert_relative_eq!(percentile(data.view(), 5.0).unwrap(), 1.5);
        assert_relative_eq!(percentile(data.view(), 100.0).unwrap(), 11.0);
        assert!(percentile(data.view(), 101.0).is_none());
    }

    #[test]
    fn test_mad() {
        let data = array![1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        assert_relative_eq!(median_absolute_deviation(data.view()).unwrap(), 1.0);
    }

    #[test]
    fn test_statistics() {
        let data = array![[1.0, 2.0], [3.0, f64::NAN]].into_dyn();
        let stats = Statistics::new(&data.view()).unwrap();
        assert_eq!(stats.count, 3);
        assert_relative_eq!(stats.median, 2.0);
        assert_relative_eq!(stats.mean, 2.0);
        assert_relative_eq!(stats.mad, 1.0);
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        let mut data: Array1<f64> = (0..50).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        data[10] = 100.0;
        let keep = Array1::from_elem(data.len(), true);

        let clipped = sigma_clip(data.view(), keep.view(), 5.0, 5);

        assert!(!clipped[10]);
        assert_eq!(clipped.iter().filter(|k| !**k).count(), 1);
    }

    #[test]
    fn test_sigma_clip_keeps_masked_out() {
        let data = array![1.0, 2.0, f64::NAN, 1.5];
        let keep = array![true, false, true, true];

        let clipped = sigma_clip(data.view(), keep.view(), 3.0, 5);

        assert_eq!(clipped, array![true, false, false, true]);
    }
}
