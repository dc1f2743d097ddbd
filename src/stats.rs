//! Small robust-statistics helpers shared by the QC checks and the
//! batch aggregation. Thin wrappers around `statrs` that return `None`
//! instead of NaN for degenerate input.

use statrs::statistics::{Data, OrderStatistics, Statistics};

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of the finite values, `None` when there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let finite = finite_values(values);
    if finite.is_empty() {
        return None;
    }
    Some(Data::new(finite).median())
}

/// Quantile at `tau` in `[0, 1]` of the finite values.
pub fn quantile(values: &[f64], tau: f64) -> Option<f64> {
    let finite = finite_values(values);
    if finite.is_empty() || !(0.0..=1.0).contains(&tau) {
        return None;
    }
    Some(Data::new(finite).quantile(tau))
}

/// Robust standard deviation from the median absolute deviation.
pub fn robust_sigma(values: &[f64]) -> Option<f64> {
    let centre = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - centre).abs())
        .collect();
    median(&deviations).map(|mad| MAD_TO_SIGMA * mad)
}

/// Noise sigma estimated from first differences.
///
/// Differencing removes slowly varying baseline and the sparse peaks barely
/// move the median, so this tracks the white-noise level of a spectrum.
pub fn difference_noise(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    robust_sigma(&diffs).map(|s| s / std::f64::consts::SQRT_2)
}

/// Percentage relative standard deviation (sample std-dev, n - 1).
pub fn rsd_percent(values: &[f64]) -> Option<f64> {
    let finite = finite_values(values);
    if finite.len() < 2 {
        return None;
    }
    let mean = finite.iter().mean();
    if mean == 0.0 {
        return None;
    }
    let sd = finite.iter().std_dev();
    Some(100.0 * sd / mean.abs())
}

fn finite_values(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_ignores_non_finite() {
        let values = vec![3.0, f64::NAN, 1.0, 2.0];
        assert_eq!(median(&values), Some(2.0));
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn test_quantile_bounds() {
        let values: Vec<f64> = (0..=100).map(f64::from).collect();
        assert!((quantile(&values, 0.95).unwrap() - 95.0).abs() < 1.0);
        assert!(quantile(&values, 1.5).is_none());
    }

    #[test]
    fn test_robust_sigma_resists_outlier() {
        let mut values = vec![-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        values.push(1000.0);
        let sigma = robust_sigma(&values).unwrap();
        assert!((sigma - MAD_TO_SIGMA).abs() < 1e-9);
    }

    #[test]
    fn test_difference_noise_ignores_linear_trend() {
        let values: Vec<f64> = (0..100).map(|i| 0.5 * i as f64).collect();
        assert_eq!(difference_noise(&values), Some(0.0));
    }

    #[test]
    fn test_rsd_percent() {
        let values = vec![9.0, 10.0, 11.0];
        assert!((rsd_percent(&values).unwrap() - 10.0).abs() < 1e-9);
        assert!(rsd_percent(&[5.0]).is_none());
        assert!(rsd_percent(&[1.0, -1.0]).is_none());
    }
}
