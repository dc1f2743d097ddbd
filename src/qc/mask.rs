use serde::Serialize;

use crate::sop::Sop;
use crate::spectrum::{PpmInterval, RegionSet, Spectrum};

/// Binned intensities on the SOP's feature grid. `None` marks a bin that
/// was excluded, which is distinct from a measured zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<Option<f64>>);

impl FeatureVector {
    pub fn new(values: Vec<Option<f64>>) -> Self {
        FeatureVector(values)
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.0
    }

    pub fn get(&self, k: usize) -> Option<f64> {
        self.0.get(k).copied().flatten()
    }

    pub fn is_excluded(&self, k: usize) -> bool {
        matches!(self.0.get(k), Some(None))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Bins a calibrated spectrum into `variableSize` equal-width bins over
/// `bounds` and blanks out the bins whose centre lies in an exclusion
/// region.
#[derive(Debug, Clone)]
pub struct ExclusionMasker {
    bounds: PpmInterval,
    bins: usize,
    exclusions: RegionSet,
}

impl ExclusionMasker {
    pub fn new(bounds: PpmInterval, bins: usize, exclusions: RegionSet) -> Self {
        ExclusionMasker {
            bounds,
            bins,
            exclusions,
        }
    }

    pub fn from_sop(sop: &Sop) -> Self {
        ExclusionMasker::new(sop.bounds, sop.variable_size, sop.exclusion_regions.clone())
    }

    pub fn bin_width(&self) -> f64 {
        self.bounds.width() / self.bins as f64
    }

    pub fn bin_center(&self, k: usize) -> f64 {
        self.bounds.low() + (k as f64 + 0.5) * self.bin_width()
    }

    /// Mean intensity of the points in each bin; a bin holding no point
    /// takes the interpolated intensity at its centre.
    pub fn bin(&self, spectrum: &Spectrum) -> FeatureVector {
        let ppm = spectrum.ppm();
        let intensity = spectrum.intensity();
        let width = self.bin_width();
        let low = self.bounds.low();

        let mut start = ppm.partition_point(|&p| p < low);
        let values = (0..self.bins)
            .map(|k| {
                let end = if k + 1 == self.bins {
                    ppm.partition_point(|&p| p <= self.bounds.high())
                } else {
                    let edge = low + (k + 1) as f64 * width;
                    ppm.partition_point(|&p| p < edge)
                };
                let value = if end > start {
                    intensity[start..end].iter().sum::<f64>() / (end - start) as f64
                } else {
                    spectrum.interpolate(self.bin_center(k))
                };
                start = end.max(start);
                Some(value)
            })
            .collect();
        FeatureVector(values)
    }

    /// Mark excluded bins. Applying it twice gives the same vector.
    pub fn apply(&self, features: FeatureVector) -> FeatureVector {
        let values = features
            .0
            .into_iter()
            .enumerate()
            .map(|(k, v)| {
                if self.exclusions.contains(self.bin_center(k)) {
                    None
                } else {
                    v
                }
            })
            .collect();
        FeatureVector(values)
    }

    pub fn mask(&self, spectrum: &Spectrum) -> FeatureVector {
        self.apply(self.bin(spectrum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Spectrum {
        // 0.00, 0.01, ..., 1.00 with intensity = 100 * ppm
        let ppm: Vec<f64> = (0..=100).map(|i| i as f64 / 100.0).collect();
        let intensity: Vec<f64> = ppm.iter().map(|p| 100.0 * p).collect();
        Spectrum::new("ramp", ppm, intensity, 600.0).unwrap()
    }

    fn masker(bins: usize, exclusions: Vec<(f64, f64)>) -> ExclusionMasker {
        let regions = exclusions
            .into_iter()
            .map(|(a, b)| PpmInterval::new(a, b).unwrap())
            .collect();
        ExclusionMasker::new(PpmInterval::new(0.0, 1.0).unwrap(), bins, RegionSet::new(regions))
    }

    #[test]
    fn test_bins_average_their_points() {
        let features = masker(10, vec![]).bin(&ramp());
        assert_eq!(features.len(), 10);
        // first bin holds 0.00..0.09
        assert!((features.get(0).unwrap() - 4.5).abs() < 1e-9);
        // last bin holds 0.90..1.00 inclusive
        assert!((features.get(9).unwrap() - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_bins_interpolate() {
        let features = masker(1000, vec![]).bin(&ramp());
        for k in [0, 123, 999] {
            let centre = masker(1000, vec![]).bin_center(k);
            assert!((features.get(k).unwrap() - 100.0 * centre).abs() < 1.0);
        }
    }

    #[test]
    fn test_excluded_bins_are_marked() {
        let m = masker(10, vec![(0.2, 0.4)]);
        let binned = m.bin(&ramp());
        let masked = m.apply(binned.clone());
        for k in 0..10 {
            let centre = m.bin_center(k);
            if (0.2..=0.4).contains(&centre) {
                assert!(masked.is_excluded(k), "bin {k}");
            } else {
                assert_eq!(masked.get(k), binned.get(k));
            }
        }
        assert!(masked.is_excluded(2) && masked.is_excluded(3));
        assert!(!masked.is_excluded(4));
    }

    #[test]
    fn test_masking_is_idempotent() {
        let m = masker(50, vec![(0.1, 0.15), (0.12, 0.3), (0.9, 1.0)]);
        let once = m.mask(&ramp());
        let twice = m.apply(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_measured_zero_is_not_excluded() {
        let s = Spectrum::new("flat", vec![0.0, 0.5, 1.0], vec![0.0; 3], 600.0).unwrap();
        let features = masker(2, vec![]).mask(&s);
        assert_eq!(features.get(0), Some(0.0));
        assert!(!features.is_excluded(0));
    }
}
