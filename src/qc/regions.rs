use log::{debug, warn};
use serde::Serialize;

use crate::sop::Sop;
use crate::spectrum::{PpmInterval, RegionSet, Spectrum};
use crate::stats;

/// Statistic summarising the intensities of one region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RegionStatistic {
    /// Percentile in `[0, 100]` of the absolute intensities.
    AbsPercentile(f64),
    Maximum,
}

impl RegionStatistic {
    fn compute(&self, values: &[f64]) -> Option<f64> {
        match *self {
            RegionStatistic::AbsPercentile(q) => {
                let magnitudes: Vec<f64> = values.iter().map(|v| v.abs()).collect();
                stats::quantile(&magnitudes, q / 100.0)
            }
            RegionStatistic::Maximum => values
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .reduce(f64::max),
        }
    }
}

/// Per-spectrum level the region statistic is compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceLevel {
    /// `alpha` times the largest absolute intensity in `bounds` outside
    /// the `excluded` regions.
    ScaledMaximum {
        alpha: f64,
        bounds: PpmInterval,
        excluded: RegionSet,
    },
    /// `factor` noise sigmas above the median intensity in `bounds`.
    NoiseFloor { factor: f64, bounds: PpmInterval },
}

impl ReferenceLevel {
    fn level(&self, spectrum: &Spectrum) -> Option<f64> {
        match self {
            ReferenceLevel::ScaledMaximum {
                alpha,
                bounds,
                excluded,
            } => {
                let range = spectrum.index_range(bounds);
                let ppm = &spectrum.ppm()[range.clone()];
                let intensity = &spectrum.intensity()[range];
                ppm.iter()
                    .zip(intensity)
                    .filter(|(p, _)| !excluded.contains(**p))
                    .map(|(_, y)| y.abs())
                    .reduce(f64::max)
                    .map(|max| alpha * max)
            }
            ReferenceLevel::NoiseFloor { factor, bounds } => stats::median(spectrum.slice(bounds))
                .map(|median| median + factor * spectrum.noise_sigma()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionValue {
    pub region: PpmInterval,
    /// `None` when the region holds no points.
    pub value: Option<f64>,
}

/// Outcome of one region check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionCheck {
    pub values: Vec<RegionValue>,
    pub limit: Option<f64>,
    pub failed: bool,
}

/// Compares a statistic of each (merged) region against a reference level.
/// Any region above the level, or one that cannot be evaluated, fails the
/// check. The spectrum is only read.
#[derive(Debug, Clone)]
pub struct RegionStatisticsChecker {
    name: &'static str,
    regions: Vec<PpmInterval>,
    statistic: RegionStatistic,
    reference: ReferenceLevel,
}

impl RegionStatisticsChecker {
    pub fn new(
        name: &'static str,
        regions: &RegionSet,
        statistic: RegionStatistic,
        reference: ReferenceLevel,
    ) -> Self {
        RegionStatisticsChecker {
            name,
            regions: regions.merged(),
            statistic,
            reference,
        }
    }

    /// High percentile of `|y|` in each baseline region against
    /// `baseline_alpha` times the tallest non-excluded signal.
    pub fn baseline(sop: &Sop) -> Self {
        RegionStatisticsChecker::new(
            "baseline",
            &sop.baseline_check_region,
            RegionStatistic::AbsPercentile(sop.baseline_threshold),
            ReferenceLevel::ScaledMaximum {
                alpha: sop.baseline_alpha,
                bounds: sop.bounds,
                excluded: sop.exclusion_regions.clone(),
            },
        )
    }

    /// Maximum in each solvent region against the spectrum noise floor.
    pub fn solvent(sop: &Sop) -> Self {
        RegionStatisticsChecker::new(
            "solvent",
            &sop.solvent_peak_check_region,
            RegionStatistic::Maximum,
            ReferenceLevel::NoiseFloor {
                factor: sop.solvent_noise_factor,
                bounds: sop.bounds,
            },
        )
    }

    pub fn check(&self, spectrum: &Spectrum) -> RegionCheck {
        let limit = self.reference.level(spectrum);
        let values: Vec<RegionValue> = self
            .regions
            .iter()
            .map(|region| RegionValue {
                region: *region,
                value: self.statistic.compute(spectrum.slice(region)),
            })
            .collect();

        let failed = match limit {
            _ if values.is_empty() => false,
            None => {
                warn!("{}: no reference level for the {} check", spectrum.sample_id(), self.name);
                true
            }
            Some(limit) => values.iter().any(|v| match v.value {
                Some(value) => value > limit,
                None => {
                    warn!(
                        "{}: {} region {} holds no points",
                        spectrum.sample_id(),
                        self.name,
                        v.region
                    );
                    true
                }
            }),
        };
        debug!(
            "{}: {} check limit {limit:?}, failed = {failed}",
            spectrum.sample_id(),
            self.name
        );
        RegionCheck {
            values,
            limit,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sop::SopDocument;
    use crate::synthetic::SyntheticSpectrum;

    fn sop() -> Sop {
        Sop::try_from(SopDocument::default()).unwrap()
    }

    fn plasma() -> SyntheticSpectrum {
        SyntheticSpectrum::new(-1.0, 10.0, 0.001)
            .singlet(0.0, 1.0, 1.0)
            .singlet(5.233, 1.0, 1.0)
            .noise(0.0005, 21)
    }

    #[test]
    fn test_clean_spectrum_passes_both() {
        let s = plasma().build("clean").unwrap();
        let sop = sop();
        let baseline = RegionStatisticsChecker::baseline(&sop).check(&s);
        let solvent = RegionStatisticsChecker::solvent(&sop).check(&s);
        assert!(!baseline.failed);
        assert!(!solvent.failed);
        assert_eq!(baseline.values.len(), 2);
        assert!((baseline.limit.unwrap() - 0.05).abs() < 0.005);
    }

    #[test]
    fn test_baseline_hump_fails_baseline_only() {
        let s = plasma().hump(9.75, 0.2, 0.2).build("hump").unwrap();
        let sop = sop();
        assert!(RegionStatisticsChecker::baseline(&sop).check(&s).failed);
        assert!(!RegionStatisticsChecker::solvent(&sop).check(&s).failed);
    }

    #[test]
    fn test_residual_water_fails_solvent_only() {
        let s = plasma().singlet(4.65, 2.0, 0.5).build("water").unwrap();
        let sop = sop();
        assert!(!RegionStatisticsChecker::baseline(&sop).check(&s).failed);
        let solvent = RegionStatisticsChecker::solvent(&sop).check(&s);
        assert!(solvent.failed);
        assert!(solvent.values[0].value.unwrap() > 0.4);
    }

    #[test]
    fn test_overlapping_regions_are_merged() {
        let regions = RegionSet::new(vec![
            PpmInterval::new(9.5, 9.8).unwrap(),
            PpmInterval::new(9.7, 10.0).unwrap(),
        ]);
        let checker = RegionStatisticsChecker::new(
            "test",
            &regions,
            RegionStatistic::Maximum,
            ReferenceLevel::NoiseFloor {
                factor: 10.0,
                bounds: PpmInterval::new(-1.0, 10.0).unwrap(),
            },
        );
        let check = checker.check(&plasma().build("s").unwrap());
        assert_eq!(check.values.len(), 1);
        assert_eq!(check.values[0].region, PpmInterval::new(9.5, 10.0).unwrap());
    }

    #[test]
    fn test_empty_region_fails() {
        let regions = RegionSet::new(vec![PpmInterval::new(20.0, 21.0).unwrap()]);
        let checker = RegionStatisticsChecker::new(
            "test",
            &regions,
            RegionStatistic::Maximum,
            ReferenceLevel::NoiseFloor {
                factor: 10.0,
                bounds: PpmInterval::new(-1.0, 10.0).unwrap(),
            },
        );
        let check = checker.check(&plasma().build("s").unwrap());
        assert!(check.failed);
        assert_eq!(check.values[0].value, None);
    }

    #[test]
    fn test_no_solvent_regions_never_fails() {
        let mut doc = SopDocument::default();
        doc.solvent_peak_check_region = vec![];
        let sop = Sop::try_from(doc).unwrap();
        let s = plasma().singlet(4.79, 3.0, 0.5).build("water").unwrap();
        let check = RegionStatisticsChecker::solvent(&sop).check(&s);
        assert!(!check.failed);
        assert!(check.values.is_empty());
    }

    #[test]
    fn test_abs_percentile_uses_magnitudes() {
        let values = [-4.0, 1.0, 2.0, 3.0];
        assert_eq!(RegionStatistic::AbsPercentile(100.0).compute(&values), Some(4.0));
        assert_eq!(RegionStatistic::Maximum.compute(&values), Some(3.0));
        assert_eq!(RegionStatistic::Maximum.compute(&[]), None);
    }
}
