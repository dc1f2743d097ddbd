use log::{debug, warn};
use serde::Serialize;

use super::peak::{PeakLine, PeakLocator};
use crate::sop::{Multiplicity, Sop};
use crate::spectrum::{PpmInterval, Spectrum};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LineWidthMeasurement {
    /// Mean width of the reference lines in Hz, `None` when unmeasurable.
    pub width_hz: Option<f64>,
    pub peak_ppm: Option<f64>,
    pub failed: bool,
}

/// Measures the full width of the reference signal at a fixed fraction of
/// its height. Run on the calibrated spectrum.
#[derive(Debug, Clone, Copy)]
pub struct LineWidthEstimator {
    locator: PeakLocator,
    range: PpmInterval,
    multiplicity: Multiplicity,
    fraction: f64,
    threshold_hz: f64,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Left,
    Right,
}

impl LineWidthEstimator {
    pub fn from_sop(sop: &Sop) -> Self {
        LineWidthEstimator {
            locator: PeakLocator::from_sop(sop),
            range: sop.lw_peak_range,
            multiplicity: sop.lw_peak_multiplicity,
            fraction: sop.lw_peak_intensity_fraction,
            threshold_hz: sop.lw_fail_threshold,
        }
    }

    pub fn estimate(&self, spectrum: &Spectrum) -> LineWidthMeasurement {
        let peak = match self.locator.locate(spectrum, &self.range, self.multiplicity) {
            Ok(peak) => peak,
            Err(e) => {
                warn!("{}: line width not measured: {e}", spectrum.sample_id());
                return LineWidthMeasurement {
                    width_hz: None,
                    peak_ppm: None,
                    failed: true,
                };
            }
        };

        let width_hz = self.width_hz(spectrum, &peak.lines);
        let failed = match width_hz {
            Some(w) => w > self.threshold_hz,
            None => {
                warn!(
                    "{}: {} at {:.4} ppm never falls to {} of its height",
                    spectrum.sample_id(),
                    self.multiplicity,
                    peak.centroid_ppm,
                    self.fraction
                );
                true
            }
        };
        debug!("{}: line width {width_hz:?} Hz", spectrum.sample_id());
        LineWidthMeasurement {
            width_hz,
            peak_ppm: Some(peak.centroid_ppm),
            failed,
        }
    }

    /// Each line is bounded by the midpoints to its neighbours so that
    /// multiplet lines are measured separately.
    fn width_hz(&self, spectrum: &Spectrum, lines: &[PeakLine]) -> Option<f64> {
        if lines.is_empty() {
            return None;
        }
        let mut total = 0.0;
        for (k, line) in lines.iter().enumerate() {
            let left_limit = match k {
                0 => f64::NEG_INFINITY,
                _ => 0.5 * (lines[k - 1].ppm + line.ppm),
            };
            let right_limit = match lines.get(k + 1) {
                Some(next) => 0.5 * (line.ppm + next.ppm),
                None => f64::INFINITY,
            };
            let level = self.fraction * line.height;
            let left = crossing(spectrum, line, level, Side::Left, left_limit)?;
            let right = crossing(spectrum, line, level, Side::Right, right_limit)?;
            total += right - left;
        }
        Some(spectrum.ppm_to_hz(total / lines.len() as f64))
    }
}

/// Ppm at which the intensity first drops to `level` walking away from the
/// refined apex of `line`, interpolated linearly between the bracketing
/// points. The refined apex is the first inner point, so a level above the
/// sampled maximum still lands between the apex and its neighbour.
fn crossing(spectrum: &Spectrum, line: &PeakLine, level: f64, side: Side, limit: f64) -> Option<f64> {
    let x = spectrum.ppm();
    let y = spectrum.intensity();
    let step = |i: usize| match side {
        Side::Left => i.checked_sub(1),
        Side::Right => Some(i + 1).filter(|&i| i < x.len()),
    };
    let apex_is_outside = match side {
        Side::Left => x[line.index] < line.ppm,
        Side::Right => x[line.index] > line.ppm,
    };
    let mut next = if apex_is_outside { Some(line.index) } else { step(line.index) };
    let (mut inner_x, mut inner_y) = (line.ppm, line.height);
    loop {
        let outer = next?;
        let beyond = match side {
            Side::Left => x[outer] < limit,
            Side::Right => x[outer] > limit,
        };
        if beyond {
            return None;
        }
        if y[outer] <= level {
            let span = inner_y - y[outer];
            if span <= 0.0 {
                return Some(x[outer]);
            }
            let t = (level - y[outer]) / span;
            return Some(x[outer] + t * (inner_x - x[outer]));
        }
        inner_x = x[outer];
        inner_y = y[outer];
        next = step(outer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sop::SopDocument;
    use crate::synthetic::SyntheticSpectrum;

    fn estimator(fraction: f64, multiplicity: Multiplicity, range: (f64, f64)) -> LineWidthEstimator {
        let mut doc = SopDocument::default();
        doc.lw_peak_intensity_fraction = fraction;
        doc.lw_peak_multiplicity = multiplicity;
        doc.lw_peak_range = PpmInterval::new(range.0, range.1).unwrap();
        LineWidthEstimator::from_sop(&Sop::try_from(doc).unwrap())
    }

    fn tsp(width_hz: f64) -> Spectrum {
        SyntheticSpectrum::new(-0.3, 0.3, 0.0002)
            .singlet(0.0, width_hz, 1.0)
            .build("tsp")
            .unwrap()
    }

    #[test]
    fn test_half_height_width_of_lorentzian() {
        let m = estimator(0.5, Multiplicity::Singlet, (-0.1, 0.1)).estimate(&tsp(1.0));
        let w = m.width_hz.unwrap();
        assert!((w - 1.0).abs() < 0.05, "width {w}");
        assert!(!m.failed);
    }

    #[test]
    fn test_width_at_other_fraction() {
        // full width at fraction f is FWHM * sqrt(1/f - 1)
        let m = estimator(0.25, Multiplicity::Singlet, (-0.1, 0.1)).estimate(&tsp(1.0));
        let w = m.width_hz.unwrap();
        assert!((w - 3f64.sqrt()).abs() < 0.05, "width {w}");
        assert!(m.failed, "1.73 Hz exceeds the 1.4 Hz threshold");
    }

    #[test]
    fn test_broad_line_fails() {
        let m = estimator(0.5, Multiplicity::Singlet, (-0.1, 0.1)).estimate(&tsp(2.5));
        assert!(m.failed);
        assert!((m.width_hz.unwrap() - 2.5).abs() < 0.05);
    }

    #[test]
    fn test_doublet_lines_measured_separately() {
        let s = SyntheticSpectrum::new(5.0, 5.5, 0.0002)
            .multiplet(5.233, Multiplicity::Doublet, 3.8, 1.0, 1.0)
            .build("glc")
            .unwrap();
        let m = estimator(0.5, Multiplicity::Doublet, (5.2, 5.3)).estimate(&s);
        let w = m.width_hz.unwrap();
        assert!((w - 1.0).abs() < 0.1, "width {w}");
        assert!((m.peak_ppm.unwrap() - 5.233).abs() < 1e-4);
    }

    #[test]
    fn test_missing_peak_fails_without_width() {
        let s = SyntheticSpectrum::new(-0.3, 0.3, 0.0002)
            .noise(0.001, 5)
            .build("empty")
            .unwrap();
        let m = estimator(0.5, Multiplicity::Singlet, (-0.1, 0.1)).estimate(&s);
        assert!(m.failed);
        assert_eq!(m.width_hz, None);
    }

    #[test]
    fn test_crossing_respects_limit() {
        let s = Spectrum::new("s", vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 1.0, 0.8, 0.7], 600.0).unwrap();
        let apex = PeakLine {
            index: 1,
            ppm: 1.0,
            height: 1.0,
        };
        assert!((crossing(&s, &apex, 0.5, Side::Left, f64::NEG_INFINITY).unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(crossing(&s, &apex, 0.5, Side::Right, f64::INFINITY), None);
        assert_eq!(crossing(&s, &apex, 0.5, Side::Left, 0.5), None);
    }

    #[test]
    fn test_crossing_above_sampled_maximum() {
        // refined apex sits between samples and above both of them
        let s = Spectrum::new("s", vec![0.0, 1.0, 2.0, 3.0], vec![0.2, 0.9, 0.9, 0.2], 600.0).unwrap();
        let apex = PeakLine {
            index: 1,
            ppm: 1.5,
            height: 1.0,
        };
        let left = crossing(&s, &apex, 0.95, Side::Left, f64::NEG_INFINITY).unwrap();
        let right = crossing(&s, &apex, 0.95, Side::Right, f64::INFINITY).unwrap();
        assert!((left - 1.25).abs() < 1e-12, "left {left}");
        assert!((right - 1.75).abs() < 1e-12, "right {right}");
    }

    #[test]
    fn test_high_fraction_on_coarse_grid_stays_positive() {
        // hwhm of 1 Hz at 600 MHz is below the 0.001 ppm sampling step
        let s = SyntheticSpectrum::new(-0.3, 0.3, 0.001)
            .singlet(0.0, 1.0, 1.0)
            .build("coarse")
            .unwrap();
        let widths: Vec<f64> = [0.9, 0.95, 0.99]
            .iter()
            .map(|&f| {
                let m = estimator(f, Multiplicity::Singlet, (-0.1, 0.1)).estimate(&s);
                assert!(!m.failed);
                m.width_hz.unwrap()
            })
            .collect();
        assert!(widths.iter().all(|&w| w > 0.0), "widths {widths:?}");
        assert!(widths[0] > widths[1] && widths[1] > widths[2], "widths {widths:?}");
        // analytic width at 0.9 is 1/3 Hz
        assert!(widths[0] < 0.34, "widths {widths:?}");
    }
}
