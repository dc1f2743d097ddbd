use std::ops::Range;

use log::debug;
use serde::Serialize;

use crate::error::{QcError, Result};
use crate::sop::{Multiplicity, Sop};
use crate::spectrum::{PpmInterval, Spectrum};
use crate::stats;

/// Lines of a multiplet may differ from their first-order intensity ratio
/// by at most this factor in either direction.
const HEIGHT_RATIO_TOLERANCE: f64 = 0.5;

/// A line may sit this fraction of the coupling away from its ideal slot.
const SPACING_TOLERANCE: f64 = 0.2;

/// One resolved local maximum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeakLine {
    /// Index of the sampled apex in the spectrum.
    pub index: usize,
    /// Apex position after parabolic refinement.
    pub ppm: f64,
    /// Apex height after parabolic refinement.
    pub height: f64,
}

/// A located reference signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedPeak {
    pub multiplicity: Multiplicity,
    /// Mean position of the lines.
    pub centroid_ppm: f64,
    /// Lines in ascending ppm order.
    pub lines: Vec<PeakLine>,
    /// Mean line spacing, `None` for a singlet.
    pub coupling_hz: Option<f64>,
}

// ---------------------------------------------------------------------------
// PeakLocator
// ---------------------------------------------------------------------------

/// Finds singlets and first-order multiplets inside a ppm window.
///
/// Local maxima count only when both their height above the window median
/// and their topographic prominence exceed `noise_factor` noise sigmas.
/// Candidates are tried from the tallest down (ties: closest to the window
/// midpoint) and the first one completing the requested pattern wins.
#[derive(Debug, Clone, Copy)]
pub struct PeakLocator {
    noise_factor: f64,
    coupling_range_hz: (f64, f64),
}

impl PeakLocator {
    pub fn new(noise_factor: f64, coupling_range_hz: (f64, f64)) -> Self {
        PeakLocator {
            noise_factor,
            coupling_range_hz,
        }
    }

    pub fn from_sop(sop: &Sop) -> Self {
        PeakLocator::new(sop.peak_noise_factor, sop.coupling_range_hz)
    }

    pub fn locate(
        &self,
        spectrum: &Spectrum,
        window: &PpmInterval,
        multiplicity: Multiplicity,
    ) -> Result<LocatedPeak> {
        let mut candidates = self.local_maxima(spectrum, window);
        rank_candidates(&mut candidates, window);
        debug!(
            "{}: {} candidate maxima in {window}",
            spectrum.sample_id(),
            candidates.len()
        );

        let j_min = spectrum.hz_to_ppm(self.coupling_range_hz.0);
        let j_max = spectrum.hz_to_ppm(self.coupling_range_hz.1);

        for candidate in &candidates {
            let lines = match multiplicity {
                Multiplicity::Singlet => match_singlet(candidate, &candidates, j_max),
                _ => match_multiplet(candidate, &candidates, multiplicity, j_min, j_max),
            };
            if let Some(lines) = lines {
                return Ok(LocatedPeak::from_lines(multiplicity, lines, spectrum));
            }
        }

        Err(QcError::PeakNotFound {
            multiplicity: multiplicity.to_string(),
            low: window.low(),
            high: window.high(),
        })
    }

    /// Local maxima inside `window` that stand out of the noise.
    pub fn local_maxima(&self, spectrum: &Spectrum, window: &PpmInterval) -> Vec<PeakLine> {
        let range = spectrum.index_range(window);
        if range.len() < 3 {
            return Vec::new();
        }
        let x = spectrum.ppm();
        let y = spectrum.intensity();
        let baseline = stats::median(&y[range.clone()]).unwrap_or(0.0);
        let floor = self.noise_factor * spectrum.noise_sigma();

        let start = range.start.max(1);
        let end = range.end.min(y.len() - 1);
        (start..end)
            .filter(|&i| y[i] > y[i - 1] && y[i] >= y[i + 1])
            .filter(|&i| y[i] - baseline > floor)
            .filter(|&i| prominence(y, i, range.clone()) > floor)
            .map(|i| refine_apex(x, y, i))
            .collect()
    }
}

impl LocatedPeak {
    fn from_lines(multiplicity: Multiplicity, lines: Vec<PeakLine>, spectrum: &Spectrum) -> Self {
        let n = lines.len() as f64;
        let centroid_ppm = lines.iter().map(|l| l.ppm).sum::<f64>() / n;
        let coupling_hz = (lines.len() > 1).then(|| {
            let span = lines[lines.len() - 1].ppm - lines[0].ppm;
            spectrum.ppm_to_hz(span / (n - 1.0))
        });
        LocatedPeak {
            multiplicity,
            centroid_ppm,
            lines,
            coupling_hz,
        }
    }
}

/// Tallest first; equal heights go to the one nearer the window midpoint.
fn rank_candidates(candidates: &mut [PeakLine], window: &PpmInterval) {
    let mid = window.midpoint();
    candidates.sort_by(|a, b| {
        b.height
            .total_cmp(&a.height)
            .then((a.ppm - mid).abs().total_cmp(&(b.ppm - mid).abs()))
    });
}

/// Height of the apex above the higher of the two minima separating it
/// from taller signal (or the window edge) on either side.
fn prominence(y: &[f64], apex: usize, range: Range<usize>) -> f64 {
    let h = y[apex];
    let mut left_min = h;
    for j in (range.start..apex).rev() {
        if y[j] > h {
            break;
        }
        left_min = left_min.min(y[j]);
    }
    let mut right_min = h;
    for j in apex + 1..range.end {
        if y[j] > h {
            break;
        }
        right_min = right_min.min(y[j]);
    }
    h - left_min.max(right_min)
}

/// Parabola through the apex and its neighbours.
fn refine_apex(x: &[f64], y: &[f64], i: usize) -> PeakLine {
    let (a, b, c) = (y[i - 1], y[i], y[i + 1]);
    let denom = a - 2.0 * b + c;
    if denom >= 0.0 {
        return PeakLine {
            index: i,
            ppm: x[i],
            height: b,
        };
    }
    let delta = (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
    let ppm = if delta >= 0.0 {
        x[i] + delta * (x[i + 1] - x[i])
    } else {
        x[i] + delta * (x[i] - x[i - 1])
    };
    PeakLine {
        index: i,
        ppm,
        height: b - 0.25 * (a - c) * delta,
    }
}

/// A singlet has no comparable neighbour within the largest coupling.
fn match_singlet(candidate: &PeakLine, all: &[PeakLine], j_max: f64) -> Option<Vec<PeakLine>> {
    let rival = all.iter().any(|other| {
        other.index != candidate.index
            && (other.ppm - candidate.ppm).abs() <= j_max
            && other.height >= HEIGHT_RATIO_TOLERANCE * candidate.height
    });
    (!rival).then(|| vec![*candidate])
}

/// Build an evenly spaced ladder of `multiplicity.lines()` maxima that
/// contains `candidate`, trying each neighbour as the adjacent line.
fn match_multiplet(
    candidate: &PeakLine,
    all: &[PeakLine],
    multiplicity: Multiplicity,
    j_min: f64,
    j_max: f64,
) -> Option<Vec<PeakLine>> {
    let n = multiplicity.lines();
    let mut partners: Vec<&PeakLine> = all
        .iter()
        .filter(|other| {
            let d = (other.ppm - candidate.ppm).abs();
            other.index != candidate.index
                && d >= j_min * (1.0 - SPACING_TOLERANCE)
                && d <= j_max * (1.0 + SPACING_TOLERANCE)
        })
        .collect();
    partners.sort_by(|a, b| {
        b.height.total_cmp(&a.height).then(
            (a.ppm - candidate.ppm)
                .abs()
                .total_cmp(&(b.ppm - candidate.ppm).abs()),
        )
    });

    for partner in partners {
        let j = (partner.ppm - candidate.ppm).abs();
        for slot in 0..n {
            let first = candidate.ppm - slot as f64 * j;
            if let Some(lines) = build_ladder(candidate, slot, first, j, n, all) {
                if heights_match(&lines, multiplicity.relative_heights()) {
                    return Some(lines);
                }
            }
        }
    }
    None
}

fn build_ladder(
    candidate: &PeakLine,
    slot: usize,
    first: f64,
    j: f64,
    n: usize,
    all: &[PeakLine],
) -> Option<Vec<PeakLine>> {
    let mut lines: Vec<PeakLine> = Vec::with_capacity(n);
    for k in 0..n {
        if k == slot {
            lines.push(*candidate);
            continue;
        }
        let target = first + k as f64 * j;
        let line = all
            .iter()
            .filter(|l| l.index != candidate.index && lines.iter().all(|u| u.index != l.index))
            .filter(|l| (l.ppm - target).abs() <= SPACING_TOLERANCE * j)
            .min_by(|a, b| (a.ppm - target).abs().total_cmp(&(b.ppm - target).abs()))?;
        lines.push(*line);
    }
    Some(lines)
}

fn heights_match(lines: &[PeakLine], expected: &[f64]) -> bool {
    let tallest = lines.iter().fold(f64::MIN, |m, l| m.max(l.height));
    if tallest <= 0.0 {
        return false;
    }
    lines.iter().zip(expected).all(|(line, &e)| {
        let ratio = line.height / tallest;
        ratio >= HEIGHT_RATIO_TOLERANCE * e && ratio <= e / HEIGHT_RATIO_TOLERANCE
    })
}
