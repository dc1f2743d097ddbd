use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::data::model::{MetadataValue, RawSpectrum};
use crate::error::{QcError, Result};
use crate::stats;

// ---------------------------------------------------------------------------
// PpmInterval – closed chemical-shift interval
// ---------------------------------------------------------------------------

/// A closed `[low, high]` interval on the ppm axis.
///
/// Deserialized from a two-element array; reversed pairs (the usual
/// high-to-low NMR convention) are normalised on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct PpmInterval {
    low: f64,
    high: f64,
}

impl PpmInterval {
    pub fn new(a: f64, b: f64) -> Result<Self> {
        if !a.is_finite() || !b.is_finite() {
            return Err(QcError::config(format!("ppm interval [{a}, {b}] is not finite")));
        }
        Ok(PpmInterval {
            low: a.min(b),
            high: a.max(b),
        })
    }

    /// Literal constructor; the caller guarantees `low <= high`, both finite.
    pub(crate) const fn ordered(low: f64, high: f64) -> Self {
        PpmInterval { low, high }
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.low + self.high)
    }

    pub fn contains(&self, ppm: f64) -> bool {
        ppm >= self.low && ppm <= self.high
    }

    pub fn within(&self, outer: &PpmInterval) -> bool {
        self.low >= outer.low && self.high <= outer.high
    }

    /// Intersection with `outer`, `None` when they do not overlap.
    pub fn clip(&self, outer: &PpmInterval) -> Option<PpmInterval> {
        let low = self.low.max(outer.low);
        let high = self.high.min(outer.high);
        (low <= high).then_some(PpmInterval { low, high })
    }
}

impl TryFrom<[f64; 2]> for PpmInterval {
    type Error = QcError;

    fn try_from(pair: [f64; 2]) -> Result<Self> {
        PpmInterval::new(pair[0], pair[1])
    }
}

impl From<PpmInterval> for [f64; 2] {
    fn from(interval: PpmInterval) -> Self {
        [interval.low, interval.high]
    }
}

impl fmt::Display for PpmInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3}] ppm", self.low, self.high)
    }
}

// ---------------------------------------------------------------------------
// RegionSet – ordered, immutable list of intervals with union semantics
// ---------------------------------------------------------------------------

/// An ordered set of ppm intervals. Overlaps are allowed; membership and
/// [`RegionSet::merged`] treat the set as the union of its intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<PpmInterval>", into = "Vec<PpmInterval>")]
pub struct RegionSet(Vec<PpmInterval>);

impl From<Vec<PpmInterval>> for RegionSet {
    fn from(intervals: Vec<PpmInterval>) -> Self {
        RegionSet::new(intervals)
    }
}

impl From<RegionSet> for Vec<PpmInterval> {
    fn from(set: RegionSet) -> Self {
        set.0
    }
}

impl RegionSet {
    pub fn new(mut intervals: Vec<PpmInterval>) -> Self {
        intervals.sort_by(|a, b| a.low.total_cmp(&b.low).then(a.high.total_cmp(&b.high)));
        RegionSet(intervals)
    }

    pub fn intervals(&self) -> &[PpmInterval] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ppm: f64) -> bool {
        self.0.iter().any(|r| r.contains(ppm))
    }

    /// Overlapping or touching intervals collapsed into disjoint ones.
    pub fn merged(&self) -> Vec<PpmInterval> {
        let mut out: Vec<PpmInterval> = Vec::with_capacity(self.0.len());
        for interval in &self.0 {
            match out.last_mut() {
                Some(last) if interval.low <= last.high => {
                    last.high = last.high.max(interval.high);
                }
                _ => out.push(*interval),
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Spectrum – validated, immutable 1D NMR spectrum
// ---------------------------------------------------------------------------

/// A validated spectrum on an ascending ppm axis.
///
/// Never mutated after construction; calibration goes through
/// [`Spectrum::shifted`], which returns a new value.
#[derive(Debug, Clone)]
pub struct Spectrum {
    sample_id: String,
    ppm: Vec<f64>,
    intensity: Vec<f64>,
    frequency_mhz: f64,
    noise_sigma: f64,
    metadata: BTreeMap<String, MetadataValue>,
}

impl Spectrum {
    pub fn new(
        sample_id: impl Into<String>,
        mut ppm: Vec<f64>,
        mut intensity: Vec<f64>,
        frequency_mhz: f64,
    ) -> Result<Self> {
        let sample_id = sample_id.into();
        if ppm.len() != intensity.len() {
            return Err(QcError::malformed(
                &sample_id,
                format!("{} ppm values but {} intensities", ppm.len(), intensity.len()),
            ));
        }
        if ppm.len() < 3 {
            return Err(QcError::malformed(&sample_id, "fewer than 3 points"));
        }
        if ppm.iter().chain(intensity.iter()).any(|v| !v.is_finite()) {
            return Err(QcError::malformed(&sample_id, "non-finite ppm or intensity values"));
        }
        if !(frequency_mhz.is_finite() && frequency_mhz > 0.0) {
            return Err(QcError::malformed(
                &sample_id,
                format!("invalid spectrometer frequency {frequency_mhz} MHz"),
            ));
        }

        // Bruker axes run high to low; store ascending.
        if ppm[0] > ppm[ppm.len() - 1] {
            ppm.reverse();
            intensity.reverse();
        }
        if ppm.windows(2).any(|w| w[1] <= w[0]) {
            return Err(QcError::malformed(&sample_id, "ppm axis is not strictly monotonic"));
        }

        let noise_sigma = stats::difference_noise(&intensity).unwrap_or(0.0);
        Ok(Spectrum {
            sample_id,
            ppm,
            intensity,
            frequency_mhz,
            noise_sigma,
            metadata: BTreeMap::new(),
        })
    }

    /// Validate a loaded record. The frequency comes from the record's
    /// `SF` metadata when present, else `default_frequency_mhz`.
    pub fn from_raw(raw: RawSpectrum, default_frequency_mhz: f64) -> Result<Self> {
        let sample_id = raw.sample_id();
        let frequency = raw
            .metadata
            .get(crate::data::model::FREQUENCY_COLUMN)
            .and_then(MetadataValue::as_f64)
            .unwrap_or(default_frequency_mhz);
        let spectrum = Spectrum::new(sample_id, raw.x, raw.y, frequency)?;
        Ok(spectrum.with_metadata(raw.metadata))
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, MetadataValue>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn ppm(&self) -> &[f64] {
        &self.ppm
    }

    pub fn intensity(&self) -> &[f64] {
        &self.intensity
    }

    pub fn frequency_mhz(&self) -> f64 {
        self.frequency_mhz
    }

    /// White-noise sigma estimated once at construction.
    pub fn noise_sigma(&self) -> f64 {
        self.noise_sigma
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.ppm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ppm.is_empty()
    }

    pub fn hz_to_ppm(&self, hz: f64) -> f64 {
        hz / self.frequency_mhz
    }

    pub fn ppm_to_hz(&self, ppm: f64) -> f64 {
        ppm * self.frequency_mhz
    }

    /// Index range of the points whose ppm lies inside `interval`.
    pub fn index_range(&self, interval: &PpmInterval) -> Range<usize> {
        let start = self.ppm.partition_point(|&p| p < interval.low());
        let end = self.ppm.partition_point(|&p| p <= interval.high());
        start..end.max(start)
    }

    /// Intensities inside `interval`.
    pub fn slice(&self, interval: &PpmInterval) -> &[f64] {
        &self.intensity[self.index_range(interval)]
    }

    /// Axis extent as an interval.
    pub fn extent(&self) -> PpmInterval {
        PpmInterval {
            low: self.ppm[0],
            high: self.ppm[self.ppm.len() - 1],
        }
    }

    /// Fails with `MalformedSpectrum` unless the axis spans `bounds`,
    /// allowing half a point of slack at either end.
    pub fn ensure_covers(&self, bounds: &PpmInterval) -> Result<()> {
        let extent = self.extent();
        let slack = 0.5 * extent.width() / (self.len() - 1) as f64;
        if extent.low() > bounds.low() + slack || extent.high() < bounds.high() - slack {
            return Err(QcError::malformed(
                &self.sample_id,
                format!("spectrum covers {extent}, required {bounds}"),
            ));
        }
        Ok(())
    }

    /// Linear interpolation of the intensity at `ppm`, clamped at the ends.
    pub fn interpolate(&self, ppm: f64) -> f64 {
        let idx = self.ppm.partition_point(|&p| p < ppm);
        if idx == 0 {
            return self.intensity[0];
        }
        if idx >= self.ppm.len() {
            return self.intensity[self.ppm.len() - 1];
        }
        let (x0, x1) = (self.ppm[idx - 1], self.ppm[idx]);
        let (y0, y1) = (self.intensity[idx - 1], self.intensity[idx]);
        y0 + (ppm - x0) * (y1 - y0) / (x1 - x0)
    }

    /// New spectrum with every ppm value moved by `shift`.
    pub fn shifted(&self, shift: f64) -> Spectrum {
        Spectrum {
            ppm: self.ppm.iter().map(|p| p + shift).collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Spectrum {
        let ppm: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let intensity: Vec<f64> = (0..11).map(|i| 2.0 * i as f64).collect();
        Spectrum::new("ramp", ppm, intensity, 600.0).unwrap()
    }

    #[test]
    fn test_interval_normalises_reversed_pair() {
        let interval: PpmInterval = serde_json::from_str("[10.0, -1.0]").unwrap();
        assert_eq!(interval.low(), -1.0);
        assert_eq!(interval.high(), 10.0);
        assert!(serde_json::from_str::<PpmInterval>("[1.0]").is_err());
    }

    #[test]
    fn test_region_set_union() {
        let set = RegionSet::new(vec![
            PpmInterval::new(4.8, 5.0).unwrap(),
            PpmInterval::new(4.6, 4.9).unwrap(),
            PpmInterval::new(-0.2, 0.2).unwrap(),
        ]);
        let merged = set.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], PpmInterval::new(4.6, 5.0).unwrap());
        assert!(set.contains(4.95));
        assert!(!set.contains(1.0));
    }

    #[test]
    fn test_descending_axis_is_reversed() {
        let s = Spectrum::new("s", vec![3.0, 2.0, 1.0], vec![30.0, 20.0, 10.0], 600.0).unwrap();
        assert_eq!(s.ppm(), &[1.0, 2.0, 3.0]);
        assert_eq!(s.intensity(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert!(matches!(
            Spectrum::new("a", vec![1.0, 2.0], vec![1.0], 600.0),
            Err(QcError::MalformedSpectrum { .. })
        ));
        assert!(Spectrum::new("b", vec![1.0, 1.0, 2.0], vec![0.0; 3], 600.0).is_err());
        assert!(Spectrum::new("c", vec![1.0, 2.0, 3.0], vec![0.0, f64::NAN, 0.0], 600.0).is_err());
    }

    #[test]
    fn test_index_range_and_interpolate() {
        let s = ramp();
        let range = s.index_range(&PpmInterval::new(2.5, 5.0).unwrap());
        assert_eq!(range, 3..6);
        assert!((s.interpolate(2.5) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_coverage() {
        let s = ramp();
        assert!(s.ensure_covers(&PpmInterval::new(0.0, 10.0).unwrap()).is_ok());
        assert!(s.ensure_covers(&PpmInterval::new(-1.0, 10.0).unwrap()).is_err());
    }

    #[test]
    fn test_shift_preserves_original() {
        let s = ramp();
        let shifted = s.shifted(0.5);
        assert_eq!(s.ppm()[0], 0.0);
        assert_eq!(shifted.ppm()[0], 0.5);
        assert_eq!(shifted.intensity(), s.intensity());
    }
}
