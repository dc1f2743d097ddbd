//! Synthetic NMR spectra: Lorentzian lines, multiplets, broad baseline
//! humps and reproducible Gaussian noise. Used by the demo generator and
//! by the tests.

use std::collections::BTreeMap;

use crate::data::model::{MetadataValue, RawSpectrum, SAMPLE_ID_COLUMN};
use crate::error::Result;
use crate::sop::Multiplicity;
use crate::spectrum::Spectrum;

/// Lorentzian line with half width at half maximum `hwhm`.
pub fn lorentzian(x: f64, center: f64, hwhm: f64, height: f64) -> f64 {
    let u = (x - center) / hwhm;
    height / (1.0 + u * u)
}

pub fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// Minimal deterministic PRNG (xoshiro256**)
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    pub fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

#[derive(Debug, Clone, Copy)]
struct Line {
    center: f64,
    width_hz: f64,
    height: f64,
}

/// Builder for a synthetic spectrum on a uniform ascending ppm grid.
#[derive(Debug, Clone)]
pub struct SyntheticSpectrum {
    low: f64,
    high: f64,
    step: f64,
    frequency_mhz: f64,
    lines: Vec<Line>,
    humps: Vec<(f64, f64, f64)>,
    noise: f64,
    seed: u64,
}

impl SyntheticSpectrum {
    pub fn new(low: f64, high: f64, step: f64) -> Self {
        SyntheticSpectrum {
            low,
            high,
            step,
            frequency_mhz: 600.0,
            lines: Vec::new(),
            humps: Vec::new(),
            noise: 0.0,
            seed: 0,
        }
    }

    /// Blood-plasma-like spectrum over [-1, 10] ppm: TSP singlet at 0 ppm,
    /// glucose anomeric doublet at `glucose_ppm`, lactate doublet,
    /// creatinine singlet, alanine doublet and white noise.
    pub fn plasma(glucose_ppm: f64, tsp_width_hz: f64, seed: u64) -> Self {
        SyntheticSpectrum::new(-1.0, 10.0, 0.0002)
            .singlet(0.0, tsp_width_hz, 1.0)
            .multiplet(glucose_ppm, Multiplicity::Doublet, 3.8, 1.0, 0.5)
            .multiplet(1.33, Multiplicity::Doublet, 6.9, 1.2, 0.6)
            .singlet(3.04, 1.0, 0.3)
            .multiplet(1.48, Multiplicity::Doublet, 7.2, 1.2, 0.15)
            .noise(0.0005, seed)
    }

    pub fn frequency(mut self, mhz: f64) -> Self {
        self.frequency_mhz = mhz;
        self
    }

    /// Single Lorentzian line; `width_hz` is the full width at half height.
    pub fn singlet(mut self, ppm: f64, width_hz: f64, height: f64) -> Self {
        self.lines.push(Line {
            center: ppm,
            width_hz,
            height,
        });
        self
    }

    /// First-order multiplet centred on `ppm`; the tallest line has `height`.
    pub fn multiplet(
        mut self,
        ppm: f64,
        multiplicity: Multiplicity,
        coupling_hz: f64,
        width_hz: f64,
        height: f64,
    ) -> Self {
        let j = coupling_hz / self.frequency_mhz;
        let n = multiplicity.lines();
        for (k, rel) in multiplicity.relative_heights().iter().enumerate() {
            let offset = (k as f64 - (n - 1) as f64 / 2.0) * j;
            self.lines.push(Line {
                center: ppm + offset,
                width_hz,
                height: height * rel,
            });
        }
        self
    }

    /// Broad Gaussian baseline distortion.
    pub fn hump(mut self, ppm: f64, sigma_ppm: f64, height: f64) -> Self {
        self.humps.push((ppm, sigma_ppm, height));
        self
    }

    pub fn noise(mut self, sigma: f64, seed: u64) -> Self {
        self.noise = sigma;
        self.seed = seed;
        self
    }

    pub fn axis(&self) -> Vec<f64> {
        let n = ((self.high - self.low) / self.step).round() as usize + 1;
        (0..n).map(|i| self.low + i as f64 * self.step).collect()
    }

    pub fn intensities(&self) -> Vec<f64> {
        let mut rng = SimpleRng::new(self.seed);
        self.axis()
            .iter()
            .map(|&x| {
                let lines: f64 = self
                    .lines
                    .iter()
                    .map(|l| lorentzian(x, l.center, 0.5 * l.width_hz / self.frequency_mhz, l.height))
                    .sum();
                let humps: f64 = self
                    .humps
                    .iter()
                    .map(|&(mu, sigma, amp)| gaussian(x, mu, sigma, amp))
                    .sum();
                let noise = if self.noise > 0.0 {
                    rng.gauss(0.0, self.noise)
                } else {
                    0.0
                };
                lines + humps + noise
            })
            .collect()
    }

    pub fn build(&self, sample_id: &str) -> Result<Spectrum> {
        Spectrum::new(sample_id, self.axis(), self.intensities(), self.frequency_mhz)
    }

    /// Unvalidated record carrying `metadata` plus the sample identifier.
    pub fn raw(&self, sample_id: &str, mut metadata: BTreeMap<String, MetadataValue>) -> RawSpectrum {
        metadata.insert(
            SAMPLE_ID_COLUMN.to_string(),
            MetadataValue::String(sample_id.to_string()),
        );
        RawSpectrum {
            x: self.axis(),
            y: self.intensities(),
            metadata,
            row: 0,
        }
    }
}
