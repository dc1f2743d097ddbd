//! Standard operating procedure (SOP) for NMR quality control.
//!
//! The SOP is read from a JSON document using the document's own field
//! names, validated once, and then shared read-only by every component.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::data::filename::FilenameParser;
use crate::error::{QcError, Result};
use crate::spectrum::{PpmInterval, RegionSet};

// ---------------------------------------------------------------------------
// Closed vocabularies
// ---------------------------------------------------------------------------

/// Peak multiplicity patterns the peak locator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplicity {
    Singlet,
    Doublet,
    Triplet,
    Quartet,
}

impl Multiplicity {
    /// Number of resolved lines.
    pub fn lines(self) -> usize {
        match self {
            Multiplicity::Singlet => 1,
            Multiplicity::Doublet => 2,
            Multiplicity::Triplet => 3,
            Multiplicity::Quartet => 4,
        }
    }

    /// First-order (Pascal) relative line intensities, tallest line = 1.
    pub fn relative_heights(self) -> &'static [f64] {
        match self {
            Multiplicity::Singlet => &[1.0],
            Multiplicity::Doublet => &[1.0, 1.0],
            Multiplicity::Triplet => &[0.5, 1.0, 0.5],
            Multiplicity::Quartet => &[1.0 / 3.0, 1.0, 1.0, 1.0 / 3.0],
        }
    }
}

impl fmt::Display for Multiplicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Multiplicity::Singlet => "singlet",
            Multiplicity::Doublet => "doublet",
            Multiplicity::Triplet => "triplet",
            Multiplicity::Quartet => "quartet",
        };
        f.write_str(name)
    }
}

/// Reference signal used for chemical-shift calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignTo {
    Doublet,
    Singlet,
    None,
}

impl AlignTo {
    /// Multiplicity to search for, `None` when calibration is disabled.
    pub fn multiplicity(self) -> Option<Multiplicity> {
        match self {
            AlignTo::Doublet => Some(Multiplicity::Doublet),
            AlignTo::Singlet => Some(Multiplicity::Singlet),
            AlignTo::None => None,
        }
    }
}

/// Declared type of an analytical metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementType {
    Categorical,
    Continuous,
    Date,
}

// ---------------------------------------------------------------------------
// SopDocument – the on-disk shape
// ---------------------------------------------------------------------------

/// Mirror of the SOP JSON document. Unknown keys (`__comments`, …) are
/// ignored. Convert with `Sop::try_from` to get a validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SopDocument {
    pub bounds: PpmInterval,
    #[serde(rename = "variableSize")]
    pub variable_size: usize,
    #[serde(rename = "LWFailThreshold")]
    pub lw_fail_threshold: f64,
    #[serde(rename = "alignTo")]
    pub align_to: AlignTo,
    #[serde(rename = "calibrateTo")]
    pub calibrate_to: f64,
    #[serde(rename = "ppmSearchRange")]
    pub ppm_search_range: PpmInterval,
    #[serde(rename = "LWpeakRange")]
    pub lw_peak_range: PpmInterval,
    #[serde(rename = "LWpeakMultiplicity")]
    pub lw_peak_multiplicity: Multiplicity,
    #[serde(rename = "LWpeakIntesityFraction")]
    pub lw_peak_intensity_fraction: f64,
    pub baseline_alpha: f64,
    pub baseline_threshold: f64,
    #[serde(rename = "baselineCheckRegion")]
    pub baseline_check_region: Vec<PpmInterval>,
    #[serde(rename = "solventPeakCheckRegion")]
    pub solvent_peak_check_region: Vec<PpmInterval>,
    #[serde(rename = "exclusionRegions", default)]
    pub exclusion_regions: Vec<PpmInterval>,
    #[serde(rename = "analyticalMeasurements", default)]
    pub analytical_measurements: BTreeMap<String, MeasurementType>,
    #[serde(rename = "excludeFromPlotting", default)]
    pub exclude_from_plotting: BTreeSet<String>,
    #[serde(rename = "sampleMetadataNotExported", default)]
    pub sample_metadata_not_exported: BTreeSet<String>,
    #[serde(rename = "featureMetadataNotExported", default)]
    pub feature_metadata_not_exported: BTreeSet<String>,

    #[serde(rename = "spectrometerFrequency", default = "default_frequency")]
    pub spectrometer_frequency: f64,
    #[serde(rename = "peakNoiseFactor", default = "default_noise_factor")]
    pub peak_noise_factor: f64,
    #[serde(rename = "solventNoiseFactor", default = "default_noise_factor")]
    pub solvent_noise_factor: f64,
    #[serde(rename = "couplingRangeHz", default = "default_coupling_range")]
    pub coupling_range_hz: [f64; 2],
    #[serde(rename = "rsdThreshold", default)]
    pub rsd_threshold: Option<f64>,
    #[serde(rename = "filenameSpec", default)]
    pub filename_spec: Option<String>,
}

fn default_frequency() -> f64 {
    600.0
}

fn default_noise_factor() -> f64 {
    10.0
}

fn default_coupling_range() -> [f64; 2] {
    [1.0, 20.0]
}

impl Default for SopDocument {
    /// Blood plasma defaults: glucose anomeric doublet for calibration,
    /// TSP singlet for line width.
    fn default() -> Self {
        let interval = PpmInterval::ordered;
        SopDocument {
            bounds: interval(-1.0, 10.0),
            variable_size: 20000,
            lw_fail_threshold: 1.4,
            align_to: AlignTo::Doublet,
            calibrate_to: 5.233,
            ppm_search_range: interval(5.15, 5.35),
            lw_peak_range: interval(-0.1, 0.1),
            lw_peak_multiplicity: Multiplicity::Singlet,
            lw_peak_intensity_fraction: 0.5,
            baseline_alpha: 0.05,
            baseline_threshold: 95.0,
            baseline_check_region: vec![interval(-1.0, -0.5), interval(9.5, 10.0)],
            solvent_peak_check_region: vec![interval(4.6, 4.7), interval(4.85, 4.95)],
            exclusion_regions: vec![interval(-0.2, 0.2), interval(4.6, 5.0)],
            analytical_measurements: BTreeMap::new(),
            exclude_from_plotting: BTreeSet::new(),
            sample_metadata_not_exported: BTreeSet::new(),
            feature_metadata_not_exported: BTreeSet::new(),
            spectrometer_frequency: default_frequency(),
            peak_noise_factor: default_noise_factor(),
            solvent_noise_factor: default_noise_factor(),
            coupling_range_hz: default_coupling_range(),
            rsd_threshold: None,
            filename_spec: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sop – validated configuration
// ---------------------------------------------------------------------------

/// Validated, immutable SOP. Build it with [`Sop::load`], [`Sop::from_json`]
/// or `Sop::try_from(SopDocument)`; pass it by reference.
#[derive(Debug, Clone)]
pub struct Sop {
    pub bounds: PpmInterval,
    pub variable_size: usize,
    pub lw_fail_threshold: f64,
    pub align_to: AlignTo,
    pub calibrate_to: f64,
    pub ppm_search_range: PpmInterval,
    pub lw_peak_range: PpmInterval,
    pub lw_peak_multiplicity: Multiplicity,
    pub lw_peak_intensity_fraction: f64,
    pub baseline_alpha: f64,
    /// Percentile in `[0, 100]`.
    pub baseline_threshold: f64,
    pub baseline_check_region: RegionSet,
    pub solvent_peak_check_region: RegionSet,
    /// Clipped to `bounds`.
    pub exclusion_regions: RegionSet,
    pub analytical_measurements: BTreeMap<String, MeasurementType>,
    pub exclude_from_plotting: BTreeSet<String>,
    pub sample_metadata_not_exported: BTreeSet<String>,
    pub feature_metadata_not_exported: BTreeSet<String>,
    pub spectrometer_frequency: f64,
    pub peak_noise_factor: f64,
    pub solvent_noise_factor: f64,
    /// Accepted J-coupling range in Hz, low then high.
    pub coupling_range_hz: (f64, f64),
    pub rsd_threshold: Option<f64>,
    pub filename_parser: Option<FilenameParser>,
}

impl Sop {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let sop = Sop::from_json(&text)?;
        info!("loaded SOP from {}", path.display());
        Ok(sop)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let document: SopDocument =
            serde_json::from_str(text).map_err(|e| QcError::config(e.to_string()))?;
        Sop::try_from(document)
    }

    /// Width of one feature bin in ppm.
    pub fn bin_width(&self) -> f64 {
        self.bounds.width() / self.variable_size as f64
    }

    /// Centre of feature bin `k`.
    pub fn bin_center(&self, k: usize) -> f64 {
        self.bounds.low() + (k as f64 + 0.5) * self.bin_width()
    }
}

fn require(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(QcError::config(msg()))
    }
}

fn regions_within(name: &str, regions: &[PpmInterval], bounds: &PpmInterval) -> Result<RegionSet> {
    if regions.is_empty() {
        warn!("{name} lists no regions; that check always passes");
    }
    for region in regions {
        require(region.within(bounds), || {
            format!("{name} region {region} lies outside bounds {bounds}")
        })?;
    }
    Ok(RegionSet::new(regions.to_vec()))
}

impl TryFrom<SopDocument> for Sop {
    type Error = QcError;

    fn try_from(doc: SopDocument) -> Result<Self> {
        let bounds = doc.bounds;
        require(bounds.width() > 0.0, || format!("bounds {bounds} are empty"))?;
        require(doc.variable_size > 0, || "variableSize must be positive".into())?;
        require(doc.lw_fail_threshold.is_finite() && doc.lw_fail_threshold > 0.0, || {
            format!("LWFailThreshold {} must be positive", doc.lw_fail_threshold)
        })?;
        require(
            doc.lw_peak_intensity_fraction > 0.0 && doc.lw_peak_intensity_fraction < 1.0,
            || {
                format!(
                    "LWpeakIntesityFraction {} must lie in (0, 1)",
                    doc.lw_peak_intensity_fraction
                )
            },
        )?;
        require(doc.baseline_alpha > 0.0 && doc.baseline_alpha <= 1.0, || {
            format!("baseline_alpha {} must lie in (0, 1]", doc.baseline_alpha)
        })?;
        require((0.0..=100.0).contains(&doc.baseline_threshold), || {
            format!("baseline_threshold {} must be a percentile", doc.baseline_threshold)
        })?;
        require(doc.spectrometer_frequency > 0.0, || {
            format!("spectrometerFrequency {} must be positive", doc.spectrometer_frequency)
        })?;
        require(doc.peak_noise_factor > 0.0 && doc.solvent_noise_factor > 0.0, || {
            "noise factors must be positive".into()
        })?;
        let [j_low, j_high] = doc.coupling_range_hz;
        require(j_low > 0.0 && j_low < j_high, || {
            format!("couplingRangeHz [{j_low}, {j_high}] is not an increasing positive range")
        })?;
        if let Some(rsd) = doc.rsd_threshold {
            require(rsd > 0.0, || format!("rsdThreshold {rsd} must be positive"))?;
        }

        require(doc.ppm_search_range.within(&bounds), || {
            format!("ppmSearchRange {} lies outside bounds {bounds}", doc.ppm_search_range)
        })?;
        require(doc.lw_peak_range.within(&bounds), || {
            format!("LWpeakRange {} lies outside bounds {bounds}", doc.lw_peak_range)
        })?;
        if doc.align_to != AlignTo::None {
            require(doc.ppm_search_range.contains(doc.calibrate_to), || {
                format!(
                    "calibrateTo {} must lie inside ppmSearchRange {} when aligning to a {:?}",
                    doc.calibrate_to, doc.ppm_search_range, doc.align_to
                )
            })?;
        }

        let baseline_check_region =
            regions_within("baselineCheckRegion", &doc.baseline_check_region, &bounds)?;
        let solvent_peak_check_region =
            regions_within("solventPeakCheckRegion", &doc.solvent_peak_check_region, &bounds)?;

        let mut exclusions = Vec::with_capacity(doc.exclusion_regions.len());
        for region in &doc.exclusion_regions {
            match region.clip(&bounds) {
                Some(clipped) => exclusions.push(clipped),
                None => warn!("exclusion region {region} lies outside bounds {bounds}; ignored"),
            }
        }

        let filename_parser = doc
            .filename_spec
            .as_deref()
            .map(FilenameParser::new)
            .transpose()?;

        Ok(Sop {
            bounds,
            variable_size: doc.variable_size,
            lw_fail_threshold: doc.lw_fail_threshold,
            align_to: doc.align_to,
            calibrate_to: doc.calibrate_to,
            ppm_search_range: doc.ppm_search_range,
            lw_peak_range: doc.lw_peak_range,
            lw_peak_multiplicity: doc.lw_peak_multiplicity,
            lw_peak_intensity_fraction: doc.lw_peak_intensity_fraction,
            baseline_alpha: doc.baseline_alpha,
            baseline_threshold: doc.baseline_threshold,
            baseline_check_region,
            solvent_peak_check_region,
            exclusion_regions: RegionSet::new(exclusions),
            analytical_measurements: doc.analytical_measurements,
            exclude_from_plotting: doc.exclude_from_plotting,
            sample_metadata_not_exported: doc.sample_metadata_not_exported,
            feature_metadata_not_exported: doc.feature_metadata_not_exported,
            spectrometer_frequency: doc.spectrometer_frequency,
            peak_noise_factor: doc.peak_noise_factor,
            solvent_noise_factor: doc.solvent_noise_factor,
            coupling_range_hz: (j_low, j_high),
            rsd_threshold: doc.rsd_threshold,
            filename_parser,
        })
    }
}
