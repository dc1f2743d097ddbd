//! Per-sample QC state machine and parallel batch dispatch.
//!
//! ```text
//!  Raw ──calibrate──▶ Calibrated ──check──▶ Checked ──mask──▶ Masked ──complete──▶ QcRecord
//!   │                               (line width ∥ regions)
//!   └─ MalformedSpectrum (no bounds coverage) ─▶ Rejection
//! ```
//!
//! Each transition consumes the previous state, so a sample can only move
//! forward and nothing is retried. Failing checks set flags; the only
//! per-sample error is a malformed spectrum.

use std::collections::{BTreeMap, HashSet};

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;

use super::calibrate::{CalibrationOutcome, Calibrator};
use super::linewidth::{LineWidthEstimator, LineWidthMeasurement};
use super::mask::{ExclusionMasker, FeatureVector};
use super::regions::{RegionCheck, RegionStatisticsChecker};
use crate::data::model::{MetadataValue, RawSpectrum};
use crate::error::Result;
use crate::sop::Sop;
use crate::spectrum::{PpmInterval, Spectrum};

// ---------------------------------------------------------------------------
// QC record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QcFlags {
    #[serde(rename = "CalibrationFail")]
    pub calibration: bool,
    #[serde(rename = "LineWidthFail")]
    pub line_width: bool,
    #[serde(rename = "BaselineFail")]
    pub baseline: bool,
    #[serde(rename = "SolventPeakFail")]
    pub solvent_peak: bool,
}

impl QcFlags {
    pub fn any(&self) -> bool {
        self.calibration || self.line_width || self.baseline || self.solvent_peak
    }
}

/// Everything measured for one structurally valid sample.
#[derive(Debug, Clone, Serialize)]
pub struct QcRecord {
    pub sample_id: String,
    #[serde(skip)]
    pub metadata: BTreeMap<String, MetadataValue>,
    #[serde(flatten)]
    pub flags: QcFlags,
    pub line_width_hz: Option<f64>,
    pub calibration_shift_ppm: f64,
    pub reference_ppm: Option<f64>,
    pub baseline: RegionCheck,
    pub solvent: RegionCheck,
    #[serde(skip)]
    pub features: FeatureVector,
}

impl QcRecord {
    pub fn passed(&self) -> bool {
        !self.flags.any()
    }
}

/// A sample kept out of aggregation, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub sample_id: String,
    #[serde(skip)]
    pub metadata: BTreeMap<String, MetadataValue>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Evaluated(QcRecord),
    Rejected(Rejection),
}

impl SampleOutcome {
    pub fn sample_id(&self) -> &str {
        match self {
            SampleOutcome::Evaluated(r) => &r.sample_id,
            SampleOutcome::Rejected(r) => &r.sample_id,
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        match self {
            SampleOutcome::Evaluated(r) => &r.metadata,
            SampleOutcome::Rejected(r) => &r.metadata,
        }
    }
}

/// Outcomes of a dispatched batch, in dispatch order.
#[derive(Debug, Clone)]
pub struct BatchEvaluation {
    pub dispatched: usize,
    pub outcomes: Vec<SampleOutcome>,
}

impl BatchEvaluation {
    pub fn records(&self) -> impl Iterator<Item = &QcRecord> {
        self.outcomes.iter().filter_map(|o| match o {
            SampleOutcome::Evaluated(r) => Some(r),
            SampleOutcome::Rejected(_) => None,
        })
    }

    pub fn rejections(&self) -> impl Iterator<Item = &Rejection> {
        self.outcomes.iter().filter_map(|o| match o {
            SampleOutcome::Rejected(r) => Some(r),
            SampleOutcome::Evaluated(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

pub struct Raw {
    pub spectrum: Spectrum,
}

pub struct Calibrated {
    pub spectrum: Spectrum,
    pub calibration: CalibrationOutcome,
}

pub struct Checked {
    pub spectrum: Spectrum,
    pub calibration: CalibrationOutcome,
    pub line_width: LineWidthMeasurement,
    pub baseline: RegionCheck,
    pub solvent: RegionCheck,
}

pub struct Masked {
    pub checked: Checked,
    pub features: FeatureVector,
}

/// A sample part-way through QC.
pub struct Evaluation<'a, S> {
    evaluator: &'a SampleQCEvaluator,
    state: S,
}

impl<S> Evaluation<'_, S> {
    pub fn state(&self) -> &S {
        &self.state
    }
}

// ---------------------------------------------------------------------------
// SampleQCEvaluator
// ---------------------------------------------------------------------------

/// The QC components configured from one SOP. Shared read-only by every
/// worker of a batch.
#[derive(Debug, Clone)]
pub struct SampleQCEvaluator {
    bounds: PpmInterval,
    default_frequency_mhz: f64,
    calibrator: Calibrator,
    line_width: LineWidthEstimator,
    baseline: RegionStatisticsChecker,
    solvent: RegionStatisticsChecker,
    masker: ExclusionMasker,
}

impl SampleQCEvaluator {
    pub fn from_sop(sop: &Sop) -> Self {
        SampleQCEvaluator {
            bounds: sop.bounds,
            default_frequency_mhz: sop.spectrometer_frequency,
            calibrator: Calibrator::from_sop(sop),
            line_width: LineWidthEstimator::from_sop(sop),
            baseline: RegionStatisticsChecker::baseline(sop),
            solvent: RegionStatisticsChecker::solvent(sop),
            masker: ExclusionMasker::from_sop(sop),
        }
    }

    /// Enter the `Raw` state. Fails with `MalformedSpectrum` when the
    /// spectrum does not cover the SOP bounds.
    pub fn start(&self, spectrum: Spectrum) -> Result<Evaluation<'_, Raw>> {
        spectrum.ensure_covers(&self.bounds)?;
        debug!("{}: raw", spectrum.sample_id());
        Ok(Evaluation {
            evaluator: self,
            state: Raw { spectrum },
        })
    }

    pub fn evaluate(&self, spectrum: Spectrum) -> Result<QcRecord> {
        Ok(self.start(spectrum)?.calibrate().check().mask().complete())
    }

    fn run(&self, job: Job) -> SampleOutcome {
        let raw = match job {
            Job::Duplicate(rejection) => return SampleOutcome::Rejected(rejection),
            Job::Evaluate(raw) => raw,
        };
        let sample_id = raw.sample_id();
        let metadata = raw.metadata.clone();
        let result = Spectrum::from_raw(raw, self.default_frequency_mhz)
            .and_then(|spectrum| self.evaluate(spectrum));
        match result {
            Ok(record) => SampleOutcome::Evaluated(record),
            Err(e) => {
                warn!("{sample_id}: rejected: {e}");
                SampleOutcome::Rejected(Rejection {
                    sample_id,
                    metadata,
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl<'a> Evaluation<'a, Raw> {
    pub fn calibrate(self) -> Evaluation<'a, Calibrated> {
        let calibration = self.evaluator.calibrator.calibrate(self.state.spectrum);
        debug!(
            "{}: calibrated (shift {:+.5} ppm)",
            calibration.spectrum.sample_id(),
            calibration.outcome.shift_ppm
        );
        Evaluation {
            evaluator: self.evaluator,
            state: Calibrated {
                spectrum: calibration.spectrum,
                calibration: calibration.outcome,
            },
        }
    }
}

impl<'a> Evaluation<'a, Calibrated> {
    /// Line width and region checks run side by side on the calibrated
    /// spectrum; both finish before the state advances.
    pub fn check(self) -> Evaluation<'a, Checked> {
        let evaluator = self.evaluator;
        let Calibrated {
            spectrum,
            calibration,
        } = self.state;
        let (line_width, (baseline, solvent)) = rayon::join(
            || evaluator.line_width.estimate(&spectrum),
            || (evaluator.baseline.check(&spectrum), evaluator.solvent.check(&spectrum)),
        );
        debug!("{}: checked", spectrum.sample_id());
        Evaluation {
            evaluator,
            state: Checked {
                spectrum,
                calibration,
                line_width,
                baseline,
                solvent,
            },
        }
    }
}

impl<'a> Evaluation<'a, Checked> {
    pub fn mask(self) -> Evaluation<'a, Masked> {
        let features = self.evaluator.masker.mask(&self.state.spectrum);
        debug!("{}: masked", self.state.spectrum.sample_id());
        Evaluation {
            evaluator: self.evaluator,
            state: Masked {
                checked: self.state,
                features,
            },
        }
    }
}

impl Evaluation<'_, Masked> {
    pub fn complete(self) -> QcRecord {
        let Masked { checked, features } = self.state;
        let flags = QcFlags {
            calibration: checked.calibration.failed,
            line_width: checked.line_width.failed,
            baseline: checked.baseline.failed,
            solvent_peak: checked.solvent.failed,
        };
        debug!("{}: complete {flags:?}", checked.spectrum.sample_id());
        QcRecord {
            sample_id: checked.spectrum.sample_id().to_string(),
            metadata: checked.spectrum.metadata().clone(),
            flags,
            line_width_hz: checked.line_width.width_hz,
            calibration_shift_ppm: checked.calibration.shift_ppm,
            reference_ppm: checked.calibration.reference_ppm,
            baseline: checked.baseline,
            solvent: checked.solvent,
            features,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch dispatch
// ---------------------------------------------------------------------------

enum Job {
    Evaluate(RawSpectrum),
    Duplicate(Rejection),
}

/// Type metadata per `analyticalMeasurements` and merge filename fields.
pub fn prepare_metadata(sop: &Sop, raw: &mut RawSpectrum) {
    let sample_id = raw.sample_id();
    if let Some(parser) = &sop.filename_parser {
        parser.annotate(&sample_id, &mut raw.metadata);
    }
    for (column, kind) in &sop.analytical_measurements {
        let Some(value) = raw.metadata.get_mut(column) else {
            continue;
        };
        match value.coerce(*kind) {
            Some(typed) => *value = typed,
            None => {
                warn!(
                    "{sample_id}: '{column}' value '{value}' is not {kind:?}; treated as missing"
                );
                *value = MetadataValue::Null;
            }
        }
    }
}

/// Evaluate every spectrum on a worker pool of `num_threads` threads (all
/// cores when `None`). Outcomes come back in input order; later copies of
/// a sample identifier are rejected as duplicates.
pub fn evaluate_batch(
    sop: &Sop,
    spectra: Vec<RawSpectrum>,
    num_threads: Option<usize>,
) -> Result<BatchEvaluation> {
    let dispatched = spectra.len();
    let evaluator = SampleQCEvaluator::from_sop(sop);

    let mut seen: HashSet<String> = HashSet::with_capacity(dispatched);
    let jobs: Vec<Job> = spectra
        .into_iter()
        .map(|mut raw| {
            prepare_metadata(sop, &mut raw);
            let sample_id = raw.sample_id();
            if seen.insert(sample_id.clone()) {
                Job::Evaluate(raw)
            } else {
                warn!("{sample_id}: duplicate sample, later acquisition ignored");
                Job::Duplicate(Rejection {
                    sample_id,
                    metadata: raw.metadata,
                    reason: "duplicate sample".to_string(),
                })
            }
        })
        .collect();

    let thread_pool = ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()?;
    info!(
        "evaluating {dispatched} spectra on {} threads",
        thread_pool.current_num_threads()
    );

    let outcomes: Vec<SampleOutcome> =
        thread_pool.install(|| jobs.into_par_iter().map(|job| evaluator.run(job)).collect());

    let batch = BatchEvaluation {
        dispatched,
        outcomes,
    };
    info!(
        "{} evaluated, {} rejected",
        batch.records().count(),
        batch.rejections().count()
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QcError;
    use crate::sop::{MeasurementType, SopDocument};
    use crate::synthetic::SyntheticSpectrum;

    fn sop() -> Sop {
        let mut doc = SopDocument::default();
        doc.variable_size = 1100;
        doc.analytical_measurements
            .insert("Run Order".into(), MeasurementType::Continuous);
        Sop::try_from(doc).unwrap()
    }

    fn raw(id: &str, glucose: f64, seed: u64) -> RawSpectrum {
        let mut metadata = BTreeMap::new();
        metadata.insert("Run Order".to_string(), MetadataValue::String(seed.to_string()));
        SyntheticSpectrum::plasma(glucose, 1.0, seed).raw(id, metadata)
    }

    #[test]
    fn test_states_in_order() {
        let sop = sop();
        let evaluator = SampleQCEvaluator::from_sop(&sop);
        let spectrum = SyntheticSpectrum::plasma(5.24, 1.0, 1).build("s1").unwrap();

        let calibrated = evaluator.start(spectrum).unwrap().calibrate();
        assert!(!calibrated.state().calibration.failed);
        let checked = calibrated.check();
        assert!(!checked.state().line_width.failed);
        let masked = checked.mask();
        assert_eq!(masked.state().features.len(), 1100);
        let record = masked.complete();

        assert!(record.passed(), "{:?}", record.flags);
        assert!((record.calibration_shift_ppm - (5.233 - 5.24)).abs() < 1e-4);
        let lw = record.line_width_hz.unwrap();
        assert!((lw - 1.0).abs() < 0.1, "line width {lw}");
        // TSP and water bins are excluded
        let tsp_bin = 100;
        assert!(record.features.is_excluded(tsp_bin));
        assert!(!record.features.is_excluded(0));
    }

    #[test]
    fn test_partial_coverage_is_malformed() {
        let sop = sop();
        let evaluator = SampleQCEvaluator::from_sop(&sop);
        let spectrum = SyntheticSpectrum::new(0.0, 10.0, 0.001).build("short").unwrap();
        assert!(matches!(
            evaluator.evaluate(spectrum),
            Err(QcError::MalformedSpectrum { .. })
        ));
    }

    #[test]
    fn test_batch_keeps_order_and_rejects() {
        let sop = sop();
        let mut broken = raw("broken", 5.24, 3);
        broken.y.pop();
        let spectra = vec![raw("a", 5.24, 1), broken, raw("b", 5.5, 2), raw("a", 5.24, 4)];

        let batch = evaluate_batch(&sop, spectra, Some(2)).unwrap();
        assert_eq!(batch.dispatched, 4);
        let ids: Vec<&str> = batch.outcomes.iter().map(SampleOutcome::sample_id).collect();
        assert_eq!(ids, vec!["a", "broken", "b", "a"]);

        let rejected: Vec<&Rejection> = batch.rejections().collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].reason.contains("malformed"));
        assert_eq!(rejected[1].reason, "duplicate sample");

        let b = batch.records().find(|r| r.sample_id == "b").unwrap();
        assert!(b.flags.calibration);
        assert_eq!(b.calibration_shift_ppm, 0.0);
        assert_eq!(b.metadata["Run Order"], MetadataValue::Float(2.0));
    }
}
