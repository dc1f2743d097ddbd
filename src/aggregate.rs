//! Batch aggregation: sample roles, retention, per-feature statistics and
//! the data handed to the report renderer.
//!
//! Aggregation is a single-threaded reduction over a *complete* batch. The
//! outcomes are sorted first, so the tables do not depend on the order in
//! which samples were dispatched.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};
use serde::{Serialize, Serializer};

use crate::data::model::{
    MetadataValue, ACQUIRED_TIME_COLUMN, ASSAY_ROLE_COLUMN, BATCH_COLUMN, CORRECTION_BATCH_COLUMN,
    RUN_ORDER_COLUMN, SAMPLE_TYPE_COLUMN, STUDY_COLUMN,
};
use crate::error::{QcError, Result};
use crate::qc::{BatchEvaluation, QcRecord, SampleOutcome};
use crate::sop::Sop;
use crate::stats;

/// Optional figure keys of the report.
pub const FIGURE_KEYS: &[&str] = &[
    "finalTICbatches",
    "finalTIC",
    "finalRsdHist",
    "finalRSDdistributionFigure",
    "finalFeatureIntensityHist",
    "finalIonMap",
];

const FIGURE_PLACEHOLDER: &str = "Figure not available";

/// Filename group used for batches when no `Batch` column exists.
const RACK_COLUMN: &str = "rack";

// ---------------------------------------------------------------------------
// Sample roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SampleType {
    StudySample,
    StudyPool,
    ExternalReference,
    MethodReference,
    ProceduralBlank,
    Unknown,
}

impl SampleType {
    pub const ALL: [SampleType; 6] = [
        SampleType::StudySample,
        SampleType::StudyPool,
        SampleType::ExternalReference,
        SampleType::MethodReference,
        SampleType::ProceduralBlank,
        SampleType::Unknown,
    ];

    /// Case- and spacing-insensitive; a missing value means a study sample.
    pub fn from_metadata(value: Option<&MetadataValue>) -> Self {
        let Some(text) = value.filter(|v| !v.is_null()).map(normalise) else {
            return SampleType::StudySample;
        };
        match text.as_str() {
            "studysample" | "ss" => SampleType::StudySample,
            "studypool" | "sp" => SampleType::StudyPool,
            "externalreference" | "er" => SampleType::ExternalReference,
            "methodreference" | "mr" => SampleType::MethodReference,
            "proceduralblank" | "blank" => SampleType::ProceduralBlank,
            _ => SampleType::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SampleType::StudySample => "Study Sample",
            SampleType::StudyPool => "Study Reference",
            SampleType::ExternalReference => "Long-Term Reference",
            SampleType::MethodReference => "Method Reference",
            SampleType::ProceduralBlank => "Procedural Blank",
            SampleType::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AssayRole {
    Assay,
    PrecisionReference,
    LinearityReference,
    Blank,
    Unknown,
}

impl AssayRole {
    pub fn from_metadata(value: Option<&MetadataValue>) -> Self {
        let Some(text) = value.filter(|v| !v.is_null()).map(normalise) else {
            return AssayRole::Assay;
        };
        match text.as_str() {
            "assay" => AssayRole::Assay,
            "precisionreference" | "pr" => AssayRole::PrecisionReference,
            "linearityreference" | "lr" => AssayRole::LinearityReference,
            "blank" => AssayRole::Blank,
            _ => AssayRole::Unknown,
        }
    }
}

fn normalise(value: &MetadataValue) -> String {
    value
        .to_string()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Which (type, role) combinations stay in the final dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub sample_types: BTreeSet<SampleType>,
    pub assay_roles: BTreeSet<AssayRole>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            sample_types: [SampleType::StudySample, SampleType::StudyPool].into(),
            assay_roles: [AssayRole::Assay, AssayRole::PrecisionReference].into(),
        }
    }
}

impl RetentionPolicy {
    pub fn retains(&self, sample_type: SampleType, role: AssayRole) -> bool {
        self.sample_types.contains(&sample_type) && self.assay_roles.contains(&role)
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// One row of the "Acquired" table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    #[serde(rename = "Sample Type")]
    pub sample_type: String,
    #[serde(rename = "Total")]
    pub total: usize,
    #[serde(rename = "Excluded")]
    pub rejected: usize,
    #[serde(rename = "Failed QC")]
    pub failed_qc: usize,
    #[serde(rename = "Passed QC")]
    pub passed: usize,
}

impl SummaryRow {
    fn new(sample_type: &str) -> Self {
        SummaryRow {
            sample_type: sample_type.to_string(),
            total: 0,
            rejected: 0,
            failed_qc: 0,
            passed: 0,
        }
    }

    fn count(&mut self, outcome: &SampleOutcome) {
        self.total += 1;
        match outcome {
            SampleOutcome::Rejected(_) => self.rejected += 1,
            SampleOutcome::Evaluated(r) if r.passed() => self.passed += 1,
            SampleOutcome::Evaluated(_) => self.failed_qc += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExclusionDetail {
    #[serde(rename = "Sample ID")]
    pub sample_id: String,
    #[serde(rename = "Exclusion Reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleSummary {
    /// Per sample type, then an `All` row.
    #[serde(rename = "Acquired")]
    pub acquired: Vec<SummaryRow>,
    #[serde(
        rename = "StudySamples Exclusion Details",
        skip_serializing_if = "Option::is_none"
    )]
    pub study_exclusions: Option<Vec<ExclusionDetail>>,
}

impl SampleSummary {
    /// The `All` row.
    pub fn all(&self) -> Option<&SummaryRow> {
        self.acquired.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub index: usize,
    pub ppm: f64,
    pub excluded: bool,
    pub median_intensity: Option<f64>,
    #[serde(rename = "rsdSP")]
    pub rsd_sp: Option<f64>,
    #[serde(rename = "rsdSS")]
    pub rsd_ss: Option<f64>,
    pub passing_selection: bool,
}

/// Renders as a path, or as a placeholder text when the figure is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFigure {
    Path(PathBuf),
    Placeholder,
}

impl Serialize for ReportFigure {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ReportFigure::Path(path) => serializer.serialize_str(&path.to_string_lossy()),
            ReportFigure::Placeholder => serializer.serialize_str(FIGURE_PLACEHOLDER),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Mapping consumed by the report renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportData {
    #[serde(rename = "Nsamples")]
    pub n_samples: usize,
    #[serde(rename = "Nfeatures")]
    pub n_features: usize,
    #[serde(rename = "sampleSummary")]
    pub sample_summary: SampleSummary,
    #[serde(rename = "FeatureSelectionTable")]
    pub feature_selection: Vec<FeatureRow>,
    #[serde(rename = "batchesCollect")]
    pub batches_collect: String,
    #[serde(rename = "batchesCorrect")]
    pub batches_correct: String,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(flatten)]
    pub figures: BTreeMap<String, ReportFigure>,
    /// Sample types the renderer leaves out of its plots.
    #[serde(rename = "excludeFromPlotting")]
    pub exclude_from_plotting: BTreeSet<String>,
    pub log: Vec<LogEntry>,
}

/// One outcome with its parsed roles and final inclusion.
#[derive(Debug, Clone)]
pub struct AggregatedSample {
    pub outcome: SampleOutcome,
    pub sample_type: SampleType,
    pub assay_role: AssayRole,
    pub included: bool,
}

impl AggregatedSample {
    pub fn record(&self) -> Option<&QcRecord> {
        match &self.outcome {
            SampleOutcome::Evaluated(r) => Some(r),
            SampleOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatedBatch {
    /// Sorted by study, acquisition time, run order and sample identifier.
    pub samples: Vec<AggregatedSample>,
    pub summary: SampleSummary,
    pub features: Vec<FeatureRow>,
    pub report: ReportData,
}

impl AggregatedBatch {
    pub fn included(&self) -> impl Iterator<Item = &AggregatedSample> {
        self.samples.iter().filter(|s| s.included)
    }
}

// ---------------------------------------------------------------------------
// BatchAggregator
// ---------------------------------------------------------------------------

pub struct BatchAggregator<'a> {
    sop: &'a Sop,
    retention: RetentionPolicy,
    figures: BTreeMap<String, PathBuf>,
}

impl<'a> BatchAggregator<'a> {
    pub fn new(sop: &'a Sop) -> Self {
        BatchAggregator {
            sop,
            retention: RetentionPolicy::default(),
            figures: BTreeMap::new(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Attach a rendered figure under one of [`FIGURE_KEYS`].
    pub fn with_figure(mut self, key: &str, path: PathBuf) -> Self {
        if FIGURE_KEYS.contains(&key) {
            self.figures.insert(key.to_string(), path);
        } else {
            warn!("unknown report figure '{key}' ignored");
        }
        self
    }

    pub fn aggregate(&self, batch: &BatchEvaluation) -> Result<AggregatedBatch> {
        if batch.outcomes.len() != batch.dispatched {
            return Err(QcError::AggregationIncomplete {
                expected: batch.dispatched,
                received: batch.outcomes.len(),
            });
        }
        let mut log = Vec::new();
        let mut note = |message: String| {
            info!("{message}");
            log.push(LogEntry {
                timestamp: Utc::now(),
                message,
            });
        };

        let mut samples: Vec<AggregatedSample> = batch
            .outcomes
            .iter()
            .map(|outcome| {
                let metadata = outcome.metadata();
                let sample_type = SampleType::from_metadata(metadata.get(SAMPLE_TYPE_COLUMN));
                let assay_role = AssayRole::from_metadata(metadata.get(ASSAY_ROLE_COLUMN));
                let included = matches!(outcome, SampleOutcome::Evaluated(r) if r.passed())
                    && self.retention.retains(sample_type, assay_role);
                AggregatedSample {
                    outcome: outcome.clone(),
                    sample_type,
                    assay_role,
                    included,
                }
            })
            .collect();
        samples.sort_by(|a, b| compare_samples(&a.outcome, &b.outcome));

        let evaluated = samples.iter().filter(|s| s.record().is_some()).count();
        note(format!(
            "{} samples acquired, {evaluated} evaluated, {} rejected",
            samples.len(),
            samples.len() - evaluated
        ));

        let summary = sample_summary(&samples);
        let features = self.feature_table(&samples);
        let included = samples.iter().filter(|s| s.included).count();
        let passing = features.iter().filter(|f| f.passing_selection).count();
        note(format!("{included} samples retained"));
        note(format!("{passing} of {} features pass selection", features.len()));

        let (start, end) = acquisition_range(&samples);
        let figures = FIGURE_KEYS
            .iter()
            .map(|key| {
                let figure = match self.figures.get(*key) {
                    Some(path) => ReportFigure::Path(path.clone()),
                    None => ReportFigure::Placeholder,
                };
                (key.to_string(), figure)
            })
            .collect();

        let report = ReportData {
            n_samples: included,
            n_features: passing,
            sample_summary: summary.clone(),
            feature_selection: features.clone(),
            batches_collect: batches_collect(&samples),
            batches_correct: batches_correct(&samples),
            start: start.map(format_time),
            end: end.map(format_time),
            figures,
            exclude_from_plotting: self.sop.exclude_from_plotting.clone(),
            log,
        };
        Ok(AggregatedBatch {
            samples,
            summary,
            features,
            report,
        })
    }

    fn feature_table(&self, samples: &[AggregatedSample]) -> Vec<FeatureRow> {
        let included: Vec<&AggregatedSample> = samples.iter().filter(|s| s.included).collect();
        let pool: Vec<&QcRecord> = included
            .iter()
            .filter(|s| {
                s.sample_type == SampleType::StudyPool
                    && s.assay_role == AssayRole::PrecisionReference
            })
            .filter_map(|s| s.record())
            .collect();
        let study: Vec<&QcRecord> = included
            .iter()
            .filter(|s| s.sample_type == SampleType::StudySample && s.assay_role == AssayRole::Assay)
            .filter_map(|s| s.record())
            .collect();
        let all: Vec<&QcRecord> = included.iter().filter_map(|s| s.record()).collect();

        if pool.len() < 2 {
            warn!("{} study reference samples retained; rsdSP not available", pool.len());
        }
        if study.len() < 2 {
            warn!("{} study samples retained; rsdSS not available", study.len());
        }

        let column = |records: &[&QcRecord], k: usize| -> Vec<f64> {
            records.iter().filter_map(|r| r.features.get(k)).collect()
        };

        (0..self.sop.variable_size)
            .map(|k| {
                let ppm = self.sop.bin_center(k);
                let excluded = self.sop.exclusion_regions.contains(ppm);
                let (median_intensity, rsd_sp, rsd_ss) = if excluded {
                    (None, None, None)
                } else {
                    (
                        stats::median(&column(&all, k)),
                        stats::rsd_percent(&column(&pool, k)),
                        stats::rsd_percent(&column(&study, k)),
                    )
                };
                let within_rsd = match (self.sop.rsd_threshold, rsd_sp) {
                    (Some(threshold), Some(rsd)) => rsd <= threshold,
                    _ => true,
                };
                FeatureRow {
                    index: k,
                    ppm,
                    excluded,
                    median_intensity,
                    rsd_sp,
                    rsd_ss,
                    passing_selection: !excluded && within_rsd,
                }
            })
            .collect()
    }
}

/// Study, then acquisition time and run order (missing last), then
/// sample identifier; evaluated outcomes before rejected duplicates.
fn compare_samples(a: &SampleOutcome, b: &SampleOutcome) -> Ordering {
    let study = |o: &SampleOutcome| o.metadata().get(STUDY_COLUMN).cloned().unwrap_or(MetadataValue::Null);
    let time = |o: &SampleOutcome| o.metadata().get(ACQUIRED_TIME_COLUMN).and_then(MetadataValue::as_date);
    let run = |o: &SampleOutcome| o.metadata().get(RUN_ORDER_COLUMN).and_then(MetadataValue::as_f64);
    let rejected = |o: &SampleOutcome| matches!(o, SampleOutcome::Rejected(_));

    study(a)
        .cmp(&study(b))
        .then_with(|| missing_last(time(a), time(b), |x, y| x.cmp(y)))
        .then_with(|| missing_last(run(a), run(b), |x, y| x.total_cmp(y)))
        .then_with(|| a.sample_id().cmp(b.sample_id()))
        .then_with(|| rejected(a).cmp(&rejected(b)))
}

fn missing_last<T>(a: Option<T>, b: Option<T>, cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(&x, &y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sample_summary(samples: &[AggregatedSample]) -> SampleSummary {
    let mut rows: Vec<SummaryRow> = Vec::new();
    for sample_type in SampleType::ALL {
        let mut row = SummaryRow::new(sample_type.label());
        samples
            .iter()
            .filter(|s| s.sample_type == sample_type)
            .for_each(|s| row.count(&s.outcome));
        if row.total > 0 {
            rows.push(row);
        }
    }
    let mut all = SummaryRow::new("All");
    samples.iter().for_each(|s| all.count(&s.outcome));
    rows.push(all);

    let details: Vec<ExclusionDetail> = samples
        .iter()
        .filter(|s| s.sample_type == SampleType::StudySample)
        .filter_map(|s| {
            let reason = match &s.outcome {
                SampleOutcome::Rejected(r) => r.reason.clone(),
                SampleOutcome::Evaluated(r) if !r.passed() => failed_checks(r),
                SampleOutcome::Evaluated(_) => return None,
            };
            Some(ExclusionDetail {
                sample_id: s.outcome.sample_id().to_string(),
                reason,
            })
        })
        .collect();

    SampleSummary {
        acquired: rows,
        study_exclusions: (!details.is_empty()).then_some(details),
    }
}

fn failed_checks(record: &QcRecord) -> String {
    let flags = record.flags;
    [
        (flags.calibration, "CalibrationFail"),
        (flags.line_width, "LineWidthFail"),
        (flags.baseline, "BaselineFail"),
        (flags.solvent_peak, "SolventPeakFail"),
    ]
    .iter()
    .filter(|(failed, _)| *failed)
    .map(|(_, name)| *name)
    .collect::<Vec<_>>()
    .join(", ")
}

fn distinct_values(samples: &[AggregatedSample], column: &str) -> BTreeSet<MetadataValue> {
    samples
        .iter()
        .filter_map(|s| s.outcome.metadata().get(column))
        .filter(|v| !v.is_null())
        .cloned()
        .collect()
}

fn join_values(values: &BTreeSet<MetadataValue>) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn batches_collect(samples: &[AggregatedSample]) -> String {
    let mut batches = distinct_values(samples, BATCH_COLUMN);
    if batches.is_empty() {
        batches = distinct_values(samples, RACK_COLUMN);
    }
    match batches.len() {
        0 => "Acquisition batch information not available".to_string(),
        1 => format!("Samples acquired in a single batch ({})", join_values(&batches)),
        n => format!("Samples acquired in {n} batches ({})", join_values(&batches)),
    }
}

fn batches_correct(samples: &[AggregatedSample]) -> String {
    let batches = distinct_values(samples, CORRECTION_BATCH_COLUMN);
    match batches.len() {
        0 => "No batch correction applied".to_string(),
        n => format!(
            "Batch correction applied over {n} correction batch{} ({})",
            if n == 1 { "" } else { "es" },
            join_values(&batches)
        ),
    }
}

fn acquisition_range(samples: &[AggregatedSample]) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
    let times: Vec<NaiveDateTime> = samples
        .iter()
        .filter_map(|s| s.outcome.metadata().get(ACQUIRED_TIME_COLUMN))
        .filter_map(MetadataValue::as_date)
        .collect();
    (times.iter().min().copied(), times.iter().max().copied())
}

fn format_time(t: NaiveDateTime) -> String {
    t.format("%d/%m/%Y %H:%M:%S").to_string()
}
