use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use crate::aggregate::AggregatedBatch;
use crate::qc::SampleOutcome;
use crate::sop::Sop;

/// Cell text for a bin removed by an exclusion region.
pub const EXCLUDED_CELL: &str = "excluded";

/// An in-memory table of text cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Remove the named columns.
    pub fn without(mut self, columns: &BTreeSet<String>) -> Self {
        let keep: Vec<bool> = self.header.iter().map(|h| !columns.contains(h)).collect();
        let filter = |row: Vec<String>| -> Vec<String> {
            row.into_iter()
                .zip(&keep)
                .filter_map(|(cell, &k)| k.then_some(cell))
                .collect()
        };
        self.header = filter(self.header);
        self.rows = self.rows.into_iter().map(filter).collect();
        self
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush().context("flushing CSV")?;
        Ok(())
    }
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One row per acquired sample, in aggregation order.
pub fn sample_metadata_table(batch: &AggregatedBatch) -> Table {
    let mut columns: BTreeSet<&str> = BTreeSet::new();
    for sample in &batch.samples {
        columns.extend(sample.outcome.metadata().keys().map(String::as_str));
    }
    let columns: Vec<&str> = columns.into_iter().collect();

    let mut header = vec!["Sample ID".to_string()];
    header.extend(columns.iter().map(|c| c.to_string()));
    header.extend(
        [
            "SampleType (parsed)",
            "AssayRole (parsed)",
            "CalibrationFail",
            "LineWidthFail",
            "BaselineFail",
            "SolventPeakFail",
            "Line Width (Hz)",
            "Calibration Shift (ppm)",
            "Exclusion Reason",
            "Included",
        ]
        .map(String::from),
    );

    let rows = batch
        .samples
        .iter()
        .map(|sample| {
            let metadata = sample.outcome.metadata();
            let mut row = vec![sample.outcome.sample_id().to_string()];
            row.extend(columns.iter().map(|c| cell(metadata.get(*c))));
            row.push(format!("{:?}", sample.sample_type));
            row.push(format!("{:?}", sample.assay_role));
            match &sample.outcome {
                SampleOutcome::Evaluated(r) => {
                    row.push(r.flags.calibration.to_string());
                    row.push(r.flags.line_width.to_string());
                    row.push(r.flags.baseline.to_string());
                    row.push(r.flags.solvent_peak.to_string());
                    row.push(cell(r.line_width_hz));
                    row.push(r.calibration_shift_ppm.to_string());
                    row.push(String::new());
                }
                SampleOutcome::Rejected(r) => {
                    row.extend(std::iter::repeat(String::new()).take(6));
                    row.push(r.reason.clone());
                }
            }
            row.push(sample.included.to_string());
            row
        })
        .collect();

    Table { header, rows }
}

pub fn feature_metadata_table(batch: &AggregatedBatch) -> Table {
    let header = [
        "Feature",
        "ppm",
        "Excluded",
        "Median Intensity",
        "rsdSP",
        "rsdSS",
        "Passing Selection",
    ]
    .map(String::from)
    .to_vec();
    let rows = batch
        .features
        .iter()
        .map(|f| {
            vec![
                f.index.to_string(),
                f.ppm.to_string(),
                f.excluded.to_string(),
                cell(f.median_intensity),
                cell(f.rsd_sp),
                cell(f.rsd_ss),
                f.passing_selection.to_string(),
            ]
        })
        .collect();
    Table { header, rows }
}

/// Binned intensities of the retained samples, one column per feature.
pub fn intensity_table(batch: &AggregatedBatch) -> Table {
    let mut header = vec!["Sample ID".to_string()];
    header.extend(batch.features.iter().map(|f| format!("{:.6}", f.ppm)));
    let rows = batch
        .included()
        .filter_map(|s| s.record())
        .map(|record| {
            let mut row = vec![record.sample_id.clone()];
            row.extend(record.features.values().iter().map(|v| match v {
                Some(x) => x.to_string(),
                None => EXCLUDED_CELL.to_string(),
            }));
            row
        })
        .collect();
    Table { header, rows }
}

/// Paths written by [`export_dataset`].
#[derive(Debug, Clone)]
pub struct ExportedFiles {
    pub sample_metadata: PathBuf,
    pub feature_metadata: PathBuf,
    pub intensity_data: PathBuf,
    pub report: PathBuf,
}

/// Write the three CSV tables and the report JSON into `dir`.
/// Columns named in the SOP's not-exported sets are dropped.
pub fn export_dataset(batch: &AggregatedBatch, sop: &Sop, dir: &Path, prefix: &str) -> Result<ExportedFiles> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let files = ExportedFiles {
        sample_metadata: dir.join(format!("{prefix}_sampleMetadata.csv")),
        feature_metadata: dir.join(format!("{prefix}_featureMetadata.csv")),
        intensity_data: dir.join(format!("{prefix}_intensityData.csv")),
        report: dir.join(format!("{prefix}_report.json")),
    };

    sample_metadata_table(batch)
        .without(&sop.sample_metadata_not_exported)
        .write_csv(&files.sample_metadata)?;
    feature_metadata_table(batch)
        .without(&sop.feature_metadata_not_exported)
        .write_csv(&files.feature_metadata)?;
    intensity_table(batch).write_csv(&files.intensity_data)?;

    let report = File::create(&files.report)
        .with_context(|| format!("creating {}", files.report.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(report), &batch.report)
        .context("writing report JSON")?;

    info!(
        "exported {} samples and {} features to {} ({} sample columns withheld)",
        batch.samples.len(),
        batch.features.len(),
        dir.display(),
        sop.sample_metadata_not_exported.len()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::BatchAggregator;
    use crate::data::model::MetadataValue;
    use crate::qc::evaluate::{QcFlags, QcRecord, Rejection};
    use crate::qc::regions::RegionCheck;
    use crate::qc::{BatchEvaluation, FeatureVector};
    use crate::sop::SopDocument;
    use crate::spectrum::PpmInterval;
    use std::collections::BTreeMap;

    fn sop() -> Sop {
        let mut doc = SopDocument::default();
        doc.bounds = PpmInterval::new(0.0, 3.0).unwrap();
        doc.variable_size = 3;
        doc.ppm_search_range = PpmInterval::new(0.5, 1.5).unwrap();
        doc.calibrate_to = 1.0;
        doc.lw_peak_range = PpmInterval::new(0.0, 0.5).unwrap();
        doc.baseline_check_region = vec![PpmInterval::new(2.5, 3.0).unwrap()];
        doc.solvent_peak_check_region = vec![PpmInterval::new(2.0, 2.5).unwrap()];
        doc.exclusion_regions = vec![PpmInterval::new(1.0, 2.0).unwrap()];
        doc.sample_metadata_not_exported = ["Correction Batch".to_string()].into();
        doc.feature_metadata_not_exported = ["rsdSS".to_string()].into();
        Sop::try_from(doc).unwrap()
    }

    fn batch(sop: &Sop) -> AggregatedBatch {
        let check = RegionCheck {
            values: Vec::new(),
            limit: Some(1.0),
            failed: false,
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("Correction Batch".to_string(), MetadataValue::Integer(1));
        metadata.insert("Study".to_string(), MetadataValue::String("ST01".into()));
        let record = QcRecord {
            sample_id: "s1".into(),
            metadata: metadata.clone(),
            flags: QcFlags {
                calibration: false,
                line_width: false,
                baseline: false,
                solvent_peak: false,
            },
            line_width_hz: Some(0.9),
            calibration_shift_ppm: 0.001,
            reference_ppm: Some(0.999),
            baseline: check.clone(),
            solvent: check,
            features: FeatureVector::new(vec![Some(1.5), None, Some(0.0)]),
        };
        let evaluation = BatchEvaluation {
            dispatched: 2,
            outcomes: vec![
                SampleOutcome::Evaluated(record),
                SampleOutcome::Rejected(Rejection {
                    sample_id: "s0".into(),
                    metadata,
                    reason: "duplicate sample".into(),
                }),
            ],
        };
        BatchAggregator::new(sop).aggregate(&evaluation).unwrap()
    }

    #[test]
    fn test_without_drops_columns() {
        let table = Table {
            header: vec!["a".into(), "b".into(), "c".into()],
            rows: vec![vec!["1".into(), "2".into(), "3".into()]],
        };
        let dropped = table.without(&["b".to_string()].into());
        assert_eq!(dropped.header, vec!["a", "c"]);
        assert_eq!(dropped.rows[0], vec!["1", "3"]);
    }

    #[test]
    fn test_export_writes_all_files() {
        let sop = sop();
        let batch = batch(&sop);
        let dir = tempfile::tempdir().unwrap();
        let files = export_dataset(&batch, &sop, dir.path(), "plasma").unwrap();

        let samples = std::fs::read_to_string(&files.sample_metadata).unwrap();
        let header = samples.lines().next().unwrap();
        assert!(header.contains("Study"));
        assert!(!header.contains("Correction Batch"));
        assert!(samples.contains("duplicate sample"));

        let features = std::fs::read_to_string(&files.feature_metadata).unwrap();
        assert!(!features.lines().next().unwrap().contains("rsdSS"));
        assert_eq!(features.lines().count(), 4);

        let intensities = std::fs::read_to_string(&files.intensity_data).unwrap();
        let row = intensities.lines().nth(1).unwrap();
        assert_eq!(row, "s1,1.5,excluded,0");

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&files.report).unwrap()).unwrap();
        assert_eq!(report["Nsamples"], 1);
        assert_eq!(report["Nfeatures"], 2);
        assert_eq!(report["finalTIC"], "Figure not available");
    }
}
