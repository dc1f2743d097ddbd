use std::collections::BTreeMap;
use std::sync::OnceLock;

use proptest::prelude::*;

use nmr_qc::aggregate::BatchAggregator;
use nmr_qc::data::loader;
use nmr_qc::data::model::{MetadataValue, RawSpectrum};
use nmr_qc::qc::{evaluate_batch, BatchEvaluation, QcFlags, SampleOutcome};
use nmr_qc::sop::{MeasurementType, SopDocument};
use nmr_qc::synthetic::SyntheticSpectrum;
use nmr_qc::{QcError, Sop};

fn sop() -> &'static Sop {
    static SOP: OnceLock<Sop> = OnceLock::new();
    SOP.get_or_init(|| {
        let mut doc = SopDocument::default();
        doc.variable_size = 2000;
        doc.analytical_measurements
            .insert("Acquired Time".into(), MeasurementType::Date);
        Sop::try_from(doc).unwrap()
    })
}

fn raw(id: &str, glucose_ppm: f64, tsp_width_hz: f64, seed: u64, meta: &[(&str, &str)]) -> RawSpectrum {
    let metadata: BTreeMap<String, MetadataValue> = meta
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::String(v.to_string())))
        .collect();
    SyntheticSpectrum::plasma(glucose_ppm, tsp_width_hz, seed).raw(id, metadata)
}

fn flags(outcome: &SampleOutcome) -> QcFlags {
    match outcome {
        SampleOutcome::Evaluated(record) => record.flags,
        SampleOutcome::Rejected(r) => panic!("{} rejected: {}", r.sample_id, r.reason),
    }
}

fn qc_flags(calibration: bool, line_width: bool) -> QcFlags {
    QcFlags {
        calibration,
        line_width,
        baseline: false,
        solvent_peak: false,
    }
}

#[test]
fn clean_offset_and_broad_samples() {
    let spectra = vec![
        raw("clean", 5.24, 1.0, 1, &[]),
        raw("off-window", 5.5, 1.0, 2, &[]),
        raw("broad", 5.24, 2.5, 3, &[]),
    ];
    let evaluation = evaluate_batch(sop(), spectra, Some(3)).unwrap();

    assert_eq!(flags(&evaluation.outcomes[0]), qc_flags(false, false));
    assert_eq!(flags(&evaluation.outcomes[1]), qc_flags(true, false));
    assert_eq!(flags(&evaluation.outcomes[2]), qc_flags(false, true));

    let records: Vec<_> = evaluation.records().collect();
    assert!((records[0].calibration_shift_ppm - (5.233 - 5.24)).abs() < 1e-4);
    assert_eq!(records[1].calibration_shift_ppm, 0.0);
    let broad = records[2].line_width_hz.unwrap();
    assert!((broad - 2.5).abs() < 0.1, "line width {broad}");

    let aggregated = BatchAggregator::new(sop()).aggregate(&evaluation).unwrap();
    let all = aggregated.summary.all().unwrap();
    assert_eq!(all.total, 3);
    assert_eq!(all.passed, 1);
    assert_eq!(aggregated.report.n_samples, 1);
    assert_eq!(aggregated.summary.study_exclusions.as_ref().map(Vec::len), Some(2));
}

#[test]
fn aggregation_requires_every_dispatched_sample() {
    let spectra = vec![raw("a", 5.24, 1.0, 4, &[]), raw("b", 5.24, 1.0, 5, &[])];
    let mut evaluation = evaluate_batch(sop(), spectra, Some(1)).unwrap();
    evaluation.outcomes.pop();
    let err = BatchAggregator::new(sop()).aggregate(&evaluation).unwrap_err();
    assert!(matches!(
        err,
        QcError::AggregationIncomplete {
            expected: 2,
            received: 1
        }
    ));
}

#[test]
fn spectra_round_trip_through_json_loader() {
    let spectra = [raw("j1", 5.24, 1.0, 6, &[]), raw("j2", 5.23, 1.1, 7, &[])];
    let records: Vec<serde_json::Value> = spectra
        .iter()
        .map(|s| {
            serde_json::json!({
                "x": s.x,
                "y": s.y,
                "Sample File Name": s.sample_id(),
                "SF": 600.0,
            })
        })
        .collect();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.json");
    std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

    let dataset = loader::load_file(&path).unwrap();
    assert_eq!(dataset.len(), 2);
    let evaluation = evaluate_batch(sop(), dataset.spectra, None).unwrap();
    assert_eq!(evaluation.records().count(), 2);
    assert!(evaluation.records().all(|r| r.passed()));
}

fn mixed_batch() -> &'static BatchEvaluation {
    static BATCH: OnceLock<BatchEvaluation> = OnceLock::new();
    BATCH.get_or_init(|| {
        let pool = [("SampleType", "Study Pool"), ("AssayRole", "Precision Reference")];
        let spectra = vec![
            raw("s1", 5.236, 1.0, 10, &[("Acquired Time", "2017-03-14 09:00:00")]),
            raw("p1", 5.232, 1.0, 11, &pool),
            raw("s2", 5.234, 1.1, 12, &[("Acquired Time", "2017-03-14 09:10:00")]),
            raw("p2", 5.231, 0.9, 13, &pool),
            raw("s3", 5.5, 1.0, 14, &[("Acquired Time", "2017-03-14 09:20:00")]),
        ];
        evaluate_batch(sop(), spectra, None).unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn aggregation_ignores_input_order(order in Just((0..5).collect::<Vec<usize>>()).prop_shuffle()) {
        let base = mixed_batch();
        let shuffled = BatchEvaluation {
            dispatched: base.dispatched,
            outcomes: order.iter().map(|&i| base.outcomes[i].clone()).collect(),
        };
        let expected = BatchAggregator::new(sop()).aggregate(base).unwrap();
        let actual = BatchAggregator::new(sop()).aggregate(&shuffled).unwrap();

        prop_assert_eq!(&expected.summary, &actual.summary);
        prop_assert_eq!(&expected.features, &actual.features);
        let ids = |b: &nmr_qc::aggregate::AggregatedBatch| -> Vec<String> {
            b.samples.iter().map(|s| s.outcome.sample_id().to_string()).collect()
        };
        prop_assert_eq!(ids(&expected), ids(&actual));
    }
}
