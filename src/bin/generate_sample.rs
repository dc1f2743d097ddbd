//! Writes a synthetic plasma NMR batch to `nmr_batch.parquet` (or the path
//! given as first argument) for trying out the QC pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Float64Array, Float64Builder, Int64Array, ListBuilder, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use nmr_qc::synthetic::SyntheticSpectrum;

struct Acquisition {
    name: String,
    sample_type: &'static str,
    assay_role: &'static str,
    run_order: i64,
    batch: i64,
    spectrum: SyntheticSpectrum,
}

fn acquisitions() -> Vec<Acquisition> {
    let mut out = Vec::new();
    for run in 0..24i64 {
        let batch = 1 + run / 12;
        let rack = batch;
        let pool = run % 6 == 5;
        let (sample_type, assay_role) = if pool {
            ("Study Pool", "Precision Reference")
        } else {
            ("Study Sample", "Assay")
        };

        // slight chemical-shift drift across the run
        let glucose = 5.236 + 0.0005 * ((run % 7) as f64 - 3.0);
        let mut tsp_width = 0.9 + 0.02 * (run % 5) as f64;
        let mut glucose_ppm = glucose;
        let mut water = 0.0;
        match run {
            // poor shimming
            7 => tsp_width = 2.4,
            // mis-referenced acquisition, glucose outside the search window
            13 => glucose_ppm = 5.48,
            // residual water
            19 => water = 0.4,
            _ => {}
        }

        let mut spectrum = SyntheticSpectrum::plasma(glucose_ppm, tsp_width, 1000 + run as u64);
        // scale the metabolite content a little between samples
        let scale = 1.0 + 0.05 * ((run * 37 % 11) as f64 / 10.0 - 0.5);
        spectrum = spectrum.singlet(3.23, 1.2, 0.25 * scale);
        if water > 0.0 {
            spectrum = spectrum.singlet(4.68, 3.0, water);
        }

        out.push(Acquisition {
            name: format!("ST01_plasma_R{rack}_ab_20170314/{}", 10 * (run + 1)),
            sample_type,
            assay_role,
            run_order: run,
            batch,
            spectrum,
        });
    }
    out
}

fn main() {
    let output_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "nmr_batch.parquet".to_string());

    let acquisitions = acquisitions();

    let mut x_builder = ListBuilder::new(Float64Builder::new());
    let mut y_builder = ListBuilder::new(Float64Builder::new());
    for acq in &acquisitions {
        let raw = acq.spectrum.raw(&acq.name, BTreeMap::new());
        // Bruker order: high to low ppm
        for &v in raw.x.iter().rev() {
            x_builder.values().append_value(v);
        }
        x_builder.append(true);
        for &v in raw.y.iter().rev() {
            y_builder.values().append_value(v);
        }
        y_builder.append(true);
    }
    let x_array = x_builder.finish();
    let y_array = y_builder.finish();

    let names = StringArray::from(acquisitions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>());
    let types = StringArray::from(acquisitions.iter().map(|a| a.sample_type).collect::<Vec<_>>());
    let roles = StringArray::from(acquisitions.iter().map(|a| a.assay_role).collect::<Vec<_>>());
    let times: Vec<String> = acquisitions
        .iter()
        .map(|a| format!("14-Mar-2017 {:02}:{:02}:00", 9 + a.run_order / 6, (a.run_order % 6) * 10))
        .collect();
    let times = StringArray::from(times.iter().map(String::as_str).collect::<Vec<_>>());
    let run_order = Int64Array::from(acquisitions.iter().map(|a| a.run_order).collect::<Vec<_>>());
    let batches = Int64Array::from(acquisitions.iter().map(|a| a.batch).collect::<Vec<_>>());
    let frequency = Float64Array::from(vec![600.0; acquisitions.len()]);

    let list = || DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
    let schema = Arc::new(Schema::new(vec![
        Field::new("x", list(), false),
        Field::new("y", list(), false),
        Field::new("Sample File Name", DataType::Utf8, false),
        Field::new("SampleType", DataType::Utf8, false),
        Field::new("AssayRole", DataType::Utf8, false),
        Field::new("Acquired Time", DataType::Utf8, false),
        Field::new("Run Order", DataType::Int64, false),
        Field::new("Batch", DataType::Int64, false),
        Field::new("SF", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(x_array),
            Arc::new(y_array),
            Arc::new(names),
            Arc::new(types),
            Arc::new(roles),
            Arc::new(times),
            Arc::new(run_order),
            Arc::new(batches),
            Arc::new(frequency),
        ],
    )
    .expect("Failed to create RecordBatch");

    let file = std::fs::File::create(&output_path).expect("Failed to create output file");
    let mut writer = ArrowWriter::try_new(file, schema, None).expect("Failed to create writer");
    writer.write(&batch).expect("Failed to write batch");
    writer.close().expect("Failed to close writer");

    println!(
        "Wrote {} spectra to {output_path} (runs 7, 13 and 19 should fail QC)",
        acquisitions.len()
    );
}
