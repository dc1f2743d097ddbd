use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeListArray, ListArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{MetadataValue, RawSpectrum, SpectralDataset};

/// Accepted names for the chemical-shift column, first match wins.
const AXIS_COLUMNS: &[&str] = &["x", "ppm"];
/// Accepted names for the intensity column.
const INTENSITY_COLUMNS: &[&str] = &["y", "intensity"];

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load a batch of raw spectra from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – `x`/`ppm` and `y`/`intensity` list columns (recommended)
/// * `.json`    – `[{ "x": [...], "y": [...], ...meta }, ...]`
/// * `.csv`     – `x` and `y` columns holding semicolon-separated floats
///
/// Rows whose axis and intensity lengths disagree are kept as-is; the QC
/// stage rejects them per sample instead of failing the whole batch.
pub fn load_file(path: &Path) -> Result<SpectralDataset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let spectra = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path)?,
        "json" => load_json(path)?,
        "csv" => load_csv(path)?,
        other => bail!("Unsupported file extension: .{other}"),
    };
    info!("loaded {} spectra from {}", spectra.len(), path.display());
    Ok(SpectralDataset::from_spectra(spectra))
}

fn find_column<'a, I>(names: I, wanted: &[&str]) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: Vec<&str> = names.into_iter().collect();
    wanted
        .iter()
        .find_map(|w| names.iter().position(|n| n == w))
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Records-oriented JSON (`df.to_json(orient='records')`):
///
/// ```json
/// [
///   { "x": [10.0, 9.9995, ...], "y": [0.01, 0.02, ...],
///     "Sample File Name": "ST01_plasma_R1_ab_20170314/10", "SampleType": "Study Sample" },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<Vec<RawSpectrum>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root
        .as_array()
        .context("Expected top-level JSON array")?;

    records
        .iter()
        .enumerate()
        .map(|(row, rec)| -> Result<RawSpectrum> {
            let obj = rec
                .as_object()
                .with_context(|| format!("Row {row} is not a JSON object"))?;

            let axis_key = find_column(obj.keys().map(String::as_str), AXIS_COLUMNS)
                .and_then(|i| obj.keys().nth(i))
                .with_context(|| format!("Row {row}: no axis column"))?;
            let intensity_key = find_column(obj.keys().map(String::as_str), INTENSITY_COLUMNS)
                .and_then(|i| obj.keys().nth(i))
                .with_context(|| format!("Row {row}: no intensity column"))?;

            let x = json_array_to_f64(obj.get(axis_key), row, axis_key)?;
            let y = json_array_to_f64(obj.get(intensity_key), row, intensity_key)?;

            let metadata = obj
                .iter()
                .filter(|(key, _)| *key != axis_key && *key != intensity_key)
                .map(|(key, val)| (key.clone(), json_to_metadata(val)))
                .collect();

            Ok(RawSpectrum { x, y, metadata, row })
        })
        .collect()
}

fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
        })
        .collect()
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => MetadataValue::Integer(i),
            None => n
                .as_f64()
                .map_or_else(|| MetadataValue::String(n.to_string()), MetadataValue::Float),
        },
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// Header row with column names; the axis and intensity columns hold
/// semicolon-separated floats (`"10.0;9.9995;..."`). All other columns
/// are metadata.
fn load_csv(path: &Path) -> Result<Vec<RawSpectrum>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let x_idx = find_column(headers.iter().map(String::as_str), AXIS_COLUMNS)
        .context("CSV missing axis column ('x' or 'ppm')")?;
    let y_idx = find_column(headers.iter().map(String::as_str), INTENSITY_COLUMNS)
        .context("CSV missing intensity column ('y' or 'intensity')")?;

    let mut spectra = Vec::new();

    for (row, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row}"))?;

        let x = parse_semicolon_floats(record.get(x_idx).unwrap_or(""), row, "x")?;
        let y = parse_semicolon_floats(record.get(y_idx).unwrap_or(""), row, "y")?;

        let metadata = record
            .iter()
            .enumerate()
            .filter(|(col, _)| *col != x_idx && *col != y_idx)
            .map(|(col, value)| (headers[col].clone(), guess_metadata_type(value)))
            .collect();

        spectra.push(RawSpectrum { x, y, metadata, row });
    }

    Ok(spectra)
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

fn guess_metadata_type(s: &str) -> MetadataValue {
    if s.is_empty() {
        return MetadataValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return MetadataValue::Float(f);
    }
    if s == "true" || s == "false" {
        return MetadataValue::Bool(s == "true");
    }
    MetadataValue::String(s.to_string())
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Parquet with List<Float64> / LargeList<Float64> (or Float32) axis and
/// intensity columns; any other column is metadata. Written by both
/// Pandas and Polars, and by the `generate_sample` binary.
fn load_parquet(path: &Path) -> Result<Vec<RawSpectrum>> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut spectra = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();

        let x_idx = find_column(names.iter().copied(), AXIS_COLUMNS)
            .context("Parquet file missing axis column ('x' or 'ppm')")?;
        let y_idx = find_column(names.iter().copied(), INTENSITY_COLUMNS)
            .context("Parquet file missing intensity column ('y' or 'intensity')")?;

        let meta_cols: Vec<(usize, String)> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != x_idx && *i != y_idx)
            .map(|(i, name)| (i, name.to_string()))
            .collect();
        debug!("parquet batch: {} rows, {} metadata columns", batch.num_rows(), meta_cols.len());

        for batch_row in 0..batch.num_rows() {
            let row = spectra.len();
            let x = extract_f64_list(batch.column(x_idx), batch_row)
                .with_context(|| format!("Row {row}: failed to read axis"))?;
            let y = extract_f64_list(batch.column(y_idx), batch_row)
                .with_context(|| format!("Row {row}: failed to read intensity"))?;

            let metadata: BTreeMap<String, MetadataValue> = meta_cols
                .iter()
                .map(|(col_idx, name)| {
                    (name.clone(), extract_metadata_value(batch.column(*col_idx), batch_row))
                })
                .collect();

            spectra.push(RawSpectrum { x, y, metadata, row });
        }
    }

    Ok(spectra)
}

// -- Parquet / Arrow helpers --

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        return Ok(Vec::new());
    }

    let values_array = match col.data_type() {
        DataType::List(_) => col
            .as_any()
            .downcast_ref::<ListArray>()
            .context("expected ListArray")?
            .value(row),
        DataType::LargeList(_) => col
            .as_any()
            .downcast_ref::<LargeListArray>()
            .context("expected LargeListArray")?
            .value(row),
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.map_or(f64::NAN, f64::from)).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}

/// Extract a single metadata value from an Arrow column at a given row.
/// Unsupported types fall back to their debug name rather than failing.
fn extract_metadata_value(col: &Arc<dyn Array>, row: usize) -> MetadataValue {
    if col.is_null(row) {
        return MetadataValue::Null;
    }
    let any = col.as_any();
    let value = match col.data_type() {
        DataType::Utf8 => Some(MetadataValue::String(col.as_string::<i32>().value(row).to_string())),
        DataType::LargeUtf8 => {
            Some(MetadataValue::String(col.as_string::<i64>().value(row).to_string()))
        }
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| MetadataValue::Integer(i64::from(a.value(row)))),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| MetadataValue::Integer(a.value(row))),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| MetadataValue::Float(f64::from(a.value(row)))),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| MetadataValue::Float(a.value(row))),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| MetadataValue::Bool(a.value(row))),
        DataType::Timestamp(unit, _) => timestamp_micros(col, *unit, row)
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .map(|dt| MetadataValue::Date(dt.naive_utc())),
        _ => None,
    };
    value.unwrap_or_else(|| MetadataValue::String(format!("{:?}", col.data_type())))
}

fn timestamp_micros(col: &Arc<dyn Array>, unit: TimeUnit, row: usize) -> Option<i64> {
    let any = col.as_any();
    match unit {
        TimeUnit::Second => any
            .downcast_ref::<TimestampSecondArray>()
            .map(|a| a.value(row) * 1_000_000),
        TimeUnit::Millisecond => any
            .downcast_ref::<TimestampMillisecondArray>()
            .map(|a| a.value(row) * 1_000),
        TimeUnit::Microsecond => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .map(|a| a.value(row)),
        TimeUnit::Nanosecond => any
            .downcast_ref::<TimestampNanosecondArray>()
            .map(|a| a.value(row) / 1_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_csv_keeps_mismatched_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Sample File Name,x,y,Run Order").unwrap();
        writeln!(f, "s1,1.0;2.0;3.0,0.1;0.2;0.3,1").unwrap();
        writeln!(f, "s2,1.0;2.0;3.0,0.1;0.2,2").unwrap();
        drop(f);

        let ds = load_file(&path).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.spectra[1].y.len(), 2);
        assert_eq!(ds.spectra[0].sample_id(), "s1");
        assert_eq!(
            ds.spectra[1].metadata.get("Run Order"),
            Some(&MetadataValue::Integer(2))
        );
        assert!(ds.duplicate_ids().is_empty());
        assert!(ds.columns().contains("Run Order"));
    }

    #[test]
    fn test_load_json_with_ppm_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            r#"[{"ppm": [3.0, 2.0, 1.0], "intensity": [0.0, 1.0, 0.0], "sample": "a", "SF": 600.13}]"#,
        )
        .unwrap();

        let ds = load_file(&path).unwrap();
        let raw = &ds.spectra[0];
        assert_eq!(raw.x, vec![3.0, 2.0, 1.0]);
        assert_eq!(raw.metadata.get("SF"), Some(&MetadataValue::Float(600.13)));
        assert!(!raw.metadata.contains_key("ppm"));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(load_file(Path::new("spectra.xlsx")).is_err());
    }
}
