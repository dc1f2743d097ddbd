use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::sop::MeasurementType;

/// Sample identifier column, as written by the acquisition software.
pub const SAMPLE_ID_COLUMN: &str = "Sample File Name";
/// Fallback identifier column for hand-made datasets.
pub const SAMPLE_COLUMN: &str = "sample";
/// Spectrometer base frequency in MHz.
pub const FREQUENCY_COLUMN: &str = "SF";
pub const STUDY_COLUMN: &str = "Study";
pub const ACQUIRED_TIME_COLUMN: &str = "Acquired Time";
pub const RUN_ORDER_COLUMN: &str = "Run Order";
pub const SAMPLE_TYPE_COLUMN: &str = "SampleType";
pub const ASSAY_ROLE_COLUMN: &str = "AssayRole";
pub const BATCH_COLUMN: &str = "Batch";
pub const CORRECTION_BATCH_COLUMN: &str = "Correction Batch";

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a metadata column
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value.
/// Used as a `BTreeMap` / `BTreeSet` key downstream so it must be `Ord`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDateTime),
    Null,
}

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nulls first, then by variant; floats by `total_cmp`.
impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use MetadataValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            MetadataValue::Null => Ok(()),
        }
    }
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            MetadataValue::Date(d) => Some(*d),
            MetadataValue::String(s) => parse_date_time(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MetadataValue::Null => 0,
            MetadataValue::Bool(_) => 1,
            MetadataValue::Integer(_) => 2,
            MetadataValue::Float(_) => 3,
            MetadataValue::String(_) => 4,
            MetadataValue::Date(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }

    /// Convert to the declared measurement type. `None` when the value
    /// cannot be represented in that type; `Null` stays `Null`.
    pub fn coerce(&self, kind: MeasurementType) -> Option<MetadataValue> {
        if self.is_null() {
            return Some(MetadataValue::Null);
        }
        match kind {
            MeasurementType::Categorical => Some(MetadataValue::String(self.to_string())),
            MeasurementType::Continuous => self.as_f64().map(MetadataValue::Float),
            MeasurementType::Date => self.as_date().map(MetadataValue::Date),
        }
    }
}

fn parse_date_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// ---------------------------------------------------------------------------
// RawSpectrum – one loaded record, not yet validated
// ---------------------------------------------------------------------------

/// A single spectrum as read from disk (one row of the source table).
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    /// Chemical-shift axis (x).
    pub x: Vec<f64>,
    /// Intensity axis (y); may disagree in length with `x` until validated.
    pub y: Vec<f64>,
    /// Dynamic metadata columns: column_name → value.
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Position in the source file, used when no identifier column exists.
    pub row: usize,
}

impl RawSpectrum {
    pub fn sample_id(&self) -> String {
        [SAMPLE_ID_COLUMN, SAMPLE_COLUMN]
            .iter()
            .filter_map(|col| self.metadata.get(*col))
            .find(|v| !v.is_null())
            .map(|v| v.to_string().trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("row{}", self.row))
    }
}

// ---------------------------------------------------------------------------
// SpectralDataset – the complete loaded batch
// ---------------------------------------------------------------------------

/// The parsed batch in file order.
#[derive(Debug, Clone)]
pub struct SpectralDataset {
    pub spectra: Vec<RawSpectrum>,
}

impl SpectralDataset {
    pub fn from_spectra(spectra: Vec<RawSpectrum>) -> Self {
        SpectralDataset { spectra }
    }

    /// Metadata column names seen in any record (excludes x, y).
    pub fn columns(&self) -> BTreeSet<&str> {
        self.spectra
            .iter()
            .flat_map(|sp| sp.metadata.keys().map(String::as_str))
            .collect()
    }

    /// Identifiers that occur in more than one record.
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for sp in &self.spectra {
            *counts.entry(sp.sample_id()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_by_measurement_type() {
        let v = MetadataValue::String("12.5".into());
        assert_eq!(v.coerce(MeasurementType::Continuous), Some(MetadataValue::Float(12.5)));
        assert_eq!(
            MetadataValue::Integer(3).coerce(MeasurementType::Categorical),
            Some(MetadataValue::String("3".into()))
        );
        assert_eq!(MetadataValue::String("abc".into()).coerce(MeasurementType::Continuous), None);
        assert_eq!(MetadataValue::Null.coerce(MeasurementType::Date), Some(MetadataValue::Null));
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2017, 3, 14)
            .unwrap()
            .and_hms_opt(9, 26, 53)
            .unwrap();
        for s in ["2017-03-14 09:26:53", "14-Mar-2017 09:26:53", "2017-03-14T09:26:53"] {
            assert_eq!(MetadataValue::String(s.into()).as_date(), Some(expected), "{s}");
        }
        assert!(MetadataValue::String("yesterday".into()).as_date().is_none());
    }

    #[test]
    fn test_sample_id_fallbacks() {
        let mut raw = RawSpectrum {
            x: vec![],
            y: vec![],
            metadata: BTreeMap::new(),
            row: 7,
        };
        assert_eq!(raw.sample_id(), "row7");
        raw.metadata.insert(SAMPLE_COLUMN.into(), MetadataValue::String("s1".into()));
        assert_eq!(raw.sample_id(), "s1");
        raw.metadata.insert(SAMPLE_ID_COLUMN.into(), MetadataValue::String("file_10".into()));
        assert_eq!(raw.sample_id(), "file_10");
    }

    #[test]
    fn test_ordering_across_variants() {
        let mut set = BTreeSet::new();
        set.insert(MetadataValue::String("b".into()));
        set.insert(MetadataValue::Null);
        set.insert(MetadataValue::Integer(2));
        set.insert(MetadataValue::Integer(-1));
        let ordered: Vec<_> = set.into_iter().collect();
        assert!(ordered[0].is_null());
        assert_eq!(ordered[1], MetadataValue::Integer(-1));
        assert_eq!(ordered[3], MetadataValue::String("b".into()));
    }

    #[test]
    fn test_duplicate_ids_and_columns() {
        let raw = |id: &str, row| RawSpectrum {
            x: vec![],
            y: vec![],
            metadata: BTreeMap::from([(SAMPLE_ID_COLUMN.to_string(), MetadataValue::String(id.into()))]),
            row,
        };
        let ds = SpectralDataset::from_spectra(vec![raw("a", 0), raw("b", 1), raw("a", 2)]);
        assert_eq!(ds.duplicate_ids(), vec!["a".to_string()]);
        assert_eq!(ds.columns().into_iter().collect::<Vec<_>>(), vec![SAMPLE_ID_COLUMN]);
    }
}
