use std::collections::BTreeMap;

use log::debug;
use regex::Regex;

use super::model::{MetadataValue, STUDY_COLUMN};
use crate::error::{QcError, Result};

/// Capture groups a filename pattern may define.
pub const FILENAME_GROUPS: &[&str] = &["fileName", "study", "matrix", "rack", "tech", "date", "expno"];

/// Extracts study / matrix / rack / technician / date / experiment number
/// from a sample identifier with a single regex match.
#[derive(Debug, Clone)]
pub struct FilenameParser {
    pattern: Regex,
}

impl FilenameParser {
    /// Compile `pattern`; it must define at least one of [`FILENAME_GROUPS`].
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| QcError::config(format!("filenameSpec does not compile: {e}")))?;
        let known = pattern
            .capture_names()
            .flatten()
            .any(|name| FILENAME_GROUPS.contains(&name));
        if !known {
            return Err(QcError::config(format!(
                "filenameSpec defines none of the groups {FILENAME_GROUPS:?}"
            )));
        }
        Ok(FilenameParser { pattern })
    }

    /// Named groups matched in `sample_id`, empty when it does not match.
    pub fn parse(&self, sample_id: &str) -> BTreeMap<String, String> {
        let Some(caps) = self.pattern.captures(sample_id) else {
            debug!("'{sample_id}' does not match the filename pattern");
            return BTreeMap::new();
        };
        FILENAME_GROUPS
            .iter()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect()
    }

    /// Merge parsed groups into `metadata` as categorical text without
    /// overwriting existing columns. `study` also fills `Study`.
    pub fn annotate(&self, sample_id: &str, metadata: &mut BTreeMap<String, MetadataValue>) {
        for (key, value) in self.parse(sample_id) {
            if key == "study" {
                metadata
                    .entry(STUDY_COLUMN.to_string())
                    .or_insert_with(|| MetadataValue::String(value.clone()));
            }
            metadata.entry(key).or_insert(MetadataValue::String(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = r"^(?P<fileName>(?P<study>[A-Za-z0-9]+)_(?P<matrix>[A-Za-z]+)_(?P<rack>R\d+)_(?P<tech>[A-Za-z]+)_(?P<date>\d{8}))/(?P<expno>\d+)$";

    #[test]
    fn test_parse_groups() {
        let parser = FilenameParser::new(PATTERN).unwrap();
        let groups = parser.parse("ST01_plasma_R3_ab_20170314/10");
        assert_eq!(groups["study"], "ST01");
        assert_eq!(groups["matrix"], "plasma");
        assert_eq!(groups["rack"], "R3");
        assert_eq!(groups["expno"], "10");
        assert_eq!(groups["fileName"], "ST01_plasma_R3_ab_20170314");
        assert!(parser.parse("not-a-match").is_empty());
    }

    #[test]
    fn test_annotate_keeps_existing_columns() {
        let parser = FilenameParser::new(PATTERN).unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("Study".to_string(), MetadataValue::String("Override".into()));
        parser.annotate("ST01_urine_R1_cd_20170101/20", &mut metadata);
        assert_eq!(metadata["Study"], MetadataValue::String("Override".into()));
        assert_eq!(metadata["matrix"], MetadataValue::String("urine".into()));
    }

    #[test]
    fn test_rejects_bad_patterns() {
        assert!(FilenameParser::new("(unclosed").is_err());
        assert!(FilenameParser::new(r"^(?P<other>\w+)$").is_err());
    }
}
