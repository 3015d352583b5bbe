use crate::{ExpectationRow, ExpectationTable};
use anyhow::{anyhow, Context, Result};
use probe_schemas::{validate_value, EXPECTATION_TABLE_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub const TABLE_SCHEMA_VERSION: &str = "expectation_table_v1";

#[derive(Debug, Serialize, Deserialize)]
struct TableDocument {
    schema_version: String,
    rows: Vec<ExpectationRow>,
}

/// Reads an expectation table from YAML (`.yaml`/`.yml`) or JSON.
pub fn load_table(path: &Path) -> Result<ExpectationTable> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading expectation table {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?
    };
    parse_table_document(&value).with_context(|| format!("in {}", path.display()))
}

pub fn parse_table_document(value: &Value) -> Result<ExpectationTable> {
    validate_value(EXPECTATION_TABLE_SCHEMA, value)?;
    let doc: TableDocument = serde_json::from_value(value.clone())?;
    if doc.schema_version != TABLE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported expectation table version: {}",
            doc.schema_version
        ));
    }
    Ok(ExpectationTable::new(doc.rows)?)
}

pub fn table_document(table: &ExpectationTable) -> Result<Value> {
    Ok(serde_json::to_value(TableDocument {
        schema_version: TABLE_SCHEMA_VERSION.to_string(),
        rows: table.rows().to_vec(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_table;
    use probe_core::{OffsetField, PointerSize};
    use std::path::PathBuf;

    struct TempFile {
        path: PathBuf,
    }

    impl TempFile {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "probe_matrix_{}_{}",
                std::process::id(),
                name
            ));
            fs::write(&path, contents).expect("write temp file");
            Self { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    #[test]
    fn loads_yaml_table() {
        let file = TempFile::new(
            "table.yaml",
            r#"
schema_version: expectation_table_v1
rows:
  - version_prefix: "7.0"
    pointer_size: 8
    expected:
      classLinkerOffset: 480
      method.accessFlags: 4
"#,
        );
        let table = load_table(&file.path).expect("load yaml table");
        assert_eq!(table.rows().len(), 1);
        let row = &table.rows()[0];
        assert_eq!(row.pointer_size, PointerSize::Eight);
        assert_eq!(row.expected[&OffsetField::ClassLinker], 480);
        assert_eq!(row.expected[&OffsetField::MethodAccessFlags], 4);
    }

    #[test]
    fn default_table_survives_json_document_round_trip() {
        let doc = table_document(&default_table()).expect("document");
        let file = TempFile::new("table.json", &doc.to_string());
        let table = load_table(&file.path).expect("load json table");
        assert_eq!(table, default_table());
    }

    #[test]
    fn schema_violations_mention_the_file() {
        let file = TempFile::new(
            "bad.json",
            r#"{"schema_version":"expectation_table_v1","rows":[{"version_prefix":"6.0","pointer_size":4,"expected":{"bogus":1}}]}"#,
        );
        let err = load_table(&file.path).expect_err("unknown field");
        let msg = format!("{:#}", err);
        assert!(msg.contains("schema validation failed"), "{}", msg);
        assert!(msg.contains("bad.json"), "{}", msg);
    }

    #[test]
    fn overlapping_rows_in_a_file_are_rejected() {
        let file = TempFile::new(
            "overlap.json",
            r#"{"schema_version":"expectation_table_v1","rows":[
                {"version_prefix":"6","pointer_size":4,"expected":{"classLinkerOffset":236}},
                {"version_prefix":"6.0","pointer_size":4,"expected":{"classLinkerOffset":236}}]}"#,
        );
        let err = load_table(&file.path).expect_err("nested prefixes");
        assert!(format!("{:#}", err).contains("overlap"));
    }
}
