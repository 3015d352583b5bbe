//! Expected runtime layout offsets per (runtime version, pointer width).
//!
//! Rows are matched by version-string prefix plus exact pointer size. A
//! descriptor that matches no row is an unclassified configuration and a
//! descriptor that matches several rows is ambiguous; both are failures.

use probe_core::{HarnessError, OffsetField, OffsetMismatch, OffsetTable, PointerSize, RuntimeDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod load;

pub use load::{load_table, parse_table_document, table_document, TABLE_SCHEMA_VERSION};

pub type ExpectedOffsets = BTreeMap<OffsetField, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationRow {
    pub version_prefix: String,
    pub pointer_size: PointerSize,
    pub expected: ExpectedOffsets,
}

impl ExpectationRow {
    pub fn new(version_prefix: impl Into<String>, pointer_size: PointerSize) -> Self {
        Self {
            version_prefix: version_prefix.into(),
            pointer_size,
            expected: BTreeMap::new(),
        }
    }

    pub fn expecting(mut self, field: OffsetField, value: u64) -> Self {
        self.expected.insert(field, value);
        self
    }

    pub fn matches(&self, descriptor: &RuntimeDescriptor) -> bool {
        self.pointer_size == descriptor.pointer_size
            && descriptor.version.starts_with(&self.version_prefix)
    }
}

/// Selects the single row matching `descriptor`, scanning every row so that
/// overlapping rows are reported instead of silently shadowed.
pub fn select_row<'a>(
    descriptor: &RuntimeDescriptor,
    rows: &'a [ExpectationRow],
) -> Result<&'a ExpectationRow, HarnessError> {
    let matched: Vec<&ExpectationRow> = rows.iter().filter(|r| r.matches(descriptor)).collect();
    match matched.as_slice() {
        [] => Err(HarnessError::UnclassifiedConfiguration {
            version: descriptor.version.clone(),
            pointer_size: descriptor.pointer_size,
        }),
        [row] => Ok(row),
        many => Err(HarnessError::AmbiguousConfiguration {
            version: descriptor.version.clone(),
            pointer_size: descriptor.pointer_size,
            prefixes: many.iter().map(|r| r.version_prefix.clone()).collect(),
        }),
    }
}

pub fn compare(expected: &ExpectedOffsets, actual: &OffsetTable) -> Vec<OffsetMismatch> {
    expected
        .iter()
        .filter_map(|(field, want)| {
            let got = actual.get(*field);
            (got != *want).then_some(OffsetMismatch {
                field: *field,
                expected: *want,
                actual: got,
            })
        })
        .collect()
}

/// Checks `actual` against the row selected for `descriptor` and returns that
/// row. Every differing field is reported, not just the first.
pub fn validate<'a>(
    descriptor: &RuntimeDescriptor,
    actual: &OffsetTable,
    rows: &'a [ExpectationRow],
) -> Result<&'a ExpectationRow, HarnessError> {
    let row = select_row(descriptor, rows)?;
    let mismatches = compare(&row.expected, actual);
    if mismatches.is_empty() {
        Ok(row)
    } else {
        Err(HarnessError::OffsetMismatch { mismatches })
    }
}

/// A validated set of rows in which no runtime descriptor can match more than
/// one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectationTable {
    rows: Vec<ExpectationRow>,
}

impl ExpectationTable {
    pub fn new(rows: Vec<ExpectationRow>) -> Result<Self, HarnessError> {
        if rows.is_empty() {
            return Err(HarnessError::InvalidExpectationTable(
                "table has no rows".to_string(),
            ));
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.version_prefix.is_empty() {
                return Err(HarnessError::InvalidExpectationTable(format!(
                    "row {} has an empty version prefix",
                    idx
                )));
            }
            if row.expected.is_empty() {
                return Err(HarnessError::InvalidExpectationTable(format!(
                    "row {} ({}, {}) expects no offsets",
                    idx, row.version_prefix, row.pointer_size
                )));
            }
        }
        for (i, a) in rows.iter().enumerate() {
            for (j, b) in rows.iter().enumerate().skip(i + 1) {
                if a.pointer_size != b.pointer_size {
                    continue;
                }
                if a.version_prefix == b.version_prefix {
                    return Err(HarnessError::InvalidExpectationTable(format!(
                        "rows {} and {} both cover ({}, {})",
                        i, j, a.version_prefix, a.pointer_size
                    )));
                }
                if a.version_prefix.starts_with(&b.version_prefix)
                    || b.version_prefix.starts_with(&a.version_prefix)
                {
                    return Err(HarnessError::InvalidExpectationTable(format!(
                        "rows {} and {} overlap: prefixes '{}' and '{}' with {}-byte pointers",
                        i, j, a.version_prefix, b.version_prefix, a.pointer_size
                    )));
                }
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ExpectationRow] {
        &self.rows
    }

    pub fn lookup(&self, descriptor: &RuntimeDescriptor) -> Result<&ExpectationRow, HarnessError> {
        select_row(descriptor, &self.rows)
    }

    pub fn validate(
        &self,
        descriptor: &RuntimeDescriptor,
        actual: &OffsetTable,
    ) -> Result<&ExpectationRow, HarnessError> {
        validate(descriptor, actual, &self.rows)
    }
}

fn art_row(
    version_prefix: &str,
    pointer_size: PointerSize,
    class_linker: u64,
    trampoline: u64,
    method: [u64; 4],
) -> ExpectationRow {
    let [interpreter_code, jni_code, quick_code, access_flags] = method;
    ExpectationRow::new(version_prefix, pointer_size)
        .expecting(OffsetField::ClassLinker, class_linker)
        .expecting(OffsetField::QuickGenericJniTrampoline, trampoline)
        .expecting(OffsetField::MethodInterpreterCode, interpreter_code)
        .expecting(OffsetField::MethodJniCode, jni_code)
        .expecting(OffsetField::MethodQuickCode, quick_code)
        .expecting(OffsetField::MethodAccessFlags, access_flags)
}

/// ART layouts measured on Android 5.0, 5.1 and 6.0 devices.
pub fn default_rows() -> Vec<ExpectationRow> {
    vec![
        art_row("5.0", PointerSize::Four, 208, 224, [24, 32, 40, 56]),
        art_row("5.1", PointerSize::Four, 212, 296, [36, 40, 44, 20]),
        art_row("6.0", PointerSize::Four, 236, 296, [28, 32, 36, 12]),
        art_row("6.0", PointerSize::Eight, 392, 440, [32, 40, 48, 12]),
    ]
}

pub fn default_table() -> ExpectationTable {
    ExpectationTable {
        rows: default_rows(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::MethodOffsets;

    fn descriptor(version: &str, pointer_size: PointerSize) -> RuntimeDescriptor {
        RuntimeDescriptor {
            version: version.to_string(),
            pointer_size,
        }
    }

    fn offsets(class_linker: u64) -> OffsetTable {
        OffsetTable {
            class_linker,
            quick_generic_jni_trampoline: 296,
            method: MethodOffsets {
                interpreter_code: 28,
                jni_code: 32,
                quick_code: 36,
                access_flags: 12,
            },
        }
    }

    #[test]
    fn matching_prefix_and_equal_offsets_pass() {
        let rows = vec![ExpectationRow::new("6.0", PointerSize::Four)
            .expecting(OffsetField::ClassLinker, 236)];
        let row = validate(&descriptor("6.0.1", PointerSize::Four), &offsets(236), &rows)
            .expect("6.0.1 on 32-bit should pass");
        assert_eq!(row.version_prefix, "6.0");
    }

    #[test]
    fn differing_offset_names_field_expected_and_actual() {
        let rows = vec![ExpectationRow::new("6.0", PointerSize::Four)
            .expecting(OffsetField::ClassLinker, 236)];
        let err = validate(&descriptor("6.0.1", PointerSize::Four), &offsets(237), &rows)
            .expect_err("237 should not match 236");
        match err {
            HarnessError::OffsetMismatch { mismatches } => {
                assert_eq!(
                    mismatches,
                    vec![OffsetMismatch {
                        field: OffsetField::ClassLinker,
                        expected: 236,
                        actual: 237,
                    }]
                );
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn every_mismatch_is_reported() {
        let table = default_table();
        let mut actual = offsets(1);
        actual.method.access_flags = 99;
        let err = table
            .validate(&descriptor("6.0.1", PointerSize::Four), &actual)
            .expect_err("two fields differ");
        let HarnessError::OffsetMismatch { mismatches } = err else {
            panic!("expected offset mismatch");
        };
        let fields: Vec<OffsetField> = mismatches.iter().map(|m| m.field).collect();
        assert_eq!(
            fields,
            vec![OffsetField::ClassLinker, OffsetField::MethodAccessFlags]
        );
    }

    #[test]
    fn unmatched_descriptor_is_unclassified() {
        let err = validate(
            &descriptor("7.0", PointerSize::Four),
            &offsets(236),
            &default_rows(),
        )
        .expect_err("7.0 has no row");
        match err {
            HarnessError::UnclassifiedConfiguration {
                version,
                pointer_size,
            } => {
                assert_eq!(version, "7.0");
                assert_eq!(pointer_size, PointerSize::Four);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn pointer_size_must_match_exactly() {
        let err = default_table()
            .lookup(&descriptor("5.1.1", PointerSize::Eight))
            .expect_err("5.1 only has a 32-bit row");
        assert_eq!(err.code(), "unclassified_configuration");
    }

    #[test]
    fn version_matching_is_case_sensitive_prefix() {
        let rows = vec![ExpectationRow::new("N", PointerSize::Eight)
            .expecting(OffsetField::ClassLinker, 1)];
        assert!(select_row(&descriptor("N-preview", PointerSize::Eight), &rows).is_ok());
        assert!(select_row(&descriptor("n-preview", PointerSize::Eight), &rows).is_err());
        assert!(select_row(&descriptor("7.N", PointerSize::Eight), &rows).is_err());
    }

    #[test]
    fn overlapping_raw_rows_are_ambiguous() {
        let rows = vec![
            ExpectationRow::new("6", PointerSize::Four).expecting(OffsetField::ClassLinker, 236),
            ExpectationRow::new("6.0", PointerSize::Four).expecting(OffsetField::ClassLinker, 236),
        ];
        let err = select_row(&descriptor("6.0.1", PointerSize::Four), &rows)
            .expect_err("both rows match");
        match err {
            HarnessError::AmbiguousConfiguration { prefixes, .. } => {
                assert_eq!(prefixes, vec!["6".to_string(), "6.0".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn table_construction_rejects_duplicates_and_nested_prefixes() {
        let dup = ExpectationTable::new(vec![
            ExpectationRow::new("6.0", PointerSize::Four).expecting(OffsetField::ClassLinker, 236),
            ExpectationRow::new("6.0", PointerSize::Four).expecting(OffsetField::ClassLinker, 237),
        ]);
        assert!(matches!(
            dup,
            Err(HarnessError::InvalidExpectationTable(_))
        ));

        let nested = ExpectationTable::new(vec![
            ExpectationRow::new("6", PointerSize::Eight).expecting(OffsetField::ClassLinker, 392),
            ExpectationRow::new("6.0", PointerSize::Eight).expecting(OffsetField::ClassLinker, 392),
        ]);
        assert!(nested.is_err());

        let distinct_widths = ExpectationTable::new(vec![
            ExpectationRow::new("6.0", PointerSize::Four).expecting(OffsetField::ClassLinker, 236),
            ExpectationRow::new("6.0", PointerSize::Eight).expecting(OffsetField::ClassLinker, 392),
        ]);
        assert!(distinct_widths.is_ok());

        assert!(ExpectationTable::new(Vec::new()).is_err());
        assert!(ExpectationTable::new(vec![ExpectationRow::new("6.0", PointerSize::Four)]).is_err());
    }

    #[test]
    fn default_table_has_no_ambiguous_descriptor() {
        let rows = default_rows();
        ExpectationTable::new(rows.clone()).expect("default rows form a valid table");
        for row in &rows {
            for suffix in ["", ".0", ".1", "_r1"] {
                let d = descriptor(&format!("{}{}", row.version_prefix, suffix), row.pointer_size);
                let selected = select_row(&d, &rows).expect("exactly one row");
                assert_eq!(selected, row);
            }
        }
    }

    #[test]
    fn default_table_covers_every_field_for_each_flavor() {
        for row in default_table().rows() {
            assert_eq!(row.expected.len(), OffsetField::ALL.len(), "{}", row.version_prefix);
        }
        let table = default_table();
        let row = table
            .lookup(&descriptor("6.0.1", PointerSize::Eight))
            .expect("6.0 64-bit row");
        assert_eq!(row.expected[&OffsetField::ClassLinker], 392);
        assert_eq!(row.expected[&OffsetField::QuickGenericJniTrampoline], 440);
    }
}
