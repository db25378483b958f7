//! # Study Table Loading and Input-Contract Filters
//!
//! This module is the entry point for user-provided study tables. It reads a
//! tab-separated file with a fixed header, validates the values it finds, and
//! applies the input-contract filters before anything reaches the model:
//!
//! - Strict Schema: the columns `study`, `snps`, `platform` and
//!   `known_loci_excluded` are required; `samples` and `lambda_gc` are optional
//!   ancillary covariates that are carried along but never modeled.
//! - Filters: studies with a missing required field are dropped, then studies
//!   whose known-locus exclusion count reaches the configured ceiling, then
//!   every platform left with fewer studies than the configured minimum.
//! - No label normalization happens here. Platform labels are passed through
//!   verbatim; a label outside the vocabulary fails later, at encoding time.

use crate::config::FilterConfig;
use ndarray::Array1;
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const STUDY_COLUMN: &str = "study";
pub const SNPS_COLUMN: &str = "snps";
pub const PLATFORM_COLUMN: &str = "platform";
pub const KNOWN_LOCI_COLUMN: &str = "known_loci_excluded";
pub const SAMPLES_COLUMN: &str = "samples";
pub const LAMBDA_COLUMN: &str = "lambda_gc";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Non-finite value {value} found in column '{column_name}' for study '{study}'.")]
    NonFiniteValue {
        column_name: &'static str,
        study: String,
        value: f64,
    },
    #[error("Study '{study}' has a negative or fractional value {value} in column '{column_name}'.")]
    InvalidCount {
        column_name: &'static str,
        study: String,
        value: f64,
    },
    #[error(
        "No studies remain after filtering ({read} read, {missing} with missing fields, {known_loci} over the known-locus ceiling, {small_platform} on platforms with too few studies)."
    )]
    NoStudiesRemain {
        read: usize,
        missing: usize,
        known_loci: usize,
        small_platform: usize,
    },
}

/// One study's record as read from disk; any field may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStudy {
    pub study: Option<String>,
    pub snps: Option<f64>,
    pub platform: Option<String>,
    pub known_loci_excluded: Option<f64>,
    pub samples: Option<f64>,
    pub lambda_gc: Option<f64>,
}

/// A study that satisfies the input contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub study: String,
    /// Post-QC SNP count, the modeled outcome.
    pub snps: f64,
    pub platform: String,
    pub known_loci_excluded: u64,
    pub samples: Option<f64>,
    pub lambda_gc: Option<f64>,
}

/// Counts of what each filter removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterReport {
    pub read: usize,
    pub missing_fields: usize,
    pub known_loci: usize,
    pub small_platform: usize,
    pub kept: usize,
}

/// Observations that passed every filter, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyTable {
    observations: Vec<Observation>,
}

impl StudyTable {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn outcomes(&self) -> Array1<f64> {
        self.observations.iter().map(|o| o.snps).collect()
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.observations.iter().map(|o| o.platform.as_str()).collect()
    }

    pub fn study_ids(&self) -> Vec<&str> {
        self.observations.iter().map(|o| o.study.as_str()).collect()
    }
}

/// Reads a study table and applies the input-contract filters.
pub fn load_studies(path: &Path, filters: &FilterConfig) -> Result<(StudyTable, FilterReport), DataError> {
    let raw = internal::read_raw_studies(path)?;
    apply_filters(raw, filters)
}

/// Validates raw records and applies the filters in contract order.
pub fn apply_filters(
    raw: Vec<RawStudy>,
    filters: &FilterConfig,
) -> Result<(StudyTable, FilterReport), DataError> {
    let mut report = FilterReport {
        read: raw.len(),
        ..FilterReport::default()
    };

    let mut complete = Vec::with_capacity(raw.len());
    for record in raw {
        let (Some(study), Some(snps), Some(platform), Some(known_loci)) = (
            record.study,
            record.snps,
            record.platform,
            record.known_loci_excluded,
        ) else {
            report.missing_fields += 1;
            continue;
        };

        if !snps.is_finite() {
            return Err(DataError::NonFiniteValue {
                column_name: SNPS_COLUMN,
                study,
                value: snps,
            });
        }
        if snps < 0.0 {
            return Err(DataError::InvalidCount {
                column_name: SNPS_COLUMN,
                study,
                value: snps,
            });
        }
        if !known_loci.is_finite() || known_loci < 0.0 || known_loci.fract() != 0.0 {
            return Err(DataError::InvalidCount {
                column_name: KNOWN_LOCI_COLUMN,
                study,
                value: known_loci,
            });
        }
        for (column_name, value) in [
            (SAMPLES_COLUMN, record.samples),
            (LAMBDA_COLUMN, record.lambda_gc),
        ] {
            if let Some(value) = value.filter(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValue {
                    column_name,
                    study,
                    value,
                });
            }
        }

        complete.push(Observation {
            study,
            snps,
            platform,
            known_loci_excluded: known_loci as u64,
            samples: record.samples,
            lambda_gc: record.lambda_gc,
        });
    }

    let before_loci = complete.len();
    complete.retain(|o| o.known_loci_excluded < filters.max_known_loci_excluded);
    report.known_loci = before_loci - complete.len();

    let mut per_platform: HashMap<&str, usize> = HashMap::new();
    for o in &complete {
        *per_platform.entry(o.platform.as_str()).or_default() += 1;
    }
    let small: HashSet<String> = per_platform
        .into_iter()
        .filter(|(_, count)| *count < filters.min_platform_studies)
        .map(|(platform, _)| platform.to_string())
        .collect();
    let before_platforms = complete.len();
    complete.retain(|o| !small.contains(&o.platform));
    report.small_platform = before_platforms - complete.len();
    report.kept = complete.len();

    log::info!(
        "Read {} studies: dropped {} with missing fields, {} with >= {} known-locus exclusions, {} on platforms with < {} studies; {} kept",
        report.read,
        report.missing_fields,
        report.known_loci,
        filters.max_known_loci_excluded,
        report.small_platform,
        filters.min_platform_studies,
        report.kept
    );
    if !small.is_empty() {
        let mut names: Vec<&str> = small.iter().map(String::as_str).collect();
        names.sort_unstable();
        log::debug!("Platforms dropped for having too few studies: {}", names.join(", "));
    }

    if complete.is_empty() {
        return Err(DataError::NoStudiesRemain {
            read: report.read,
            missing: report.missing_fields,
            known_loci: report.known_loci,
            small_platform: report.small_platform,
        });
    }

    Ok((StudyTable::new(complete), report))
}

/// Internal module for the Polars-specific reading logic.
mod internal {
    use super::*;

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let series = df.column(column_name)?;
        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        // A non-strict cast turns unparsable text into nulls.
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        Ok(casted.f64()?.into_iter().collect())
    }

    fn extract_text_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(column_name)?.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|value| {
                value
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }

    fn read_header(path: &Path) -> Result<HashSet<String>, DataError> {
        let mut header = String::new();
        BufReader::new(File::open(path)?).read_line(&mut header)?;
        Ok(header
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .map(|name| name.trim().to_string())
            .collect())
    }

    /// Identifier and label columns are read as text, never inferred, so
    /// values such as `0610` or `007` keep their leading zeros.
    fn text_schema() -> SchemaRef {
        let mut schema = Schema::with_capacity(2);
        for name in [STUDY_COLUMN, PLATFORM_COLUMN] {
            schema.with_column(PlSmallStr::from_static(name), DataType::String);
        }
        Arc::new(schema)
    }

    pub(super) fn read_raw_studies(path: &Path) -> Result<Vec<RawStudy>, DataError> {
        log::info!("Loading study table from '{}'", path.display());

        let columns = read_header(path)?;
        for required in [STUDY_COLUMN, SNPS_COLUMN, PLATFORM_COLUMN, KNOWN_LOCI_COLUMN] {
            if !columns.contains(required) {
                return Err(DataError::ColumnNotFound(required.to_string()));
            }
        }

        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_schema_overwrite(Some(text_schema()))
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let n = df.height();
        let optional = |name: &str| -> Result<Vec<Option<f64>>, DataError> {
            if columns.contains(name) {
                extract_numeric_column(&df, name)
            } else {
                Ok(vec![None; n])
            }
        };

        let studies = extract_text_column(&df, STUDY_COLUMN)?;
        let snps = extract_numeric_column(&df, SNPS_COLUMN)?;
        let platforms = extract_text_column(&df, PLATFORM_COLUMN)?;
        let known_loci = extract_numeric_column(&df, KNOWN_LOCI_COLUMN)?;
        let samples = optional(SAMPLES_COLUMN)?;
        let lambda_gc = optional(LAMBDA_COLUMN)?;

        Ok((0..n)
            .map(|i| RawStudy {
                study: studies[i].clone(),
                snps: snps[i],
                platform: platforms[i].clone(),
                known_loci_excluded: known_loci[i],
                samples: samples[i],
                lambda_gc: lambda_gc[i],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn raw(study: &str, snps: f64, platform: &str, known_loci: f64) -> RawStudy {
        RawStudy {
            study: Some(study.to_string()),
            snps: Some(snps),
            platform: Some(platform.to_string()),
            known_loci_excluded: Some(known_loci),
            samples: None,
            lambda_gc: None,
        }
    }

    fn platform_block(platform: &str, count: usize, base: f64) -> Vec<RawStudy> {
        (0..count)
            .map(|i| raw(&format!("{platform}-{i}"), base + i as f64 * 1000.0, platform, 0.0))
            .collect()
    }

    #[test]
    fn filters_apply_in_contract_order() {
        let mut records = platform_block("A", 7, 500_000.0);
        records.extend(platform_block("B", 6, 300_000.0));
        // Pushes B below six studies once the known-locus filter has run.
        records[8].known_loci_excluded = Some(100.0);
        records.push(RawStudy {
            snps: None,
            ..raw("missing", 0.0, "A", 0.0)
        });
        records.extend(platform_block("C", 2, 900_000.0));

        let (table, report) = apply_filters(records, &FilterConfig::default()).unwrap();
        assert_eq!(report.read, 7 + 6 + 1 + 2);
        assert_eq!(report.missing_fields, 1);
        assert_eq!(report.known_loci, 1);
        assert_eq!(report.small_platform, 5 + 2);
        assert_eq!(report.kept, 7);
        assert!(table.platforms().iter().all(|p| *p == "A"));
    }

    #[test]
    fn known_loci_below_the_ceiling_are_kept() {
        let mut records = platform_block("A", 6, 1.0);
        records[0].known_loci_excluded = Some(99.0);
        let (table, report) = apply_filters(records, &FilterConfig::default()).unwrap();
        assert_eq!(report.known_loci, 0);
        assert_eq!(table.len(), 6);
        assert_eq!(table.observations()[0].known_loci_excluded, 99);
    }

    #[test]
    fn everything_filtered_is_an_error() {
        let records = platform_block("A", 3, 1.0);
        assert!(matches!(
            apply_filters(records, &FilterConfig::default()),
            Err(DataError::NoStudiesRemain { read: 3, .. })
        ));
    }

    #[test]
    fn non_finite_outcome_is_an_input_error() {
        let mut records = platform_block("A", 6, 1.0);
        records[2].snps = Some(f64::NAN);
        match apply_filters(records, &FilterConfig::default()).unwrap_err() {
            DataError::NonFiniteValue { column_name, study, .. } => {
                assert_eq!(column_name, SNPS_COLUMN);
                assert_eq!(study, "A-2");
            }
            other => panic!("Expected NonFiniteValue, got {:?}", other),
        }
    }

    #[test]
    fn fractional_known_loci_is_an_input_error() {
        let mut records = platform_block("A", 6, 1.0);
        records[0].known_loci_excluded = Some(2.5);
        assert!(matches!(
            apply_filters(records, &FilterConfig::default()),
            Err(DataError::InvalidCount { column_name: KNOWN_LOCI_COLUMN, .. })
        ));
    }

    #[test]
    fn loads_and_filters_a_tsv_file() {
        let mut rows = vec!["study\tsnps\tplatform\tknown_loci_excluded\tlambda_gc".to_string()];
        for i in 0..6 {
            rows.push(format!("S{i}\t{}\tIllumina_660W\t{}\t1.02", 520_000 + i * 1500, i));
        }
        rows.push("S6\t\tIllumina_660W\t0\t1.01".to_string());
        rows.push("S7\t610000\tAffymetrix_6.0\t3\t1.00".to_string());
        let file = create_test_tsv(&rows.join("\n")).unwrap();

        let (table, report) = load_studies(file.path(), &FilterConfig::default()).unwrap();
        assert_eq!(report.read, 8);
        assert_eq!(report.missing_fields, 1);
        assert_eq!(report.small_platform, 1);
        assert_eq!(table.len(), 6);
        assert_eq!(table.study_ids()[0], "S0");
        assert_abs_diff_eq!(table.outcomes()[5], 527_500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(table.observations()[0].lambda_gc.unwrap(), 1.02, epsilon = 1e-12);
        assert_eq!(table.observations()[0].samples, None);
    }

    #[test]
    fn numeric_looking_identifiers_are_kept_verbatim() {
        let mut rows = vec!["study\tsnps\tplatform\tknown_loci_excluded".to_string()];
        for i in 0..6 {
            rows.push(format!("00{i}\t{}\t0610\t0", 600_000 + i * 1000));
        }
        rows.push("1\t601000\t0610\t0".to_string());
        let file = create_test_tsv(&rows.join("\n")).unwrap();

        let (table, _) = load_studies(file.path(), &FilterConfig::default()).unwrap();
        assert_eq!(table.len(), 7);
        assert_eq!(table.study_ids()[1], "001");
        assert_eq!(table.study_ids()[6], "1");
        assert!(table.platforms().iter().all(|p| *p == "0610"));
    }

    #[test]
    fn missing_required_column_is_reported() {
        let file = create_test_tsv("study\tsnps\tplatform\nS1\t1\tA").unwrap();
        match load_studies(file.path(), &FilterConfig::default()).unwrap_err() {
            DataError::ColumnNotFound(col) => assert_eq!(col, KNOWN_LOCI_COLUMN),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn non_numeric_outcome_column_is_reported() {
        let file = create_test_tsv(
            "study\tsnps\tplatform\tknown_loci_excluded\nS1\tmany\tA\t0\nS2\t12\tA\t0",
        )
        .unwrap();
        assert!(matches!(
            load_studies(file.path(), &FilterConfig::default()),
            Err(DataError::ColumnWrongType { .. })
        ));
    }
}
