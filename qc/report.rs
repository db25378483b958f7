//! Tab-separated output of run results.
//!
//! The files are meant for downstream plotting and spreadsheets, so every
//! record is flat and every file has a header row.

use crate::check::ModelCheck;
use crate::diagnostics::{ConvergenceReport, PlatformSummary};
use crate::pipeline::PlatformEvaluation;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write TSV record: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Model check covers {rows} rows but only {ids} study identifiers were supplied.")]
    MissingStudyIds { rows: usize, ids: usize },
}

fn tsv_writer<W: Write>(sink: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(sink)
}

#[derive(Serialize)]
struct CheckPoint<'a> {
    row: usize,
    study: &'a str,
    kind: &'static str,
    value: f64,
}

/// Long format: one `observed` line and one `replicate` line per simulated
/// value, for every checked row. Values are on the standardized scale.
pub fn write_model_check<W: Write>(
    sink: W,
    result: &ModelCheck,
    study_ids: &[String],
) -> Result<(), ReportError> {
    if study_ids.len() < result.rows.len() {
        return Err(ReportError::MissingStudyIds {
            rows: result.rows.len(),
            ids: study_ids.len(),
        });
    }
    let mut writer = tsv_writer(sink);
    for row in &result.rows {
        let study = study_ids[row.row].as_str();
        writer.serialize(CheckPoint {
            row: row.row,
            study,
            kind: "observed",
            value: row.observed,
        })?;
        for &value in &row.replicates {
            writer.serialize(CheckPoint {
                row: row.row,
                study,
                kind: "replicate",
                value,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct CheckSummary<'a> {
    row: usize,
    study: &'a str,
    observed: f64,
    mean: f64,
    sd: f64,
    q05: f64,
    q50: f64,
    q95: f64,
    fraction_at_or_above: f64,
}

/// One line per checked row with the replicate summaries.
pub fn write_model_check_summary<W: Write>(
    sink: W,
    result: &ModelCheck,
    study_ids: &[String],
) -> Result<(), ReportError> {
    if study_ids.len() < result.rows.len() {
        return Err(ReportError::MissingStudyIds {
            rows: result.rows.len(),
            ids: study_ids.len(),
        });
    }
    let mut writer = tsv_writer(sink);
    for row in &result.rows {
        writer.serialize(CheckSummary {
            row: row.row,
            study: &study_ids[row.row],
            observed: row.observed,
            mean: row.mean,
            sd: row.sd,
            q05: row.q05,
            q50: row.q50,
            q95: row.q95,
            fraction_at_or_above: row.fraction_at_or_above,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct EvaluationRecord<'a> {
    platform: &'a str,
    observed: f64,
    predictive_mean: f64,
    predictive_sd: f64,
    p_value: f64,
    sd_distance: f64,
    sidedness: String,
}

pub fn write_evaluations<W: Write>(sink: W, evaluations: &[PlatformEvaluation]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    for evaluation in evaluations {
        let score = &evaluation.score;
        writer.serialize(EvaluationRecord {
            platform: &evaluation.platform,
            observed: score.observed,
            predictive_mean: score.replicate_mean,
            predictive_sd: score.replicate_sd,
            p_value: score.p_value,
            sd_distance: score.sd_distance,
            sidedness: score.sidedness.to_string(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    platform: &'a str,
    mean: f64,
    sd: f64,
    lower_95: f64,
    upper_95: f64,
    rhat: Option<f64>,
    ess: f64,
}

/// Posterior platform means (raw units) joined with their mixing diagnostics.
pub fn write_platform_summaries<W: Write>(
    sink: W,
    summaries: &[PlatformSummary],
    diagnostics: &ConvergenceReport,
) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    for (j, summary) in summaries.iter().enumerate() {
        let mixing = diagnostics.parameters.get(j);
        writer.serialize(SummaryRecord {
            platform: &summary.platform,
            mean: summary.mean,
            sd: summary.sd,
            lower_95: summary.lower_95,
            upper_95: summary.upper_95,
            rhat: mixing.and_then(|p| p.rhat),
            ess: mixing.map_or(f64::NAN, |p| p.ess),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn create(path: &Path) -> Result<File, ReportError> {
    Ok(File::create(path)?)
}
