//! Posterior-predictive model check.
//!
//! Overlays, for the first few observations, the simulated marginal
//! distribution of the outcome against the single observed standardized value.
//! The result is a rendering-ready structure; drawing it is left to the caller.
//! It carries no pass/fail verdict.

use crate::diagnostics::quantile_sorted;
use ndarray::{Array1, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckError {
    #[error("Replicates cover {replicated} observations but {observed} observed outcomes were supplied.")]
    ObservationCountMismatch { replicated: usize, observed: usize },
    #[error("Each observation needs at least 2 replicates to be checked, but {0} were supplied.")]
    TooFewReplicates(usize),
}

/// One observed row against its predictive distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCheck {
    pub row: usize,
    pub observed: f64,
    pub replicates: Array1<f64>,
    pub mean: f64,
    pub sd: f64,
    pub q05: f64,
    pub q50: f64,
    pub q95: f64,
    /// Share of replicates at or above the observed value.
    pub fraction_at_or_above: f64,
}

impl RowCheck {
    fn new(row: usize, observed: f64, replicates: ArrayView1<f64>) -> Self {
        let mut sorted = replicates.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let at_or_above = sorted.iter().filter(|&&v| v >= observed).count() as f64;
        Self {
            row,
            observed,
            replicates: replicates.to_owned(),
            mean: replicates.sum() / n,
            sd: replicates.std(1.0),
            q05: quantile_sorted(&sorted, 0.05),
            q50: quantile_sorted(&sorted, 0.5),
            q95: quantile_sorted(&sorted, 0.95),
            fraction_at_or_above: at_or_above / n,
        }
    }

    pub fn inside_central_90(&self) -> bool {
        self.observed >= self.q05 && self.observed <= self.q95
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCheck {
    pub rows: Vec<RowCheck>,
    /// Share of checked rows whose observation lies in the central 90% interval.
    pub interval_coverage: f64,
}

/// Compares the first `max_rows` observations against their replicates.
///
/// `replicates_per_observation` is `N x S`: row `i` holds the simulated
/// distribution of observation `i`. `observed` are the standardized outcomes.
pub fn check(
    replicates_per_observation: ArrayView2<f64>,
    observed: ArrayView1<f64>,
    max_rows: usize,
) -> Result<ModelCheck, CheckError> {
    if replicates_per_observation.nrows() != observed.len() {
        return Err(CheckError::ObservationCountMismatch {
            replicated: replicates_per_observation.nrows(),
            observed: observed.len(),
        });
    }
    if replicates_per_observation.ncols() < 2 {
        return Err(CheckError::TooFewReplicates(replicates_per_observation.ncols()));
    }

    let rows: Vec<RowCheck> = replicates_per_observation
        .outer_iter()
        .zip(observed.iter())
        .take(max_rows)
        .enumerate()
        .map(|(i, (replicates, &y))| RowCheck::new(i, y, replicates))
        .collect();

    let interval_coverage = if rows.is_empty() {
        0.0
    } else {
        rows.iter().filter(|r| r.inside_central_90()).count() as f64 / rows.len() as f64
    };
    log::info!(
        "Model check over {} rows: {:.0}% of observations inside their central 90% predictive interval",
        rows.len(),
        100.0 * interval_coverage
    );

    Ok(ModelCheck {
        rows,
        interval_coverage,
    })
}
