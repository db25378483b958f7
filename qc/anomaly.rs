//! Anomaly scoring of a single observation against a predictive replicate set.
//!
//! All values handed to [`score`] must already be in raw SNP-count units; the
//! inverse standardization is applied by the caller (see
//! `pipeline::AnalysisContext::evaluate_platform`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error(
        "Cannot score against {count} replicates with standard deviation {std_dev}; at least 2 replicates with non-zero spread are required."
    )]
    InsufficientReplicates { count: usize, std_dev: f64 },
    #[error("The observed value {0} is not finite.")]
    NonFiniteObservation(f64),
    #[error("Replicate {index} is not finite ({value}).")]
    NonFiniteReplicate { index: usize, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Sidedness {
    OneSided,
    #[default]
    TwoSided,
}

impl fmt::Display for Sidedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sidedness::OneSided => write!(f, "one-sided"),
            Sidedness::TwoSided => write!(f, "two-sided"),
        }
    }
}

/// How unusual one observation is relative to its predictive distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScore {
    /// Empirical tail probability; values near 0 sit in an extreme tail.
    pub p_value: f64,
    /// Distance from the replicate mean in replicate standard deviations.
    pub sd_distance: f64,
    pub replicate_mean: f64,
    pub replicate_sd: f64,
    pub observed: f64,
    pub sidedness: Sidedness,
}

/// Scores `observed` against `replicates`.
///
/// The tail proportion is taken on the side of the replicate mean that the
/// observation lies on: at or below the mean it is the share of replicates at
/// or above `observed`, otherwise the share at or below it. The p-value is
/// `1 - proportion` for one-sided scoring and `1 - proportion / 2` for
/// two-sided scoring.
pub fn score(
    replicates: &[f64],
    observed: f64,
    sidedness: Sidedness,
) -> Result<AnomalyScore, ScoreError> {
    if !observed.is_finite() {
        return Err(ScoreError::NonFiniteObservation(observed));
    }
    if let Some((index, &value)) = replicates.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ScoreError::NonFiniteReplicate { index, value });
    }

    let n = replicates.len();
    if n < 2 {
        return Err(ScoreError::InsufficientReplicates {
            count: n,
            std_dev: 0.0,
        });
    }

    let mean = replicates.iter().sum::<f64>() / n as f64;
    let variance = replicates.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev <= 0.0 || !std_dev.is_finite() {
        return Err(ScoreError::InsufficientReplicates { count: n, std_dev });
    }

    let in_tail = if observed <= mean {
        replicates.iter().filter(|&&v| v >= observed).count()
    } else {
        replicates.iter().filter(|&&v| v <= observed).count()
    };
    let proportion = in_tail as f64 / n as f64;
    let p_value = match sidedness {
        Sidedness::OneSided => 1.0 - proportion,
        Sidedness::TwoSided => 1.0 - proportion / 2.0,
    };

    Ok(AnomalyScore {
        p_value,
        sd_distance: (mean - observed).abs() / std_dev,
        replicate_mean: mean,
        replicate_sd: std_dev,
        observed,
        sidedness,
    })
}
