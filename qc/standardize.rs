//! Outcome standardization.
//!
//! The parameters are computed once from the fitting sample and then frozen.
//! Every later transform or inverse transform in a run must go through the same
//! [`Standardization`] value; recomputing them from another sample shifts every
//! downstream tail probability without any visible failure.

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScaleError {
    #[error("Standardization needs at least 2 outcomes, but {0} were supplied.")]
    TooFewObservations(usize),
    #[error("The outcome sample has a degenerate scale (standard deviation {0}); it cannot be standardized.")]
    DegenerateScale(f64),
    #[error("Outcome {index} is not finite ({value}).")]
    NonFiniteOutcome { index: usize, value: f64 },
}

/// Frozen centering and scaling parameters for the outcome variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standardization {
    mean: f64,
    std_dev: f64,
}

impl Standardization {
    /// Sample mean and sample standard deviation (n - 1 denominator).
    pub fn fit(outcomes: ArrayView1<f64>) -> Result<Self, ScaleError> {
        let n = outcomes.len();
        if n < 2 {
            return Err(ScaleError::TooFewObservations(n));
        }
        if let Some((index, &value)) = outcomes.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(ScaleError::NonFiniteOutcome { index, value });
        }

        let mean = outcomes.sum() / n as f64;
        let std_dev = outcomes.std(1.0);
        if !std_dev.is_finite() || std_dev <= 0.0 {
            return Err(ScaleError::DegenerateScale(std_dev));
        }

        log::debug!("Standardization fitted on {n} outcomes: mean={mean:.4}, sd={std_dev:.4}");
        Ok(Self { mean, std_dev })
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn transform(&self, y: f64) -> f64 {
        (y - self.mean) / self.std_dev
    }

    pub fn inverse_transform(&self, z: f64) -> f64 {
        z * self.std_dev + self.mean
    }

    pub fn transform_all(&self, y: ArrayView1<f64>) -> Array1<f64> {
        y.mapv(|v| self.transform(v))
    }

    pub fn inverse_transform_all(&self, z: ArrayView1<f64>) -> Array1<f64> {
        z.mapv(|v| self.inverse_transform(v))
    }
}
