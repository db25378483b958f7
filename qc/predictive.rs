//! Posterior-predictive simulation.
//!
//! For every posterior draw `d` the linear predictor is `η_d = μ_d · x`, where
//! `x` is a one-hot design row, and one replicate `ỹ_d ~ N(η_d, σ_d)` is drawn
//! together with its log-density under that same normal. This is the same
//! family and parameterization the fitting engine uses.

use crate::fit::PosteriorDraws;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Design row has length {found}, but the posterior covers {expected} platforms.")]
    DesignWidthMismatch { found: usize, expected: usize },
}

/// One simulated outcome and its log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Replicate {
    pub value: f64,
    pub log_lik: f64,
}

/// Log-density of `N(mean, sd)` at `x`.
pub fn normal_log_density(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln()
}

/// Lazy, one-shot sequence of replicates, one per posterior draw.
///
/// The stream borrows the draw set and the design row; running it again means
/// calling [`simulate`] again with a fresh (or re-seeded) RNG.
pub struct ReplicateStream<'a, 'r, R: Rng> {
    draws: &'a PosteriorDraws,
    design_row: ArrayView1<'a, f64>,
    rng: &'r mut R,
    next: usize,
}

impl<R: Rng> Iterator for ReplicateStream<'_, '_, R> {
    type Item = Replicate;

    fn next(&mut self) -> Option<Replicate> {
        if self.next >= self.draws.len() {
            return None;
        }
        let (means, sigma) = self.draws.draw(self.next);
        self.next += 1;

        let eta = means.dot(&self.design_row);
        let z: f64 = self.rng.sample(StandardNormal);
        let value = eta + sigma * z;
        Some(Replicate {
            value,
            log_lik: normal_log_density(value, eta, sigma),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.draws.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl<R: Rng> ExactSizeIterator for ReplicateStream<'_, '_, R> {}

/// Starts a replicate stream for `design_row`.
pub fn simulate<'a, 'r, R: Rng>(
    draws: &'a PosteriorDraws,
    design_row: ArrayView1<'a, f64>,
    rng: &'r mut R,
) -> Result<ReplicateStream<'a, 'r, R>, SimulationError> {
    if design_row.len() != draws.n_platforms() {
        return Err(SimulationError::DesignWidthMismatch {
            found: design_row.len(),
            expected: draws.n_platforms(),
        });
    }
    Ok(ReplicateStream {
        draws,
        design_row,
        rng,
        next: 0,
    })
}

/// Materialized replicate set for one design row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateSet {
    pub values: Array1<f64>,
    pub log_lik: Array1<f64>,
}

impl ReplicateSet {
    pub fn collect_from<R: Rng>(stream: ReplicateStream<'_, '_, R>) -> Self {
        let (values, log_lik): (Vec<f64>, Vec<f64>) =
            stream.map(|r| (r.value, r.log_lik)).unzip();
        Self {
            values: Array1::from(values),
            log_lik: Array1::from(log_lik),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Replicates for every row of `design`, as an `N x S` matrix: row `i` holds
/// the predictive distribution of observation `i`.
pub fn simulate_rows<R: Rng>(
    draws: &PosteriorDraws,
    design: ArrayView2<f64>,
    rng: &mut R,
) -> Result<Array2<f64>, SimulationError> {
    let mut replicates = Array2::<f64>::zeros((design.nrows(), draws.len()));
    for (i, row) in design.outer_iter().enumerate() {
        let stream = simulate(draws, row, &mut *rng)?;
        for (d, replicate) in stream.enumerate() {
            replicates[[i, d]] = replicate.value;
        }
    }
    Ok(replicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn fixed_draws() -> PosteriorDraws {
        let means = Array2::from_shape_fn((400, 2), |(_, j)| if j == 0 { -2.0 } else { 3.0 });
        PosteriorDraws::new(means, Array1::from_elem(400, 0.5), 2).unwrap()
    }

    #[test]
    fn one_replicate_per_draw() {
        let draws = fixed_draws();
        let row = array![1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(3);
        let stream = simulate(&draws, row.view(), &mut rng).unwrap();
        assert_eq!(stream.len(), 400);
        assert_eq!(ReplicateSet::collect_from(stream).len(), 400);
    }

    #[test]
    fn design_row_selects_the_platform_mean() {
        let draws = fixed_draws();
        let mut rng = StdRng::seed_from_u64(5);
        let row = array![0.0, 1.0];
        let set = ReplicateSet::collect_from(simulate(&draws, row.view(), &mut rng).unwrap());
        assert_abs_diff_eq!(set.values.mean().unwrap(), 3.0, epsilon = 0.1);
        assert_abs_diff_eq!(set.values.std(1.0), 0.5, epsilon = 0.07);
    }

    #[test]
    fn log_likelihood_matches_the_sampling_normal() {
        let draws = fixed_draws();
        let mut rng = StdRng::seed_from_u64(8);
        let row = array![1.0, 0.0];
        for replicate in simulate(&draws, row.view(), &mut rng).unwrap() {
            let z = (replicate.value + 2.0) / 0.5;
            let expected = -0.5 * z * z - 0.5_f64.ln() - 0.5 * (2.0 * PI).ln();
            assert_abs_diff_eq!(replicate.log_lik, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn same_stream_seed_reproduces_replicates() {
        let draws = fixed_draws();
        let row = array![1.0, 0.0];
        let mut first_rng = StdRng::seed_from_u64(21);
        let mut second_rng = StdRng::seed_from_u64(21);
        let first = ReplicateSet::collect_from(simulate(&draws, row.view(), &mut first_rng).unwrap());
        let second =
            ReplicateSet::collect_from(simulate(&draws, row.view(), &mut second_rng).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_width_row_is_rejected() {
        let draws = fixed_draws();
        let mut rng = StdRng::seed_from_u64(1);
        let row = array![1.0, 0.0, 0.0];
        assert_eq!(
            simulate(&draws, row.view(), &mut rng).err(),
            Some(SimulationError::DesignWidthMismatch {
                found: 3,
                expected: 2
            })
        );
    }

    #[test]
    fn consecutive_streams_share_one_rng() {
        let draws = fixed_draws();
        let design = array![[1.0, 0.0], [0.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(13);
        let mut sets = Vec::new();
        for row in design.outer_iter() {
            sets.push(ReplicateSet::collect_from(simulate(&draws, row, &mut rng).unwrap()));
        }

        let mut batch_rng = StdRng::seed_from_u64(13);
        let batch = simulate_rows(&draws, design.view(), &mut batch_rng).unwrap();
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(batch.row(i), set.values.view());
        }
    }

    #[test]
    fn row_batch_has_one_distribution_per_observation() {
        let draws = fixed_draws();
        let design = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let mut rng = StdRng::seed_from_u64(2);
        let replicates = simulate_rows(&draws, design.view(), &mut rng).unwrap();
        assert_eq!(replicates.dim(), (3, 400));
        assert!(replicates.row(0).mean().unwrap() < 0.0);
        assert!(replicates.row(1).mean().unwrap() > 0.0);
    }
}
