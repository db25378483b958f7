//! # Posterior Fitting Boundary
//!
//! The sampler is a collaborator, not part of the core. The core talks to it
//! only through [`FittingEngine`]: a [`FitRequest`] goes in, a [`FitResponse`]
//! comes back. Every response is validated here before anything downstream is
//! allowed to read it, so a misbehaving engine fails the run instead of
//! silently producing partial or degenerate draws.

use crate::config::SamplerConfig;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("The sampler did not reach a valid numerical state: {0}")]
    SamplerConvergence(String),
    #[error("Invalid fitting request: {0}")]
    InvalidRequest(String),
}

/// Everything the engine needs to fit the model once.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    /// One-hot design matrix, `N x P`.
    pub design: ArrayView2<'a, f64>,
    /// Standardized outcomes, length `N`.
    pub outcomes: ArrayView1<'a, f64>,
    /// Number of in-sample replicate datasets to return (0 for none).
    pub replicates: usize,
}

impl<'a> FitRequest<'a> {
    pub fn new(
        design: ArrayView2<'a, f64>,
        outcomes: ArrayView1<'a, f64>,
        replicates: usize,
    ) -> Result<Self, FitError> {
        if design.nrows() != outcomes.len() {
            return Err(FitError::InvalidRequest(format!(
                "design matrix has {} rows but {} outcomes were supplied",
                design.nrows(),
                outcomes.len()
            )));
        }
        if design.nrows() == 0 || design.ncols() == 0 {
            return Err(FitError::InvalidRequest(format!(
                "design matrix is empty ({} x {})",
                design.nrows(),
                design.ncols()
            )));
        }
        Ok(Self {
            design,
            outcomes,
            replicates,
        })
    }

    /// Number of observations, `N`.
    pub fn n_obs(&self) -> usize {
        self.design.nrows()
    }

    /// Number of platforms, `P`.
    pub fn n_platforms(&self) -> usize {
        self.design.ncols()
    }
}

/// Posterior draws of the per-platform means and the shared residual scale.
///
/// Draws are stored chain-major: the draws of chain `c` occupy rows
/// `c * draws_per_chain .. (c + 1) * draws_per_chain`.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraws {
    means: Array2<f64>,
    sigmas: Array1<f64>,
    chains: usize,
}

impl PosteriorDraws {
    pub fn new(means: Array2<f64>, sigmas: Array1<f64>, chains: usize) -> Result<Self, FitError> {
        let draws = Self {
            means,
            sigmas,
            chains,
        };
        draws.check_integrity()?;
        Ok(draws)
    }

    fn check_integrity(&self) -> Result<(), FitError> {
        let n_draws = self.means.nrows();
        if n_draws == 0 {
            return Err(FitError::SamplerConvergence(
                "the engine returned an empty draw set".to_string(),
            ));
        }
        if self.sigmas.len() != n_draws {
            return Err(FitError::SamplerConvergence(format!(
                "{} mean vectors but {} residual scales",
                n_draws,
                self.sigmas.len()
            )));
        }
        if self.chains == 0 || n_draws % self.chains != 0 {
            return Err(FitError::SamplerConvergence(format!(
                "{} draws cannot be split evenly across {} chains",
                n_draws, self.chains
            )));
        }
        if let Some(((draw, platform), value)) = self
            .means
            .indexed_iter()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(FitError::SamplerConvergence(format!(
                "non-finite platform mean {value} at draw {draw}, platform column {platform}"
            )));
        }
        if let Some((draw, value)) = self
            .sigmas
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v <= 0.0)
        {
            return Err(FitError::SamplerConvergence(format!(
                "invalid residual scale {value} at draw {draw}"
            )));
        }
        Ok(())
    }

    /// Total number of draws, `S`.
    pub fn len(&self) -> usize {
        self.means.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.means.nrows() == 0
    }

    pub fn n_platforms(&self) -> usize {
        self.means.ncols()
    }

    pub fn chains(&self) -> usize {
        self.chains
    }

    pub fn draws_per_chain(&self) -> usize {
        self.len() / self.chains
    }

    /// Per-platform means, `S x P`.
    pub fn means(&self) -> ArrayView2<'_, f64> {
        self.means.view()
    }

    pub fn sigmas(&self) -> ArrayView1<'_, f64> {
        self.sigmas.view()
    }

    /// The mean vector and residual scale of draw `d`.
    pub fn draw(&self, d: usize) -> (ArrayView1<'_, f64>, f64) {
        (self.means.row(d), self.sigmas[d])
    }
}

/// What the engine hands back.
#[derive(Debug, Clone)]
pub struct FitResponse {
    pub draws: PosteriorDraws,
    /// In-sample replicate outcomes, `replicates x N`, on the standardized scale.
    pub replicates: Option<Array2<f64>>,
}

impl FitResponse {
    /// Checks the response against the request and the sampler configuration.
    pub fn validate(&self, request: &FitRequest<'_>, config: &SamplerConfig) -> Result<(), FitError> {
        self.draws.check_integrity()?;

        let expected = config.expected_draws();
        if self.draws.len() != expected {
            return Err(FitError::SamplerConvergence(format!(
                "expected {} draws ({} chains x ({} iterations - {} warmup)) but received {}",
                expected,
                config.chains,
                config.iterations,
                config.warmup,
                self.draws.len()
            )));
        }
        if self.draws.chains() != config.chains {
            return Err(FitError::SamplerConvergence(format!(
                "expected {} chains but the draw set reports {}",
                config.chains,
                self.draws.chains()
            )));
        }
        if self.draws.n_platforms() != request.n_platforms() {
            return Err(FitError::SamplerConvergence(format!(
                "draws cover {} platforms but the design has {} columns",
                self.draws.n_platforms(),
                request.n_platforms()
            )));
        }

        if let Some(replicates) = &self.replicates {
            if replicates.ncols() != request.n_obs() {
                return Err(FitError::SamplerConvergence(format!(
                    "in-sample replicates have {} columns but there are {} observations",
                    replicates.ncols(),
                    request.n_obs()
                )));
            }
            if replicates.nrows() != request.replicates {
                return Err(FitError::SamplerConvergence(format!(
                    "{} in-sample replicate datasets requested but {} returned",
                    request.replicates,
                    replicates.nrows()
                )));
            }
            if replicates.iter().any(|v| !v.is_finite()) {
                return Err(FitError::SamplerConvergence(
                    "non-finite in-sample replicate outcome".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A posterior sampler for the platform model.
///
/// Implementations block until the full draw set is available and either
/// return all of it or fail; there is no partial result.
pub trait FittingEngine {
    fn fit(&self, request: &FitRequest<'_>, config: &SamplerConfig) -> Result<FitResponse, FitError>;
}

/// Runs `engine` and validates what it returns.
pub fn run_engine<E: FittingEngine + ?Sized>(
    engine: &E,
    request: &FitRequest<'_>,
    config: &SamplerConfig,
) -> Result<FitResponse, FitError> {
    config
        .validate()
        .map_err(|e| FitError::InvalidRequest(e.to_string()))?;
    log::info!(
        "Fitting platform model: {} observations, {} platforms, {} chains x {} iterations (warmup {})",
        request.n_obs(),
        request.n_platforms(),
        config.chains,
        config.iterations,
        config.warmup
    );
    let response = engine.fit(request, config)?;
    response.validate(request, config)?;
    log::info!("Posterior draw set accepted: {} draws", response.draws.len());
    Ok(response)
}
