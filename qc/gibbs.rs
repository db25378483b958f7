//! Blocked Gibbs sampler for the hierarchical platform model.
//!
//! On standardized outcomes the model is
//!
//! ```text
//! y_i      ~ N(β[p(i)], σ²)
//! β_p      ~ N(μ_β, τ²)
//! μ_β      ~ N(0, s0²)
//! τ², σ²   ~ InvGamma(a, b)
//! ```
//!
//! Every block is conjugate, so each sweep draws exactly from the full
//! conditionals:
//!
//! 1. β_p | ·  ~ N(m_p, 1/q_p), q_p = n_p/σ² + 1/τ², m_p = (S_p/σ² + μ_β/τ²)/q_p
//! 2. μ_β | ·  ~ N(m, 1/q),     q = P/τ² + 1/s0²,    m = (Σ β_p/τ²)/q
//! 3. τ² | ·   ~ InvGamma(a + P/2, b + Σ (β_p - μ_β)²/2)
//! 4. σ² | ·   ~ InvGamma(a + N/2, b + Σ (y_i - β[p(i)])²/2)
//!
//! Chains are independent and run in parallel on the rayon pool. Each chain
//! owns an RNG seeded from the run seed and its index, so the draw set is
//! reproducible regardless of scheduling.

use crate::config::{PriorConfig, SamplerConfig};
use crate::diagnostics::ConvergenceReport;
use crate::fit::{FitError, FitRequest, FitResponse, FittingEngine, PosteriorDraws};
use ndarray::{Array1, Array2, ArrayView1, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal, StandardNormal};
use rayon::prelude::*;

/// Offset between per-chain seeds.
const CHAIN_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Spread of the initial platform means around the sample mean.
const INITIAL_SPREAD: f64 = 2.0;

/// Lower bound on sampled variances.
const VARIANCE_FLOOR: f64 = 1e-12;

pub struct GibbsEngine {
    priors: PriorConfig,
}

impl GibbsEngine {
    pub fn new(priors: PriorConfig) -> Self {
        Self { priors }
    }
}

impl Default for GibbsEngine {
    fn default() -> Self {
        Self::new(PriorConfig::default())
    }
}

/// Sufficient statistics of the platform model.
struct PlatformData<'a> {
    outcomes: ArrayView1<'a, f64>,
    platform_of: Vec<usize>,
    counts: Vec<f64>,
    sums: Vec<f64>,
}

impl<'a> PlatformData<'a> {
    fn from_request(request: &FitRequest<'a>) -> Result<Self, FitError> {
        let n_platforms = request.n_platforms();
        let mut platform_of = Vec::with_capacity(request.n_obs());
        let mut counts = vec![0.0; n_platforms];
        let mut sums = vec![0.0; n_platforms];

        for (i, row) in request.design.outer_iter().enumerate() {
            let ones: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|(_, v)| **v == 1.0)
                .map(|(j, _)| j)
                .collect();
            let is_indicator = ones.len() == 1 && row.iter().all(|v| *v == 0.0 || *v == 1.0);
            if !is_indicator {
                return Err(FitError::InvalidRequest(format!(
                    "design row {i} is not a one-hot platform indicator"
                )));
            }
            let y = request.outcomes[i];
            if !y.is_finite() {
                return Err(FitError::InvalidRequest(format!(
                    "standardized outcome {i} is not finite ({y})"
                )));
            }
            let platform = ones[0];
            platform_of.push(platform);
            counts[platform] += 1.0;
            sums[platform] += y;
        }

        Ok(Self {
            outcomes: request.outcomes,
            platform_of,
            counts,
            sums,
        })
    }

    fn n_obs(&self) -> usize {
        self.platform_of.len()
    }

    fn n_platforms(&self) -> usize {
        self.counts.len()
    }

    fn residual_sum_of_squares(&self, beta: &[f64]) -> f64 {
        self.outcomes
            .iter()
            .zip(&self.platform_of)
            .map(|(y, &p)| (y - beta[p]).powi(2))
            .sum()
    }
}

/// Retained draws of one chain.
struct ChainDraws {
    means: Array2<f64>,
    sigmas: Array1<f64>,
}

fn sample_inverse_gamma<R: Rng>(rng: &mut R, shape: f64, rate: f64) -> Result<f64, FitError> {
    // rand_distr's Gamma is parameterised by scale = 1 / rate.
    let gamma = Gamma::new(shape, 1.0 / rate).map_err(|e| {
        FitError::SamplerConvergence(format!(
            "invalid inverse-gamma parameters (shape {shape}, rate {rate}): {e}"
        ))
    })?;
    let precision: f64 = gamma.sample(rng);
    Ok((1.0 / precision).max(VARIANCE_FLOOR))
}

fn non_finite(chain: usize, iteration: usize, what: &str, value: f64) -> FitError {
    FitError::SamplerConvergence(format!(
        "chain {chain} produced a non-finite {what} ({value}) at iteration {iteration}"
    ))
}

impl GibbsEngine {
    fn run_chain(
        &self,
        data: &PlatformData<'_>,
        config: &SamplerConfig,
        chain: usize,
    ) -> Result<ChainDraws, FitError> {
        let mut rng = StdRng::seed_from_u64(
            config
                .seed
                .wrapping_add((chain as u64 + 1).wrapping_mul(CHAIN_SEED_STRIDE)),
        );
        let n_platforms = data.n_platforms();
        let n_obs = data.n_obs() as f64;
        let a = self.priors.variance_shape;
        let b = self.priors.variance_rate;
        let location_precision = 1.0 / self.priors.location_scale.powi(2);

        let grand_mean = data.outcomes.sum() / n_obs;
        let mut beta: Vec<f64> = (0..n_platforms)
            .map(|_| grand_mean + INITIAL_SPREAD * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let mut mu = beta.iter().sum::<f64>() / n_platforms as f64;
        let mut tau2 = 1.0;
        let mut sigma2 = 1.0;

        let kept = config.kept_per_chain();
        let mut means = Array2::<f64>::zeros((kept, n_platforms));
        let mut sigmas = Array1::<f64>::zeros(kept);

        for iteration in 0..config.iterations {
            for (p, slot) in beta.iter_mut().enumerate() {
                let precision = data.counts[p] / sigma2 + 1.0 / tau2;
                let mean = (data.sums[p] / sigma2 + mu / tau2) / precision;
                let z: f64 = rng.sample(StandardNormal);
                *slot = mean + z / precision.sqrt();
                if !slot.is_finite() {
                    return Err(non_finite(chain, iteration, "platform mean", *slot));
                }
            }

            let precision = n_platforms as f64 / tau2 + location_precision;
            let mean = (beta.iter().sum::<f64>() / tau2) / precision;
            let z: f64 = rng.sample(StandardNormal);
            mu = mean + z / precision.sqrt();
            if !mu.is_finite() {
                return Err(non_finite(chain, iteration, "shared platform mean", mu));
            }

            let spread: f64 = beta.iter().map(|bp| (bp - mu).powi(2)).sum();
            tau2 = sample_inverse_gamma(
                &mut rng,
                a + n_platforms as f64 / 2.0,
                b + spread / 2.0,
            )?;

            let rss = data.residual_sum_of_squares(&beta);
            sigma2 = sample_inverse_gamma(&mut rng, a + n_obs / 2.0, b + rss / 2.0)?;
            if !tau2.is_finite() || !sigma2.is_finite() {
                return Err(non_finite(chain, iteration, "variance", tau2.max(sigma2)));
            }

            if iteration >= config.warmup {
                let k = iteration - config.warmup;
                means
                    .row_mut(k)
                    .assign(&ArrayView1::from(beta.as_slice()));
                sigmas[k] = sigma2.sqrt();
            }
        }

        log::debug!(
            "Chain {chain} finished: last τ²={tau2:.4}, σ={:.4}",
            sigma2.sqrt()
        );
        Ok(ChainDraws { means, sigmas })
    }

    /// Simulates `count` in-sample replicate datasets from draws spread evenly
    /// across the draw set.
    fn in_sample_replicates(
        data: &PlatformData<'_>,
        draws: &PosteriorDraws,
        count: usize,
        seed: u64,
    ) -> Result<Array2<f64>, FitError> {
        let mut rng = StdRng::seed_from_u64(seed ^ CHAIN_SEED_STRIDE.rotate_left(17));
        let mut replicates = Array2::<f64>::zeros((count, data.n_obs()));
        for r in 0..count {
            let d = r * draws.len() / count;
            let (beta, sigma) = draws.draw(d);
            for (i, &p) in data.platform_of.iter().enumerate() {
                let normal = Normal::new(beta[p], sigma).map_err(|e| {
                    FitError::SamplerConvergence(format!("invalid replicate distribution: {e}"))
                })?;
                replicates[[r, i]] = normal.sample(&mut rng);
            }
        }
        Ok(replicates)
    }
}

impl FittingEngine for GibbsEngine {
    fn fit(&self, request: &FitRequest<'_>, config: &SamplerConfig) -> Result<FitResponse, FitError> {
        let data = PlatformData::from_request(request)?;
        log::info!(
            "Running {} Gibbs chains over {} platforms ({} observations)",
            config.chains,
            data.n_platforms(),
            data.n_obs()
        );

        let chains: Vec<ChainDraws> = (0..config.chains)
            .into_par_iter()
            .map(|chain| self.run_chain(&data, config, chain))
            .collect::<Result<_, _>>()?;

        let kept = config.kept_per_chain();
        let total = kept * config.chains;
        let mut means = Array2::<f64>::zeros((total, data.n_platforms()));
        let mut sigmas = Array1::<f64>::zeros(total);
        for (c, chain) in chains.iter().enumerate() {
            let rows = s![c * kept..(c + 1) * kept, ..];
            means.slice_mut(rows).assign(&chain.means);
            sigmas
                .slice_mut(s![c * kept..(c + 1) * kept])
                .assign(&chain.sigmas);
        }
        let draws = PosteriorDraws::new(means, sigmas, config.chains)?;

        let report = ConvergenceReport::from_draws(&draws);
        report.log_summary();

        let replicates = if request.replicates > 0 {
            Some(Self::in_sample_replicates(
                &data,
                &draws,
                request.replicates,
                config.seed,
            )?)
        } else {
            None
        };

        Ok(FitResponse { draws, replicates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{PlatformVocabulary, encode_all};
    use crate::fit::run_engine;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Axis, array};

    fn three_platform_data() -> (Array2<f64>, Array1<f64>) {
        let vocab = PlatformVocabulary::new(["A", "B", "C"]).unwrap();
        let mut labels = Vec::new();
        let mut outcomes = Vec::new();
        let centers = [-1.0, 0.0, 1.5];
        let offsets = [-0.2, -0.1, 0.0, 0.1, 0.2, -0.15, 0.15, 0.05, -0.05, 0.0];
        for (p, center) in centers.iter().enumerate() {
            for offset in offsets {
                labels.push(vocab.platforms()[p].clone());
                outcomes.push(center + offset);
            }
        }
        (encode_all(&labels, &vocab).unwrap(), Array1::from(outcomes))
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            chains: 2,
            iterations: 600,
            warmup: 200,
            seed: 11,
        }
    }

    #[test]
    fn recovers_separated_platform_means() {
        let (design, outcomes) = three_platform_data();
        let request = FitRequest::new(design.view(), outcomes.view(), 0).unwrap();
        let response = run_engine(&GibbsEngine::default(), &request, &config()).unwrap();

        assert_eq!(response.draws.len(), 2 * 400);
        let posterior_means = response.draws.means().mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(posterior_means[0], -1.0, epsilon = 0.15);
        assert_abs_diff_eq!(posterior_means[1], 0.0, epsilon = 0.15);
        assert_abs_diff_eq!(posterior_means[2], 1.5, epsilon = 0.15);

        let sigma_mean = response.draws.sigmas().mean().unwrap();
        assert!(sigma_mean > 0.05 && sigma_mean < 0.5, "σ={sigma_mean}");
    }

    #[test]
    fn same_seed_gives_identical_draws() {
        let (design, outcomes) = three_platform_data();
        let request = FitRequest::new(design.view(), outcomes.view(), 5).unwrap();
        let engine = GibbsEngine::default();
        let first = engine.fit(&request, &config()).unwrap();
        let second = engine.fit(&request, &config()).unwrap();
        assert_eq!(first.draws, second.draws);
        assert_eq!(first.replicates, second.replicates);

        let other_seed = SamplerConfig {
            seed: 12,
            ..config()
        };
        let third = engine.fit(&request, &other_seed).unwrap();
        assert_ne!(first.draws, third.draws);
    }

    #[test]
    fn returns_requested_in_sample_replicates() {
        let (design, outcomes) = three_platform_data();
        let request = FitRequest::new(design.view(), outcomes.view(), 25).unwrap();
        let response = run_engine(&GibbsEngine::default(), &request, &config()).unwrap();
        let replicates = response.replicates.unwrap();
        assert_eq!(replicates.dim(), (25, 30));
        assert!(replicates.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn platform_without_observations_falls_back_to_the_prior() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
        let outcomes = array![0.1, -0.1, 0.2, -0.2];
        let request = FitRequest::new(design.view(), outcomes.view(), 0).unwrap();
        let response = run_engine(&GibbsEngine::default(), &request, &config()).unwrap();
        let spread = response.draws.means().std_axis(Axis(0), 1.0);
        assert!(spread[1] > spread[0]);
    }

    #[test]
    fn non_indicator_design_is_rejected() {
        let design = array![[1.0, 1.0], [0.0, 1.0]];
        let outcomes = array![0.0, 1.0];
        let request = FitRequest::new(design.view(), outcomes.view(), 0).unwrap();
        assert!(matches!(
            GibbsEngine::default().fit(&request, &config()),
            Err(FitError::InvalidRequest(_))
        ));
    }
}
