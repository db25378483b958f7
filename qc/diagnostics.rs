//! Convergence diagnostics and posterior summaries.
//!
//! These never gate a run on their own: a draw set that is numerically valid
//! is accepted, and poor mixing is reported through the log so the analyst
//! can rerun with more iterations.

use crate::design::PlatformVocabulary;
use crate::fit::PosteriorDraws;
use crate::standardize::Standardization;
use ndarray::{ArrayView1, Axis, s};

/// Split R-hat above this is reported as poor mixing.
pub const RHAT_WARNING_THRESHOLD: f64 = 1.1;

/// Mixing diagnostics for one scalar parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDiagnostics {
    pub name: String,
    /// Split R-hat; `None` when the chains are too short to split.
    pub rhat: Option<f64>,
    pub ess: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    pub parameters: Vec<ParameterDiagnostics>,
}

impl ConvergenceReport {
    /// Diagnoses every platform mean (`mu[j]`) and the residual scale (`sigma`).
    pub fn from_draws(draws: &PosteriorDraws) -> Self {
        let chains = draws.chains();
        let mut parameters: Vec<ParameterDiagnostics> = draws
            .means()
            .axis_iter(Axis(1))
            .enumerate()
            .map(|(j, column)| diagnose(format!("mu[{j}]"), column, chains))
            .collect();
        parameters.push(diagnose("sigma".to_string(), draws.sigmas(), chains));
        Self { parameters }
    }

    /// Largest split R-hat across all parameters.
    pub fn max_rhat(&self) -> Option<f64> {
        self.parameters
            .iter()
            .filter_map(|p| p.rhat)
            .fold(None, |acc, r| Some(acc.map_or(r, |a: f64| a.max(r))))
    }

    pub fn min_ess(&self) -> f64 {
        self.parameters
            .iter()
            .map(|p| p.ess)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn log_summary(&self) {
        match self.max_rhat() {
            Some(rhat) if rhat > RHAT_WARNING_THRESHOLD => {
                for p in &self.parameters {
                    if p.rhat.is_some_and(|r| r > RHAT_WARNING_THRESHOLD) {
                        log::warn!(
                            "Parameter {} mixes poorly: split R-hat {:.3}, ESS {:.0}",
                            p.name,
                            p.rhat.unwrap_or(f64::NAN),
                            p.ess
                        );
                    }
                }
            }
            Some(rhat) => log::info!(
                "Sampler diagnostics: max split R-hat {:.3}, min ESS {:.0}",
                rhat,
                self.min_ess()
            ),
            None => log::info!(
                "Sampler diagnostics: chains too short for split R-hat, min ESS {:.0}",
                self.min_ess()
            ),
        }
    }
}

fn diagnose(name: String, values: ArrayView1<f64>, chains: usize) -> ParameterDiagnostics {
    let per_chain = values.len() / chains.max(1);
    let ess = (0..chains)
        .map(|c| effective_sample_size(values.slice(s![c * per_chain..(c + 1) * per_chain])))
        .sum();
    ParameterDiagnostics {
        name,
        rhat: split_rhat(values, chains),
        ess,
    }
}

/// Gelman-Rubin R-hat computed on chains split in half.
///
/// `values` is chain-major with `chains` equally long chains.
pub fn split_rhat(values: ArrayView1<f64>, chains: usize) -> Option<f64> {
    if chains == 0 {
        return None;
    }
    let per_chain = values.len() / chains;
    let half = per_chain / 2;
    if half < 2 {
        return None;
    }

    let mut segments = Vec::with_capacity(2 * chains);
    for c in 0..chains {
        let start = c * per_chain;
        segments.push(values.slice(s![start..start + half]));
        segments.push(values.slice(s![start + per_chain - half..start + per_chain]));
    }

    let n = half as f64;
    let m = segments.len() as f64;
    let segment_means: Vec<f64> = segments
        .iter()
        .map(|seg| seg.sum() / n)
        .collect();
    let within = segments.iter().map(|seg| seg.var(1.0)).sum::<f64>() / m;
    let grand_mean = segment_means.iter().sum::<f64>() / m;
    let between = n * segment_means
        .iter()
        .map(|mean| (mean - grand_mean).powi(2))
        .sum::<f64>()
        / (m - 1.0);

    if within <= 0.0 {
        return Some(if between <= 0.0 { 1.0 } else { f64::INFINITY });
    }
    let pooled = (n - 1.0) / n * within + between / n;
    Some((pooled / within).sqrt())
}

/// Effective sample size of one chain, truncating the autocorrelation sum at
/// the first lag whose autocorrelation drops below 0.05.
pub fn effective_sample_size(chain: ArrayView1<f64>) -> f64 {
    let n = chain.len();
    if n < 2 {
        return n as f64;
    }
    let mean = chain.sum() / n as f64;
    let variance = chain.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if variance < 1e-12 {
        return n as f64;
    }

    let mut rho_sum = 0.0;
    for lag in 1..=(n / 2).min(100) {
        let covariance = (0..n - lag)
            .map(|i| (chain[i] - mean) * (chain[i + lag] - mean))
            .sum::<f64>()
            / (n - lag) as f64;
        let rho = covariance / variance;
        if rho < 0.05 {
            break;
        }
        rho_sum += rho;
    }
    n as f64 / (1.0 + 2.0 * rho_sum)
}

/// Posterior summary of one platform's mean yield, in raw SNP-count units.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformSummary {
    pub platform: String,
    pub mean: f64,
    pub sd: f64,
    pub lower_95: f64,
    pub upper_95: f64,
}

/// Summarizes every platform mean after undoing the standardization.
pub fn summarize_platforms(
    draws: &PosteriorDraws,
    vocabulary: &PlatformVocabulary,
    scaling: &Standardization,
) -> Vec<PlatformSummary> {
    vocabulary
        .platforms()
        .iter()
        .zip(draws.means().axis_iter(Axis(1)))
        .map(|(platform, column)| {
            let mut raw: Vec<f64> = scaling.inverse_transform_all(column).to_vec();
            raw.sort_by(f64::total_cmp);
            let n = raw.len();
            let mean = raw.iter().sum::<f64>() / n as f64;
            let sd = if n > 1 {
                (raw.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
            } else {
                0.0
            };
            PlatformSummary {
                platform: platform.clone(),
                mean,
                sd,
                lower_95: quantile_sorted(&raw, 0.025),
                upper_95: quantile_sorted(&raw, 0.975),
            }
        })
        .collect()
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn identical_chains_have_rhat_near_one() {
        let chain: Vec<f64> = (0..40).map(|i| ((i * 37) % 11) as f64).collect();
        let values = Array1::from([chain.clone(), chain].concat());
        let rhat = split_rhat(values.view(), 2).unwrap();
        assert!(rhat < 1.1, "rhat={rhat}");
    }

    #[test]
    fn separated_chains_are_flagged() {
        let first: Vec<f64> = (0..40).map(|i| (i % 3) as f64).collect();
        let second: Vec<f64> = first.iter().map(|v| v + 50.0).collect();
        let values = Array1::from([first, second].concat());
        assert!(split_rhat(values.view(), 2).unwrap() > RHAT_WARNING_THRESHOLD);
    }

    #[test]
    fn short_chains_have_no_rhat() {
        assert_eq!(split_rhat(array![1.0, 2.0, 3.0].view(), 1), None);
    }

    #[test]
    fn ess_is_reduced_by_autocorrelation() {
        let independent: Array1<f64> = (0..200).map(|i| ((i * 7919) % 101) as f64).collect();
        let sticky: Array1<f64> = (0..200).map(|i| (i / 20) as f64).collect();
        assert!(effective_sample_size(sticky.view()) < effective_sample_size(independent.view()));
        assert!(effective_sample_size(sticky.view()) < 200.0);
    }

    #[test]
    fn quantiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.0), 1.0);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5), 3.0);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.125), 1.5);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 1.0), 5.0);
    }

    #[test]
    fn platform_summaries_are_in_raw_units() {
        let vocab = PlatformVocabulary::new(["A", "B"]).unwrap();
        let scaling = Standardization::fit(array![100.0, 300.0].view()).unwrap();
        let means = Array2::from_shape_vec((4, 2), vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0])
            .unwrap();
        let draws = PosteriorDraws::new(means, Array1::ones(4), 2).unwrap();
        let summaries = summarize_platforms(&draws, &vocab, &scaling);
        assert_eq!(summaries[0].platform, "A");
        assert_abs_diff_eq!(summaries[0].mean, 200.0, epsilon = 1e-9);
        assert_abs_diff_eq!(summaries[1].mean, 200.0 + scaling.std_dev(), epsilon = 1e-9);
        assert_abs_diff_eq!(summaries[1].sd, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn report_covers_every_parameter() {
        let means = Array2::from_shape_fn((20, 3), |(d, j)| (d % 4) as f64 + j as f64);
        let draws = PosteriorDraws::new(means, Array1::from_elem(20, 0.5), 2).unwrap();
        let report = ConvergenceReport::from_draws(&draws);
        let names: Vec<&str> = report.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["mu[0]", "mu[1]", "mu[2]", "sigma"]);
        assert!(report.max_rhat().is_some());
    }
}
