//! # Analysis Pipeline
//!
//! A run fits the platform model exactly once and then answers any number of
//! evaluation queries against that single fit. Everything the queries share
//! (the vocabulary, the frozen standardization, the posterior draws) lives in
//! one immutable [`AnalysisContext`]. Queries take it by reference, so there
//! is no way to re-standardize with different parameters halfway through.
//!
//! Stages, in order: encoding, standardization, fitting, then either model
//! checking or scoring. Every failure is reported as a [`PipelineError`]
//! naming its stage.

use crate::anomaly::{self, AnomalyScore, ScoreError, Sidedness};
use crate::check::{self, CheckError, ModelCheck};
use crate::config::{ConfigError, SamplerConfig};
use crate::data::{DataError, StudyTable};
use crate::design::{self, DesignError, PlatformVocabulary};
use crate::diagnostics::{ConvergenceReport, PlatformSummary, summarize_platforms};
use crate::fit::{FitError, FitRequest, FittingEngine, PosteriorDraws, run_engine};
use crate::predictive::{self, ReplicateSet, SimulationError};
use crate::report::ReportError;
use crate::standardize::{ScaleError, Standardization};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Encoding failed: {0}")]
    Encoding(#[from] DesignError),
    #[error("Standardization failed: {0}")]
    Standardization(#[from] ScaleError),
    #[error("Fitting failed: {0}")]
    Fitting(#[from] FitError),
    #[error("Predictive simulation failed: {0}")]
    Simulation(#[from] SimulationError),
    #[error("Model check failed: {0}")]
    Check(#[from] CheckError),
    #[error("Scoring failed for platform '{platform}' (observed {observed}): {source}")]
    Scoring {
        platform: String,
        observed: f64,
        #[source]
        source: ScoreError,
    },
    #[error("Input validation failed: {0}")]
    Input(#[from] DataError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Failed to write output: {0}")]
    Report(#[from] ReportError),
}

/// Anomaly score for one platform of the vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformEvaluation {
    pub platform: String,
    pub score: AnomalyScore,
}

/// The fitted state of one run. Constructed once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    vocabulary: PlatformVocabulary,
    scaling: Standardization,
    draws: PosteriorDraws,
    design: Array2<f64>,
    observed: Array1<f64>,
    study_ids: Vec<String>,
    in_sample: Option<Array2<f64>>,
    diagnostics: ConvergenceReport,
}

impl AnalysisContext {
    /// Encodes, standardizes and fits the study table.
    ///
    /// `replicates` is the number of in-sample replicate datasets requested from
    /// the engine for the model check (0 to simulate them on demand instead).
    pub fn fit<E: FittingEngine + ?Sized>(
        table: &StudyTable,
        vocabulary: PlatformVocabulary,
        engine: &E,
        sampler: &SamplerConfig,
        replicates: usize,
    ) -> Result<Self, PipelineError> {
        let design = design::encode_all(&table.platforms(), &vocabulary)?;
        let outcomes = table.outcomes();
        let scaling = Standardization::fit(outcomes.view())?;
        let observed = scaling.transform_all(outcomes.view());
        log::info!(
            "Standardized {} outcomes (mean {:.1}, sd {:.1})",
            outcomes.len(),
            scaling.mean(),
            scaling.std_dev()
        );

        let request = FitRequest::new(design.view(), observed.view(), replicates)?;
        let response = run_engine(engine, &request, sampler)?;
        let diagnostics = ConvergenceReport::from_draws(&response.draws);

        Ok(Self {
            vocabulary,
            scaling,
            draws: response.draws,
            design,
            observed,
            study_ids: table.study_ids().into_iter().map(str::to_string).collect(),
            in_sample: response.replicates,
            diagnostics,
        })
    }

    pub fn vocabulary(&self) -> &PlatformVocabulary {
        &self.vocabulary
    }

    pub fn scaling(&self) -> &Standardization {
        &self.scaling
    }

    pub fn draws(&self) -> &PosteriorDraws {
        &self.draws
    }

    pub fn diagnostics(&self) -> &ConvergenceReport {
        &self.diagnostics
    }

    pub fn study_ids(&self) -> &[String] {
        &self.study_ids
    }

    /// Standardized fitting outcomes.
    pub fn observed(&self) -> &Array1<f64> {
        &self.observed
    }

    pub fn platform_summaries(&self) -> Vec<PlatformSummary> {
        summarize_platforms(&self.draws, &self.vocabulary, &self.scaling)
    }

    /// One replicate per posterior draw for `platform`, on the standardized
    /// scale, with the log-likelihood of each replicate.
    pub fn predictive_replicates<R: Rng>(
        &self,
        platform: &str,
        rng: &mut R,
    ) -> Result<ReplicateSet, PipelineError> {
        let row = design::encode(platform, &self.vocabulary)?;
        let stream = predictive::simulate(&self.draws, row.view(), rng)?;
        Ok(ReplicateSet::collect_from(stream))
    }

    /// Predictive replicates for `platform` in raw SNP-count units.
    pub fn predictive_outcomes<R: Rng>(&self, platform: &str, rng: &mut R) -> Result<Vec<f64>, PipelineError> {
        let replicates = self.predictive_replicates(platform, rng)?;
        Ok(self.scaling.inverse_transform_all(replicates.values.view()).to_vec())
    }

    /// Scores a (hypothetical) raw outcome observed on `platform`.
    pub fn evaluate_platform<R: Rng>(
        &self,
        platform: &str,
        observed: f64,
        sidedness: Sidedness,
        rng: &mut R,
    ) -> Result<AnomalyScore, PipelineError> {
        let replicates = self.predictive_replicates(platform, rng)?;
        let raw = self.scaling.inverse_transform_all(replicates.values.view()).to_vec();
        let score = anomaly::score(&raw, observed, sidedness).map_err(|source| {
            PipelineError::Scoring {
                platform: platform.to_string(),
                observed,
                source,
            }
        })?;
        log::debug!(
            "Platform {platform}: observed {observed}, predictive mean {:.1} (sd {:.1}), mean replicate log-likelihood {:.3}, p={:.4}, distance {:.2} sd",
            score.replicate_mean,
            score.replicate_sd,
            replicates.log_lik.mean().unwrap_or(f64::NAN),
            score.p_value,
            score.sd_distance
        );
        Ok(score)
    }

    /// Scores `observed` on `platform` with the RNG stream reserved for that
    /// platform: vocabulary position `j` draws from `seed + j`.
    pub fn evaluate_seeded(
        &self,
        platform: &str,
        observed: f64,
        sidedness: Sidedness,
        seed: u64,
    ) -> Result<AnomalyScore, PipelineError> {
        let j = self.vocabulary.index_of(platform)?;
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(j as u64));
        self.evaluate_platform(platform, observed, sidedness, &mut rng)
    }

    /// Scores the same raw outcome against every platform of the vocabulary.
    ///
    /// Platforms are evaluated in parallel, each through [`Self::evaluate_seeded`],
    /// so the result does not depend on scheduling and matches a
    /// single-platform evaluation with the same seed.
    pub fn evaluate_all(
        &self,
        observed: f64,
        sidedness: Sidedness,
        seed: u64,
    ) -> Result<Vec<PlatformEvaluation>, PipelineError> {
        self.vocabulary
            .platforms()
            .par_iter()
            .map(|platform| {
                let score = self.evaluate_seeded(platform, observed, sidedness, seed)?;
                Ok(PlatformEvaluation {
                    platform: platform.clone(),
                    score,
                })
            })
            .collect()
    }

    /// Posterior-predictive check over the first `rows` fitting observations.
    ///
    /// Uses the engine's in-sample replicates when it returned any, otherwise
    /// simulates one replicate per draw for every observation.
    pub fn model_check<R: Rng>(&self, rows: usize, rng: &mut R) -> Result<ModelCheck, PipelineError> {
        let result = match &self.in_sample {
            Some(replicates) => check::check(replicates.t(), self.observed.view(), rows)?,
            None => {
                let replicates = predictive::simulate_rows(&self.draws, self.design.view(), rng)?;
                check::check(replicates.view(), self.observed.view(), rows)?
            }
        };
        Ok(result)
    }
}
