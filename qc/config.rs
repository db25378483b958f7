//! Run configuration, read from a TOML file.
//!
//! Only the `[vocabulary]` table is required. Every other table falls back to
//! the defaults below, and the whole configuration is validated once after
//! loading so the pipeline never sees an inconsistent sampler setup.
//!
//! ```toml
//! [vocabulary]
//! platforms = ["Illumina_610K", "Illumina_660W", "Affymetrix_6.0"]
//!
//! [sampler]
//! chains = 4
//! iterations = 2000
//! warmup = 1000
//! seed = 20240611
//! ```

use crate::anomaly::Sidedness;
use crate::design::{DesignError, PlatformVocabulary};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid platform vocabulary: {0}")]
    Vocabulary(#[from] DesignError),
    #[error("Invalid sampler setting '{name}': {reason}")]
    InvalidSampler { name: &'static str, reason: String },
    #[error("Invalid prior hyperparameter '{name}' = {value}; it must be finite and strictly positive.")]
    InvalidPrior { name: &'static str, value: f64 },
    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyConfig {
    pub platforms: PlatformVocabulary,
}

/// Knobs exposed at the fitting-engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of independent chains.
    pub chains: usize,
    /// Total iterations per chain, warmup included.
    pub iterations: usize,
    /// Leading iterations discarded from every chain.
    pub warmup: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            iterations: 2000,
            warmup: 1000,
            seed: 42,
        }
    }
}

impl SamplerConfig {
    /// Retained draws per chain.
    pub fn kept_per_chain(&self) -> usize {
        self.iterations.saturating_sub(self.warmup)
    }

    /// Size of the posterior draw set a completed run must produce.
    pub fn expected_draws(&self) -> usize {
        self.chains * self.kept_per_chain()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains == 0 {
            return Err(ConfigError::InvalidSampler {
                name: "chains",
                reason: "at least one chain is required".to_string(),
            });
        }
        if self.iterations == 0 {
            return Err(ConfigError::InvalidSampler {
                name: "iterations",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.warmup == 0 {
            return Err(ConfigError::InvalidSampler {
                name: "warmup",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.warmup >= self.iterations {
            return Err(ConfigError::InvalidSampler {
                name: "warmup",
                reason: format!(
                    "warmup ({}) must be smaller than iterations ({})",
                    self.warmup, self.iterations
                ),
            });
        }
        Ok(())
    }
}

/// Hyperparameters of the hierarchical prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Standard deviation of the normal prior on the shared platform mean.
    pub location_scale: f64,
    /// Inverse-gamma shape for both the between-platform and residual variance.
    pub variance_shape: f64,
    /// Inverse-gamma rate for both the between-platform and residual variance.
    pub variance_rate: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            location_scale: 1.0,
            variance_shape: 2.0,
            variance_rate: 0.1,
        }
    }
}

impl PriorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("location_scale", self.location_scale),
            ("variance_shape", self.variance_shape),
            ("variance_rate", self.variance_rate),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidPrior { name, value });
            }
        }
        Ok(())
    }
}

/// Input-contract thresholds applied during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Platforms with fewer studies than this are dropped.
    pub min_platform_studies: usize,
    /// Studies with at least this many known-locus exclusions are dropped.
    pub max_known_loci_excluded: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_platform_studies: 6,
            max_known_loci_excluded: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// How many leading observations are overlaid against their replicates.
    pub rows: usize,
    /// Number of in-sample replicate datasets requested from the engine. With
    /// 0 the model check simulates one replicate per draw on demand.
    pub replicates: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            rows: 10,
            replicates: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EvaluationConfig {
    pub sidedness: Sidedness,
}

/// The complete configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub priors: PriorConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl RunConfig {
    /// A configuration with defaults everywhere except the vocabulary.
    pub fn with_vocabulary(platforms: PlatformVocabulary) -> Self {
        Self {
            vocabulary: VocabularyConfig { platforms },
            sampler: SamplerConfig::default(),
            priors: PriorConfig::default(),
            filters: FilterConfig::default(),
            check: CheckConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }

    pub fn vocabulary(&self) -> &PlatformVocabulary {
        &self.vocabulary.platforms
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampler.validate()?;
        self.priors.validate()?;
        if self.filters.min_platform_studies == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "filters.min_platform_studies",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.check.replicates > self.sampler.expected_draws() {
            return Err(ConfigError::InvalidSetting {
                name: "check.replicates",
                reason: format!(
                    "{} replicates requested but the sampler only retains {} draws",
                    self.check.replicates,
                    self.sampler.expected_draws()
                ),
            });
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!(
            "Loaded configuration from '{}' ({} platforms, {} chains x {} iterations, warmup {})",
            path.display(),
            config.vocabulary().len(),
            config.sampler.chains,
            config.sampler.iterations,
            config.sampler.warmup
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[vocabulary]
platforms = ["A", "B", "C"]
"#;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.vocabulary().platforms(), &["A", "B", "C"]);
        assert_eq!(config.sampler, SamplerConfig::default());
        assert_eq!(config.filters.min_platform_studies, 6);
        assert_eq!(config.filters.max_known_loci_excluded, 100);
        assert_eq!(config.evaluation.sidedness, Sidedness::TwoSided);
        assert_eq!(config.sampler.expected_draws(), 4 * 1000);
    }

    #[test]
    fn full_file_is_parsed() {
        let text = r#"
[vocabulary]
platforms = ["A", "B"]

[sampler]
chains = 2
iterations = 300
warmup = 100
seed = 7

[priors]
location_scale = 2.0

[check]
rows = 4
replicates = 50

[evaluation]
sidedness = "one-sided"
"#;
        let config = RunConfig::from_toml_str(text).unwrap();
        assert_eq!(config.sampler.chains, 2);
        assert_eq!(config.sampler.expected_draws(), 400);
        assert_eq!(config.priors.location_scale, 2.0);
        assert_eq!(config.priors.variance_shape, 2.0);
        assert_eq!(config.check.rows, 4);
        assert_eq!(config.evaluation.sidedness, Sidedness::OneSided);
    }

    #[test]
    fn warmup_must_be_smaller_than_iterations() {
        let text = format!("{MINIMAL}\n[sampler]\niterations = 100\nwarmup = 100\n");
        match RunConfig::from_toml_str(&text).unwrap_err() {
            ConfigError::InvalidSampler { name, .. } => assert_eq!(name, "warmup"),
            other => panic!("Expected InvalidSampler(warmup), got {:?}", other),
        }
    }

    #[test]
    fn zero_chains_and_zero_iterations_are_rejected() {
        let zero_chains = SamplerConfig {
            chains: 0,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            zero_chains.validate(),
            Err(ConfigError::InvalidSampler { name: "chains", .. })
        ));
        let zero_iterations = SamplerConfig {
            iterations: 0,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            zero_iterations.validate(),
            Err(ConfigError::InvalidSampler { name: "iterations", .. })
        ));
    }

    #[test]
    fn duplicate_platforms_fail_to_parse() {
        let text = "[vocabulary]\nplatforms = [\"A\", \"A\"]\n";
        assert!(matches!(
            RunConfig::from_toml_str(text),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn negative_prior_is_rejected() {
        let text = format!("{MINIMAL}\n[priors]\nvariance_rate = -1.0\n");
        assert!(matches!(
            RunConfig::from_toml_str(&text),
            Err(ConfigError::InvalidPrior {
                name: "variance_rate",
                ..
            })
        ));
    }

    #[test]
    fn zero_in_sample_replicates_is_allowed() {
        let text = format!("{MINIMAL}\n[check]\nreplicates = 0\n");
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.check.replicates, 0);
        assert_eq!(config.check.rows, 10);
    }

    #[test]
    fn configuration_survives_toml_round_trip() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(RunConfig::from_toml_str(&text).unwrap(), config);
    }
}
