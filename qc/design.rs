//! # Platform Design Encoding
//!
//! Turns categorical platform labels into one-hot indicator rows over a closed,
//! ordered vocabulary. The column order of the vocabulary is the implicit
//! contract between fitting and prediction: a coefficient at column `j` of the
//! posterior always belongs to `vocabulary[j]`.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DesignError {
    #[error("Platform '{label}' is not part of the model vocabulary [{known}].")]
    UnknownPlatform { label: String, known: String },
    #[error("The platform vocabulary must contain at least one platform.")]
    EmptyVocabulary,
    #[error("Platform identifiers must be non-empty; found an empty entry at position {0}.")]
    EmptyPlatform(usize),
    #[error("Platform '{0}' appears more than once in the vocabulary.")]
    DuplicatePlatform(String),
}

/// The ordered, immutable set of platform identifiers the model is defined over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PlatformVocabulary {
    platforms: Vec<String>,
}

impl PlatformVocabulary {
    pub fn new<I, S>(platforms: I) -> Result<Self, DesignError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let platforms: Vec<String> = platforms.into_iter().map(Into::into).collect();
        if platforms.is_empty() {
            return Err(DesignError::EmptyVocabulary);
        }
        for (idx, platform) in platforms.iter().enumerate() {
            if platform.trim().is_empty() {
                return Err(DesignError::EmptyPlatform(idx));
            }
            if platforms[..idx].contains(platform) {
                return Err(DesignError::DuplicatePlatform(platform.clone()));
            }
        }
        Ok(Self { platforms })
    }

    /// Number of platforms, `P`.
    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Column index of `label`, or `UnknownPlatform` if it is outside the vocabulary.
    pub fn index_of(&self, label: &str) -> Result<usize, DesignError> {
        self.platforms
            .iter()
            .position(|p| p == label)
            .ok_or_else(|| DesignError::UnknownPlatform {
                label: label.to_string(),
                known: self.platforms.join(", "),
            })
    }
}

impl TryFrom<Vec<String>> for PlatformVocabulary {
    type Error = DesignError;

    fn try_from(platforms: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(platforms)
    }
}

impl From<PlatformVocabulary> for Vec<String> {
    fn from(vocabulary: PlatformVocabulary) -> Self {
        vocabulary.platforms
    }
}

/// Encodes a single label as a length-`P` indicator row.
pub fn encode(label: &str, vocabulary: &PlatformVocabulary) -> Result<Array1<f64>, DesignError> {
    let column = vocabulary.index_of(label)?;
    let mut row = Array1::<f64>::zeros(vocabulary.len());
    row[column] = 1.0;
    Ok(row)
}

/// Encodes a batch of labels as an `N x P` design matrix.
///
/// Every row is produced by [`encode`], so the batch and single-label paths
/// cannot drift apart. Fails on the first label outside the vocabulary.
pub fn encode_all<S: AsRef<str>>(
    labels: &[S],
    vocabulary: &PlatformVocabulary,
) -> Result<Array2<f64>, DesignError> {
    let mut design = Array2::<f64>::zeros((labels.len(), vocabulary.len()));
    for (i, label) in labels.iter().enumerate() {
        design.row_mut(i).assign(&encode(label.as_ref(), vocabulary)?);
    }
    Ok(design)
}
