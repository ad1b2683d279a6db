//! The scan pipeline: bytes → features → probability → label.
//!
//! [`Scanner`] owns the extractor and classifier for the lifetime of the
//! process and is shared across request handlers behind an `Arc`. It holds no
//! mutable state, so concurrent scans never contend on it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

use eyre::{bail, Result};
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::features::{ExtractError, FeatureExtractor};
use crate::model::{ClassifyError, Classifier};

/// Default decision threshold on the malicious probability.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Binary verdict. Serialized as the integer `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Benign,
    Malicious,
}

impl Label {
    pub fn from_probability(probability: f64, threshold: f64) -> Self {
        if probability >= threshold {
            Label::Malicious
        } else {
            Label::Benign
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Label::Benign => 0,
            Label::Malicious => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Benign => "benign",
            Label::Malicious => "malicious",
        }
    }
}

impl TryFrom<u64> for Label {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Benign),
            1 => Ok(Label::Malicious),
            other => Err(format!("label must be 0 or 1, got {other}")),
        }
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// What to answer when a scan cannot complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fail open: report label 0.
    #[default]
    Benign,
    /// Fail closed: report label 1.
    Malicious,
    /// Surface the failure to the caller (HTTP 500).
    Error,
}

impl FailurePolicy {
    /// The label substituted for a failed scan, if the policy substitutes one.
    pub fn fallback_label(self) -> Option<Label> {
        match self {
            FailurePolicy::Benign => Some(Label::Benign),
            FailurePolicy::Malicious => Some(Label::Malicious),
            FailurePolicy::Error => None,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "benign" | "0" => Ok(FailurePolicy::Benign),
            "malicious" | "1" => Ok(FailurePolicy::Malicious),
            "error" => Ok(FailurePolicy::Error),
            other => Err(format!(
                "unknown failure policy {other:?} (expected benign, malicious or error)"
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailurePolicy::Benign => "benign",
            FailurePolicy::Malicious => "malicious",
            FailurePolicy::Error => "error",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("feature extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),
    #[error("scan panicked: {0}")]
    Panicked(String),
}

impl ScanError {
    /// Short machine-readable reason, used in logs and fallback verdicts.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::EmptyPayload => "empty_payload",
            ScanError::Extract(ExtractError::Parse(_)) => "parse_error",
            ScanError::Extract(_) => "extract_error",
            ScanError::Classify(_) => "classify_error",
            ScanError::Panicked(_) => "panic",
        }
    }
}

/// A completed scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub probability: f64,
    pub label: Label,
    pub num_features: usize,
}

/// The answer returned to a client: either a real score or a policy fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub label: Label,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_features: Option<usize>,
    /// Why the policy label was used instead of a score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl Verdict {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl From<Score> for Verdict {
    fn from(score: Score) -> Self {
        Self {
            label: score.label,
            probability: Some(score.probability),
            num_features: Some(score.num_features),
            fallback: None,
        }
    }
}

pub struct Scanner {
    extractor: Box<dyn FeatureExtractor>,
    classifier: Box<dyn Classifier>,
    threshold: f64,
    failure_policy: FailurePolicy,
}

impl Scanner {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        classifier: Box<dyn Classifier>,
        threshold: f64,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("threshold must be within [0, 1], got {threshold}");
        }
        if extractor.dim() != classifier.num_features() {
            warn!(
                extractor_dim = extractor.dim(),
                model_features = classifier.num_features(),
                "feature vector length does not match the model; every scan will fail"
            );
        }
        Ok(Self {
            extractor,
            classifier,
            threshold,
            failure_policy,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn num_features(&self) -> usize {
        self.classifier.num_features()
    }

    /// Extract, classify and threshold, without applying the failure policy.
    pub fn score(&self, bytes: &[u8]) -> Result<Score, ScanError> {
        if bytes.is_empty() {
            return Err(ScanError::EmptyPayload);
        }
        guarded(|| {
            let features = self.extractor.extract(bytes)?;
            let probability = self.classifier.predict_proba(&features)?;
            Ok(Score {
                probability,
                label: Label::from_probability(probability, self.threshold),
                num_features: features.len(),
            })
        })
    }

    /// Score `bytes`, substituting the policy label for any failure.
    ///
    /// An empty payload is always an error; it never reaches the pipeline.
    pub fn scan(&self, bytes: &[u8]) -> Result<Verdict, ScanError> {
        match self.score(bytes) {
            Ok(score) => Ok(score.into()),
            Err(ScanError::EmptyPayload) => Err(ScanError::EmptyPayload),
            Err(e) => self.recover(e),
        }
    }

    /// Apply the failure policy to a pipeline error.
    pub fn recover(&self, err: ScanError) -> Result<Verdict, ScanError> {
        warn!(
            reason = err.kind(),
            error = %err,
            policy = %self.failure_policy,
            "scan failed"
        );
        match self.failure_policy.fallback_label() {
            Some(label) => Ok(Verdict {
                label,
                probability: None,
                num_features: None,
                fallback: Some(err.kind().to_string()),
            }),
            None => Err(err),
        }
    }
}

/// Run `f`, converting a panic into [`ScanError::Panicked`].
fn guarded<T>(f: impl FnOnce() -> Result<T, ScanError>) -> Result<T, ScanError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ScanError::Panicked(message))
    })
}
