//! Offline accuracy evaluation over labelled sample directories.
//!
//! Every file under the malware directory is expected to score 1, every file
//! under the benign directory 0. Samples are scored either in-process with a
//! [`Scanner`] (parallel on a rayon pool) or against a running service via
//! `POST /`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, Result, WrapErr};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::scan::{Label, Scanner};

/// File extensions treated as executables. Files without an extension are
/// included too.
const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "dll", "sys", "scr"];

/// Number of failing samples listed in a report.
const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub expected: Label,
}

/// Recursively collect candidate executables under `dir`.
pub fn collect_samples(dir: &Path, expected: Label) -> Result<Vec<Sample>> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut samples: Vec<Sample> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| match e.path().extension().and_then(|x| x.to_str()) {
            None => true,
            Some(ext) => EXECUTABLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known)),
        })
        .map(|e| Sample {
            path: e.into_path(),
            expected,
        })
        .collect();
    samples.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(dir = %dir.display(), count = samples.len(), "collected samples");
    Ok(samples)
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub path: PathBuf,
    pub expected: Label,
    pub predicted: Result<Label, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl ConfusionMatrix {
    pub fn add(&mut self, expected: Label, predicted: Label) {
        match (expected, predicted) {
            (Label::Malicious, Label::Malicious) => self.true_positives += 1,
            (Label::Benign, Label::Malicious) => self.false_positives += 1,
            (Label::Benign, Label::Benign) => self.true_negatives += 1,
            (Label::Malicious, Label::Benign) => self.false_negatives += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// Same as the true positive rate.
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn false_positive_rate(&self) -> f64 {
        ratio(self.false_positives, self.false_positives + self.true_negatives)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub total: u64,
    pub errors: u64,
    pub matrix: ConfusionMatrix,
    /// Correct predictions over all samples; errored samples count as wrong.
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub fpr: f64,
    pub tpr: f64,
    pub elapsed_ms: u64,
    pub failures: Vec<String>,
}

impl EvaluationReport {
    pub fn from_outcomes(outcomes: &[Outcome], elapsed: Duration) -> Self {
        let mut matrix = ConfusionMatrix::default();
        let mut errors = 0u64;
        let mut failures = Vec::new();

        for outcome in outcomes {
            match &outcome.predicted {
                Ok(label) => matrix.add(outcome.expected, *label),
                Err(e) => {
                    errors += 1;
                    if failures.len() < MAX_REPORTED_FAILURES {
                        failures.push(format!("{}: {}", outcome.path.display(), e));
                    }
                }
            }
        }

        let total = outcomes.len() as u64;
        Self {
            total,
            errors,
            matrix,
            accuracy: ratio(matrix.true_positives + matrix.true_negatives, total),
            precision: matrix.precision(),
            recall: matrix.recall(),
            f1: matrix.f1(),
            fpr: matrix.false_positive_rate(),
            tpr: matrix.recall(),
            elapsed_ms: elapsed.as_millis() as u64,
            failures,
        }
    }
}

/// Score every sample in-process on a pool of `jobs` threads.
pub fn evaluate_local(
    scanner: &Scanner,
    samples: &[Sample],
    jobs: usize,
) -> Result<EvaluationReport> {
    let start = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .wrap_err("failed to build evaluation thread pool")?;

    info!(samples = samples.len(), jobs, "evaluating locally");
    let outcomes: Vec<Outcome> = pool.install(|| {
        samples
            .par_iter()
            .map(|sample| Outcome {
                path: sample.path.clone(),
                expected: sample.expected,
                predicted: score_file(scanner, &sample.path),
            })
            .collect()
    });

    Ok(EvaluationReport::from_outcomes(&outcomes, start.elapsed()))
}

fn score_file(scanner: &Scanner, path: &Path) -> Result<Label, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    scanner
        .scan(&bytes)
        .map(|verdict| verdict.label)
        .map_err(|e| e.to_string())
}

#[derive(Deserialize)]
struct RawScanResponse {
    result: u64,
}

/// Score every sample against a running service, at most `jobs` in flight.
pub async fn evaluate_remote(
    server: &str,
    samples: Vec<Sample>,
    jobs: usize,
) -> Result<EvaluationReport> {
    let start = Instant::now();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let url = format!("{}/", server.trim_end_matches('/'));

    info!(samples = samples.len(), jobs, url = %url, "evaluating against service");
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut handles = Vec::with_capacity(samples.len());

    for sample in samples {
        let permit = semaphore.clone().acquire_owned().await?;
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let predicted = post_sample(&client, &url, &sample.path).await;
            drop(permit);
            Outcome {
                path: sample.path,
                expected: sample.expected,
                predicted,
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!(error = %e, "evaluation task failed"),
        }
    }

    Ok(EvaluationReport::from_outcomes(&outcomes, start.elapsed()))
}

async fn post_sample(client: &reqwest::Client, url: &str, path: &Path) -> Result<Label, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let response = client
        .post(url)
        .header("Content-Type", "application/octet-stream")
        .body(bytes)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {status}: {body}"));
    }
    let parsed: RawScanResponse = response.json().await.map_err(|e| e.to_string())?;
    Label::try_from(parsed.result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_matrix_metrics() {
        let mut m = ConfusionMatrix::default();
        for _ in 0..8 {
            m.add(Label::Malicious, Label::Malicious);
        }
        for _ in 0..2 {
            m.add(Label::Malicious, Label::Benign);
        }
        m.add(Label::Benign, Label::Malicious);
        for _ in 0..9 {
            m.add(Label::Benign, Label::Benign);
        }
        assert_eq!(m.total(), 20);
        assert!((m.precision() - 8.0 / 9.0).abs() < 1e-12);
        assert!((m.recall() - 0.8).abs() < 1e-12);
        assert!((m.false_positive_rate() - 0.1).abs() < 1e-12);
        let f1 = 2.0 * (8.0 / 9.0) * 0.8 / (8.0 / 9.0 + 0.8);
        assert!((m.f1() - f1).abs() < 1e-12);
    }

    #[test]
    fn test_empty_matrix_has_zero_metrics() {
        let m = ConfusionMatrix::default();
        assert_eq!(m.precision(), 0.0);
        assert_eq!(m.recall(), 0.0);
        assert_eq!(m.f1(), 0.0);
    }

    #[test]
    fn test_report_counts_errors_as_wrong() {
        let outcomes = vec![
            Outcome {
                path: "a".into(),
                expected: Label::Malicious,
                predicted: Ok(Label::Malicious),
            },
            Outcome {
                path: "b".into(),
                expected: Label::Benign,
                predicted: Err("unreadable".into()),
            },
        ];
        let report = EvaluationReport::from_outcomes(&outcomes, Duration::ZERO);
        assert_eq!(report.total, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.accuracy, 0.5);
        assert_eq!(report.failures, vec!["b: unreadable".to_string()]);
    }

    #[test]
    fn test_collect_samples_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("family");
        std::fs::create_dir(&nested).unwrap();
        for name in ["a.exe", "b.DLL", "c.txt", "noext"] {
            std::fs::write(nested.join(name), b"MZ").unwrap();
        }
        let samples = collect_samples(dir.path(), Label::Malicious).unwrap();
        let names: Vec<_> = samples
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.exe", "b.DLL", "noext"]);
        assert!(samples.iter().all(|s| s.expected == Label::Malicious));
    }

    #[test]
    fn test_collect_samples_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_samples(&dir.path().join("missing"), Label::Benign).is_err());
    }
}
