//! Usage metrics, access logging, and metrics persistence.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::scan::Label;

/// Maximum number of rotated access log files to keep.
const MAX_ACCESS_LOG_ROTATIONS: usize = 5;

/// Interval in seconds between metrics persistence to disk.
pub const METRICS_PERSIST_INTERVAL_SECS: u64 = 60;

/// One completed scan, as written to the access log.
pub struct RecordEvent<'a> {
    pub endpoint: &'a str,
    pub sha256: &'a str,
    pub size: usize,
    pub label: Label,
    pub probability: Option<f64>,
    pub fallback: Option<&'a str>,
    pub processing_time_ms: u64,
}

/// On-disk form of the counters.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MetricsSnapshot {
    total_requests: u64,
    total_errors: u64,
    rate_limited: u64,
    benign: u64,
    malicious: u64,
    fallbacks: u64,
    ep_raw: u64,
    ep_predict: u64,
    ep_scan: u64,
    ep_stats: u64,
}

pub struct UsageMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub rate_limited: AtomicU64,

    pub benign: AtomicU64,
    pub malicious: AtomicU64,
    pub fallbacks: AtomicU64,

    pub ep_raw: AtomicU64,
    pub ep_predict: AtomicU64,
    pub ep_scan: AtomicU64,
    pub ep_stats: AtomicU64,

    access_log: std::sync::Mutex<Option<File>>,
    access_log_path: String,
    access_log_bytes: AtomicU64,
    max_access_log_bytes: u64,
    metrics_path: Option<PathBuf>,
}

impl UsageMetrics {
    pub fn new(
        access_log_path: &str,
        max_access_log_bytes: u64,
        metrics_path: Option<&Path>,
    ) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(access_log_path)
            .ok();
        if file.is_none() {
            warn!(path = access_log_path, "could not open access log");
        }
        let current_size = std::fs::metadata(access_log_path)
            .map(|m| m.len())
            .unwrap_or(0);

        let metrics = Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            benign: AtomicU64::new(0),
            malicious: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            ep_raw: AtomicU64::new(0),
            ep_predict: AtomicU64::new(0),
            ep_scan: AtomicU64::new(0),
            ep_stats: AtomicU64::new(0),
            access_log: std::sync::Mutex::new(file),
            access_log_path: access_log_path.to_string(),
            access_log_bytes: AtomicU64::new(current_size),
            max_access_log_bytes,
            metrics_path: metrics_path.map(Path::to_path_buf),
        };
        metrics.restore_from_disk();
        metrics
    }

    pub fn record(&self, event: &RecordEvent<'_>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match event.label {
            Label::Benign => self.benign.fetch_add(1, Ordering::Relaxed),
            Label::Malicious => self.malicious.fetch_add(1, Ordering::Relaxed),
        };
        if event.fallback.is_some() {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        let entry = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "endpoint": event.endpoint,
            "sha256": event.sha256,
            "size": event.size,
            "label": event.label,
            "probability": event.probability,
            "fallback": event.fallback,
            "processing_time_ms": event.processing_time_ms,
        });
        self.append_access_log(entry);
    }

    pub fn record_error(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn append_access_log(&self, entry: serde_json::Value) {
        let Ok(mut guard) = self.access_log.lock() else {
            return;
        };
        let Some(ref mut file) = *guard else {
            return;
        };

        let mut line = entry.to_string();
        line.push('\n');
        let line_len = line.len() as u64;
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write access log entry");
        }
        let new_size = self.access_log_bytes.fetch_add(line_len, Ordering::Relaxed) + line_len;

        // Rotate if over size limit (0 = no limit)
        if self.max_access_log_bytes > 0 && new_size >= self.max_access_log_bytes {
            for i in (1..MAX_ACCESS_LOG_ROTATIONS).rev() {
                let from = format!("{}.{}", self.access_log_path, i);
                let to = format!("{}.{}", self.access_log_path, i + 1);
                if Path::new(&from).exists() {
                    if let Err(e) = std::fs::rename(&from, &to) {
                        warn!(from = %from, to = %to, error = %e, "log rotation rename failed");
                    }
                }
            }
            let rotated = format!("{}.1", self.access_log_path);
            if let Err(e) = std::fs::rename(&self.access_log_path, &rotated) {
                warn!(
                    from = %self.access_log_path,
                    to = %rotated,
                    error = %e,
                    "log rotation rename failed"
                );
            }
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.access_log_path)
            {
                Ok(new_file) => {
                    *file = new_file;
                    self.access_log_bytes.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(path = %self.access_log_path, error = %e, "failed to reopen access log")
                }
            }
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            benign: self.benign.load(Ordering::Relaxed),
            malicious: self.malicious.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            ep_raw: self.ep_raw.load(Ordering::Relaxed),
            ep_predict: self.ep_predict.load(Ordering::Relaxed),
            ep_scan: self.ep_scan.load(Ordering::Relaxed),
            ep_stats: self.ep_stats.load(Ordering::Relaxed),
        }
    }

    /// Seed the counters from a previous run's snapshot, if there is one.
    fn restore_from_disk(&self) {
        let Some(path) = self.metrics_path.as_deref() else {
            return;
        };
        let Ok(data) = std::fs::read(path) else {
            return;
        };
        match serde_json::from_slice::<MetricsSnapshot>(&data) {
            Ok(s) => {
                self.total_requests.store(s.total_requests, Ordering::Relaxed);
                self.total_errors.store(s.total_errors, Ordering::Relaxed);
                self.rate_limited.store(s.rate_limited, Ordering::Relaxed);
                self.benign.store(s.benign, Ordering::Relaxed);
                self.malicious.store(s.malicious, Ordering::Relaxed);
                self.fallbacks.store(s.fallbacks, Ordering::Relaxed);
                self.ep_raw.store(s.ep_raw, Ordering::Relaxed);
                self.ep_predict.store(s.ep_predict, Ordering::Relaxed);
                self.ep_scan.store(s.ep_scan, Ordering::Relaxed);
                self.ep_stats.store(s.ep_stats, Ordering::Relaxed);
                info!(
                    path = %path.display(),
                    total_requests = s.total_requests,
                    "restored metrics"
                );
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable metrics file"),
        }
    }

    /// Persist current metrics snapshot to disk so they survive restarts.
    pub fn persist_to_disk(&self) {
        let Some(path) = self.metrics_path.as_deref() else {
            return;
        };
        match serde_json::to_vec_pretty(&self.snapshot()) {
            Ok(data) => {
                if let Err(e) = std::fs::write(path, &data) {
                    warn!(path = %path.display(), error = %e, "failed to persist metrics");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize metrics snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: Label, fallback: Option<&str>) -> RecordEvent<'_> {
        RecordEvent {
            endpoint: "raw",
            sha256: "00",
            size: 4,
            label,
            probability: fallback.is_none().then_some(0.25),
            fallback,
            processing_time_ms: 1,
        }
    }

    #[test]
    fn test_usage_metrics_counters() {
        let metrics = UsageMetrics::new("/dev/null", 0, None);
        metrics.record(&event(Label::Benign, None));
        metrics.record(&event(Label::Malicious, None));
        metrics.record(&event(Label::Benign, Some("parse_error")));
        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.benign.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.malicious.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.fallbacks.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_errors.load(Ordering::Relaxed), 0);

        metrics.record_error();
        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.total_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_access_log_lines_are_json() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.jsonl");
        let metrics = UsageMetrics::new(log.to_str().unwrap(), 0, None);
        metrics.record(&event(Label::Malicious, None));
        metrics.record(&event(Label::Benign, Some("panic")));

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["label"], 1);
        assert_eq!(lines[0]["probability"], 0.25);
        assert_eq!(lines[1]["fallback"], "panic");
        assert!(lines[1]["timestamp"].is_string());
    }

    #[test]
    fn test_access_log_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.jsonl");
        let metrics = UsageMetrics::new(log.to_str().unwrap(), 64, None);
        for _ in 0..4 {
            metrics.record(&event(Label::Benign, None));
        }
        assert!(dir.path().join("access.jsonl.1").exists());
        assert!(log.exists());
    }

    #[test]
    fn test_metrics_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        {
            let metrics = UsageMetrics::new("/dev/null", 0, Some(&path));
            metrics.record(&event(Label::Malicious, None));
            metrics.ep_raw.fetch_add(1, Ordering::Relaxed);
            metrics.persist_to_disk();
        }
        let restored = UsageMetrics::new("/dev/null", 0, Some(&path));
        assert_eq!(restored.total_requests.load(Ordering::Relaxed), 1);
        assert_eq!(restored.malicious.load(Ordering::Relaxed), 1);
        assert_eq!(restored.ep_raw.load(Ordering::Relaxed), 1);
    }
}
