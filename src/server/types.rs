//! Request/response types and configuration for the scan service.

use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::scan::{FailurePolicy, Label, DEFAULT_THRESHOLD};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default model location, relative to the working directory.
pub const DEFAULT_MODEL_PATH: &str = "models/xgb_model.json";

/// Default request body limit (32 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// XGBoost JSON model file
    pub model_path: PathBuf,
    /// Malicious when probability >= threshold
    pub threshold: f64,
    /// Label (or error) returned when a scan cannot complete
    pub failure_policy: FailurePolicy,
    /// Rate limit in requests per minute per IP (0 = no limit)
    pub rate_limit_rpm: u32,
    /// Path for JSONL access log
    pub access_log_path: String,
    /// Maximum access log file size in bytes before rotation (0 = no limit)
    pub max_access_log_bytes: u64,
    /// Largest accepted request body; larger bodies get 413.
    pub max_body_bytes: usize,
    /// Optional API key for bearer token authentication on /api/v1/* endpoints.
    /// If None, auth is disabled.
    pub api_key: Option<String>,
    /// Where to persist usage counters (periodically and on shutdown).
    pub metrics_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            threshold: DEFAULT_THRESHOLD,
            failure_policy: FailurePolicy::Benign,
            rate_limit_rpm: 0,
            access_log_path: "defender-access.jsonl".to_string(),
            max_access_log_bytes: 50 * 1024 * 1024, // 50 MB
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            api_key: None,
            metrics_path: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("model_path", &self.model_path)
            .field("threshold", &self.threshold)
            .field("failure_policy", &self.failure_policy)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("access_log_path", &self.access_log_path)
            .field("max_access_log_bytes", &self.max_access_log_bytes)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("metrics_path", &self.metrics_path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// `POST /`
#[derive(Debug, Serialize)]
pub struct RawScanResponse {
    pub result: Label,
}

/// `POST /predict`
#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub label: Label,
}

/// `POST /api/v1/scan`
#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub label: Label,
    pub verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_features: Option<usize>,
    /// Set when the failure policy produced the label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub sha256: String,
    pub size: usize,
    pub model_hash: String,
    pub processing_time_ms: u64,
}

/// Error body for every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_hash: String,
    pub num_features: usize,
    pub threshold: f64,
    pub failure_policy: FailurePolicy,
    pub uptime_seconds: u64,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub model_hash: String,
    pub requests: RequestStats,
    pub verdicts: VerdictStats,
    pub endpoints: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub errors: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Serialize)]
pub struct VerdictStats {
    pub benign: u64,
    pub malicious: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub raw: u64,
    pub predict: u64,
    pub scan: u64,
    pub stats: u64,
}
