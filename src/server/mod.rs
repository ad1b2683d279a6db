//! HTTP server for the PE malware classifier.
//!
//! Features:
//! - `POST /` (raw body) and `POST /predict` (multipart) return a bare 0/1 verdict
//! - `POST /api/v1/scan` returns a detailed report, optionally behind a bearer token
//! - Per-IP rate limiting with automatic eviction when the map exceeds 10k entries
//! - JSONL access logging with size-based rotation (configurable via `max_access_log_bytes`)
//! - Structured logging via [`tracing`]

pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod types;

pub use handlers::{error_response, UPLOAD_FIELD};
pub use logging::{RecordEvent, UsageMetrics, METRICS_PERSIST_INTERVAL_SECS};
pub use types::{
    EndpointStats, ErrorResponse, HealthResponse, PredictResponse, RawScanResponse, RequestStats,
    ScanReport, ServerConfig, StatsResponse, VerdictStats, DEFAULT_MAX_BODY_BYTES,
    DEFAULT_MODEL_PATH,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use eyre::{Result, WrapErr};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::features::EmberExtractor;
use crate::model::GbdtModel;
use crate::scan::{FailurePolicy, Scanner};

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub config: ServerConfig,
    pub scanner: Arc<Scanner>,
    pub model_hash: String,
    pub start_time: Instant,
    pub rate_limiters: middleware::RateLimiterCache,
    pub usage: UsageMetrics,
}

impl ServerState {
    /// Assemble state around an already-built scanner.
    pub fn new(config: ServerConfig, scanner: Scanner, model_hash: impl Into<String>) -> Self {
        let usage = UsageMetrics::new(
            &config.access_log_path,
            config.max_access_log_bytes,
            config.metrics_path.as_deref(),
        );
        Self {
            config,
            scanner: Arc::new(scanner),
            model_hash: model_hash.into(),
            start_time: Instant::now(),
            rate_limiters: middleware::new_rate_limiter_cache(),
            usage,
        }
    }

    /// Load the model named in `config` and build the EMBER pipeline around it.
    pub fn load(config: ServerConfig) -> Result<Self> {
        let model = GbdtModel::load(&config.model_path)?;
        let model_hash = model.hash().to_string();
        let scanner = Scanner::new(
            Box::new(EmberExtractor::new()),
            Box::new(model),
            config.threshold,
            config.failure_policy,
        )?;
        Ok(Self::new(config, scanner, model_hash))
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Build the application router.
pub fn router(state: Arc<ServerState>) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/scan", post(handlers::scan_handler))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    // CORS layer: allow any origin for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", post(handlers::raw_scan_handler))
        .route("/predict", post(handlers::predict_handler))
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .merge(api_routes)
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .with_state(state)
}

/// Run the HTTP server (blocking)
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let bind_addr = config.bind_addr;
    let state = Arc::new(ServerState::load(config)?);

    if state.config.failure_policy == FailurePolicy::Benign {
        warn!(
            "fail-open is active: samples that cannot be scanned are reported benign \
             (--on-error to change)"
        );
    }

    let app = router(state.clone());

    // Spawn background task to persist metrics to disk periodically
    if state.config.metrics_path.is_some() {
        let metrics_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                METRICS_PERSIST_INTERVAL_SECS,
            ));
            loop {
                interval.tick().await;
                metrics_state.usage.persist_to_disk();
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {bind_addr}"))?;
    info!(bind = %bind_addr, model_hash = %state.model_hash, "PE defender listening");
    info!("Endpoints: POST /, POST /predict, POST /api/v1/scan, GET /health, GET /stats");
    info!(
        threshold = state.config.threshold,
        failure_policy = %state.config.failure_policy,
        max_body_bytes = state.config.max_body_bytes,
        auth = state.config.api_key.is_some(),
        "scan settings"
    );
    if state.config.rate_limit_rpm > 0 {
        info!(rate_limit_rpm = state.config.rate_limit_rpm, "rate limiting enabled");
    } else {
        info!("rate limiting disabled");
    }
    info!(access_log = %state.config.access_log_path, "access logging enabled");

    // Graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = state;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_state.usage.persist_to_disk();
    })
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down gracefully"),
        _ = sigterm => info!("received SIGTERM, shutting down gracefully"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{ExtractError, FeatureExtractor};
    use crate::model::{ClassifyError, Classifier};
    use crate::scan::Label;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            model_hash: "sha256:abc".to_string(),
            num_features: 2381,
            threshold: 0.5,
            failure_policy: FailurePolicy::Benign,
            uptime_seconds: 100,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"failure_policy\":\"benign\""));
        assert!(json.contains("\"num_features\":2381"));
    }

    #[test]
    fn test_stats_response_serialization() {
        let response = StatsResponse {
            uptime_seconds: 3600,
            model_hash: "sha256:abc".to_string(),
            requests: RequestStats {
                total: 100,
                errors: 2,
                rate_limited: 1,
            },
            verdicts: VerdictStats {
                benign: 80,
                malicious: 18,
                fallbacks: 5,
            },
            endpoints: EndpointStats {
                raw: 60,
                predict: 35,
                scan: 3,
                stats: 5,
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"total\":100"));
        assert!(json.contains("\"fallbacks\":5"));
        assert!(json.contains("\"predict\":35"));
    }

    #[test]
    fn test_raw_response_uses_integer_label() {
        let json = serde_json::to_string(&RawScanResponse {
            result: Label::Malicious,
        })
        .unwrap();
        assert_eq!(json, r#"{"result":1}"#);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert!(config.api_key.is_none());
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.failure_policy, FailurePolicy::Benign);
        assert_eq!(config.rate_limit_rpm, 0);
    }

    #[test]
    fn test_server_config_debug_redacts_api_key() {
        let config = ServerConfig {
            api_key: Some("secret-key-123".to_string()),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key-123"));
        assert!(debug.contains("[REDACTED]"));
    }

    struct Zeros;

    impl FeatureExtractor for Zeros {
        fn dim(&self) -> usize {
            1
        }

        fn extract(&self, _bytes: &[u8]) -> Result<Vec<f32>, ExtractError> {
            Ok(vec![0.0])
        }
    }

    impl Classifier for Zeros {
        fn num_features(&self) -> usize {
            1
        }

        fn predict_proba(&self, _features: &[f32]) -> Result<f64, ClassifyError> {
            Ok(0.0)
        }
    }

    #[test]
    fn test_state_load_fails_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            model_path: dir.path().join("missing.json"),
            access_log_path: "/dev/null".to_string(),
            ..Default::default()
        };
        assert!(ServerState::load(config).is_err());
    }

    #[test]
    fn test_state_new_reports_model_hash() {
        let config = ServerConfig {
            access_log_path: "/dev/null".to_string(),
            ..Default::default()
        };
        let scanner = Scanner::new(
            Box::new(Zeros),
            Box::new(Zeros),
            0.5,
            FailurePolicy::Benign,
        )
        .unwrap();
        let state = ServerState::new(config, scanner, "sha256:test");
        assert_eq!(state.model_hash, "sha256:test");
        assert_eq!(state.scanner.num_features(), 1);
    }
}
