//! HTTP endpoint handler functions.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};

use crate::scan::{ScanError, Verdict};

use super::logging::RecordEvent;
use super::types::*;
use super::ServerState;

/// Name of the multipart field carrying the sample on `/predict`.
pub const UPLOAD_FIELD: &str = "file";

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Shared scan logic
// ---------------------------------------------------------------------------

struct Scanned {
    verdict: Verdict,
    sha256: String,
    size: usize,
    processing_time_ms: u64,
}

/// Run the pipeline on the blocking pool and record the outcome.
///
/// Returns the error response to send when the payload is empty or the
/// failure policy is `error`.
async fn run_scan(
    state: &Arc<ServerState>,
    endpoint: &str,
    body: Bytes,
) -> Result<Scanned, Response> {
    let start = Instant::now();
    if body.is_empty() {
        state.usage.record_error();
        return Err(error_response(StatusCode::BAD_REQUEST, "empty payload"));
    }

    let scanner = Arc::clone(&state.scanner);
    let payload = body.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let sha256 = hex::encode(Sha256::digest(&payload));
        (scanner.score(&payload), sha256)
    })
    .await;

    let (result, sha256) = match joined {
        Ok((score, sha256)) => (score.map(Verdict::from), sha256),
        Err(e) => (
            Err(ScanError::Panicked(e.to_string())),
            hex::encode(Sha256::digest(&body)),
        ),
    };
    let result = match result {
        Ok(verdict) => Ok(verdict),
        Err(ScanError::EmptyPayload) => Err(ScanError::EmptyPayload),
        Err(e) => state.scanner.recover(e),
    };
    let processing_time_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(verdict) => {
            state.usage.record(&RecordEvent {
                endpoint,
                sha256: &sha256,
                size: body.len(),
                label: verdict.label,
                probability: verdict.probability,
                fallback: verdict.fallback.as_deref(),
                processing_time_ms,
            });
            tracing::info!(
                endpoint,
                sha256 = %sha256,
                size = body.len(),
                label = verdict.label.as_u8(),
                probability = ?verdict.probability,
                fallback = ?verdict.fallback,
                processing_time_ms,
                "scanned"
            );
            Ok(Scanned {
                verdict,
                sha256,
                size: body.len(),
                processing_time_ms,
            })
        }
        Err(ScanError::EmptyPayload) => {
            state.usage.record_error();
            Err(error_response(StatusCode::BAD_REQUEST, "empty payload"))
        }
        Err(e) => {
            state.usage.record_error();
            tracing::error!(
                endpoint,
                sha256 = %sha256,
                reason = e.kind(),
                "scan failed, returning 500"
            );
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("scan failed: {}", e.kind()),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /` with the raw sample as the body.
pub async fn raw_scan_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    state.usage.ep_raw.fetch_add(1, Ordering::Relaxed);
    let body = match body {
        Ok(b) => b,
        Err(rejection) => {
            state.usage.record_error();
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    match run_scan(&state, "raw", body).await {
        Ok(scanned) => Json(RawScanResponse {
            result: scanned.verdict.label,
        })
        .into_response(),
        Err(response) => response,
    }
}

/// `POST /predict` with a multipart upload in the `file` field.
pub async fn predict_handler(
    State(state): State<Arc<ServerState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    state.usage.ep_predict.fetch_add(1, Ordering::Relaxed);
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            state.usage.record_error();
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    let mut upload: Option<Bytes> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                state.usage.record_error();
                return error_response(e.status(), e.body_text());
            }
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        match field.file_name() {
            // a plain form value, not an uploaded file
            None => continue,
            Some("") => {
                state.usage.record_error();
                return error_response(StatusCode::BAD_REQUEST, "empty filename");
            }
            Some(_) => {}
        }
        match field.bytes().await {
            Ok(bytes) => {
                upload = Some(bytes);
                break;
            }
            Err(e) => {
                state.usage.record_error();
                return error_response(e.status(), e.body_text());
            }
        }
    }

    let Some(bytes) = upload else {
        state.usage.record_error();
        return error_response(StatusCode::BAD_REQUEST, "missing file");
    };

    match run_scan(&state, "predict", bytes).await {
        Ok(scanned) => Json(PredictResponse {
            label: scanned.verdict.label,
        })
        .into_response(),
        Err(response) => response,
    }
}

/// `POST /api/v1/scan`: raw body, detailed report.
pub async fn scan_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    state.usage.ep_scan.fetch_add(1, Ordering::Relaxed);
    let body = match body {
        Ok(b) => b,
        Err(rejection) => {
            state.usage.record_error();
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    match run_scan(&state, "scan", body).await {
        Ok(scanned) => Json(ScanReport {
            label: scanned.verdict.label,
            verdict: scanned.verdict.label.as_str(),
            probability: scanned.verdict.probability,
            threshold: state.scanner.threshold(),
            num_features: scanned.verdict.num_features,
            fallback: scanned.verdict.fallback,
            sha256: scanned.sha256,
            size: scanned.size,
            model_hash: state.model_hash.clone(),
            processing_time_ms: scanned.processing_time_ms,
        })
        .into_response(),
        Err(response) => response,
    }
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_hash: state.model_hash.clone(),
        num_features: state.scanner.num_features(),
        threshold: state.scanner.threshold(),
        failure_policy: state.scanner.failure_policy(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

pub async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.usage.ep_stats.fetch_add(1, Ordering::Relaxed);
    let usage = &state.usage;

    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        model_hash: state.model_hash.clone(),
        requests: RequestStats {
            total: usage.total_requests.load(Ordering::Relaxed),
            errors: usage.total_errors.load(Ordering::Relaxed),
            rate_limited: usage.rate_limited.load(Ordering::Relaxed),
        },
        verdicts: VerdictStats {
            benign: usage.benign.load(Ordering::Relaxed),
            malicious: usage.malicious.load(Ordering::Relaxed),
            fallbacks: usage.fallbacks.load(Ordering::Relaxed),
        },
        endpoints: EndpointStats {
            raw: usage.ep_raw.load(Ordering::Relaxed),
            predict: usage.ep_predict.load(Ordering::Relaxed),
            scan: usage.ep_scan.load(Ordering::Relaxed),
            stats: usage.ep_stats.load(Ordering::Relaxed),
        },
    })
}
