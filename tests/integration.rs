//! Integration tests for the PE defender HTTP service.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tempfile::TempDir;
use tokio::net::TcpListener;

use pe_defender::scan::FailurePolicy;
use pe_defender::server::{router, ServerConfig, ServerState};

use common::{benign_pe, url_pe, write_model};

// ---------------------------------------------------------------------------
// Helper: spin up a test server on an ephemeral port
// ---------------------------------------------------------------------------

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _model_dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn spawn_test_server() -> TestServer {
    spawn_test_server_with(|_| {}).await
}

async fn spawn_test_server_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let (model_dir, model_path) = write_model();
    let mut config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        model_path,
        rate_limit_rpm: 0, // no rate limiting in tests
        access_log_path: "/dev/null".to_string(),
        max_access_log_bytes: 0,
        ..Default::default()
    };
    configure(&mut config);
    let state = Arc::new(ServerState::load(config).unwrap());
    let app = router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        _model_dir: model_dir,
    }
}

async fn post_raw(client: &reqwest::Client, url: &str, body: Vec<u8>) -> reqwest::Response {
    client
        .post(url)
        .header("Content-Type", "application/octet-stream")
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn raw_label(client: &reqwest::Client, server: &TestServer, body: Vec<u8>) -> u64 {
    let resp = post_raw(client, &server.url("/"), body).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["result"].as_u64().unwrap()
}

// ---------------------------------------------------------------------------
// POST /
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_raw_empty_body_returns_400() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/"), Vec::new()).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "empty payload");
}

#[tokio::test]
async fn test_raw_zero_bytes_fail_open() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    assert_eq!(raw_label(&client, &server, vec![0u8; 1024]).await, 0);
}

#[tokio::test]
async fn test_raw_truncated_pe_fail_open() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    let mut pe = url_pe();
    pe.truncate(0x90);
    assert_eq!(raw_label(&client, &server, pe).await, 0);
}

#[tokio::test]
async fn test_raw_benign_pe_returns_0() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    assert_eq!(raw_label(&client, &server, benign_pe()).await, 0);
}

#[tokio::test]
async fn test_raw_pe_with_urls_returns_1() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    assert_eq!(raw_label(&client, &server, url_pe()).await, 1);
}

#[tokio::test]
async fn test_raw_is_idempotent() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    for sample in [benign_pe(), url_pe(), vec![0u8; 1024]] {
        let first = raw_label(&client, &server, sample.clone()).await;
        let second = raw_label(&client, &server, sample).await;
        assert_eq!(first, second);
    }
}

#[tokio::test]
async fn test_concurrent_identical_requests_agree() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    let url = server.url("/");
    let sample = url_pe();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let client = client.clone();
            let url = url.clone();
            let sample = sample.clone();
            tokio::spawn(async move {
                let resp = post_raw(&client, &url, sample).await;
                assert_eq!(resp.status(), 200);
                let body: serde_json::Value = resp.json().await.unwrap();
                body["result"].as_u64().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 1);
    }
    assert_eq!(
        server
            .state
            .usage
            .malicious
            .load(std::sync::atomic::Ordering::Relaxed),
        50
    );
}

#[tokio::test]
async fn test_error_policy_returns_500() {
    let server = spawn_test_server_with(|c| c.failure_policy = FailurePolicy::Error).await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/"), vec![0u8; 1024]).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "scan failed: parse_error");

    // well-formed samples are unaffected
    assert_eq!(raw_label(&client, &server, url_pe()).await, 1);
}

#[tokio::test]
async fn test_malicious_policy_labels_unparseable_as_1() {
    let server = spawn_test_server_with(|c| c.failure_policy = FailurePolicy::Malicious).await;
    let client = reqwest::Client::new();
    assert_eq!(raw_label(&client, &server, vec![0u8; 1024]).await, 1);
}

#[tokio::test]
async fn test_body_over_limit_returns_413() {
    let server = spawn_test_server_with(|c| c.max_body_bytes = 1024).await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/"), vec![0u8; 4096]).await;
    assert_eq!(resp.status(), 413);
}

// ---------------------------------------------------------------------------
// POST /predict
// ---------------------------------------------------------------------------

async fn post_form(server: &TestServer, form: Form) -> reqwest::Response {
    reqwest::Client::new()
        .post(server.url("/predict"))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_predict_multipart_upload() {
    let server = spawn_test_server().await;

    let form = Form::new().part("file", Part::bytes(url_pe()).file_name("sample.exe"));
    let resp = post_form(&server, form).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["label"], 1);

    let form = Form::new().part("file", Part::bytes(benign_pe()).file_name("hello.exe"));
    let body: serde_json::Value = post_form(&server, form).await.json().await.unwrap();
    assert_eq!(body["label"], 0);
}

#[tokio::test]
async fn test_predict_missing_file_returns_400() {
    let server = spawn_test_server().await;

    let form = Form::new().text("note", "no upload here");
    let resp = post_form(&server, form).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "missing file");
}

#[tokio::test]
async fn test_predict_empty_filename_returns_400() {
    let server = spawn_test_server().await;

    let form = Form::new().part("file", Part::bytes(url_pe()).file_name(""));
    let resp = post_form(&server, form).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "empty filename");
}

#[tokio::test]
async fn test_predict_empty_file_returns_400() {
    let server = spawn_test_server().await;

    let form = Form::new().part("file", Part::bytes(Vec::new()).file_name("empty.exe"));
    let resp = post_form(&server, form).await;
    assert_eq!(resp.status(), 400);
}

// ---------------------------------------------------------------------------
// POST /api/v1/scan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_report_fields() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/api/v1/scan"), url_pe()).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["label"], 1);
    assert_eq!(body["verdict"], "malicious");
    assert!(body["probability"].as_f64().unwrap() > 0.9);
    assert_eq!(body["threshold"], 0.5);
    assert_eq!(body["num_features"], 2381);
    assert_eq!(body["size"], 0x400);
    assert_eq!(body["sha256"].as_str().unwrap().len(), 64);
    assert_eq!(body["model_hash"], server.state.model_hash.as_str());
    assert!(body.get("fallback").is_none());
}

#[tokio::test]
async fn test_scan_report_marks_fallback() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/api/v1/scan"), vec![0u8; 1024]).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["label"], 0);
    assert_eq!(body["fallback"], "parse_error");
    assert!(body.get("probability").is_none());
}

#[tokio::test]
async fn test_auth_required_returns_401_without_token() {
    let server = spawn_test_server_with(|c| c.api_key = Some("test-key".to_string())).await;
    let client = reqwest::Client::new();

    let resp = post_raw(&client, &server.url("/api/v1/scan"), url_pe()).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Missing Authorization header"));

    let resp = client
        .post(server.url("/api/v1/scan"))
        .header("Authorization", "Bearer wrong-key")
        .body(url_pe())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_auth_correct_token_returns_200() {
    let server = spawn_test_server_with(|c| c.api_key = Some("test-key".to_string())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/v1/scan"))
        .header("Authorization", "Bearer test-key")
        .body(url_pe())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_raw_endpoint_open_when_api_key_set() {
    let server = spawn_test_server_with(|c| c.api_key = Some("test-key".to_string())).await;
    let client = reqwest::Client::new();
    assert_eq!(raw_label(&client, &server, url_pe()).await, 1);
}

// ---------------------------------------------------------------------------
// Health, stats, rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint() {
    let server = spawn_test_server().await;

    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["model_hash"].as_str().unwrap().starts_with("sha256:"));
    assert!(body["version"].as_str().is_some());
    assert_eq!(body["num_features"], 2381);
    assert_eq!(body["failure_policy"], "benign");
}

#[tokio::test]
async fn test_stats_endpoint_counts_requests() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    raw_label(&client, &server, url_pe()).await;
    raw_label(&client, &server, benign_pe()).await;
    raw_label(&client, &server, vec![0u8; 1024]).await;
    post_raw(&client, &server.url("/"), Vec::new()).await;

    let resp = reqwest::get(server.url("/stats")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["requests"]["total"], 4);
    assert_eq!(body["requests"]["errors"], 1);
    assert_eq!(body["verdicts"]["malicious"], 1);
    assert_eq!(body["verdicts"]["benign"], 2);
    assert_eq!(body["verdicts"]["fallbacks"], 1);
    assert_eq!(body["endpoints"]["raw"], 4);
    assert_eq!(body["endpoints"]["stats"], 1);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let server = spawn_test_server_with(|c| c.rate_limit_rpm = 2).await;

    for _ in 0..2 {
        let resp = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Rate limit exceeded"));
}
