//! Router wiring and process-level server startup.
//!
//! Grounded on `server.rs::app`/`serve`: a permissive `CorsLayer`, a plain
//! `tokio::net::TcpListener` bind, and the `#[tokio::test] health_ok` style
//! of spinning up a real listener for integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::config::GatewayConfig;
use crate::logger::LogRecorder;
use crate::orchestrator::{IncomingRequest, Orchestrator};
use crate::preset::ChatMessage;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub upstream: Arc<UpstreamClient>,
    pub log_recorder: LogRecorder,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_models() -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [
            { "id": "gemini-pro", "object": "model" },
            { "id": "gemini-1.5-flash", "object": "model" },
        ],
    }))
}

#[derive(Deserialize)]
struct RawMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RawMessage>,
    #[serde(default)]
    stream: bool,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<i64>,
    stop: Option<Vec<String>>,
}

fn extract_tenant_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query.get("key").cloned()
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(payload): Json<ChatCompletionRequest>,
) -> Response {
    let Some(tenant_key) = extract_tenant_key(&headers, &query) else {
        return crate::orchestrator::OrchestratorError::AuthMissing.into_response();
    };

    let messages: Vec<ChatMessage> = payload
        .messages
        .into_iter()
        .map(|m| ChatMessage::new(m.role, m.content))
        .collect();

    let incoming = IncomingRequest {
        tenant_key,
        model: payload.model,
        messages,
        stream: payload.stream,
        temperature: payload.temperature,
        top_p: payload.top_p,
        max_tokens: payload.max_tokens,
        stop: payload.stop,
    };

    let orchestrator = Orchestrator {
        db_path: &state.config.db_path,
        upstream: &state.upstream,
        default_max_attempts: state.config.default_max_attempts,
        attempt_timeout: state.config.default_attempt_timeout,
        request_timeout: state.config.default_request_timeout,
        log_recorder: &state.log_recorder,
        rng_seed: state.config.rng_seed,
    };

    orchestrator.handle(incoming).await
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: GatewayConfig) -> std::io::Result<()> {
    store_ready(&config)?;
    let log_recorder = LogRecorder::spawn(config.db_path.clone());
    let upstream = UpstreamClient::new(config.upstream_base_url.clone(), config.default_request_timeout)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let state = AppState {
        config: Arc::new(config.clone()),
        upstream: Arc::new(upstream),
        log_recorder,
    };

    let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay gateway listening");
    axum::serve(listener, app(state)).await
}

fn store_ready(config: &GatewayConfig) -> std::io::Result<()> {
    let conn = crate::store::open_conn(&config.db_path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    crate::store::init(&conn).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{post as mock_post};
    use rusqlite::Connection;
    use std::time::Duration;

    fn test_config(db_path: &str, upstream_base: &str) -> GatewayConfig {
        GatewayConfig {
            upstream_base_url: upstream_base.to_string(),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            db_path: db_path.to_string(),
            default_max_attempts: 3,
            default_attempt_timeout: Duration::from_secs(5),
            default_request_timeout: Duration::from_secs(5),
            rng_seed: Some(1),
        }
    }

    // Credential ids must be unique across the whole test binary: `pool::POOL`
    // is process-global and keyed only by credential id, matching a single
    // shared database in production where ids really are unique. Each test
    // below passes a distinct `id_base` so concurrent tests don't fight over
    // the same pool-state entry.
    fn seed_tenant_with_credentials(db_path: &str, id_base: i64, scores: &[i64]) -> String {
        let conn = Connection::open(db_path).unwrap();
        crate::store::init(&conn).unwrap();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at) VALUES (1, 'acme', '2026-01-01')",
            [],
        )
        .unwrap();
        let raw_key = "test-tenant-key";
        let mut hasher = sha2::Sha256::new();
        use sha2::Digest;
        hasher.update(raw_key.as_bytes());
        let key_hash = format!("{:x}", hasher.finalize());
        conn.execute(
            "INSERT INTO tenant_keys (id, account_id, key_hash, enabled, created_at)
             VALUES (1, 1, ?1, 1, '2026-01-01')",
            [&key_hash],
        )
        .unwrap();
        for (idx, score) in scores.iter().enumerate() {
            conn.execute(
                "INSERT INTO upstream_credentials (id, account_id, label, secret, enabled, score, created_at)
                 VALUES (?1, 1, ?2, ?3, 1, ?4, '2026-01-01')",
                rusqlite::params![id_base + idx as i64, format!("cred-{idx}"), format!("secret-{idx}"), score],
            )
            .unwrap();
        }
        raw_key.to_string()
    }

    async fn start_app(config: GatewayConfig) -> (String, tokio::task::JoinHandle<()>) {
        store_ready(&config).unwrap();
        let log_recorder = LogRecorder::spawn(config.db_path.clone());
        let upstream =
            UpstreamClient::new(config.upstream_base_url.clone(), config.default_request_timeout).unwrap();
        let state = AppState {
            config: Arc::new(config),
            upstream: Arc::new(upstream),
            log_recorder,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    async fn start_mock_upstream(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    fn temp_db(label: &str) -> String {
        std::env::temp_dir()
            .join(format!("relay_gateway_server_test_{}_{}.db", label, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn health_ok() {
        let db_path = temp_db("health");
        let config = test_config(&db_path, "http://127.0.0.1:1");
        let (base, _handle) = start_app(config).await;
        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn happy_buffered_scenario() {
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(|| async {
                Json(json!({
                    "candidates": [{ "content": { "parts": [{ "text": "Hi there" }] } }],
                    "usageMetadata": { "promptTokenCount": 6, "candidatesTokenCount": 2 },
                }))
            }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("happy");
        seed_tenant_with_credentials(&db_path, 1001, &[100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(body["usage"]["prompt_tokens"], 6);
        assert_eq!(body["usage"]["completion_tokens"], 2);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn missing_tenant_key_is_rejected() {
        let db_path = temp_db("missing_key");
        let config = test_config(&db_path, "http://127.0.0.1:1");
        let (base, _handle) = start_app(config).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        // §7/§8: an auth reject still writes exactly one log entry.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let conn = Connection::open(&db_path).unwrap();
        let (count, status_code): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(status_code) FROM logs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(status_code, 401);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_tenant_key_is_rejected_with_one_log_entry() {
        let db_path = temp_db("unknown_key");
        let config = test_config(&db_path, "http://127.0.0.1:1");
        let (base, _handle) = start_app(config).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("no-such-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn preset_fault_is_rejected_with_one_log_entry() {
        // A tenant key bound to a preset id that doesn't exist (e.g. the
        // preset was deleted out from under it) must still log exactly once
        // rather than silently dropping the audit trail.
        let db_path = temp_db("preset_fault");
        let config = test_config(&db_path, "http://127.0.0.1:1");
        store_ready(&config).unwrap();
        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at) VALUES (1, 'acme', '2026-01-01')",
            [],
        )
        .unwrap();
        let raw_key = "preset-fault-key";
        let mut hasher = sha2::Sha256::new();
        use sha2::Digest;
        hasher.update(raw_key.as_bytes());
        let key_hash = format!("{:x}", hasher.finalize());
        conn.execute(
            "INSERT INTO tenant_keys (id, account_id, key_hash, preset_id, enabled, created_at)
             VALUES (1, 1, ?1, 999, 1, '2026-01-01')",
            [&key_hash],
        )
        .unwrap();
        drop(conn);

        let (base, _handle) = start_app(config).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth(raw_key)
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn exhaustion_scenario_returns_bad_gateway() {
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("exhaustion");
        seed_tenant_with_credentials(&db_path, 2001, &[100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn fatal_disable_scenario_stops_using_credential() {
        // Scenario 5: a 403 disables the credential and the orchestrator
        // still tries any remaining credentials, surfacing 502 only once
        // every credential has been exhausted -- a 401/403 is not passed
        // through to the client the way a genuinely permanent 400 is.
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(|| async { (axum::http::StatusCode::FORBIDDEN, "no") }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("fatal_disable");
        seed_tenant_with_credentials(&db_path, 3001, &[100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);

        let conn = Connection::open(&db_path).unwrap();
        let enabled: i64 = conn
            .query_row("SELECT enabled FROM upstream_credentials WHERE id = 3001", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 0);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn permanent_invalid_request_scenario_passes_through_400_without_retry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        let call_count = StdArc::new(AtomicUsize::new(0));
        let counter_for_handler = call_count.clone();
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(move || {
                let counter = counter_for_handler.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        axum::http::StatusCode::BAD_REQUEST,
                        Json(json!({ "error": { "status": "INVALID_ARGUMENT", "message": "bad request" } })),
                    )
                }
            }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("permanent_invalid");
        seed_tenant_with_credentials(&db_path, 3101, &[100, 100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        // no retry on a second credential: exactly one upstream call was made.
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn rate_limit_failover_scenario_succeeds_on_second_credential() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        let call_count = StdArc::new(AtomicUsize::new(0));
        let counter_for_handler = call_count.clone();
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(move || {
                let counter = counter_for_handler.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
                    } else {
                        Json(json!({
                            "candidates": [{ "content": { "parts": [{ "text": "second try" }] } }],
                            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2 },
                        }))
                        .into_response()
                    }
                }
            }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("rate_limit_failover");
        seed_tenant_with_credentials(&db_path, 4001, &[50, 100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "second try");
        assert!(call_count.load(Ordering::SeqCst) >= 2);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn streaming_scenario_relays_deltas_and_terminates_with_done() {
        let mock = Router::new().route(
            "/v1beta/models/*rest",
            mock_post(|| async {
                let body = concat!(
                    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"fo\"}]}}]}\n\n",
                    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"o b\"}]}}]}\n\n",
                    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"az\"}]}}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":3}}\n\n",
                );
                (
                    [("content-type", "text/event-stream")],
                    body,
                )
            }),
        );
        let (mock_base, _mock_handle) = start_mock_upstream(mock).await;

        let db_path = temp_db("streaming");
        seed_tenant_with_credentials(&db_path, 5001, &[100]);
        let config = test_config(&db_path, &mock_base);
        let (base, _handle) = start_app(config).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("test-tenant-key")
            .json(&json!({ "model": "gemini-pro", "stream": true, "messages": [{"role":"user","content":"Hi"}] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let text = resp.text().await.unwrap();
        assert!(text.contains("\"content\":\"fo\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
        let _ = std::fs::remove_file(&db_path);
    }
}
