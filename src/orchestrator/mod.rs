//! The Auth -> Expand -> Dispatch(n) -> Relay -> Log state machine.
//!
//! Grounded on `forward/mod.rs::handle_request_with_fallback`'s retry loop,
//! generalized from "retry across configured models" to "retry across
//! leased credentials" and expressed as an explicit state enum rather than
//! the teacher's single function, since each state here has its own
//! specified entry/exit behavior.

pub mod error;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};

use crate::logger::{LogFinalizer, LogRecorder};
use crate::pool::{self, FatalKind, Outcome};
use crate::preset::{self, ChatMessage};
use crate::regexpipe;
use crate::store::{self, LogEntry, RegexPhase, UpstreamCredential};
use crate::upstream::{ChatParams, StreamEvent, TokenUsage, UpstreamClient, UpstreamFailure};

pub use error::{OrchestratorError, OrchestratorResult};

pub struct IncomingRequest {
    pub tenant_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
    pub stop: Option<Vec<String>>,
}

pub struct Orchestrator<'a> {
    pub db_path: &'a str,
    pub upstream: &'a UpstreamClient,
    pub default_max_attempts: u32,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
    pub log_recorder: &'a LogRecorder,
    /// Fixed seed for `VarEngine`'s PRNG (`GATEWAY_RNG_SEED`), so test
    /// harnesses can reproduce `{{roll}}`/`{{random}}` output bit-exactly
    /// (§4.2). `None` in production, where each request gets real entropy.
    pub rng_seed: Option<u64>,
}

fn hash_tenant_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Builds the single `LogEntry` for a request that terminates before
/// reaching `Relay` (auth/preset/dispatch rejects, deadline, exhaustion).
/// Every such termination path must call this exactly once (§7, §8: "exactly
/// one log entry per inbound request regardless of termination path").
fn reject_log_entry(tenant_key_id: Option<i64>, model: &str, stream: bool, status_code: u16, started: Instant) -> LogEntry {
    LogEntry {
        tenant_key_id,
        model: model.to_string(),
        status_code,
        synthetic_status: "error".to_string(),
        latency_ms: started.elapsed().as_millis() as i64,
        stream,
        created_at: Utc::now().to_rfc3339(),
        ..Default::default()
    }
}

impl<'a> Orchestrator<'a> {
    /// Runs the whole pipeline and returns the HTTP response to send to the
    /// client, whether that is a buffered JSON body or a streaming SSE body.
    pub async fn handle(&self, req: IncomingRequest) -> Response {
        match self.run(req).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn run(&self, req: IncomingRequest) -> OrchestratorResult<Response> {
        let started = Instant::now();
        let conn = store::open_conn(self.db_path).map_err(|e| {
            self.log_recorder
                .record(reject_log_entry(None, &req.model, req.stream, 500, started));
            OrchestratorError::Internal(e.to_string())
        })?;

        // -- Auth --
        let key_hash = hash_tenant_key(&req.tenant_key);
        let found = store::find_tenant_key_by_hash(&conn, &key_hash).map_err(|e| {
            self.log_recorder
                .record(reject_log_entry(None, &req.model, req.stream, 500, started));
            OrchestratorError::Internal(e.to_string())
        })?;
        let tenant_key = match found {
            Some(tk) if tk.enabled => tk,
            Some(tk) => {
                self.log_recorder
                    .record(reject_log_entry(Some(tk.id), &req.model, req.stream, 401, started));
                return Err(OrchestratorError::AuthInvalid);
            }
            None => {
                self.log_recorder
                    .record(reject_log_entry(None, &req.model, req.stream, 401, started));
                return Err(OrchestratorError::AuthInvalid);
            }
        };

        // -- Expand --
        let preset = match tenant_key.preset_id {
            Some(preset_id) => {
                let preset = store::find_preset(&conn, preset_id)
                    .map_err(|e| OrchestratorError::PresetFault(e.to_string()))
                    .and_then(|opt| {
                        opt.ok_or_else(|| OrchestratorError::PresetFault("preset not found".to_string()))
                    })
                    .map_err(|e| {
                        self.log_recorder
                            .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 500, started));
                        e
                    })?;
                let items = store::preset_items(&conn, preset_id)
                    .map_err(|e| OrchestratorError::PresetFault(e.to_string()))
                    .map_err(|e| {
                        self.log_recorder
                            .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 500, started));
                        e
                    })?;
                Some((preset, items))
            }
            None => None,
        };

        let mut scope = crate::vars::VarScope::from_seed_override(self.rng_seed);
        let expanded = preset::expand(
            preset.as_ref().map(|(p, items)| (p, items.as_slice())),
            &req.messages,
            &mut scope,
        );

        let pre_rules = store::regex_rules_for_phase(
            &conn,
            tenant_key.account_id,
            tenant_key.preset_id,
            RegexPhase::Pre,
            tenant_key.apply_regex,
        )
        .map_err(|e| OrchestratorError::PresetFault(e.to_string()))
        .map_err(|e| {
            self.log_recorder
                .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 500, started));
            e
        })?;
        let rewritten: Vec<ChatMessage> = expanded
            .into_iter()
            .map(|m| ChatMessage::new(m.role, regexpipe::apply(&pre_rules, &m.content)))
            .collect();

        let post_rules = store::regex_rules_for_phase(
            &conn,
            tenant_key.account_id,
            tenant_key.preset_id,
            RegexPhase::Post,
            tenant_key.apply_regex,
        )
        .map_err(|e| OrchestratorError::PresetFault(e.to_string()))
        .map_err(|e| {
            self.log_recorder
                .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 500, started));
            e
        })?;

        // -- Dispatch --
        let credentials = store::enabled_credentials_for_account(&conn, tenant_key.account_id).map_err(|e| {
            self.log_recorder
                .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 500, started));
            OrchestratorError::Internal(e.to_string())
        })?;
        let max_attempts = self.default_max_attempts.min(credentials.len().max(1) as u32);

        let params = ChatParams {
            model: &req.model,
            messages: &rewritten,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stop: req.stop.as_deref(),
        };

        let mut excluded = HashSet::new();
        let mut last_error = "no credentials available".to_string();

        for _attempt in 0..max_attempts {
            if started.elapsed() >= self.request_timeout {
                self.log_recorder
                    .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 504, started));
                return Err(OrchestratorError::DeadlineExceeded);
            }

            let Some(credential) = pool::lease(&pool::POOL, &credentials, &excluded).await else {
                break;
            };
            excluded.insert(credential.id);

            if req.stream {
                match self.call_with_deadline(self.upstream.generate_stream(&credential.secret, &params)).await {
                    Ok(events) => {
                        // Settlement is deferred to the stream's own lifetime: a
                        // successful HTTP handshake is not the same as a
                        // successful generation, and cancellation needs to know
                        // whether any delta actually arrived before settling.
                        return Ok(self.relay_stream(
                            events,
                            post_rules,
                            &req.model,
                            tenant_key.id,
                            started,
                            credential,
                            self.db_path.to_string(),
                        ));
                    }
                    Err(failure) => {
                        let (outcome, decision, message) = classify(failure);
                        pool::settle(&pool::POOL, &conn, &credential, outcome).await.ok();
                        match decision {
                            DispatchDecision::StopPermanentInvalid => {
                                self.log_recorder.record(reject_log_entry(
                                    Some(tenant_key.id),
                                    &req.model,
                                    req.stream,
                                    400,
                                    started,
                                ));
                                return Err(OrchestratorError::UpstreamPermanent(message));
                            }
                            DispatchDecision::Retry => {
                                last_error = message;
                                continue;
                            }
                        }
                    }
                }
            } else {
                match self.call_with_deadline(self.upstream.generate(&credential.secret, &params)).await {
                    Ok(reply) => {
                        pool::settle(
                            &pool::POOL,
                            &conn,
                            &credential,
                            Outcome::Ok {
                                tokens_in: reply.usage.prompt_tokens,
                                tokens_out: reply.usage.completion_tokens,
                            },
                        )
                        .await
                        .ok();
                        let content = regexpipe::apply(&post_rules, &reply.content);
                        let entry = LogEntry {
                            tenant_key_id: Some(tenant_key.id),
                            model: req.model.clone(),
                            status_code: 200,
                            synthetic_status: "ok".to_string(),
                            latency_ms: started.elapsed().as_millis() as i64,
                            stream: false,
                            prompt_tokens: Some(reply.usage.prompt_tokens),
                            completion_tokens: Some(reply.usage.completion_tokens),
                            total_tokens: Some(reply.usage.total()),
                            tokens_estimated: reply.usage.tokens_estimated,
                            created_at: Utc::now().to_rfc3339(),
                            ..Default::default()
                        };
                        self.log_recorder.record(entry);
                        return Ok(buffered_response(&req.model, &content, &reply.usage));
                    }
                    Err(failure) => {
                        let (outcome, decision, message) = classify(failure);
                        pool::settle(&pool::POOL, &conn, &credential, outcome).await.ok();
                        match decision {
                            DispatchDecision::StopPermanentInvalid => {
                                self.log_recorder.record(reject_log_entry(
                                    Some(tenant_key.id),
                                    &req.model,
                                    req.stream,
                                    400,
                                    started,
                                ));
                                return Err(OrchestratorError::UpstreamPermanent(message));
                            }
                            DispatchDecision::Retry => {
                                last_error = message;
                                continue;
                            }
                        }
                    }
                }
            }
        }

        self.log_recorder
            .record(reject_log_entry(Some(tenant_key.id), &req.model, req.stream, 502, started));
        Err(OrchestratorError::UpstreamExhausted(last_error))
    }

    /// Caps a single upstream call at `attempt_timeout` (§4.6: "a per-attempt
    /// deadline ... caps one upstream call"). A timed-out attempt is treated
    /// the same as any other transport failure: the credential is penalized
    /// and the next one is tried, rather than failing the whole request.
    async fn call_with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, UpstreamFailure>>,
    ) -> Result<T, UpstreamFailure> {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamFailure::Retryable(pool::RetryableKind::Transport)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn relay_stream(
        &self,
        events: impl futures_util::Stream<Item = Result<StreamEvent, UpstreamFailure>> + Send + 'static,
        post_rules: Vec<store::RegexRule>,
        model: &str,
        tenant_key_id: i64,
        started: Instant,
        credential: UpstreamCredential,
        db_path: String,
    ) -> Response {
        let model = model.to_string();
        let entry = LogEntry {
            tenant_key_id: Some(tenant_key_id),
            model: model.clone(),
            status_code: 200,
            synthetic_status: "ok".to_string(),
            stream: true,
            created_at: Utc::now().to_rfc3339(),
            ..Default::default()
        };
        let finalizer = LogFinalizer::new(self.log_recorder.clone(), entry);
        let finalizer_for_tail = finalizer.clone();
        let settler = CredentialSettler::new(credential, db_path);
        let settler_for_tail = settler.clone();

        let model_for_chunks = model.clone();
        let body_stream = events
            .filter_map(move |event| {
                let post_rules = post_rules.clone();
                let model = model_for_chunks.clone();
                let finalizer = finalizer.clone();
                let settler = settler.clone();
                let started = started;
                async move {
                    match event {
                        Ok(StreamEvent::Text(text)) => {
                            settler.mark_delta();
                            let rewritten = regexpipe::apply(&post_rules, &text);
                            let elapsed_ms = started.elapsed().as_millis() as i64;
                            finalizer.update(|e| {
                                // TTFT is the elapsed time at the *first* delta only
                                // (§3/§8: "TTFT <= total latency"); latency_ms keeps
                                // tracking the running total through to the last one.
                                if e.ttft_ms.is_none() {
                                    e.ttft_ms = Some(elapsed_ms);
                                }
                                e.latency_ms = elapsed_ms;
                            });
                            Some(Ok::<_, std::io::Error>(sse_chunk(&model, &rewritten)))
                        }
                        Ok(StreamEvent::Usage(usage)) => {
                            settler.set_usage(usage);
                            finalizer.update(|e| {
                                e.prompt_tokens = Some(usage.prompt_tokens);
                                e.completion_tokens = Some(usage.completion_tokens);
                                e.total_tokens = Some(usage.total());
                                e.tokens_estimated = usage.tokens_estimated;
                            });
                            None
                        }
                        Err(_) => {
                            finalizer.update(|e| {
                                e.status_code = 502;
                                e.synthetic_status = "error".to_string();
                            });
                            None
                        }
                    }
                }
            })
            .chain(futures_util::stream::once(async move {
                finalizer_for_tail.log_once();
                settler_for_tail.settle_once();
                Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"data: [DONE]\n\n"))
            }));

        Response::builder()
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|_| OrchestratorError::Internal("failed to build stream response".to_string()).into_response())
    }
}

/// Settles the leased credential exactly once, whether the stream finishes
/// normally (the `[DONE]` tail explicitly calls [`Self::settle_once`]) or the
/// client disconnects mid-stream (every clone captured by the response body
/// drops, and [`Drop`] settles from whatever partial state was observed).
/// Mirrors [`LogFinalizer`]'s guard shape for the same reason: a `Clone` +
/// `Drop` pair sharing an `Arc<AtomicBool>` is the only way to guarantee
/// exactly-once bookkeeping across both the happy path and cancellation.
#[derive(Clone)]
struct CredentialSettler {
    done: Arc<AtomicBool>,
    delta_seen: Arc<AtomicBool>,
    usage: Arc<std::sync::Mutex<Option<TokenUsage>>>,
    credential: UpstreamCredential,
    db_path: String,
}

impl CredentialSettler {
    fn new(credential: UpstreamCredential, db_path: String) -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            delta_seen: Arc::new(AtomicBool::new(false)),
            usage: Arc::new(std::sync::Mutex::new(None)),
            credential,
            db_path,
        }
    }

    fn mark_delta(&self) {
        self.delta_seen.store(true, Ordering::Relaxed);
    }

    fn set_usage(&self, usage: TokenUsage) {
        if let Ok(mut slot) = self.usage.lock() {
            *slot = Some(usage);
        }
    }

    fn settle_once(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let outcome = if self.delta_seen.load(Ordering::Relaxed) {
            let usage = self.usage.lock().ok().and_then(|g| *g).unwrap_or_default();
            Outcome::Ok {
                tokens_in: usage.prompt_tokens,
                tokens_out: usage.completion_tokens,
            }
        } else {
            Outcome::Retryable(crate::pool::RetryableKind::Transport)
        };
        let credential = self.credential.clone();
        let db_path = self.db_path.clone();
        tokio::spawn(async move {
            match store::open_conn(&db_path) {
                Ok(conn) => {
                    if let Err(err) = pool::settle(&pool::POOL, &conn, &credential, outcome).await {
                        tracing::warn!(error = %err, "failed to settle credential after stream end");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to open store to settle credential");
                }
            }
        });
    }
}

impl Drop for CredentialSettler {
    fn drop(&mut self) {
        self.settle_once();
    }
}

fn sse_chunk(model: &str, delta_content: &str) -> bytes::Bytes {
    let payload = serde_json::json!({
        "id": "chatcmpl-relay",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": { "content": delta_content }, "finish_reason": serde_json::Value::Null }],
    });
    bytes::Bytes::from(format!("data: {}\n\n", payload))
}

fn buffered_response(model: &str, content: &str, usage: &crate::upstream::TokenUsage) -> Response {
    let body = serde_json::json!({
        "id": "chatcmpl-relay",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        },
    });
    axum::Json(body).into_response()
}

enum DispatchDecision {
    /// Settle and try the next credential, if the attempt budget allows.
    Retry,
    /// The request itself is permanently invalid; stop immediately and pass
    /// the upstream's rejection through to the client rather than trying
    /// other credentials, which cannot change the outcome.
    StopPermanentInvalid,
}

/// Every fatal kind still disables the credential (§4.5), but only
/// `permanently_invalid` stops the dispatch loop outright — `unauthorized`
/// and `forbidden` disable the offending credential and fall through to try
/// whatever other credentials remain, exactly like a retryable failure.
fn classify(failure: UpstreamFailure) -> (Outcome, DispatchDecision, String) {
    match failure {
        UpstreamFailure::Retryable(kind) => {
            (Outcome::Retryable(kind), DispatchDecision::Retry, format!("{:?}", kind))
        }
        UpstreamFailure::Fatal(FatalKind::PermanentInvalid) => (
            Outcome::Fatal(FatalKind::PermanentInvalid),
            DispatchDecision::StopPermanentInvalid,
            "request rejected as permanently invalid by upstream".to_string(),
        ),
        UpstreamFailure::Fatal(kind) => {
            (Outcome::Fatal(kind), DispatchDecision::Retry, format!("{:?}", kind))
        }
    }
}
