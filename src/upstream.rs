//! Buffered and streaming HTTP access to the one upstream dialect this
//! gateway speaks: `contents`/`parts` requests, `candidates[...].content.parts[...].text`
//! deltas, and a trailing `usageMetadata` object.
//!
//! The retry/backoff/SSE-draining plumbing (`calculate_retry_delay`,
//! `drain_sse_lines`, `parse_sse_data`, `is_sse_done`) is carried over nearly
//! verbatim from `forward/client.rs`, since it is dialect-agnostic; only the
//! three-provider dispatch around it is gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{header::HeaderMap, Client};
use serde_json::{json, Value};

use crate::pool::{FatalKind, RetryableKind};
use crate::preset::ChatMessage;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub tokens_estimated: bool,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// `ceil(code_point_length / 4)`, used whenever the upstream omits
/// `usageMetadata`.
pub fn estimate_tokens(text: &str) -> i64 {
    let len = text.chars().count() as i64;
    (len + 3) / 4
}

pub struct ChatParams<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
    pub stop: Option<&'a [String]>,
}

fn gemini_role(role: &str) -> &'static str {
    match role {
        "assistant" => "model",
        _ => "user",
    }
}

fn build_body(params: &ChatParams) -> Value {
    let contents: Vec<Value> = params
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": gemini_role(&m.role),
                "parts": [{ "text": m.content }],
            })
        })
        .collect();

    let mut generation_config = serde_json::Map::new();
    if let Some(t) = params.temperature {
        generation_config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = params.top_p {
        generation_config.insert("topP".to_string(), json!(p));
    }
    if let Some(m) = params.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(m));
    }
    if let Some(stop) = params.stop {
        generation_config.insert("stopSequences".to_string(), json!(stop));
    }

    json!({
        "contents": contents,
        "generationConfig": Value::Object(generation_config),
    })
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

pub struct AssistantReply {
    pub content: String,
    pub usage: TokenUsage,
}

pub enum UpstreamFailure {
    Retryable(RetryableKind),
    Fatal(FatalKind),
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str, credential_secret: &str) -> String {
        let base = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let separator = if base.contains('?') { "&" } else { "?" };
        format!("{}{}key={}", base, separator, credential_secret)
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers
    }

    /// Buffered request/response cycle against `:generateContent`.
    pub async fn generate(
        &self,
        credential_secret: &str,
        params: &ChatParams<'_>,
    ) -> Result<AssistantReply, UpstreamFailure> {
        let path = format!("/v1beta/models/{}:generateContent", params.model);
        let url = self.url(&path, credential_secret);
        let body = build_body(params);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .headers(Self::headers())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let _latency = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(classify_response(status.as_u16(), &body));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|_| UpstreamFailure::Retryable(RetryableKind::ServerError))?;

        let prompt_text: String = params.messages.iter().map(|m| m.content.as_str()).collect();
        extract_reply(&parsed, &prompt_text).ok_or(UpstreamFailure::Retryable(RetryableKind::ServerError))
    }

    /// Streaming request against `:streamGenerateContent?alt=sse`, returning
    /// a lazy sequence of text deltas. The final `TokenUsage` (estimated if
    /// `usageMetadata` never arrives) is delivered as the stream's last item
    /// via [`StreamEvent::Usage`].
    pub async fn generate_stream(
        &self,
        credential_secret: &str,
        params: &ChatParams<'_>,
    ) -> Result<impl Stream<Item = Result<StreamEvent, UpstreamFailure>>, UpstreamFailure> {
        let path = format!("/v1beta/models/{}:streamGenerateContent?alt=sse", params.model);
        let url = self.url(&path, credential_secret);
        let body = build_body(params);

        let response = self
            .client
            .post(&url)
            .headers(Self::headers())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(classify_response(status.as_u16(), &body));
        }

        let mut buffer: Vec<u8> = Vec::new();
        let byte_stream = response.bytes_stream();

        // Tracks what's been seen across chunks so a synthetic, estimated
        // `Usage` event can be appended once the byte stream is exhausted if
        // the upstream never sent its own `usageMetadata` block.
        let prompt_text: String = params.messages.iter().map(|m| m.content.as_str()).collect();
        let seen = Arc::new(std::sync::Mutex::new(SeenState {
            completion_text: String::new(),
            usage_seen: false,
        }));
        let seen_for_chunks = seen.clone();
        let seen_for_tail = seen.clone();

        let events = byte_stream.flat_map(move |chunk| {
            let lines = match chunk {
                Ok(bytes) => drain_sse_lines(&mut buffer, &bytes),
                Err(e) => {
                    let event = Err(classify_transport_error(e));
                    return futures_util::stream::iter(vec![event]);
                }
            };

            let mut events = Vec::new();
            for line in lines {
                let Some(data) = parse_sse_data(&line) else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || is_sse_done(data) {
                    continue;
                }
                let Ok(json) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(usage) = extract_usage(&json) {
                    if let Ok(mut state) = seen_for_chunks.lock() {
                        state.usage_seen = true;
                    }
                    events.push(Ok(StreamEvent::Usage(usage)));
                }
                if let Some(text) = extract_delta_text(&json) {
                    if let Ok(mut state) = seen_for_chunks.lock() {
                        state.completion_text.push_str(&text);
                    }
                    events.push(Ok(StreamEvent::Text(text)));
                }
            }
            futures_util::stream::iter(events)
        });

        let tail = futures_util::stream::once(async move {
            let state = seen_for_tail.lock().unwrap_or_else(|e| e.into_inner());
            if state.usage_seen {
                None
            } else {
                Some(Ok(StreamEvent::Usage(TokenUsage {
                    prompt_tokens: estimate_tokens(&prompt_text),
                    completion_tokens: estimate_tokens(&state.completion_text),
                    tokens_estimated: true,
                })))
            }
        })
        .filter_map(futures_util::future::ready);

        Ok(events.chain(tail))
    }
}

struct SeenState {
    completion_text: String,
    usage_seen: bool,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    Usage(TokenUsage),
}

fn classify_transport_error(_err: reqwest::Error) -> UpstreamFailure {
    UpstreamFailure::Retryable(RetryableKind::Transport)
}

/// Maps a non-2xx upstream response to a failure kind. Only a 400 that the
/// upstream itself marks as a permanent argument error is treated as
/// non-retryable; every other 4xx is the catch-all "any other non-2xx"
/// retryable case, since retrying on a different credential may still help
/// (e.g. a per-credential quota rejection dressed up as a generic 4xx).
fn classify_response(status: u16, body: &Value) -> UpstreamFailure {
    match status {
        429 => UpstreamFailure::Retryable(RetryableKind::RateLimited),
        500..=599 => UpstreamFailure::Retryable(RetryableKind::ServerError),
        401 => UpstreamFailure::Fatal(FatalKind::Unauthorized),
        403 => UpstreamFailure::Fatal(FatalKind::Forbidden),
        400 if is_permanently_invalid(body) => UpstreamFailure::Fatal(FatalKind::PermanentInvalid),
        _ => UpstreamFailure::Retryable(RetryableKind::ServerError),
    }
}

/// Recognizes the Gemini API's own "this argument can never succeed" error
/// statuses, nested under `error.status` in its JSON error body.
fn is_permanently_invalid(body: &Value) -> bool {
    matches!(
        body.get("error").and_then(|e| e.get("status")).and_then(Value::as_str),
        Some("INVALID_ARGUMENT") | Some("FAILED_PRECONDITION") | Some("OUT_OF_RANGE")
    )
}

fn extract_delta_text(json: &Value) -> Option<String> {
    json.get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?
        .first()?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

fn extract_usage(json: &Value) -> Option<TokenUsage> {
    let metadata = json.get("usageMetadata")?;
    Some(TokenUsage {
        prompt_tokens: metadata.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0),
        completion_tokens: metadata
            .get("candidatesTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        tokens_estimated: false,
    })
}

/// `prompt_text` is the concatenation of every input message's content, used
/// to estimate `prompt_tokens` when the upstream omits `usageMetadata`
/// (SPEC_FULL.md §10.2: estimate prompt and completion tokens independently).
fn extract_reply(json: &Value, prompt_text: &str) -> Option<AssistantReply> {
    let text = extract_delta_text(json)?;
    let usage = extract_usage(json).unwrap_or_else(|| TokenUsage {
        prompt_tokens: estimate_tokens(prompt_text),
        completion_tokens: estimate_tokens(&text),
        tokens_estimated: true,
    });
    Some(AssistantReply { content: text, usage })
}

pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &Bytes) -> Vec<String> {
    buffer.extend_from_slice(chunk);

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}
