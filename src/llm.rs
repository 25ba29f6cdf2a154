//! Chat-completion client for OpenAI-compatible endpoints.
//!
//! Blocking and streaming calls, both with internal exponential-backoff
//! retry on transient failures only. Streaming honours a cancellation token
//! between chunks; a cancelled call resolves promptly with a transient-style
//! error so callers can tell it apart from a permanent failure.

use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CortexError;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: usize = 2;
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Re-exported predicate for callers layering their own retry policy on top
/// of the client's internal one.
pub fn is_transient(err: &CortexError) -> bool {
    err.is_transient()
}

#[derive(Clone)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub max_retries: usize,
    pub timeout_ms: u64,
    pub client: reqwest::Client,
}

impl LlmConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let timeout_ms = DEFAULT_TIMEOUT_MS;
        Self {
            enabled: true,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms,
            client: build_client(timeout_ms),
        }
    }

    /// Inert config: every extractor operation short-circuits to its safe
    /// default without touching the network.
    pub fn off() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            model: String::new(),
            api_key: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            client: build_client(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Reads `CORTEX_LLM_URL`, `CORTEX_LLM_KEY`, `CORTEX_LLM_MODEL`,
    /// `CORTEX_LLM_RETRIES`, `CORTEX_LLM_TIMEOUT_MS`. Without the URL the
    /// client is disabled.
    pub fn from_env() -> Self {
        let Ok(endpoint) = std::env::var("CORTEX_LLM_URL") else {
            return Self::off();
        };
        let mut cfg = Self::new(
            endpoint,
            std::env::var("CORTEX_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            std::env::var("CORTEX_LLM_KEY").unwrap_or_default(),
        );
        if let Some(n) = std::env::var("CORTEX_LLM_RETRIES").ok().and_then(|v| v.parse().ok()) {
            cfg.max_retries = n;
        }
        if let Some(ms) = std::env::var("CORTEX_LLM_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()) {
            cfg.timeout_ms = ms;
            cfg.client = build_client(ms);
        }
        cfg
    }
}

fn build_client(timeout_ms: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .expect("failed to build HTTP client")
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_transport(e: reqwest::Error) -> CortexError {
    if e.is_decode() {
        CortexError::LlmPermanent(format!("response parse failed: {e}"))
    } else {
        // timeouts, connect failures, resets: all worth a retry
        CortexError::LlmTransient(e.to_string())
    }
}

async fn classify_status(resp: reqwest::Response) -> CortexError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        CortexError::LlmTransient(format!("LLM returned {status}: {body}"))
    } else {
        CortexError::LlmPermanent(format!("LLM returned {status}: {body}"))
    }
}

// ---------------------------------------------------------------------------
// Blocking chat
// ---------------------------------------------------------------------------

/// Send a chat completion, return the response text. Retries transient
/// failures up to `max_retries` times with exponential backoff.
///
/// The system prompt and the user text travel as separate messages; user
/// content is never spliced into system instructions.
pub async fn chat(cfg: &LlmConfig, system: &str, user: &str) -> Result<String, CortexError> {
    if !cfg.enabled {
        return Err(CortexError::LlmNotConfigured);
    }
    (|| chat_once(cfg, system, user))
        .retry(ExponentialBuilder::default().with_max_times(cfg.max_retries))
        .when(|e: &CortexError| e.is_transient())
        .notify(|err, dur| warn!(error = %err, retry_after = ?dur, "chat failed, retrying"))
        .await
}

async fn chat_once(cfg: &LlmConfig, system: &str, user: &str) -> Result<String, CortexError> {
    let req = ChatRequest {
        model: cfg.model.clone(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        temperature: 0.1,
        stream: None,
    };

    let mut builder = cfg.client.post(&cfg.endpoint).json(&req);
    if !cfg.api_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.api_key));
    }

    let resp = builder.send().await.map_err(classify_transport)?;
    if !resp.status().is_success() {
        return Err(classify_status(resp).await);
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| CortexError::LlmPermanent(format!("response parse failed: {e}")))?;
    Ok(chat
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Streaming chat
// ---------------------------------------------------------------------------

/// Like [`chat`] but consumes the response as an SSE stream, checking the
/// cancellation token between chunks. Cancellation yields a transient error
/// immediately; the retry loop does not re-dispatch a cancelled call.
pub async fn chat_stream(
    cfg: &LlmConfig,
    system: &str,
    user: &str,
    cancel: &CancellationToken,
) -> Result<String, CortexError> {
    if !cfg.enabled {
        return Err(CortexError::LlmNotConfigured);
    }
    (|| chat_stream_once(cfg, system, user, cancel))
        .retry(ExponentialBuilder::default().with_max_times(cfg.max_retries))
        .when(|e: &CortexError| e.is_transient() && !cancel.is_cancelled())
        .notify(|err, dur| warn!(error = %err, retry_after = ?dur, "chat stream failed, retrying"))
        .await
}

async fn chat_stream_once(
    cfg: &LlmConfig,
    system: &str,
    user: &str,
    cancel: &CancellationToken,
) -> Result<String, CortexError> {
    if cancel.is_cancelled() {
        return Err(CortexError::LlmTransient("call cancelled".into()));
    }

    let req = ChatRequest {
        model: cfg.model.clone(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        temperature: 0.1,
        stream: Some(true),
    };

    let mut builder = cfg.client.post(&cfg.endpoint).json(&req);
    if !cfg.api_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.api_key));
    }

    let resp = builder.send().await.map_err(classify_transport)?;
    if !resp.status().is_success() {
        return Err(classify_status(resp).await);
    }

    let mut raw: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CortexError::LlmTransient("stream cancelled".into()));
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => raw.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(classify_transport(e)),
                None => break,
            }
        }
    }

    let text = assemble_stream(&raw);
    if text.is_empty() {
        return Err(CortexError::LlmPermanent("empty streamed response".into()));
    }
    Ok(text)
}

/// Reassemble the full completion text from an SSE byte buffer.
/// Scans every `data:` line; also accepts a plain JSON body so endpoints
/// that ignore `stream: true` still work.
pub fn assemble_stream(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);

    let mut assembled = String::new();
    let mut saw_data = false;
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        saw_data = true;
        if data == "[DONE]" {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(delta) = v.pointer("/choices/0/delta/content").and_then(|c| c.as_str()) {
                assembled.push_str(delta);
            }
        }
    }
    if saw_data {
        return assembled;
    }

    // Non-streaming JSON response
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
        if let Some(content) = v.pointer("/choices/0/message/content").and_then(|c| c.as_str()) {
            return content.to_string();
        }
    }
    String::new()
}
