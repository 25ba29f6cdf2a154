//! HTTP surface: gated ingest, sleep-cycle trigger, stats, health.

use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::warn;

use crate::background::run_background_extraction;
use crate::error::CortexError;
use crate::sleep::{run_sleep_cycle, SleepCycleOptions, SleepCycleResult};
use crate::store::MemoryInput;
use crate::{db_call, extract, gate, AppState};

/// Auth middleware: checks Bearer token if CORTEX_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, CortexError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || CortexError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/", get(health)).route("/health", get(health));

    let protected = Router::new()
        .route("/memories", post(create_memory))
        .route("/sleep", post(trigger_sleep))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "llm": state.llm.enabled,
    }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, CortexError> {
    let stats = db_call(&state.store, |s| s.stats()).await??;
    Ok(Json(serde_json::to_value(stats).map_err(|e| CortexError::Internal(e.to_string()))?))
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    /// "user" (default) or "assistant"; selects the gate profile.
    #[serde(default)]
    pub role: Option<String>,
    /// Unit-norm embedding of `text`, computed by the caller's provider.
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Gate → rate → insert → spawn enrichment. Gate rejection is a normal
/// response, not an error; insert failures propagate.
async fn create_memory(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, CortexError> {
    let text = req.text.trim().to_string();
    let passed = match req.role.as_deref() {
        Some("assistant") => gate::passes_assistant_gate(&text),
        _ => gate::passes_user_gate(&text),
    };
    if !passed {
        return Ok(Json(IngestResponse { stored: false, id: None, reason: Some("attention gate") }));
    }

    let importance = extract::rate_importance(&state.llm, &text).await;

    let mut input = MemoryInput::new(text.clone(), req.embedding).importance(importance);
    if let Some(agent) = req.agent_id {
        input = input.agent_id(agent);
    }
    if req.pinned.unwrap_or(false) {
        input = input.pinned();
    }
    let memory = db_call(&state.store, move |s| s.insert_memory(input)).await??;

    let store = state.store.clone();
    let llm = state.llm.clone();
    let cancel = state.cancel.child_token();
    let id = memory.id.clone();
    tokio::spawn(async move {
        let outcome = run_background_extraction(&store, &llm, &id, &text, 0, &cancel).await;
        if !outcome.success {
            warn!(id = %outcome.memory_id, "background extraction did not complete");
        }
    });

    Ok(Json(IngestResponse { stored: true, id: Some(memory.id), reason: None }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SleepRequest {
    pub dedup_threshold: Option<f64>,
    pub skip_semantic_dedup: Option<bool>,
    pub skip_promotion: Option<bool>,
    pub llm_concurrency: Option<usize>,
    pub max_semantic_dedup_pairs: Option<usize>,
    pub pareto_percentile: Option<f64>,
    pub retention_threshold: Option<f64>,
    pub base_half_life_days: Option<f64>,
    pub importance_multiplier: Option<f64>,
    pub agent_id: Option<String>,
}

impl SleepRequest {
    pub fn into_options(self) -> SleepCycleOptions {
        let mut opts = SleepCycleOptions::default();
        if let Some(v) = self.dedup_threshold {
            opts.dedup_threshold = v;
        }
        if let Some(v) = self.skip_semantic_dedup {
            opts.skip_semantic_dedup = v;
        }
        if let Some(v) = self.skip_promotion {
            opts.skip_promotion = v;
        }
        if let Some(v) = self.llm_concurrency {
            opts.llm_concurrency = v;
        }
        if let Some(v) = self.max_semantic_dedup_pairs {
            opts.max_semantic_dedup_pairs = v;
        }
        if let Some(v) = self.pareto_percentile {
            opts.pareto_percentile = v;
        }
        if let Some(v) = self.retention_threshold {
            opts.retention_threshold = v;
        }
        if let Some(v) = self.base_half_life_days {
            opts.base_half_life_days = v;
        }
        if let Some(v) = self.importance_multiplier {
            opts.importance_multiplier = v;
        }
        opts.agent_id = self.agent_id;
        opts
    }
}

/// Body is optional: an empty POST runs with defaults, anything else must
/// parse as overrides.
async fn trigger_sleep(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<SleepCycleResult>, CortexError> {
    let req: SleepRequest = if body.is_empty() {
        SleepRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| CortexError::Validation(format!("invalid sleep options: {e}")))?
    };
    let opts = req.into_options();
    let cancel = state.cancel.child_token();
    let result = run_sleep_cycle(&state.store, &state.llm, &opts, None, &cancel).await;
    Ok(Json(result))
}
