use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum CortexError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("content exceeds maximum length")]
    ContentTooLong,

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDimension { expected: usize, got: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("LLM not configured (set CORTEX_LLM_URL)")]
    LlmNotConfigured,

    /// Timeouts, connection resets, HTTP 429/5xx, cancelled streams.
    /// Safe to retry.
    #[error("transient LLM error: {0}")]
    LlmTransient(String),

    /// HTTP 4xx (other than 429), malformed response bodies.
    /// Retrying will not help.
    #[error("permanent LLM error: {0}")]
    LlmPermanent(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CortexError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// LLM timeouts/resets/429/5xx and SQLite busy/locked qualify; everything
    /// else (bad requests, parse failures, constraint violations) does not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LlmTransient(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::LlmNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::LlmTransient(_) | Self::LlmPermanent(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl axum::response::IntoResponse for CortexError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
