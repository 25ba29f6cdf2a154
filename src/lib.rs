pub mod api;
pub mod background;
pub mod error;
pub mod extract;
pub mod gate;
pub mod llm;
pub mod prompts;
pub mod sleep;
pub mod store;
pub mod thresholds;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type SharedStore = Arc<store::GraphStore>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous GraphStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::CortexError>
where
    F: FnOnce(&store::GraphStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::CortexError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub llm: llm::LlmConfig,
    pub api_key: Option<String>,
    pub started_at: std::time::Instant,
    /// Root abort signal: cancelled on shutdown, propagated into every
    /// sleep cycle and background extraction task.
    pub cancel: CancellationToken,
}
