//! Fire-and-forget per-memory enrichment.
//!
//! Spawned after every gated insert and batch-driven by the sleep cycle's
//! catch-up phase. Never returns an error: every failure path resolves to
//! a status transition plus a log line. Transient failures leave the memory
//! `pending` with its retry counter bumped until the budget runs out.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db_call;
use crate::extract;
use crate::llm::LlmConfig;
use crate::store::ExtractionStatus;
use crate::thresholds::MAX_EXTRACTION_RETRIES;
use crate::SharedStore;

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub success: bool,
    pub memory_id: String,
}

/// Enrich one memory: extract entities, write them atomically, advance the
/// extraction status.
pub async fn run_background_extraction(
    store: &SharedStore,
    cfg: &LlmConfig,
    memory_id: &str,
    text: &str,
    current_retries: i64,
    cancel: &CancellationToken,
) -> ExtractionOutcome {
    let outcome = |success: bool| ExtractionOutcome { success, memory_id: memory_id.to_string() };

    if !cfg.enabled {
        set_status(store, memory_id, ExtractionStatus::Skipped, false).await;
        return outcome(true);
    }

    let (result, transient) = extract::extract_entities(cfg, text, cancel).await;

    let result = match (result, transient) {
        (Some(r), _) => r,
        (None, true) => {
            // Transient: spend one retry. The budget exhausts to `failed`.
            let exhausted = current_retries + 1 >= MAX_EXTRACTION_RETRIES;
            if exhausted {
                warn!(id = %memory_id, retries = current_retries + 1, "extraction retry budget exhausted");
                set_status(store, memory_id, ExtractionStatus::Failed, true).await;
            } else {
                debug!(id = %memory_id, retries = current_retries + 1, "transient extraction failure, will retry");
                set_status(store, memory_id, ExtractionStatus::Pending, true).await;
            }
            return outcome(false);
        }
        (None, false) => {
            set_status(store, memory_id, ExtractionStatus::Failed, false).await;
            return outcome(false);
        }
    };

    if result.is_empty() {
        // Valid answer, nothing to link. The memory is simply atomic.
        set_status(store, memory_id, ExtractionStatus::Complete, false).await;
        return outcome(true);
    }

    let id = memory_id.to_string();
    let write = db_call(store, move |s| {
        s.batch_entity_operations(
            &id,
            &result.entities,
            &result.relationships,
            &result.tags,
            result.category,
        )
    })
    .await
    .and_then(|inner| inner);

    match write {
        Ok(()) => outcome(true),
        Err(e) if e.is_transient() && current_retries + 1 < MAX_EXTRACTION_RETRIES => {
            warn!(id = %memory_id, error = %e, "transient graph write failure, will retry");
            set_status(store, memory_id, ExtractionStatus::Pending, true).await;
            outcome(false)
        }
        Err(e) => {
            // Transient with an exhausted budget still spends the retry;
            // a permanent write failure does not.
            let bump = e.is_transient();
            warn!(id = %memory_id, error = %e, "graph write failed");
            set_status(store, memory_id, ExtractionStatus::Failed, bump).await;
            outcome(false)
        }
    }
}

async fn set_status(store: &SharedStore, memory_id: &str, status: ExtractionStatus, bump: bool) {
    let id = memory_id.to_string();
    let result = db_call(store, move |s| s.update_extraction_status(&id, status, bump)).await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(id = %memory_id, error = %e, "status update failed"),
        Err(e) => warn!(id = %memory_id, error = %e, "status update task failed"),
    }
}
