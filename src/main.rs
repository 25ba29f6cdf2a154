//! cortex: graph-backed long-term memory for AI assistants.
//! Attention-gated ingest, LLM enrichment, and a scheduled sleep cycle
//! that keeps the store bounded and high-signal.

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cortex::llm::LlmConfig;
use cortex::sleep::{run_sleep_cycle, SleepCycleOptions};
use cortex::store::GraphStore;
use cortex::{api, AppState, SharedStore};

#[derive(Parser)]
#[command(name = "cortex", version, about = "Memory consolidation engine for AI assistants")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "4170", env = "CORTEX_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "cortex.db", env = "CORTEX_DB")]
    db: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let store: SharedStore = Arc::new(GraphStore::open(&args.db).expect("failed to open database"));

    let llm = LlmConfig::from_env();
    let llm_status = if llm.enabled { llm.model.clone() } else { "disabled".into() };

    let api_key = std::env::var("CORTEX_API_KEY").ok();
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let cancel = CancellationToken::new();
    let state = AppState {
        store: store.clone(),
        llm,
        api_key,
        started_at: std::time::Instant::now(),
        cancel: cancel.clone(),
    };
    let app = api::router(state.clone());

    // scheduled sleep cycle — runs every CORTEX_SLEEP_MINS (default 60, 0 disables)
    let sleep_mins: u64 = std::env::var("CORTEX_SLEEP_MINS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);
    if sleep_mins > 0 {
        let bg_state = state.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(sleep_mins.saturating_mul(60));
            // wait a bit before first run so startup isn't slowed
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            loop {
                if bg_state.cancel.is_cancelled() {
                    break;
                }
                let opts = SleepCycleOptions::default();
                let child = bg_state.cancel.child_token();
                let r = run_sleep_cycle(&bg_state.store, &bg_state.llm, &opts, None, &child).await;
                if r.vector_merged > 0 || r.semantic_invalidated > 0 || r.pruned > 0 || r.noise_deleted > 0 {
                    info!(
                        merged = r.vector_merged,
                        invalidated = r.semantic_invalidated,
                        pruned = r.pruned,
                        noise = r.noise_deleted,
                        "scheduled sleep cycle"
                    );
                }
                tokio::time::sleep(interval).await;
            }
        });
        info!(every_mins = sleep_mins, "scheduled sleep cycle enabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        llm = %llm_status,
        auth = auth_status,
        "cortex starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .expect("server error");
}

async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    // Propagate into running sleep cycles and extraction tasks.
    cancel.cancel();
    info!("shutting down");
}
