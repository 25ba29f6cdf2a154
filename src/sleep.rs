//! The sleep cycle: a seven-phase consolidator that runs over the whole
//! store on a schedule.
//!
//! 1  vector + semantic deduplication (1a merge, 1b LLM dedup, 1c conflicts)
//! 2  effective-score snapshot + Pareto threshold
//! 3  core promotion (off by default)
//! 4  entity-extraction catch-up
//! 5  decay + pruning
//! 6  orphan entity/tag cleanup
//! 7  noise-pattern purge
//!
//! Phases run strictly in order; a phase only starts after the previous one
//! has fully settled. One cancellation token reaches every phase, every LLM
//! call, and the inter-batch sleep; partial progress is kept on abort. No
//! error escapes the cycle; phases log and move on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::background::run_background_extraction;
use crate::db_call;
use crate::extract::{self, ConflictChoice};
use crate::gate;
use crate::llm::LlmConfig;
use crate::store::{
    calculate_pareto_threshold, DecayCurve, DecayParams, DuplicateCluster, MemoryCategory,
};
use crate::thresholds::{CLUSTER_SIM, VECTOR_MERGE_SIM};
use crate::SharedStore;

/// Synchronous per-phase progress callback: (phase number, message).
pub type PhaseFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SleepCycleOptions {
    /// Cosine threshold for cluster adjacency.
    pub cluster_threshold: f64,
    /// Clusters containing a pair at or above this merge without the LLM.
    pub dedup_threshold: f64,
    /// Skip phases 1b and 1c entirely.
    pub skip_semantic_dedup: bool,
    /// Cap on LLM dedup pairs per cycle; overflow is dropped lowest-similarity first.
    pub max_semantic_dedup_pairs: usize,
    /// Concurrent outstanding LLM calls per batch.
    pub llm_concurrency: usize,
    /// Percentile for the Pareto cut (0.8 = top 20%).
    pub pareto_percentile: f64,
    /// Core promotion is one-way, so it stays opt-in.
    pub skip_promotion: bool,
    /// Minimum age before a memory may be promoted.
    pub promotion_min_age_days: f64,
    /// Page size for extraction catch-up.
    pub extraction_batch_size: usize,
    /// Pause between catch-up pages.
    pub extraction_delay_ms: u64,
    pub retention_threshold: f64,
    pub base_half_life_days: f64,
    pub importance_multiplier: f64,
    pub decay_curves: Option<HashMap<String, DecayCurve>>,
    pub agent_id: Option<String>,
}

impl Default for SleepCycleOptions {
    fn default() -> Self {
        Self {
            cluster_threshold: CLUSTER_SIM,
            dedup_threshold: VECTOR_MERGE_SIM,
            skip_semantic_dedup: false,
            max_semantic_dedup_pairs: 500,
            llm_concurrency: 8,
            pareto_percentile: 0.8,
            skip_promotion: true,
            promotion_min_age_days: 7.0,
            extraction_batch_size: 50,
            extraction_delay_ms: 1000,
            retention_threshold: 0.05,
            base_half_life_days: 30.0,
            importance_multiplier: 1.0,
            decay_curves: None,
            agent_id: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SleepCycleResult {
    pub clusters_found: usize,
    pub vector_merged: usize,
    pub vector_invalidated: usize,
    pub semantic_pairs_checked: usize,
    pub semantic_invalidated: usize,
    pub conflicts_checked: usize,
    pub conflicts_resolved: usize,
    pub scored_total: usize,
    pub pareto_threshold: f64,
    pub promoted: usize,
    pub extractions_processed: usize,
    pub pruned: usize,
    pub orphan_entities_deleted: usize,
    pub orphan_tags_deleted: usize,
    pub noise_deleted: usize,
    pub duration_ms: u64,
    pub aborted: bool,
}

fn report(progress: &Option<PhaseFn>, phase: u8, msg: &str) {
    if let Some(f) = progress {
        f(phase, msg);
    }
    debug!(phase, "{msg}");
}

struct SemPair {
    id_a: String,
    id_b: String,
    text_a: String,
    text_b: String,
    imp_a: f64,
    imp_b: f64,
    sim: f64,
}

/// Run one full consolidation pass.
pub async fn run_sleep_cycle(
    store: &SharedStore,
    llm: &LlmConfig,
    opts: &SleepCycleOptions,
    progress: Option<PhaseFn>,
    cancel: &CancellationToken,
) -> SleepCycleResult {
    let start = Instant::now();
    let mut result = SleepCycleResult::default();
    // Memories invalidated earlier in this cycle: later pairs touching them
    // are skipped, so two verdicts can never fight over the same survivor.
    let mut invalidated: HashSet<String> = HashSet::new();
    let agent = opts.agent_id.clone();

    'cycle: {
        // --- Phase 1: vector + semantic deduplication --------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 1, "deduplicating similar memories");

        let clusters = {
            let agent = agent.clone();
            let threshold = opts.cluster_threshold;
            db_call(store, move |s| {
                s.find_duplicate_clusters(threshold, agent.as_deref(), true)
            })
            .await
            .and_then(|r| r)
            .unwrap_or_else(|e| {
                warn!(error = %e, "duplicate cluster query failed");
                vec![]
            })
        };
        result.clusters_found = clusters.len();

        let (high, medium): (Vec<DuplicateCluster>, Vec<DuplicateCluster>) =
            clusters.into_iter().partition(|c| {
                c.similarities
                    .as_ref()
                    .is_some_and(|sims| sims.values().any(|&s| s >= opts.dedup_threshold))
            });

        // Phase 1a: near-identical clusters merge mechanically.
        for cluster in &high {
            if cancel.is_cancelled() {
                result.aborted = true;
                break 'cycle;
            }
            let ids = cluster.memory_ids.clone();
            let imps = cluster.importances.clone();
            match db_call(store, move |s| s.merge_memory_cluster(&ids, &imps))
                .await
                .and_then(|r| r)
            {
                Ok(outcome) => {
                    result.vector_merged += 1;
                    result.vector_invalidated += outcome.deleted_count;
                    for id in &cluster.memory_ids {
                        if *id != outcome.kept_id {
                            invalidated.insert(id.clone());
                        }
                    }
                    debug!(kept = %outcome.kept_id, absorbed = outcome.deleted_count, "cluster merged");
                }
                Err(e) => warn!(error = %e, "cluster merge failed"),
            }
        }

        if !opts.skip_semantic_dedup {
            // Phase 1b: medium-similarity pairs go to the LLM.
            let mut pairs: Vec<SemPair> = Vec::new();
            for cluster in &medium {
                let Some(sims) = &cluster.similarities else { continue };
                for i in 0..cluster.memory_ids.len() {
                    for j in (i + 1)..cluster.memory_ids.len() {
                        let key = crate::store::pair_key(
                            &cluster.memory_ids[i],
                            &cluster.memory_ids[j],
                        );
                        pairs.push(SemPair {
                            id_a: cluster.memory_ids[i].clone(),
                            id_b: cluster.memory_ids[j].clone(),
                            text_a: cluster.texts[i].clone(),
                            text_b: cluster.texts[j].clone(),
                            imp_a: cluster.importances[i],
                            imp_b: cluster.importances[j],
                            sim: sims.get(&key).copied().unwrap_or(0.0),
                        });
                    }
                }
            }
            if pairs.len() > opts.max_semantic_dedup_pairs {
                info!(
                    total = pairs.len(),
                    cap = opts.max_semantic_dedup_pairs,
                    "semantic dedup pair cap hit, keeping highest-similarity pairs"
                );
                pairs.sort_by(|a, b| b.sim.partial_cmp(&a.sim).unwrap_or(std::cmp::Ordering::Equal));
                pairs.truncate(opts.max_semantic_dedup_pairs);
            }

            for batch in pairs.chunks(opts.llm_concurrency.max(1)) {
                if cancel.is_cancelled() {
                    result.aborted = true;
                    break 'cycle;
                }
                // Checked once before dispatch and again after each verdict.
                let live: Vec<&SemPair> = batch
                    .iter()
                    .filter(|p| !invalidated.contains(&p.id_a) && !invalidated.contains(&p.id_b))
                    .collect();
                let verdicts = join_all(live.iter().map(|p| {
                    extract::is_semantic_duplicate(llm, &p.text_a, &p.text_b, Some(p.sim), cancel)
                }))
                .await;
                for (p, dup) in live.iter().zip(verdicts) {
                    result.semantic_pairs_checked += 1;
                    if !dup || invalidated.contains(&p.id_a) || invalidated.contains(&p.id_b) {
                        continue;
                    }
                    let loser = if p.imp_b < p.imp_a { p.id_b.clone() } else { p.id_a.clone() };
                    let loser2 = loser.clone();
                    match db_call(store, move |s| s.invalidate_memory(&loser2))
                        .await
                        .and_then(|r| r)
                    {
                        Ok(true) => {
                            invalidated.insert(loser);
                            result.semantic_invalidated += 1;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "invalidate failed"),
                    }
                }
            }

            // Phase 1c: conflict detection.
            if cancel.is_cancelled() {
                result.aborted = true;
                break 'cycle;
            }
            report(&progress, 1, "resolving conflicting memories");
            let conflicts = {
                let agent = agent.clone();
                db_call(store, move |s| s.find_conflicting_memories(agent.as_deref()))
                    .await
                    .and_then(|r| r)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "conflict query failed");
                        vec![]
                    })
            };
            for batch in conflicts.chunks(opts.llm_concurrency.max(1)) {
                if cancel.is_cancelled() {
                    result.aborted = true;
                    break 'cycle;
                }
                let live: Vec<_> = batch
                    .iter()
                    .filter(|p| !invalidated.contains(&p.id_a) && !invalidated.contains(&p.id_b))
                    .collect();
                let choices = join_all(
                    live.iter()
                        .map(|p| extract::resolve_conflict(llm, &p.text_a, &p.text_b, cancel)),
                )
                .await;
                for (p, choice) in live.iter().zip(choices) {
                    result.conflicts_checked += 1;
                    let loser = match choice {
                        ConflictChoice::KeepA => Some(p.id_b.clone()),
                        ConflictChoice::KeepB => Some(p.id_a.clone()),
                        ConflictChoice::Both | ConflictChoice::Skip => None,
                    };
                    let Some(loser) = loser else { continue };
                    if invalidated.contains(&loser) {
                        continue;
                    }
                    let loser2 = loser.clone();
                    match db_call(store, move |s| s.invalidate_memory(&loser2))
                        .await
                        .and_then(|r| r)
                    {
                        Ok(true) => {
                            invalidated.insert(loser);
                            result.conflicts_resolved += 1;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "invalidate failed"),
                    }
                }
            }
        }

        // --- Phase 2: Pareto scoring -------------------------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 2, "scoring all memories");
        let scores = {
            let agent = agent.clone();
            db_call(store, move |s| s.calculate_all_effective_scores(agent.as_deref()))
                .await
                .and_then(|r| r)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "score query failed");
                    vec![]
                })
        };
        result.scored_total = scores.len();
        let values: Vec<f64> = scores.iter().map(|s| s.effective_score).collect();
        result.pareto_threshold = calculate_pareto_threshold(&values, opts.pareto_percentile);

        // --- Phase 3: core promotion -------------------------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        if !opts.skip_promotion {
            report(&progress, 3, "promoting high-value memories to core");
            // Uses the phase-2 snapshot; promotion is one-way so staleness
            // only delays, never corrupts.
            let candidates: Vec<String> = scores
                .iter()
                .filter(|s| {
                    s.category != MemoryCategory::Core
                        && s.effective_score >= result.pareto_threshold
                        && s.age_days >= opts.promotion_min_age_days
                        && !invalidated.contains(&s.id)
                })
                .map(|s| s.id.clone())
                .collect();
            if !candidates.is_empty() {
                result.promoted = db_call(store, move |s| s.promote_to_core(&candidates))
                    .await
                    .and_then(|r| r)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "promotion failed");
                        0
                    });
            }
        }

        // --- Phase 4: entity extraction catch-up -------------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 4, "catching up pending extractions");
        let total_pending = {
            let agent = agent.clone();
            db_call(store, move |s| s.count_by_extraction_status(agent.as_deref()))
                .await
                .and_then(|r| r)
                .map(|c| c.pending)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "pending count failed");
                    0
                })
        };
        let mut processed = 0usize;
        'pages: while processed < total_pending {
            let page = {
                let agent = agent.clone();
                let limit = opts.extraction_batch_size;
                db_call(store, move |s| s.list_pending_extractions(limit, agent.as_deref()))
                    .await
                    .and_then(|r| r)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "pending page query failed");
                        vec![]
                    })
            };
            if page.is_empty() {
                break;
            }
            for chunk in page.chunks(opts.llm_concurrency.max(1)) {
                if cancel.is_cancelled() {
                    result.aborted = true;
                    break 'cycle;
                }
                join_all(chunk.iter().map(|p| {
                    run_background_extraction(
                        store,
                        llm,
                        &p.id,
                        &p.content,
                        p.extraction_retries,
                        cancel,
                    )
                }))
                .await;
                processed += chunk.len();
            }
            result.extractions_processed = processed;
            if processed >= total_pending {
                break;
            }
            // Abort-aware pause between pages
            tokio::select! {
                _ = cancel.cancelled() => {
                    result.aborted = true;
                    break 'pages;
                }
                _ = tokio::time::sleep(Duration::from_millis(opts.extraction_delay_ms)) => {}
            }
        }
        result.extractions_processed = processed;
        if result.aborted {
            break 'cycle;
        }

        // --- Phase 5: decay & pruning ------------------------------------
        // After phase 4 so fresh extractions had a chance to link entities.
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 5, "pruning decayed memories");
        let decay = DecayParams {
            retention_threshold: opts.retention_threshold,
            base_half_life_days: opts.base_half_life_days,
            importance_multiplier: opts.importance_multiplier,
            decay_curves: opts.decay_curves.clone(),
            agent_id: agent.clone(),
        };
        result.pruned = db_call(store, move |s| {
            let ids = s.find_decayed_memories(&decay)?;
            s.prune_memories(&ids)
        })
        .await
        .and_then(|r| r)
        .unwrap_or_else(|e| {
            warn!(error = %e, "decay pruning failed");
            0
        });

        // --- Phase 6: orphan cleanup -------------------------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 6, "cleaning up orphan entities and tags");
        result.orphan_entities_deleted = db_call(store, |s| s.delete_orphan_entities())
            .await
            .and_then(|r| r)
            .unwrap_or_else(|e| {
                warn!(error = %e, "orphan entity cleanup failed");
                0
            });
        result.orphan_tags_deleted = db_call(store, |s| s.delete_orphan_tags())
            .await
            .and_then(|r| r)
            .unwrap_or_else(|e| {
                warn!(error = %e, "orphan tag cleanup failed");
                0
            });

        // --- Phase 7: noise pattern cleanup ------------------------------
        if cancel.is_cancelled() {
            result.aborted = true;
            break 'cycle;
        }
        report(&progress, 7, "purging stored noise");
        let noise_ids = {
            let agent = agent.clone();
            db_call(store, move |s| s.list_active_texts(agent.as_deref()))
                .await
                .and_then(|r| r)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "noise scan failed");
                    vec![]
                })
                .into_iter()
                .filter(|(_, content, category, pinned)| {
                    *category != MemoryCategory::Core && !*pinned && gate::is_open_proposal(content)
                })
                .map(|(id, _, _, _)| id)
                .collect::<Vec<_>>()
        };
        if !noise_ids.is_empty() {
            result.noise_deleted = db_call(store, move |s| s.prune_memories(&noise_ids))
                .await
                .and_then(|r| r)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "noise purge failed");
                    0
                });
        }
    }

    result.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        merged = result.vector_merged,
        semantic = result.semantic_invalidated,
        conflicts = result.conflicts_resolved,
        promoted = result.promoted,
        extracted = result.extractions_processed,
        pruned = result.pruned,
        noise = result.noise_deleted,
        aborted = result.aborted,
        duration_ms = result.duration_ms,
        "sleep cycle complete"
    );
    result
}
