use std::sync::Arc;

use cortex::llm::LlmConfig;
use cortex::sleep::{run_sleep_cycle, SleepCycleOptions};
use cortex::store::{
    EntityInput, EntityType, ExtractionStatus, GraphStore, Memory, MemoryCategory, TagInput,
};
use cortex::SharedStore;
use tokio_util::sync::CancellationToken;

fn test_store() -> SharedStore {
    Arc::new(GraphStore::open(":memory:").expect("in-memory db"))
}

fn mem(id: &str, importance: f64, retrieval_count: i64, emb: Vec<f32>) -> Memory {
    let now = cortex::store::now_ms();
    Memory {
        id: id.into(),
        content: format!("memory {id}"),
        category: MemoryCategory::Other,
        importance,
        created_at: now,
        last_accessed: now,
        retrieval_count,
        extraction_status: ExtractionStatus::Complete,
        extraction_retries: 0,
        user_pinned: false,
        invalidated: false,
        agent_id: None,
        embedding: Some(emb),
    }
}

fn unit(deg: f64) -> Vec<f32> {
    let rad = deg.to_radians();
    vec![rad.cos() as f32, rad.sin() as f32, 0.0]
}

async fn run(store: &SharedStore, opts: &SleepCycleOptions) -> cortex::sleep::SleepCycleResult {
    let cancel = CancellationToken::new();
    run_sleep_cycle(store, &LlmConfig::off(), opts, None, &cancel).await
}

#[tokio::test]
async fn vector_merge_keeps_best_and_migrates_edges() {
    let store = test_store();
    // Δ2° → cos ≈ 0.999, well above the 0.95 merge threshold
    store
        .import_memories(&[mem("keep", 0.8, 2, unit(0.0)), mem("lose", 0.5, 3, unit(2.0))])
        .unwrap();
    let espresso = EntityInput {
        name: "espresso".into(),
        etype: EntityType::Concept,
        aliases: vec![],
        description: None,
    };
    store
        .batch_entity_operations("lose", std::slice::from_ref(&espresso), &[], &[], None)
        .unwrap();
    store
        .batch_entity_operations(
            "keep",
            &[],
            &[],
            &[TagInput { name: "coffee".into(), category: "topic".into() }],
            None,
        )
        .unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.clusters_found, 1);
    assert_eq!(result.vector_merged, 1);
    assert_eq!(result.vector_invalidated, 1);
    assert!(!result.aborted);

    let kept = store.get_memory("keep").unwrap().unwrap();
    assert!(!kept.invalidated);
    assert_eq!(kept.importance, 0.8);
    assert_eq!(kept.retrieval_count, 5);
    // the loser's MENTIONS edge survived on the winner
    assert_eq!(store.mentioned_entities("keep").unwrap(), vec!["espresso"]);
    assert!(store.get_memory("lose").unwrap().unwrap().invalidated);
}

#[tokio::test]
async fn quiescent_store_yields_empty_second_run() {
    let store = test_store();
    store
        .import_memories(&[mem("a", 0.8, 0, unit(0.0)), mem("b", 0.5, 0, unit(2.0))])
        .unwrap();

    let first = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(first.vector_merged, 1);

    let second = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(second.clusters_found, 0);
    assert_eq!(second.vector_merged, 0);
    assert_eq!(second.semantic_invalidated, 0);
    assert_eq!(second.conflicts_resolved, 0);
    assert_eq!(second.extractions_processed, 0);
    assert_eq!(second.pruned, 0);
    assert_eq!(second.noise_deleted, 0);
}

#[tokio::test]
async fn medium_similarity_pairs_go_through_semantic_path() {
    let store = test_store();
    // Δ20° → cos ≈ 0.94: clusters at 0.75 but below the 0.95 merge bar
    store
        .import_memories(&[mem("a", 0.5, 0, unit(0.0)), mem("b", 0.5, 0, unit(20.0))])
        .unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.vector_merged, 0);
    assert_eq!(result.semantic_pairs_checked, 1);
    // the disabled oracle fails open: nothing is invalidated
    assert_eq!(result.semantic_invalidated, 0);
    assert!(!store.get_memory("a").unwrap().unwrap().invalidated);
    assert!(!store.get_memory("b").unwrap().unwrap().invalidated);
}

#[tokio::test]
async fn skip_semantic_dedup_skips_1b_and_1c() {
    let store = test_store();
    store
        .import_memories(&[mem("a", 0.5, 0, unit(0.0)), mem("b", 0.5, 0, unit(20.0))])
        .unwrap();

    let opts = SleepCycleOptions { skip_semantic_dedup: true, ..Default::default() };
    let result = run(&store, &opts).await;
    assert_eq!(result.semantic_pairs_checked, 0);
    assert_eq!(result.conflicts_checked, 0);
}

#[tokio::test]
async fn extraction_catchup_skips_when_disabled() {
    let store = test_store();
    let mut a = mem("a", 0.5, 0, unit(0.0));
    a.extraction_status = ExtractionStatus::Pending;
    let mut b = mem("b", 0.5, 0, unit(90.0));
    b.extraction_status = ExtractionStatus::Pending;
    store.import_memories(&[a, b]).unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.extractions_processed, 2);
    assert_eq!(
        store.get_memory("a").unwrap().unwrap().extraction_status,
        ExtractionStatus::Skipped
    );
    assert_eq!(
        store.get_memory("b").unwrap().unwrap().extraction_status,
        ExtractionStatus::Skipped
    );
}

#[tokio::test]
async fn decay_prunes_after_extraction() {
    let store = test_store();
    let old = cortex::store::now_ms() - 120 * 86_400_000;
    let mut doomed = mem("doomed", 0.2, 0, unit(0.0));
    doomed.created_at = old;
    doomed.last_accessed = old;
    let mut pinned = mem("pinned", 0.2, 0, unit(90.0));
    pinned.created_at = old;
    pinned.last_accessed = old;
    pinned.user_pinned = true;
    store.import_memories(&[doomed, pinned]).unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.pruned, 1);
    assert!(store.get_memory("doomed").unwrap().is_none());
    assert!(store.get_memory("pinned").unwrap().is_some());
}

#[tokio::test]
async fn promotion_uses_pareto_snapshot_and_age() {
    let store = test_store();
    let now = cortex::store::now_ms();
    let old = now - 30 * 86_400_000;

    // One clear winner: old enough, heavily used, recently accessed.
    let mut star = mem("star", 1.0, 40, unit(0.0));
    star.created_at = old;
    // Old but weak peers fill out the distribution.
    let mut peers = Vec::new();
    for (i, deg) in [(1, 30.0), (2, 60.0), (3, 90.0), (4, 120.0)] {
        let mut p = mem(&format!("peer{i}"), 0.3, 0, unit(deg));
        p.created_at = old;
        peers.push(p);
    }
    // Too young to promote even though its score is high.
    let young = mem("young", 1.0, 40, unit(150.0));
    store.import_memories(&[star, young]).unwrap();
    store.import_memories(&peers).unwrap();

    let opts = SleepCycleOptions { skip_promotion: false, ..Default::default() };
    let result = run(&store, &opts).await;
    assert!(result.pareto_threshold > 0.0);
    assert_eq!(result.scored_total, 6);
    assert_eq!(result.promoted, 1);
    assert_eq!(store.get_memory("star").unwrap().unwrap().category, MemoryCategory::Core);
    assert_eq!(store.get_memory("young").unwrap().unwrap().category, MemoryCategory::Other);
}

#[tokio::test]
async fn promotion_is_off_by_default() {
    let store = test_store();
    let old = cortex::store::now_ms() - 30 * 86_400_000;
    let mut star = mem("star", 1.0, 40, unit(0.0));
    star.created_at = old;
    store.import_memories(&[star]).unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.promoted, 0);
    assert_eq!(store.get_memory("star").unwrap().unwrap().category, MemoryCategory::Other);
}

#[tokio::test]
async fn noise_purge_removes_open_proposals() {
    let store = test_store();
    let mut proposal = mem("proposal", 0.5, 0, unit(0.0));
    proposal.content = "Want me to submit that pull request for you?".into();
    let mut pinned = mem("pinned", 0.5, 0, unit(60.0));
    pinned.content = "Should I keep the nightly backup job enabled?".into();
    pinned.user_pinned = true;
    let mut core = mem("core", 0.5, 0, unit(120.0));
    core.content = "Ready to deploy whenever you say the word?".into();
    core.category = MemoryCategory::Core;
    let normal = mem("normal", 0.5, 0, unit(90.0));
    store.import_memories(&[proposal, pinned, core, normal]).unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.noise_deleted, 1);
    assert!(store.get_memory("proposal").unwrap().is_none());
    assert!(store.get_memory("pinned").unwrap().is_some());
    assert!(store.get_memory("core").unwrap().is_some());
    assert!(store.get_memory("normal").unwrap().is_some());
}

#[tokio::test]
async fn orphans_are_collected_after_merge_and_prune() {
    let store = test_store();
    let old = cortex::store::now_ms() - 120 * 86_400_000;
    let mut doomed = mem("doomed", 0.2, 0, unit(0.0));
    doomed.created_at = old;
    doomed.last_accessed = old;
    store.import_memories(&[doomed]).unwrap();
    store
        .batch_entity_operations(
            "doomed",
            &[EntityInput {
                name: "ephemeral".into(),
                etype: EntityType::Concept,
                aliases: vec![],
                description: None,
            }],
            &[],
            &[TagInput { name: "fleeting".into(), category: "topic".into() }],
            None,
        )
        .unwrap();

    let result = run(&store, &SleepCycleOptions::default()).await;
    assert_eq!(result.pruned, 1);
    // orphan cleanup runs after pruning within the same cycle
    assert_eq!(result.orphan_entities_deleted, 1);
    assert_eq!(result.orphan_tags_deleted, 1);
    let stats = store.stats().unwrap();
    assert_eq!(stats.entities, 0);
    assert_eq!(stats.tags, 0);
}

#[tokio::test]
async fn abort_short_circuits_all_phases() {
    let store = test_store();
    store
        .import_memories(&[mem("a", 0.8, 0, unit(0.0)), mem("b", 0.5, 0, unit(2.0))])
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result =
        run_sleep_cycle(&store, &LlmConfig::off(), &SleepCycleOptions::default(), None, &cancel)
            .await;
    assert!(result.aborted);
    assert_eq!(result.vector_merged, 0);
    assert!(!store.get_memory("a").unwrap().unwrap().invalidated);
    assert!(!store.get_memory("b").unwrap().unwrap().invalidated);
}

#[tokio::test]
async fn progress_callback_fires_per_phase() {
    let store = test_store();
    store.import_memories(&[mem("a", 0.5, 0, unit(0.0))]).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let progress: cortex::sleep::PhaseFn = Arc::new(move |phase, _msg| {
        seen2.lock().unwrap().push(phase);
    });
    let cancel = CancellationToken::new();
    run_sleep_cycle(
        &store,
        &LlmConfig::off(),
        &SleepCycleOptions::default(),
        Some(progress),
        &cancel,
    )
    .await;

    let phases = seen.lock().unwrap();
    // phases report in order; promotion (3) is skipped by default
    assert!(phases.windows(2).all(|w| w[0] <= w[1]));
    assert!(phases.contains(&1));
    assert!(phases.contains(&7));
}
