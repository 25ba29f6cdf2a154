use cortex::store::{
    calculate_pareto_threshold, DecayCurve, DecayParams, EntityInput, EntityType, ExtractionStatus,
    GraphStore, Memory, MemoryCategory, MemoryInput, RelationInput, RelationType, TagInput,
};
use std::collections::HashMap;

fn test_db() -> GraphStore {
    GraphStore::open(":memory:").expect("in-memory db")
}

fn mem_with_ts(
    id: &str,
    category: MemoryCategory,
    importance: f64,
    retrieval_count: i64,
    created_ms: i64,
    accessed_ms: i64,
) -> Memory {
    Memory {
        id: id.into(),
        content: format!("test memory {id}"),
        category,
        importance,
        created_at: created_ms,
        last_accessed: accessed_ms,
        retrieval_count,
        extraction_status: ExtractionStatus::Pending,
        extraction_retries: 0,
        user_pinned: false,
        invalidated: false,
        agent_id: None,
        embedding: Some(vec![1.0, 0.0, 0.0]),
    }
}

fn now_ms() -> i64 {
    cortex::store::now_ms()
}

// --- insert + validation ---

#[test]
fn insert_and_get_roundtrip() {
    let db = test_db();
    let mem = db
        .insert_memory(MemoryInput::new("the user lives in Berlin", vec![0.6, 0.8]))
        .unwrap();
    let loaded = db.get_memory(&mem.id).unwrap().unwrap();
    assert_eq!(loaded.content, "the user lives in Berlin");
    assert_eq!(loaded.category, MemoryCategory::Other);
    assert_eq!(loaded.importance, 0.5);
    assert_eq!(loaded.extraction_status, ExtractionStatus::Pending);
    assert_eq!(loaded.embedding.unwrap(), vec![0.6, 0.8]);
}

#[test]
fn insert_clamps_importance() {
    let db = test_db();
    let low = db
        .insert_memory(MemoryInput::new("low importance entry for clamping", vec![1.0]).importance(0.01))
        .unwrap();
    assert_eq!(low.importance, 0.1);
    let high = db
        .insert_memory(MemoryInput::new("high importance entry for clamping", vec![1.0]).importance(3.0))
        .unwrap();
    assert_eq!(high.importance, 1.0);
}

#[test]
fn insert_rejects_empty_and_dimension_mismatch() {
    let db = test_db();
    assert!(db.insert_memory(MemoryInput::new("   ", vec![1.0])).is_err());
    db.insert_memory(MemoryInput::new("first fixes the dimension", vec![1.0, 0.0, 0.0]))
        .unwrap();
    let err = db
        .insert_memory(MemoryInput::new("wrong dimension", vec![1.0, 0.0]))
        .unwrap_err();
    assert!(err.to_string().contains("dimension"));
}

// --- extraction status transitions ---

#[test]
fn status_transitions_are_monotonic() {
    let db = test_db();
    let mem = db.insert_memory(MemoryInput::new("pending memory for status test", vec![1.0])).unwrap();

    // pending → pending with retry bump
    assert!(db.update_extraction_status(&mem.id, ExtractionStatus::Pending, true).unwrap());
    assert_eq!(db.get_memory(&mem.id).unwrap().unwrap().extraction_retries, 1);

    // pending → complete
    assert!(db.update_extraction_status(&mem.id, ExtractionStatus::Complete, false).unwrap());

    // complete is terminal: no further transition is accepted
    assert!(!db.update_extraction_status(&mem.id, ExtractionStatus::Failed, false).unwrap());
    assert!(!db.update_extraction_status(&mem.id, ExtractionStatus::Pending, true).unwrap());
    let loaded = db.get_memory(&mem.id).unwrap().unwrap();
    assert_eq!(loaded.extraction_status, ExtractionStatus::Complete);
    assert_eq!(loaded.extraction_retries, 1);
}

// --- batch entity operations ---

fn sample_artifacts() -> (Vec<EntityInput>, Vec<RelationInput>, Vec<TagInput>) {
    let entities = vec![
        EntityInput {
            name: "claire".into(),
            etype: EntityType::Person,
            aliases: vec!["claire b.".into()],
            description: Some("the user's sister".into()),
        },
        EntityInput {
            name: "lisbon".into(),
            etype: EntityType::Location,
            aliases: vec![],
            description: None,
        },
    ];
    let relationships = vec![RelationInput {
        source: "claire".into(),
        target: "lisbon".into(),
        rtype: RelationType::LivesAt,
        confidence: 0.9,
    }];
    let tags = vec![TagInput { name: "family".into(), category: "topic".into() }];
    (entities, relationships, tags)
}

#[test]
fn batch_ops_link_and_complete() {
    let db = test_db();
    let mem = db
        .insert_memory(MemoryInput::new("Claire moved to Lisbon", vec![1.0]))
        .unwrap();
    let (entities, relationships, tags) = sample_artifacts();
    db.batch_entity_operations(&mem.id, &entities, &relationships, &tags, Some(MemoryCategory::Fact))
        .unwrap();

    let loaded = db.get_memory(&mem.id).unwrap().unwrap();
    assert_eq!(loaded.extraction_status, ExtractionStatus::Complete);
    assert_eq!(loaded.category, MemoryCategory::Fact);
    assert_eq!(db.mentioned_entities(&mem.id).unwrap(), vec!["claire", "lisbon"]);
    assert_eq!(db.memory_tags(&mem.id).unwrap(), vec!["family"]);
}

#[test]
fn batch_ops_merge_by_name_and_type() {
    let db = test_db();
    let a = db.insert_memory(MemoryInput::new("first mention of Claire", vec![1.0])).unwrap();
    let b = db.insert_memory(MemoryInput::new("second mention of Claire", vec![1.0])).unwrap();
    let (entities, relationships, tags) = sample_artifacts();

    db.batch_entity_operations(&a.id, &entities, &relationships, &tags, None).unwrap();
    db.batch_entity_operations(&b.id, &entities, &relationships, &tags, None).unwrap();

    // MERGE on (name, type) and on tag name: no duplicates after two rounds
    let stats = db.stats().unwrap();
    assert_eq!(stats.entities, 2);
    assert_eq!(stats.tags, 1);
    assert_eq!(db.mentioned_entities(&b.id).unwrap(), vec!["claire", "lisbon"]);
}

#[test]
fn batch_ops_never_demote_core() {
    let db = test_db();
    let mem = db.insert_memory(MemoryInput::new("a core memory", vec![1.0])).unwrap();
    db.promote_to_core(&[mem.id.clone()]).unwrap();

    db.batch_entity_operations(&mem.id, &[], &[], &[], Some(MemoryCategory::Fact)).unwrap();
    let loaded = db.get_memory(&mem.id).unwrap().unwrap();
    assert_eq!(loaded.category, MemoryCategory::Core);
}

// --- orphan cleanup ---

#[test]
fn orphan_cleanup_after_prune() {
    let db = test_db();
    let mem = db.insert_memory(MemoryInput::new("Claire moved to Lisbon", vec![1.0])).unwrap();
    let (entities, relationships, tags) = sample_artifacts();
    db.batch_entity_operations(&mem.id, &entities, &relationships, &tags, None).unwrap();

    assert!(db.find_orphan_entities().unwrap().is_empty());
    assert!(db.find_orphan_tags().unwrap().is_empty());

    assert_eq!(db.prune_memories(&[mem.id.clone()]).unwrap(), 1);
    assert_eq!(db.find_orphan_entities().unwrap().len(), 2);
    assert_eq!(db.find_orphan_tags().unwrap().len(), 1);

    assert_eq!(db.delete_orphan_entities().unwrap(), 2);
    assert_eq!(db.delete_orphan_tags().unwrap(), 1);
    let stats = db.stats().unwrap();
    assert_eq!(stats.entities, 0);
    assert_eq!(stats.tags, 0);
}

// --- scoring ---

#[test]
fn effective_score_formula() {
    let db = test_db();
    let now = now_ms();
    // accessed now, 5 retrievals, importance 0.8
    let m = mem_with_ts("scored", MemoryCategory::Fact, 0.8, 5, now - 1000, now);
    db.import_memories(&[m]).unwrap();

    let scores = db.calculate_all_effective_scores(None).unwrap();
    assert_eq!(scores.len(), 1);
    let expected = 0.8 * (1.0 + (6.0f64).ln() * 0.3); // recency ≈ 1 at zero days
    assert!((scores[0].effective_score - expected).abs() < 1e-3);
}

#[test]
fn recency_halves_every_two_weeks() {
    let db = test_db();
    let now = now_ms();
    let fresh = mem_with_ts("fresh", MemoryCategory::Fact, 0.5, 0, now, now);
    let stale = mem_with_ts("stale", MemoryCategory::Fact, 0.5, 0, now, now - 14 * 86_400_000);
    db.import_memories(&[fresh, stale]).unwrap();

    let scores = db.calculate_all_effective_scores(None).unwrap();
    let by_id: HashMap<_, _> = scores.iter().map(|s| (s.id.as_str(), s.effective_score)).collect();
    let ratio = by_id["stale"] / by_id["fresh"];
    assert!((ratio - 0.5).abs() < 0.01, "ratio was {ratio}");
}

#[test]
fn invalidated_memories_are_not_scored() {
    let db = test_db();
    let now = now_ms();
    let mut dead = mem_with_ts("dead", MemoryCategory::Fact, 0.5, 0, now, now);
    dead.invalidated = true;
    db.import_memories(&[dead, mem_with_ts("alive", MemoryCategory::Fact, 0.5, 0, now, now)])
        .unwrap();
    let scores = db.calculate_all_effective_scores(None).unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].id, "alive");
}

#[test]
fn pareto_threshold_within_one_element() {
    let scores: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let threshold = calculate_pareto_threshold(&scores, 0.8);
    // 8 of 10 scores lie strictly below the cut
    let below = scores.iter().filter(|&&s| s < threshold).count();
    assert!((below as i64 - 8).abs() <= 1, "below={below} threshold={threshold}");

    assert_eq!(calculate_pareto_threshold(&[], 0.8), 0.0);
    assert_eq!(calculate_pareto_threshold(&[3.0], 0.8), 3.0);
    // pct=1.0 clamps to the max rather than indexing past the end
    assert_eq!(calculate_pareto_threshold(&scores, 1.0), 10.0);
}

// --- decay ---

#[test]
fn decay_selects_old_low_importance() {
    let db = test_db();
    let now = now_ms();
    let old = now - 120 * 86_400_000;
    db.import_memories(&[
        mem_with_ts("old-weak", MemoryCategory::Other, 0.2, 0, old, old),
        mem_with_ts("old-strong", MemoryCategory::Other, 1.0, 0, old, old),
        mem_with_ts("fresh", MemoryCategory::Other, 0.2, 0, now, now),
    ])
    .unwrap();

    let params = DecayParams {
        retention_threshold: 0.05,
        base_half_life_days: 30.0,
        importance_multiplier: 1.0,
        decay_curves: None,
        agent_id: None,
    };
    let decayed = db.find_decayed_memories(&params).unwrap();
    assert!(decayed.contains(&"old-weak".to_string()));
    assert!(!decayed.contains(&"fresh".to_string()));
    // importance 1.0 → half-life 45d, 120d → 0.157 retained, above threshold
    assert!(!decayed.contains(&"old-strong".to_string()));
}

#[test]
fn decay_exempts_core_and_pinned() {
    let db = test_db();
    let old = now_ms() - 365 * 86_400_000;
    let mut pinned = mem_with_ts("pinned", MemoryCategory::Other, 0.1, 0, old, old);
    pinned.user_pinned = true;
    db.import_memories(&[
        pinned,
        mem_with_ts("core", MemoryCategory::Core, 0.1, 0, old, old),
        mem_with_ts("doomed", MemoryCategory::Other, 0.1, 0, old, old),
    ])
    .unwrap();

    let params = DecayParams {
        retention_threshold: 0.05,
        base_half_life_days: 30.0,
        importance_multiplier: 1.0,
        decay_curves: None,
        agent_id: None,
    };
    let decayed = db.find_decayed_memories(&params).unwrap();
    assert_eq!(decayed, vec!["doomed".to_string()]);
}

#[test]
fn decay_curve_overrides_half_life() {
    let db = test_db();
    let old = now_ms() - 120 * 86_400_000;
    db.import_memories(&[mem_with_ts("pref", MemoryCategory::Preference, 0.5, 0, old, old)])
        .unwrap();

    let mut base = DecayParams {
        retention_threshold: 0.05,
        base_half_life_days: 30.0,
        importance_multiplier: 1.0,
        decay_curves: None,
        agent_id: None,
    };
    // default half-life 30d: 0.5 × 2^(−4) ≈ 0.031 < 0.05 → decayed
    assert_eq!(db.find_decayed_memories(&base).unwrap().len(), 1);

    // preference curve with a very long half-life rescues it
    let mut curves = HashMap::new();
    curves.insert("preference".to_string(), DecayCurve { half_life_days: 365.0 });
    base.decay_curves = Some(curves);
    assert!(db.find_decayed_memories(&base).unwrap().is_empty());
}

#[test]
fn prune_refuses_core_and_pinned() {
    let db = test_db();
    let now = now_ms();
    let mut pinned = mem_with_ts("pinned", MemoryCategory::Other, 0.5, 0, now, now);
    pinned.user_pinned = true;
    db.import_memories(&[
        pinned,
        mem_with_ts("core", MemoryCategory::Core, 0.5, 0, now, now),
        mem_with_ts("plain", MemoryCategory::Other, 0.5, 0, now, now),
    ])
    .unwrap();

    let ids: Vec<String> = ["pinned", "core", "plain"].iter().map(|s| s.to_string()).collect();
    assert_eq!(db.prune_memories(&ids).unwrap(), 1);
    assert!(db.get_memory("pinned").unwrap().is_some());
    assert!(db.get_memory("core").unwrap().is_some());
    assert!(db.get_memory("plain").unwrap().is_none());
}

// --- pending extractions + counts ---

#[test]
fn pending_listing_and_counts() {
    let db = test_db();
    let a = db.insert_memory(MemoryInput::new("first pending entry text", vec![1.0])).unwrap();
    let b = db.insert_memory(MemoryInput::new("second pending entry text", vec![1.0])).unwrap();
    db.update_extraction_status(&b.id, ExtractionStatus::Failed, false).unwrap();

    let pending = db.list_pending_extractions(10, None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, a.id);

    let counts = db.count_by_extraction_status(None).unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.complete, 0);
}

#[test]
fn agent_filter_scopes_queries() {
    let db = test_db();
    db.insert_memory(MemoryInput::new("memory for agent alpha", vec![1.0]).agent_id("alpha"))
        .unwrap();
    db.insert_memory(MemoryInput::new("memory for agent beta", vec![1.0]).agent_id("beta"))
        .unwrap();

    assert_eq!(db.list_pending_extractions(10, Some("alpha")).unwrap().len(), 1);
    assert_eq!(db.list_pending_extractions(10, None).unwrap().len(), 2);
    assert_eq!(db.count_by_extraction_status(Some("beta")).unwrap().pending, 1);
    assert_eq!(db.calculate_all_effective_scores(Some("alpha")).unwrap().len(), 1);
}

// --- core listing ---

#[test]
fn core_listing_ranks_by_usage() {
    let db = test_db();
    let now = now_ms();
    let mut hot = mem_with_ts("hot", MemoryCategory::Core, 0.1, 50, now, now);
    hot.importance = 0.1; // importance must NOT affect core retrieval order
    let cold = mem_with_ts("cold", MemoryCategory::Core, 1.0, 0, now, now - 30 * 86_400_000);
    db.import_memories(&[cold, hot]).unwrap();

    let core = db.list_core_memories(10).unwrap();
    assert_eq!(core.len(), 2);
    assert_eq!(core[0].id, "hot");
}
