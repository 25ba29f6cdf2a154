/// Similarity thresholds and retry limits shared across components.
///
/// The hierarchy: cluster (loose) < conflict window < semantic fast-path < vector merge (tightest)

/// Sleep cycle: clusters are built from pairs at or above this cosine.
pub const CLUSTER_SIM: f64 = 0.75;

/// Sleep cycle: clusters containing a pair at or above this merge without
/// consulting the LLM.
pub const VECTOR_MERGE_SIM: f64 = 0.95;

/// Semantic dedup fast path: below this cosine, two texts are assumed
/// distinct and the LLM is never asked.
pub const SEMANTIC_DUP_FAST_PATH: f64 = 0.80;

/// Conflict detection window: pairs between these bounds that also share a
/// mentioned entity become candidates for LLM adjudication. The upper bound
/// hands near-duplicates to the dedup path instead.
pub const CONFLICT_MIN_SIM: f64 = 0.65;
pub const CONFLICT_MAX_SIM: f64 = SEMANTIC_DUP_FAST_PATH;

/// Extraction gives up for good after this many transient failures.
pub const MAX_EXTRACTION_RETRIES: i64 = 3;

/// Importance domain. 0.5 is the neutral default used on every failure path.
pub const IMPORTANCE_MIN: f64 = 0.1;
pub const IMPORTANCE_MAX: f64 = 1.0;
pub const IMPORTANCE_DEFAULT: f64 = 0.5;

/// Recency half-life (days) in the effective-score formula.
pub const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;
