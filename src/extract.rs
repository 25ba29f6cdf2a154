//! LLM-judged semantic operations: entity/relationship/tag extraction,
//! importance rating, duplicate testing, and conflict resolution.
//!
//! Every operation degrades safely: disabled config or any failure collapses
//! to a neutral default (no extraction, importance 0.5, "unique", "skip").
//! The LLM's JSON is never trusted: [`validate_extraction`] coerces unknown
//! values to safe defaults or drops the record.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{self, LlmConfig};
use crate::prompts;
use crate::store::{EntityInput, EntityType, MemoryCategory, RelationInput, RelationType, TagInput};
use crate::thresholds::{IMPORTANCE_DEFAULT, IMPORTANCE_MAX, IMPORTANCE_MIN, SEMANTIC_DUP_FAST_PATH};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub category: Option<MemoryCategory>,
    pub entities: Vec<EntityInput>,
    pub relationships: Vec<RelationInput>,
    pub tags: Vec<TagInput>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepA,
    KeepB,
    Both,
    Skip,
}

// ---------------------------------------------------------------------------
// Raw wire shapes — what the model actually returns
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relationships: Vec<RawRelation>,
    #[serde(default)]
    pub tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
pub struct RawEntity {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub etype: Option<String>,
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawRelation {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type", default)]
    pub rtype: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RawTag {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Coerce a raw extraction into the typed model.
///
/// - unknown entity types collapse to `concept`
/// - unknown categories become unset; `core` is never extractor-assignable
/// - unknown relationship types drop the whole relationship
/// - names and aliases are lowercased and trimmed; empty names drop the record
/// - confidence is clamped to [0, 1], defaulting to 0.7
pub fn validate_extraction(raw: RawExtraction) -> ExtractionResult {
    let category = raw
        .category
        .as_deref()
        .and_then(MemoryCategory::parse)
        .filter(|c| *c != MemoryCategory::Core);

    let mut entities = Vec::with_capacity(raw.entities.len());
    for e in raw.entities {
        let name = e.name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        let etype = e
            .etype
            .as_deref()
            .and_then(EntityType::parse)
            .unwrap_or(EntityType::Concept);
        let aliases = e
            .aliases
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty() && *a != name)
            .collect();
        entities.push(EntityInput {
            name,
            etype,
            aliases,
            description: e.description.filter(|d| !d.trim().is_empty()),
        });
    }

    let mut relationships = Vec::with_capacity(raw.relationships.len());
    for r in raw.relationships {
        let Some(rtype) = RelationType::parse(&r.rtype) else {
            debug!(rtype = %r.rtype, "unknown relationship type, dropping");
            continue;
        };
        let source = r.source.trim().to_lowercase();
        let target = r.target.trim().to_lowercase();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        relationships.push(RelationInput {
            source,
            target,
            rtype,
            confidence: r.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
        });
    }

    let mut tags = Vec::with_capacity(raw.tags.len());
    for t in raw.tags {
        let name = t.name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        tags.push(TagInput {
            name,
            category: t
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "topic".into()),
        });
    }

    ExtractionResult { category, entities, relationships, tags }
}

/// Pull a JSON object out of LLM output that may be wrapped in markdown
/// fences or prose.
pub fn unwrap_json_object(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Extract entities, relationships, tags, and a category from one memory.
///
/// Returns `(result, transient)`: `(None, true)` for retryable LLM failures,
/// `(None, false)` for permanent ones (including unparseable JSON) and for
/// disabled config.
pub async fn extract_entities(
    cfg: &LlmConfig,
    text: &str,
    cancel: &CancellationToken,
) -> (Option<ExtractionResult>, bool) {
    if !cfg.enabled {
        return (None, false);
    }

    let raw = match llm::chat_stream(cfg, prompts::EXTRACT_SYSTEM, text, cancel).await {
        Ok(r) => r,
        Err(e) => {
            let transient = e.is_transient();
            warn!(error = %e, transient, "entity extraction call failed");
            return (None, transient);
        }
    };

    match serde_json::from_str::<RawExtraction>(unwrap_json_object(&raw)) {
        Ok(parsed) => (Some(validate_extraction(parsed)), false),
        Err(e) => {
            warn!(error = %e, "extraction JSON unparseable");
            (None, false)
        }
    }
}

/// Rate a memory's long-term importance on the 1-10 rubric, mapped into
/// [0.1, 1.0]. Any failure (or disabled config) yields the neutral 0.5.
pub async fn rate_importance(cfg: &LlmConfig, text: &str) -> f64 {
    if !cfg.enabled {
        return IMPORTANCE_DEFAULT;
    }
    match llm::chat(cfg, prompts::IMPORTANCE_SYSTEM, text).await {
        Ok(raw) => parse_importance(&raw).unwrap_or(IMPORTANCE_DEFAULT),
        Err(e) => {
            warn!(error = %e, "importance rating failed, using default");
            IMPORTANCE_DEFAULT
        }
    }
}

fn parse_importance(raw: &str) -> Option<f64> {
    let score: f64 = raw
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .find(|s| !s.is_empty())?
        .parse()
        .ok()?;
    Some((score / 10.0).clamp(IMPORTANCE_MIN, IMPORTANCE_MAX))
}

/// LLM-judged duplicate test with a vector fast path: a pair below the
/// cosine pre-screen is distinct without a call. Fails open (false) so an
/// unreachable LLM never blocks storage.
pub async fn is_semantic_duplicate(
    cfg: &LlmConfig,
    new_text: &str,
    existing_text: &str,
    vector_sim: Option<f64>,
    cancel: &CancellationToken,
) -> bool {
    if let Some(sim) = vector_sim {
        if sim < SEMANTIC_DUP_FAST_PATH {
            return false;
        }
    }
    if !cfg.enabled {
        return false;
    }

    #[derive(Deserialize)]
    struct Verdict {
        verdict: String,
    }

    let user = format!("NEW:\n{new_text}\n\nEXISTING:\n{existing_text}");
    match llm::chat_stream(cfg, prompts::DUPLICATE_SYSTEM, &user, cancel).await {
        Ok(raw) => serde_json::from_str::<Verdict>(unwrap_json_object(&raw))
            .map(|v| v.verdict == "duplicate")
            .unwrap_or(false),
        Err(e) => {
            warn!(error = %e, "duplicate check failed, keeping both");
            false
        }
    }
}

/// Ask which of two potentially contradictory memories to keep. Fails safe
/// to `Skip`: both survive when the oracle is unavailable or unclear.
pub async fn resolve_conflict(
    cfg: &LlmConfig,
    text_a: &str,
    text_b: &str,
    cancel: &CancellationToken,
) -> ConflictChoice {
    if !cfg.enabled {
        return ConflictChoice::Skip;
    }

    #[derive(Deserialize)]
    struct Keep {
        keep: String,
    }

    let user = format!("A:\n{text_a}\n\nB:\n{text_b}");
    match llm::chat_stream(cfg, prompts::CONFLICT_SYSTEM, &user, cancel).await {
        Ok(raw) => match serde_json::from_str::<Keep>(unwrap_json_object(&raw)) {
            Ok(k) => match k.keep.as_str() {
                "a" => ConflictChoice::KeepA,
                "b" => ConflictChoice::KeepB,
                "both" => ConflictChoice::Both,
                _ => ConflictChoice::Skip,
            },
            Err(e) => {
                warn!(error = %e, "conflict verdict unparseable, skipping");
                ConflictChoice::Skip
            }
        },
        Err(e) => {
            warn!(error = %e, "conflict resolution failed, skipping");
            ConflictChoice::Skip
        }
    }
}
