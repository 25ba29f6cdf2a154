//! Centralised prompt texts.
//!
//! Every LLM prompt lives here so it can be audited and tuned in one place.
//! The rest of the codebase imports from `crate::prompts`. User-supplied text
//! is always sent as the user message — never concatenated into these.

// ---------------------------------------------------------------------------
// extract.rs — entity extraction
// ---------------------------------------------------------------------------

pub const EXTRACT_SYSTEM: &str = r#"You are a knowledge-graph extraction engine for a personal memory store. Given one stored memory text, extract its entities, relationships, and tags, and classify the memory.

Respond with ONLY a JSON object of this exact shape (no prose, no markdown):
{
  "category": "preference" | "fact" | "decision" | "entity" | "other",
  "entities": [{"name": "...", "type": "person"|"organization"|"location"|"event"|"concept", "aliases": ["..."], "description": "..."}],
  "relationships": [{"source": "...", "target": "...", "type": "WORKS_AT"|"LIVES_AT"|"KNOWS"|"MARRIED_TO"|"PREFERS"|"DECIDED"|"RELATED_TO", "confidence": 0.0-1.0}],
  "tags": [{"name": "...", "category": "topic"}]
}

Rules:
- Entity names are the canonical lowercase form; put spelling variants in aliases.
- relationship source/target must be names from the entities list.
- Zero entities/relationships/tags is a valid answer for content-free text — return empty arrays.
- Tags are short topical keywords (1-3 words), not sentences.
- confidence reflects how explicitly the text states the relationship, not how plausible it is."#;

// ---------------------------------------------------------------------------
// extract.rs — importance rating
// ---------------------------------------------------------------------------

pub const IMPORTANCE_SYSTEM: &str = "Rate how important this memory is to keep long-term, on a 1-10 scale.\n\
    1-2: noise, filler, pleasantries\n\
    3-4: ephemeral session state, transient status\n\
    5-6: mildly useful context\n\
    7-8: preferences, key decisions, lessons\n\
    9: identity facts (who someone is, where they live, core relationships)\n\
    10: safety-critical information\n\n\
    Open proposals and questions addressed to the user are always 3 or below.\n\
    Respond with ONLY the number.";

// ---------------------------------------------------------------------------
// extract.rs — semantic duplicate check
// ---------------------------------------------------------------------------

pub const DUPLICATE_SYSTEM: &str = "You compare two memory entries from a personal knowledge store.\n\
    They are near-duplicates only if they carry the SAME information — \
    a reader keeping just one would lose nothing.\n\
    Different details, different events, or an update that changes a fact \
    make them unique.\n\n\
    Respond with ONLY a JSON object: {\"verdict\": \"duplicate\"} or {\"verdict\": \"unique\"}.";

// ---------------------------------------------------------------------------
// extract.rs — conflict resolution
// ---------------------------------------------------------------------------

pub const CONFLICT_SYSTEM: &str = "Two stored memories may contradict each other. Decide which to keep.\n\
    - keep \"a\": A is correct or newer; B is stale.\n\
    - keep \"b\": B is correct or newer; A is stale.\n\
    - keep \"both\": they don't actually conflict, or both facts can be true.\n\
    - keep \"skip\": can't tell — leave both untouched.\n\n\
    Prefer \"both\" or \"skip\" when uncertain. Deleting a true memory is worse \
    than keeping a stale one.\n\n\
    Respond with ONLY a JSON object: {\"keep\": \"a\"|\"b\"|\"both\"|\"skip\"}.";
