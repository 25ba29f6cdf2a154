//! SQLite-backed graph store: Memory, Entity, and Tag nodes with
//! MENTIONS / TAGGED / inter-entity edges kept in relation tables.
//!
//! All mutation goes through this interface; multi-row writes run inside a
//! single transaction so concurrent extraction and consolidation can never
//! observe a half-linked memory.

mod cluster;
mod embedding;
mod entity;
mod memory;

pub use cluster::{pair_key, ConflictPair, DuplicateCluster, MergeOutcome};
pub use embedding::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};
pub use entity::{EntityInput, RelationInput, TagInput};
pub use memory::{
    calculate_pareto_threshold, DecayCurve, DecayParams, MemoryInput, PendingExtraction,
    ScoredMemory, StatusCounts,
};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::CortexError;

const MAX_CONTENT_LEN: usize = 8192;

/// Set busy_timeout and foreign_keys on every connection handed out by the
/// pool. Cascading deletes depend on foreign_keys being on per-connection.
#[derive(Debug)]
struct ConnCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for ConnCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Content classification. `Core` is a retention tier rather than a content
/// category: it overrides whatever the extractor decided and exempts the
/// memory from decay and demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Preference,
    Fact,
    Decision,
    Entity,
    Other,
    Core,
}

impl MemoryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Entity => "entity",
            Self::Other => "other",
            Self::Core => "core",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preference" => Some(Self::Preference),
            "fact" => Some(Self::Fact),
            "decision" => Some(Self::Decision),
            "entity" => Some(Self::Entity),
            "other" => Some(Self::Other),
            "core" => Some(Self::Core),
            _ => None,
        }
    }
}

/// Lifecycle of LLM enrichment. Transitions are one-way: `Pending` may move
/// to any terminal state; terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Complete,
    Failed,
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Concept,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Event => "event",
            Self::Concept => "concept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(Self::Person),
            "organization" => Some(Self::Organization),
            "location" => Some(Self::Location),
            "event" => Some(Self::Event),
            "concept" => Some(Self::Concept),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    WorksAt,
    LivesAt,
    Knows,
    MarriedTo,
    Prefers,
    Decided,
    RelatedTo,
}

impl RelationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorksAt => "WORKS_AT",
            Self::LivesAt => "LIVES_AT",
            Self::Knows => "KNOWS",
            Self::MarriedTo => "MARRIED_TO",
            Self::Prefers => "PREFERS",
            Self::Decided => "DECIDED",
            Self::RelatedTo => "RELATED_TO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WORKS_AT" => Some(Self::WorksAt),
            "LIVES_AT" => Some(Self::LivesAt),
            "KNOWS" => Some(Self::Knows),
            "MARRIED_TO" => Some(Self::MarriedTo),
            "PREFERS" => Some(Self::Prefers),
            "DECIDED" => Some(Self::Decided),
            "RELATED_TO" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: f64,
    pub created_at: i64,
    pub last_accessed: i64,
    pub retrieval_count: i64,
    pub extraction_status: ExtractionStatus,
    pub extraction_retries: i64,
    pub user_pinned: bool,
    pub invalidated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Memory {
    pub fn age_days(&self, now: i64) -> f64 {
        ((now - self.created_at).max(0)) as f64 / 86_400_000.0
    }
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub invalidated: usize,
    pub core: usize,
    pub entities: usize,
    pub tags: usize,
    pub extraction: StatusCounts,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'other',
    importance REAL NOT NULL DEFAULT 0.5,
    created_at INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    extraction_status TEXT NOT NULL DEFAULT 'pending',
    extraction_retries INTEGER NOT NULL DEFAULT 0,
    user_pinned INTEGER NOT NULL DEFAULT 0,
    invalidated INTEGER NOT NULL DEFAULT 0,
    agent_id TEXT,
    embedding BLOB
);
CREATE INDEX IF NOT EXISTS idx_mem_status ON memories(extraction_status);
CREATE INDEX IF NOT EXISTS idx_mem_invalidated ON memories(invalidated);
CREATE INDEX IF NOT EXISTS idx_mem_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_mem_agent ON memories(agent_id);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    etype TEXT NOT NULL,
    aliases TEXT NOT NULL DEFAULT '[]',
    description TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(name, etype)
);

CREATE TABLE IF NOT EXISTS tags (
    name TEXT PRIMARY KEY,
    category TEXT NOT NULL DEFAULT 'topic',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mentions (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions(entity_id);

CREATE TABLE IF NOT EXISTS tagged (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag_name TEXT NOT NULL REFERENCES tags(name) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, tag_name)
);
CREATE INDEX IF NOT EXISTS idx_tagged_tag ON tagged(tag_name);

CREATE TABLE IF NOT EXISTS entity_edges (
    source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    rel_type TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.7,
    PRIMARY KEY (source_id, target_id, rel_type)
);

CREATE TABLE IF NOT EXISTS cortex_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// The graph store. Shared across the API, background extraction, and the
/// sleep cycle via `Arc`.
pub struct GraphStore {
    pool: Pool<SqliteConnectionManager>,
}

impl GraphStore {
    pub(crate) fn conn(&self) -> Result<PooledConn, CortexError> {
        self.pool.get().map_err(|e| CortexError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, CortexError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each open gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(ConnCustomizer))
            .build(manager)
            .map_err(|e| CortexError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| CortexError::Internal(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA auto_vacuum=INCREMENTAL;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self { pool })
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM cortex_meta WHERE key = ?1", [key], |r| r.get(0)).ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), CortexError> {
        let c = self.conn()?;
        c.execute(
            "INSERT OR REPLACE INTO cortex_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, CortexError> {
        let c = self.conn()?;
        let total: usize = c.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        let invalidated: usize =
            c.query_row("SELECT COUNT(*) FROM memories WHERE invalidated = 1", [], |r| r.get(0))?;
        let core: usize = c.query_row(
            "SELECT COUNT(*) FROM memories WHERE category = 'core' AND invalidated = 0",
            [],
            |r| r.get(0),
        )?;
        let entities: usize = c.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
        let tags: usize = c.query_row("SELECT COUNT(*) FROM tags", [], |r| r.get(0))?;
        drop(c);
        Ok(StoreStats {
            total,
            invalidated,
            core,
            entities,
            tags,
            extraction: self.count_by_extraction_status(None)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_memory(row: &rusqlite::Row, include_embedding: bool) -> rusqlite::Result<Memory> {
    let category: String = row.get("category")?;
    let status: String = row.get("extraction_status")?;
    let embedding = if include_embedding {
        let blob: Option<Vec<u8>> = row.get("embedding").ok();
        blob.map(|b| bytes_to_embedding(&b))
    } else {
        None
    };
    Ok(Memory {
        id: row.get("id")?,
        content: row.get("content")?,
        category: MemoryCategory::parse(&category).unwrap_or(MemoryCategory::Other),
        importance: row.get("importance")?,
        created_at: row.get("created_at")?,
        last_accessed: row.get("last_accessed")?,
        retrieval_count: row.get("retrieval_count")?,
        extraction_status: ExtractionStatus::parse(&status).unwrap_or(ExtractionStatus::Pending),
        extraction_retries: row.get("extraction_retries")?,
        user_pinned: row.get::<_, i64>("user_pinned")? != 0,
        invalidated: row.get::<_, i64>("invalidated")? != 0,
        agent_id: row.get("agent_id")?,
        embedding,
    })
}
