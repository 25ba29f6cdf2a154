//! Memory CRUD, extraction-status transitions, scoring, decay, and pruning.

use rusqlite::params;
use std::collections::HashMap;
use uuid::Uuid;

use super::*;
use crate::thresholds::{IMPORTANCE_DEFAULT, IMPORTANCE_MAX, IMPORTANCE_MIN, RECENCY_HALF_LIFE_DAYS};

#[derive(Debug, Default)]
pub struct MemoryInput {
    pub content: String,
    pub embedding: Vec<f32>,
    pub importance: Option<f64>,
    pub category: Option<MemoryCategory>,
    pub agent_id: Option<String>,
    pub user_pinned: bool,
}

impl MemoryInput {
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            embedding,
            ..Default::default()
        }
    }

    pub fn importance(mut self, i: f64) -> Self {
        self.importance = Some(i);
        self
    }

    pub fn category(mut self, c: MemoryCategory) -> Self {
        self.category = Some(c);
        self
    }

    pub fn agent_id(mut self, a: impl Into<String>) -> Self {
        self.agent_id = Some(a.into());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.user_pinned = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub effective_score: f64,
    pub retrieval_count: i64,
    pub age_days: f64,
}

#[derive(Debug, Clone)]
pub struct PendingExtraction {
    pub id: String,
    pub content: String,
    pub extraction_retries: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct DecayCurve {
    pub half_life_days: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DecayParams {
    pub retention_threshold: f64,
    pub base_half_life_days: f64,
    pub importance_multiplier: f64,
    pub decay_curves: Option<HashMap<String, DecayCurve>>,
    pub agent_id: Option<String>,
}

/// `1 + log(1 + retrievals) × 0.3`: usage compounds sublinearly.
pub fn freq_boost(retrieval_count: i64) -> f64 {
    1.0 + (1.0 + retrieval_count as f64).ln() * 0.3
}

/// `2^(−days_since_access / 14)`: halves every two weeks untouched.
pub fn recency(last_accessed: i64, now: i64) -> f64 {
    let days = ((now - last_accessed).max(0)) as f64 / 86_400_000.0;
    (2.0f64).powf(-days / RECENCY_HALF_LIFE_DAYS)
}

/// The universal ranking scalar.
pub fn effective_score(importance: f64, retrieval_count: i64, last_accessed: i64, now: i64) -> f64 {
    importance * freq_boost(retrieval_count) * recency(last_accessed, now)
}

/// The value below which `pct` of the scores lie (within one element).
/// `pct = 0.8` yields the cut-off for the top 20%.
pub fn calculate_pareto_threshold(scores: &[f64], pct: f64) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64) * pct.clamp(0.0, 1.0)).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

impl GraphStore {
    /// Insert a gated memory. All memories start `pending` extraction.
    /// The first insert fixes the store's embedding dimension; later inserts
    /// must match it.
    pub fn insert_memory(&self, input: MemoryInput) -> Result<Memory, CortexError> {
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(CortexError::EmptyContent);
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(CortexError::ContentTooLong);
        }
        if input.embedding.is_empty() {
            return Err(CortexError::Validation("embedding must not be empty".into()));
        }
        match self.get_meta("embedding_dim").and_then(|v| v.parse::<usize>().ok()) {
            Some(dim) if dim != input.embedding.len() => {
                return Err(CortexError::EmbeddingDimension {
                    expected: dim,
                    got: input.embedding.len(),
                });
            }
            Some(_) => {}
            None => self.set_meta("embedding_dim", &input.embedding.len().to_string())?,
        }

        let now = now_ms();
        let id = Uuid::new_v4().to_string();
        let importance = input
            .importance
            .unwrap_or(IMPORTANCE_DEFAULT)
            .clamp(IMPORTANCE_MIN, IMPORTANCE_MAX);
        let category = input.category.unwrap_or(MemoryCategory::Other);

        self.conn()?.execute(
            "INSERT INTO memories \
             (id, content, category, importance, created_at, last_accessed, \
              retrieval_count, extraction_status, extraction_retries, user_pinned, invalidated, agent_id, embedding) \
             VALUES (?1,?2,?3,?4,?5,?6,0,'pending',0,?7,0,?8,?9)",
            params![
                id,
                content,
                category.as_str(),
                importance,
                now,
                now,
                input.user_pinned as i64,
                input.agent_id,
                embedding_to_bytes(&input.embedding),
            ],
        )?;

        Ok(Memory {
            id,
            content,
            category,
            importance,
            created_at: now,
            last_accessed: now,
            retrieval_count: 0,
            extraction_status: ExtractionStatus::Pending,
            extraction_retries: 0,
            user_pinned: input.user_pinned,
            invalidated: false,
            agent_id: input.agent_id,
            embedding: Some(input.embedding),
        })
    }

    /// Import fully-specified memories, timestamps and all. Backup restore
    /// and test fixtures; the normal ingest path is [`Self::insert_memory`].
    pub fn import_memories(&self, memories: &[Memory]) -> Result<usize, CortexError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let mut imported = 0;
        let result = (|| -> Result<(), CortexError> {
            for m in memories {
                let embedding = m.embedding.as_ref().map(|e| embedding_to_bytes(e));
                imported += conn.execute(
                    "INSERT OR IGNORE INTO memories \
                     (id, content, category, importance, created_at, last_accessed, \
                      retrieval_count, extraction_status, extraction_retries, user_pinned, invalidated, agent_id, embedding) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    params![
                        m.id,
                        m.content,
                        m.category.as_str(),
                        m.importance,
                        m.created_at,
                        m.last_accessed,
                        m.retrieval_count,
                        m.extraction_status.as_str(),
                        m.extraction_retries,
                        m.user_pinned as i64,
                        m.invalidated as i64,
                        m.agent_id,
                        embedding,
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(imported)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM memories WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row, true)?)),
            None => Ok(None),
        }
    }

    /// Record a retrieval: bump the counter and refresh last_accessed.
    pub fn touch_memory(&self, id: &str) -> Result<(), CortexError> {
        self.conn()?.execute(
            "UPDATE memories SET retrieval_count = retrieval_count + 1, last_accessed = ?2 \
             WHERE id = ?1",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    /// Advance a memory's extraction status. Only `pending` memories move;
    /// terminal states are immutable, and retries only ever increment;
    /// returns false when the transition was refused.
    pub fn update_extraction_status(
        &self,
        id: &str,
        status: ExtractionStatus,
        increment_retries: bool,
    ) -> Result<bool, CortexError> {
        let n = self.conn()?.execute(
            "UPDATE memories SET extraction_status = ?2, \
             extraction_retries = extraction_retries + ?3 \
             WHERE id = ?1 AND extraction_status = 'pending'",
            params![id, status.as_str(), increment_retries as i64],
        )?;
        Ok(n > 0)
    }

    /// Soft-delete: hides the memory from retrieval and from every later
    /// consolidation phase without reclaiming storage.
    pub fn invalidate_memory(&self, id: &str) -> Result<bool, CortexError> {
        let n = self
            .conn()?
            .execute("UPDATE memories SET invalidated = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn promote_to_core(&self, ids: &[String]) -> Result<usize, CortexError> {
        let conn = self.conn()?;
        let mut promoted = 0;
        for id in ids {
            promoted += conn.execute(
                "UPDATE memories SET category = 'core' WHERE id = ?1 AND invalidated = 0",
                params![id],
            )?;
        }
        Ok(promoted)
    }

    /// Effective score for every live memory. One pass; callers snapshot the
    /// result and accept staleness across later phases.
    pub fn calculate_all_effective_scores(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<ScoredMemory>, CortexError> {
        let now = now_ms();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, category, importance, created_at, last_accessed, retrieval_count \
             FROM memories WHERE invalidated = 0 AND (?1 IS NULL OR agent_id = ?1)",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                let category: String = row.get(2)?;
                let importance: f64 = row.get(3)?;
                let created_at: i64 = row.get(4)?;
                let last_accessed: i64 = row.get(5)?;
                let retrieval_count: i64 = row.get(6)?;
                Ok(ScoredMemory {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    category: MemoryCategory::parse(&category).unwrap_or(MemoryCategory::Other),
                    effective_score: effective_score(importance, retrieval_count, last_accessed, now),
                    retrieval_count,
                    age_days: ((now - created_at).max(0)) as f64 / 86_400_000.0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Core memories ranked by pure usage (`freq_boost × recency`); the
    /// importance term is deliberately absent here, unlike Pareto scoring.
    pub fn list_core_memories(&self, limit: usize) -> Result<Vec<Memory>, CortexError> {
        let now = now_ms();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE category = 'core' AND invalidated = 0",
        )?;
        let mut rows = stmt
            .query_map([], |row| row_to_memory(row, false))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| {
            let wa = freq_boost(a.retrieval_count) * recency(a.last_accessed, now);
            let wb = freq_boost(b.retrieval_count) * recency(b.last_accessed, now);
            wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit);
        Ok(rows)
    }

    /// Memories whose retained signal has dropped below the threshold.
    ///
    /// Half-life: `H = base × (1 + (importance − 0.5) × multiplier)`, with an
    /// optional per-category override. Decayed iff
    /// `importance × 2^(−age_days / H) < retention_threshold`.
    /// Core and user-pinned memories never decay.
    pub fn find_decayed_memories(&self, params: &DecayParams) -> Result<Vec<String>, CortexError> {
        let now = now_ms();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, importance, created_at FROM memories \
             WHERE invalidated = 0 AND user_pinned = 0 AND category != 'core' \
             AND (?1 IS NULL OR agent_id = ?1)",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![params.agent_id.as_deref()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut decayed = Vec::new();
        for (id, category, importance, created_at) in rows {
            let half_life = params
                .decay_curves
                .as_ref()
                .and_then(|curves| curves.get(&category))
                .map(|c| c.half_life_days)
                .unwrap_or_else(|| {
                    params.base_half_life_days
                        * (1.0 + (importance - 0.5) * params.importance_multiplier)
                })
                .max(0.1);
            let age_days = ((now - created_at).max(0)) as f64 / 86_400_000.0;
            let retained = importance * (2.0f64).powf(-age_days / half_life);
            if retained < params.retention_threshold {
                decayed.push(id);
            }
        }
        Ok(decayed)
    }

    /// Hard delete. Core and user-pinned memories are skipped even if listed.
    /// Returns how many rows were actually removed.
    pub fn prune_memories(&self, ids: &[String]) -> Result<usize, CortexError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<usize, CortexError> {
            let mut pruned = 0;
            for id in ids {
                pruned += conn.execute(
                    "DELETE FROM memories WHERE id = ?1 AND category != 'core' AND user_pinned = 0",
                    params![id],
                )?;
            }
            Ok(pruned)
        })();
        match result {
            Ok(n) => {
                conn.execute_batch("COMMIT")?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn list_pending_extractions(
        &self,
        limit: usize,
        agent_id: Option<&str>,
    ) -> Result<Vec<PendingExtraction>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, extraction_retries FROM memories \
             WHERE extraction_status = 'pending' AND invalidated = 0 \
             AND (?1 IS NULL OR agent_id = ?1) \
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![agent_id, limit as i64], |row| {
                Ok(PendingExtraction {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    extraction_retries: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_extraction_status(
        &self,
        agent_id: Option<&str>,
    ) -> Result<StatusCounts, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT extraction_status, COUNT(*) FROM memories \
             WHERE invalidated = 0 AND (?1 IS NULL OR agent_id = ?1) \
             GROUP BY extraction_status",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => counts.pending = n,
                "complete" => counts.complete = n,
                "failed" => counts.failed = n,
                "skipped" => counts.skipped = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Live memory texts for pattern-based cleanup: (id, content, category,
    /// user_pinned).
    pub fn list_active_texts(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<(String, String, MemoryCategory, bool)>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, category, user_pinned FROM memories \
             WHERE invalidated = 0 AND (?1 IS NULL OR agent_id = ?1)",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                let cat: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    MemoryCategory::parse(&cat).unwrap_or(MemoryCategory::Other),
                    row.get::<_, i64>(3)? != 0,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
