//! Similarity clustering over stored embeddings: duplicate clusters for the
//! dedup phases, conflict candidates for LLM adjudication, and the
//! at-most-once cluster merge.

use rusqlite::params;
use std::collections::{HashMap, HashSet};

use super::*;
use crate::thresholds::{CONFLICT_MAX_SIM, CONFLICT_MIN_SIM};

/// Canonical unordered pair key: lexicographically smaller id first.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateCluster {
    pub memory_ids: Vec<String>,
    pub texts: Vec<String>,
    pub importances: Vec<f64>,
    /// Cosine similarity for every in-cluster pair, keyed by [`pair_key`].
    /// Present when the cluster query was asked for scores.
    pub similarities: Option<HashMap<String, f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub kept_id: String,
    pub deleted_count: usize,
}

#[derive(Debug, Clone)]
pub struct ConflictPair {
    pub id_a: String,
    pub text_a: String,
    pub id_b: String,
    pub text_b: String,
}

struct EmbeddedRow {
    id: String,
    content: String,
    importance: f64,
    agent_id: Option<String>,
    embedding: Vec<f32>,
}

/// Plain union-find over indices.
struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

impl GraphStore {
    fn load_embedded(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<EmbeddedRow>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, importance, agent_id, embedding FROM memories \
             WHERE invalidated = 0 AND embedding IS NOT NULL \
             AND (?1 IS NULL OR agent_id = ?1) ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                let blob: Vec<u8> = row.get(4)?;
                Ok(EmbeddedRow {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    importance: row.get(2)?,
                    agent_id: row.get(3)?,
                    embedding: bytes_to_embedding(&blob),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Connected components of the similarity graph: memories i and j are
    /// adjacent iff cosine(i, j) ≥ threshold, both live, same agent. Only
    /// components of two or more are returned.
    ///
    /// Cosine is not transitive, so a component may contain pairs below the
    /// threshold; `similarities` reports the real value for every pair so
    /// callers can decide per-pair.
    pub fn find_duplicate_clusters(
        &self,
        threshold: f64,
        agent_id: Option<&str>,
        with_scores: bool,
    ) -> Result<Vec<DuplicateCluster>, CortexError> {
        let rows = self.load_embedded(agent_id)?;
        let n = rows.len();
        if n < 2 {
            return Ok(vec![]);
        }

        let mut dsu = Dsu::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if rows[i].agent_id != rows[j].agent_id {
                    continue;
                }
                if cosine_similarity(&rows[i].embedding, &rows[j].embedding) >= threshold {
                    dsu.union(i, j);
                }
            }
        }

        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = dsu.find(i);
            components.entry(root).or_default().push(i);
        }

        let mut clusters = Vec::new();
        for members in components.into_values() {
            if members.len() < 2 {
                continue;
            }
            let similarities = with_scores.then(|| {
                let mut sims = HashMap::new();
                for (a, &i) in members.iter().enumerate() {
                    for &j in &members[(a + 1)..] {
                        sims.insert(
                            pair_key(&rows[i].id, &rows[j].id),
                            cosine_similarity(&rows[i].embedding, &rows[j].embedding),
                        );
                    }
                }
                sims
            });
            clusters.push(DuplicateCluster {
                memory_ids: members.iter().map(|&i| rows[i].id.clone()).collect(),
                texts: members.iter().map(|&i| rows[i].content.clone()).collect(),
                importances: members.iter().map(|&i| rows[i].importance).collect(),
                similarities,
            });
        }
        // Deterministic order for callers and tests
        clusters.sort_by(|a, b| a.memory_ids[0].cmp(&b.memory_ids[0]));
        Ok(clusters)
    }

    /// Collapse a duplicate cluster onto its best member.
    ///
    /// Winner: highest importance, ties broken by retrieval count then by
    /// age (oldest wins, it accumulated the history). MENTIONS and TAGGED
    /// edges migrate to the winner, retrieval counts sum, importance takes
    /// the max, and the rest are invalidated. Already-invalidated members
    /// are ignored, which makes re-invocation on the survivor a no-op.
    pub fn merge_memory_cluster(
        &self,
        ids: &[String],
        importances: &[f64],
    ) -> Result<MergeOutcome, CortexError> {
        if ids.is_empty() {
            return Err(CortexError::Validation("empty cluster".into()));
        }

        let conn = self.conn()?;
        // (id, importance, retrieval_count, created_at) for live members only
        let mut live: Vec<(String, f64, i64, i64)> = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let row = conn
                .query_row(
                    "SELECT importance, retrieval_count, created_at FROM memories \
                     WHERE id = ?1 AND invalidated = 0",
                    params![id],
                    |r| Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
                )
                .map(|(imp, rc, ca)| (id.clone(), importances.get(i).copied().unwrap_or(imp), rc, ca));
            if let Ok((id, imp, rc, ca)) = row {
                live.push((id, imp, rc, ca));
            }
        }

        if live.is_empty() {
            return Err(CortexError::NotFound);
        }
        if live.len() == 1 {
            return Ok(MergeOutcome { kept_id: live[0].0.clone(), deleted_count: 0 });
        }

        let winner = live
            .iter()
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
                    .then(b.3.cmp(&a.3)) // older creation wins the final tie
            })
            .expect("non-empty live set")
            .0
            .clone();

        let total_retrievals: i64 = live.iter().map(|m| m.2).sum();
        let max_importance = live.iter().map(|m| m.1).fold(f64::MIN, f64::max);

        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<usize, CortexError> {
            let mut deleted = 0;
            for (id, _, _, _) in &live {
                if *id == winner {
                    continue;
                }
                conn.execute(
                    "UPDATE OR IGNORE mentions SET memory_id = ?1 WHERE memory_id = ?2",
                    params![winner, id],
                )?;
                conn.execute("DELETE FROM mentions WHERE memory_id = ?1", params![id])?;
                conn.execute(
                    "UPDATE OR IGNORE tagged SET memory_id = ?1 WHERE memory_id = ?2",
                    params![winner, id],
                )?;
                conn.execute("DELETE FROM tagged WHERE memory_id = ?1", params![id])?;
                deleted += conn
                    .execute("UPDATE memories SET invalidated = 1 WHERE id = ?1", params![id])?;
            }
            conn.execute(
                "UPDATE memories SET retrieval_count = ?2, importance = ?3 WHERE id = ?1",
                params![winner, total_retrievals, max_importance],
            )?;
            Ok(deleted)
        })();
        match result {
            Ok(deleted_count) => {
                conn.execute_batch("COMMIT")?;
                Ok(MergeOutcome { kept_id: winner, deleted_count })
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Candidate pairs for conflict adjudication: similar enough to be about
    /// the same subject (but below the dedup window) and sharing at least
    /// one mentioned entity.
    pub fn find_conflicting_memories(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<ConflictPair>, CortexError> {
        let rows = self.load_embedded(agent_id)?;
        if rows.len() < 2 {
            return Ok(vec![]);
        }

        let mut mentions: HashMap<String, HashSet<String>> = HashMap::new();
        {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT memory_id, entity_id FROM mentions")?;
            let pairs = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (mid, eid) in pairs {
                mentions.entry(mid).or_default().insert(eid);
            }
        }

        let mut conflicts = Vec::new();
        for i in 0..rows.len() {
            let Some(ents_i) = mentions.get(&rows[i].id) else { continue };
            for j in (i + 1)..rows.len() {
                if rows[i].agent_id != rows[j].agent_id {
                    continue;
                }
                let Some(ents_j) = mentions.get(&rows[j].id) else { continue };
                if ents_i.is_disjoint(ents_j) {
                    continue;
                }
                let sim = cosine_similarity(&rows[i].embedding, &rows[j].embedding);
                if (CONFLICT_MIN_SIM..CONFLICT_MAX_SIM).contains(&sim) {
                    conflicts.push(ConflictPair {
                        id_a: rows[i].id.clone(),
                        text_a: rows[i].content.clone(),
                        id_b: rows[j].id.clone(),
                        text_b: rows[j].content.clone(),
                    });
                }
            }
        }
        Ok(conflicts)
    }
}
