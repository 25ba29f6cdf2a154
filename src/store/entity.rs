//! Entity and tag writes.
//!
//! `batch_entity_operations` is the single write path for extraction
//! artefacts: one transaction merges entities by (name, type), links
//! mentions, merges inter-entity edges, merges tags, sets the memory's
//! category, and flips extraction to `complete`. Either all of it lands or
//! none of it does.

use rusqlite::params;
use uuid::Uuid;

use super::*;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityInput {
    pub name: String,
    pub etype: EntityType,
    pub aliases: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationInput {
    pub source: String,
    pub target: String,
    pub rtype: RelationType,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagInput {
    pub name: String,
    pub category: String,
}

impl GraphStore {
    /// Apply one memory's extraction artefacts atomically.
    ///
    /// Re-running with the same inputs is idempotent: MERGE semantics on
    /// (name, type) for entities, on name for tags, and INSERT OR IGNORE on
    /// all edges. The memory's category is set unless it has been promoted
    /// to core in the meantime; the tier outranks the extractor.
    pub fn batch_entity_operations(
        &self,
        memory_id: &str,
        entities: &[EntityInput],
        relationships: &[RelationInput],
        tags: &[TagInput],
        category: Option<MemoryCategory>,
    ) -> Result<(), CortexError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), CortexError> {
            let now = now_ms();

            for e in entities {
                let aliases_json =
                    serde_json::to_string(&e.aliases).unwrap_or_else(|_| "[]".into());
                conn.execute(
                    "INSERT INTO entities (id, name, etype, aliases, description, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(name, etype) DO UPDATE SET \
                       description = COALESCE(description, excluded.description), \
                       aliases = CASE WHEN aliases = '[]' THEN excluded.aliases ELSE aliases END",
                    params![
                        Uuid::new_v4().to_string(),
                        e.name,
                        e.etype.as_str(),
                        aliases_json,
                        e.description,
                        now
                    ],
                )?;
                let entity_id: String = conn.query_row(
                    "SELECT id FROM entities WHERE name = ?1 AND etype = ?2",
                    params![e.name, e.etype.as_str()],
                    |r| r.get(0),
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO mentions (memory_id, entity_id) VALUES (?1, ?2)",
                    params![memory_id, entity_id],
                )?;
            }

            for r in relationships {
                // Endpoints are resolved by name; the extractor guarantees
                // they appear in the entities list, but a merged store may
                // already know them under another type.
                let source: Option<String> = conn
                    .query_row(
                        "SELECT id FROM entities WHERE name = ?1 LIMIT 1",
                        params![r.source],
                        |row| row.get(0),
                    )
                    .ok();
                let target: Option<String> = conn
                    .query_row(
                        "SELECT id FROM entities WHERE name = ?1 LIMIT 1",
                        params![r.target],
                        |row| row.get(0),
                    )
                    .ok();
                let (Some(source), Some(target)) = (source, target) else {
                    tracing::debug!(
                        source = %r.source, target = %r.target,
                        "relationship endpoint not found, skipping"
                    );
                    continue;
                };
                conn.execute(
                    "INSERT INTO entity_edges (source_id, target_id, rel_type, confidence) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(source_id, target_id, rel_type) DO UPDATE SET \
                       confidence = MAX(confidence, excluded.confidence)",
                    params![source, target, r.rtype.as_str(), r.confidence],
                )?;
            }

            for t in tags {
                conn.execute(
                    "INSERT INTO tags (name, category, created_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(name) DO NOTHING",
                    params![t.name, t.category, now],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO tagged (memory_id, tag_name) VALUES (?1, ?2)",
                    params![memory_id, t.name],
                )?;
            }

            if let Some(cat) = category {
                conn.execute(
                    "UPDATE memories SET category = ?2 WHERE id = ?1 AND category != 'core'",
                    params![memory_id, cat.as_str()],
                )?;
            }

            conn.execute(
                "UPDATE memories SET extraction_status = 'complete' \
                 WHERE id = ?1 AND extraction_status = 'pending'",
                params![memory_id],
            )?;

            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Entity names mentioned by a memory. Test and debugging aid.
    pub fn mentioned_entities(&self, memory_id: &str) -> Result<Vec<String>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.name FROM mentions m JOIN entities e ON e.id = m.entity_id \
             WHERE m.memory_id = ?1 ORDER BY e.name",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn memory_tags(&self, memory_id: &str) -> Result<Vec<String>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tag_name FROM tagged WHERE memory_id = ?1 ORDER BY tag_name",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Entities no memory mentions any more.
    pub fn find_orphan_entities(&self) -> Result<Vec<String>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM entities WHERE id NOT IN (SELECT entity_id FROM mentions)",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_orphan_entities(&self) -> Result<usize, CortexError> {
        let n = self.conn()?.execute(
            "DELETE FROM entities WHERE id NOT IN (SELECT entity_id FROM mentions)",
            [],
        )?;
        Ok(n)
    }

    /// Tags no memory carries any more.
    pub fn find_orphan_tags(&self) -> Result<Vec<String>, CortexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM tags WHERE name NOT IN (SELECT tag_name FROM tagged)",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_orphan_tags(&self) -> Result<usize, CortexError> {
        let n = self.conn()?.execute(
            "DELETE FROM tags WHERE name NOT IN (SELECT tag_name FROM tagged)",
            [],
        )?;
        Ok(n)
    }
}
