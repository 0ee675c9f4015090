//! Long-term memory graph storage (SQLite).
//!
//! Mutations take an explicit connection so consolidation can apply a whole
//! batch inside one transaction; reads go through the pool.

use crate::error::Result;
use crate::memory::types::{
    parse_edge_type, parse_ltm_kind, parse_node_type, LongTermMemory, MemoryEdge, MemoryNode,
};
use anyhow::Context as _;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

/// Graph store for nodes, edges, and long-term memories.
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the graph tables if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_nodes (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                node_type TEXT NOT NULL,
                embedded INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create memory_nodes table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_edges (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                discovered INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create memory_edges table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS long_term_memories (
                id TEXT PRIMARY KEY,
                subject_node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                node_ids TEXT NOT NULL DEFAULT '[]',
                edge_ids TEXT NOT NULL DEFAULT '[]',
                importance REAL NOT NULL DEFAULT 0.5,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                decay_factor REAL NOT NULL DEFAULT 0.95,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create long_term_memories table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_source ON memory_edges(source_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_edges(target_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ltm_subject ON long_term_memories(subject_node_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // -- Nodes -----------------------------------------------------------

    pub async fn upsert_node(conn: &mut SqliteConnection, node: &MemoryNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_nodes (id, content, node_type, embedded, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                node_type = excluded.node_type,
                embedded = excluded.embedded
            "#,
        )
        .bind(&node.id)
        .bind(&node.content)
        .bind(node.node_type.to_string())
        .bind(node.embedded)
        .bind(node.created_at)
        .execute(conn)
        .await
        .with_context(|| format!("failed to upsert node {}", node.id))?;
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        let row = sqlx::query(
            "SELECT id, content, node_type, embedded, created_at FROM memory_nodes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load node {id}"))?;
        Ok(row.map(|row| row_to_node(&row)))
    }

    pub async fn node_by_content(
        &self,
        content: &str,
        node_type: Option<&str>,
    ) -> Result<Option<MemoryNode>> {
        let row = match node_type {
            Some(node_type) => {
                sqlx::query(
                    "SELECT id, content, node_type, embedded, created_at FROM memory_nodes \
                     WHERE content = ? AND node_type = ? LIMIT 1",
                )
                .bind(content)
                .bind(node_type)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, content, node_type, embedded, created_at FROM memory_nodes \
                     WHERE content = ? LIMIT 1",
                )
                .bind(content)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("failed to look up node by content")?;
        Ok(row.map(|row| row_to_node(&row)))
    }

    pub async fn delete_node(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memory_edges WHERE source_id = ? OR target_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to delete edges of node {id}"))?;
        sqlx::query("DELETE FROM memory_nodes WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .with_context(|| format!("failed to delete node {id}"))?;
        Ok(())
    }

    pub async fn mark_node_embedded(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE memory_nodes SET embedded = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark node {id} embedded"))?;
        Ok(())
    }

    pub async fn unembedded_nodes(&self, limit: i64) -> Result<Vec<MemoryNode>> {
        let rows = sqlx::query(
            "SELECT id, content, node_type, embedded, created_at FROM memory_nodes \
             WHERE embedded = 0 LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load unembedded nodes")?;
        Ok(rows.iter().map(row_to_node).collect())
    }

    // -- Edges -----------------------------------------------------------

    pub async fn upsert_edge(conn: &mut SqliteConnection, edge: &MemoryEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_edges
                (id, source_id, target_id, relation, edge_type, importance, discovered, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                relation = excluded.relation,
                importance = excluded.importance
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.source_id)
        .bind(&edge.target_id)
        .bind(&edge.relation)
        .bind(edge.edge_type.to_string())
        .bind(edge.importance)
        .bind(edge.discovered)
        .bind(edge.created_at)
        .execute(conn)
        .await
        .with_context(|| format!("failed to upsert edge {}", edge.id))?;
        Ok(())
    }

    pub async fn get_edge(&self, id: &str) -> Result<Option<MemoryEdge>> {
        let row = sqlx::query(
            "SELECT id, source_id, target_id, relation, edge_type, importance, discovered, \
             created_at FROM memory_edges WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load edge {id}"))?;
        Ok(row.map(|row| row_to_edge(&row)))
    }

    pub async fn delete_edge(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memory_edges WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .with_context(|| format!("failed to delete edge {id}"))?;
        Ok(())
    }

    /// All edges touching an id (node or memory), both directions.
    pub async fn edges_touching(&self, id: &str) -> Result<Vec<MemoryEdge>> {
        let rows = sqlx::query(
            "SELECT id, source_id, target_id, relation, edge_type, importance, discovered, \
             created_at FROM memory_edges WHERE source_id = ? OR target_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load edges touching {id}"))?;
        Ok(rows.iter().map(row_to_edge).collect())
    }

    /// Whether an edge with this endpoint pair and type already exists.
    pub async fn edge_exists(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM memory_edges WHERE source_id = ? AND target_id = ? AND edge_type = ? \
             LIMIT 1",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(edge_type)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check edge existence")?;
        Ok(row.is_some())
    }

    // -- Long-term memories ---------------------------------------------

    pub async fn upsert_memory(conn: &mut SqliteConnection, memory: &LongTermMemory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO long_term_memories
                (id, subject_node_id, kind, node_ids, edge_ids, importance, access_count,
                 last_accessed, decay_factor, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                subject_node_id = excluded.subject_node_id,
                kind = excluded.kind,
                node_ids = excluded.node_ids,
                edge_ids = excluded.edge_ids,
                importance = excluded.importance,
                access_count = excluded.access_count,
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(&memory.id)
        .bind(&memory.subject_node_id)
        .bind(memory.kind.to_string())
        .bind(serde_json::to_string(&memory.node_ids).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&memory.edge_ids).unwrap_or_else(|_| "[]".into()))
        .bind(memory.importance)
        .bind(memory.access_count)
        .bind(memory.last_accessed)
        .bind(memory.decay_factor)
        .bind(memory.created_at)
        .execute(conn)
        .await
        .with_context(|| format!("failed to upsert memory {}", memory.id))?;
        Ok(())
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<LongTermMemory>> {
        let row = sqlx::query(&format!("{LTM_SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load memory {id}"))?;
        Ok(row.map(|row| row_to_memory(&row)))
    }

    /// Transaction-local read, seeing uncommitted writes of the same batch.
    pub async fn get_memory_on(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<LongTermMemory>> {
        let row = sqlx::query(&format!("{LTM_SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await
            .with_context(|| format!("failed to load memory {id}"))?;
        Ok(row.map(|row| row_to_memory(&row)))
    }

    pub async fn delete_memory(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM long_term_memories WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .with_context(|| format!("failed to delete memory {id}"))?;
        Ok(())
    }

    /// Memories whose member or subject nodes include `node_id`.
    pub async fn memories_for_node(&self, node_id: &str) -> Result<Vec<LongTermMemory>> {
        let pattern = format!("%\"{node_id}\"%");
        let rows = sqlx::query(&format!(
            "{LTM_SELECT} WHERE subject_node_id = ? OR node_ids LIKE ?"
        ))
        .bind(node_id)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load memories for node {node_id}"))?;
        Ok(rows.iter().map(row_to_memory).collect())
    }

    pub async fn record_access(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE long_term_memories SET last_accessed = ?, access_count = access_count + 1 \
             WHERE id = ?",
        )
        .bind(chrono::Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record access for memory {id}"))?;
        Ok(())
    }

    /// Apply the slow long-term decay to every memory.
    pub async fn decay_all(&self, factor: f32) -> Result<u64> {
        let result = sqlx::query("UPDATE long_term_memories SET importance = importance * ?")
            .bind(factor)
            .execute(&self.pool)
            .await
            .context("failed to decay long-term memories")?;
        Ok(result.rows_affected())
    }

    /// Memories consolidated since `since`, newest first.
    pub async fn recent_memories(
        &self,
        since: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<Vec<LongTermMemory>> {
        let rows = sqlx::query(&format!(
            "{LTM_SELECT} WHERE created_at >= ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent memories")?;
        Ok(rows.iter().map(row_to_memory).collect())
    }

    pub async fn memory_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM long_term_memories")
            .fetch_one(&self.pool)
            .await
            .context("failed to count memories")?;
        Ok(row.try_get("n").unwrap_or(0))
    }
}

const LTM_SELECT: &str = "SELECT id, subject_node_id, kind, node_ids, edge_ids, importance, \
                          access_count, last_accessed, decay_factor, created_at \
                          FROM long_term_memories";

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> MemoryNode {
    let node_type: String = row.try_get("node_type").unwrap_or_default();
    MemoryNode {
        id: row.try_get("id").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        node_type: parse_node_type(&node_type),
        embedded: row.try_get("embedded").unwrap_or(false),
        created_at: row.try_get("created_at").unwrap_or_else(|_| chrono::Utc::now()),
    }
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> MemoryEdge {
    let edge_type: String = row.try_get("edge_type").unwrap_or_default();
    MemoryEdge {
        id: row.try_get("id").unwrap_or_default(),
        source_id: row.try_get("source_id").unwrap_or_default(),
        target_id: row.try_get("target_id").unwrap_or_default(),
        relation: row.try_get("relation").unwrap_or_default(),
        edge_type: parse_edge_type(&edge_type),
        importance: row.try_get("importance").unwrap_or(0.5),
        discovered: row.try_get("discovered").unwrap_or(false),
        created_at: row.try_get("created_at").unwrap_or_else(|_| chrono::Utc::now()),
    }
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> LongTermMemory {
    let kind: String = row.try_get("kind").unwrap_or_default();
    let node_ids: String = row.try_get("node_ids").unwrap_or_else(|_| "[]".into());
    let edge_ids: String = row.try_get("edge_ids").unwrap_or_else(|_| "[]".into());
    LongTermMemory {
        id: row.try_get("id").unwrap_or_default(),
        subject_node_id: row.try_get("subject_node_id").unwrap_or_default(),
        kind: parse_ltm_kind(&kind),
        node_ids: serde_json::from_str(&node_ids).unwrap_or_default(),
        edge_ids: serde_json::from_str(&edge_ids).unwrap_or_default(),
        importance: row.try_get("importance").unwrap_or(0.5),
        access_count: row.try_get("access_count").unwrap_or(0),
        last_accessed: row.try_get("last_accessed").unwrap_or_else(|_| chrono::Utc::now()),
        decay_factor: row.try_get("decay_factor").unwrap_or(0.95),
        created_at: row.try_get("created_at").unwrap_or_else(|_| chrono::Utc::now()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    pub(crate) async fn store() -> Arc<GraphStore> {
        let store = GraphStore::new(memory_pool().await);
        store.initialize().await.unwrap();
        store
    }
}
