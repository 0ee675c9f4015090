//! Long-term graph engine: atomic application of model-emitted operations,
//! node deduplication, relation discovery, and the slow decay.

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::llm::{CompletionRequest, EmbeddingProvider, LanguageModel, VectorStore};
use crate::memory::prompts::MemoryPrompts;
use crate::memory::store::GraphStore;
use crate::memory::types::{
    parse_operations, EdgeType, GraphOperation, LongTermMemory, MemoryEdge, MemoryNode, NodeType,
    ShortTermMemory,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Vector collection holding topic/object node embeddings.
pub const GRAPH_COLLECTION: &str = "graph_nodes";

/// Unconditional-merge similarity for node dedup.
const DEDUP_HARD: f32 = 0.95;
/// Context-checked merge similarity for node dedup.
const DEDUP_SOFT: f32 = 0.85;

/// Importance assigned to discovered REFERENCE edges.
const REFERENCE_IMPORTANCE: f32 = 0.4;
const CAUSALITY_IMPORTANCE: f32 = 0.5;

/// Applies consolidation batches and background graph maintenance.
pub struct GraphEngine {
    store: Arc<GraphStore>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
    prompts: Arc<MemoryPrompts>,
    config: MemoryConfig,
}

impl GraphEngine {
    pub fn new(
        store: Arc<GraphStore>,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
        prompts: Arc<MemoryPrompts>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            vector,
            embedder,
            model,
            prompts,
            config,
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Consolidate one batch of short-term memories: prompt the model with
    /// the batch and graph neighbourhood, parse its operations, dedup new
    /// topic/object nodes, and apply everything in a single transaction.
    pub async fn consolidate_batch(&self, batch: &[ShortTermMemory]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let neighbourhood = self.describe_neighbourhood(batch).await?;
        let prompt = self
            .prompts
            .consolidation(batch, &neighbourhood)
            .map_err(|error| MemoryError::Consolidation(error.to_string()))?;

        let response = self
            .model
            .complete(CompletionRequest::new("default", prompt).with_temperature(0.2))
            .await
            .map_err(|error| MemoryError::Consolidation(error.to_string()))?;

        let (operations, rejected) = parse_operations(&response);
        if operations.is_empty() {
            return Err(MemoryError::Consolidation(format!(
                "no valid operations in response ({rejected} rejected)"
            ))
            .into());
        }

        self.apply_operations(operations).await
    }

    /// Apply a sequence of graph operations atomically. New topic/object
    /// nodes are deduplicated against the vector index before application;
    /// aliases rewrite every later reference in the sequence.
    pub async fn apply_operations(&self, operations: Vec<GraphOperation>) -> Result<()> {
        // Dedup pass: runs outside the transaction (embedding and vector
        // lookups are external calls).
        let (aliases, embeddings) = self.plan_dedup(&operations).await?;

        let mut created_nodes: Vec<(String, Vec<f32>)> = Vec::new();
        let mut deleted_nodes: Vec<String> = Vec::new();

        let mut tx = self.store.begin().await?;
        for operation in operations {
            self.apply_one(
                &mut tx,
                operation,
                &aliases,
                &embeddings,
                &mut created_nodes,
                &mut deleted_nodes,
            )
            .await
            .map_err(|error| MemoryError::Consolidation(error.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|error| MemoryError::Consolidation(format!("commit failed: {error}")))?;

        // Vector index updates happen only after the commit stands.
        for (id, vector) in created_nodes {
            if let Err(error) = self.vector.upsert(GRAPH_COLLECTION, &id, vector).await {
                tracing::warn!(node_id = %id, %error, "graph node vector upsert failed");
            } else {
                self.store.mark_node_embedded(&id).await.ok();
            }
        }
        for id in deleted_nodes {
            self.vector.remove(GRAPH_COLLECTION, &id).await.ok();
        }

        Ok(())
    }

    /// Decide which new nodes merge into existing ones and precompute
    /// embeddings for the survivors.
    async fn plan_dedup(
        &self,
        operations: &[GraphOperation],
    ) -> Result<(HashMap<String, String>, HashMap<String, Vec<f32>>)> {
        let mut aliases: HashMap<String, String> = HashMap::new();
        let mut embeddings: HashMap<String, Vec<f32>> = HashMap::new();

        // Relation labels each new node will carry, for the soft-merge
        // context check.
        let mut pending_labels: HashMap<String, HashSet<String>> = HashMap::new();
        for operation in operations {
            if let GraphOperation::CreateEdge {
                source_id,
                target_id,
                relation,
                ..
            } = operation
            {
                for endpoint in [source_id, target_id] {
                    pending_labels
                        .entry(endpoint.clone())
                        .or_default()
                        .insert(relation.clone());
                }
            }
        }

        for operation in operations {
            let (id, content, node_type) = match operation {
                GraphOperation::CreateNode {
                    id,
                    content,
                    node_type,
                } => (id, content, *node_type),
                GraphOperation::CreateSubgraph { nodes, .. } => {
                    for node in nodes {
                        if matches!(node.node_type, NodeType::Topic | NodeType::Object) {
                            self.dedup_one(
                                &node.id,
                                &node.content,
                                &pending_labels,
                                &mut aliases,
                                &mut embeddings,
                            )
                            .await?;
                        }
                    }
                    continue;
                }
                _ => continue,
            };

            if matches!(node_type, NodeType::Topic | NodeType::Object) {
                self.dedup_one(id, content, &pending_labels, &mut aliases, &mut embeddings)
                    .await?;
            }
        }

        Ok((aliases, embeddings))
    }

    async fn dedup_one(
        &self,
        id: &str,
        content: &str,
        pending_labels: &HashMap<String, HashSet<String>>,
        aliases: &mut HashMap<String, String>,
        embeddings: &mut HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        let embedding = match self.embedder.embed(content).await {
            Ok(embedding) => embedding,
            Err(error) => {
                // Unembedded nodes skip dedup; the reindex job picks them up.
                tracing::warn!(node_id = %id, %error, "node embedding failed, skipping dedup");
                return Ok(());
            }
        };

        let hits = self
            .vector
            .search(GRAPH_COLLECTION, &embedding, 3, DEDUP_SOFT)
            .await?;

        for hit in hits {
            if hit.id == id {
                continue;
            }
            if hit.score >= DEDUP_HARD {
                tracing::debug!(new = %id, existing = %hit.id, score = hit.score, "node dedup (hard)");
                aliases.insert(id.to_string(), hit.id);
                return Ok(());
            }
            if self.context_compatible(id, &hit.id, pending_labels).await? {
                tracing::debug!(new = %id, existing = %hit.id, score = hit.score, "node dedup (contextual)");
                aliases.insert(id.to_string(), hit.id);
                return Ok(());
            }
        }

        embeddings.insert(id.to_string(), embedding);
        Ok(())
    }

    /// Higher-order context check: the existing node's adjacent relation
    /// labels must overlap the labels the new node is about to carry (an
    /// edgeless existing node is compatible with anything).
    async fn context_compatible(
        &self,
        new_id: &str,
        existing_id: &str,
        pending_labels: &HashMap<String, HashSet<String>>,
    ) -> Result<bool> {
        let existing_edges = self.store.edges_touching(existing_id).await?;
        if existing_edges.is_empty() {
            return Ok(true);
        }
        let Some(new_labels) = pending_labels.get(new_id) else {
            return Ok(false);
        };
        Ok(existing_edges
            .iter()
            .any(|edge| new_labels.contains(&edge.relation)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_one(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        operation: GraphOperation,
        aliases: &HashMap<String, String>,
        embeddings: &HashMap<String, Vec<f32>>,
        created_nodes: &mut Vec<(String, Vec<f32>)>,
        deleted_nodes: &mut Vec<String>,
    ) -> Result<()> {
        let resolve = |id: &str| -> String {
            aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
        };

        match operation {
            GraphOperation::CreateNode {
                id,
                content,
                node_type,
            } => {
                if aliases.contains_key(&id) {
                    // Deduplicated into an existing node; nothing to insert.
                    return Ok(());
                }
                let embedded = embeddings.contains_key(&id);
                let node = MemoryNode {
                    id: id.clone(),
                    content,
                    node_type,
                    embedded,
                    created_at: chrono::Utc::now(),
                };
                GraphStore::upsert_node(tx, &node).await?;
                if let Some(vector) = embeddings.get(&id) {
                    created_nodes.push((id, vector.clone()));
                }
            }
            GraphOperation::UpdateNode { id, content } => {
                let id = resolve(&id);
                let Some(mut node) = Self::node_on(tx, &id).await? else {
                    return Err(MemoryError::NodeNotFound(id).into());
                };
                node.content = content;
                GraphStore::upsert_node(tx, &node).await?;
            }
            GraphOperation::DeleteNode { id } => {
                let id = resolve(&id);
                GraphStore::delete_node(tx, &id).await?;
                deleted_nodes.push(id);
            }
            GraphOperation::CreateEdge {
                id,
                source_id,
                target_id,
                relation,
                edge_type,
                importance,
            } => {
                let edge = MemoryEdge {
                    id,
                    source_id: resolve(&source_id),
                    target_id: resolve(&target_id),
                    relation,
                    edge_type,
                    importance: importance.clamp(0.0, 1.0),
                    discovered: false,
                    created_at: chrono::Utc::now(),
                };
                GraphStore::upsert_edge(tx, &edge).await?;
            }
            GraphOperation::UpdateEdge {
                id,
                relation,
                importance,
            } => {
                let Some(mut edge) = Self::edge_on(tx, &id).await? else {
                    return Err(MemoryError::InvalidOperation(format!("unknown edge {id}")).into());
                };
                if let Some(relation) = relation {
                    edge.relation = relation;
                }
                if let Some(importance) = importance {
                    edge.importance = importance.clamp(0.0, 1.0);
                }
                GraphStore::upsert_edge(tx, &edge).await?;
            }
            GraphOperation::DeleteEdge { id } => {
                GraphStore::delete_edge(tx, &id).await?;
            }
            GraphOperation::CreateMemory {
                id,
                kind,
                subject_node_id,
                node_ids,
                edge_ids,
                importance,
            } => {
                let memory = LongTermMemory {
                    id,
                    subject_node_id: resolve(&subject_node_id),
                    kind,
                    node_ids: node_ids.iter().map(|id| resolve(id)).collect(),
                    edge_ids,
                    importance: importance.clamp(0.0, 1.0),
                    access_count: 0,
                    last_accessed: chrono::Utc::now(),
                    decay_factor: self.config.long_term_decay_factor,
                    created_at: chrono::Utc::now(),
                };
                GraphStore::upsert_memory(tx, &memory).await?;
            }
            GraphOperation::UpdateMemory {
                id,
                importance,
                add_node_ids,
                add_edge_ids,
            } => {
                let Some(mut memory) = GraphStore::get_memory_on(tx, &id).await? else {
                    return Err(
                        MemoryError::InvalidOperation(format!("unknown memory {id}")).into(),
                    );
                };
                if let Some(importance) = importance {
                    memory.importance = importance.clamp(0.0, 1.0);
                }
                for node_id in add_node_ids {
                    let node_id = resolve(&node_id);
                    if !memory.node_ids.contains(&node_id) {
                        memory.node_ids.push(node_id);
                    }
                }
                for edge_id in add_edge_ids {
                    if !memory.edge_ids.contains(&edge_id) {
                        memory.edge_ids.push(edge_id);
                    }
                }
                GraphStore::upsert_memory(tx, &memory).await?;
            }
            GraphOperation::MergeMemories { keep_id, merge_ids } => {
                let Some(mut keep) = GraphStore::get_memory_on(tx, &keep_id).await? else {
                    return Err(
                        MemoryError::InvalidOperation(format!("unknown memory {keep_id}")).into(),
                    );
                };
                for merge_id in merge_ids {
                    let Some(merged) = GraphStore::get_memory_on(tx, &merge_id).await? else {
                        continue;
                    };
                    for node_id in merged.node_ids {
                        if !keep.node_ids.contains(&node_id) {
                            keep.node_ids.push(node_id);
                        }
                    }
                    for edge_id in merged.edge_ids {
                        if !keep.edge_ids.contains(&edge_id) {
                            keep.edge_ids.push(edge_id);
                        }
                    }
                    keep.importance = keep.importance.max(merged.importance);
                    keep.access_count += merged.access_count;
                    GraphStore::delete_memory(tx, &merge_id).await?;
                }
                GraphStore::upsert_memory(tx, &keep).await?;
            }
            GraphOperation::CreateSubgraph { nodes, edges } => {
                for node in nodes {
                    if aliases.contains_key(&node.id) {
                        continue;
                    }
                    let embedded = embeddings.contains_key(&node.id);
                    let record = MemoryNode {
                        id: node.id.clone(),
                        content: node.content,
                        node_type: node.node_type,
                        embedded,
                        created_at: chrono::Utc::now(),
                    };
                    GraphStore::upsert_node(tx, &record).await?;
                    if let Some(vector) = embeddings.get(&node.id) {
                        created_nodes.push((node.id, vector.clone()));
                    }
                }
                for edge in edges {
                    let record = MemoryEdge {
                        id: edge.id,
                        source_id: resolve(&edge.source_id),
                        target_id: resolve(&edge.target_id),
                        relation: edge.relation,
                        edge_type: edge.edge_type,
                        importance: edge.importance.clamp(0.0, 1.0),
                        discovered: false,
                        created_at: chrono::Utc::now(),
                    };
                    GraphStore::upsert_edge(tx, &record).await?;
                }
            }
            GraphOperation::QueryGraph { node_id } => {
                // Reads feed nothing mid-transaction; acknowledged and
                // skipped.
                tracing::debug!(node_id = %node_id, "QUERY_GRAPH op ignored during application");
            }
        }
        Ok(())
    }

    async fn node_on(
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        id: &str,
    ) -> Result<Option<MemoryNode>> {
        use sqlx::Row as _;
        let row = sqlx::query(
            "SELECT id, content, node_type, embedded, created_at FROM memory_nodes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|row| {
            let node_type: String = row.try_get("node_type").unwrap_or_default();
            MemoryNode {
                id: row.try_get("id").unwrap_or_default(),
                content: row.try_get("content").unwrap_or_default(),
                node_type: crate::memory::types::parse_node_type(&node_type),
                embedded: row.try_get("embedded").unwrap_or(false),
                created_at: row
                    .try_get("created_at")
                    .unwrap_or_else(|_| chrono::Utc::now()),
            }
        }))
    }

    async fn edge_on(
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        id: &str,
    ) -> Result<Option<MemoryEdge>> {
        use sqlx::Row as _;
        let row = sqlx::query(
            "SELECT id, source_id, target_id, relation, edge_type, importance, discovered, \
             created_at FROM memory_edges WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|row| {
            let edge_type: String = row.try_get("edge_type").unwrap_or_default();
            MemoryEdge {
                id: row.try_get("id").unwrap_or_default(),
                source_id: row.try_get("source_id").unwrap_or_default(),
                target_id: row.try_get("target_id").unwrap_or_default(),
                relation: row.try_get("relation").unwrap_or_default(),
                edge_type: crate::memory::types::parse_edge_type(&edge_type),
                importance: row.try_get("importance").unwrap_or(0.5),
                discovered: row.try_get("discovered").unwrap_or(false),
                created_at: row
                    .try_get("created_at")
                    .unwrap_or_else(|_| chrono::Utc::now()),
            }
        }))
    }

    /// Human-readable neighbourhood of a batch for the consolidation prompt.
    async fn describe_neighbourhood(&self, batch: &[ShortTermMemory]) -> Result<String> {
        let mut lines = Vec::new();
        let mut seen_nodes = HashSet::new();

        for memory in batch {
            for content in [&memory.subject, &memory.topic, &memory.object] {
                let Some(node) = self.store.node_by_content(content, None).await? else {
                    continue;
                };
                if !seen_nodes.insert(node.id.clone()) {
                    continue;
                }
                lines.push(format!("node [{}] {} ({})", node.id, node.content, node.node_type));
                for edge in self.store.edges_touching(&node.id).await? {
                    lines.push(format!(
                        "  edge [{}] {} -{}-> {}",
                        edge.id, edge.source_id, edge.relation, edge.target_id
                    ));
                }
            }
        }

        if lines.is_empty() {
            lines.push("(empty graph)".into());
        }
        Ok(lines.join("\n"))
    }

    /// Summary text of a long-term memory: the contents of its nodes.
    pub async fn memory_text(&self, memory: &LongTermMemory) -> Result<String> {
        let mut parts = Vec::new();
        if let Some(node) = self.store.get_node(&memory.subject_node_id).await? {
            parts.push(node.content);
        }
        for node_id in &memory.node_ids {
            if node_id == &memory.subject_node_id {
                continue;
            }
            if let Some(node) = self.store.get_node(node_id).await? {
                parts.push(node.content);
            }
        }
        Ok(parts.join(" "))
    }

    /// Relation discovery over recently consolidated memories: causality
    /// between temporal neighbours (model-judged) and REFERENCE edges for
    /// shared-node clusters. Discovered edges carry lower importance.
    pub async fn discover_relations(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize> {
        let mut recent = self.store.recent_memories(since, 50).await?;
        recent.sort_by_key(|memory| memory.created_at);
        let mut created = 0usize;

        // Temporal neighbours within one hour, judged for causality.
        for window in recent.windows(2) {
            let (earlier, later) = (&window[0], &window[1]);
            if later.created_at - earlier.created_at > chrono::Duration::hours(1) {
                continue;
            }
            if self
                .store
                .edge_exists(&earlier.id, &later.id, "causality")
                .await?
            {
                continue;
            }

            let earlier_text = self.memory_text(earlier).await?;
            let later_text = self.memory_text(later).await?;
            let prompt = self
                .prompts
                .causality(&earlier_text, &later_text)
                .map_err(|error| MemoryError::ModelFailed(error.to_string()))?;
            let verdict = match self
                .model
                .complete(
                    CompletionRequest::new(&self.config.judge_model_name, prompt)
                        .with_temperature(self.config.judge_temperature),
                )
                .await
            {
                Ok(text) => text,
                Err(error) => {
                    // NO_OP for this pair.
                    tracing::warn!(%error, "causality judgement failed");
                    continue;
                }
            };
            if !verdict.to_uppercase().contains("YES") {
                continue;
            }

            let mut edge = MemoryEdge::new(
                &earlier.id,
                &later.id,
                "causes",
                EdgeType::Causality,
                CAUSALITY_IMPORTANCE,
            );
            edge.discovered = true;
            let mut conn = self.store.pool().acquire().await?;
            GraphStore::upsert_edge(&mut conn, &edge).await?;
            created += 1;
        }

        // Shared-node clusters get REFERENCE edges.
        let mut by_node: HashMap<&str, Vec<&LongTermMemory>> = HashMap::new();
        for memory in &recent {
            for node_id in memory
                .node_ids
                .iter()
                .chain(std::iter::once(&memory.subject_node_id))
            {
                by_node.entry(node_id.as_str()).or_default().push(memory);
            }
        }
        for cluster in by_node.values() {
            for pair in cluster.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if a.id == b.id || self.store.edge_exists(&a.id, &b.id, "reference").await? {
                    continue;
                }
                let mut edge = MemoryEdge::new(
                    &a.id,
                    &b.id,
                    "references",
                    EdgeType::Reference,
                    REFERENCE_IMPORTANCE,
                );
                edge.discovered = true;
                let mut conn = self.store.pool().acquire().await?;
                GraphStore::upsert_edge(&mut conn, &edge).await?;
                created += 1;
            }
        }

        if created > 0 {
            tracing::info!(edges = created, "relation discovery created edges");
        }
        Ok(created)
    }

    /// Apply the nightly long-term decay.
    pub async fn nightly_decay(&self) -> Result<u64> {
        let affected = self
            .store
            .decay_all(self.config.long_term_decay_factor)
            .await?;
        tracing::debug!(memories = affected, "long-term decay applied");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FixedEmbedder, ScriptedModel};
    use crate::llm::InMemoryVectorStore;
    use crate::memory::store::testing::store;
    use crate::memory::types::LtmKind;
    use indoc::indoc;

    async fn engine_with(
        model: Arc<ScriptedModel>,
        embedder: Arc<FixedEmbedder>,
    ) -> (GraphEngine, Arc<GraphStore>, Arc<InMemoryVectorStore>) {
        let store = store().await;
        let vector = InMemoryVectorStore::new();
        let engine = GraphEngine::new(
            store.clone(),
            vector.clone(),
            embedder,
            model,
            Arc::new(MemoryPrompts::new()),
            MemoryConfig::default(),
        );
        (engine, store, vector)
    }

    fn ops(json: &str) -> Vec<GraphOperation> {
        let (operations, rejected) = parse_operations(json);
        assert_eq!(rejected, 0);
        operations
    }

    #[tokio::test]
    async fn apply_operations_is_idempotent() {
        let (engine, store, _vector) =
            engine_with(ScriptedModel::empty(), FixedEmbedder::new(4)).await;

        let sequence = indoc! {r#"
            [
              {"op": "CREATE_NODE", "id": "n-we", "content": "we", "node_type": "SUBJECT"},
              {"op": "CREATE_NODE", "id": "n-meet", "content": "meet", "node_type": "TOPIC"},
              {"op": "CREATE_EDGE", "id": "e-1", "source_id": "n-we", "target_id": "n-meet",
               "relation": "plans", "edge_type": "CORE_RELATION", "importance": 0.6},
              {"op": "CREATE_MEMORY", "id": "m-1", "kind": "EVENT", "subject_node_id": "n-we",
               "node_ids": ["n-we", "n-meet"], "edge_ids": ["e-1"], "importance": 0.7}
            ]
        "#};

        engine.apply_operations(ops(sequence)).await.unwrap();
        engine.apply_operations(ops(sequence)).await.unwrap();

        assert_eq!(store.memory_count().await.unwrap(), 1);
        assert_eq!(store.edges_touching("n-we").await.unwrap().len(), 1);
        let memory = store.get_memory("m-1").await.unwrap().unwrap();
        assert_eq!(memory.kind, LtmKind::Event);
        assert_eq!(memory.node_ids.len(), 2);
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_whole_batch() {
        let (engine, store, _vector) =
            engine_with(ScriptedModel::empty(), FixedEmbedder::new(4)).await;

        let sequence = indoc! {r#"
            [
              {"op": "CREATE_NODE", "id": "n-1", "content": "alpha", "node_type": "SUBJECT"},
              {"op": "UPDATE_MEMORY", "id": "missing", "importance": 0.9}
            ]
        "#};

        let error = engine.apply_operations(ops(sequence)).await.unwrap_err();
        assert!(error.to_string().contains("missing"));
        // The CREATE_NODE before the failure must not survive.
        assert!(store.get_node("n-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hard_dedup_merges_identical_topic_nodes() {
        let embedder = FixedEmbedder::new(4);
        embedder.assign("meet", vec![1.0, 0.0, 0.0, 0.0]);
        embedder.assign("meeting", vec![0.999, 0.01, 0.0, 0.0]);
        let (engine, store, _vector) = engine_with(ScriptedModel::empty(), embedder).await;

        engine
            .apply_operations(ops(indoc! {r#"
                [{"op": "CREATE_NODE", "id": "n-meet", "content": "meet", "node_type": "TOPIC"}]
            "#}))
            .await
            .unwrap();

        // Near-identical content: merged into n-meet, edge rewritten.
        engine
            .apply_operations(ops(indoc! {r#"
                [
                  {"op": "CREATE_NODE", "id": "n-meeting", "content": "meeting", "node_type": "TOPIC"},
                  {"op": "CREATE_NODE", "id": "n-we", "content": "subject we", "node_type": "SUBJECT"},
                  {"op": "CREATE_EDGE", "id": "e-1", "source_id": "n-we", "target_id": "n-meeting",
                   "relation": "plans", "edge_type": "CORE_RELATION"}
                ]
            "#}))
            .await
            .unwrap();

        assert!(store.get_node("n-meeting").await.unwrap().is_none());
        let edges = store.edges_touching("n-meet").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, "n-meet");
    }

    #[tokio::test]
    async fn soft_dedup_requires_compatible_context() {
        let embedder = FixedEmbedder::new(4);
        // Similarity ≈ 0.90: inside the soft band, below the hard band.
        embedder.assign("bank", vec![1.0, 0.0, 0.0, 0.0]);
        embedder.assign("banks", vec![0.9, (1.0f32 - 0.81).sqrt(), 0.0, 0.0]);
        let (engine, store, _vector) = engine_with(ScriptedModel::empty(), embedder).await;

        engine
            .apply_operations(ops(indoc! {r#"
                [
                  {"op": "CREATE_NODE", "id": "n-bank", "content": "bank", "node_type": "TOPIC"},
                  {"op": "CREATE_NODE", "id": "n-money", "content": "subject money", "node_type": "SUBJECT"},
                  {"op": "CREATE_EDGE", "id": "e-0", "source_id": "n-money", "target_id": "n-bank",
                   "relation": "stores_at", "edge_type": "CORE_RELATION"}
                ]
            "#}))
            .await
            .unwrap();

        // Incompatible context (different relation label): kept separate.
        engine
            .apply_operations(ops(indoc! {r#"
                [
                  {"op": "CREATE_NODE", "id": "n-banks", "content": "banks", "node_type": "TOPIC"},
                  {"op": "CREATE_NODE", "id": "n-river", "content": "subject river", "node_type": "SUBJECT"},
                  {"op": "CREATE_EDGE", "id": "e-1", "source_id": "n-river", "target_id": "n-banks",
                   "relation": "flows_past", "edge_type": "CORE_RELATION"}
                ]
            "#}))
            .await
            .unwrap();
        assert!(store.get_node("n-banks").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn consolidation_failure_surfaces_for_requeue() {
        let (engine, _store, _vector) =
            engine_with(ScriptedModel::new(["not json at all"]), FixedEmbedder::new(4)).await;

        let memory = ShortTermMemory::from_triple(
            crate::memory::types::ExtractedTriple {
                subject: "we".into(),
                topic: "meet".into(),
                object: "Wednesday".into(),
                attributes: Default::default(),
                importance: 0.7,
            },
            "b1",
        );

        let error = engine.consolidate_batch(&[memory]).await.unwrap_err();
        assert!(matches!(
            error,
            crate::Error::Memory(MemoryError::Consolidation(_))
        ));
    }

    #[tokio::test]
    async fn discovery_adds_reference_and_causal_edges() {
        let (engine, store, _vector) = engine_with(
            ScriptedModel::new(["YES"]),
            FixedEmbedder::new(4),
        )
        .await;

        // Two memories sharing a node, created moments apart.
        engine
            .apply_operations(ops(indoc! {r#"
                [
                  {"op": "CREATE_NODE", "id": "n-i", "content": "I", "node_type": "SUBJECT"},
                  {"op": "CREATE_NODE", "id": "n-sleep", "content": "slept badly", "node_type": "TOPIC"},
                  {"op": "CREATE_NODE", "id": "n-tired", "content": "tired", "node_type": "TOPIC"},
                  {"op": "CREATE_MEMORY", "id": "m-sleep", "kind": "EVENT", "subject_node_id": "n-i",
                   "node_ids": ["n-i", "n-sleep"], "importance": 0.7},
                  {"op": "CREATE_MEMORY", "id": "m-tired", "kind": "EVENT", "subject_node_id": "n-i",
                   "node_ids": ["n-i", "n-tired"], "importance": 0.7}
                ]
            "#}))
            .await
            .unwrap();

        let since = chrono::Utc::now() - chrono::Duration::hours(1);
        let created = engine.discover_relations(since).await.unwrap();
        assert!(created >= 2);

        let causal = store.edges_touching("m-sleep").await.unwrap();
        assert!(causal.iter().any(|edge| {
            edge.edge_type == EdgeType::Causality && edge.discovered && edge.target_id == "m-tired"
        }));
        assert!(causal.iter().any(|edge| {
            edge.edge_type == EdgeType::Reference
                && edge.discovered
                && (edge.importance - REFERENCE_IMPORTANCE).abs() < f32::EPSILON
        }));

        // Re-running discovers nothing new.
        let again = engine.discover_relations(since).await.unwrap();
        assert_eq!(again, 0);
    }
}
