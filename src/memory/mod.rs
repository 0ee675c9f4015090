//! Tiered memory engine: perceptual buffer → structured short-term →
//! graph long-term, with model-decided promotion, decay, and unified
//! hybrid retrieval.

pub mod graph;
pub mod journal;
pub mod perceptual;
pub mod prompts;
pub mod retrieval;
pub mod short_term;
pub mod store;
pub mod types;

pub use graph::{GraphEngine, GRAPH_COLLECTION};
pub use retrieval::{MemoryTier, RetrievedMemory, ScoreWeights, RETRIEVAL_LIMIT};
pub use store::GraphStore;
pub use types::{GraphOperation, LongTermMemory, MemoryEdge, MemoryNode, ShortTermMemory};

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::llm::{CompletionRequest, EmbeddingProvider, LanguageModel, VectorStore};
use journal::Journal;
use perceptual::PerceptualBuffer;
use prompts::{DecisionNeighbour, MemoryPrompts};
use retrieval::{PERCEPTUAL_COLLECTION, SHORT_TERM_COLLECTION};
use serde::{Deserialize, Serialize};
use short_term::ShortTermStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::time::Duration;
use types::{JudgeVerdict, MemoryDecision, PerceptualBlock};

/// Bound on the long-term transfer queue; low-importance entries are shed
/// when it fills.
const TRANSFER_QUEUE_CAP: usize = 64;
/// Cadence of the short-term decay sweep and reindex job.
const DECAY_SWEEP_SECS: u64 = 600;
/// Cadence of the nightly long-term decay.
const NIGHTLY_SECS: u64 = 86_400;
/// Neighbours shown to the decision model.
const DECISION_NEIGHBOURS: usize = 5;
/// Consolidation retries before a batch entry is dropped.
const MAX_TRANSFER_RETRIES: u32 = 3;

/// One queued short-term → long-term transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct QueuedTransfer {
    memory_id: String,
    retries: u32,
}

/// The memory engine. Owns all memory entities across the three tiers.
pub struct MemoryEngine {
    config: MemoryConfig,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorStore>,
    store: Arc<GraphStore>,
    graph: GraphEngine,
    prompts: Arc<MemoryPrompts>,
    perceptual: Mutex<PerceptualBuffer>,
    short_term: Mutex<ShortTermStore>,
    transfer_queue: Mutex<VecDeque<QueuedTransfer>>,
    /// Blocks whose extraction failed; retried by the sweep job.
    extraction_backlog: Mutex<VecDeque<String>>,
    journal: Journal,
    last_discovery: Mutex<chrono::DateTime<chrono::Utc>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryEngine {
    /// Build the engine, create the graph tables, and replay the staging
    /// journals.
    pub async fn new(
        config: MemoryConfig,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorStore>,
        pool: sqlx::SqlitePool,
        journal_dir: std::path::PathBuf,
    ) -> Result<Arc<Self>> {
        let store = GraphStore::new(pool);
        store.initialize().await?;

        let prompts = Arc::new(MemoryPrompts::new());
        let graph = GraphEngine::new(
            store.clone(),
            vector.clone(),
            embedder.clone(),
            model.clone(),
            prompts.clone(),
            config.clone(),
        );

        let journal = Journal::new(journal_dir)?;

        let mut buffer =
            PerceptualBuffer::new(config.perceptual_max_blocks, config.perceptual_block_size);
        if let Some(blocks) = journal.load::<Vec<PerceptualBlock>>(journal::PERCEPTUAL) {
            tracing::info!(blocks = blocks.len(), "perceptual journal replayed");
            buffer.restore(blocks);
        }

        let mut short_term =
            ShortTermStore::new(config.short_term_max_memories, config.short_term_decay_factor);
        if let Some(memories) = journal.load::<Vec<ShortTermMemory>>(journal::SHORT_TERM) {
            tracing::info!(memories = memories.len(), "short-term journal replayed");
            short_term.restore(memories);
        }

        let transfer_queue = journal
            .load::<VecDeque<QueuedTransfer>>(journal::PROMOTION_QUEUE)
            .unwrap_or_default();

        let engine = Arc::new(Self {
            config,
            model,
            embedder,
            vector,
            store,
            graph,
            prompts,
            perceptual: Mutex::new(buffer),
            short_term: Mutex::new(short_term),
            transfer_queue: Mutex::new(transfer_queue),
            extraction_backlog: Mutex::new(VecDeque::new()),
            journal,
            last_discovery: Mutex::new(chrono::Utc::now()),
            tasks: StdMutex::new(Vec::new()),
        });

        // Rebuild vector entries for staged items whose embeddings never
        // landed (crash between journal write and index write).
        engine.reindex_unembedded().await;

        Ok(engine)
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn graph(&self) -> &GraphEngine {
        &self.graph
    }

    /// Feed one conversation message into the perceptual layer.
    pub async fn observe_message(
        &self,
        stream_id: &str,
        sender: &str,
        text: &str,
        timestamp_ms: i64,
    ) -> Result<()> {
        if !self.config.enable {
            return Ok(());
        }

        let closed = {
            let mut perceptual = self.perceptual.lock().await;
            perceptual.observe(stream_id, sender, text, timestamp_ms)
        };

        if let Some(block) = closed {
            self.process_closed_block(block).await?;
        }
        Ok(())
    }

    async fn process_closed_block(&self, mut block: PerceptualBlock) -> Result<()> {
        let block_id = block.id.clone();
        let text = block.text();

        // Embed and index; an embedding failure leaves the block staged but
        // unretrievable until the reindex job catches up.
        let mut recall_hits = Vec::new();
        match self.embedder.embed(&text).await {
            Ok(embedding) => {
                self.vector
                    .upsert(PERCEPTUAL_COLLECTION, &block_id, embedding.clone())
                    .await?;
                block.embedded = true;

                let hits = self
                    .vector
                    .search(
                        PERCEPTUAL_COLLECTION,
                        &embedding,
                        self.config.perceptual_topk + 1,
                        self.config.perceptual_similarity_threshold,
                    )
                    .await?;
                recall_hits = hits
                    .into_iter()
                    .filter(|hit| hit.id != block_id)
                    .take(self.config.perceptual_topk)
                    .collect();
            }
            Err(error) => {
                tracing::warn!(block_id = %block_id, %error, "block embedding failed");
            }
        }

        let mut to_promote = Vec::new();
        {
            let mut perceptual = self.perceptual.lock().await;
            if let Some(evicted) = perceptual.push_closed(block) {
                self.vector
                    .remove(PERCEPTUAL_COLLECTION, &evicted.id)
                    .await
                    .ok();
            }

            for hit in &recall_hits {
                let Some(count) = perceptual.activate(&hit.id) else {
                    continue;
                };
                if count >= self.config.activation_threshold {
                    if let Some(block) = perceptual.get_mut(&hit.id) {
                        if !block.promoted {
                            block.promoted = true;
                            to_promote.push(block.clone());
                        }
                    }
                }
            }
        }

        for block in to_promote {
            self.promote_block(block).await;
        }

        self.flush_journals().await;
        Ok(())
    }

    /// Promote one activated perceptual block: extract triples and run the
    /// decision flow for each candidate. Model failures are NO_OPs; the
    /// block goes to the backlog for a later retry.
    async fn promote_block(&self, block: PerceptualBlock) {
        let prompt = match self.prompts.extraction(&block.text()) {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::error!(block_id = %block.id, %error, "extraction prompt failed");
                return;
            }
        };

        let response = match self
            .model
            .complete(CompletionRequest::new("default", prompt).with_temperature(0.3))
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(block_id = %block.id, %error, "extraction failed; block kept for retry");
                self.extraction_backlog.lock().await.push_back(block.id.clone());
                return;
            }
        };

        for triple in types::parse_triples(&response) {
            let candidate = ShortTermMemory::from_triple(triple, &block.id);
            self.decide_candidate(candidate).await;
        }

        self.enqueue_transfer_candidates().await;
    }

    /// Retrieve the top-N similar short-term memories and let the model
    /// choose MERGE / UPDATE / CREATE_NEW / DISCARD.
    async fn decide_candidate(&self, candidate: ShortTermMemory) {
        let origin_block = candidate
            .origin_block_ids
            .first()
            .cloned()
            .unwrap_or_default();

        let embedding = match self.embedder.embed(&candidate.summary_text()).await {
            Ok(embedding) => Some(embedding),
            Err(error) => {
                tracing::warn!(%error, "candidate embedding failed; storing unembedded");
                None
            }
        };

        let neighbours = match &embedding {
            Some(embedding) => self
                .vector
                .search(SHORT_TERM_COLLECTION, embedding, DECISION_NEIGHBOURS, 0.0)
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let decision = if neighbours.is_empty() {
            MemoryDecision::CreateNew
        } else {
            let neighbour_info = {
                let short_term = self.short_term.lock().await;
                let mut info: Vec<(DecisionNeighbour, chrono::DateTime<chrono::Utc>)> = neighbours
                    .iter()
                    .filter_map(|hit| {
                        short_term.get(&hit.id).map(|memory| {
                            (
                                DecisionNeighbour {
                                    id: memory.id.clone(),
                                    summary: memory.summary_text(),
                                    similarity: hit.score,
                                },
                                memory.last_accessed,
                            )
                        })
                    })
                    .collect();
                // Equal similarity breaks toward the most recently accessed
                // neighbour, then the id, keeping the order deterministic.
                info.sort_by(|a, b| {
                    b.0.similarity
                        .partial_cmp(&a.0.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.1.cmp(&a.1))
                        .then_with(|| a.0.id.cmp(&b.0.id))
                });
                info.into_iter().map(|(info, _)| info).collect::<Vec<_>>()
            };

            let prompt = match self.prompts.decision(&candidate, &neighbour_info) {
                Ok(prompt) => prompt,
                Err(error) => {
                    tracing::error!(%error, "decision prompt failed");
                    return;
                }
            };
            let response = match self
                .model
                .complete(CompletionRequest::new("default", prompt).with_temperature(0.2))
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%error, "decision model failed; candidate NO_OP");
                    return;
                }
            };
            match types::parse_decision(&response) {
                Some(decision) => decision,
                None => return,
            }
        };

        match decision {
            MemoryDecision::Discard => {}
            MemoryDecision::Merge {
                target_id,
                importance_delta,
            } => {
                let merged = {
                    let mut short_term = self.short_term.lock().await;
                    short_term.merge(
                        &target_id,
                        &candidate.attributes,
                        importance_delta,
                        &origin_block,
                    )
                };
                if !merged {
                    tracing::debug!(target_id, "merge target vanished; creating new memory");
                    self.insert_candidate(candidate, embedding).await;
                }
            }
            MemoryDecision::Update {
                target_id,
                attributes,
            } => {
                let attributes = if attributes.is_empty() {
                    candidate.attributes.clone()
                } else {
                    attributes
                };
                let updated = {
                    let mut short_term = self.short_term.lock().await;
                    short_term.update(&target_id, &attributes, &origin_block)
                };
                if !updated {
                    self.insert_candidate(candidate, embedding).await;
                }
            }
            MemoryDecision::CreateNew => {
                self.insert_candidate(candidate, embedding).await;
            }
        }
    }

    async fn insert_candidate(&self, mut candidate: ShortTermMemory, embedding: Option<Vec<f32>>) {
        let id = candidate.id.clone();
        candidate.embedded = false;

        let evicted = {
            let mut short_term = self.short_term.lock().await;
            short_term.insert(candidate)
        };
        for evicted_id in evicted {
            self.vector
                .remove(SHORT_TERM_COLLECTION, &evicted_id)
                .await
                .ok();
        }

        if let Some(embedding) = embedding {
            match self.vector.upsert(SHORT_TERM_COLLECTION, &id, embedding).await {
                Ok(()) => self.short_term.lock().await.mark_embedded(&id),
                Err(error) => {
                    tracing::warn!(memory_id = %id, %error, "short-term vector upsert failed");
                }
            }
        }
    }

    /// Queue memories that crossed the transfer threshold, shedding the
    /// least important queued entry when the bounded queue overflows.
    async fn enqueue_transfer_candidates(&self) {
        let candidates = {
            let short_term = self.short_term.lock().await;
            short_term.transfer_candidates(self.config.short_term_transfer_threshold)
        };
        if candidates.is_empty() {
            return;
        }

        let mut queue = self.transfer_queue.lock().await;
        let mut short_term = self.short_term.lock().await;
        for memory_id in candidates {
            if queue.iter().any(|queued| queued.memory_id == memory_id) {
                continue;
            }
            short_term.set_promoting(&memory_id, true);
            queue.push_back(QueuedTransfer {
                memory_id,
                retries: 0,
            });

            if queue.len() > TRANSFER_QUEUE_CAP {
                let shed_index = queue
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        let ia = short_term.get(&a.memory_id).map_or(0.0, |m| m.importance);
                        let ib = short_term.get(&b.memory_id).map_or(0.0, |m| m.importance);
                        ia.partial_cmp(&ib).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(index, _)| index);
                if let Some(index) = shed_index {
                    if let Some(shed) = queue.remove(index) {
                        tracing::warn!(memory_id = %shed.memory_id, "transfer queue full, shedding");
                        short_term.set_promoting(&shed.memory_id, false);
                    }
                }
            }
        }
    }

    /// Drain one consolidation batch. On failure the batch is requeued
    /// with bumped retry counters; entries past the cap are dropped.
    pub async fn run_consolidation_cycle(&self) {
        let batch: Vec<QueuedTransfer> = {
            let mut queue = self.transfer_queue.lock().await;
            let take = queue.len().min(self.config.long_term_batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let memories: Vec<ShortTermMemory> = {
            let short_term = self.short_term.lock().await;
            batch
                .iter()
                .filter_map(|queued| short_term.get(&queued.memory_id).cloned())
                .collect()
        };
        if memories.is_empty() {
            return;
        }

        match self.graph.consolidate_batch(&memories).await {
            Ok(()) => {
                let mut short_term = self.short_term.lock().await;
                for memory in &memories {
                    short_term.remove(&memory.id);
                }
                drop(short_term);
                for memory in &memories {
                    self.vector
                        .remove(SHORT_TERM_COLLECTION, &memory.id)
                        .await
                        .ok();
                }
                tracing::info!(batch = memories.len(), "consolidation batch applied");
            }
            Err(error) => {
                tracing::error!(%error, batch = batch.len(), "consolidation batch rolled back");
                let mut queue = self.transfer_queue.lock().await;
                let mut short_term = self.short_term.lock().await;
                for mut queued in batch {
                    queued.retries += 1;
                    if queued.retries > MAX_TRANSFER_RETRIES {
                        tracing::error!(
                            memory_id = %queued.memory_id,
                            retries = queued.retries,
                            "transfer dropped after repeated consolidation failures"
                        );
                        short_term.set_promoting(&queued.memory_id, false);
                    } else {
                        queue.push_back(queued);
                    }
                }
            }
        }

        self.flush_journals().await;
    }

    /// Short-term decay sweep plus extraction retries and embedding
    /// reindexing.
    pub async fn run_maintenance_sweep(&self) {
        let decayed = {
            let mut short_term = self.short_term.lock().await;
            short_term.decay_unaccessed()
        };
        tracing::debug!(decayed, "short-term decay sweep");

        // Retry extraction for blocks whose model call failed.
        let backlog: Vec<String> = {
            let mut backlog = self.extraction_backlog.lock().await;
            backlog.drain(..).collect()
        };
        for block_id in backlog {
            let block = {
                let perceptual = self.perceptual.lock().await;
                perceptual.get(&block_id).cloned()
            };
            if let Some(block) = block {
                self.promote_block(block).await;
            }
        }

        self.reindex_unembedded().await;
        self.flush_journals().await;
    }

    /// Retry embeddings for anything staged without one.
    async fn reindex_unembedded(&self) {
        let block_jobs: Vec<(String, String)> = {
            let perceptual = self.perceptual.lock().await;
            perceptual
                .unembedded_ids()
                .into_iter()
                .filter_map(|id| perceptual.get(&id).map(|block| (id, block.text())))
                .collect()
        };
        for (id, text) in block_jobs {
            let Ok(embedding) = self.embedder.embed(&text).await else {
                continue;
            };
            if self
                .vector
                .upsert(PERCEPTUAL_COLLECTION, &id, embedding)
                .await
                .is_ok()
            {
                if let Some(block) = self.perceptual.lock().await.get_mut(&id) {
                    block.embedded = true;
                }
            }
        }

        let memory_jobs: Vec<(String, String)> = {
            let short_term = self.short_term.lock().await;
            short_term
                .unembedded_ids()
                .into_iter()
                .filter_map(|id| {
                    short_term
                        .get(&id)
                        .map(|memory| (id, memory.summary_text()))
                })
                .collect()
        };
        for (id, text) in memory_jobs {
            let Ok(embedding) = self.embedder.embed(&text).await else {
                continue;
            };
            if self
                .vector
                .upsert(SHORT_TERM_COLLECTION, &id, embedding)
                .await
                .is_ok()
            {
                self.short_term.lock().await.mark_embedded(&id);
            }
        }

        for node in self.store.unembedded_nodes(32).await.unwrap_or_default() {
            let Ok(embedding) = self.embedder.embed(&node.content).await else {
                continue;
            };
            if self
                .vector
                .upsert(GRAPH_COLLECTION, &node.id, embedding)
                .await
                .is_ok()
            {
                self.store.mark_node_embedded(&node.id).await.ok();
            }
        }
    }

    /// Unified retrieval across the three tiers.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedMemory>> {
        if !self.config.enable {
            return Ok(Vec::new());
        }

        let weights = ScoreWeights::default();
        let now = chrono::Utc::now();
        let query_embedding = self.embedder.embed(query).await?;

        struct Candidate {
            id: String,
            tier: MemoryTier,
            content: String,
            semantic: f32,
            importance: f32,
            distance: u32,
            age_hours: f32,
            access_count: i64,
        }
        let mut candidates: Vec<Candidate> = Vec::new();

        // Perceptual tier: top 3 above the recall threshold.
        let perceptual_hits = self
            .vector
            .search(
                PERCEPTUAL_COLLECTION,
                &query_embedding,
                self.config.perceptual_topk,
                self.config.perceptual_similarity_threshold,
            )
            .await?;
        {
            let mut perceptual = self.perceptual.lock().await;
            for hit in &perceptual_hits {
                perceptual.activate(&hit.id);
                let Some(block) = perceptual.get(&hit.id) else {
                    continue;
                };
                candidates.push(Candidate {
                    id: block.id.clone(),
                    tier: MemoryTier::Perceptual,
                    content: block.text(),
                    semantic: hit.score,
                    importance: (block.activation_count as f32
                        / self.config.activation_threshold as f32)
                        .min(1.0),
                    distance: 1,
                    age_hours: (now - block.created_at).num_minutes() as f32 / 60.0,
                    access_count: i64::from(block.activation_count),
                });
            }
        }

        // Short-term tier: top 5.
        let short_hits = self
            .vector
            .search(SHORT_TERM_COLLECTION, &query_embedding, 5, 0.0)
            .await?;
        let mut short_snapshots: Vec<ShortTermMemory> = Vec::new();
        {
            let mut short_term = self.short_term.lock().await;
            for hit in &short_hits {
                let Some(memory) = short_term.access(&hit.id) else {
                    continue;
                };
                let mut content = memory.summary_text();
                if !memory.attributes.is_empty() {
                    let attrs: Vec<String> = memory
                        .attributes
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect();
                    content.push_str(&format!(" ({})", attrs.join(", ")));
                }
                candidates.push(Candidate {
                    id: memory.id.clone(),
                    tier: MemoryTier::ShortTerm,
                    content,
                    semantic: hit.score,
                    importance: memory.importance,
                    distance: 1,
                    age_hours: (now - memory.created_at).num_minutes() as f32 / 60.0,
                    access_count: i64::from(memory.activation_count),
                });
                short_snapshots.push(memory.clone());
            }
        }

        // Judge: skip expansion only on an explicit SUFFICIENT.
        let sufficient = if self.config.enable_judge_retrieval {
            let hits: Vec<String> = candidates
                .iter()
                .map(|candidate| candidate.content.clone())
                .collect();
            match self.judge_sufficiency(query, &hits).await {
                JudgeVerdict::Sufficient => true,
                JudgeVerdict::Insufficient => false,
            }
        } else {
            false
        };

        if !sufficient {
            let depth = if retrieval::is_causal_query(query) { 2 } else { 1 };
            let expanded = self
                .expand_graph(&query_embedding, &short_snapshots, depth)
                .await?;
            for (memory, distance, semantic) in expanded {
                let content = self.graph.memory_text(&memory).await.unwrap_or_default();
                candidates.push(Candidate {
                    id: memory.id.clone(),
                    tier: MemoryTier::LongTerm,
                    content,
                    semantic,
                    importance: memory.importance,
                    distance,
                    age_hours: (now - memory.last_accessed).num_minutes() as f32 / 60.0,
                    access_count: memory.access_count,
                });
            }
        }

        let mut results: Vec<(f32, Candidate)> = candidates
            .into_iter()
            .map(|candidate| {
                let score = retrieval::composite_score(
                    &weights,
                    candidate.semantic,
                    candidate.importance,
                    candidate.distance,
                    candidate.age_hours,
                    candidate.access_count,
                );
                (score, candidate)
            })
            .collect();
        results.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(RETRIEVAL_LIMIT);

        // Returned long-term memories count as accessed.
        for (_, candidate) in &results {
            if candidate.tier == MemoryTier::LongTerm {
                self.store.record_access(&candidate.id).await.ok();
            }
        }

        Ok(results
            .into_iter()
            .map(|(score, candidate)| RetrievedMemory {
                id: candidate.id,
                tier: candidate.tier,
                content: candidate.content,
                score,
                semantic: candidate.semantic,
                graph_distance: candidate.distance,
            })
            .collect())
    }

    async fn judge_sufficiency(&self, query: &str, hits: &[String]) -> JudgeVerdict {
        let prompt = match self.prompts.judge(query, hits) {
            Ok(prompt) => prompt,
            Err(_) => return JudgeVerdict::Insufficient,
        };
        match self
            .model
            .complete(
                CompletionRequest::new(&self.config.judge_model_name, prompt)
                    .with_temperature(self.config.judge_temperature),
            )
            .await
        {
            Ok(response) => types::parse_verdict(&response),
            Err(error) => {
                tracing::debug!(%error, "judge unavailable; taking expansion branch");
                JudgeVerdict::Insufficient
            }
        }
    }

    /// BFS into the long-term graph from vector-seeded nodes and the nodes
    /// behind the short-term hits. Returns `(memory, distance, semantic)`.
    async fn expand_graph(
        &self,
        query_embedding: &[f32],
        short_hits: &[ShortTermMemory],
        depth: u32,
    ) -> Result<Vec<(LongTermMemory, u32, f32)>> {
        let max_distance = depth + 1;

        // Seed nodes: semantic hits plus exact-content matches of the
        // short-term hits' members.
        let mut node_queue: VecDeque<(String, u32, f32)> = VecDeque::new();
        for hit in self
            .vector
            .search(GRAPH_COLLECTION, query_embedding, 5, 0.3)
            .await?
        {
            node_queue.push_back((hit.id, 1, hit.score));
        }
        for memory in short_hits {
            for content in [&memory.subject, &memory.topic, &memory.object] {
                if let Some(node) = self.store.node_by_content(content, None).await? {
                    node_queue.push_back((node.id, 1, 0.5));
                }
            }
        }

        let mut seen_nodes: HashMap<String, u32> = HashMap::new();
        let mut memory_queue: VecDeque<(String, u32, f32)> = VecDeque::new();
        let mut found: HashMap<String, (LongTermMemory, u32, f32)> = HashMap::new();

        while let Some((node_id, distance, semantic)) = node_queue.pop_front() {
            match seen_nodes.get(&node_id) {
                Some(&best) if best <= distance => continue,
                _ => {}
            }
            seen_nodes.insert(node_id.clone(), distance);

            for memory in self.store.memories_for_node(&node_id).await? {
                memory_queue.push_back((memory.id.clone(), distance, semantic));
                found
                    .entry(memory.id.clone())
                    .and_modify(|entry| {
                        entry.1 = entry.1.min(distance);
                        entry.2 = entry.2.max(semantic);
                    })
                    .or_insert((memory, distance, semantic));
            }

            if distance >= max_distance {
                continue;
            }
            for edge in self.store.edges_touching(&node_id).await? {
                let other = if edge.source_id == node_id {
                    &edge.target_id
                } else {
                    &edge.source_id
                };
                if self.store.get_node(other).await?.is_some() {
                    node_queue.push_back((other.clone(), distance + 1, semantic * 0.9));
                }
            }
        }

        // Memory-to-memory edges (causality, reference).
        let mut seen_memories: HashMap<String, u32> = HashMap::new();
        while let Some((memory_id, distance, semantic)) = memory_queue.pop_front() {
            match seen_memories.get(&memory_id) {
                Some(&best) if best <= distance => continue,
                _ => {}
            }
            seen_memories.insert(memory_id.clone(), distance);

            if distance >= max_distance {
                continue;
            }
            for edge in self.store.edges_touching(&memory_id).await? {
                let other = if edge.source_id == memory_id {
                    &edge.target_id
                } else {
                    &edge.source_id
                };
                let Some(memory) = self.store.get_memory(other).await? else {
                    continue;
                };
                let next_distance = distance + 1;
                memory_queue.push_back((memory.id.clone(), next_distance, semantic * 0.9));
                found
                    .entry(memory.id.clone())
                    .and_modify(|entry| {
                        entry.1 = entry.1.min(next_distance);
                        entry.2 = entry.2.max(semantic * 0.9);
                    })
                    .or_insert((memory, next_distance, semantic * 0.9));
            }
        }

        Ok(found.into_values().collect())
    }

    /// Start the background jobs: decay sweep, consolidation drain,
    /// nightly long-term decay, relation discovery.
    pub fn spawn_background_jobs(self: &Arc<Self>) {
        let jobs: [(u64, JobKind); 3] = [
            (DECAY_SWEEP_SECS, JobKind::Sweep),
            (
                self.config.long_term_auto_transfer_interval,
                JobKind::Consolidate,
            ),
            (NIGHTLY_SECS, JobKind::Nightly),
        ];

        let mut handles = self.tasks.lock().expect("memory engine poisoned");
        for (interval_secs, kind) in jobs {
            let engine = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The immediate first tick would run the job at startup.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    match kind {
                        JobKind::Sweep => engine.run_maintenance_sweep().await,
                        JobKind::Consolidate => engine.run_consolidation_cycle().await,
                        JobKind::Nightly => {
                            engine.graph.nightly_decay().await.ok();
                            let since = {
                                let mut last = engine.last_discovery.lock().await;
                                std::mem::replace(&mut *last, chrono::Utc::now())
                            };
                            engine.graph.discover_relations(since).await.ok();
                        }
                    }
                }
            }));
        }
    }

    /// Flush all staging journals to disk.
    pub async fn flush_journals(&self) {
        let blocks = self.perceptual.lock().await.snapshot();
        if let Err(error) = self.journal.save(journal::PERCEPTUAL, &blocks) {
            tracing::error!(%error, "perceptual journal write failed");
        }

        let memories = self.short_term.lock().await.snapshot();
        if let Err(error) = self.journal.save(journal::SHORT_TERM, &memories) {
            tracing::error!(%error, "short-term journal write failed");
        }

        let queue: Vec<QueuedTransfer> =
            self.transfer_queue.lock().await.iter().cloned().collect();
        if let Err(error) = self.journal.save(journal::PROMOTION_QUEUE, &queue) {
            tracing::error!(%error, "promotion queue journal write failed");
        }
    }

    /// Stop background jobs and flush journals.
    pub async fn shutdown(&self) {
        {
            let mut tasks = self.tasks.lock().expect("memory engine poisoned");
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
        self.flush_journals().await;
        tracing::info!("memory engine stopped");
    }

    /// Number of closed perceptual blocks currently staged.
    pub async fn perceptual_block_count(&self) -> usize {
        self.perceptual.lock().await.len()
    }

    /// Snapshot of the short-term store.
    pub async fn short_term_snapshot(&self) -> Vec<ShortTermMemory> {
        self.short_term.lock().await.snapshot()
    }

    /// Number of queued short-term → long-term transfers.
    pub async fn transfer_queue_len(&self) -> usize {
        self.transfer_queue.lock().await.len()
    }
}

#[derive(Clone, Copy)]
enum JobKind {
    Sweep,
    Consolidate,
    Nightly,
}
