//! Seams for the external collaborators: language models, embedding
//! providers, and the vector index.
//!
//! Concrete providers live outside the crate; the runtime only depends on
//! these traits. [`InMemoryVectorStore`] is the bundled default index so the
//! core runs self-contained; a real deployment swaps in its own store.

use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One completion request against a named model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: String::new(),
            prompt: prompt.into(),
            temperature: 0.7,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Language model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Embedding provider collaborator.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding dimensionality, used to validate stored vectors.
    fn dimensions(&self) -> usize;
}

/// A similarity hit from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
}

/// Vector index collaborator. Operations on one collection are serialised
/// by the implementation; callers never coordinate access themselves.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, id: &str, vector: Vec<f32>) -> Result<()>;

    /// Nearest neighbours by cosine similarity, best first, keeping only
    /// hits with `score >= min_score`.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>>;

    async fn remove(&self, collection: &str, id: &str) -> Result<()>;
}

/// Cosine similarity of two vectors; 0.0 when either has zero norm or the
/// dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Brute-force in-memory vector index. One async mutex per collection keeps
/// per-collection operations serialised.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, Arc<Mutex<HashMap<String, Vec<f32>>>>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn collection(&self, name: &str) -> Arc<Mutex<HashMap<String, Vec<f32>>>> {
        let mut collections = self.collections.lock().await;
        collections.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(MemoryError::EmbeddingFailed("empty vector".into()).into());
        }
        let collection = self.collection(collection).await;
        collection.lock().await.insert(id.to_string(), vector);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>> {
        let collection = self.collection(collection).await;
        let entries = collection.lock().await;

        let mut hits: Vec<VectorHit> = entries
            .iter()
            .map(|(id, vector)| VectorHit {
                id: id.clone(),
                score: cosine_similarity(query, vector),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let collection = self.collection(collection).await;
        collection.lock().await.remove(id);
        Ok(())
    }
}

/// Placeholder model used when no provider is wired in. Every call fails
/// with [`MemoryError::ModelFailed`]; callers follow their configured
/// failure semantics (log + NO_OP).
pub struct UnconfiguredModel;

#[async_trait]
impl LanguageModel for UnconfiguredModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        Err(MemoryError::ModelFailed(format!(
            "no language model provider configured (requested model {})",
            request.model
        ))
        .into())
    }
}

/// Placeholder embedder used when no provider is wired in.
pub struct UnconfiguredEmbedder;

#[async_trait]
impl EmbeddingProvider for UnconfiguredEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MemoryError::EmbeddingFailed("no embedding provider configured".into()).into())
    }

    fn dimensions(&self) -> usize {
        0
    }
}

/// Scripted collaborators for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Model that replays a scripted queue of responses; an exhausted queue
    /// fails the call.
    pub(crate) struct ScriptedModel {
        responses: StdMutex<VecDeque<String>>,
        pub requests: StdMutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into_iter().map(Into::into).collect()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        pub fn empty() -> Arc<Self> {
            Self::new(Vec::<String>::new())
        }

        pub fn push(&self, response: impl Into<String>) {
            self.responses.lock().unwrap().push_back(response.into());
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| MemoryError::ModelFailed("script exhausted".into()).into())
        }
    }

    /// Embedder returning preassigned vectors for known texts and a
    /// deterministic hash-derived vector otherwise.
    pub(crate) struct FixedEmbedder {
        fixed: StdMutex<HashMap<String, Vec<f32>>>,
        dims: usize,
    }

    impl FixedEmbedder {
        pub fn new(dims: usize) -> Arc<Self> {
            Arc::new(Self {
                fixed: StdMutex::new(HashMap::new()),
                dims,
            })
        }

        pub fn assign(&self, text: impl Into<String>, vector: Vec<f32>) {
            self.fixed.lock().unwrap().insert(text.into(), vector);
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if let Some(vector) = self.fixed.lock().unwrap().get(text) {
                return Ok(vector.clone());
            }
            // Stable pseudo-embedding from byte sums so unrelated texts are
            // near-orthogonal in tests.
            let mut vector = vec![0.0f32; self.dims];
            for (index, byte) in text.bytes().enumerate() {
                vector[index % self.dims] += f32::from(byte) / 255.0;
            }
            Ok(vector)
        }

        fn dimensions(&self) -> usize {
            self.dims
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_threshold_is_inclusive() {
        let store = InMemoryVectorStore::new();
        // score against query [1, 0] is exactly the first component for
        // unit vectors.
        let exact = vec![0.55, (1.0f32 - 0.55 * 0.55).sqrt()];
        let below = vec![0.549, (1.0f32 - 0.549 * 0.549).sqrt()];
        store.upsert("c", "exact", exact).await.unwrap();
        store.upsert("c", "below", below).await.unwrap();

        let hits = store.search("c", &[1.0, 0.0], 10, 0.55).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "exact");
    }

    #[tokio::test]
    async fn search_orders_and_truncates() {
        let store = InMemoryVectorStore::new();
        store.upsert("c", "far", vec![0.1, 1.0]).await.unwrap();
        store.upsert("c", "near", vec![1.0, 0.05]).await.unwrap();
        store.upsert("c", "mid", vec![1.0, 0.8]).await.unwrap();

        let hits = store.search("c", &[1.0, 0.0], 2, 0.0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[1].id, "mid");
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let store = InMemoryVectorStore::new();
        store.upsert("c", "a", vec![1.0, 0.0]).await.unwrap();
        store.remove("c", "a").await.unwrap();
        let hits = store.search("c", &[1.0, 0.0], 5, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }
}
