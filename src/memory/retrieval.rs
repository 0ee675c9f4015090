//! Unified retrieval: scoring weights, causal-query detection, and the
//! retrieved-memory shape returned to the reply pipeline.

use serde::Serialize;

/// Vector collection names for the staging tiers.
pub const PERCEPTUAL_COLLECTION: &str = "perceptual";
pub const SHORT_TERM_COLLECTION: &str = "short_term";

/// Tier a retrieval candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Perceptual,
    ShortTerm,
    LongTerm,
}

/// One scored retrieval result.
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub id: String,
    pub tier: MemoryTier,
    pub content: String,
    pub score: f32,
    pub semantic: f32,
    pub graph_distance: u32,
}

/// Composite scoring weights:
/// `α·semantic + β·importance + γ·(1/graph_distance) + δ·time_decay + ε·access_frequency`.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub semantic: f32,
    pub importance: f32,
    pub graph: f32,
    pub time: f32,
    pub frequency: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            importance: 0.2,
            graph: 0.2,
            time: 0.1,
            frequency: 0.1,
        }
    }
}

/// Maximum results returned by unified retrieval.
pub const RETRIEVAL_LIMIT: usize = 10;

/// Keywords marking a causal query; these widen graph expansion to depth 2.
const CAUSAL_KEYWORDS: &[&str] = &["because", "why", "so", "cause", "therefore", "reason"];

pub fn is_causal_query(query: &str) -> bool {
    let lowered = query.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| CAUSAL_KEYWORDS.contains(&word))
}

/// Compute the composite score for one candidate.
pub fn composite_score(
    weights: &ScoreWeights,
    semantic: f32,
    importance: f32,
    graph_distance: u32,
    age_hours: f32,
    access_count: i64,
) -> f32 {
    let graph_term = 1.0 / graph_distance.max(1) as f32;
    // Week-scale recency falloff.
    let time_term = (-age_hours.max(0.0) / 168.0).exp();
    let frequency_term = ((1 + access_count.max(0)) as f32).ln() / 101f32.ln();

    weights.semantic * semantic
        + weights.importance * importance
        + weights.graph * graph_term
        + weights.time * time_term
        + weights.frequency * frequency_term.min(1.0)
}
