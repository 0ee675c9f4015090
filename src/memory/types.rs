//! Memory entities for all three tiers, plus the typed operation enums the
//! language model emits as JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One message aggregated into a perceptual block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockMessage {
    pub sender: String,
    pub text: String,
    pub timestamp_ms: i64,
}

/// A perceptual block: up to K sequential messages from one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerceptualBlock {
    pub id: String,
    pub stream_id: String,
    pub messages: Vec<BlockMessage>,
    /// False until the embedding landed in the vector index; the reindex
    /// job retries unembedded blocks.
    pub embedded: bool,
    pub activation_count: u32,
    pub promoted: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl PerceptualBlock {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            messages: Vec::new(),
            embedded: false,
            activation_count: 0,
            promoted: false,
            created_at: chrono::Utc::now(),
        }
    }

    /// Concatenated text used for the block embedding and extraction.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|message| format!("{}: {}", message.sender, message.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A structured short-term memory: `(subject, topic, object)` plus
/// attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortTermMemory {
    pub id: String,
    pub subject: String,
    pub topic: String,
    pub object: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub embedded: bool,
    pub importance: f32,
    pub activation_count: u32,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub origin_block_ids: Vec<String>,
    /// Guard against eviction while queued for long-term transfer.
    #[serde(default)]
    pub promoting: bool,
}

impl ShortTermMemory {
    pub fn from_triple(triple: ExtractedTriple, origin_block_id: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            subject: triple.subject,
            topic: triple.topic,
            object: triple.object,
            attributes: triple.attributes,
            embedded: false,
            importance: triple.importance.clamp(0.0, 1.0),
            activation_count: 0,
            last_accessed: now,
            created_at: now,
            origin_block_ids: vec![origin_block_id.to_string()],
            promoting: false,
        }
    }

    /// Text embedded and shown to the decision model.
    pub fn summary_text(&self) -> String {
        format!("{} {} {}", self.subject, self.topic, self.object)
    }
}

/// Node taxonomy for the long-term memory graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Subject,
    Topic,
    Object,
    Attribute,
    Value,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeType::Subject => "subject",
            NodeType::Topic => "topic",
            NodeType::Object => "object",
            NodeType::Attribute => "attribute",
            NodeType::Value => "value",
        };
        write!(f, "{label}")
    }
}

pub(crate) fn parse_node_type(s: &str) -> NodeType {
    match s {
        "subject" => NodeType::Subject,
        "topic" => NodeType::Topic,
        "object" => NodeType::Object,
        "attribute" => NodeType::Attribute,
        "value" => NodeType::Value,
        _ => NodeType::Object,
    }
}

/// A node in the long-term graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryNode {
    pub id: String,
    pub content: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub embedded: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl MemoryNode {
    pub fn new(content: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            node_type,
            embedded: false,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Edge taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    MemoryType,
    CoreRelation,
    Attribute,
    Causality,
    Reference,
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EdgeType::MemoryType => "memory_type",
            EdgeType::CoreRelation => "core_relation",
            EdgeType::Attribute => "attribute",
            EdgeType::Causality => "causality",
            EdgeType::Reference => "reference",
        };
        write!(f, "{label}")
    }
}

pub(crate) fn parse_edge_type(s: &str) -> EdgeType {
    match s {
        "memory_type" => EdgeType::MemoryType,
        "core_relation" => EdgeType::CoreRelation,
        "attribute" => EdgeType::Attribute,
        "causality" => EdgeType::Causality,
        "reference" => EdgeType::Reference,
        _ => EdgeType::Reference,
    }
}

/// A directed edge between two nodes, or from a node to a memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub edge_type: EdgeType,
    pub importance: f32,
    /// True for edges found by the relation-discovery job rather than
    /// observed in conversation.
    #[serde(default)]
    pub discovered: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl MemoryEdge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: impl Into<String>,
        edge_type: EdgeType,
        importance: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation: relation.into(),
            edge_type,
            importance: importance.clamp(0.0, 1.0),
            discovered: false,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Long-term memory taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LtmKind {
    Event,
    Fact,
    Relation,
    Opinion,
}

impl std::fmt::Display for LtmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LtmKind::Event => "event",
            LtmKind::Fact => "fact",
            LtmKind::Relation => "relation",
            LtmKind::Opinion => "opinion",
        };
        write!(f, "{label}")
    }
}

pub(crate) fn parse_ltm_kind(s: &str) -> LtmKind {
    match s {
        "event" => LtmKind::Event,
        "fact" => LtmKind::Fact,
        "relation" => LtmKind::Relation,
        "opinion" => LtmKind::Opinion,
        _ => LtmKind::Fact,
    }
}

/// A consolidated long-term memory spanning graph nodes and edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongTermMemory {
    pub id: String,
    pub subject_node_id: String,
    pub kind: LtmKind,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub edge_ids: Vec<String>,
    pub importance: f32,
    pub access_count: i64,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub decay_factor: f32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A candidate triple extracted from a promoted perceptual block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedTriple {
    pub subject: String,
    pub topic: String,
    pub object: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default = "default_triple_importance")]
    pub importance: f32,
}

fn default_triple_importance() -> f32 {
    0.5
}

/// Decision the model makes for a candidate against its neighbours.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryDecision {
    Merge {
        target_id: String,
        #[serde(default = "default_importance_delta")]
        importance_delta: f32,
    },
    Update {
        target_id: String,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
    },
    CreateNew,
    Discard,
}

fn default_importance_delta() -> f32 {
    0.05
}

/// Cap on how much one merge may bump importance.
pub const MAX_IMPORTANCE_DELTA: f32 = 0.2;

/// Graph operations the consolidation model emits. Every operation carries
/// explicit target ids so replaying a sequence is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphOperation {
    CreateMemory {
        id: String,
        kind: LtmKind,
        subject_node_id: String,
        #[serde(default)]
        node_ids: Vec<String>,
        #[serde(default)]
        edge_ids: Vec<String>,
        importance: f32,
    },
    UpdateMemory {
        id: String,
        #[serde(default)]
        importance: Option<f32>,
        #[serde(default)]
        add_node_ids: Vec<String>,
        #[serde(default)]
        add_edge_ids: Vec<String>,
    },
    MergeMemories {
        keep_id: String,
        merge_ids: Vec<String>,
    },
    CreateNode {
        id: String,
        content: String,
        node_type: NodeType,
    },
    UpdateNode {
        id: String,
        content: String,
    },
    DeleteNode {
        id: String,
    },
    CreateEdge {
        id: String,
        source_id: String,
        target_id: String,
        relation: String,
        edge_type: EdgeType,
        #[serde(default = "default_edge_importance")]
        importance: f32,
    },
    UpdateEdge {
        id: String,
        #[serde(default)]
        relation: Option<String>,
        #[serde(default)]
        importance: Option<f32>,
    },
    DeleteEdge {
        id: String,
    },
    CreateSubgraph {
        nodes: Vec<SubgraphNode>,
        edges: Vec<SubgraphEdge>,
    },
    QueryGraph {
        node_id: String,
    },
}

fn default_edge_importance() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgraphNode {
    pub id: String,
    pub content: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub edge_type: EdgeType,
    #[serde(default = "default_edge_importance")]
    pub importance: f32,
}

/// Judge verdict during retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeVerdict {
    Sufficient,
    Insufficient,
}

/// Strip an optional markdown code fence and return the JSON body.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .trim_end_matches('`')
        .trim()
}

/// Parse a model response as a JSON array of graph operations. Invalid
/// elements are rejected and counted, never executed.
pub fn parse_operations(text: &str) -> (Vec<GraphOperation>, usize) {
    let body = strip_fence(text);
    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(body) else {
        tracing::warn!("consolidation response is not a JSON array");
        return (Vec::new(), 1);
    };

    let mut operations = Vec::with_capacity(values.len());
    let mut rejected = 0;
    for value in values {
        match serde_json::from_value::<GraphOperation>(value.clone()) {
            Ok(operation) => operations.push(operation),
            Err(error) => {
                rejected += 1;
                tracing::warn!(%error, %value, "rejected graph operation");
            }
        }
    }
    (operations, rejected)
}

/// Parse a model response as extraction triples.
pub fn parse_triples(text: &str) -> Vec<ExtractedTriple> {
    let body = strip_fence(text);
    match serde_json::from_str::<Vec<ExtractedTriple>>(body) {
        Ok(triples) => triples,
        Err(error) => {
            tracing::warn!(%error, "extraction response unparsable, no triples");
            Vec::new()
        }
    }
}

/// Parse the decision model's response; `None` means NO_OP.
pub fn parse_decision(text: &str) -> Option<MemoryDecision> {
    let body = strip_fence(text);
    match serde_json::from_str::<MemoryDecision>(body) {
        Ok(decision) => Some(decision),
        Err(error) => {
            tracing::warn!(%error, "decision response unparsable");
            None
        }
    }
}

/// Parse the judge's sufficiency verdict.
pub fn parse_verdict(text: &str) -> JudgeVerdict {
    if text.to_uppercase().contains("INSUFFICIENT") {
        JudgeVerdict::Insufficient
    } else if text.to_uppercase().contains("SUFFICIENT") {
        JudgeVerdict::Sufficient
    } else {
        JudgeVerdict::Insufficient
    }
}
