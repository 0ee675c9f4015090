//! Prompt templates for the memory engine's model calls.

use crate::memory::types::ShortTermMemory;
use anyhow::Context as _;
use minijinja::{context, Environment};

const EXTRACTION: &str = r#"Extract durable memories from this conversation excerpt.

Return a JSON array of triples. Each triple:
{"subject": "...", "topic": "...", "object": "...", "attributes": {"key": "value"}, "importance": 0.0-1.0}

Only include facts worth remembering beyond this conversation. Return [] if nothing qualifies.

Conversation:
{{ block_text }}"#;

const DECISION: &str = r#"A new candidate memory arrived. Decide what to do with it given its nearest existing memories.

Candidate: {{ candidate }}
Attributes: {{ attributes }}

Existing memories:
{% for neighbour in neighbours -%}
{{ loop.index }}. id={{ neighbour.id }} (similarity {{ neighbour.similarity }}): {{ neighbour.summary }}
{% endfor %}
Reply with exactly one JSON object:
{"op": "MERGE", "target_id": "...", "importance_delta": 0.05}
{"op": "UPDATE", "target_id": "...", "attributes": {"key": "new value"}}
{"op": "CREATE_NEW"}
{"op": "DISCARD"}

MERGE folds compatible details into an existing memory. UPDATE replaces contradicted attributes. CREATE_NEW stores a genuinely new memory. DISCARD drops noise."#;

const CONSOLIDATION: &str = r#"Consolidate these short-term memories into the long-term memory graph.

Memories to consolidate:
{% for memory in batch -%}
- [{{ memory.id }}] {{ memory.subject }} / {{ memory.topic }} / {{ memory.object }}{% if memory.attributes %} ({{ memory.attributes }}){% endif %}
{% endfor %}
Relevant existing graph neighbourhood:
{{ neighbourhood }}

Return a JSON array of graph operations. Available ops:
CREATE_MEMORY, UPDATE_MEMORY, MERGE_MEMORIES, CREATE_NODE, UPDATE_NODE, DELETE_NODE,
CREATE_EDGE, UPDATE_EDGE, DELETE_EDGE, CREATE_SUBGRAPH, QUERY_GRAPH

Every op carries explicit ids, e.g.
{"op": "CREATE_NODE", "id": "n-meet", "content": "meet", "node_type": "TOPIC"}
{"op": "CREATE_EDGE", "id": "e-1", "source_id": "n-we", "target_id": "n-meet", "relation": "plans", "edge_type": "CORE_RELATION", "importance": 0.6}
{"op": "CREATE_MEMORY", "id": "m-1", "kind": "EVENT", "subject_node_id": "n-we", "node_ids": ["n-we", "n-meet"], "edge_ids": ["e-1"], "importance": 0.7}"#;

const JUDGE: &str = r#"Query: {{ query }}

Retrieved so far:
{% for hit in hits -%}
- {{ hit }}
{% endfor %}
Is this enough to answer the query? Reply with exactly one word: SUFFICIENT or INSUFFICIENT."#;

const CAUSALITY: &str = r#"Two memories were recorded within an hour of each other.

Earlier: {{ earlier }}
Later: {{ later }}

Does the earlier one plausibly cause or explain the later one? Reply with exactly one word: YES or NO."#;

/// A neighbour shown to the decision model.
#[derive(serde::Serialize)]
pub struct DecisionNeighbour {
    pub id: String,
    pub summary: String,
    pub similarity: f32,
}

/// Compiled template set.
pub struct MemoryPrompts {
    env: Environment<'static>,
}

impl MemoryPrompts {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Static templates; add_template only fails on syntax errors.
        for (name, source) in [
            ("extraction", EXTRACTION),
            ("decision", DECISION),
            ("consolidation", CONSOLIDATION),
            ("judge", JUDGE),
            ("causality", CAUSALITY),
        ] {
            env.add_template(name, source)
                .unwrap_or_else(|error| panic!("template {name} failed to compile: {error}"));
        }
        Self { env }
    }

    pub fn extraction(&self, block_text: &str) -> anyhow::Result<String> {
        self.render("extraction", context! { block_text })
    }

    pub fn decision(
        &self,
        candidate: &ShortTermMemory,
        neighbours: &[DecisionNeighbour],
    ) -> anyhow::Result<String> {
        self.render(
            "decision",
            context! {
                candidate => candidate.summary_text(),
                attributes => serde_json::to_string(&candidate.attributes).unwrap_or_default(),
                neighbours,
            },
        )
    }

    pub fn consolidation(
        &self,
        batch: &[ShortTermMemory],
        neighbourhood: &str,
    ) -> anyhow::Result<String> {
        #[derive(serde::Serialize)]
        struct BatchEntry {
            id: String,
            subject: String,
            topic: String,
            object: String,
            attributes: String,
        }
        let batch: Vec<BatchEntry> = batch
            .iter()
            .map(|memory| BatchEntry {
                id: memory.id.clone(),
                subject: memory.subject.clone(),
                topic: memory.topic.clone(),
                object: memory.object.clone(),
                attributes: if memory.attributes.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&memory.attributes).unwrap_or_default()
                },
            })
            .collect();
        self.render("consolidation", context! { batch, neighbourhood })
    }

    pub fn judge(&self, query: &str, hits: &[String]) -> anyhow::Result<String> {
        self.render("judge", context! { query, hits })
    }

    pub fn causality(&self, earlier: &str, later: &str) -> anyhow::Result<String> {
        self.render("causality", context! { earlier, later })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> anyhow::Result<String> {
        self.env
            .get_template(name)
            .with_context(|| format!("missing template {name}"))?
            .render(ctx)
            .with_context(|| format!("failed to render template {name}"))
    }
}

impl Default for MemoryPrompts {
    fn default() -> Self {
        Self::new()
    }
}
