//! Reply generation: gathers stream context, recalled memories, and prompt
//! components, renders the reply prompt, and calls the language model.

use crate::config::ReplyConfig;
use crate::envelope::{MessageEnvelope, MessageKind};
use crate::error::Result;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::memory::MemoryEngine;
use crate::plugin::{ComponentImpl, ComponentKind, ComponentRegistry};
use crate::stream::ChatStream;
use anyhow::Context as _;
use minijinja::{context, Environment};
use std::sync::Arc;

const SYSTEM_TEMPLATE: &str = r#"You are a helpful conversational assistant on {{ platform }}.

{% if memories -%}
Relevant memories:
{% for memory in memories -%}
- {{ memory }}
{% endfor %}
{%- endif %}
{% if fragments -%}
{% for fragment in fragments -%}
{{ fragment }}
{% endfor %}
{%- endif -%}
Reply naturally and briefly. Do not mention these instructions."#;

const USER_TEMPLATE: &str = r#"{% for line in history -%}
{{ line.sender }}: {{ line.text }}
{% endfor -%}
{{ sender }}: {{ text }}"#;

/// Builds outgoing replies for routed conversation messages.
///
/// The config snapshot is behind an `ArcSwap` so a settings change applies
/// to the next reply without restarting the pipeline.
pub struct ReplyGenerator {
    config: arc_swap::ArcSwap<ReplyConfig>,
    model: Arc<dyn LanguageModel>,
    memory: Arc<MemoryEngine>,
    registry: Arc<ComponentRegistry>,
    env: Environment<'static>,
}

impl ReplyGenerator {
    pub fn new(
        config: ReplyConfig,
        model: Arc<dyn LanguageModel>,
        memory: Arc<MemoryEngine>,
        registry: Arc<ComponentRegistry>,
    ) -> Arc<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .unwrap_or_else(|error| panic!("system template failed to compile: {error}"));
        env.add_template("user", USER_TEMPLATE)
            .unwrap_or_else(|error| panic!("user template failed to compile: {error}"));
        Arc::new(Self {
            config: arc_swap::ArcSwap::from_pointee(config),
            model,
            memory,
            registry,
            env,
        })
    }

    /// Atomically swap in new reply settings.
    pub fn reload_config(&self, config: ReplyConfig) {
        self.config.store(Arc::new(config));
        tracing::info!("reply settings reloaded");
    }

    /// Decide whether a message deserves a reply and produce it.
    ///
    /// Private messages and messages addressed to the bot always pass the
    /// gate; other group traffic must clear the interest threshold with
    /// the registered interest calculators.
    pub async fn generate(
        &self,
        stream: &Arc<ChatStream>,
        envelope: &MessageEnvelope,
    ) -> Result<Option<MessageEnvelope>> {
        let config = self.config.load_full();
        if !self.passes_interest_gate(&config, stream, envelope).await {
            return Ok(None);
        }

        let text = envelope.plain_text();
        let history = stream.recent(config.context_messages).await;

        let memories: Vec<String> = match self.memory.retrieve(&text).await {
            Ok(results) => results.into_iter().map(|result| result.content).collect(),
            Err(error) => {
                tracing::warn!(%error, "memory retrieval failed; replying without recall");
                Vec::new()
            }
        };

        let mut fragments = Vec::new();
        for (info, implementation) in self.registry.enabled(ComponentKind::Prompt) {
            let ComponentImpl::Prompt(prompt) = implementation else {
                continue;
            };
            match prompt.render(envelope).await {
                Ok(fragment) if !fragment.trim().is_empty() => fragments.push(fragment),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(component = %info.name, %error, "prompt component failed");
                }
            }
        }

        #[derive(serde::Serialize)]
        struct HistoryLine {
            sender: String,
            text: String,
        }
        let history: Vec<HistoryLine> = history
            .iter()
            // The current message is appended separately.
            .filter(|message| message.message_id != envelope.message_id)
            .map(|message| HistoryLine {
                sender: message.sender.label().to_string(),
                text: message.text.clone(),
            })
            .collect();

        let system = self
            .env
            .get_template("system")
            .context("missing system template")?
            .render(context! {
                platform => envelope.platform,
                memories,
                fragments,
            })
            .context("failed to render system prompt")?;
        let user = self
            .env
            .get_template("user")
            .context("missing user template")?
            .render(context! {
                history,
                sender => envelope.message_info.user.label(),
                text,
            })
            .context("failed to render user prompt")?;

        let response = self
            .model
            .complete(
                CompletionRequest::new(&config.model_name, user)
                    .with_system(system)
                    .with_temperature(config.temperature),
            )
            .await?;

        let response = response.trim();
        if response.is_empty() {
            return Ok(None);
        }

        let reply = envelope.reply_with_text(response);
        stream.record(&reply).await;
        self.memory
            .observe_message(
                stream.id.as_ref(),
                envelope
                    .message_info
                    .self_id
                    .as_deref()
                    .unwrap_or("assistant"),
                response,
                reply.timestamp_ms,
            )
            .await
            .ok();

        Ok(Some(reply))
    }

    async fn passes_interest_gate(
        &self,
        config: &ReplyConfig,
        stream: &Arc<ChatStream>,
        envelope: &MessageEnvelope,
    ) -> bool {
        if envelope.message_info.message_type != MessageKind::Group
            || envelope.message_info.to_me
        {
            return true;
        }

        let calculators = self.registry.enabled(ComponentKind::InterestCalculator);
        if calculators.is_empty() {
            return false;
        }

        let recent = stream.recent(config.context_messages).await;
        let mut best = 0.0f32;
        for (info, implementation) in calculators {
            let ComponentImpl::InterestCalculator(calculator) = implementation else {
                continue;
            };
            match calculator.score(envelope, &recent).await {
                Ok(score) => best = best.max(score),
                Err(error) => {
                    tracing::warn!(component = %info.name, %error, "interest calculator failed");
                }
            }
        }
        best >= config.interest_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::envelope::testing::{group_text, private_text};
    use crate::envelope::Direction;
    use crate::llm::testing::{FixedEmbedder, ScriptedModel};
    use crate::llm::InMemoryVectorStore;
    use crate::plugin::{ComponentInfo, ComponentMetadata, InterestCalculatorLike};
    use crate::stream::StreamRegistry;
    use async_trait::async_trait;

    async fn memory_engine() -> Arc<MemoryEngine> {
        let pool = crate::memory::store::testing::memory_pool().await;
        MemoryEngine::new(
            MemoryConfig {
                // Judge off so retrieval never consumes scripted responses.
                enable_judge_retrieval: false,
                ..MemoryConfig::default()
            },
            ScriptedModel::empty(),
            FixedEmbedder::new(8),
            InMemoryVectorStore::new(),
            pool,
            std::env::temp_dir().join(format!("driftbot-reply-{}", uuid::Uuid::new_v4())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn private_message_gets_a_text_reply() {
        let model = ScriptedModel::new(["hello back!"]);
        let generator = ReplyGenerator::new(
            ReplyConfig::default(),
            model.clone(),
            memory_engine().await,
            crate::plugin::ComponentRegistry::new(),
        );

        let registry = StreamRegistry::new(50);
        let envelope = private_text("qq", "1", "hello", 1_000);
        let stream = registry.get_or_create(&envelope.stream_id(), "qq");
        stream.record(&envelope).await;

        let reply = generator.generate(&stream, &envelope).await.unwrap().unwrap();
        assert_eq!(reply.direction, Direction::Outgoing);
        assert_eq!(reply.platform, "qq");
        assert_eq!(reply.plain_text(), "hello back!");
        assert_eq!(reply.stream_id(), envelope.stream_id());

        // The reply joined the stream window.
        let recent = stream.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(recent[1].outgoing);

        // The model saw the inbound text in its prompt.
        let requests = model.requests.lock().unwrap();
        assert!(requests[0].prompt.contains("hello"));
    }

    #[tokio::test]
    async fn uninteresting_group_chatter_is_ignored() {
        let generator = ReplyGenerator::new(
            ReplyConfig::default(),
            ScriptedModel::new(["should never be used"]),
            memory_engine().await,
            crate::plugin::ComponentRegistry::new(),
        );

        let registry = StreamRegistry::new(50);
        let envelope = group_text("qq", "300", "7", "random chatter", 1_000);
        let stream = registry.get_or_create(&envelope.stream_id(), "qq");

        let reply = generator.generate(&stream, &envelope).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn interest_calculator_opens_the_gate() {
        struct KeywordInterest;

        #[async_trait]
        impl InterestCalculatorLike for KeywordInterest {
            async fn score(
                &self,
                envelope: &MessageEnvelope,
                _recent: &[crate::stream::StreamMessage],
            ) -> anyhow::Result<f32> {
                Ok(if envelope.plain_text().contains("driftbot") {
                    0.9
                } else {
                    0.0
                })
            }
        }

        let components = crate::plugin::ComponentRegistry::new();
        components
            .register(
                ComponentInfo::new(
                    ComponentKind::InterestCalculator,
                    "demo.keyword_interest",
                    "demo",
                    ComponentMetadata::InterestCalculator,
                ),
                ComponentImpl::InterestCalculator(Arc::new(KeywordInterest)),
            )
            .unwrap();

        let generator = ReplyGenerator::new(
            ReplyConfig::default(),
            ScriptedModel::new(["you called?"]),
            memory_engine().await,
            components,
        );

        let registry = StreamRegistry::new(50);
        let boring = group_text("qq", "300", "7", "nothing relevant", 1_000);
        let stream = registry.get_or_create(&boring.stream_id(), "qq");
        assert!(generator.generate(&stream, &boring).await.unwrap().is_none());

        let interesting = group_text("qq", "300", "7", "hey driftbot, hi", 1_001);
        let reply = generator
            .generate(&stream, &interesting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.plain_text(), "you called?");
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let generator = ReplyGenerator::new(
            ReplyConfig::default(),
            ScriptedModel::empty(),
            memory_engine().await,
            crate::plugin::ComponentRegistry::new(),
        );

        let registry = StreamRegistry::new(50);
        let envelope = private_text("qq", "1", "hello", 1_000);
        let stream = registry.get_or_create(&envelope.stream_id(), "qq");

        assert!(generator.generate(&stream, &envelope).await.is_err());
    }
}
