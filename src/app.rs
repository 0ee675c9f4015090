//! Application context: constructs and wires the subsystems leaf-up,
//! installs the default routes, and tears everything down in reverse
//! order on shutdown.

use crate::bus::runtime::{FnRouteHandler, MessageRuntime, RouteClass};
use crate::config::Config;
use crate::envelope::{MessageEnvelope, MessageKind};
use crate::error::Result;
use crate::events::{params, EventManager};
use crate::llm::{
    EmbeddingProvider, InMemoryVectorStore, LanguageModel, UnconfiguredEmbedder, UnconfiguredModel,
    VectorStore,
};
use crate::memory::MemoryEngine;
use crate::permission::{PermissionCommand, PermissionStore};
use crate::plugin::deps::{DependencyResolver, NullInstaller, PathProbe};
use crate::plugin::{
    CommandInvocation, ComponentImpl, ComponentMetadata, ComponentRegistry, Plugin, PluginHost,
};
use crate::reply::ReplyGenerator;
use crate::scheduler::UnifiedScheduler;
use crate::stream::{StreamRegistry, StreamStore};
use crate::SYSTEM_GROUP;
use anyhow::Context as _;
use sqlx::SqlitePool;
use std::sync::Arc;

/// External collaborators supplied by the embedding application.
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vector: Arc<dyn VectorStore>,
}

impl Collaborators {
    /// Placeholder collaborators: the platform runs, model-dependent paths
    /// log and NO_OP.
    pub fn unconfigured() -> Self {
        Self {
            model: Arc::new(UnconfiguredModel),
            embedder: Arc::new(UnconfiguredEmbedder),
            vector: InMemoryVectorStore::new(),
        }
    }
}

/// The assembled platform.
pub struct AppContext {
    pub config: Config,
    pub runtime: Arc<MessageRuntime>,
    pub events: Arc<EventManager>,
    pub scheduler: Arc<UnifiedScheduler>,
    pub registry: Arc<ComponentRegistry>,
    pub host: Arc<PluginHost>,
    pub streams: Arc<StreamRegistry>,
    pub memory: Arc<MemoryEngine>,
    pub permissions: Arc<PermissionStore>,
    pub reply: Arc<ReplyGenerator>,
    pub pool: SqlitePool,
}

impl AppContext {
    /// Build against the configured SQLite file.
    pub async fn build(config: Config, collaborators: Collaborators) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
        let url = format!("sqlite://{}?mode=rwc", config.sqlite_path().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await?;
        Self::build_with_pool(config, collaborators, pool).await
    }

    /// Build against an externally provided pool (tests use `:memory:`).
    pub async fn build_with_pool(
        config: Config,
        collaborators: Collaborators,
        pool: SqlitePool,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let stream_store = Arc::new(StreamStore::new(pool.clone()));
        stream_store.initialize().await?;

        let permissions =
            PermissionStore::new(pool.clone(), config.permission.master_users.clone());
        permissions.initialize().await?;

        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let runtime = MessageRuntime::start(config.runtime);
        let streams = StreamRegistry::new(config.runtime.stream_window);

        let memory = MemoryEngine::new(
            config.memory.clone(),
            collaborators.model.clone(),
            collaborators.embedder.clone(),
            collaborators.vector.clone(),
            pool.clone(),
            config.journal_dir(),
        )
        .await?;
        memory.spawn_background_jobs();

        let registry = ComponentRegistry::new();
        let resolver = DependencyResolver::new(
            Arc::new(PathProbe),
            Arc::new(NullInstaller),
            config.dependency_management.clone(),
        );
        let host = PluginHost::new(
            registry.clone(),
            events.clone(),
            resolver,
            config.plugins_dir.clone(),
            config.data_dir.clone(),
        );

        let reply = ReplyGenerator::new(
            config.reply.clone(),
            collaborators.model.clone(),
            memory.clone(),
            registry.clone(),
        );

        // Built-in components.
        registry.register(
            PermissionCommand::component_info(),
            ComponentImpl::Command(PermissionCommand::new(permissions.clone())),
        )?;

        let pipeline = Arc::new(ConversationPipeline {
            streams: streams.clone(),
            stream_store,
            memory: memory.clone(),
            reply: reply.clone(),
            registry: registry.clone(),
            permissions: permissions.clone(),
            events: events.clone(),
            runtime: runtime.clone(),
        });
        install_routes(&runtime, pipeline);

        Ok(Arc::new(Self {
            config,
            runtime,
            events,
            scheduler,
            registry,
            host,
            streams,
            memory,
            permissions,
            reply,
            pool,
        }))
    }

    /// Load a set of plugins through the host.
    pub async fn load_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) {
        let report = self.host.load_all(plugins).await;
        tracing::info!(
            enabled = report.enabled.len(),
            disabled = report.disabled.len(),
            failed = report.failed.len(),
            "plugin load pass finished"
        );
    }

    /// Ordered shutdown: stop intake and drain routes, unload plugins,
    /// cancel the scheduler, flush memory journals, close adapters.
    pub async fn shutdown(&self) {
        self.runtime.quiesce().await;
        self.host.shutdown().await;
        self.scheduler.shutdown();
        self.memory.shutdown().await;
        self.runtime.close_sinks().await;
        tracing::info!("platform stopped");
    }
}

/// Shared handler state for the default routes.
struct ConversationPipeline {
    streams: Arc<StreamRegistry>,
    stream_store: Arc<StreamStore>,
    memory: Arc<MemoryEngine>,
    reply: Arc<ReplyGenerator>,
    registry: Arc<ComponentRegistry>,
    permissions: Arc<PermissionStore>,
    events: Arc<EventManager>,
    runtime: Arc<MessageRuntime>,
}

impl ConversationPipeline {
    /// Conversation path: record, remember, dispatch the `normal_message`
    /// event, then either run a command or generate a reply.
    async fn handle_message(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        let stream_id = envelope.stream_id();
        let stream = self.streams.get_or_create(&stream_id, &envelope.platform);
        stream.record(&envelope).await;
        if let Err(error) = self.stream_store.touch(&stream).await {
            tracing::warn!(%error, "stream persistence failed");
        }

        let text = envelope.plain_text();
        self.memory
            .observe_message(
                stream_id.as_ref(),
                envelope.message_info.user.label(),
                &text,
                envelope.timestamp_ms,
            )
            .await?;

        let dispatch = self
            .events
            .trigger_event(
                "normal_message",
                SYSTEM_GROUP,
                params([
                    ("stream_id", serde_json::json!(stream_id.as_ref())),
                    ("platform", serde_json::json!(envelope.platform)),
                    ("user_id", serde_json::json!(envelope.message_info.user.id)),
                    ("text", serde_json::json!(text)),
                ]),
            )
            .await;
        if dispatch.intercepted_by.is_some() {
            return Ok(());
        }

        // Command path: either a command segment or a leading slash.
        let invocation = envelope
            .message_segment
            .find_command()
            .map(|payload| CommandInvocation {
                verb: payload.name.clone(),
                args: payload.args.clone(),
            })
            .or_else(|| CommandInvocation::parse(&text));
        if let Some(invocation) = invocation {
            return self.run_command(&envelope, invocation).await;
        }

        self.run_actions(&envelope, &text).await;

        if let Some(reply) = self.reply.generate(&stream, &envelope).await? {
            self.runtime.send_outgoing(&reply).await?;
        }
        Ok(())
    }

    /// Execute action components whose trigger matches this message.
    /// Keyword and always-on triggers fire here; model-judged actions are
    /// decided inside reply generation. Action faults are isolated.
    async fn run_actions(&self, envelope: &MessageEnvelope, text: &str) {
        let lowered = text.to_lowercase();
        for (info, implementation) in self.registry.enabled(crate::plugin::ComponentKind::Action) {
            let ComponentImpl::Action(action) = implementation else {
                continue;
            };
            let triggered = match &info.metadata {
                ComponentMetadata::Action { trigger, .. } => match trigger {
                    crate::plugin::ActionTrigger::Always => true,
                    crate::plugin::ActionTrigger::Keyword(keywords) => keywords
                        .iter()
                        .any(|keyword| lowered.contains(&keyword.to_lowercase())),
                    crate::plugin::ActionTrigger::LlmJudged => false,
                },
                _ => false,
            };
            if !triggered {
                continue;
            }

            let ctx = crate::plugin::ActionContext {
                stream_id: envelope.stream_id(),
                envelope: envelope.clone(),
                params: params([("text", serde_json::json!(text))]),
            };
            match action.execute(ctx).await {
                Ok(Some(segment)) => {
                    let mut outgoing = envelope.reply_with_text(segment.plain_text());
                    outgoing.message_segment = segment;
                    if let Err(error) = self.runtime.send_outgoing(&outgoing).await {
                        tracing::warn!(action = %info.name, %error, "action send failed");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(action = %info.name, %error, "action execution failed");
                }
            }
        }
    }

    /// Command dispatch through the permission middleware.
    async fn run_command(
        &self,
        envelope: &MessageEnvelope,
        invocation: CommandInvocation,
    ) -> anyhow::Result<()> {
        let Some((info, command)) = self.registry.find_command(&invocation.verb) else {
            tracing::debug!(verb = %invocation.verb, "no command registered for verb");
            return Ok(());
        };

        if let ComponentMetadata::Command {
            permission_node: Some(node),
            ..
        } = &info.metadata
        {
            let platform = &envelope.platform;
            let user_id = &envelope.message_info.user.id;
            if !self.permissions.check(platform, user_id, node).await? {
                tracing::info!(
                    platform,
                    user_id,
                    node,
                    command = %info.name,
                    "command blocked by permission middleware"
                );
                let denial = envelope
                    .reply_with_text(format!("permission denied: {node} required"));
                self.runtime.send_outgoing(&denial).await?;
                return Ok(());
            }
        }

        match command.run(envelope, &invocation).await? {
            crate::plugin::CommandOutcome::Reply(text) => {
                let reply = envelope.reply_with_text(text);
                if let Some(stream) = self.streams.get(&envelope.stream_id()) {
                    stream.record(&reply).await;
                }
                self.runtime.send_outgoing(&reply).await?;
            }
            crate::plugin::CommandOutcome::Silent => {}
        }
        Ok(())
    }

    /// Platform event path (notice / meta): dispatched as events only.
    async fn handle_platform_event(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        let event_name = match envelope.message_info.message_type {
            MessageKind::Notice => "notice_message",
            _ => "meta_event",
        };
        self.events
            .trigger_event(
                event_name,
                SYSTEM_GROUP,
                params([
                    ("platform", serde_json::json!(envelope.platform)),
                    ("stream_id", serde_json::json!(envelope.stream_id().as_ref())),
                    (
                        "raw",
                        serde_json::json!(envelope.raw_message.clone().unwrap_or_default()),
                    ),
                ]),
            )
            .await;
        Ok(())
    }
}

fn install_routes(runtime: &Arc<MessageRuntime>, pipeline: Arc<ConversationPipeline>) {
    let for_private = pipeline.clone();
    runtime.add_route(
        "private_message",
        RouteClass::Typed(MessageKind::Private),
        Arc::new(|envelope: &MessageEnvelope| envelope.is_incoming()),
        FnRouteHandler::new(move |envelope| {
            let pipeline = for_private.clone();
            async move { pipeline.handle_message(envelope).await }
        }),
    );

    let for_group = pipeline.clone();
    runtime.add_route(
        "group_message",
        RouteClass::Typed(MessageKind::Group),
        Arc::new(|envelope: &MessageEnvelope| envelope.is_incoming()),
        FnRouteHandler::new(move |envelope| {
            let pipeline = for_group.clone();
            async move { pipeline.handle_message(envelope).await }
        }),
    );

    let for_events = pipeline;
    runtime.add_route(
        "platform_event",
        RouteClass::Event,
        Arc::new(|envelope: &MessageEnvelope| envelope.is_incoming()),
        FnRouteHandler::new(move |envelope| {
            let pipeline = for_events.clone();
            async move { pipeline.handle_platform_event(envelope).await }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sink::{InProcessSink, SubprocessSink};
    use crate::envelope::testing::private_text;
    use crate::error::BusError;
    use crate::events::EventParams;
    use crate::llm::testing::FixedEmbedder;
    use crate::llm::CompletionRequest;
    use crate::plugin::{
        CommandLike, CommandOutcome, ComponentInfo, ComponentKind, PluginContext, PluginManifest,
    };
    use crate::scheduler::{callback, ScheduleRequest, TriggerSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Model that answers by prompt shape: extraction prompts get an empty
    /// triple list, judge prompts expand, everything else gets an echo.
    struct RoutedFakeModel;

    #[async_trait]
    impl LanguageModel for RoutedFakeModel {
        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            if request.prompt.contains("Extract durable memories") {
                return Ok("[]".into());
            }
            if request.prompt.contains("SUFFICIENT or INSUFFICIENT") {
                return Ok("INSUFFICIENT".into());
            }
            if request.prompt.contains("YES or NO") {
                return Ok("NO".into());
            }
            Ok("echo reply".into())
        }
    }

    async fn build_app() -> Arc<AppContext> {
        let mut config = Config::default();
        config.data_dir =
            std::env::temp_dir().join(format!("driftbot-app-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&config.data_dir).unwrap();

        let collaborators = Collaborators {
            model: Arc::new(RoutedFakeModel),
            embedder: FixedEmbedder::new(8),
            vector: InMemoryVectorStore::new(),
        };
        let pool = crate::memory::store::testing::memory_pool().await;
        AppContext::build_with_pool(config, collaborators, pool)
            .await
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn simple_reply_round_trip() {
        let app = build_app().await;
        let (sink, mut outbound_rx) = InProcessSink::new("qq");
        app.runtime.register_sink(sink);

        for index in 0..5 {
            app.runtime
                .push_incoming(private_text("qq", "1", "hello", 1_000 + index))
                .unwrap();
        }
        settle().await;

        // One reply per inbound message, addressed to the same pair.
        let reply = outbound_rx.recv().await.unwrap();
        assert_eq!(reply.platform, "qq");
        assert_eq!(reply.message_info.user.id, "1");
        assert_eq!(reply.plain_text(), "echo reply");
        assert_eq!(reply.stream_id().as_ref(), "qq:private:1");

        // Five exchanges produced at least one closed perceptual block.
        assert!(app.memory.perceptual_block_count().await >= 1);

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn cold_start_schedule_fires_on_event() {
        let app = build_app().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

        let seen_clone = seen.clone();
        app.scheduler
            .create(
                ScheduleRequest::new(
                    "proactive",
                    TriggerSpec::on_event("ProactiveInitiationEvent"),
                )
                .recurring(),
                callback(move |params: EventParams| {
                    let seen = seen_clone.clone();
                    async move {
                        let stream_id = params
                            .get("stream_id")
                            .and_then(|value| value.as_str())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push(stream_id);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        app.events
            .trigger_event(
                "ProactiveInitiationEvent",
                SYSTEM_GROUP,
                params([("stream_id", serde_json::json!("qq:private:42"))]),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["qq:private:42"]);

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn permission_denied_command_replies_and_mutates_nothing() {
        struct AdminCommand {
            runs: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl CommandLike for AdminCommand {
            async fn run(
                &self,
                _envelope: &MessageEnvelope,
                _invocation: &CommandInvocation,
            ) -> anyhow::Result<CommandOutcome> {
                self.runs.fetch_add(1, Ordering::SeqCst);
                Ok(CommandOutcome::Reply("admin done".into()))
            }
        }

        struct ExamplePlugin {
            runs: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Plugin for ExamplePlugin {
            fn manifest(&self) -> PluginManifest {
                PluginManifest {
                    name: "example".into(),
                    version: "1.0.0".into(),
                    enabled: true,
                    description: String::new(),
                    dependencies: Vec::new(),
                    config_schema: Vec::new(),
                }
            }

            fn components(&self, _ctx: &PluginContext) -> Vec<(ComponentInfo, ComponentImpl)> {
                vec![(
                    ComponentInfo::new(
                        ComponentKind::Command,
                        "example.admin",
                        "example",
                        ComponentMetadata::Command {
                            verb: "example".into(),
                            usage: "/example admin".into(),
                            permission_node: Some("plugin.example.admin".into()),
                        },
                    ),
                    ComponentImpl::Command(Arc::new(AdminCommand {
                        runs: self.runs.clone(),
                    })),
                )]
            }
        }

        let app = build_app().await;
        let runs = Arc::new(AtomicUsize::new(0));
        app.permissions
            .register_node("plugin.example.admin", "example", "", false)
            .await
            .unwrap();
        app.load_plugins(vec![Arc::new(ExamplePlugin { runs: runs.clone() })])
            .await;

        let (sink, mut outbound_rx) = InProcessSink::new("qq");
        app.runtime.register_sink(sink);

        app.runtime
            .push_incoming(private_text("qq", "9", "/example admin", 1_000))
            .unwrap();
        settle().await;

        let reply = outbound_rx.recv().await.unwrap();
        assert!(reply.plain_text().contains("permission denied"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(outbound_rx.try_recv().is_err());

        // A granted user gets through the middleware.
        app.permissions
            .grant("qq", "9", "plugin.example.admin")
            .await
            .unwrap();
        app.runtime
            .push_incoming(private_text("qq", "9", "/example admin", 2_000))
            .unwrap();
        settle().await;

        let reply = outbound_rx.recv().await.unwrap();
        assert_eq!(reply.plain_text(), "admin done");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn permission_command_is_registered_by_default() {
        let app = build_app().await;
        let (sink, mut outbound_rx) = InProcessSink::new("qq");
        app.runtime.register_sink(sink);

        app.runtime
            .push_incoming(private_text("qq", "9", "/permission help", 1_000))
            .unwrap();
        settle().await;

        let reply = outbound_rx.recv().await.unwrap();
        assert!(reply.plain_text().contains("usage: /permission"));

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn adapter_timeout_does_not_wedge_the_runtime() {
        let app = build_app().await;

        // A framed adapter whose API responses never arrive.
        let (silent_sink, _frame_rx) = SubprocessSink::new("qq", Duration::from_millis(50));
        app.runtime.register_sink(silent_sink);

        let error = app
            .runtime
            .call_adapter_api("qq", "send_msg", serde_json::json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            crate::Error::Bus(BusError::AdapterTimeout { .. })
        ));

        // Subsequent envelopes still flow end to end through a live sink.
        let (sink, mut outbound_rx) = InProcessSink::new("tg");
        app.runtime.register_sink(sink);
        app.runtime
            .push_incoming(private_text("tg", "5", "still alive?", 1_000))
            .unwrap();
        settle().await;
        assert_eq!(outbound_rx.recv().await.unwrap().plain_text(), "echo reply");

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn keyword_action_fires_alongside_reply() {
        use crate::envelope::Segment;
        use crate::plugin::{ActionContext, ActionLike, ActionTrigger};

        struct DiceAction;

        #[async_trait]
        impl ActionLike for DiceAction {
            async fn execute(&self, _ctx: ActionContext) -> anyhow::Result<Option<Segment>> {
                Ok(Some(Segment::text("you rolled a 4")))
            }
        }

        let app = build_app().await;
        app.registry
            .register(
                ComponentInfo::new(
                    ComponentKind::Action,
                    "demo.dice",
                    "demo",
                    ComponentMetadata::Action {
                        trigger: ActionTrigger::Keyword(vec!["roll".into()]),
                        prompt_template: String::new(),
                    },
                ),
                ComponentImpl::Action(Arc::new(DiceAction)),
            )
            .unwrap();

        let (sink, mut outbound_rx) = InProcessSink::new("qq");
        app.runtime.register_sink(sink);

        app.runtime
            .push_incoming(private_text("qq", "1", "roll the dice", 1_000))
            .unwrap();
        settle().await;

        let mut texts = vec![
            outbound_rx.recv().await.unwrap().plain_text(),
            outbound_rx.recv().await.unwrap().plain_text(),
        ];
        texts.sort();
        assert_eq!(texts, vec!["echo reply", "you rolled a 4"]);

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }

    #[tokio::test]
    async fn notice_envelopes_dispatch_events_not_replies() {
        let app = build_app().await;
        let (sink, mut outbound_rx) = InProcessSink::new("qq");
        app.runtime.register_sink(sink);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        app.events.subscribe(
            "notice_message",
            crate::events::FnHandler::new("notice-counter", move |_params: EventParams| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(crate::events::HandlerResult::ok("notice-counter"))
                }
            }),
            1,
            false,
            SYSTEM_GROUP,
        );

        let mut notice = private_text("qq", "1", "member joined", 1_000);
        notice.message_info.message_type = MessageKind::Notice;
        app.runtime.push_incoming(notice).unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(outbound_rx.try_recv().is_err());

        app.shutdown().await;
        std::fs::remove_dir_all(&app.config.data_dir).ok();
    }
}
