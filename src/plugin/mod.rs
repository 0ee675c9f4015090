//! Plugin and component model.
//!
//! A plugin is a compiled-in unit registered with the host; its on-disk
//! manifest and config file control enablement and settings. Components are
//! the registered units of behaviour, one small trait per kind, returned
//! from [`Plugin::components`] and dispatched through the
//! [`registry::ComponentRegistry`].

pub mod deps;
pub mod host;
pub mod registry;
pub mod settings;

pub use deps::{DependencyResolver, DependencySpec};
pub use host::{PluginHost, PluginState};
pub use registry::ComponentRegistry;
pub use settings::{ConfigOption, PluginSettings};

use crate::envelope::{MessageEnvelope, Segment};
use crate::events::{EventHandler, EventParams};
use crate::stream::StreamMessage;
use crate::StreamId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Component taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentKind {
    Action,
    Command,
    PlusCommand,
    Tool,
    EventHandler,
    InterestCalculator,
    Prompt,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ComponentKind::Action => "ACTION",
            ComponentKind::Command => "COMMAND",
            ComponentKind::PlusCommand => "PLUS_COMMAND",
            ComponentKind::Tool => "TOOL",
            ComponentKind::EventHandler => "EVENT_HANDLER",
            ComponentKind::InterestCalculator => "INTEREST_CALCULATOR",
            ComponentKind::Prompt => "PROMPT",
        };
        write!(f, "{label}")
    }
}

/// When an action component wants to run.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTrigger {
    /// Any of these keywords appearing in the message text.
    Keyword(Vec<String>),
    /// The reply model decides based on the action's prompt template.
    LlmJudged,
    /// Every routed message.
    Always,
}

/// Kind-specific component metadata.
#[derive(Debug, Clone)]
pub enum ComponentMetadata {
    Action {
        trigger: ActionTrigger,
        prompt_template: String,
    },
    Command {
        verb: String,
        usage: String,
        permission_node: Option<String>,
    },
    Tool {
        description: String,
        parameters: serde_json::Value,
    },
    EventHandler {
        events: Vec<String>,
        weight: i32,
        intercept: bool,
        permission_group: String,
    },
    InterestCalculator,
    Prompt {
        injection_point: String,
    },
}

/// A registered component's identity and metadata.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub kind: ComponentKind,
    pub name: String,
    pub plugin: String,
    pub enabled: bool,
    pub metadata: ComponentMetadata,
}

impl ComponentInfo {
    pub fn new(
        kind: ComponentKind,
        name: impl Into<String>,
        plugin: impl Into<String>,
        metadata: ComponentMetadata,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            plugin: plugin.into(),
            enabled: true,
            metadata,
        }
    }

    /// The command verb, for command-kind components.
    pub fn command_verb(&self) -> Option<&str> {
        match &self.metadata {
            ComponentMetadata::Command { verb, .. } => Some(verb),
            _ => None,
        }
    }
}

/// Context handed to an executing action.
pub struct ActionContext {
    pub stream_id: StreamId,
    pub envelope: MessageEnvelope,
    pub params: EventParams,
}

/// Action component: produces an optional reply segment.
#[async_trait]
pub trait ActionLike: Send + Sync {
    async fn execute(&self, ctx: ActionContext) -> anyhow::Result<Option<Segment>>;
}

/// Outcome of a command run.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Reply(String),
    Silent,
}

/// Command component, shared by COMMAND and PLUS_COMMAND kinds.
#[async_trait]
pub trait CommandLike: Send + Sync {
    async fn run(
        &self,
        envelope: &MessageEnvelope,
        invocation: &CommandInvocation,
    ) -> anyhow::Result<CommandOutcome>;
}

/// Tool definition advertised to the reply model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments (typically derived with `schemars`).
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Build a definition whose parameter schema is derived from a
    /// `schemars`-annotated argument type.
    pub fn for_args<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schemars::schema_for!(T);
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::to_value(schema).unwrap_or_default(),
        }
    }
}

/// Tool component invocable by the reply model.
#[async_trait]
pub trait ToolLike: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Interest calculator: scores how much a group message deserves a reply.
#[async_trait]
pub trait InterestCalculatorLike: Send + Sync {
    async fn score(
        &self,
        envelope: &MessageEnvelope,
        recent: &[StreamMessage],
    ) -> anyhow::Result<f32>;
}

/// Prompt component: contributes a fragment to the reply prompt.
#[async_trait]
pub trait PromptLike: Send + Sync {
    async fn render(&self, envelope: &MessageEnvelope) -> anyhow::Result<String>;
}

/// Implementation reference for a registered component.
#[derive(Clone)]
pub enum ComponentImpl {
    Action(Arc<dyn ActionLike>),
    Command(Arc<dyn CommandLike>),
    PlusCommand(Arc<dyn CommandLike>),
    Tool(Arc<dyn ToolLike>),
    EventHandler(Arc<dyn EventHandler>),
    InterestCalculator(Arc<dyn InterestCalculatorLike>),
    Prompt(Arc<dyn PromptLike>),
}

impl ComponentImpl {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentImpl::Action(_) => ComponentKind::Action,
            ComponentImpl::Command(_) => ComponentKind::Command,
            ComponentImpl::PlusCommand(_) => ComponentKind::PlusCommand,
            ComponentImpl::Tool(_) => ComponentKind::Tool,
            ComponentImpl::EventHandler(_) => ComponentKind::EventHandler,
            ComponentImpl::InterestCalculator(_) => ComponentKind::InterestCalculator,
            ComponentImpl::Prompt(_) => ComponentKind::Prompt,
        }
    }
}

/// Plugin manifest: identity, dependency list, and config schema. Also
/// parseable from an on-disk `plugin.toml` for enablement overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub config_schema: Vec<ConfigOption>,
}

fn default_true() -> bool {
    true
}

/// Context handed to plugin lifecycle hooks and component construction.
#[derive(Clone)]
pub struct PluginContext {
    pub settings: PluginSettings,
    pub data_dir: std::path::PathBuf,
}

/// The plugin contract. Lifecycle: `on_load → on_enable → (runtime) →
/// on_disable → on_unload`. Async initialization belongs in `on_enable`.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> PluginManifest;

    /// The components this plugin contributes, constructed against the
    /// plugin's resolved settings.
    fn components(&self, ctx: &PluginContext) -> Vec<(ComponentInfo, ComponentImpl)>;

    async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enable(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A parsed command line (`/verb args...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub verb: String,
    pub args: Vec<String>,
}

impl CommandInvocation {
    /// Parse a message text as a slash command. Shared by every command
    /// component so quoting behaves uniformly.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('/')?;
        if body.is_empty() {
            return None;
        }
        let mut parts = split_args(body);
        if parts.is_empty() {
            return None;
        }
        let verb = parts.remove(0);
        Some(Self { verb, args: parts })
    }
}

/// Shell-like argument splitting: whitespace-separated, with single and
/// double quotes grouping, and backslash escapes inside double quotes.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                    }
                } else {
                    current.push(c);
                }
            }
            None => {
                if c.is_whitespace() {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                } else if c == '"' || c == '\'' {
                    quote = Some(c);
                    in_word = true;
                } else {
                    current.push(c);
                    in_word = true;
                }
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_handles_quotes_and_escapes() {
        assert_eq!(split_args("a b c"), vec!["a", "b", "c"]);
        assert_eq!(split_args(r#"grant "some user" node"#), vec![
            "grant",
            "some user",
            "node"
        ]);
        assert_eq!(split_args("say 'hello world'"), vec!["say", "hello world"]);
        assert_eq!(split_args(r#"echo "a \"quoted\" word""#), vec![
            "echo",
            r#"a "quoted" word"#
        ]);
        assert_eq!(split_args("  padded   words  "), vec!["padded", "words"]);
        assert!(split_args("").is_empty());
        // Empty quoted string is still an argument.
        assert_eq!(split_args(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn command_invocation_parse() {
        let invocation = CommandInvocation::parse("/permission grant qq 9 node.x").unwrap();
        assert_eq!(invocation.verb, "permission");
        assert_eq!(invocation.args, vec!["grant", "qq", "9", "node.x"]);

        assert!(CommandInvocation::parse("not a command").is_none());
        assert!(CommandInvocation::parse("/").is_none());
        assert!(CommandInvocation::parse("  /ping  ").is_some());
    }

    #[test]
    fn component_kind_display_matches_wire_names() {
        assert_eq!(ComponentKind::PlusCommand.to_string(), "PLUS_COMMAND");
        assert_eq!(ComponentKind::EventHandler.to_string(), "EVENT_HANDLER");
    }

    #[tokio::test]
    async fn tool_definition_derives_parameter_schema() {
        #[derive(serde::Deserialize, schemars::JsonSchema)]
        struct EchoArgs {
            text: String,
            #[serde(default)]
            #[allow(dead_code)]
            uppercase: bool,
        }

        struct EchoTool;

        #[async_trait]
        impl ToolLike for EchoTool {
            fn definition(&self) -> ToolDefinition {
                ToolDefinition::for_args::<EchoArgs>("echo", "echo the given text")
            }

            async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
                let args: EchoArgs = serde_json::from_value(args)?;
                Ok(serde_json::json!({"text": args.text}))
            }
        }

        let definition = EchoTool.definition();
        assert_eq!(definition.name, "echo");
        let schema = definition.parameters.to_string();
        assert!(schema.contains("text"));
        assert!(schema.contains("uppercase"));

        let result = EchoTool
            .call(serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"text": "hi"}));
    }
}
