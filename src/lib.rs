//! Driftbot: core runtime for a conversational-agent platform.
//!
//! Adapters feed platform events in as [`envelope::MessageEnvelope`]s. The
//! message bus routes them per-stream through hooks and routes, the plugin
//! host contributes components (actions, commands, tools, event handlers,
//! interest calculators, prompts), and the reply pipeline augments outgoing
//! messages with context recalled from a three-tier memory engine.
//!
//! Concrete language models, embedding providers, the vector index, and
//! messenger wire protocols live outside this crate behind the traits in
//! [`llm`] and the sink/frame boundary in [`bus`].

pub mod app;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod permission;
pub mod plugin;
pub mod reply;
pub mod scheduler;
pub mod stream;

pub use error::{Error, Result};

use std::sync::Arc;

/// Conversation stream identifier, derived from platform plus the group or
/// peer id (`"qq:group:123"`, `"qq:private:42"`).
pub type StreamId = Arc<str>;

/// Plugin identifier type.
pub type PluginId = Arc<str>;

/// Name of the permission group that matches every handler.
pub const SYSTEM_GROUP: &str = "SYSTEM";
