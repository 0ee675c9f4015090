//! Top-level error types for driftbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Message bus and adapter boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no adapter registered for platform: {0}")]
    NoAdapterForPlatform(String),

    #[error("adapter {platform} did not answer {action} within {waited_secs}s")]
    AdapterTimeout {
        platform: String,
        action: String,
        waited_secs: u64,
    },

    #[error("inbound queue full")]
    BufferFull,

    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    #[error("transient adapter failure: {0}")]
    TransientAdapter(String),

    #[error("adapter send failed: {0}")]
    SendFailed(String),
}

impl BusError {
    /// Whether the outbound path should retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::TransientAdapter(_))
    }
}

/// Intentional short-circuit signal returned by before-hooks.
///
/// Not a fault: the error hook logs it at info level and the envelope is
/// silently dropped. Carried through `anyhow::Error` so hooks keep an
/// ordinary `Result` signature; the runtime downcasts to tell it apart.
#[derive(Debug, thiserror::Error)]
#[error("message skipped by hook")]
pub struct SkipMessage;

/// Plugin discovery, lifecycle, and component registration errors.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("duplicate component {kind}/{name}")]
    DuplicateComponent { kind: String, name: String },

    #[error("plugin {plugin} is missing required dependency {dependency}")]
    MissingDependency { plugin: String, dependency: String },

    #[error("plugin {plugin} requires {dependency} {required}, found {found}")]
    DependencyVersion {
        plugin: String,
        dependency: String,
        required: String,
        found: String,
    },

    #[error("plugin {plugin} failed during {phase}: {source}")]
    LifecycleFailed {
        plugin: String,
        phase: &'static str,
        source: anyhow::Error,
    },

    #[error("invalid plugin manifest at {path}: {reason}")]
    ManifestInvalid { path: String, reason: String },

    #[error("unknown component {kind}/{name}")]
    UnknownComponent { kind: String, name: String },
}

/// Unified scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule entry not found: {0}")]
    EntryNotFound(String),

    #[error("invalid trigger config: {0}")]
    InvalidTrigger(String),
}

/// Memory engine errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("language model call failed: {0}")]
    ModelFailed(String),

    #[error("consolidation batch failed: {0}")]
    Consolidation(String),

    #[error("rejected graph operation: {0}")]
    InvalidOperation(String),

    #[error("memory node not found: {0}")]
    NodeNotFound(String),

    #[error("journal write failed at {path}: {source}")]
    Journal {
        path: String,
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Permission system errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("permission denied: missing node {node}")]
    Denied { node: String },

    #[error("unknown permission node: {0}")]
    UnknownNode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
