//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Driftbot configuration, loaded from a TOML file with serde defaults for
/// every key so a missing file yields a fully usable config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Data directory for SQLite and the staging journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory scanned for plugin manifests and per-plugin config files.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default, rename = "three_tier_memory")]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub permission: PermissionConfig,

    #[serde(default)]
    pub dependency_management: DependencyConfig,

    #[serde(default)]
    pub reply: ReplyConfig,

    #[serde(default)]
    pub adapter_http: AdapterHttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        // An empty TOML document is the all-defaults config.
        toml::from_str("").unwrap_or_else(|_| unreachable!("empty config must parse"))
    }
}

/// Message bus and runtime tunables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the bounded inbound envelope queue.
    pub inbound_queue_capacity: usize,

    /// Seconds to wait for an echo-correlated adapter API response.
    pub api_timeout_secs: u64,

    /// Seconds allowed for in-flight route tasks to drain at shutdown.
    pub drain_timeout_secs: u64,

    /// Maximum retries for transient outbound send failures.
    pub max_send_retries: u32,

    /// Base delay for outbound retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Cap on the backoff delay, in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Ring capacity of each chat stream's recent-message window.
    pub stream_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: 1024,
            api_timeout_secs: 10,
            drain_timeout_secs: 10,
            max_send_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            stream_window: 50,
        }
    }
}

/// Three-tier memory engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enable: bool,
    pub perceptual_max_blocks: usize,
    pub perceptual_block_size: usize,
    pub perceptual_similarity_threshold: f32,
    pub perceptual_topk: usize,
    pub short_term_max_memories: usize,
    pub short_term_transfer_threshold: f32,
    pub short_term_decay_factor: f32,
    pub activation_threshold: u32,
    pub long_term_batch_size: usize,
    pub long_term_decay_factor: f32,
    /// Seconds between consolidation drains of the transfer queue.
    pub long_term_auto_transfer_interval: u64,
    pub judge_model_name: String,
    pub judge_temperature: f32,
    pub enable_judge_retrieval: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            perceptual_max_blocks: 50,
            perceptual_block_size: 5,
            perceptual_similarity_threshold: 0.55,
            perceptual_topk: 3,
            short_term_max_memories: 100,
            short_term_transfer_threshold: 0.6,
            short_term_decay_factor: 0.98,
            activation_threshold: 3,
            long_term_batch_size: 10,
            long_term_decay_factor: 0.95,
            long_term_auto_transfer_interval: 600,
            judge_model_name: "judge-mini".into(),
            judge_temperature: 0.2,
            enable_judge_retrieval: true,
        }
    }
}

/// Permission system configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// `(platform, user_id)` pairs that bypass every permission check.
    pub master_users: Vec<(String, String)>,
}

impl PermissionConfig {
    pub fn is_master(&self, platform: &str, user_id: &str) -> bool {
        self.master_users
            .iter()
            .any(|(p, u)| p == platform && u == user_id)
    }
}

/// Plugin dependency auto-install policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub auto_install: bool,
    /// Seconds before an install attempt is abandoned.
    pub auto_install_timeout: u64,
    pub use_proxy: bool,
    pub proxy_url: Option<String>,
    /// Install names eligible for auto-install. Empty means none.
    pub allowed_auto_install: Vec<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            auto_install: false,
            auto_install_timeout: 300,
            use_proxy: false,
            proxy_url: None,
            allowed_auto_install: Vec::new(),
        }
    }
}

/// Reply generator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Model name handed to the language-model collaborator.
    pub model_name: String,
    pub temperature: f32,
    /// Group messages below this interest score get no reply.
    pub interest_threshold: f32,
    /// Recent-window messages rendered into the prompt.
    pub context_messages: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            model_name: "default".into(),
            temperature: 0.7,
            interest_threshold: 0.3,
            context_messages: 20,
        }
    }
}

/// HTTP adapter endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterHttpConfig {
    pub enable: bool,
    pub bind: String,
}

impl Default for AdapterHttpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bind: "127.0.0.1:8082".into(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("driftbot"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

impl Config {
    /// Load configuration from a TOML file, or all defaults when `path` is
    /// `None` and no `driftbot.toml` exists in the working directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let p = PathBuf::from("driftbot.toml");
                p.exists().then_some(p)
            }
        };

        let config = match candidate {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Load {
                    path: path.display().to_string(),
                    source,
                })?;
                let config: Config = toml::from_str(&text).map_err(ConfigError::Parse)?;
                tracing::info!(path = %path.display(), "configuration loaded");
                config
            }
            None => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        for (name, value) in [
            (
                "perceptual_similarity_threshold",
                memory.perceptual_similarity_threshold,
            ),
            (
                "short_term_transfer_threshold",
                memory.short_term_transfer_threshold,
            ),
            ("short_term_decay_factor", memory.short_term_decay_factor),
            ("long_term_decay_factor", memory.long_term_decay_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "three_tier_memory.{name} must be within [0, 1], got {value}"
                ))
                .into());
            }
        }

        if memory.perceptual_block_size == 0 {
            return Err(
                ConfigError::Invalid("three_tier_memory.perceptual_block_size must be > 0".into())
                    .into(),
            );
        }
        if self.runtime.inbound_queue_capacity == 0 {
            return Err(
                ConfigError::Invalid("runtime.inbound_queue_capacity must be > 0".into()).into(),
            );
        }

        Ok(())
    }

    /// Path of the SQLite database file.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("driftbot.db")
    }

    /// Directory holding the memory staging journals.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journals")
    }
}
