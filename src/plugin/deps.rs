//! Plugin dependency resolution and the auto-install policy.
//!
//! Plugins declare runtime dependencies on external helper programs. Before
//! `on_load`, each is probed for presence and version; missing dependencies
//! are installed when the global policy permits, otherwise the plugin fails
//! (required) or a warning is logged (optional).

use crate::config::DependencyConfig;
use crate::error::PluginError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;

/// One declared dependency in a plugin manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencySpec {
    pub import_name: String,
    /// Semver requirement string (e.g. `">=1.2, <2"`).
    #[serde(default)]
    pub version: Option<String>,
    /// Name handed to the installer when different from `import_name`.
    #[serde(default)]
    pub install_name: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
}

impl DependencySpec {
    pub fn required(import_name: impl Into<String>) -> Self {
        Self {
            import_name: import_name.into(),
            version: None,
            install_name: None,
            optional: false,
            description: String::new(),
        }
    }

    fn install_name(&self) -> &str {
        self.install_name.as_deref().unwrap_or(&self.import_name)
    }
}

/// Presence probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Missing,
    /// Present; version is `None` when the probe cannot determine it.
    Present { version: Option<semver::Version> },
}

/// Checks whether a dependency is available in the environment.
pub trait DependencyProbe: Send + Sync {
    fn probe(&self, import_name: &str) -> ProbeResult;
}

/// Installs a missing dependency.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(
        &self,
        install_name: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<()>;
}

/// Probe that looks the dependency up as an executable on `PATH`.
/// Versions are unknown; requirement checks are skipped with a debug log.
pub struct PathProbe;

impl DependencyProbe for PathProbe {
    fn probe(&self, import_name: &str) -> ProbeResult {
        let Some(path) = std::env::var_os("PATH") else {
            return ProbeResult::Missing;
        };
        for dir in std::env::split_paths(&path) {
            if dir.join(import_name).is_file() {
                return ProbeResult::Present { version: None };
            }
        }
        ProbeResult::Missing
    }
}

/// Installer that shells out to a configured install command
/// (`<command> <install_name>`), with proxy environment and a timeout.
pub struct ProcessInstaller {
    pub command: String,
}

#[async_trait]
impl DependencyInstaller for ProcessInstaller {
    async fn install(
        &self,
        install_name: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut command = tokio::process::Command::new(&self.command);
        command.arg(install_name);
        if let Some(proxy) = proxy {
            command.env("HTTPS_PROXY", proxy).env("HTTP_PROXY", proxy);
        }

        let status = tokio::time::timeout(timeout, command.status())
            .await
            .map_err(|_| anyhow::anyhow!("install of {install_name} timed out"))??;

        if !status.success() {
            anyhow::bail!("installer exited with {status}");
        }
        Ok(())
    }
}

/// Resolves a plugin's declared dependencies against the policy in
/// `[dependency_management]`.
pub struct DependencyResolver {
    probe: Arc<dyn DependencyProbe>,
    installer: Arc<dyn DependencyInstaller>,
    policy: DependencyConfig,
}

impl DependencyResolver {
    pub fn new(
        probe: Arc<dyn DependencyProbe>,
        installer: Arc<dyn DependencyInstaller>,
        policy: DependencyConfig,
    ) -> Self {
        Self {
            probe,
            installer,
            policy,
        }
    }

    /// Resolve all dependencies for a plugin. Returns an error when a
    /// required dependency is still missing or version-incompatible after
    /// any permitted install attempt.
    pub async fn resolve(
        &self,
        plugin: &str,
        dependencies: &[DependencySpec],
    ) -> Result<(), PluginError> {
        for dependency in dependencies {
            self.resolve_one(plugin, dependency).await?;
        }
        Ok(())
    }

    async fn resolve_one(
        &self,
        plugin: &str,
        dependency: &DependencySpec,
    ) -> Result<(), PluginError> {
        let mut state = self.probe.probe(&dependency.import_name);

        if state == ProbeResult::Missing && self.may_install(dependency) {
            let proxy = self
                .policy
                .use_proxy
                .then(|| self.policy.proxy_url.clone())
                .flatten();
            let timeout = Duration::from_secs(self.policy.auto_install_timeout);
            tracing::info!(
                plugin,
                dependency = %dependency.import_name,
                "auto-installing missing dependency"
            );
            match self
                .installer
                .install(dependency.install_name(), proxy.as_deref(), timeout)
                .await
            {
                Ok(()) => state = self.probe.probe(&dependency.import_name),
                Err(error) => {
                    tracing::warn!(
                        plugin,
                        dependency = %dependency.import_name,
                        %error,
                        "dependency install failed"
                    );
                }
            }
        }

        match state {
            ProbeResult::Missing => {
                if dependency.optional {
                    tracing::warn!(
                        plugin,
                        dependency = %dependency.import_name,
                        "optional dependency missing"
                    );
                    Ok(())
                } else {
                    Err(PluginError::MissingDependency {
                        plugin: plugin.to_string(),
                        dependency: dependency.import_name.clone(),
                    })
                }
            }
            ProbeResult::Present { version } => self.check_version(plugin, dependency, version),
        }
    }

    fn check_version(
        &self,
        plugin: &str,
        dependency: &DependencySpec,
        found: Option<semver::Version>,
    ) -> Result<(), PluginError> {
        let Some(requirement) = &dependency.version else {
            return Ok(());
        };
        let requirement: semver::VersionReq = match requirement.parse() {
            Ok(requirement) => requirement,
            Err(error) => {
                tracing::warn!(
                    plugin,
                    dependency = %dependency.import_name,
                    requirement = %requirement,
                    %error,
                    "unparsable version requirement, skipping check"
                );
                return Ok(());
            }
        };

        let Some(found) = found else {
            tracing::debug!(
                plugin,
                dependency = %dependency.import_name,
                "probe reports no version; requirement not verifiable"
            );
            return Ok(());
        };

        if requirement.matches(&found) {
            return Ok(());
        }

        if dependency.optional {
            // Present-but-old optional deps count as present.
            tracing::warn!(
                plugin,
                dependency = %dependency.import_name,
                found = %found,
                required = %requirement,
                "optional dependency below required version"
            );
            return Ok(());
        }

        Err(PluginError::DependencyVersion {
            plugin: plugin.to_string(),
            dependency: dependency.import_name.clone(),
            required: requirement.to_string(),
            found: found.to_string(),
        })
    }

    fn may_install(&self, dependency: &DependencySpec) -> bool {
        self.policy.auto_install
            && self
                .policy
                .allowed_auto_install
                .iter()
                .any(|allowed| allowed == dependency.install_name())
    }
}

/// Static probe for tests and embedded wiring.
#[derive(Default)]
pub struct StaticProbe {
    present: std::sync::Mutex<HashMap<String, Option<semver::Version>>>,
}

impl StaticProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, import_name: impl Into<String>, version: Option<semver::Version>) {
        self.present
            .lock()
            .expect("probe poisoned")
            .insert(import_name.into(), version);
    }
}

impl DependencyProbe for StaticProbe {
    fn probe(&self, import_name: &str) -> ProbeResult {
        match self.present.lock().expect("probe poisoned").get(import_name) {
            Some(version) => ProbeResult::Present {
                version: version.clone(),
            },
            None => ProbeResult::Missing,
        }
    }
}

/// Installer that refuses everything; the default when no install command
/// is configured.
pub struct NullInstaller;

#[async_trait]
impl DependencyInstaller for NullInstaller {
    async fn install(
        &self,
        install_name: &str,
        _proxy: Option<&str>,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no installer configured (wanted {install_name})")
    }
}
