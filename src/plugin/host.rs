//! Plugin host: discovery, dependency resolution, lifecycle, and
//! registration of plugin components.

use super::deps::DependencyResolver;
use super::registry::ComponentRegistry;
use super::{
    ComponentImpl, ComponentInfo, ComponentMetadata, Plugin, PluginContext, PluginManifest,
    PluginSettings,
};
use crate::error::PluginError;
use crate::events::EventManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle state of a hosted plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Disabled,
    Enabled,
    Failed,
    Unloaded,
}

struct HostedPlugin {
    plugin: Arc<dyn Plugin>,
    name: String,
    state: PluginState,
}

/// Summary of a `load_all` pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns plugin lifecycle and wires plugin components into the registry and
/// event manager.
pub struct PluginHost {
    registry: Arc<ComponentRegistry>,
    events: Arc<EventManager>,
    resolver: DependencyResolver,
    plugins_dir: PathBuf,
    data_dir: PathBuf,
    plugins: Mutex<Vec<HostedPlugin>>,
}

impl PluginHost {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        events: Arc<EventManager>,
        resolver: DependencyResolver,
        plugins_dir: PathBuf,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            resolver,
            plugins_dir,
            data_dir,
            plugins: Mutex::new(Vec::new()),
        })
    }

    /// Load, resolve, and enable a set of plugins. A failing plugin is
    /// marked failed and its components rolled back; the rest continue.
    pub async fn load_all(&self, plugins: Vec<Arc<dyn Plugin>>) -> LoadReport {
        let mut report = LoadReport::default();

        for plugin in plugins {
            let manifest = plugin.manifest();
            let name = manifest.name.clone();

            match self.load_one(plugin.clone(), manifest).await {
                Ok(PluginState::Enabled) => {
                    tracing::info!(plugin = %name, "plugin enabled");
                    report.enabled.push(name.clone());
                    self.track(plugin, name, PluginState::Enabled).await;
                }
                Ok(state) => {
                    tracing::info!(plugin = %name, ?state, "plugin not enabled");
                    report.disabled.push(name.clone());
                    self.track(plugin, name, state).await;
                }
                Err(error) => {
                    tracing::error!(plugin = %name, %error, "plugin failed to load");
                    self.rollback(&name);
                    report.failed.push((name.clone(), error.to_string()));
                    self.track(plugin, name, PluginState::Failed).await;
                }
            }
        }

        report
    }

    async fn load_one(
        &self,
        plugin: Arc<dyn Plugin>,
        manifest: PluginManifest,
    ) -> Result<PluginState, PluginError> {
        validate_manifest(&manifest)?;
        let manifest = self.apply_disk_override(manifest);

        if !manifest.enabled {
            return Ok(PluginState::Disabled);
        }

        self.resolver
            .resolve(&manifest.name, &manifest.dependencies)
            .await?;

        let settings =
            PluginSettings::load(&manifest.config_schema, &self.plugins_dir, &manifest.name);
        let ctx = PluginContext {
            settings,
            data_dir: self.data_dir.clone(),
        };

        plugin
            .on_load(&ctx)
            .await
            .map_err(|source| PluginError::LifecycleFailed {
                plugin: manifest.name.clone(),
                phase: "on_load",
                source,
            })?;

        for (info, implementation) in plugin.components(&ctx) {
            self.register_component(&manifest.name, info, implementation)?;
        }

        plugin
            .on_enable(&ctx)
            .await
            .map_err(|source| PluginError::LifecycleFailed {
                plugin: manifest.name.clone(),
                phase: "on_enable",
                source,
            })?;

        Ok(PluginState::Enabled)
    }

    fn register_component(
        &self,
        plugin: &str,
        info: ComponentInfo,
        implementation: ComponentImpl,
    ) -> Result<(), PluginError> {
        // Event handler components also subscribe at the event manager.
        if let (
            ComponentMetadata::EventHandler {
                events,
                weight,
                intercept,
                permission_group,
            },
            ComponentImpl::EventHandler(handler),
        ) = (&info.metadata, &implementation)
        {
            for event in events {
                self.events.subscribe_for_plugin(
                    event,
                    handler.clone(),
                    *weight,
                    *intercept,
                    permission_group,
                    Some(plugin.to_string()),
                );
            }
        }

        self.registry.register(info, implementation)
    }

    /// Undo everything a partially loaded plugin registered.
    fn rollback(&self, plugin: &str) {
        self.registry.unregister_plugin(plugin);
        self.events.unsubscribe_plugin(plugin);
    }

    async fn track(&self, plugin: Arc<dyn Plugin>, name: String, state: PluginState) {
        self.plugins.lock().await.push(HostedPlugin {
            plugin,
            name,
            state,
        });
    }

    /// Read the on-disk manifest override (`<plugins_dir>/<name>/plugin.toml`)
    /// when present. Only the enabled flag and dependency list are taken
    /// from disk; identity stays with the compiled-in manifest.
    fn apply_disk_override(&self, mut manifest: PluginManifest) -> PluginManifest {
        let path = self.plugins_dir.join(&manifest.name).join("plugin.toml");
        let Ok(text) = std::fs::read_to_string(&path) else {
            return manifest;
        };
        match toml::from_str::<PluginManifest>(&text) {
            Ok(disk) => {
                manifest.enabled = disk.enabled;
                if !disk.dependencies.is_empty() {
                    manifest.dependencies = disk.dependencies;
                }
                manifest
            }
            Err(error) => {
                tracing::warn!(
                    plugin = %manifest.name,
                    path = %path.display(),
                    %error,
                    "ignoring unparsable plugin manifest override"
                );
                manifest
            }
        }
    }

    /// Tear down all plugins in reverse load order.
    pub async fn shutdown(&self) {
        let mut plugins = self.plugins.lock().await;
        for hosted in plugins.iter_mut().rev() {
            if hosted.state != PluginState::Enabled {
                continue;
            }
            if let Err(error) = hosted.plugin.on_disable().await {
                tracing::warn!(plugin = %hosted.name, %error, "on_disable failed");
            }
            if let Err(error) = hosted.plugin.on_unload().await {
                tracing::warn!(plugin = %hosted.name, %error, "on_unload failed");
            }
            self.rollback(&hosted.name);
            hosted.state = PluginState::Unloaded;
            tracing::info!(plugin = %hosted.name, "plugin unloaded");
        }
    }

    pub async fn state_of(&self, name: &str) -> Option<PluginState> {
        let plugins = self.plugins.lock().await;
        plugins
            .iter()
            .find(|hosted| hosted.name == name)
            .map(|hosted| hosted.state)
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }
}

fn validate_manifest(manifest: &PluginManifest) -> Result<(), PluginError> {
    if manifest.name.trim().is_empty() {
        return Err(PluginError::ManifestInvalid {
            path: "<embedded>".into(),
            reason: "plugin name is empty".into(),
        });
    }
    if manifest.version.parse::<semver::Version>().is_err() {
        return Err(PluginError::ManifestInvalid {
            path: "<embedded>".into(),
            reason: format!("version '{}' is not semver", manifest.version),
        });
    }
    Ok(())
}
