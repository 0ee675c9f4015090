//! Component registry: lookup by `(kind, name)` with duplicate rejection.

use super::{CommandLike, ComponentImpl, ComponentInfo, ComponentKind, ComponentMetadata};
use crate::error::PluginError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct Registered {
    info: ComponentInfo,
    implementation: ComponentImpl,
}

/// The registry. Reads happen on every message; writes only during plugin
/// lifecycle, so a reader/writer lock fits the access pattern.
pub struct ComponentRegistry {
    components: RwLock<HashMap<(ComponentKind, String), Registered>>,
}

impl ComponentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            components: RwLock::new(HashMap::new()),
        })
    }

    /// Register one component. Names are unique per kind.
    pub fn register(
        &self,
        info: ComponentInfo,
        implementation: ComponentImpl,
    ) -> Result<(), PluginError> {
        debug_assert_eq!(info.kind, implementation.kind());
        let key = (info.kind, info.name.clone());
        let mut components = self.components.write().expect("registry poisoned");
        if components.contains_key(&key) {
            return Err(PluginError::DuplicateComponent {
                kind: info.kind.to_string(),
                name: info.name,
            });
        }
        tracing::debug!(kind = %info.kind, name = %info.name, plugin = %info.plugin, "component registered");
        components.insert(key, Registered {
            info,
            implementation,
        });
        Ok(())
    }

    pub fn get(&self, kind: ComponentKind, name: &str) -> Option<(ComponentInfo, ComponentImpl)> {
        let components = self.components.read().expect("registry poisoned");
        components
            .get(&(kind, name.to_string()))
            .map(|registered| (registered.info.clone(), registered.implementation.clone()))
    }

    /// All component infos of a kind, enabled or not.
    pub fn list(&self, kind: ComponentKind) -> Vec<ComponentInfo> {
        let components = self.components.read().expect("registry poisoned");
        let mut infos: Vec<ComponentInfo> = components
            .values()
            .filter(|registered| registered.info.kind == kind)
            .map(|registered| registered.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Enabled components of a kind with their implementations.
    pub fn enabled(&self, kind: ComponentKind) -> Vec<(ComponentInfo, ComponentImpl)> {
        let components = self.components.read().expect("registry poisoned");
        let mut entries: Vec<(ComponentInfo, ComponentImpl)> = components
            .values()
            .filter(|registered| registered.info.kind == kind && registered.info.enabled)
            .map(|registered| (registered.info.clone(), registered.implementation.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        entries
    }

    /// Find the enabled command component (COMMAND first, then
    /// PLUS_COMMAND) registered for a verb.
    pub fn find_command(&self, verb: &str) -> Option<(ComponentInfo, Arc<dyn CommandLike>)> {
        let components = self.components.read().expect("registry poisoned");
        for kind in [ComponentKind::Command, ComponentKind::PlusCommand] {
            let found = components.values().find(|registered| {
                registered.info.kind == kind
                    && registered.info.enabled
                    && matches!(
                        &registered.info.metadata,
                        ComponentMetadata::Command { verb: v, .. } if v == verb
                    )
            });
            if let Some(registered) = found {
                let implementation = match &registered.implementation {
                    ComponentImpl::Command(command) | ComponentImpl::PlusCommand(command) => {
                        command.clone()
                    }
                    _ => continue,
                };
                return Some((registered.info.clone(), implementation));
            }
        }
        None
    }

    /// Toggle a component's enabled flag.
    pub fn set_enabled(
        &self,
        kind: ComponentKind,
        name: &str,
        enabled: bool,
    ) -> Result<(), PluginError> {
        let mut components = self.components.write().expect("registry poisoned");
        let registered = components.get_mut(&(kind, name.to_string())).ok_or_else(|| {
            PluginError::UnknownComponent {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        })?;
        registered.info.enabled = enabled;
        Ok(())
    }

    /// Drop every component a plugin registered. Returns how many were
    /// removed.
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let mut components = self.components.write().expect("registry poisoned");
        let before = components.len();
        components.retain(|_, registered| registered.info.plugin != plugin);
        let removed = before - components.len();
        if removed > 0 {
            tracing::debug!(plugin, removed, "plugin components unregistered");
        }
        removed
    }

    pub fn total(&self) -> usize {
        self.components.read().expect("registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{CommandInvocation, CommandOutcome};
    use async_trait::async_trait;

    struct EchoCommand;

    #[async_trait]
    impl CommandLike for EchoCommand {
        async fn run(
            &self,
            _envelope: &crate::envelope::MessageEnvelope,
            invocation: &CommandInvocation,
        ) -> anyhow::Result<CommandOutcome> {
            Ok(CommandOutcome::Reply(invocation.args.join(" ")))
        }
    }

    fn command_info(name: &str, plugin: &str, verb: &str) -> ComponentInfo {
        ComponentInfo::new(
            ComponentKind::Command,
            name,
            plugin,
            ComponentMetadata::Command {
                verb: verb.into(),
                usage: String::new(),
                permission_node: None,
            },
        )
    }

    #[test]
    fn duplicate_names_within_kind_fail() {
        let registry = ComponentRegistry::new();
        registry
            .register(
                command_info("echo", "p1", "echo"),
                ComponentImpl::Command(Arc::new(EchoCommand)),
            )
            .unwrap();
        let error = registry
            .register(
                command_info("echo", "p2", "echo2"),
                ComponentImpl::Command(Arc::new(EchoCommand)),
            )
            .unwrap_err();
        assert!(matches!(error, PluginError::DuplicateComponent { .. }));
    }

    #[test]
    fn find_command_respects_enabled_flag() {
        let registry = ComponentRegistry::new();
        registry
            .register(
                command_info("echo", "p1", "echo"),
                ComponentImpl::Command(Arc::new(EchoCommand)),
            )
            .unwrap();

        assert!(registry.find_command("echo").is_some());
        assert!(registry.find_command("missing").is_none());

        registry
            .set_enabled(ComponentKind::Command, "echo", false)
            .unwrap();
        assert!(registry.find_command("echo").is_none());
    }

    #[test]
    fn unregister_plugin_removes_only_its_components() {
        let registry = ComponentRegistry::new();
        registry
            .register(
                command_info("a", "p1", "a"),
                ComponentImpl::Command(Arc::new(EchoCommand)),
            )
            .unwrap();
        registry
            .register(
                command_info("b", "p2", "b"),
                ComponentImpl::Command(Arc::new(EchoCommand)),
            )
            .unwrap();

        assert_eq!(registry.unregister_plugin("p1"), 1);
        assert_eq!(registry.total(), 1);
        assert!(registry.get(ComponentKind::Command, "b").is_some());
    }
}
