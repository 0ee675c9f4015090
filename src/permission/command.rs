//! The `permission` command component: grant, revoke, list, check, nodes,
//! help.

use super::{PermissionStore, ADMIN_NODE};
use crate::envelope::MessageEnvelope;
use crate::plugin::{
    CommandInvocation, CommandLike, CommandOutcome, ComponentInfo, ComponentKind,
    ComponentMetadata,
};
use async_trait::async_trait;
use std::sync::Arc;

const USAGE: &str = "usage: /permission <grant|revoke|list|check|nodes|help> ...";

/// Command component backed by the permission store.
pub struct PermissionCommand {
    store: Arc<PermissionStore>,
}

impl PermissionCommand {
    pub fn new(store: Arc<PermissionStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Component record for registration by the core plugin.
    pub fn component_info() -> ComponentInfo {
        ComponentInfo::new(
            ComponentKind::Command,
            "core.permission",
            "core",
            ComponentMetadata::Command {
                verb: "permission".into(),
                usage: USAGE.into(),
                permission_node: None,
            },
        )
    }

    async fn require_admin(&self, envelope: &MessageEnvelope) -> Option<String> {
        let platform = &envelope.platform;
        let user_id = &envelope.message_info.user.id;
        match self.store.check(platform, user_id, ADMIN_NODE).await {
            Ok(true) => None,
            Ok(false) => Some(format!("permission denied: {ADMIN_NODE} required")),
            Err(error) => {
                tracing::error!(%error, "permission check failed");
                Some("permission check failed, try again later".into())
            }
        }
    }
}

#[async_trait]
impl CommandLike for PermissionCommand {
    async fn run(
        &self,
        envelope: &MessageEnvelope,
        invocation: &CommandInvocation,
    ) -> anyhow::Result<CommandOutcome> {
        let args = &invocation.args;
        let subcommand = args.first().map(String::as_str).unwrap_or("help");

        let reply = match subcommand {
            "grant" | "revoke" => {
                if let Some(denial) = self.require_admin(envelope).await {
                    return Ok(CommandOutcome::Reply(denial));
                }
                let [platform, user_id, node] = &args[1..] else {
                    return Ok(CommandOutcome::Reply(format!(
                        "usage: /permission {subcommand} <platform> <user_id> <node>"
                    )));
                };
                let result = if subcommand == "grant" {
                    self.store.grant(platform, user_id, node).await
                } else {
                    self.store.revoke(platform, user_id, node).await
                };
                let past_tense = if subcommand == "grant" {
                    "granted"
                } else {
                    "revoked"
                };
                match result {
                    Ok(()) => format!("{past_tense} {node} for {platform}:{user_id}"),
                    Err(error) => format!("{subcommand} failed: {error}"),
                }
            }
            "list" => {
                let (platform, user_id) = match &args[1..] {
                    [platform, user_id] => (platform.clone(), user_id.clone()),
                    [] => (
                        envelope.platform.clone(),
                        envelope.message_info.user.id.clone(),
                    ),
                    _ => {
                        return Ok(CommandOutcome::Reply(
                            "usage: /permission list [<platform> <user_id>]".into(),
                        ))
                    }
                };
                let nodes = self.store.list_user(&platform, &user_id).await?;
                if nodes.is_empty() {
                    format!("{platform}:{user_id} holds no explicit permissions")
                } else {
                    format!("{platform}:{user_id} holds: {}", nodes.join(", "))
                }
            }
            "check" => {
                let [platform, user_id, node] = &args[1..] else {
                    return Ok(CommandOutcome::Reply(
                        "usage: /permission check <platform> <user_id> <node>".into(),
                    ));
                };
                let held = self.store.check(platform, user_id, node).await?;
                format!(
                    "{platform}:{user_id} {} {node}",
                    if held { "holds" } else { "lacks" }
                )
            }
            "nodes" => {
                let nodes = self.store.list_nodes().await?;
                let lines: Vec<String> = nodes
                    .iter()
                    .map(|node| {
                        format!(
                            "{} ({}){}{}",
                            node.node_name,
                            node.plugin,
                            if node.default_grant { " [default]" } else { "" },
                            if node.description.is_empty() {
                                String::new()
                            } else {
                                format!(" - {}", node.description)
                            }
                        )
                    })
                    .collect();
                if lines.is_empty() {
                    "no permission nodes registered".into()
                } else {
                    lines.join("\n")
                }
            }
            "help" => format!(
                "{USAGE}\n\
                 grant/revoke need {ADMIN_NODE}; list defaults to yourself"
            ),
            other => format!("unknown subcommand '{other}'\n{USAGE}"),
        };

        Ok(CommandOutcome::Reply(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::testing::private_text;
    use crate::permission::testing::store_with_masters;

    fn invocation(line: &str) -> CommandInvocation {
        CommandInvocation::parse(line).unwrap()
    }

    #[tokio::test]
    async fn master_can_grant_and_user_sees_it() {
        let store = store_with_masters(vec![("qq".into(), "1".into())]).await;
        store
            .register_node("plugin.example.admin", "example", "", false)
            .await
            .unwrap();
        let command = PermissionCommand::new(store.clone());

        let master = private_text("qq", "1", "/permission grant qq 9 plugin.example.admin", 1);
        let outcome = command
            .run(
                &master,
                &invocation("/permission grant qq 9 plugin.example.admin"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("granted")));
        assert!(store.check("qq", "9", "plugin.example.admin").await.unwrap());

        let outcome = command
            .run(&master, &invocation("/permission list qq 9"))
            .await
            .unwrap();
        assert!(
            matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("plugin.example.admin"))
        );
    }

    #[tokio::test]
    async fn non_admin_grant_is_denied_without_mutation() {
        let store = store_with_masters(vec![]).await;
        store
            .register_node("plugin.example.admin", "example", "", false)
            .await
            .unwrap();
        let command = PermissionCommand::new(store.clone());

        let outsider = private_text("qq", "9", "/permission grant qq 9 plugin.example.admin", 1);
        let outcome = command
            .run(
                &outsider,
                &invocation("/permission grant qq 9 plugin.example.admin"),
            )
            .await
            .unwrap();
        assert!(
            matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("permission denied"))
        );
        assert!(!store.check("qq", "9", "plugin.example.admin").await.unwrap());
    }

    #[tokio::test]
    async fn check_nodes_and_help_replies() {
        let store = store_with_masters(vec![]).await;
        store
            .register_node("plugin.example.use", "example", "basic use", true)
            .await
            .unwrap();
        let command = PermissionCommand::new(store);
        let envelope = private_text("qq", "9", "/permission nodes", 1);

        let outcome = command
            .run(&envelope, &invocation("/permission check qq 9 plugin.example.use"))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("holds")));

        let outcome = command
            .run(&envelope, &invocation("/permission nodes"))
            .await
            .unwrap();
        assert!(
            matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("plugin.example.use"))
        );

        let outcome = command
            .run(&envelope, &invocation("/permission help"))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("usage")));

        let outcome = command
            .run(&envelope, &invocation("/permission bogus"))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Reply(ref text) if text.contains("unknown")));
    }
}
