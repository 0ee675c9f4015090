//! Permission system: durable permission nodes, per-user grants, and the
//! middleware consulted on every command or action invocation.

pub mod command;

pub use command::PermissionCommand;

use crate::error::{PermissionError, Result};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};
use std::sync::Arc;

/// Node every administrative permission operation requires.
pub const ADMIN_NODE: &str = "core.permission.admin";

/// A declared permission node.
#[derive(Debug, Clone)]
pub struct PermissionNode {
    pub node_name: String,
    pub plugin: String,
    pub description: String,
    pub default_grant: bool,
}

/// Durable permission state plus the master-user list from config.
pub struct PermissionStore {
    pool: SqlitePool,
    masters: Vec<(String, String)>,
}

impl PermissionStore {
    pub fn new(pool: SqlitePool, masters: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(Self { pool, masters })
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_nodes (
                node_name TEXT PRIMARY KEY,
                plugin TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                default_grant INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create permission_nodes table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_permissions (
                platform TEXT NOT NULL,
                user_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                granted_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (platform, user_id, node_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create user_permissions table")?;

        // The admin node always exists.
        self.register_node(ADMIN_NODE, "core", "manage permission grants", false)
            .await?;

        Ok(())
    }

    /// Declare a permission node. Idempotent; plugins call this while
    /// registering components.
    pub async fn register_node(
        &self,
        node_name: &str,
        plugin: &str,
        description: &str,
        default_grant: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permission_nodes (node_name, plugin, description, default_grant)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_name) DO UPDATE SET
                description = excluded.description,
                default_grant = excluded.default_grant
            "#,
        )
        .bind(node_name)
        .bind(plugin)
        .bind(description)
        .bind(default_grant)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to register permission node {node_name}"))?;
        Ok(())
    }

    pub fn is_master(&self, platform: &str, user_id: &str) -> bool {
        self.masters
            .iter()
            .any(|(p, u)| p == platform && u == user_id)
    }

    async fn node(&self, node_name: &str) -> Result<Option<PermissionNode>> {
        let row = sqlx::query(
            "SELECT node_name, plugin, description, default_grant FROM permission_nodes \
             WHERE node_name = ?",
        )
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load permission node")?;
        Ok(row.map(|row| PermissionNode {
            node_name: row.try_get("node_name").unwrap_or_default(),
            plugin: row.try_get("plugin").unwrap_or_default(),
            description: row.try_get("description").unwrap_or_default(),
            default_grant: row.try_get("default_grant").unwrap_or(false),
        }))
    }

    pub async fn grant(&self, platform: &str, user_id: &str, node_name: &str) -> Result<()> {
        if self.node(node_name).await?.is_none() {
            return Err(PermissionError::UnknownNode(node_name.to_string()).into());
        }
        sqlx::query(
            "INSERT OR IGNORE INTO user_permissions (platform, user_id, node_name) VALUES (?, ?, ?)",
        )
        .bind(platform)
        .bind(user_id)
        .bind(node_name)
        .execute(&self.pool)
        .await
        .context("failed to grant permission")?;
        tracing::info!(platform, user_id, node = node_name, "permission granted");
        Ok(())
    }

    pub async fn revoke(&self, platform: &str, user_id: &str, node_name: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM user_permissions WHERE platform = ? AND user_id = ? AND node_name = ?",
        )
        .bind(platform)
        .bind(user_id)
        .bind(node_name)
        .execute(&self.pool)
        .await
        .context("failed to revoke permission")?;
        tracing::info!(platform, user_id, node = node_name, "permission revoked");
        Ok(())
    }

    /// Whether a user holds a node: masters always, then the node's
    /// default grant, then an explicit user grant.
    pub async fn check(&self, platform: &str, user_id: &str, node_name: &str) -> Result<bool> {
        if self.is_master(platform, user_id) {
            return Ok(true);
        }
        if let Some(node) = self.node(node_name).await? {
            if node.default_grant {
                return Ok(true);
            }
        }
        let row = sqlx::query(
            "SELECT 1 FROM user_permissions WHERE platform = ? AND user_id = ? AND node_name = ? \
             LIMIT 1",
        )
        .bind(platform)
        .bind(user_id)
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check permission")?;
        Ok(row.is_some())
    }

    /// Middleware entry point: error with [`PermissionError::Denied`] when
    /// the user lacks the node.
    pub async fn ensure(&self, platform: &str, user_id: &str, node_name: &str) -> Result<()> {
        if self.check(platform, user_id, node_name).await? {
            Ok(())
        } else {
            Err(PermissionError::Denied {
                node: node_name.to_string(),
            }
            .into())
        }
    }

    pub async fn list_user(&self, platform: &str, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT node_name FROM user_permissions WHERE platform = ? AND user_id = ? \
             ORDER BY node_name",
        )
        .bind(platform)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list user permissions")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("node_name").ok())
            .collect())
    }

    pub async fn list_nodes(&self) -> Result<Vec<PermissionNode>> {
        let rows = sqlx::query(
            "SELECT node_name, plugin, description, default_grant FROM permission_nodes \
             ORDER BY node_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list permission nodes")?;
        Ok(rows
            .into_iter()
            .map(|row| PermissionNode {
                node_name: row.try_get("node_name").unwrap_or_default(),
                plugin: row.try_get("plugin").unwrap_or_default(),
                description: row.try_get("description").unwrap_or_default(),
                default_grant: row.try_get("default_grant").unwrap_or(false),
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn store_with_masters(masters: Vec<(String, String)>) -> Arc<PermissionStore> {
        let pool = crate::memory::store::testing::memory_pool().await;
        let store = PermissionStore::new(pool, masters);
        store.initialize().await.unwrap();
        store
    }
}

#[cfg(test)]
mod tests {
    use super::testing::store_with_masters;
    use super::*;

    #[tokio::test]
    async fn grant_check_revoke_round_trip() {
        let store = store_with_masters(vec![]).await;
        store
            .register_node("plugin.example.admin", "example", "admin things", false)
            .await
            .unwrap();

        assert!(!store.check("qq", "9", "plugin.example.admin").await.unwrap());
        store.grant("qq", "9", "plugin.example.admin").await.unwrap();
        assert!(store.check("qq", "9", "plugin.example.admin").await.unwrap());

        store.revoke("qq", "9", "plugin.example.admin").await.unwrap();
        assert!(!store.check("qq", "9", "plugin.example.admin").await.unwrap());
    }

    #[tokio::test]
    async fn grant_of_unknown_node_fails() {
        let store = store_with_masters(vec![]).await;
        let error = store.grant("qq", "9", "no.such.node").await.unwrap_err();
        assert!(matches!(
            error,
            crate::Error::Permission(PermissionError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn masters_pass_every_check() {
        let store = store_with_masters(vec![("qq".into(), "1".into())]).await;
        assert!(store.check("qq", "1", "anything.at.all").await.unwrap());
        assert!(!store.check("qq", "2", "anything.at.all").await.unwrap());
    }

    #[tokio::test]
    async fn default_grant_nodes_allow_everyone() {
        let store = store_with_masters(vec![]).await;
        store
            .register_node("plugin.example.use", "example", "basic use", true)
            .await
            .unwrap();
        assert!(store.check("qq", "9", "plugin.example.use").await.unwrap());
    }

    #[tokio::test]
    async fn ensure_returns_denied() {
        let store = store_with_masters(vec![]).await;
        store
            .register_node("plugin.example.admin", "example", "", false)
            .await
            .unwrap();
        let error = store
            .ensure("qq", "9", "plugin.example.admin")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            crate::Error::Permission(PermissionError::Denied { .. })
        ));
    }
}
