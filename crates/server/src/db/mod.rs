use anyhow::Result;
use async_trait::async_trait;
use shared::Role;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::authz::{WorkspaceRef, WorkspaceStore};
use crate::identity::IdentityProfile;

mod models;

pub use models::*;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &str) -> Result<Self> {
        // Ensure the directory exists
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database on a single long-lived connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_id TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                avatar TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                owner_id TEXT NOT NULL REFERENCES users(id),
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspace_members (
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id),
                role TEXT NOT NULL,
                added_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (workspace_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    // User operations

    /// Create the user on first sign-in; later sign-ins refresh email and avatar
    pub async fn upsert_user_from_profile(&self, profile: &IdentityProfile) -> Result<User> {
        if let Some(existing) = self.get_user_by_external_id(&profile.external_id).await? {
            sqlx::query(
                r#"
                UPDATE users
                SET email = ?, avatar = COALESCE(avatar, ?), updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
            )
            .bind(profile.email.to_lowercase())
            .bind(&profile.avatar)
            .bind(&existing.id)
            .execute(&self.pool)
            .await?;
        } else {
            let name = if profile.name.trim().is_empty() {
                profile
                    .email
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            } else {
                profile.name.clone()
            };
            sqlx::query(
                "INSERT INTO users (id, external_id, email, name, avatar) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&profile.external_id)
            .bind(profile.email.to_lowercase())
            .bind(name)
            .bind(&profile.avatar)
            .execute(&self.pool)
            .await?;
            tracing::info!("Created user for {}", profile.email);
        }

        self.get_user_by_external_id(&profile.external_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished after upsert"))
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_id, email, name, avatar, role, created_at, updated_at FROM users WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_id, email, name, avatar, role, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_id, email, name, avatar, role, created_at, updated_at FROM users WHERE email = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn update_user_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<Option<User>> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET name = COALESCE(?, name), avatar = COALESCE(?, avatar), updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(avatar)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_user_by_id(id).await
    }

    // Workspace operations

    pub async fn create_workspace(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> Result<Workspace> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO workspaces (id, name, description, owner_id) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(description)
            .bind(owner_id.to_string())
            .execute(&self.pool)
            .await?;

        self.get_workspace(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workspace vanished after insert"))
    }

    pub async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        let workspace = sqlx::query_as::<_, Workspace>(
            "SELECT id, name, description, owner_id, created_at, updated_at FROM workspaces WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(workspace)
    }

    // Membership operations

    pub async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<MemberRow>> {
        let members = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT m.user_id, u.email, u.name, m.role
            FROM workspace_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.workspace_id = ?
            ORDER BY m.added_at ASC, m.rowid ASC
            "#,
        )
        .bind(workspace_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn get_member_role(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM workspace_members WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match role {
            Some(raw) => Ok(Some(raw.parse::<Role>()?)),
            None => Ok(None),
        }
    }

    /// Returns `false` when the user already has a membership
    pub async fn add_member(&self, workspace_id: Uuid, user_id: Uuid, role: Role) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role)
            VALUES (?, ?, ?)
            ON CONFLICT(workspace_id, user_id) DO NOTHING
            "#,
        )
        .bind(workspace_id.to_string())
        .bind(user_id.to_string())
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_member_role(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workspace_members SET role = ? WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(role.as_str())
        .bind(workspace_id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM workspace_members WHERE workspace_id = ? AND user_id = ?")
                .bind(workspace_id.to_string())
                .bind(user_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl WorkspaceStore for Database {
    async fn find_workspace(&self, id: Uuid) -> Result<Option<WorkspaceRef>> {
        match self.get_workspace(id).await? {
            Some(workspace) => Ok(Some(WorkspaceRef {
                id: workspace.uuid()?,
                owner_id: workspace.owner_uuid()?,
            })),
            None => Ok(None),
        }
    }

    async fn find_membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        self.get_member_role(workspace_id, user_id).await
    }
}
