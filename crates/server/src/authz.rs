//! Workspace role resolution shared by REST handlers and the chat handshake.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::Role;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceRef {
    pub id: Uuid,
    pub owner_id: Uuid,
}

/// Read side of workspace persistence needed to resolve roles
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn find_workspace(&self, id: Uuid) -> Result<Option<WorkspaceRef>>;
    async fn find_membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow(Role),
    Deny,
}

#[derive(Clone)]
pub struct AuthorizationGate {
    store: Arc<dyn WorkspaceStore>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self { store }
    }

    /// Owner is implicitly admin; otherwise the membership role; otherwise `None`.
    pub async fn role_of(&self, user_id: Uuid, workspace_id: Uuid) -> Result<Option<Role>> {
        let Some(workspace) = self.store.find_workspace(workspace_id).await? else {
            return Ok(None);
        };
        if workspace.owner_id == user_id {
            return Ok(Some(Role::Admin));
        }
        self.store.find_membership(workspace_id, user_id).await
    }

    pub async fn check(&self, user_id: Uuid, workspace_id: Uuid, minimum: Role) -> Result<Access> {
        let access = match self.role_of(user_id, workspace_id).await? {
            Some(role) if role.satisfies(minimum) => Access::Allow(role),
            _ => Access::Deny,
        };
        Ok(access)
    }

    /// `check` for handlers: deny becomes `AppError::Forbidden`
    pub async fn require(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        minimum: Role,
    ) -> Result<Role, AppError> {
        match self.check(user_id, workspace_id, minimum).await? {
            Access::Allow(role) => Ok(role),
            Access::Deny => {
                tracing::debug!(
                    %user_id,
                    %workspace_id,
                    required = %minimum,
                    "access denied"
                );
                Err(AppError::Forbidden(format!(
                    "Requires {} role in this workspace",
                    minimum
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    struct MemoryStore {
        workspaces: DashMap<Uuid, WorkspaceRef>,
        members: DashMap<(Uuid, Uuid), Role>,
    }

    #[async_trait]
    impl WorkspaceStore for MemoryStore {
        async fn find_workspace(&self, id: Uuid) -> Result<Option<WorkspaceRef>> {
            Ok(self.workspaces.get(&id).map(|w| *w))
        }

        async fn find_membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
            Ok(self.members.get(&(workspace_id, user_id)).map(|r| *r))
        }
    }

    fn setup() -> (Arc<MemoryStore>, AuthorizationGate, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::default());
        let owner = Uuid::new_v4();
        let ws = Uuid::new_v4();
        store.workspaces.insert(
            ws,
            WorkspaceRef {
                id: ws,
                owner_id: owner,
            },
        );
        let gate = AuthorizationGate::new(store.clone());
        (store, gate, owner, ws)
    }

    #[tokio::test]
    async fn test_owner_is_admin() {
        let (_store, gate, owner, ws) = setup();
        assert_eq!(gate.role_of(owner, ws).await.unwrap(), Some(Role::Admin));
        assert_eq!(gate.require(owner, ws, Role::Admin).await.unwrap(), Role::Admin);
    }

    #[tokio::test]
    async fn test_editor_membership_grants_editor_not_admin() {
        let (store, gate, _owner, ws) = setup();
        let user = Uuid::new_v4();
        store.members.insert((ws, user), Role::Editor);

        assert_eq!(
            gate.check(user, ws, Role::Editor).await.unwrap(),
            Access::Allow(Role::Editor)
        );
        assert_eq!(gate.check(user, ws, Role::Viewer).await.unwrap(), Access::Allow(Role::Editor));
        assert_eq!(gate.check(user, ws, Role::Admin).await.unwrap(), Access::Deny);
        assert!(matches!(
            gate.require(user, ws, Role::Admin).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_role_tracks_current_membership() {
        let (store, gate, _owner, ws) = setup();
        let user = Uuid::new_v4();
        assert_eq!(gate.role_of(user, ws).await.unwrap(), None);

        store.members.insert((ws, user), Role::Viewer);
        assert_eq!(gate.role_of(user, ws).await.unwrap(), Some(Role::Viewer));

        store.members.remove(&(ws, user));
        assert_eq!(gate.check(user, ws, Role::Viewer).await.unwrap(), Access::Deny);
    }

    #[tokio::test]
    async fn test_unknown_workspace_denies() {
        let (store, gate, _owner, _ws) = setup();
        let user = Uuid::new_v4();
        let missing = Uuid::new_v4();
        // A stale membership row must not grant access to a missing workspace
        store.members.insert((missing, user), Role::Admin);
        assert_eq!(gate.role_of(user, missing).await.unwrap(), None);
        assert_eq!(gate.check(user, missing, Role::Viewer).await.unwrap(), Access::Deny);
    }
}
