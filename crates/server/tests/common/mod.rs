#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use docit_server::{
    config::Config,
    db::Database,
    identity::{IdentityError, IdentityProfile, IdentityProvider},
    AppState,
};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Accepts codes of the form `code-<external id>`
pub struct StubIdentity;

#[async_trait]
impl IdentityProvider for StubIdentity {
    fn authorization_url(&self) -> Result<String, IdentityError> {
        Ok("https://identity.test/authorize?client_id=test".to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<IdentityProfile, IdentityError> {
        let external_id = code
            .strip_prefix("code-")
            .ok_or_else(|| IdentityError::Rejected("unknown code".to_string()))?;
        Ok(IdentityProfile {
            external_id: external_id.to_string(),
            email: format!("{}@example.com", external_id),
            name: external_id.to_string(),
            avatar: None,
        })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = "test-access-secret".to_string();
    config.auth.refresh_secret = Some("test-refresh-secret".to_string());
    config
}

pub async fn test_state(config: Config) -> AppState {
    let db = Database::in_memory().await.expect("in-memory database");
    AppState::with_identity(db, config, Arc::new(StubIdentity))
}

pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
}

pub async fn seed_user(state: &AppState, name: &str) -> TestUser {
    let user = state
        .db
        .upsert_user_from_profile(&IdentityProfile {
            external_id: format!("ext-{}", name),
            email: format!("{}@example.com", name),
            name: name.to_string(),
            avatar: None,
        })
        .await
        .expect("seed user");
    let id = user.uuid().expect("user id");
    let tokens = state.tokens.issue_tokens(id).expect("issue tokens");
    TestUser {
        id,
        email: user.email,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    }
}

pub async fn seed_workspace(state: &AppState, owner: &TestUser) -> Uuid {
    state
        .db
        .create_workspace(owner.id, "Design docs", None)
        .await
        .expect("create workspace")
        .uuid()
        .expect("workspace id")
}

/// Serve the full router on an ephemeral port
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let addr = listener.local_addr().expect("listener address");
    let app = docit_server::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    addr
}
