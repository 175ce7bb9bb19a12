use std::sync::Arc;

use crate::{
    auth::TokenService,
    authz::AuthorizationGate,
    config::Config,
    db::Database,
    identity::{GoogleIdentityProvider, IdentityProvider},
    registry::ConnectionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub tokens: TokenService,
    pub gate: AuthorizationGate,
    pub registry: Arc<ConnectionRegistry>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        let identity = Arc::new(GoogleIdentityProvider::new(config.identity.clone()));
        Self::with_identity(db, config, identity)
    }

    /// Build state around a specific identity provider
    pub fn with_identity(db: Database, config: Config, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            tokens: TokenService::from_config(&config.auth),
            gate: AuthorizationGate::new(Arc::new(db.clone())),
            registry: Arc::new(ConnectionRegistry::new()),
            db,
            config,
            identity,
        }
    }
}
