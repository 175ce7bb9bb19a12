//! Access/refresh token lifecycle on the client.
//!
//! The access token lives only in memory. The refresh token lives in a
//! [`RefreshTokenStore`] that survives restarts.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::api::ApiError;

/// Mints a new access token from a refresh token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn rotate_access(&self, refresh_token: &str) -> Result<String, ApiError>;
}

pub trait RefreshTokenStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, token: Option<&str>) -> anyhow::Result<()>;
}

pub struct SessionController {
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn RefreshTokenStore>,
    access: Mutex<Option<String>>,
}

impl SessionController {
    pub fn new(refresher: Arc<dyn TokenRefresher>, store: Arc<dyn RefreshTokenStore>) -> Self {
        Self {
            refresher,
            store,
            access: Mutex::new(None),
        }
    }

    pub fn sign_in(&self, access_token: String, refresh_token: &str) -> anyhow::Result<()> {
        self.store.save(Some(refresh_token))?;
        *self.access() = Some(access_token);
        Ok(())
    }

    pub fn sign_out(&self) {
        *self.access() = None;
        if let Err(e) = self.store.save(None) {
            tracing::warn!("Failed to clear stored refresh token: {}", e);
        }
    }

    pub fn has_session(&self) -> bool {
        self.access().is_some() || self.store.load().is_some()
    }

    /// Current access token, if any. Never touches the network.
    pub fn get_access_token(&self) -> Option<String> {
        self.access().clone()
    }

    /// Exchange the refresh token for a new access token. Any failure signs the user out.
    pub async fn refresh_and_get_token(&self) -> Option<String> {
        let Some(refresh_token) = self.store.load() else {
            *self.access() = None;
            return None;
        };

        match self.refresher.rotate_access(&refresh_token).await {
            Ok(token) => {
                *self.access() = Some(token.clone());
                tracing::debug!("Access token refreshed");
                Some(token)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed, signing out: {}", e);
                self.sign_out();
                None
            }
        }
    }

    /// Run `op` with the access token. On `UNAUTHORIZED`, refresh once and
    /// retry once; the second outcome is returned as is.
    pub async fn with_auth_retry<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = match self.get_access_token() {
            Some(token) => token,
            // Fresh process: only the refresh token survived
            None => self
                .refresh_and_get_token()
                .await
                .ok_or_else(ApiError::signed_out)?,
        };

        match op(token).await {
            Err(e) if e.is_unauthorized() => {
                let token = self
                    .refresh_and_get_token()
                    .await
                    .ok_or_else(ApiError::signed_out)?;
                op(token).await
            }
            other => other,
        }
    }

    fn access(&self) -> MutexGuard<'_, Option<String>> {
        self.access.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
