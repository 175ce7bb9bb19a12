//! External identity exchange: authorization code in, verified profile out.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::config::IdentityConfig;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityProfile {
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity provider is not configured")]
    NotConfigured,
    #[error("authorization code rejected: {0}")]
    Rejected(String),
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// URL the user is sent to for consent
    fn authorization_url(&self) -> Result<String, IdentityError>;

    async fn exchange_code(&self, code: &str) -> Result<IdentityProfile, IdentityError>;
}

pub struct GoogleIdentityProvider {
    http: reqwest::Client,
    config: IdentityConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    name: Option<String>,
    picture: Option<String>,
}

impl GoogleIdentityProvider {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn ensure_configured(&self) -> Result<(), IdentityError> {
        if self.config.client_id.is_empty() || self.config.redirect_uri.is_empty() {
            return Err(IdentityError::NotConfigured);
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    fn authorization_url(&self) -> Result<String, IdentityError> {
        self.ensure_configured()?;
        let url = Url::parse_with_params(
            GOOGLE_AUTH_URL,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", "openid email profile"),
                ("access_type", "online"),
                ("prompt", "select_account"),
            ],
        )
        .map_err(|e| IdentityError::Rejected(e.to_string()))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<IdentityProfile, IdentityError> {
        self.ensure_configured()?;

        let resp = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IdentityError::Rejected(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp.json().await?;

        let info: GoogleUserInfo = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let email = match info.email {
            Some(email) if info.email_verified => email,
            _ => return Err(IdentityError::Rejected("email not verified".to_string())),
        };

        Ok(IdentityProfile {
            external_id: info.sub,
            name: info.name.unwrap_or_default(),
            email,
            avatar: info.picture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url_carries_client() {
        let provider = GoogleIdentityProvider::new(IdentityConfig {
            client_id: "client-123".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
        });
        let url = provider.authorization_url().unwrap();
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("secret"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_refuses() {
        let provider = GoogleIdentityProvider::new(IdentityConfig::default());
        assert!(matches!(
            provider.authorization_url(),
            Err(IdentityError::NotConfigured)
        ));
        assert!(matches!(
            provider.exchange_code("code").await,
            Err(IdentityError::NotConfigured)
        ));
    }
}
