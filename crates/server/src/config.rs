use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Secret for refresh tokens; falls back to `jwt_secret`
    #[serde(default)]
    pub refresh_secret: Option<String>,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,
}

/// OAuth client used for the external identity exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Longest accepted message body, in characters
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    /// Frames buffered per connection before the peer is treated as too slow
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Close connections that send nothing for this long (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Re-check membership of open connections at this interval (0 disables)
    #[serde(default)]
    pub reauth_interval_secs: u64,
    /// Force-close open connections when their membership is removed
    #[serde(default = "default_true")]
    pub revoke_on_membership_change: bool,
    /// Close a connection once the access token used for its handshake expires
    #[serde(default)]
    pub close_on_token_expiry: bool,
}

fn default_true() -> bool { true }
fn default_access_ttl() -> u64 { 15 * 60 }
fn default_refresh_ttl() -> u64 { 7 * 24 * 60 * 60 }
fn default_max_body_chars() -> usize { 4000 }
fn default_outbound_queue() -> usize { 64 }

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_body_chars: default_max_body_chars(),
            outbound_queue: default_outbound_queue(),
            idle_timeout_secs: 0,
            reauth_interval_secs: 0,
            revoke_on_membership_change: true,
            close_on_token_expiry: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            database: DatabaseConfig {
                path: "./data/docit.db".to_string(),
            },
            auth: AuthConfig {
                jwt_secret: DEFAULT_JWT_SECRET.to_string(),
                refresh_secret: None,
                access_token_ttl_secs: default_access_ttl(),
                refresh_token_ttl_secs: default_refresh_ttl(),
            },
            identity: IdentityConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env();
        Ok(config)
    }

    fn load_file() -> Result<Self> {
        // Try to load from environment variable
        if let Ok(path) = std::env::var("DOCIT_CONFIG") {
            return Self::load_from_path(&PathBuf::from(path));
        }

        let default_paths = vec![
            PathBuf::from("docit-server.toml"),
            PathBuf::from("config/docit-server.toml"),
            PathBuf::from("/etc/docit/server.toml"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        tracing::warn!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Environment variables (including `.env`) win over the file
    fn apply_env(&mut self) {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let Some(secret) = var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(secret) = var("JWT_REFRESH_SECRET") {
            self.auth.refresh_secret = Some(secret);
        }
        if let Some(id) = var("GOOGLE_CLIENT_ID") {
            self.identity.client_id = id;
        }
        if let Some(secret) = var("GOOGLE_CLIENT_SECRET") {
            self.identity.client_secret = secret;
        }
        if let Some(uri) = var("GOOGLE_REDIRECT_URI") {
            self.identity.redirect_uri = uri;
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [database]
            path = "/tmp/docit.db"

            [auth]
            jwt_secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.access_token_ttl_secs, 900);
        assert_eq!(config.auth.refresh_token_ttl_secs, 604_800);
        assert!(config.auth.refresh_secret.is_none());
        assert_eq!(config.chat.max_body_chars, 4000);
        assert!(config.chat.revoke_on_membership_change);
        assert!(!config.chat.close_on_token_expiry);
    }

    #[test]
    fn test_chat_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 5000

            [database]
            path = "x.db"

            [auth]
            jwt_secret = "s"
            access_token_ttl_secs = 60

            [chat]
            outbound_queue = 8
            revoke_on_membership_change = false
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.access_token_ttl_secs, 60);
        assert_eq!(config.chat.outbound_queue, 8);
        assert!(!config.chat.revoke_on_membership_change);
        assert_eq!(config.chat.max_body_chars, 4000);
    }
}
