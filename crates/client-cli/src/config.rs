use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::session::RefreshTokenStore;

pub const DEFAULT_SERVER: &str = "http://localhost:5000";

/// Durable client settings. The access token is never written here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub server: Option<String>,
    pub refresh_token: Option<String>,
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "docit", "docit")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Server base URL: CLI override, then config, then the default
    pub fn server_url(&self, cli_override: Option<&str>) -> String {
        cli_override
            .map(str::to_string)
            .or_else(|| self.remote.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Keeps the refresh token in the config file so it survives restarts
pub struct ConfigTokenStore;

impl RefreshTokenStore for ConfigTokenStore {
    fn load(&self) -> Option<String> {
        match Config::load() {
            Ok(config) => config.remote.refresh_token,
            Err(e) => {
                tracing::warn!("Failed to read config: {}", e);
                None
            }
        }
    }

    fn save(&self, token: Option<&str>) -> Result<()> {
        let mut config = Config::load().unwrap_or_default();
        config.remote.refresh_token = token.map(str::to_string);
        config.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_precedence() {
        let mut config = Config::default();
        assert_eq!(config.server_url(None), DEFAULT_SERVER);

        config.remote.server = Some("https://docs.example.com/".to_string());
        assert_eq!(config.server_url(None), "https://docs.example.com");
        assert_eq!(
            config.server_url(Some("http://127.0.0.1:9000")),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_refresh_token_round_trips_through_toml() {
        let config = Config {
            remote: RemoteConfig {
                server: None,
                refresh_token: Some("r.t.k".to_string()),
            },
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("refresh_token"));
        assert!(!text.contains("access"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.remote.refresh_token.as_deref(), Some("r.t.k"));
    }
}
