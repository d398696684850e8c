//! Courier CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `~/.courier/config.toml`
//! - `courier.toml` in the working directory (or an explicit `--config` file)
//! - `COURIER_*` environment variables, nested with `__`
//!   (`COURIER_SERVER__WS_URL`, `COURIER_CORE__CONNECTION__MAX_RECONNECT_ATTEMPTS`)
//! - command line flags

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use courier_core::{CourierConfig, UserId};

const CONFIG_FILE: &str = "courier.toml";
const ENV_PREFIX: &str = "COURIER_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the Courier CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliAppConfig {
    /// Sync core configuration shared with the runtime
    pub core: CourierConfig,

    /// Chat server endpoints and credential
    pub server: ServerConfig,

    /// Signed-in account
    pub identity: IdentityConfig,

    /// Terminal behaviour and local storage
    pub cli: CliConfig,
}

/// Chat server endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Event stream endpoint (`ws://` or `wss://`)
    pub ws_url: String,

    /// Base URL of the REST history API; resync is disabled when unset
    pub history_url: Option<String>,

    /// Bearer token; without one the client stays signed out
    pub token: Option<String>,
}

/// Identity of the signed-in user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub user_id: Option<String>,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Prompt shown in interactive mode
    pub prompt: String,

    /// Where local peer histories are kept (defaults to `~/.courier/data`)
    pub data_dir: Option<PathBuf>,

    /// How long one-shot commands wait for the server, in seconds
    pub wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:3000/events".to_string(),
            history_url: None,
            token: None,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            prompt: "courier> ".to_string(),
            data_dir: None,
            wait_secs: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Command Line Overrides
// ----------------------------------------------------------------------------

/// Values given on the command line; `None` leaves lower layers untouched
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub user_id: Option<String>,
    pub ws_url: Option<String>,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub verbose: bool,
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load configuration with every layer applied
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(home_config) = Self::home_config_path() {
            figment = figment.merge(Toml::file(home_config));
        }
        let local = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        figment = figment
            .merge(Toml::file(local))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(user_id) = &overrides.user_id {
            figment = figment.merge(("identity.user_id", user_id));
        }
        if let Some(ws_url) = &overrides.ws_url {
            figment = figment.merge(("server.ws_url", ws_url));
        }
        if let Some(token) = &overrides.token {
            figment = figment.merge(("server.token", token));
        }
        if let Some(data_dir) = &overrides.data_dir {
            figment = figment.merge(("cli.data_dir", data_dir));
        }
        if overrides.verbose {
            figment = figment.merge(("cli.verbose", true));
        }

        Self::extract(figment)
    }

    /// Load defaults plus a single file, ignoring the environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".courier").join("config.toml"))
    }

    /// Write this configuration as TOML, creating parent directories
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::FileSystem(format!("create {}: {}", parent.display(), e)))?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| ConfigError::FileSystem(format!("write {}: {}", path.as_ref().display(), e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.core.validate().map_err(ConfigError::Validation)?;

        let ws_url = Url::parse(&self.server.ws_url)
            .map_err(|e| ConfigError::Validation(format!("server.ws_url: {}", e)))?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Validation(format!(
                "server.ws_url must use ws or wss, got {}",
                ws_url.scheme()
            )));
        }
        if let Some(history_url) = &self.server.history_url {
            Url::parse(history_url)
                .map_err(|e| ConfigError::Validation(format!("server.history_url: {}", e)))?;
        }

        if let Some(user_id) = &self.identity.user_id {
            if user_id.trim().is_empty() {
                return Err(ConfigError::Validation("identity.user_id cannot be blank".into()));
            }
        }
        if self.cli.wait_secs == 0 {
            return Err(ConfigError::Validation("cli.wait_secs must be greater than 0".into()));
        }
        Ok(())
    }

    /// The signed-in user; required to start the client
    pub fn user_id(&self) -> Result<UserId, ConfigError> {
        self.identity
            .user_id
            .as_deref()
            .map(UserId::new)
            .ok_or_else(|| {
                ConfigError::Validation(
                    "no user id: pass --user or set identity.user_id".to_string(),
                )
            })
    }

    /// Directory for the local peer store
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cli.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".courier").join("data"))
                .ok_or_else(|| ConfigError::Environment("no home directory".to_string())),
        }
    }

    /// Example `courier.toml` content
    pub fn example_config() -> String {
        let example = CliAppConfig {
            server: ServerConfig {
                ws_url: "wss://chat.example.com/events".to_string(),
                history_url: Some("https://chat.example.com/api/".to_string()),
                token: None,
            },
            identity: IdentityConfig {
                user_id: Some("my-user-id".to_string()),
            },
            ..Default::default()
        };
        toml::to_string_pretty(&example)
            .unwrap_or_else(|e| format!("# Failed to generate example config: {}", e))
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliAppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cli.prompt, "courier> ");
        assert!(config.user_id().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_urls() {
        let mut config = CliAppConfig::default();
        config.server.ws_url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = CliAppConfig::default();
        config.server.history_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        let mut config = CliAppConfig::default();
        config.core.connection.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layers_apply_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [server]
                ws_url = "wss://file.example.com/events"
                token = "from-file"

                [identity]
                user_id = "file-user"
                "#,
            )?;
            jail.set_env("COURIER_SERVER__TOKEN", "from-env");

            let overrides = ConfigOverrides {
                user_id: Some("flag-user".to_string()),
                ..Default::default()
            };
            let config = CliAppConfig::load(&overrides).map_err(|e| e.to_string())?;

            assert_eq!(config.server.ws_url, "wss://file.example.com/events");
            assert_eq!(config.server.token.as_deref(), Some("from-env"));
            assert_eq!(config.user_id().map_err(|e| e.to_string())?, UserId::new("flag-user"));
            Ok(())
        });
    }

    #[test]
    fn test_nested_core_settings_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("COURIER_CORE__CONNECTION__MAX_RECONNECT_ATTEMPTS", "9");
            let config =
                CliAppConfig::load(&ConfigOverrides::default()).map_err(|e| e.to_string())?;
            assert_eq!(config.core.connection.max_reconnect_attempts, 9);
            Ok(())
        });
    }

    #[test]
    fn test_example_config_round_trips() {
        let example = CliAppConfig::example_config();
        assert!(example.contains("[server]"));
        assert!(example.contains("[identity]"));

        let dir = std::env::temp_dir().join(format!("courier-cli-{}", std::process::id()));
        let path = dir.join("example.toml");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, &example).unwrap();

        let loaded = CliAppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.server.ws_url, "wss://chat.example.com/events");
        assert_eq!(loaded.user_id().unwrap(), UserId::new("my-user-id"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
