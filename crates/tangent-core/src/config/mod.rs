//! `tangent` configuration, loaded from TOML.
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::app::domain::DEFAULT_PAGE_SIZE;
use crate::app::domain::runtime::SessionOptions;
use crate::app::viewport::{DEFAULT_DETACH_THRESHOLD, DEFAULT_REATTACH_THRESHOLD, ScrollThresholds};
use crate::utils::paths::AppPaths;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:7878";
const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 7878);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {}: {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Where `tangent chat` finds the persistence server.
    pub url: String,
    /// Where `tangent serve` listens.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            bind: SocketAddr::from(DEFAULT_BIND),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewportConfig {
    pub detach_threshold: usize,
    pub reattach_threshold: usize,
    /// Blank rows between rendered messages.
    pub spacing: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            detach_threshold: DEFAULT_DETACH_THRESHOLD,
            reattach_threshold: DEFAULT_REATTACH_THRESHOLD,
            spacing: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub event_channel_size: usize,
    /// Overrides the platform data directory for cached client state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_state_dir: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            event_channel_size: SessionOptions::default().event_capacity,
            client_state_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is unset.
    pub level: String,
    /// Write logs to daily files here instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TangentConfig {
    pub server: ServerConfig,
    pub history: HistoryConfig,
    pub viewport: ViewportConfig,
    pub session: SessionSection,
    pub logging: LoggingConfig,
}

impl TangentConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: TangentConfig =
            toml::from_str(content).map_err(|source| ConfigError::TomlParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_url()?;
        if self.history.page_size == 0 {
            return Err(ConfigError::Invalid(
                "history.page_size must be at least 1".to_string(),
            ));
        }
        if self.session.event_channel_size == 0 {
            return Err(ConfigError::Invalid(
                "session.event_channel_size must be at least 1".to_string(),
            ));
        }
        if self.viewport.reattach_threshold >= self.viewport.detach_threshold {
            return Err(ConfigError::Invalid(format!(
                "viewport.reattach_threshold ({}) must be below viewport.detach_threshold ({})",
                self.viewport.reattach_threshold, self.viewport.detach_threshold
            )));
        }
        Ok(())
    }

    pub fn server_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.server.url)
            .map_err(|e| ConfigError::Invalid(format!("server.url {:?}: {e}", self.server.url)))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            page_size: self.history.page_size,
            event_capacity: self.session.event_channel_size,
        }
    }

    pub fn scroll_thresholds(&self) -> ScrollThresholds {
        ScrollThresholds::new(
            self.viewport.detach_threshold,
            self.viewport.reattach_threshold,
        )
    }

    pub fn client_state_dir(&self) -> PathBuf {
        self.session
            .client_state_dir
            .clone()
            .unwrap_or_else(AppPaths::client_state_dir)
    }
}

/// A loaded config and the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TangentConfig,
    pub source: Option<PathBuf>,
}

/// Load the config from `explicit`, the project config or the user config, in
/// that order. Missing optional files fall back to defaults; a missing
/// explicit file is an error.
pub async fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let Some(path) = AppPaths::discover_config(explicit) else {
        debug!(target: "config::load", "No config file found, using defaults");
        return Ok(LoadedConfig {
            config: TangentConfig::default(),
            source: None,
        });
    };

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
    let config = TangentConfig::from_toml(&content, &path)?;
    debug!(target: "config::load", path = %path.display(), "Loaded config");

    Ok(LoadedConfig {
        config,
        source: Some(path),
    })
}
