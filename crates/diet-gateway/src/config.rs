use anyhow::{Context, Result};
use chrono::Duration;
use std::path::{Path, PathBuf};

use diet_types::config::{DietConfig, IamConfig};

use crate::error::CredentialError;

/// Returns the diet-bot home directory (~/.diet-bot/)
pub fn diet_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".diet-bot")
}

/// Returns the default path to the config file (~/.diet-bot/config.toml)
pub fn config_path() -> PathBuf {
    diet_home().join("config.toml")
}

/// Load config from `path`, writing the defaults there if it doesn't exist.
pub fn load_config(path: &Path) -> Result<DietConfig> {
    if !path.exists() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let default = DietConfig::default();
        save_config(path, &default)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: DietConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    validate(&config).with_context(|| format!("Invalid config at {}", path.display()))?;
    Ok(config)
}

/// Reject values that parse but cannot be used.
pub fn validate(config: &DietConfig) -> Result<()> {
    freshness_window(&config.iam)?;
    Ok(())
}

/// The IAM token freshness window. Must be a positive, representable number of hours.
pub fn freshness_window(iam: &IamConfig) -> Result<Duration> {
    Duration::try_hours(iam.freshness_hours)
        .filter(|window| *window > Duration::zero())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "iam.freshness_hours must be a positive number of hours, got {}",
                iam.freshness_hours
            )
        })
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(path: &Path, config: &DietConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)
        .context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

/// Secrets that only ever come from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub bot_token: String,
    /// OAuth token exchanged for IAM tokens. Only needed for speech recognition.
    pub oauth_token: Option<String>,
    /// Cloud folder the recognition is billed to.
    pub folder_id: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("bot_token", &"<redacted>")
            .field("oauth_token", &self.oauth_token.as_ref().map(|_| "<redacted>"))
            .field("folder_id", &self.folder_id)
            .finish()
    }
}

impl Secrets {
    pub const BOT_TOKEN: &'static str = "BOT_TOKEN";
    pub const OAUTH_TOKEN: &'static str = "YA_TOKEN";
    pub const FOLDER_ID: &'static str = "YA_DIR";

    pub fn from_env(speech_enabled: bool) -> Result<Self, CredentialError> {
        Self::from_lookup(speech_enabled, |key| std::env::var(key).ok())
    }

    /// Only the OAuth token, for commands that just talk to the IAM endpoint.
    pub fn oauth_token_from_env() -> Result<String, CredentialError> {
        Self::oauth_token_from_lookup(|key| std::env::var(key).ok())
    }

    pub fn oauth_token_from_lookup<F>(lookup: F) -> Result<String, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(Self::OAUTH_TOKEN)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::MissingConfig(Self::OAUTH_TOKEN))
    }

    /// Read secrets through `lookup`. The speech variables are only required
    /// when recognition is enabled.
    pub fn from_lookup<F>(speech_enabled: bool, lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(CredentialError::MissingConfig(key));

        let bot_token = require(Self::BOT_TOKEN)?;
        let (oauth_token, folder_id) = if speech_enabled {
            (Some(require(Self::OAUTH_TOKEN)?), Some(require(Self::FOLDER_ID)?))
        } else {
            (get(Self::OAUTH_TOKEN), get(Self::FOLDER_ID))
        };

        Ok(Self {
            bot_token,
            oauth_token,
            folder_id,
        })
    }
}
