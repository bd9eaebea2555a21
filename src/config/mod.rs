//! Runtime configuration.
//!
//! Priority: env var > TOML config file > default.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::settings::Settings;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_USER_ID: &str = "local";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SUMMARY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SUMMARY_BACKOFF_MS: u64 = 400;
const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Main configuration for tonpixo.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub bootstrap: BootstrapConfig,
    pub poller: PollerConfig,
    pub identity: IdentityConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Owner recorded on persisted sessions.
    pub user_id: String,
    /// Per-request timeout for everything except streamed answers.
    pub timeout: Duration,
}

/// Account bootstrap retry settings.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    /// Pause between the account summary and the scan-type prompt. Zero
    /// offers scan types immediately.
    pub settle_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// File that records the conversation id to resume.
    pub pointer_path: PathBuf,
}

impl ApiConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let base_url = helpers::optional_env("TONPIXO_API_URL")?
            .or_else(|| settings.api.base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "TONPIXO_API_URL".to_string(),
                message: format!("'{base_url}' must start with http:// or https://"),
            });
        }

        let user_id = helpers::optional_env("TONPIXO_USER_ID")?
            .or_else(|| settings.api.user_id.clone())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());

        let timeout = helpers::duration_ms(
            "TONPIXO_TIMEOUT_MS",
            settings.api.timeout_ms,
            DEFAULT_TIMEOUT_MS,
        )?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id,
            timeout,
        })
    }
}

impl BootstrapConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let max_attempts =
            helpers::parse_env::<u32>("TONPIXO_SUMMARY_MAX_ATTEMPTS", "a positive integer")?
                .or(settings.bootstrap.max_attempts)
                .unwrap_or(DEFAULT_SUMMARY_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TONPIXO_SUMMARY_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            max_attempts,
            backoff_step: helpers::duration_ms(
                "TONPIXO_SUMMARY_BACKOFF_MS",
                settings.bootstrap.backoff_ms,
                DEFAULT_SUMMARY_BACKOFF_MS,
            )?,
            settle_delay: helpers::duration_ms_or_zero(
                "TONPIXO_SETTLE_DELAY_MS",
                settings.bootstrap.settle_delay_ms,
                DEFAULT_SETTLE_DELAY_MS,
            )?,
        })
    }
}

impl PollerConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: helpers::duration_ms(
                "TONPIXO_POLL_INTERVAL_MS",
                settings.poller.interval_ms,
                DEFAULT_POLL_INTERVAL_MS,
            )?,
        })
    }
}

impl IdentityConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let pointer_path = helpers::optional_env("TONPIXO_SESSION_FILE")?
            .map(PathBuf::from)
            .or_else(|| settings.identity.pointer_path.clone())
            .unwrap_or_else(default_pointer_path);
        Ok(Self { pointer_path })
    }
}

fn default_pointer_path() -> PathBuf {
    crate::bootstrap::tonpixo_home().join("current_session.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: DEFAULT_API_URL.to_string(),
                user_id: DEFAULT_USER_ID.to_string(),
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            },
            bootstrap: BootstrapConfig {
                max_attempts: DEFAULT_SUMMARY_MAX_ATTEMPTS,
                backoff_step: Duration::from_millis(DEFAULT_SUMMARY_BACKOFF_MS),
                settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            },
            poller: PollerConfig {
                interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            },
            identity: IdentityConfig {
                pointer_path: default_pointer_path(),
            },
        }
    }
}

impl Config {
    /// Load from env with an optional explicit TOML config file.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_tonpixo_env();
        let settings = Self::load_settings(toml_path)?;
        Self::resolve(&settings)
    }

    /// Read the TOML file.
    ///
    /// An explicit path must exist and parse. The default path
    /// `~/.tonpixo/config.toml` may be missing, and a broken default file is
    /// logged and ignored.
    fn load_settings(explicit_path: Option<&Path>) -> Result<Settings, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(settings)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(settings)
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Settings::default())
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
                Ok(Settings::default())
            }
        }
    }

    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            api: ApiConfig::resolve(settings)?,
            bootstrap: BootstrapConfig::resolve(settings)?,
            poller: PollerConfig::resolve(settings)?,
            identity: IdentityConfig::resolve(settings)?,
        })
    }
}
