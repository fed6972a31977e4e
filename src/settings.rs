use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::FrameConfig;
use crate::realtime::protocol::{DEFAULT_MODEL, REALTIME_API_URL};
use crate::realtime::{ConnectionSettings, RetryPolicy};

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "practice-realtime";

/// Token-issuing endpoint of the local practice server
pub const DEFAULT_TOKEN_ENDPOINT: &str = "http://localhost:3000/api/openai-token";

pub const ENV_TOKEN_ENDPOINT: &str = "PRACTICE_TOKEN_ENDPOINT";
pub const ENV_REALTIME_URL: &str = "PRACTICE_REALTIME_URL";
pub const ENV_REALTIME_MODEL: &str = "PRACTICE_REALTIME_MODEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Where ephemeral session tokens are requested.
    pub token_endpoint: String,

    /// Realtime WebSocket URL, without the `model` query parameter.
    pub realtime_url: String,

    pub model: String,

    /// Bound on one token request.
    pub credential_timeout_secs: u64,

    /// Bound on opening the socket and receiving `session.created`.
    pub connect_timeout_secs: u64,

    /// Connection attempts before giving up (including the first).
    pub retry_attempts: u32,

    /// Duration of each audio frame sent upstream.
    pub frame_duration_ms: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            realtime_url: REALTIME_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            credential_timeout_secs: 30,
            connect_timeout_secs: 15,
            retry_attempts: 5,
            frame_duration_ms: 100,
        }
    }
}

impl ClientSettings {
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            realtime_url: self.realtime_url.clone(),
            model: self.model.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            frame_duration_ms: self.frame_duration_ms.max(10),
            ..FrameConfig::default()
        }
    }

    /// Override endpoints from `PRACTICE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = value(ENV_TOKEN_ENDPOINT) {
            self.token_endpoint = endpoint;
        }
        if let Some(url) = value(ENV_REALTIME_URL) {
            self.realtime_url = url;
        }
        if let Some(model) = value(ENV_REALTIME_MODEL) {
            self.model = model;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Settings from the config dir with environment overrides applied
pub fn load_settings() -> ClientSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

/// Read settings from `path`, falling back to defaults on any problem
pub fn load_settings_from(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings(settings: &ClientSettings) -> Result<(), SettingsError> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            action: "Create config directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        action: "Write temp settings",
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    action: "Remove existing settings file",
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        action: "Rename temp settings",
        path: tmp_path,
        source,
    })?;
    Ok(())
}
