use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default config file name, resolved against the working directory.
pub const CONFIG_FILE: &str = "config.json";

/// Persistent application settings, stored as pretty-printed JSON.
///
/// Keys this crate does not model (UI theme, font size, ...) are kept in
/// `extra` so saving never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub output_folder: PathBuf,
    pub input_folder: PathBuf,
    /// SQLite history database.
    pub history_db: PathBuf,
    pub last_model: String,
    pub last_aspect_ratio: String,
    pub last_image_size: String,
    /// Retry budget for auto-retry on failure.
    pub max_retries: u32,
    pub auto_retry_on_failure: bool,
    /// How many identical tasks one "generate" starts (1-10).
    pub parallel_tasks: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            api_base_url: "https://grsai.dakka.com.cn".to_string(),
            api_key: String::new(),
            output_folder: cwd.join("output"),
            input_folder: cwd.join("input"),
            history_db: cwd.join("history.db"),
            last_model: "nano-banana-fast".to_string(),
            last_aspect_ratio: "auto".to_string(),
            last_image_size: "1K".to_string(),
            max_retries: 5,
            auto_retry_on_failure: false,
            parallel_tasks: 1,
            extra: Map::new(),
        }
    }
}

impl AppConfig {
    /// Load the config at `path`, writing defaults there first if the file
    /// does not exist. An unreadable or malformed file yields defaults.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write default config");
            }
            return config;
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Look up any key (modelled or not), falling back to `default` when the
    /// key is missing or has the wrong type.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get(key).cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// Set any key. Modelled fields are updated in place; other keys land
    /// in `extra`.
    pub fn set(&mut self, key: &str, value: impl Serialize) -> Result<(), ConfigError> {
        let mut whole = serde_json::to_value(&*self)?;
        if let Some(obj) = whole.as_object_mut() {
            obj.insert(key.to_string(), serde_json::to_value(value)?);
        }
        *self = serde_json::from_value(whole)?;
        Ok(())
    }
}

/// Runtime knobs for task units and the registry.
///
/// Use [`TaskConfig::builder()`] for ergonomic construction, or
/// [`TaskConfig::default()`] for the standard cadence (poll every 2s,
/// checked for cancellation every 0.5s, give up after 5 network errors).
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Where downloaded result images are written.
    pub output_dir: PathBuf,

    /// Wait between polls.
    pub poll_interval: Duration,

    /// How many cancellation checks each poll wait is split into. Zero is
    /// treated as one.
    pub cancel_checks: u32,

    /// Consecutive poll transport failures before the unit gives up.
    pub max_consecutive_errors: u32,

    /// Timeout for result image downloads.
    pub download_timeout: Duration,

    /// How long `stop_all` waits for each unit to wind down.
    pub stop_wait: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            poll_interval: Duration::from_secs(2),
            cancel_checks: 4,
            max_consecutive_errors: 5,
            download_timeout: Duration::from_secs(30),
            stop_wait: Duration::from_secs(3),
        }
    }
}

impl TaskConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> TaskConfigBuilder {
        TaskConfigBuilder::default()
    }

    /// Task settings derived from the persistent application config.
    pub fn from_app_config(app: &AppConfig) -> Self {
        Self::builder()
            .with_output_dir(app.output_folder.clone())
            .build()
    }

    /// Length of one cancellation-check slice of the poll wait.
    pub fn wait_slice(&self) -> Duration {
        self.poll_interval / self.cancel_checks.max(1)
    }
}

/// Builder for [`TaskConfig`].
#[derive(Default)]
pub struct TaskConfigBuilder {
    config: TaskConfig,
}

impl TaskConfigBuilder {
    /// Set the directory result images are written to.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Set the wait between polls (default: 2 s).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set how many stop checks each poll wait is split into (minimum: 1).
    pub fn with_cancel_checks(mut self, checks: u32) -> Self {
        self.config.cancel_checks = checks.max(1);
        self
    }

    /// Set the consecutive transport failures tolerated while polling (minimum: 1).
    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.config.max_consecutive_errors = max.max(1);
        self
    }

    /// Set the timeout for result downloads (default: 30 s).
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    /// Set how long `stop_all` waits for each unit (default: 3 s).
    pub fn with_stop_wait(mut self, wait: Duration) -> Self {
        self.config.stop_wait = wait;
        self
    }

    /// Build the final [`TaskConfig`].
    pub fn build(self) -> TaskConfig {
        self.config
    }
}
