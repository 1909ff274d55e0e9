//! Configuration types for Keel.
//!
//! Configuration is loaded from a YAML file (`keel.yaml`) and may reference:
//!
//! - **users_file**: the user directory (a YAML list of users with labels and roles)
//! - **policy_dir**: a directory of YAML policy documents loaded by the operator CLI

pub mod objects;
pub mod users;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::user::User;

pub use objects::{load_objects_from_dir, load_objects_from_file, parse_objects};
pub use users::UsersFile;

/// Complete Keel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Generation store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Enforcement loop settings.
    #[serde(default)]
    pub enforcer: EnforcerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the user directory file.
    #[serde(default)]
    pub users_file: Option<PathBuf>,

    /// Directory containing policy documents.
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,

    /// Inline users. Users from `users_file` are appended.
    #[serde(default)]
    pub users: Vec<User>,
}

/// Encoding used for persisted generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Json,
    #[default]
    Yaml,
    Msgpack,
}

/// Generation store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub codec: CodecKind,

    /// Directory for generation files. In-memory when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Enforcement loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between periodic re-checks of the last generation.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Timeout applied to every plugin deploy/destroy call.
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,

    /// Maximum number of actions applied concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            plugin_timeout_secs: default_plugin_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_plugin_timeout_secs() -> u64 {
    300
}

fn default_max_parallel() -> usize {
    8
}

fn default_filter() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeelConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration and resolve all external references.
    ///
    /// Relative paths are resolved against the directory of the configuration file, and users
    /// from `users_file` are appended to the inline users.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        config.users_file = config.users_file.map(|p| resolve(&base_dir, p));
        config.policy_dir = config.policy_dir.map(|p| resolve(&base_dir, p));
        config.store.directory = config.store.directory.map(|p| resolve(&base_dir, p));

        if let Some(users_file) = &config.users_file {
            if !users_file.exists() {
                return Err(ConfigError::Config(format!(
                    "users file '{}' does not exist",
                    users_file.display()
                )));
            }
            let file = UsersFile::from_file(users_file)?;
            config.users.extend(file.users);
        }

        Ok(config)
    }
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
