use serde::{Deserialize, Serialize, Serializer};
use std::path::PathBuf;

use simsync_core::ClientSettings;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

pub const DEFAULT_BUCKET: &str = "note";
pub const DEFAULT_SYNC_DIR: &str = "SyncDir";

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Application id issued by the sync service
    pub app_id: ConfigValue<String>,
    /// Access token for the bucket
    #[serde(serialize_with = "serialize_masked")]
    pub token: ConfigValue<String>,
    /// Sync server URL (e.g., "wss://api.simperium.com")
    pub server_url: ConfigValue<String>,
    /// Bucket to mirror
    pub bucket: ConfigValue<String>,
    /// Directory mirrored by `simsync sync`
    pub sync_dir: ConfigValue<PathBuf>,
    /// Fixed client id; a fresh one is generated per run when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file.
///
/// The capitalized aliases accept the `conf.json` secrets layout.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    #[serde(alias = "ApplicationID")]
    app_id: Option<String>,
    #[serde(alias = "Token")]
    token: Option<String>,
    server_url: Option<String>,
    bucket: Option<String>,
    sync_dir: Option<PathBuf>,
    client_id: Option<String>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut app_id = ConfigValue::new(String::new(), ConfigSource::Default);
        let mut token = ConfigValue::new(String::new(), ConfigSource::Default);
        let mut server_url = ConfigValue::new(
            simsync_core::sync::DEFAULT_SERVER_URL.to_string(),
            ConfigSource::Default,
        );
        let mut bucket = ConfigValue::new(DEFAULT_BUCKET.to_string(), ConfigSource::Default);
        let mut sync_dir = ConfigValue::new(PathBuf::from(DEFAULT_SYNC_DIR), ConfigSource::Default);
        let mut client_id = None;
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(id) = file_config.app_id {
                app_id = ConfigValue::new(id, ConfigSource::File);
            }
            if let Some(secret) = file_config.token {
                token = ConfigValue::new(secret, ConfigSource::File);
            }
            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(name) = file_config.bucket {
                bucket = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(dir) = file_config.sync_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                sync_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            client_id = file_config.client_id;
        }

        // Apply environment variable overrides
        if let Ok(id) = std::env::var("SIMSYNC_APP_ID") {
            app_id = ConfigValue::new(id, ConfigSource::Environment);
        }
        if let Ok(secret) = std::env::var("SIMSYNC_TOKEN") {
            token = ConfigValue::new(secret, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("SIMSYNC_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("SIMSYNC_BUCKET") {
            bucket = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(dir) = std::env::var("SIMSYNC_SYNC_DIR") {
            sync_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }

        Ok(Self {
            app_id,
            token,
            server_url,
            bucket,
            sync_dir,
            client_id,
            config_file,
        })
    }

    /// Builds the sync client settings. Requires an app id and a token.
    pub fn client_settings(&self) -> Result<ClientSettings, ConfigError> {
        if self.app_id.value.is_empty() {
            return Err(ConfigError::Missing("app_id", "SIMSYNC_APP_ID"));
        }
        if self.token.value.is_empty() {
            return Err(ConfigError::Missing("token", "SIMSYNC_TOKEN"));
        }

        let mut settings = ClientSettings::new(&self.app_id.value, &self.token.value);
        settings.server_url = self.server_url.value.clone();
        settings.bucket = self.bucket.value.clone();
        if let Some(client_id) = &self.client_id {
            settings.client_id = client_id.clone();
        }
        Ok(settings)
    }

    /// The token with all but its last four characters hidden.
    pub fn masked_token(&self) -> String {
        mask(&self.token.value)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/simsync/
    /// - macOS: ~/Library/Application Support/simsync/
    /// - Windows: %APPDATA%/simsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("simsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = secret.chars().collect();
    let visible = chars.len().saturating_sub(4);
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < visible { '*' } else { *c })
        .collect()
}

fn serialize_masked<S: Serializer>(token: &ConfigValue<String>, serializer: S) -> Result<S::Ok, S::Error> {
    ConfigValue::new(mask(&token.value), token.source.clone()).serialize(serializer)
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    /// Key name and the environment variable that can provide it
    Missing(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Missing(key, env) => write!(
                f,
                "'{}' is not configured; set it in the config file or via {}",
                key, env
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
