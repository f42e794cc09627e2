//! Configuration module for the measurement upload server.
//!
//! This module handles loading and validating configuration from TOML files.
//! Configuration can be loaded from a file path or from default locations.
//!
//! # Configuration Sources (in order of priority)
//! 1. `config.local.toml` - Local overrides (gitignored)
//! 2. `config.toml` - Main configuration file
//!
//! # Example
//! ```rust,ignore
//! let config = Config::load("config.toml")?;
//! println!("Server will listen on {}:{}", config.server.host, config.server.port);
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mongodb: MongoConfig,
    #[serde(default)]
    pub google: GoogleConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the API to
    pub host: String,
    /// Port for the API
    pub port: u16,
    /// Base URL for generating upload URLs (no trailing slash)
    pub base_url: String,
    /// Base path the API is mounted under, e.g. "/api/v1"
    pub http_endpoint: String,
}

/// Which backend finalized uploads are persisted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Local filesystem objects plus an embedded RocksDB metadata index
    Local,
    /// MongoDB GridFS bucket
    Gridfs,
    /// Google Cloud Storage blob plus a MongoDB metadata collection
    Google,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Selected backend
    pub storage_type: StorageType,
    /// Base directory for locally persisted data
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// Directory holding finalized objects (local backend)
    pub fn objects_path(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Directory holding the RocksDB metadata index (local backend)
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("rocksdb")
    }
}

/// Upload protocol configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory for partial upload files (one flat file per upload identifier)
    pub upload_folder: PathBuf,
    /// Maximum accepted chunk payload per request (bytes)
    pub measurement_payload_limit: u64,
    /// Maximum accepted pre-request envelope size (bytes)
    #[serde(default = "default_pre_request_limit")]
    pub pre_request_limit: usize,
    /// Inactivity window after which an unfinished upload is swept (milliseconds)
    pub upload_expiration_ms: u64,
}

fn default_pre_request_limit() -> usize {
    1024
}

impl UploadConfig {
    /// Expiration window as a `Duration`
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.upload_expiration_ms)
    }
}

/// MongoDB connection configuration (gridfs and google backends)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Connection string, e.g. "mongodb://localhost:27017"
    pub uri: String,
    /// Database name
    pub database: String,
    /// GridFS bucket name
    pub bucket: String,
    /// Metadata collection name (google backend)
    pub collection: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: "measurements".to_string(),
            bucket: "fs".to_string(),
            collection: "measurements".to_string(),
        }
    }
}

/// Google Cloud Storage configuration (google backend)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// Destination bucket name
    pub bucket: String,
    /// Owning project id
    pub project: String,
    /// Buffer size for the resumable upload protocol (bytes, >= 256 KiB)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Storage API base URL; overridable so tests can point at a mock server
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// OAuth bearer token; obtaining and refreshing credentials is the
    /// deployment's concern
    #[serde(default)]
    pub oauth_token: String,
}

fn default_buffer_size() -> usize {
    8 * 1024 * 1024
}

fn default_api_base_url() -> String {
    "https://storage.googleapis.com".to_string()
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            project: String::new(),
            buffer_size: default_buffer_size(),
            api_base_url: default_api_base_url(),
            oauth_token: String::new(),
        }
    }
}

/// Authentication configuration
///
/// Token validation proper happens upstream; this table only maps accepted
/// tokens to the principal the core attributes uploads to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Whether bearer tokens are required
    #[serde(default)]
    pub enabled: bool,

    /// Accepted tokens and the principals they resolve to
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub username: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Config {
    /// Load configuration from a file path
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Tries `config.local.toml` first, then `config.toml`.
    pub fn load_default() -> Result<Self, ConfigError> {
        if Path::new("config.local.toml").exists() {
            return Self::load("config.local.toml");
        }

        if Path::new("config.toml").exists() {
            return Self::load("config.toml");
        }

        Err(ConfigError::ValidationError(
            "No configuration file found. Expected config.toml or config.local.toml".to_string(),
        ))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_url.ends_with('/') {
            return Err(ConfigError::ValidationError(
                "base_url should not have a trailing slash".to_string(),
            ));
        }

        if !self.server.http_endpoint.starts_with('/') || self.server.http_endpoint.ends_with('/')
        {
            return Err(ConfigError::ValidationError(
                "http_endpoint must start with '/' and not end with one".to_string(),
            ));
        }

        if self.upload.measurement_payload_limit < 1024 {
            return Err(ConfigError::ValidationError(
                "measurement_payload_limit must be at least 1024 bytes".to_string(),
            ));
        }

        if self.upload.upload_expiration_ms == 0 {
            return Err(ConfigError::ValidationError(
                "upload_expiration_ms must be greater than 0".to_string(),
            ));
        }

        match self.storage.storage_type {
            StorageType::Local => {}
            StorageType::Gridfs => {
                if self.mongodb.uri.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "mongodb.uri is required for the gridfs backend".to_string(),
                    ));
                }
            }
            StorageType::Google => {
                if self.google.bucket.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "google.bucket is required for the google backend".to_string(),
                    ));
                }
                if self.mongodb.uri.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "mongodb.uri is required for the google backend".to_string(),
                    ));
                }
                // GCS rejects non-final resumable chunks below 256 KiB
                if self.google.buffer_size < 256 * 1024 {
                    return Err(ConfigError::ValidationError(
                        "google.buffer_size must be at least 262144 bytes".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
