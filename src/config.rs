//! Configuration management for the upload server

use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::upload::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_PARALLEL_CHUNKS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RETRY_DELAY_MS, MIN_CHUNK_SIZE,
};

/// Error raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Allowed CORS origin, `*` for any
    pub allowed_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Memory,
    Minio,
    R2,
    S3,
    B2,
}

impl StorageProvider {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "minio" => StorageProvider::Minio,
            "r2" => StorageProvider::R2,
            "s3" => StorageProvider::S3,
            "b2" => StorageProvider::B2,
            _ => StorageProvider::Memory,
        }
    }
}

/// Upload session tuning
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub default_chunk_size: u64,
    /// Minimum size of every non-final part accepted by the backend
    pub min_chunk_size: u64,
    pub session_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    /// Default worker count for upload clients
    pub max_parallel_chunks: usize,
    /// Client retries per chunk after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Client per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            session_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            max_parallel_chunks: DEFAULT_PARALLEL_CHUNKS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                max_body_size: 110 * 1024 * 1024,
                allowed_origin: "*".to_string(),
            },
            storage: StorageConfig {
                provider: StorageProvider::Memory,
                endpoint: "http://localhost:9000".to_string(),
                bucket: "uploads".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                region: Some("us-east-1".to_string()),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let provider = StorageProvider::parse(
            &env::var("STORAGE_PROVIDER").unwrap_or_else(|_| "memory".to_string()),
        );

        // Remote backends need real credentials; the memory backend runs on defaults.
        let storage = if provider == StorageProvider::Memory {
            StorageConfig {
                provider,
                ..defaults.storage
            }
        } else {
            StorageConfig {
                provider,
                endpoint: required("S3_ENDPOINT")?,
                bucket: required("S3_BUCKET")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
            }
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parsed("SERVER_PORT", defaults.server.port)?,
                max_body_size: parsed("MAX_BODY_SIZE", defaults.server.max_body_size)?,
                allowed_origin: env::var("ALLOWED_ORIGIN").unwrap_or(defaults.server.allowed_origin),
            },
            storage,
            upload: UploadConfig {
                default_chunk_size: parsed("DEFAULT_CHUNK_SIZE", defaults.upload.default_chunk_size)?,
                min_chunk_size: parsed("MIN_CHUNK_SIZE", defaults.upload.min_chunk_size)?,
                session_ttl_secs: parsed("SESSION_TTL_SECS", defaults.upload.session_ttl_secs)?,
                sweep_interval_secs: parsed("SWEEP_INTERVAL_SECS", defaults.upload.sweep_interval_secs)?,
                max_parallel_chunks: parsed("MAX_PARALLEL_CHUNKS", defaults.upload.max_parallel_chunks)?,
                max_retries: parsed("MAX_RETRIES", defaults.upload.max_retries)?,
                retry_base_delay_ms: parsed("RETRY_DELAY_MS", defaults.upload.retry_base_delay_ms)?,
                request_timeout_secs: parsed("REQUEST_TIMEOUT_SECS", defaults.upload.request_timeout_secs)?,
            },
        })
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
