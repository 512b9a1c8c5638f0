//! Configuration management for the ingest server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Prefix for every record's absolute URL
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackend {
    Local {
        root: PathBuf,
    },
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        region: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Files above this size must use the chunked path
    pub direct_upload_max_bytes: u64,
    pub max_file_size: u64,
    /// Records above this size are only readable through a stream
    pub stream_read_threshold: u64,
    pub session_retention_hours: i64,
    pub janitor_interval_secs: u64,
    pub merge_wait_timeout_ms: u64,
    pub verify_merged_hash: bool,
}

impl IngestConfig {
    pub fn session_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_retention_hours)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn merge_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_wait_timeout_ms)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            direct_upload_max_bytes: 10 * MIB,
            max_file_size: 500 * MIB,
            stream_read_threshold: 10 * MIB,
            session_retention_hours: 24,
            janitor_interval_secs: 300,
            merge_wait_timeout_ms: 30_000,
            verify_merged_hash: true,
        }
    }
}

/// Rejected configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite:./ingest.db".to_string(),
            },
            storage: StorageConfig {
                backend: StorageBackend::Local {
                    root: PathBuf::from("./data/uploads"),
                },
                base_url: "http://localhost:3000/files".to_string(),
            },
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = IngestConfig::default();

        let backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .as_str()
        {
            "s3" => StorageBackend::S3 {
                endpoint: required("S3_ENDPOINT")?,
                bucket: required("S3_BUCKET")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
            },
            "local" => StorageBackend::Local {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/uploads")),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let config = Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./ingest.db".to_string()),
            },
            storage: StorageConfig {
                backend,
                base_url: env::var("FILE_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:3000/files".to_string()),
            },
            ingest: IngestConfig {
                direct_upload_max_bytes: parsed("DIRECT_UPLOAD_MAX_BYTES", defaults.direct_upload_max_bytes)?,
                max_file_size: parsed("MAX_FILE_SIZE", defaults.max_file_size)?,
                stream_read_threshold: parsed("STREAM_READ_THRESHOLD", defaults.stream_read_threshold)?,
                session_retention_hours: parsed("SESSION_RETENTION_HOURS", defaults.session_retention_hours)?,
                janitor_interval_secs: parsed("JANITOR_INTERVAL_SECS", defaults.janitor_interval_secs)?,
                merge_wait_timeout_ms: parsed("MERGE_WAIT_TIMEOUT_MS", defaults.merge_wait_timeout_ms)?,
                verify_merged_hash: parsed("VERIFY_MERGED_HASH", defaults.verify_merged_hash)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;

        if ingest.direct_upload_max_bytes == 0 {
            return Err(ConfigError::Inconsistent(
                "direct_upload_max_bytes must be positive".to_string(),
            ));
        }
        if ingest.direct_upload_max_bytes > ingest.max_file_size {
            return Err(ConfigError::Inconsistent(format!(
                "direct_upload_max_bytes ({}) exceeds max_file_size ({})",
                ingest.direct_upload_max_bytes, ingest.max_file_size
            )));
        }
        if ingest.session_retention_hours <= 0 {
            return Err(ConfigError::Inconsistent(
                "session_retention_hours must be positive".to_string(),
            ));
        }
        if ingest.janitor_interval_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "janitor_interval_secs must be positive".to_string(),
            ));
        }
        if self.storage.base_url.trim().is_empty() {
            return Err(ConfigError::Inconsistent("base_url is empty".to_string()));
        }
        if let StorageBackend::S3 { bucket, .. } = &self.storage.backend {
            if bucket.is_empty() {
                return Err(ConfigError::Inconsistent("S3 bucket is empty".to_string()));
            }
        }

        Ok(())
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

fn parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_direct_limit_above_max_rejected() {
        let mut config = Config::default();
        config.ingest.direct_upload_max_bytes = config.ingest.max_file_size + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::S3 {
            endpoint: "http://localhost:9000".to_string(),
            bucket: String::new(),
            access_key: "admin".to_string(),
            secret_key: "password123".to_string(),
            region: None,
        };
        assert!(config.validate().is_err());
    }
}
