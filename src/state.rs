//! Shared ingest context
//!
//! Every component receives its storage, metadata store and configuration
//! through an [`IngestContext`]; nothing is reached through globals.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::{Config, ConfigError};
use crate::db;
use crate::error::IngestError;
use crate::storage::{self, BlobStore, StorageError};

/// Error type for context initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to initialize blob store: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to initialize database: {0}")]
    Database(#[from] IngestError),
}

/// Dependencies shared by every ingest operation
#[derive(Clone)]
pub struct IngestContext {
    inner: Arc<IngestContextInner>,
}

struct IngestContextInner {
    config: Config,
    db: SqlitePool,
    store: Arc<dyn BlobStore>,
}

impl IngestContext {
    pub fn new(config: Config, db: SqlitePool, store: Arc<dyn BlobStore>) -> Self {
        Self {
            inner: Arc::new(IngestContextInner { config, db, store }),
        }
    }

    /// Open the database and blob store named by `config`
    pub async fn connect(config: Config) -> Result<Self, StateError> {
        config.validate()?;
        let store = storage::create_store(&config.storage).await?;
        let db = db::create_pool(&config.database.url).await?;
        tracing::info!(database = %config.database.url, "Ingest context ready");

        Ok(Self::new(config, db, store))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the blob store
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.store
    }
}
