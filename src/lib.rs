//! Ingest Server Library
//!
//! Server-side file ingestion with content-hash deduplication, resumable
//! chunked uploads and a soft-delete record lifecycle.
//!
//! # Modules
//!
//! - `service`: The operation surface a transport layer calls into
//! - `upload`: Direct uploads, chunk sessions, assembly and records
//! - `db`: SQLite metadata store
//! - `storage`: Blob storage backends (local filesystem, S3)

pub mod config;
pub mod db;
pub mod error;
pub mod service;
pub mod state;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use error::{IngestError, Result};
pub use service::IngestService;
pub use state::IngestContext;
