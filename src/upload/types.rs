//! Request and response types for the ingest operations

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::db::{ChunkSession, FileFilter, FileRecord, SessionState};
use crate::error::{IngestError, Result, ValidationError};
use crate::storage::BlobReader;

use super::hashing::HASH_HEX_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Largest page a listing may request
pub const MAX_PAGE_SIZE: u32 = 100;

/// Longest accepted content type token
const MAX_TYPE_LEN: usize = 64;

// ============================================================================
// Upload Requests
// ============================================================================

/// Metadata accompanying a direct upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectUpload {
    /// Original file name, used for the record name and extension
    pub file_name: String,

    /// Content type token, also the top-level blob directory
    pub file_type: String,

    /// Size the caller claims the byte source has
    pub declared_size: u64,
}

/// One chunk of a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRegistration {
    /// Absent on the first chunk of a new session
    #[serde(default)]
    pub upload_id: Option<String>,

    /// 1-based position of this chunk
    pub chunk_number: u32,

    pub total_chunks: u32,

    /// Byte length the caller claims this chunk has
    pub declared_chunk_len: u64,

    pub file_name: String,
    pub file_type: String,

    /// Size of the complete file
    pub file_size: u64,

    /// SHA-256 of the complete file, hex encoded
    pub content_hash: String,
}

// ============================================================================
// Listing
// ============================================================================

/// Filtered, paginated listing request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(flatten)]
    pub filter: FileFilter,

    /// 1-based page number
    pub page: u32,

    pub page_size: u32,
}

impl ListQuery {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            filter: FileFilter::default(),
            page,
            page_size,
        }
    }

    pub fn with_filter(mut self, filter: FileFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Validate pagination, returning `(limit, offset)`
    pub fn bounds(&self) -> Result<(u32, u64)> {
        if self.page < 1 {
            return Err(ValidationError::Page(self.page).into());
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            return Err(ValidationError::PageSize(self.page_size).into());
        }

        let offset = u64::from(self.page - 1) * u64::from(self.page_size);
        Ok((self.page_size, offset))
    }
}

/// One page of records plus the total number of matches
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub records: Vec<FileRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

// ============================================================================
// Reads
// ============================================================================

/// How a record's bytes should be delivered
pub enum ReadHandle {
    /// Small enough for whole-file transfer from disk
    Path(PathBuf),

    /// Must be streamed
    Stream { reader: BlobReader, size: u64 },
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
        }
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Progress report for a chunk session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub upload_id: String,
    pub state: SessionState,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub progress: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&ChunkSession> for SessionProgress {
    fn from(session: &ChunkSession) -> Self {
        Self {
            upload_id: session.upload_id.clone(),
            state: session.state,
            total_chunks: session.total_chunks,
            received_chunks: session.received_chunks.clone(),
            missing_chunks: session.missing_chunks(),
            progress: session.progress(),
            file_id: session.file_id.clone(),
            failure: session.failure.clone(),
        }
    }
}

// ============================================================================
// Field Validation
// ============================================================================

/// Content types double as directory names, so only path-safe tokens pass
pub fn validate_file_type(file_type: &str) -> Result<()> {
    if file_type.is_empty() {
        return Err(ValidationError::MissingField("file_type").into());
    }
    if file_type.len() > MAX_TYPE_LEN
        || !file_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IngestError::invalid(
            "file_type",
            "only letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(())
}

pub fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.trim().is_empty() {
        return Err(ValidationError::MissingField("file_name").into());
    }
    Ok(())
}

/// Check a declared SHA-256 and return it lowercased
pub fn normalize_hash(content_hash: &str) -> Result<String> {
    if content_hash.is_empty() {
        return Err(ValidationError::MissingField("content_hash").into());
    }
    if content_hash.len() != HASH_HEX_LEN || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IngestError::invalid(
            "content_hash",
            format!("expected {} hex characters", HASH_HEX_LEN),
        ));
    }
    Ok(content_hash.to_ascii_lowercase())
}
