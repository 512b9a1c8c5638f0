//! Error types for the ingest server

use thiserror::Error;

use crate::storage::StorageError;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingest error taxonomy
///
/// Every variant is surfaced to the caller as-is; nothing is retried
/// internally. [`IngestError::code`] gives a stable machine-readable code
/// for whatever transport sits in front of the service.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("File too large for direct upload: {size} bytes (max: {max}), use chunked upload")]
    SizeExceeded { size: u64, max: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictKind),

    #[error("Incomplete upload: missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Malformed or inconsistent input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("chunk size mismatch: declared {declared}, received {actual}")]
    ChunkSizeMismatch { declared: u64, actual: u64 },

    #[error("file size mismatch: declared {declared}, received {actual}")]
    FileSizeMismatch { declared: u64, actual: u64 },

    #[error("chunk number {chunk_number} out of range 1..={total_chunks}")]
    ChunkOutOfRange { chunk_number: u32, total_chunks: u32 },

    #[error("session metadata mismatch on {0}")]
    MetadataMismatch(&'static str),

    #[error("file too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("page must be >= 1, got {0}")]
    Page(u32),

    #[error("page size must be within 1..=100, got {0}")]
    PageSize(u32),
}

/// Requests that collide with the current state of a record or session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    #[error("file {0} is disabled and cannot be uploaded")]
    FileDisabled(String),

    #[error("upload session {0} no longer accepts chunks")]
    SessionClosed(String),

    #[error("upload session {0} is being merged by another caller")]
    MergeInProgress(String),

    #[error("upload session {id} failed: {reason}")]
    SessionFailed { id: String, reason: String },
}

/// Merged bytes did not match what the session declared
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl IngestError {
    /// Stable error code for this failure
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::ChunkSizeMismatch { .. }) => "CHUNK_SIZE_MISMATCH",
            Self::Validation(ValidationError::MetadataMismatch(_)) => "METADATA_MISMATCH",
            Self::Validation(ValidationError::FileTooLarge { .. }) => "FILE_TOO_LARGE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SizeExceeded { .. } => "SIZE_EXCEEDED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(ConflictKind::FileDisabled(_)) => "FILE_DISABLED",
            Self::Conflict(ConflictKind::SessionClosed(_)) => "SESSION_CLOSED",
            Self::Conflict(ConflictKind::MergeInProgress(_)) => "MERGE_IN_PROGRESS",
            Self::Conflict(ConflictKind::SessionFailed { .. }) => "SESSION_FAILED",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::Integrity(IntegrityError::SizeMismatch { .. }) => "SIZE_MISMATCH",
            Self::Integrity(IntegrityError::HashMismatch { .. }) => "HASH_MISMATCH",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidField {
            field,
            reason: reason.into(),
        })
    }
}
