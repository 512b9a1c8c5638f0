//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Stored files. One row per distinct (content_hash, content_type); a
-- re-upload of soft-deleted content reactivates the existing row.
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    extension TEXT NOT NULL DEFAULT '',
    relative_path TEXT NOT NULL,
    absolute_url TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'NORMAL',
    deleted_state TEXT NOT NULL DEFAULT 'NORMAL',
    disable_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE(content_hash, content_type)
);

CREATE INDEX IF NOT EXISTS idx_files_relative_path ON files(relative_path);
CREATE INDEX IF NOT EXISTS idx_files_created_at ON files(created_at);

-- Chunked upload sessions
CREATE TABLE IF NOT EXISTS chunk_sessions (
    upload_id TEXT PRIMARY KEY,
    total_chunks INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'OPEN',
    file_id TEXT,
    failure TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    purged_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_chunk_sessions_state ON chunk_sessions(state);
CREATE INDEX IF NOT EXISTS idx_chunk_sessions_updated ON chunk_sessions(updated_at);

-- Received chunks, one row per (session, chunk number)
CREATE TABLE IF NOT EXISTS chunk_parts (
    upload_id TEXT NOT NULL,
    chunk_number INTEGER NOT NULL,
    scratch_path TEXT NOT NULL,
    size INTEGER NOT NULL,
    received_at TEXT NOT NULL,

    PRIMARY KEY (upload_id, chunk_number)
);
"#;
