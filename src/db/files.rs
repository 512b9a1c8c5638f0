//! File record database operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::Result;

/// Whether a record may be served and reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum FileStatus {
    Normal,
    Disable,
}

/// Soft-delete marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum DeletedState {
    Normal,
    Deleted,
}

/// A stored content artifact
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub extension: String,
    pub relative_path: String,
    pub absolute_url: String,
    pub content_hash: String,
    #[sqlx(try_from = "i64")]
    pub size: u64,
    pub status: FileStatus,
    pub deleted_state: DeletedState,
    pub disable_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Visible to dedup reuse: neither disabled nor deleted
    pub fn is_active(&self) -> bool {
        self.status == FileStatus::Normal && self.deleted_state == DeletedState::Normal
    }

    pub fn is_disabled(&self) -> bool {
        self.status == FileStatus::Disable
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_state == DeletedState::Deleted
    }
}

/// Fields for a record about to be created
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub name: String,
    pub content_type: String,
    pub extension: String,
    pub relative_path: String,
    pub absolute_url: String,
    pub content_hash: String,
    pub size: u64,
}

/// Which records a listing includes with respect to soft deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedFilter {
    /// Only records that are not soft-deleted
    #[default]
    Active,
    /// Only soft-deleted records
    Deleted,
    /// Everything
    All,
}

/// AND-composed listing filters; `None` imposes no constraint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFilter {
    pub path_prefix: Option<String>,
    pub id: Option<String>,
    pub status: Option<FileStatus>,
    #[serde(default)]
    pub deleted: DeletedFilter,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, content_type, extension, relative_path, absolute_url,
           content_hash, size, status, deleted_state, disable_reason,
           created_at, updated_at
    FROM files
"#;

/// File repository
pub struct FileRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FileRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a record by id
    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Find the record for a (hash, type) pair regardless of status
    pub async fn find_by_hash(&self, content_hash: &str, content_type: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_COLUMNS} WHERE content_hash = ? AND content_type = ?"
        ))
        .bind(content_hash)
        .bind(content_type)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Find the active (not disabled, not deleted) record for a (hash, type) pair
    pub async fn find_active(&self, content_hash: &str, content_type: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_COLUMNS} WHERE content_hash = ? AND content_type = ? \
             AND status = 'NORMAL' AND deleted_state = 'NORMAL'"
        ))
        .bind(content_hash)
        .bind(content_type)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Insert a record unless one already exists for its (hash, type) pair.
    ///
    /// Returns `None` when the uniqueness constraint rejected the insert, in
    /// which case the caller should re-read the winning record.
    pub async fn insert_if_absent(&self, data: &NewFileRecord) -> Result<Option<FileRecord>> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let size = i64::try_from(data.size)
            .map_err(|_| crate::error::IngestError::invalid("size", "exceeds storable range"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO files (id, name, content_type, extension, relative_path, absolute_url,
                               content_hash, size, status, deleted_state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'NORMAL', 'NORMAL', ?, ?)
            ON CONFLICT(content_hash, content_type) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&data.name)
        .bind(&data.content_type)
        .bind(&data.extension)
        .bind(&data.relative_path)
        .bind(&data.absolute_url)
        .bind(&data.content_hash)
        .bind(size)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(&id).await
    }

    /// Reactivate a soft-deleted record. Disabled records are left alone.
    pub async fn resurrect(&self, id: &str) -> Result<Option<FileRecord>> {
        sqlx::query(
            r#"
            UPDATE files
            SET status = 'NORMAL', deleted_state = 'NORMAL', updated_at = ?
            WHERE id = ? AND status = 'NORMAL' AND deleted_state = 'DELETED'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool)
        .await?;

        self.get(id).await
    }

    /// Disable a record, keeping its deleted state untouched
    pub async fn disable(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'DISABLE', disable_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a record deleted without touching its bytes
    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET deleted_state = 'DELETED', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List records matching `filter`, newest first, with the total match count
    pub async fn list(&self, filter: &FileFilter, limit: u32, offset: u64) -> Result<(Vec<FileRecord>, i64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM files");
        push_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let records = select
            .build_query_as::<FileRecord>()
            .fetch_all(self.pool)
            .await?;

        Ok((records, total))
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &FileFilter) {
    builder.push(" WHERE 1 = 1");

    if let Some(prefix) = &filter.path_prefix {
        builder
            .push(" AND relative_path LIKE ")
            .push_bind(format!("{}%", escape_like(prefix)))
            .push(" ESCAPE '\\'");
    }

    if let Some(id) = &filter.id {
        builder.push(" AND id = ").push_bind(id.clone());
    }

    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }

    match filter.deleted {
        DeletedFilter::Active => {
            builder.push(" AND deleted_state = 'NORMAL'");
        }
        DeletedFilter::Deleted => {
            builder.push(" AND deleted_state = 'DELETED'");
        }
        DeletedFilter::All => {}
    }
}

/// Escape LIKE wildcards so a prefix matches literally
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
