//! Blob path layout
//!
//! ```text
//! <type>/<token>_<hash>[.<ext>]       stored files
//! staging/<token>.upload              direct uploads being hashed
//! chunks/<upload_id>/<n>.<token>.chunk  received chunks
//! ```

use uuid::Uuid;

const STAGING_DIR: &str = "staging";
const CHUNK_DIR: &str = "chunks";
const MAX_EXTENSION_LEN: usize = 16;

/// Final location of a stored file
pub fn blob_path(file_type: &str, content_hash: &str, extension: &str) -> String {
    let token = Uuid::new_v4().simple();
    if extension.is_empty() {
        format!("{}/{}_{}", file_type, token, content_hash)
    } else {
        format!("{}/{}_{}.{}", file_type, token, content_hash, extension)
    }
}

/// Fresh staging location for a direct upload
pub fn staging_path() -> String {
    format!("{}/{}.upload", STAGING_DIR, Uuid::new_v4().simple())
}

/// Scratch directory owned by a chunk session
pub fn chunk_dir(upload_id: &str) -> String {
    format!("{}/{}", CHUNK_DIR, upload_id)
}

/// Fresh scratch location for one registration of a chunk.
///
/// Every registration gets its own file, so a retry never rewrites bytes a
/// merge may be reading.
pub fn chunk_path(upload_id: &str, chunk_number: u32) -> String {
    format!(
        "{}/{}.{}.chunk",
        chunk_dir(upload_id),
        chunk_number,
        Uuid::new_v4().simple()
    )
}

/// Record URL under the configured base
pub fn absolute_url(base_url: &str, relative_path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), relative_path)
}

/// Lowercased extension of a file name, or empty if it has none usable
/// in a blob path
pub fn extension_of(file_name: &str) -> String {
    let Some((stem, ext)) = file_name.rsplit_once('.') else {
        return String::new();
    };

    let usable = !stem.is_empty()
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());

    if usable {
        ext.to_ascii_lowercase()
    } else {
        String::new()
    }
}
