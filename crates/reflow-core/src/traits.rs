//! Collaborator contracts the session depends on.
//!
//! Implementations are shared across sessions and called from both the
//! session's event loop and script runner threads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::FileUrls;

/// Upload and delete URLs for one requested file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileUrlInfo {
    pub file_id: String,
    pub upload_url: String,
    pub delete_url: String,
}

impl From<UploadFileUrlInfo> for FileUrls {
    fn from(info: UploadFileUrlInfo) -> Self {
        Self {
            file_id: info.file_id,
            upload_url: info.upload_url,
            delete_url: info.delete_url,
        }
    }
}

/// Uploaded-file manager.
pub trait UploadedFileManager: Send + Sync {
    /// Allocate upload URLs for the given file names.
    fn get_upload_urls(&self, session_id: &str, file_names: &[String]) -> Vec<UploadFileUrlInfo>;

    /// Release every file uploaded by a session.
    fn remove_session_files(&self, session_id: &str);
}

/// Media file manager.
pub trait MediaFileManager: Send + Sync {
    /// Store a file referenced by `session_id` and return its id.
    fn add(&self, session_id: &str, data: Vec<u8>, mime_type: &str) -> String;

    /// Drop a session's references to media files.
    fn clear_session_refs(&self, session_id: &str);

    /// Delete files no session references anymore.
    fn remove_orphaned_files(&self);
}

/// Cache error.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache storage manager.
pub trait CacheStorageManager: Send + Sync {
    /// Clear every data and resource cache.
    ///
    /// # Errors
    /// Returns error if a cache backend cannot be cleared.
    fn clear_all(&self) -> Result<(), CacheError>;
}
