//! In-memory collaborators.
//!
//! Useful for development and single-process deployments.
//! Data is lost on restart.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};

use reflow_core::{
    CacheError, CacheStorageManager, MediaFileManager, SessionId, UploadFileUrlInfo,
    UploadedFileManager,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const DEFAULT_UPLOAD_ENDPOINT: &str = "/_reflow/upload_file";

/// A file uploaded by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFileRec {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Uploaded-file manager holding files in memory, per session.
#[derive(Debug)]
pub struct MemoryUploadedFileManager {
    endpoint: String,
    files: RwLock<HashMap<SessionId, HashMap<String, UploadedFileRec>>>,
}

impl MemoryUploadedFileManager {
    /// Create a manager whose URLs live under `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Store a file for a session, replacing one with the same id.
    pub fn add_file(&self, session_id: &str, file: UploadedFileRec) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .insert(file.file_id.clone(), file);
    }

    /// Files of a session with the given ids. Unknown ids are skipped.
    #[must_use]
    pub fn get_files(&self, session_id: &str, file_ids: &[String]) -> Vec<UploadedFileRec> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let Some(session_files) = files.get(session_id) else {
            return Vec::new();
        };
        file_ids
            .iter()
            .filter_map(|id| session_files.get(id).cloned())
            .collect()
    }

    /// Remove one file. Returns whether it existed.
    pub fn remove_file(&self, session_id: &str, file_id: &str) -> bool {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(session_id)
            .is_some_and(|session_files| session_files.remove(file_id).is_some())
    }

    #[must_use]
    pub fn session_file_count(&self, session_id: &str) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, HashMap::len)
    }
}

impl Default for MemoryUploadedFileManager {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_ENDPOINT)
    }
}

impl UploadedFileManager for MemoryUploadedFileManager {
    fn get_upload_urls(&self, session_id: &str, file_names: &[String]) -> Vec<UploadFileUrlInfo> {
        file_names
            .iter()
            .map(|_| {
                let file_id = Uuid::new_v4().to_string();
                let url = format!("{}/{session_id}/{file_id}", self.endpoint);
                UploadFileUrlInfo {
                    file_id,
                    upload_url: url.clone(),
                    delete_url: url,
                }
            })
            .collect()
    }

    fn remove_session_files(&self, session_id: &str) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

/// A media file served to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Default)]
struct MediaState {
    files: HashMap<String, MediaFile>,
    session_refs: HashMap<SessionId, HashSet<String>>,
}

/// Media-file manager with content-addressed files and per-session refs.
#[derive(Debug, Default)]
pub struct MemoryMediaFileManager {
    state: Mutex<MediaState>,
}

impl MemoryMediaFileManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<MediaFile> {
        self.lock().files.get(file_id).cloned()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }
}

impl MediaFileManager for MemoryMediaFileManager {
    /// Identical content stored twice yields the same id.
    fn add(&self, session_id: &str, data: Vec<u8>, mime_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mime_type.as_bytes());
        hasher.update(&data);
        let file_id = hex::encode(hasher.finalize());

        let mut state = self.lock();
        state
            .session_refs
            .entry(session_id.to_string())
            .or_default()
            .insert(file_id.clone());
        state.files.entry(file_id.clone()).or_insert_with(|| MediaFile {
            data,
            mime_type: mime_type.to_string(),
        });
        file_id
    }

    fn clear_session_refs(&self, session_id: &str) {
        self.lock().session_refs.remove(session_id);
    }

    fn remove_orphaned_files(&self) {
        let mut state = self.lock();
        let MediaState { files, session_refs } = &mut *state;
        files.retain(|file_id, _| session_refs.values().any(|refs| refs.contains(file_id)));
    }
}

/// One named in-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Vec<u8>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries
            .write()
            .map_err(|e| CacheError::Storage(e.to_string()))?
            .clear();
        Ok(())
    }
}

/// Cache storage manager handing out in-memory caches by name.
#[derive(Debug, Default)]
pub struct MemoryCacheStorageManager {
    caches: RwLock<HashMap<String, Weak<MemoryCache>>>,
}

impl MemoryCacheStorageManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cache named `name`, creating it if no live one exists.
    pub fn create(&self, name: &str) -> Arc<MemoryCache> {
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = caches.get(name).and_then(Weak::upgrade) {
            return cache;
        }
        let cache = Arc::new(MemoryCache::default());
        caches.insert(name.to_string(), Arc::downgrade(&cache));
        cache
    }
}

impl CacheStorageManager for MemoryCacheStorageManager {
    fn clear_all(&self) -> Result<(), CacheError> {
        let mut caches = self
            .caches
            .write()
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        caches.retain(|_, cache| cache.strong_count() > 0);
        for cache in caches.values().filter_map(Weak::upgrade) {
            cache.clear()?;
        }
        Ok(())
    }
}
