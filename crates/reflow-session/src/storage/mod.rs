//! Collaborator implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{
    MediaFile, MemoryCache, MemoryCacheStorageManager, MemoryMediaFileManager,
    MemoryUploadedFileManager, UploadedFileRec,
};
