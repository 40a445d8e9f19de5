//! LocalStorage trait for the private per-application storage area.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing
//! - `NativeStorage` (in download-daemon) - A directory on disk via tokio::fs
//!
//! Storage is flat: every entry is addressed by the remote item's name, untransformed.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

use crate::dedup::LocalFileSet;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat store of downloaded files, keyed by file name.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Names of every file currently stored
    async fn list_files(&self) -> Result<Vec<String>>;

    /// Write a file, replacing any previous contents
    async fn write(&self, name: &str, content: &[u8]) -> Result<()>;

    /// Read a file back
    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Check whether a file exists
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Snapshot of stored names for the dedup check.
    async fn snapshot(&self) -> Result<LocalFileSet> {
        Ok(self.list_files().await?.into_iter().collect())
    }
}

/// In-memory storage for testing
#[derive(Default)]
pub struct InMemoryStorage {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    /// When set, every write fails with an IO error
    fail_writes: AtomicBool,
    /// When set, listing fails with an IO error
    fail_lists: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without counting it as a write.
    pub fn insert(&self, name: &str, content: &[u8]) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), content.to_vec());
    }

    /// Number of successful `write` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalStorage for InMemoryStorage {
    async fn list_files(&self) -> Result<Vec<String>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(StorageError::Io("listing refused".into()));
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.keys().cloned().collect())
    }

    async fn write(&self, name: &str, content: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(format!("write refused: {}", name)));
        }
        if name.is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }

        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), content.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(name))
    }
}

// Lets a test keep a handle on the storage it gives to a controller
#[async_trait]
impl<T: LocalStorage + ?Sized> LocalStorage for std::sync::Arc<T> {
    async fn list_files(&self) -> Result<Vec<String>> {
        (**self).list_files().await
    }

    async fn write(&self, name: &str, content: &[u8]) -> Result<()> {
        (**self).write(name, content).await
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        (**self).read(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name).await
    }
}
