//! Native storage implementation using tokio::fs.

use async_trait::async_trait;
use download_core::storage::{LocalStorage, Result, StorageError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Flat directory of downloaded files
pub struct NativeStorage {
    base_path: PathBuf,
}

impl NativeStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a file name, refusing anything that would leave the directory.
    fn full_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.base_path.join(name))
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

#[async_trait]
impl LocalStorage for NativeStorage {
    async fn list_files(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            // Nothing downloaded yet
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
            let metadata = entry.metadata().await.map_err(io_error)?;
            if !metadata.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!("Skipping non-UTF-8 file name {:?}", raw),
            }
        }

        Ok(names)
    }

    async fn write(&self, name: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(name)?;

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(io_error)?;

        fs::write(&full_path, content).await.map_err(io_error)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(name)?;
        fs::read(&full_path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
            _ => io_error(e),
        })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let full_path = self.full_path(name)?;
        fs::try_exists(&full_path).await.map_err(io_error)
    }
}
