//! Append-only byte stores backing the record logs.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the backing store.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record serialization error.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Short description without the backing path, fit for client replies.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            StoreError::Io { source, .. } => source.kind().to_string(),
            StoreError::Serialize(_) => "record serialization failed".to_string(),
        }
    }
}

/// An append-only sequence of bytes.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append bytes to the end of the store.
    async fn append(&self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Read everything appended so far.
    async fn read_all(&self) -> Result<Bytes, StoreError>;
}

/// A store backed by a single file opened in append mode.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open a file store, creating the file (and its parent directory) if
    /// missing. Existing content is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Opened file store");
        Ok(Self { path })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LogStore for FileStore {
    async fn append(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        file.write_all(bytes).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Bytes, StoreError> {
        match fs::read(&self.path).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Bytes::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// An in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.contents.lock().await.extend_from_slice(bytes);
        Ok(())
    }

    async fn read_all(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::copy_from_slice(&self.contents.lock().await))
    }
}
