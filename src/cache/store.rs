//! On-disk copy of the last fetched document
//!
//! Provides a `PersistentStore` that keeps the most recent document body in a
//! single file. The file's modification time doubles as the freshness
//! timestamp after a restart.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// File name used for the persisted document
pub const CACHE_FILE_NAME: &str = "cached.html";

/// Errors that can occur while persisting the document
#[derive(Debug, Error)]
pub enum StorageError {
    /// A filesystem operation failed
    #[error("Failed to {operation} {path:?}: {source}")]
    Io {
        /// What we were doing when it failed
        operation: &'static str,
        /// Path the operation targeted
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Reads and writes the persisted document
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so readers see either the old content or the new content, never a mix.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    /// Location of the persisted document
    path: PathBuf,
}

impl PersistentStore {
    /// Creates a store in the XDG-compliant cache directory
    ///
    /// Uses `~/.cache/roster-cache/cached.html` on Linux, or the equivalent
    /// path on other platforms. Returns `None` if no home directory is known.
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "roster-cache")?;
        Some(Self::with_path(project_dirs.cache_dir().join(CACHE_FILE_NAME)))
    }

    /// Creates a store backed by a specific file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the persisted document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temp file the next write is staged in
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CACHE_FILE_NAME.to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }

    /// Replaces the persisted document with `content`
    ///
    /// # Returns
    /// * `Ok(())` once the new content is in place
    /// * `Err(StorageError)` if the directory, temp file or rename fails
    pub async fn write(&self, content: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    operation: "create directory",
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let staging = self.staging_path();
        if let Err(source) = fs::write(&staging, content).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::Io {
                operation: "write",
                path: staging,
                source,
            });
        }

        if let Err(source) = fs::rename(&staging, &self.path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::Io {
                operation: "replace",
                path: self.path.clone(),
                source,
            });
        }

        Ok(())
    }

    /// Reads the persisted document
    ///
    /// Returns `None` if nothing has been written yet or the file is unreadable.
    pub async fn read(&self) -> Option<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read persisted document");
                None
            }
        }
    }

    /// Modification time of the persisted document, if it exists
    pub async fn last_modified(&self) -> Option<DateTime<Utc>> {
        let metadata = fs::metadata(&self.path).await.ok()?;
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }
}
