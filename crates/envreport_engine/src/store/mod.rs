//! Remote hierarchical file storage seen by the pipeline.
mod azure;
mod local;

use std::io;
use std::path::PathBuf;

pub use azure::{AzureFileShare, AZURE_FILES_VERSION, MAX_RANGE_BYTES};
pub use local::LocalDirectoryStore;

use crate::credentials::CredentialError;
use crate::http::HttpError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
        }
    }
}

/// Result of an idempotent directory create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Created,
    AlreadyExisted,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage credentials unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error("{op} '{path}' failed: {source}")]
    Http {
        op: &'static str,
        path: String,
        #[source]
        source: HttpError,
    },
    #[error("{op} '{path}' failed: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unreadable listing for '{path}': {message}")]
    Listing { path: String, message: String },
    #[error("invalid storage path '{0}'")]
    InvalidPath(String),
}

/// Directory paths are `/`-separated and relative to the store root; `""` is the root.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Establish or refresh whatever the store needs before a run.
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Non-recursive listing of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StoreError>;

    async fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or overwrite `name` under `dir`.
    async fn write(&self, dir: &str, name: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Remove `name`; a file that is already gone is not an error.
    async fn delete(&self, dir: &str, name: &str) -> Result<(), StoreError>;

    /// Create `dir` and any missing ancestors; existing directories are success.
    async fn create_dir(&self, dir: &str) -> Result<DirStatus, StoreError>;
}

/// Join `/`-separated path fragments, dropping empty segments.
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn check_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(StoreError::InvalidPath(name.to_string()));
    }
    Ok(())
}

pub(crate) fn check_dir(dir: &str) -> Result<(), StoreError> {
    if dir
        .split('/')
        .any(|segment| segment == ".." || segment == "." || segment.contains('\\'))
    {
        return Err(StoreError::InvalidPath(dir.to_string()));
    }
    Ok(())
}
