//! Source access: content of a file pinned to an exact commit.

use crate::git_ops;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A file as the pipeline sees it. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Repository-relative path
    pub path: PathBuf,
    pub content: String,
    /// Commit the content was read at; `None` for working-tree reads
    pub commit_ref: Option<String>,
}

impl SourceUnit {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>, commit_ref: Option<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            commit_ref,
        }
    }

    /// Key for the attempt history. Forward slashes on every platform.
    pub fn file_key(&self) -> String {
        file_key_for(&self.path)
    }
}

pub fn file_key_for(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("'{path}' not found: {message}")]
    NotFound { path: PathBuf, message: String },

    #[error("failed to read '{path}': {message}")]
    Read { path: PathBuf, message: String },
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// `reference` pins the read; `None` means the fetcher's default.
    async fn fetch(&self, path: &Path, reference: Option<&str>) -> Result<SourceUnit, SourceError>;
}

/// Reads blobs straight from the object database at a commit.
#[derive(Debug, Clone)]
pub struct GitSource {
    repo_root: PathBuf,
    default_ref: String,
}

impl GitSource {
    pub fn new(repo_root: impl Into<PathBuf>, default_ref: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            default_ref: default_ref.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitSource {
    async fn fetch(&self, path: &Path, reference: Option<&str>) -> Result<SourceUnit, SourceError> {
        let repo_root = self.repo_root.clone();
        let relative = path.to_path_buf();
        let rev = reference.unwrap_or(self.default_ref.as_str()).to_string();

        let read = tokio::task::spawn_blocking(move || {
            git_ops::read_file_at_ref(&repo_root, &rev, &relative)
        })
        .await
        .map_err(|err| SourceError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        match read {
            Ok((content, commit)) => Ok(SourceUnit::new(path, content, Some(commit))),
            Err(err) => Err(SourceError::NotFound {
                path: path.to_path_buf(),
                message: format!("{:#}", err),
            }),
        }
    }
}

/// Working-tree reads for local runs. Ignores `reference`.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceFetcher for FsSource {
    async fn fetch(&self, path: &Path, _reference: Option<&str>) -> Result<SourceUnit, SourceError> {
        crate::util::ensure_relative(path).map_err(|message| SourceError::Read {
            path: path.to_path_buf(),
            message,
        })?;
        match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(content) => Ok(SourceUnit::new(path, content, None)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
            Err(err) => Err(SourceError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }
}
