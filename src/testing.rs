//! In-memory collaborators for tests and local experiments.
//!
//! Each double records what it was asked to do so assertions can check
//! call counts and payloads.

use crate::llm::{ModelClient, ModelError, ModelRequest, ModelResponse, Usage};
use crate::publish::{FixPublisher, PublishError};
use crate::source::{SourceError, SourceFetcher, SourceUnit};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Model client that replays a fixed script of responses in order.
///
/// An exhausted script answers with a transport error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, content: impl Into<String>) {
        self.push_response(content, None);
    }

    pub fn push_response(&self, content: impl Into<String>, usage: Option<Usage>) {
        lock(&self.script).push_back(Ok(ModelResponse {
            content: content.into(),
            latency: Duration::from_millis(1),
            usage,
            model: "scripted".to_string(),
        }));
    }

    pub fn push_err(&self, error: ModelError) {
        lock(&self.script).push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        lock(&self.requests).push(request);
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Transport("script exhausted".to_string())))
    }
}

/// Publisher that records every fix and hands out fake commit ids.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(PathBuf, String, String)>>,
    failures: Mutex<u32>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next publish fail with a commit error.
    pub fn fail_next(&self) {
        *lock(&self.failures) += 1;
    }

    /// `(path, content, message)` per successful publish, in order.
    pub fn published(&self) -> Vec<(PathBuf, String, String)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl FixPublisher for RecordingPublisher {
    async fn publish(&self, path: &Path, content: &str, message: &str) -> Result<String, PublishError> {
        {
            let mut failures = lock(&self.failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(PublishError::Commit {
                    path: path.to_path_buf(),
                    message: "simulated commit failure".to_string(),
                });
            }
        }
        let mut published = lock(&self.published);
        published.push((path.to_path_buf(), content.to_string(), message.to_string()));
        Ok(format!("{:040x}", published.len()))
    }
}

/// Source fetcher over a fixed map of path to content.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl SourceFetcher for MemorySource {
    async fn fetch(&self, path: &Path, reference: Option<&str>) -> Result<SourceUnit, SourceError> {
        match self.files.get(path) {
            Some(content) => Ok(SourceUnit::new(
                path,
                content.clone(),
                reference.map(str::to_string),
            )),
            None => Err(SourceError::NotFound {
                path: path.to_path_buf(),
                message: "not in memory source".to_string(),
            }),
        }
    }
}
