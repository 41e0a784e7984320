//! Healing attempt history: the per-file audit trail.
//!
//! Stores are append-only. Callers read once at the start of a healing
//! step and append once at its end; nothing is ever rewritten in place.

use crate::cache::Cache;
use crate::heal::{HealStatus, Replacement, Risk, Strategy};
use crate::results::ExecutionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// One execute-then-heal cycle for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    /// 1-indexed, strictly increasing per file within a run
    pub attempt_number: u32,
    /// Pipeline run the attempt belongs to; numbering restarts per run
    #[serde(default)]
    pub run_id: String,
    pub file: String,
    pub root_cause: String,
    pub strategy: Strategy,
    pub confidence: u8,
    pub risk: Risk,
    #[serde(default)]
    pub replacement: Option<Replacement>,
    pub status: HealStatus,
    pub commit_published: bool,
    #[serde(default)]
    pub commit_ref: Option<String>,
    pub execution_status: ExecutionStatus,
    pub recorded_at: DateTime<Utc>,
}

impl HealingAttempt {
    /// One-line form used in history listings and escalation reports.
    pub fn summary_line(&self) -> String {
        let commit = match (&self.commit_ref, self.commit_published) {
            (Some(commit), true) => format!(" commit {}", short_ref(commit)),
            _ => String::new(),
        };
        format!(
            "#{} {} -> {} (confidence {}, risk {:?}, run {}){}",
            self.attempt_number,
            self.strategy,
            self.status,
            self.confidence,
            self.risk,
            self.execution_status,
            commit
        )
    }
}

fn short_ref(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attempt history for '{file_key}' unavailable: {message}")]
    Backend { file_key: String, message: String },

    #[error("attempt history task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Every recorded attempt for `file_key`, oldest first.
    async fn load(&self, file_key: &str) -> Result<Vec<HealingAttempt>, StoreError>;

    async fn append(&self, file_key: &str, attempt: &HealingAttempt) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: Mutex<HashMap<String, Vec<HealingAttempt>>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn load(&self, file_key: &str) -> Result<Vec<HealingAttempt>, StoreError> {
        let attempts = self.attempts.lock().await;
        Ok(attempts.get(file_key).cloned().unwrap_or_default())
    }

    async fn append(&self, file_key: &str, attempt: &HealingAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.lock().await;
        attempts
            .entry(file_key.to_string())
            .or_default()
            .push(attempt.clone());
        Ok(())
    }
}

/// JSONL-backed store under `.mend/attempts/`.
#[derive(Debug, Clone)]
pub struct JsonlAttemptStore {
    cache: Cache,
}

impl JsonlAttemptStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl AttemptStore for JsonlAttemptStore {
    async fn load(&self, file_key: &str) -> Result<Vec<HealingAttempt>, StoreError> {
        let cache = self.cache.clone();
        let key = file_key.to_string();
        tokio::task::spawn_blocking(move || {
            let path = cache.attempts_path(&key);
            cache
                .read_jsonl::<HealingAttempt>(&path)
                .map_err(|err| StoreError::Backend {
                    file_key: key,
                    message: format!("{:#}", err),
                })
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }

    async fn append(&self, file_key: &str, attempt: &HealingAttempt) -> Result<(), StoreError> {
        let cache = self.cache.clone();
        let key = file_key.to_string();
        let attempt = attempt.clone();
        tokio::task::spawn_blocking(move || {
            let path = cache.attempts_path(&key);
            cache
                .append_jsonl(&path, &attempt)
                .map_err(|err| StoreError::Backend {
                    file_key: key,
                    message: format!("{:#}", err),
                })
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

/// Human-readable history listing for the CLI.
pub fn format_history(file_key: &str, attempts: &[HealingAttempt]) -> String {
    if attempts.is_empty() {
        return format!("No healing attempts recorded for {}\n", file_key);
    }
    let mut out = format!("Healing history for {} ({} attempts)\n", file_key, attempts.len());
    for attempt in attempts {
        out.push_str(&format!(
            "  {}  [{}] {}\n",
            attempt.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            short_ref(&attempt.run_id),
            attempt.summary_line()
        ));
        if !attempt.root_cause.is_empty() {
            out.push_str(&format!("      {}\n", crate::util::truncate(&attempt.root_cause, 160)));
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn sample_attempt(number: u32, status: HealStatus) -> HealingAttempt {
    HealingAttempt {
        attempt_number: number,
        run_id: "run-1".to_string(),
        file: "src/cart.ts".to_string(),
        root_cause: format!("cause {}", number),
        strategy: Strategy::LogicFix,
        confidence: 60,
        risk: Risk::Medium,
        replacement: None,
        status,
        commit_published: false,
        commit_ref: None,
        execution_status: ExecutionStatus::Fail,
        recorded_at: Utc::now(),
    }
}
