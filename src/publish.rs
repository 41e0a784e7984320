//! Write-back of accepted fixes to the source repository.

use crate::git_ops;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing is disabled (dry run)")]
    Disabled,

    #[error("failed to commit '{path}': {message}")]
    Commit { path: PathBuf, message: String },
}

#[async_trait]
pub trait FixPublisher: Send + Sync {
    /// Durably write `content` to `path`. Returns the commit reference.
    async fn publish(&self, path: &Path, content: &str, message: &str) -> Result<String, PublishError>;
}

/// Writes into the working tree and commits the single file.
///
/// Publishes are serialized: each commit builds on the HEAD left by the
/// previous one. Clones share the lock.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    repo_root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitPublisher {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl FixPublisher for GitPublisher {
    async fn publish(&self, path: &Path, content: &str, message: &str) -> Result<String, PublishError> {
        let repo_root = self.repo_root.clone();
        let relative = path.to_path_buf();
        let content = content.to_string();
        let message = message.to_string();

        // The guard moves into the blocking task so a cancelled caller
        // cannot release it while the commit is still being written.
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let committed = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            git_ops::write_and_commit(&repo_root, &relative, &content, &message)
        })
        .await
        .map_err(|err| PublishError::Commit {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let commit = committed.map_err(|err| PublishError::Commit {
            path: path.to_path_buf(),
            message: format!("{:#}", err),
        })?;
        info!(file = %path.display(), commit = %commit, "fix committed");
        Ok(commit)
    }
}

/// Never writes. Every publish reports `Disabled`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunPublisher;

#[async_trait]
impl FixPublisher for DryRunPublisher {
    async fn publish(&self, path: &Path, _content: &str, _message: &str) -> Result<String, PublishError> {
        info!(file = %path.display(), "dry run: fix not committed");
        Err(PublishError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_git_publisher_commits_file() {
        let tmp = tempfile::tempdir().unwrap();
        git_ops::init_repo_with_file(tmp.path(), "src/a.ts", "export const a = 1;\n");

        let publisher = GitPublisher::new(tmp.path());
        let commit = publisher
            .publish(Path::new("src/a.test.ts"), "it('a', () => expect(1).toBe(1));\n", "mend: fix test")
            .await
            .unwrap();

        assert_eq!(git_ops::head_commit(tmp.path()).unwrap(), commit);
        let (content, _) =
            git_ops::read_file_at_ref(tmp.path(), &commit, Path::new("src/a.test.ts")).unwrap();
        assert!(content.contains("toBe(1)"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_all_land_on_head() {
        let tmp = tempfile::tempdir().unwrap();
        git_ops::init_repo_with_file(tmp.path(), "src/a.ts", "export const a = 1;\n");
        let publisher = GitPublisher::new(tmp.path());

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let path = PathBuf::from(format!("src/f{}.test.ts", n));
                    let body = format!("it('f{}', () => expect({}).toBe({}));\n", n, n, n);
                    publisher.publish(&path, &body, &format!("mend: add f{}", n)).await
                })
            })
            .collect();
        let mut commits = Vec::new();
        for task in tasks {
            commits.push(task.await.unwrap().unwrap());
        }

        let head = git_ops::head_commit(tmp.path()).unwrap();
        assert!(commits.contains(&head));
        for n in 0..8 {
            let path = PathBuf::from(format!("src/f{}.test.ts", n));
            let (content, _) = git_ops::read_file_at_ref(tmp.path(), "HEAD", &path).unwrap();
            assert!(content.contains(&format!("'f{}'", n)));
        }

        let repo = git2::Repository::open(tmp.path()).unwrap();
        let mut walk = repo.revwalk().unwrap();
        walk.push_head().unwrap();
        assert_eq!(walk.count(), 9);
    }

    #[tokio::test]
    async fn test_dry_run_never_commits() {
        let result = DryRunPublisher.publish(Path::new("a.ts"), "x", "m").await;
        assert!(matches!(result, Err(PublishError::Disabled)));
    }
}
