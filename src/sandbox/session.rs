use crate::util::{ensure_relative, sanitize_component};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const SANDBOX_ROOT_DIR: &str = "mend-sandbox";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox directory '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to write outside the sandbox: {0}")]
    InvalidPath(String),

    #[error("failed to write '{path}' into sandbox: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ephemeral workspace owned by exactly one execution attempt.
///
/// The directory is removed by `cleanup`, or by `Drop` when the owning
/// future is cancelled before reaching it.
#[derive(Debug)]
pub struct SandboxSession {
    id: String,
    path: PathBuf,
    removed: bool,
}

impl SandboxSession {
    /// Create `<workspace_root>/mend-sandbox/<label>-<uuid>`.
    pub fn create(workspace_root: &Path, label: &str) -> Result<Self, SandboxError> {
        let id = format!(
            "{}-{}",
            sanitize_component(label),
            uuid::Uuid::new_v4().simple()
        );
        let path = workspace_root.join(SANDBOX_ROOT_DIR).join(&id);

        std::fs::create_dir_all(&path).map_err(|source| SandboxError::Create {
            path: path.clone(),
            source,
        })?;
        debug!(sandbox_id = %id, path = %path.display(), "sandbox created");

        Ok(Self {
            id,
            path,
            removed: false,
        })
    }

    /// Parent directory holding every session under `workspace_root`.
    pub fn root_for(workspace_root: &Path) -> PathBuf {
        workspace_root.join(SANDBOX_ROOT_DIR)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `content` at `relative`, creating parent directories.
    pub fn write_file(&self, relative: &Path, content: &str) -> Result<PathBuf, SandboxError> {
        ensure_relative(relative).map_err(SandboxError::InvalidPath)?;
        let target = self.path.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SandboxError::Write {
                path: relative.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&target, content).map_err(|source| SandboxError::Write {
            path: relative.to_path_buf(),
            source,
        })?;
        Ok(target)
    }

    /// Remove the workspace. Best-effort: failure is logged, never raised.
    pub fn cleanup(mut self) -> bool {
        self.remove()
    }

    /// `cleanup` on the blocking pool, so removing a large `node_modules`
    /// does not stall runtime workers. The removal finishes even if the
    /// caller is cancelled while awaiting it.
    pub async fn close(self) -> bool {
        let id = self.id.clone();
        match tokio::task::spawn_blocking(move || self.cleanup()).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(sandbox_id = %id, error = %err, "sandbox cleanup task failed");
                false
            }
        }
    }

    /// Environment for every subprocess run inside a sandbox.
    pub fn env_overrides() -> Vec<(String, String)> {
        vec![
            ("CI".to_string(), "1".to_string()),
            ("NODE_ENV".to_string(), "test".to_string()),
            ("FORCE_COLOR".to_string(), "0".to_string()),
            ("NO_UPDATE_NOTIFIER".to_string(), "1".to_string()),
            ("npm_config_update_notifier".to_string(), "false".to_string()),
            ("npm_config_fund".to_string(), "false".to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ]
    }

    fn remove(&mut self) -> bool {
        if self.removed {
            return true;
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(sandbox_id = %self.id, "sandbox removed");
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!(sandbox_id = %self.id, path = %self.path.display(), error = %err, "sandbox cleanup failed");
                false
            }
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if !self.removed {
            debug!(sandbox_id = %self.id, "sandbox dropped without cleanup, removing");
            self.remove();
        }
    }
}
