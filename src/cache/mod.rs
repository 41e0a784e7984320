//! On-disk state under `.mend/` in the target repository.
//!
//! Layout:
//! - `attempts/<file-key>.jsonl` append-only healing audit trail
//! - `runs/<run-id>.json` per-run summaries
//! - `escalations/<file-key>.md` human-facing escalation reports
//!
//! Writers take an exclusive `fs2` lock on `.mend/.lock`; readers a shared
//! one. JSONL files are only ever appended to, never rewritten.

use crate::util::{hash_str, sanitize_component};
use anyhow::Context;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

const CACHE_DIR: &str = ".mend";
const ATTEMPTS_DIR: &str = "attempts";
const RUNS_DIR: &str = "runs";
const ESCALATIONS_DIR: &str = "escalations";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

/// Stable, filesystem-safe key for a repository path.
///
/// `src/cart.ts` -> `src_cart.ts-<hash8>`. The hash keeps keys distinct
/// when sanitizing collapses two paths to the same text.
pub fn file_key_slug(file_key: &str) -> String {
    let hash = hash_str(file_key);
    format!("{}-{}", sanitize_component(file_key), &hash[..8])
}

#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Cache {
    pub fn new(project_root: &Path) -> Self {
        Self {
            cache_dir: project_root.join(CACHE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn attempts_path(&self, file_key: &str) -> PathBuf {
        self.cache_dir
            .join(ATTEMPTS_DIR)
            .join(format!("{}.jsonl", file_key_slug(file_key)))
    }

    pub fn run_report_path(&self, run_id: &str) -> PathBuf {
        self.cache_dir
            .join(RUNS_DIR)
            .join(format!("{}.json", sanitize_component(run_id)))
    }

    pub fn escalation_path(&self, file_key: &str) -> PathBuf {
        self.cache_dir
            .join(ESCALATIONS_DIR)
            .join(format!("{}.md", file_key_slug(file_key)))
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir)
                .with_context(|| format!("Failed to create {}", self.cache_dir.display()))?;
        }
        if let Err(err) = self.ensure_mend_ignored() {
            warn!(error = %err, "could not add .mend/ to ignore rules");
        }
        Ok(())
    }

    /// Keep `.mend/` out of commits made by the publisher.
    fn ensure_mend_ignored(&self) -> anyhow::Result<()> {
        let Some(repo_root) = self.cache_dir.parent() else {
            return Ok(());
        };

        let gitignore_path = repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, ".mend/");
        }

        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let info_dir = git_dir.join("info");
            fs::create_dir_all(&info_dir)?;
            return append_ignore_entry(&info_dir.join("exclude"), ".mend/");
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<CacheLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.cache_dir.exists() {
            return Err(anyhow::anyhow!("Cache directory missing"));
        }

        let lock_path = self.cache_dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for cache lock ({}s)",
                            CACHE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(CacheLock { file })
    }

    /// Append one JSON row. Never rewrites existing rows.
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, record: &T) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let row = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", row)?;
        Ok(())
    }

    /// Read every well-formed row, oldest first. Malformed rows are skipped.
    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> anyhow::Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock(false)?;
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut rows = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(row) => rows.push(row),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping malformed history row"
                ),
            }
        }
        Ok(rows)
    }

    pub fn save_run_report<T: Serialize>(&self, run_id: &str, report: &T) -> anyhow::Result<PathBuf> {
        let _lock = self.lock(true)?;
        let path = self.run_report_path(run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }

    pub fn save_escalation(&self, file_key: &str, report: &str) -> anyhow::Result<PathBuf> {
        let _lock = self.lock(true)?;
        let path = self.escalation_path(file_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, report)?;
        Ok(path)
    }
}

fn append_ignore_entry(path: &Path, entry: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == ".mend"
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# mend state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

/// Write through a temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[test]
    fn test_file_key_slug_is_stable_and_distinct() {
        let a = file_key_slug("src/cart.ts");
        assert!(a.starts_with("src_cart.ts-"));
        assert_eq!(a, file_key_slug("src/cart.ts"));
        assert_ne!(file_key_slug("src/a b.ts"), file_key_slug("src/a_b.ts"));
    }

    #[test]
    fn test_jsonl_append_and_read_skips_malformed_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        let path = cache.attempts_path("src/cart.ts");

        cache.append_jsonl(&path, &Row { n: 1 }).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        cache.append_jsonl(&path, &Row { n: 2 }).unwrap();

        let rows: Vec<Row> = cache.read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        let rows: Vec<Row> = cache.read_jsonl(&cache.attempts_path("nope.ts")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_ignore_entry_added_once() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gitignore"), "node_modules/").unwrap();
        let cache = Cache::new(tmp.path());

        cache.save_escalation("src/a.ts", "# report\n").unwrap();
        cache.save_escalation("src/a.ts", "# report again\n").unwrap();

        let ignore = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert_eq!(ignore.matches(".mend/").count(), 1);
        assert!(ignore.starts_with("node_modules/\n"));
        let report = fs::read_to_string(cache.escalation_path("src/a.ts")).unwrap();
        assert_eq!(report, "# report again\n");
    }

    #[test]
    fn test_save_run_report() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        let path = cache.save_run_report("run-1", &Row { n: 7 }).unwrap();
        let loaded: Row = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded, Row { n: 7 });
    }
}
