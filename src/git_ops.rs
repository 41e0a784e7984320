//! Git plumbing for source fetching and fix publishing.
//!
//! Blocking `git2` calls. Async callers go through `spawn_blocking`.

use crate::util::resolve_repo_path_allow_new;
use anyhow::{Context, Result};
use git2::build::TreeUpdateBuilder;
use git2::{FileMode, Repository, Signature};
use std::path::Path;

const FALLBACK_AUTHOR: &str = "mend";
const FALLBACK_EMAIL: &str = "mend@local";

/// Full id of the commit HEAD points at.
pub fn head_commit(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository at {}", repo_path.display()))?;
    let head = repo.head().context("Failed to get HEAD")?;
    let commit = head.peel_to_commit().context("HEAD does not point at a commit")?;
    Ok(commit.id().to_string())
}

/// Resolve `rev` (branch, tag, sha, `HEAD~1`) to a full commit id.
pub fn resolve_commit(repo_path: &Path, rev: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let commit = repo
        .revparse_single(rev)
        .with_context(|| format!("Unknown revision '{}'", rev))?
        .peel_to_commit()
        .with_context(|| format!("Revision '{}' is not a commit", rev))?;
    Ok(commit.id().to_string())
}

/// Read a file's content exactly as committed at `rev`.
pub fn read_file_at_ref(repo_path: &Path, rev: &str, relative: &Path) -> Result<(String, String)> {
    let repo = Repository::open(repo_path)?;
    let commit = repo
        .revparse_single(rev)
        .with_context(|| format!("Unknown revision '{}'", rev))?
        .peel_to_commit()
        .with_context(|| format!("Revision '{}' is not a commit", rev))?;
    let tree = commit.tree()?;
    let entry = tree
        .get_path(relative)
        .with_context(|| format!("'{}' does not exist at {}", relative.display(), rev))?;
    let blob = entry
        .to_object(&repo)?
        .peel_to_blob()
        .with_context(|| format!("'{}' is not a file", relative.display()))?;
    let content = std::str::from_utf8(blob.content())
        .with_context(|| format!("'{}' is not valid UTF-8", relative.display()))?
        .to_string();
    Ok((content, commit.id().to_string()))
}

/// Overwrite one file in the working tree and commit it alone.
///
/// The commit's tree is HEAD's tree with only this blob replaced, never the
/// shared index, so files staged by anything else are not swept in. Callers
/// that commit concurrently to one repository must serialize calls.
pub fn write_and_commit(
    repo_path: &Path,
    relative: &Path,
    content: &str,
    message: &str,
) -> Result<String> {
    let resolved = resolve_repo_path_allow_new(repo_path, relative).map_err(anyhow::Error::msg)?;
    if let Some(parent) = resolved.absolute.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&resolved.absolute, content)
        .with_context(|| format!("Failed to write {}", resolved.relative.display()))?;

    let commit = commit_file(repo_path, &resolved.relative, content, message)?;
    // Keep the index in step so the working tree reads as clean.
    stage_file(repo_path, &resolved.relative)?;
    Ok(commit)
}

/// Stage a specific file
pub fn stage_file(repo_path: &Path, relative: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;
    index.add_path(relative)?;
    index.write()?;
    Ok(())
}

/// Commit `content` at `relative` on top of HEAD (or as the root commit).
fn commit_file(repo_path: &Path, relative: &Path, content: &str, message: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(err) if err.code() == git2::ErrorCode::UnbornBranch => None,
        Err(err) => return Err(err.into()),
    };
    let baseline = match &parent {
        Some(commit) => commit.tree()?,
        None => {
            let empty = repo.treebuilder(None)?.write()?;
            repo.find_tree(empty)?
        }
    };

    let mode = match baseline.get_path(relative) {
        Ok(entry) if entry.filemode() == i32::from(FileMode::BlobExecutable) => FileMode::BlobExecutable,
        _ => FileMode::Blob,
    };
    let blob = repo.blob(content.as_bytes())?;
    let tree_id = TreeUpdateBuilder::new()
        .upsert(relative, blob, mode)
        .create_updated(&repo, &baseline)
        .with_context(|| format!("Failed to build tree for {}", relative.display()))?;
    let tree = repo.find_tree(tree_id)?;

    let sig = signature(&repo)?;
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| FALLBACK_AUTHOR.to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| FALLBACK_EMAIL.to_string());
    Ok(Signature::now(&name, &email)?)
}

#[cfg(test)]
pub(crate) fn init_repo_with_file(dir: &Path, relative: &str, content: &str) -> String {
    Repository::init(dir).unwrap();
    write_and_commit(dir, Path::new(relative), content, "initial").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_file_pinned_to_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let first = init_repo_with_file(tmp.path(), "src/cart.ts", "export const v = 1;\n");
        let second =
            write_and_commit(tmp.path(), Path::new("src/cart.ts"), "export const v = 2;\n", "bump").unwrap();

        let (old, old_ref) = read_file_at_ref(tmp.path(), &first, Path::new("src/cart.ts")).unwrap();
        assert_eq!(old, "export const v = 1;\n");
        assert_eq!(old_ref, first);

        let (new, new_ref) = read_file_at_ref(tmp.path(), "HEAD", Path::new("src/cart.ts")).unwrap();
        assert_eq!(new, "export const v = 2;\n");
        assert_eq!(new_ref, second);
        assert_eq!(head_commit(tmp.path()).unwrap(), second);
        assert_eq!(resolve_commit(tmp.path(), "HEAD~1").unwrap(), first);
    }

    #[test]
    fn test_missing_file_at_ref_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_file(tmp.path(), "a.ts", "export const a = 1;\n");
        let err = read_file_at_ref(tmp.path(), "HEAD", Path::new("b.ts")).unwrap_err();
        assert!(format!("{:#}", err).contains("does not exist"));
    }

    #[test]
    fn test_commit_ignores_unrelated_staged_files() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_file(tmp.path(), "src/a.ts", "export const a = 1;\n");
        std::fs::write(tmp.path().join("notes.txt"), "wip\n").unwrap();
        stage_file(tmp.path(), Path::new("notes.txt")).unwrap();

        let commit = write_and_commit(tmp.path(), Path::new("src/a.ts"), "export const a = 2;\n", "bump").unwrap();

        let (content, _) = read_file_at_ref(tmp.path(), &commit, Path::new("src/a.ts")).unwrap();
        assert_eq!(content, "export const a = 2;\n");
        assert!(read_file_at_ref(tmp.path(), &commit, Path::new("notes.txt")).is_err());
    }

    #[test]
    fn test_write_and_commit_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_file(tmp.path(), "a.ts", "x\n");
        assert!(write_and_commit(tmp.path(), Path::new("../evil.ts"), "x", "msg").is_err());
    }
}
