use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// How long to keep draining pipes after a killed process before giving up.
/// Grandchildren that inherited the pipe can keep it open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(1500);

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi escape pattern")
});

static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}",
        r"sk-[A-Za-z0-9_\-]{8,}",
        r#"(?i)(api[_-]?key|token|secret|password)\s*[=:]\s*["']?[^\s"',}]{4,}"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("secret pattern"))
    .collect()
});

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

pub fn tail_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars()
        .skip(count.saturating_sub(max_chars))
        .collect::<String>()
}

pub fn strip_ansi(input: &str) -> String {
    ANSI_ESCAPE.replace_all(input, "").into_owned()
}

/// Mask anything that looks like a credential before it leaves the process.
pub fn redact_secrets(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        out = pattern.replace_all(&out, "[redacted]").into_owned();
    }
    out
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// True when either stream exceeded the capture cap and was cut to its tail.
    pub truncated: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

#[derive(Debug, Default)]
struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }
}

/// Kills the child's whole process group when dropped, so workers forked by
/// a runner die with it on timeout, on completion and on cancellation.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. An emptied group yields ESRCH.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<CappedBuffer>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    buf.push(&chunk[..n]);
                }
            }
        }
    }
}

fn drain_buffer(sink: &Arc<Mutex<CappedBuffer>>) -> (String, bool) {
    match sink.lock() {
        Ok(buf) => (String::from_utf8_lossy(&buf.bytes).to_string(), buf.truncated),
        Err(_) => (String::new(), false),
    }
}

/// Run a command with a hard wall-clock timeout, keeping at most `output_cap`
/// bytes (the tail) of each stream.
///
/// The child runs in its own process group. The group is killed when the
/// timeout fires, when the command finishes, and when the returned future is
/// dropped, so neither the child nor anything it forked outlives the call.
pub async fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
    output_cap: usize,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;
    let mut group = ProcessGroupGuard { pgid: child.id() };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(output_cap)));
    let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(output_cap)));
    let stdout_task = tokio::spawn(pump(stdout, Arc::clone(&stdout_buf)));
    let stderr_task = tokio::spawn(pump(stderr, Arc::clone(&stderr_buf)));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(format!("Failed to wait for command: {}", e));
        }
        Err(_) => {
            group.kill();
            let _ = child.start_kill();
            (child.wait().await.ok(), true)
        }
    };
    // Leftover workers would otherwise hold the pipes open.
    group.kill();

    for task in [stdout_task, stderr_task] {
        let abort = task.abort_handle();
        if tokio::time::timeout(PIPE_DRAIN_GRACE, task).await.is_err() {
            abort.abort();
        }
    }

    let (stdout, stdout_truncated) = drain_buffer(&stdout_buf);
    let (stderr, stderr_truncated) = drain_buffer(&stderr_buf);

    Ok(CommandRunResult {
        status,
        stdout,
        stderr,
        timed_out,
        truncated: stdout_truncated || stderr_truncated,
    })
}

pub struct RepoPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Validate that `candidate` is a plain relative path (no root, no `..`).
pub fn ensure_relative(candidate: &Path) -> Result<(), String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() || candidate.has_root() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }
    Ok(())
}

pub fn resolve_repo_path_allow_new(repo_root: &Path, candidate: &Path) -> Result<RepoPath, String> {
    ensure_relative(candidate)?;

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve repo root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes repository: {}", candidate.display()));
    }

    let relative = joined
        .strip_prefix(&root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| candidate.to_path_buf());

    Ok(RepoPath {
        absolute: joined,
        relative,
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}

pub fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('_').chars().take(80).collect::<String>();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("ab", 5), "ab");
    }

    #[test]
    fn test_strip_ansi_removes_color_codes() {
        let colored = "\x1b[31m✕ adds\x1b[39m \x1b[2m(3 ms)\x1b[22m";
        assert_eq!(strip_ansi(colored), "✕ adds (3 ms)");
    }

    #[test]
    fn test_redact_secrets_masks_keys_and_bearer_tokens() {
        let text = "401 from upstream: Authorization: Bearer abcdefgh12345678 api_key=sk-or-v1-deadbeefcafe";
        let redacted = redact_secrets(text);
        assert!(!redacted.contains("abcdefgh12345678"));
        assert!(!redacted.contains("deadbeefcafe"));
        assert!(redacted.contains("[redacted]"));
    }

    #[test]
    fn test_hash_str_is_stable() {
        let a = hash_str("hello");
        let b = hash_str("hello");
        let c = hash_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ensure_relative_rejects_traversal_and_absolute() {
        assert!(ensure_relative(Path::new("src/a.ts")).is_ok());
        assert!(ensure_relative(Path::new("../a.ts")).is_err());
        assert!(ensure_relative(Path::new("/etc/passwd")).is_err());
        assert!(ensure_relative(Path::new("")).is_err());
    }

    #[test]
    fn test_sanitize_component_replaces_separators() {
        assert_eq!(sanitize_component("src/lib/math.ts"), "src_lib_math.ts");
        assert_eq!(sanitize_component("///"), "file");
    }

    #[test]
    fn test_capped_buffer_keeps_tail() {
        let mut buf = CappedBuffer::new(4);
        buf.push(b"abc");
        buf.push(b"def");
        assert_eq!(buf.bytes, b"cdef");
        assert!(buf.truncated);
    }

    #[test]
    fn test_resolve_repo_path_allow_new_accepts_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let candidate = PathBuf::from("new_dir/new_file.ts");
        let resolved = resolve_repo_path_allow_new(root.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("new_dir/new_file.ts"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; exit 3");
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10), 1024)
            .await
            .unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_with_timeout_kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 20");
        let started = std::time::Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(300), 1024)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        // Zombies count as dead: they no longer run.
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_exit(pid: &str) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_command_with_timeout_kills_forked_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("worker.pid");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("sleep 300 & echo $! > {}; wait", pid_file.display()));

        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(500), 1024)
            .await
            .unwrap();

        assert!(result.timed_out);
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(wait_for_exit(pid.trim()).await, "worker {} survived the timeout", pid.trim());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_command_kills_forked_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("worker.pid");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("sleep 300 & echo $! > {}; wait", pid_file.display()));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(500),
            run_command_with_timeout(&mut cmd, Duration::from_secs(60), 1024),
        )
        .await;

        assert!(cancelled.is_err());
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(wait_for_exit(pid.trim()).await, "worker {} survived cancellation", pid.trim());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_with_timeout_caps_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done");
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10), 64)
            .await
            .unwrap();
        assert!(result.truncated);
        assert!(result.stdout.len() <= 64);
        assert!(result.stdout.contains("line-199"));
    }

    #[tokio::test]
    async fn test_run_command_with_timeout_reports_spawn_failure() {
        let mut cmd = Command::new("definitely-not-a-real-binary-mend");
        let err = run_command_with_timeout(&mut cmd, Duration::from_secs(1), 64)
            .await
            .unwrap_err();
        assert!(err.contains("Failed to start command"));
    }
}
