//! Sandbox lifecycle under faults at each stage. Every run must leave the
//! sandbox root empty.

use mend::config::SandboxConfig;
use mend::results::{ExecutionStatus, ParseSource};
use mend::sandbox::{SandboxExecutor, SandboxSession};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const SOURCE: &str = "export function add(a: number, b: number): number {\n  return a + b;\n}\n";
const TEST: &str = "import { add } from './math';\n\nit('adds', () => {\n  expect(add(1, 2)).toBe(3);\n});\n";

const ONE_PASSING: &str = r#"{"testResults":[{"name":"src/math.test.ts","status":"passed","message":"","assertionResults":[{"ancestorTitles":[],"title":"adds","status":"passed","duration":1,"failureMessages":[]}]}]}"#;
const NO_TESTS: &str = r#"{"testResults":[]}"#;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn config(workspace: &Path, test_script: &str) -> SandboxConfig {
    SandboxConfig {
        workspace_root: Some(workspace.to_path_buf()),
        install_command: Vec::new(),
        test_command: sh(test_script),
        test_timeout_secs: 10,
        install_timeout_secs: 10,
        ..SandboxConfig::default()
    }
}

fn write_fixture(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn assert_clean(workspace: &Path) {
    let root = SandboxSession::root_for(workspace);
    let left = std::fs::read_dir(&root).map(|d| d.count()).unwrap_or(0);
    assert_eq!(left, 0, "sandboxes left behind in {}", root.display());
}

async fn execute(executor: &SandboxExecutor) -> mend::results::ExecutionResult {
    executor
        .execute(Path::new("src/math.ts"), SOURCE, Path::new("src/math.test.ts"), TEST)
        .await
}

#[tokio::test]
async fn passing_run_sees_materialized_files() {
    let fixtures = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let results = write_fixture(&fixtures, "pass.json", ONE_PASSING);
    let script = format!(
        "test -f src/math.ts && test -f {{test_file}} && test -f package.json && cp {} {{results_file}}",
        results
    );
    let executor = SandboxExecutor::new(config(workspace.path(), &script));

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Pass);
    assert_eq!(result.parse_source, ParseSource::Structured);
    assert_eq!(result.totals.passed, 1);
    assert!(result.note.is_none());
    assert_clean(workspace.path());
}

#[tokio::test]
async fn unwritable_workspace_is_a_setup_error() {
    let workspace = tempfile::tempdir().unwrap();
    // A plain file where the sandbox root should be.
    let blocker = workspace.path().join("blocked");
    std::fs::write(&blocker, "not a directory").unwrap();
    let executor = SandboxExecutor::new(config(&blocker, "exit 0"));

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.note.unwrap().contains("Sandbox setup failed"));
    assert!(result.sandbox_id.is_empty());
    assert!(!SandboxSession::root_for(&blocker).exists());
}

#[tokio::test]
async fn path_escape_fails_materialization_and_cleans_up() {
    let workspace = tempfile::tempdir().unwrap();
    let executor = SandboxExecutor::new(config(workspace.path(), "exit 0"));

    let result = executor
        .execute(Path::new("../escape.ts"), SOURCE, Path::new("src/math.test.ts"), TEST)
        .await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.note.unwrap().contains("Sandbox setup failed"));
    assert!(!result.sandbox_id.is_empty());
    assert!(!workspace.path().join("escape.ts").exists());
    assert_clean(workspace.path());
}

#[tokio::test]
async fn failed_install_is_reported_with_its_output() {
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = config(workspace.path(), "exit 0");
    cfg.install_command = sh("echo 'npm ERR! 404 left-pad' >&2; exit 3");
    let executor = SandboxExecutor::new(cfg);

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.note.unwrap().contains("Dependency install failed (exit 3)"));
    assert!(result.failure_summary.contains("npm ERR! 404"));
    assert_clean(workspace.path());
}

#[tokio::test]
async fn slow_install_times_out() {
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = config(workspace.path(), "exit 0");
    cfg.install_command = sh("exec sleep 30");
    cfg.install_timeout_secs = 1;
    let executor = SandboxExecutor::new(cfg);

    let started = std::time::Instant::now();
    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.note.unwrap().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_clean(workspace.path());
}

#[tokio::test]
async fn hung_test_run_is_a_timeout() {
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = config(workspace.path(), "echo starting; exec sleep 30");
    cfg.test_timeout_secs = 1;
    let executor = SandboxExecutor::new(cfg);

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.timed_out());
    assert!(result.note.unwrap().contains("wall-clock timeout"));
    assert_clean(workspace.path());
}

/// Running means present in /proc and not a zombie.
#[cfg(target_os = "linux")]
async fn exited_within(pid: &str, limit: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < limit {
        let running = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false);
        if !running {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timeout_kills_workers_forked_by_the_runner() {
    let fixtures = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let pid_file = fixtures.path().join("worker.pid");
    let mut cfg = config(
        workspace.path(),
        &format!("sleep 300 & echo $! > {}; wait", pid_file.display()),
    );
    cfg.test_timeout_secs = 1;
    let executor = SandboxExecutor::new(cfg);

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(exited_within(pid.trim(), Duration::from_secs(2)).await);
    assert_clean(workspace.path());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancellation_kills_workers_forked_by_the_runner() {
    let fixtures = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let pid_file = fixtures.path().join("worker.pid");
    let mut cfg = config(
        workspace.path(),
        &format!("sleep 300 & echo $! > {}; wait", pid_file.display()),
    );
    cfg.test_timeout_secs = 60;
    let executor = SandboxExecutor::new(cfg);

    let cancelled = tokio::time::timeout(Duration::from_millis(700), execute(&executor)).await;

    assert!(cancelled.is_err());
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(exited_within(pid.trim(), Duration::from_secs(2)).await);
    assert_clean(workspace.path());
}

#[tokio::test]
async fn missing_runner_is_a_setup_error() {
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = config(workspace.path(), "exit 0");
    cfg.test_command = vec!["mend-no-such-runner-binary".to_string()];
    let executor = SandboxExecutor::new(cfg);

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.note.unwrap().contains("could not start"));
    assert_clean(workspace.path());
}

#[tokio::test]
async fn unreadable_output_is_an_error() {
    let workspace = tempfile::tempdir().unwrap();
    let executor = SandboxExecutor::new(config(workspace.path(), "echo 'segfault' >&2; exit 139"));

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.parse_source, ParseSource::Unavailable);
    assert!(result.note.unwrap().contains("without producing readable results"));
    assert_clean(workspace.path());
}

#[tokio::test]
async fn zero_tests_is_an_error_even_on_success() {
    let fixtures = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let results = write_fixture(&fixtures, "empty.json", NO_TESTS);
    let executor = SandboxExecutor::new(config(
        workspace.path(),
        &format!("cp {} {{results_file}}", results),
    ));

    let result = execute(&executor).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.totals.total, 0);
    assert_clean(workspace.path());
}

#[tokio::test]
async fn cancelled_run_still_removes_its_sandbox() {
    let workspace = tempfile::tempdir().unwrap();
    let mut cfg = config(workspace.path(), "exec sleep 30");
    cfg.test_timeout_secs = 60;
    let executor = SandboxExecutor::new(cfg);

    let cancelled = tokio::time::timeout(Duration::from_millis(500), execute(&executor)).await;

    assert!(cancelled.is_err());
    assert_clean(workspace.path());
}

#[tokio::test]
async fn concurrent_runs_get_separate_sandboxes() {
    let fixtures = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let results = write_fixture(&fixtures, "pass.json", ONE_PASSING);
    // Fails if another run's marker is already present in this sandbox.
    let script = format!(
        "test ! -f marker && touch marker && sleep 0.2 && cp {} {{results_file}}",
        results
    );
    let executor = SandboxExecutor::new(config(workspace.path(), &script));

    let (a, b) = tokio::join!(execute(&executor), execute(&executor));

    assert_eq!(a.status, ExecutionStatus::Pass);
    assert_eq!(b.status, ExecutionStatus::Pass);
    assert_ne!(a.sandbox_id, b.sandbox_id);
    assert_clean(workspace.path());
}
