use super::manifest;
use super::session::SandboxSession;
use crate::config::SandboxConfig;
use crate::results::{
    classify, failure_summary, parse_runner_output, ExecutionResult, ExecutionStatus, ParseSource,
    ParsedRun,
};
use crate::util::{run_command_with_timeout, tail_chars, CommandRunResult};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

const NOTE_OUTPUT_CHARS: usize = 2_000;

/// Stage that stopped the run early.
enum Halt {
    Setup(String),
    Provision(String, Option<CommandRunResult>),
}

/// Runs one generated suite in a fresh sandbox.
///
/// Stages: materialize, provision, execute, classify. The sandbox is
/// removed on every exit path, including cancellation of the returned
/// future (via the session's `Drop`).
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        source_path: &Path,
        source_text: &str,
        test_path: &Path,
        test_code: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        let root = self.config.workspace_root();
        let label = source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unit");

        let session = match SandboxSession::create(&root, label) {
            Ok(session) => session,
            Err(err) => {
                warn!(file = %source_path.display(), error = %err, "sandbox setup failed");
                return halted_result(
                    String::new(),
                    Halt::Setup(format!("Sandbox setup failed: {}", err)),
                    started.elapsed(),
                );
            }
        };
        let sandbox_id = session.id().to_string();

        let outcome = self
            .run_stages(&session, source_path, source_text, test_path, test_code, started)
            .await;

        session.close().await;

        let result = match outcome {
            Ok(result) => result,
            Err(halt) => halted_result(sandbox_id, halt, started.elapsed()),
        };
        info!(
            file = %source_path.display(),
            sandbox_id = %result.sandbox_id,
            status = %result.status,
            passed = result.totals.passed,
            failed = result.totals.failed,
            duration_ms = result.duration_ms,
            "sandbox run finished"
        );
        result
    }

    async fn run_stages(
        &self,
        session: &SandboxSession,
        source_path: &Path,
        source_text: &str,
        test_path: &Path,
        test_code: &str,
        started: Instant,
    ) -> Result<ExecutionResult, Halt> {
        // Materialize
        let materialize = || -> Result<(), super::SandboxError> {
            session.write_file(source_path, source_text)?;
            session.write_file(test_path, test_code)?;
            for (path, content) in manifest::runner_files() {
                session.write_file(&path, &content)?;
            }
            Ok(())
        };
        materialize().map_err(|err| Halt::Setup(format!("Sandbox setup failed: {}", err)))?;
        debug!(sandbox_id = %session.id(), "sandbox materialized");

        // Provision
        if !self.config.install_command.is_empty() {
            let mut command = self
                .command(&self.config.install_command, session, test_path)
                .ok_or_else(|| Halt::Setup("Install command is empty".to_string()))?;
            let run = run_command_with_timeout(
                &mut command,
                self.config.install_timeout(),
                self.config.output_cap_bytes,
            )
            .await
            .map_err(|err| Halt::Provision(format!("Dependency install could not start: {}", err), None))?;

            if run.timed_out {
                let note = format!(
                    "Dependency install timed out after {}s",
                    self.config.install_timeout_secs
                );
                return Err(Halt::Provision(note, Some(run)));
            }
            if !run.success() {
                let note = format!(
                    "Dependency install failed (exit {})",
                    exit_label(run.exit_code())
                );
                return Err(Halt::Provision(note, Some(run)));
            }
            debug!(sandbox_id = %session.id(), "dependencies installed");
        }

        // Execute
        let mut command = self
            .command(&self.config.test_command, session, test_path)
            .ok_or_else(|| Halt::Setup("Test command is empty".to_string()))?;
        let run = match run_command_with_timeout(
            &mut command,
            self.config.test_timeout(),
            self.config.output_cap_bytes,
        )
        .await
        {
            Ok(run) => run,
            Err(err) => {
                return Err(Halt::Setup(format!("Test command could not start: {}", err)));
            }
        };

        // Classify
        let results_file = if run.timed_out {
            None
        } else {
            std::fs::read_to_string(session.path().join(&self.config.results_file)).ok()
        };
        // Partial output from a killed run is still worth scanning.
        let parsed = parse_runner_output(results_file.as_deref(), &run.stdout, &run.stderr);
        let status = classify(run.timed_out, run.success(), &parsed);

        let note = match status {
            ExecutionStatus::Timeout => Some(format!(
                "The test run exceeded the {}s wall-clock timeout and was killed. \
                 This is not an assertion failure: suspect an infinite loop, an unresolved \
                 promise or timer, or an unmocked external call.",
                self.config.test_timeout_secs
            )),
            ExecutionStatus::Error if parsed.source == ParseSource::Unavailable => Some(format!(
                "The test runner exited (code {}) without producing readable results.",
                exit_label(run.exit_code())
            )),
            ExecutionStatus::Error if parsed.totals.total == 0 => {
                Some("The test runner reported zero tests.".to_string())
            }
            _ => None,
        };

        Ok(ExecutionResult {
            status,
            failure_summary: failure_summary(&parsed.suites),
            suites: parsed.suites,
            totals: parsed.totals,
            exit_code: run.exit_code(),
            stdout: run.stdout,
            stderr: run.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            sandbox_id: session.id().to_string(),
            parse_source: parsed.source,
            note,
        })
    }

    fn command(
        &self,
        argv: &[String],
        session: &SandboxSession,
        test_path: &Path,
    ) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let test_file = test_path.to_string_lossy();
        let substitute = |arg: &str| {
            arg.replace("{results_file}", &self.config.results_file)
                .replace("{test_file}", &test_file)
        };
        let mut command = Command::new(substitute(program));
        command
            .args(args.iter().map(|a| substitute(a)))
            .current_dir(session.path());
        for (key, value) in SandboxSession::env_overrides() {
            command.env(key, value);
        }
        Some(command)
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn halted_result(sandbox_id: String, halt: Halt, elapsed: Duration) -> ExecutionResult {
    let (note, run) = match halt {
        Halt::Setup(note) => (note, None),
        Halt::Provision(note, run) => (note, run),
    };
    let (stdout, stderr, exit_code) = match run {
        Some(run) => {
            let code = run.exit_code();
            (run.stdout, run.stderr, code)
        }
        None => (String::new(), String::new(), None),
    };
    let summary = if stderr.trim().is_empty() {
        note.clone()
    } else {
        format!("{}\n{}", note, tail_chars(stderr.trim(), NOTE_OUTPUT_CHARS))
    };
    let parsed = ParsedRun::unavailable();
    ExecutionResult {
        status: ExecutionStatus::Error,
        suites: parsed.suites,
        totals: parsed.totals,
        stdout,
        stderr,
        failure_summary: summary,
        duration_ms: elapsed.as_millis() as u64,
        sandbox_id,
        exit_code,
        parse_source: parsed.source,
        note: Some(note),
    }
}
