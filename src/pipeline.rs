//! Per-file pipeline: eligibility, signatures, generation, then the
//! execute/heal loop until PASS or escalation.

use crate::config::{ConfigError, PipelineConfig};
use crate::control::{HealRequest, LoopController, LoopState, Phase};
use crate::eligibility::{check_eligibility, Eligibility};
use crate::generate::{Coverage, SkippedFunction, TestGenerator};
use crate::heal::{HealStatus, HealingAnalyzer, Strategy};
use crate::history::AttemptStore;
use crate::llm::{merge_usage, ModelClient, Usage};
use crate::publish::{FixPublisher, PublishError};
use crate::results::ExecutionStatus;
use crate::sandbox::SandboxExecutor;
use crate::signatures::extract_signatures;
use crate::source::SourceFetcher;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// External collaborators, constructed once at startup.
#[derive(Clone)]
pub struct Capabilities {
    pub source: Arc<dyn SourceFetcher>,
    pub model: Arc<dyn ModelClient>,
    pub store: Arc<dyn AttemptStore>,
    pub publisher: Arc<dyn FixPublisher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The suite passed after `heal_attempts` healing steps.
    Passed { heal_attempts: u32 },
    Skipped { reason: String },
    Failed { reason: String },
    Escalated { report: String },
    Cancelled,
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Passed { .. } => "PASSED",
            PipelineOutcome::Skipped { .. } => "SKIPPED",
            PipelineOutcome::Failed { .. } => "FAILED",
            PipelineOutcome::Escalated { .. } => "ESCALATED",
            PipelineOutcome::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub test_path: PathBuf,
    pub coverage: Coverage,
    pub test_case_count: usize,
    pub quality_score: u8,
    pub metadata_reported: bool,
    pub skipped: Vec<SkippedFunction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub attempt_number: u32,
    pub status: ExecutionStatus,
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    pub duration_ms: u64,
    pub sandbox_id: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealSummary {
    pub attempt_number: u32,
    pub status: HealStatus,
    pub strategy: Strategy,
    pub confidence: u8,
    pub commit_published: bool,
    pub commit_ref: Option<String>,
    pub root_cause: String,
}

/// Everything one file's run produced, serialized into `.mend/runs/`.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub run_id: String,
    pub file: PathBuf,
    pub commit_ref: Option<String>,
    pub outcome: PipelineOutcome,
    pub generation: Option<GenerationSummary>,
    pub executions: Vec<ExecutionSummary>,
    pub heals: Vec<HealSummary>,
    /// Commit of the passing suite, when it was published
    pub test_commit: Option<String>,
    pub usage: Option<Usage>,
    pub duration_ms: u64,
}

impl FileReport {
    fn new(run_id: &str, file: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            file: file.to_path_buf(),
            commit_ref: None,
            outcome: PipelineOutcome::Cancelled,
            generation: None,
            executions: Vec::new(),
            heals: Vec::new(),
            test_commit: None,
            usage: None,
            duration_ms: 0,
        }
    }
}

/// Aggregate over a `run_many` batch.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub files: Vec<FileReport>,
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub escalated: usize,
    pub cancelled: usize,
    pub usage: Option<Usage>,
}

impl PipelineReport {
    pub fn from_files(run_id: &str, files: Vec<FileReport>) -> Self {
        let count = |label: &str| files.iter().filter(|f| f.outcome.label() == label).count();
        let usage = files
            .iter()
            .fold(None, |acc, f| merge_usage(acc, f.usage.clone()));
        Self {
            run_id: run_id.to_string(),
            passed: count("PASSED"),
            skipped: count("SKIPPED"),
            failed: count("FAILED"),
            escalated: count("ESCALATED"),
            cancelled: count("CANCELLED"),
            files,
            usage,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceFetcher>,
    publisher: Arc<dyn FixPublisher>,
    generator: TestGenerator,
    executor: SandboxExecutor,
    controller: LoopController,
}

impl Pipeline {
    /// Fails only on invalid configuration.
    pub fn new(config: PipelineConfig, caps: Capabilities) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.model_timeout();
        let generator = TestGenerator::new(caps.model.clone(), config.generation.clone(), timeout);
        let analyzer = HealingAnalyzer::new(caps.model, config.healing.clone(), timeout);
        let controller = LoopController::new(
            analyzer,
            caps.store,
            caps.publisher.clone(),
            config.max_attempts,
            config.confidence_threshold,
        );
        Ok(Self {
            executor: SandboxExecutor::new(config.sandbox.clone()),
            source: caps.source,
            publisher: caps.publisher,
            generator,
            controller,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_file(&self, run_id: &str, path: &Path, reference: Option<&str>) -> FileReport {
        let started = Instant::now();
        let mut report = FileReport::new(run_id, path);
        let outcome = self.drive(run_id, path, reference, &mut report).await;
        report.outcome = outcome;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            file = %path.display(),
            outcome = report.outcome.label(),
            executions = report.executions.len(),
            heals = report.heals.len(),
            duration_ms = report.duration_ms,
            "pipeline finished"
        );
        report
    }

    /// `run_file` under a caller deadline. Sandbox cleanup still runs when
    /// the deadline cancels an in-flight run.
    pub async fn run_with_deadline(
        &self,
        run_id: &str,
        path: &Path,
        reference: Option<&str>,
        deadline: Duration,
    ) -> FileReport {
        match tokio::time::timeout(deadline, self.run_file(run_id, path, reference)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(file = %path.display(), deadline = ?deadline, "pipeline cancelled by deadline");
                let mut report = FileReport::new(run_id, path);
                report.duration_ms = deadline.as_millis() as u64;
                report
            }
        }
    }

    /// Independent files, at most `max_concurrency` at a time.
    pub async fn run_many(&self, run_id: &str, paths: &[PathBuf], reference: Option<&str>) -> PipelineReport {
        let files: Vec<FileReport> = stream::iter(paths)
            .map(|path| self.run_file(run_id, path, reference))
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;
        PipelineReport::from_files(run_id, files)
    }

    async fn drive(
        &self,
        run_id: &str,
        path: &Path,
        reference: Option<&str>,
        report: &mut FileReport,
    ) -> PipelineOutcome {
        let unit = match self.source.fetch(path, reference).await {
            Ok(unit) => unit,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "source fetch failed");
                return PipelineOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        report.commit_ref = unit.commit_ref.clone();

        if let Eligibility::Skip(reason) = check_eligibility(&unit.path, &unit.content, &self.config.eligibility) {
            info!(file = %path.display(), reason = %reason, "file skipped");
            return PipelineOutcome::Skipped { reason };
        }

        let signatures = extract_signatures(&unit.content);
        let suite = match self.generator.generate(&unit.path, &unit.content, &signatures).await {
            Ok(suite) => suite,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "test generation failed");
                return PipelineOutcome::Failed {
                    reason: crate::util::redact_secrets(&err.to_string()),
                };
            }
        };
        report.usage = merge_usage(report.usage.take(), suite.usage.clone());
        report.generation = Some(GenerationSummary {
            test_path: suite.test_path.clone(),
            coverage: suite.coverage,
            test_case_count: suite.test_case_count,
            quality_score: suite.quality_score,
            metadata_reported: suite.metadata_reported,
            skipped: suite.skipped.clone(),
        });

        let test_path = suite.test_path;
        let mut source_text = unit.content;
        let mut test_text = suite.code;
        let mut committed_test: Option<String> = None;
        let mut state = LoopState::new(self.config.max_attempts);

        loop {
            let execution = self
                .executor
                .execute(&unit.path, &source_text, &test_path, &test_text)
                .await;
            report.executions.push(ExecutionSummary {
                attempt_number: state.attempt_number,
                status: execution.status,
                passed: execution.totals.passed,
                failed: execution.totals.failed,
                total: execution.totals.total,
                duration_ms: execution.duration_ms,
                sandbox_id: execution.sandbox_id.clone(),
                note: execution.note.clone(),
            });

            if state.on_execution(&execution) == Phase::Done {
                if committed_test.as_deref() != Some(test_text.as_str()) {
                    report.test_commit = self.publish_suite(&unit.path, &test_path, &test_text).await;
                }
                return PipelineOutcome::Passed {
                    heal_attempts: state.attempt_number - 1,
                };
            }

            let outcome = self
                .controller
                .heal_step(HealRequest {
                    run_id,
                    source_path: &unit.path,
                    source_text: &source_text,
                    test_path: &test_path,
                    test_text: &test_text,
                    execution: &execution,
                    attempt_number: state.attempt_number,
                })
                .await;
            report.usage = merge_usage(report.usage.take(), outcome.usage.clone());
            if let Some(recorded) = &outcome.recorded {
                report.heals.push(HealSummary {
                    attempt_number: recorded.attempt_number,
                    status: recorded.status,
                    strategy: recorded.strategy,
                    confidence: recorded.confidence,
                    commit_published: recorded.commit_published,
                    commit_ref: recorded.commit_ref.clone(),
                    root_cause: recorded.root_cause.clone(),
                });
            }

            if outcome.commit_published && outcome.updated_test != test_text {
                committed_test = Some(outcome.updated_test.clone());
            }
            source_text = outcome.updated_source.clone();
            test_text = outcome.updated_test.clone();

            if state.on_heal(&outcome) == Phase::Escalated {
                return PipelineOutcome::Escalated {
                    report: outcome.escalation_report.unwrap_or_default(),
                };
            }
        }
    }

    /// Commit the passing suite. Best-effort.
    async fn publish_suite(&self, source_path: &Path, test_path: &Path, test_text: &str) -> Option<String> {
        let message = format!("mend: add generated tests for {}", source_path.display());
        match self.publisher.publish(test_path, test_text, &message).await {
            Ok(commit) => Some(commit),
            Err(PublishError::Disabled) => None,
            Err(err) => {
                warn!(file = %test_path.display(), error = %err, "failed to publish passing suite");
                None
            }
        }
    }
}
