//! Loop controller: the execute/heal state machine and one healing step.
//!
//! ```text
//! AWAITING_EXECUTION --PASS--------------------------> DONE
//! AWAITING_EXECUTION --FAIL/ERROR/TIMEOUT-----------> AWAITING_HEAL
//! AWAITING_HEAL      --FIXED/PARTIAL (publish)-------> AWAITING_EXECUTION
//! AWAITING_HEAL      --FAILED, attempts remain-------> AWAITING_EXECUTION
//! AWAITING_HEAL      --FAILED, attempts exhausted----> ESCALATED
//! ```
//!
//! `heal_step` is a single iteration. The caller owns the loop and feeds
//! back the updated texts and attempt number.

use crate::heal::{
    decide_status, HealError, HealStatus, HealingAnalyzer, HealingContext, ReplacementTarget,
    Risk, Strategy,
};
use crate::history::{AttemptStore, HealingAttempt};
use crate::llm::Usage;
use crate::publish::{FixPublisher, PublishError};
use crate::results::ExecutionResult;
use crate::source::file_key_for;
use crate::util::{redact_secrets, truncate};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const MAX_EXPLANATION_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingExecution,
    AwaitingHeal,
    Done,
    Escalated,
}

#[derive(Debug, Clone)]
pub struct LoopState {
    /// Attempt the next healing step runs as (1-indexed)
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub history: Vec<HealingAttempt>,
    pub phase: Phase,
}

impl LoopState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_number: 1,
            max_attempts,
            history: Vec::new(),
            phase: Phase::AwaitingExecution,
        }
    }

    pub fn on_execution(&mut self, result: &ExecutionResult) -> Phase {
        if self.phase == Phase::AwaitingExecution {
            self.phase = if result.passed() {
                Phase::Done
            } else {
                Phase::AwaitingHeal
            };
        }
        self.phase
    }

    pub fn on_heal(&mut self, outcome: &HealOutcome) -> Phase {
        if self.phase != Phase::AwaitingHeal {
            return self.phase;
        }
        self.attempt_number = outcome.attempt_number;
        if let Some(attempt) = &outcome.recorded {
            self.history.push(attempt.clone());
        }
        self.phase = if outcome.should_escalate {
            Phase::Escalated
        } else {
            Phase::AwaitingExecution
        };
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Escalated)
    }
}

/// True iff the incoming attempt is already over budget, or this attempt
/// FAILED and the next one would be.
pub fn should_escalate(input_attempt: u32, status: HealStatus, max_attempts: u32) -> bool {
    input_attempt > max_attempts
        || (status == HealStatus::Failed && input_attempt.saturating_add(1) > max_attempts)
}

/// Inputs for one healing step.
pub struct HealRequest<'a> {
    pub run_id: &'a str,
    pub source_path: &'a Path,
    pub source_text: &'a str,
    pub test_path: &'a Path,
    pub test_text: &'a str,
    pub execution: &'a ExecutionResult,
    pub attempt_number: u32,
}

/// Result handed back to the loop driver.
#[derive(Debug, Clone)]
pub struct HealOutcome {
    pub status: HealStatus,
    pub strategy: Strategy,
    pub confidence_score: u8,
    pub commit_published: bool,
    pub commit_ref: Option<String>,
    /// Input attempt number + 1
    pub attempt_number: u32,
    pub should_escalate: bool,
    pub updated_source: String,
    pub updated_test: String,
    pub root_cause: String,
    pub escalation_report: Option<String>,
    /// The attempt appended to history; `None` when the entry guard fired
    pub recorded: Option<HealingAttempt>,
    pub usage: Option<Usage>,
}

pub struct LoopController {
    analyzer: HealingAnalyzer,
    store: Arc<dyn AttemptStore>,
    publisher: Arc<dyn FixPublisher>,
    max_attempts: u32,
    confidence_threshold: u8,
}

impl LoopController {
    pub fn new(
        analyzer: HealingAnalyzer,
        store: Arc<dyn AttemptStore>,
        publisher: Arc<dyn FixPublisher>,
        max_attempts: u32,
        confidence_threshold: u8,
    ) -> Self {
        Self {
            analyzer,
            store,
            publisher,
            max_attempts,
            confidence_threshold,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn heal_step(&self, request: HealRequest<'_>) -> HealOutcome {
        let file_key = file_key_for(request.source_path);
        let history = self.load_history(&file_key, request.run_id).await;
        let next_attempt = request.attempt_number.saturating_add(1);

        // Entry guard: no model call once the budget is spent.
        if request.attempt_number > self.max_attempts {
            warn!(
                file = %file_key,
                attempt = request.attempt_number,
                max_attempts = self.max_attempts,
                "attempt budget exhausted, escalating"
            );
            return HealOutcome {
                status: HealStatus::Escalated,
                strategy: Strategy::Unknown,
                confidence_score: 0,
                commit_published: false,
                commit_ref: None,
                attempt_number: next_attempt,
                should_escalate: true,
                updated_source: request.source_text.to_string(),
                updated_test: request.test_text.to_string(),
                root_cause: format!(
                    "Attempt {} exceeds the maximum of {}",
                    request.attempt_number, self.max_attempts
                ),
                escalation_report: Some(escalation_report(&file_key, self.max_attempts, &history)),
                recorded: None,
                usage: None,
            };
        }

        let ctx = HealingContext {
            source_path: request.source_path,
            source_text: request.source_text,
            test_path: request.test_path,
            test_text: request.test_text,
            execution: request.execution,
            attempt_number: request.attempt_number,
            prior_attempts: &history,
        };

        let mut attempt = HealingAttempt {
            attempt_number: request.attempt_number,
            run_id: request.run_id.to_string(),
            file: file_key.clone(),
            root_cause: String::new(),
            strategy: Strategy::Unknown,
            confidence: 0,
            risk: Risk::High,
            replacement: None,
            status: HealStatus::Failed,
            commit_published: false,
            commit_ref: None,
            execution_status: request.execution.status,
            recorded_at: Utc::now(),
        };
        let mut updated_source = request.source_text.to_string();
        let mut updated_test = request.test_text.to_string();
        let mut usage = None;

        match self.analyzer.analyze(&ctx).await {
            Ok(diagnosis) => {
                let status = decide_status(
                    &diagnosis,
                    request.source_text,
                    request.test_text,
                    self.confidence_threshold,
                );
                attempt.root_cause = diagnosis.root_cause;
                attempt.strategy = diagnosis.strategy;
                attempt.confidence = diagnosis.confidence;
                attempt.risk = diagnosis.risk;
                attempt.status = status;
                usage = diagnosis.usage;

                if let (true, Some(replacement)) = (status.is_applied(), diagnosis.replacement.as_ref()) {
                    let target_path = match replacement.target() {
                        ReplacementTarget::Source => {
                            updated_source = replacement.content().to_string();
                            request.source_path
                        }
                        ReplacementTarget::Test => {
                            updated_test = replacement.content().to_string();
                            request.test_path
                        }
                    };
                    let message = commit_message(&file_key, &attempt);
                    match self.publisher.publish(target_path, replacement.content(), &message).await {
                        Ok(commit) => {
                            attempt.commit_published = true;
                            attempt.commit_ref = Some(commit);
                        }
                        Err(PublishError::Disabled) => {}
                        Err(err) => {
                            warn!(file = %file_key, attempt = attempt.attempt_number, error = %err, "publish failed, continuing with in-memory fix");
                        }
                    }
                }
                attempt.replacement = diagnosis.replacement;
            }
            Err(err) => {
                attempt.root_cause = failure_explanation(&err);
                warn!(file = %file_key, attempt = attempt.attempt_number, error = %attempt.root_cause, "healing step failed");
            }
        }

        let escalate = should_escalate(request.attempt_number, attempt.status, self.max_attempts);
        info!(
            file = %file_key,
            attempt = attempt.attempt_number,
            status = %attempt.status,
            strategy = %attempt.strategy,
            confidence = attempt.confidence,
            committed = attempt.commit_published,
            escalate,
            "healing step finished"
        );

        if let Err(err) = self.store.append(&file_key, &attempt).await {
            warn!(file = %file_key, attempt = attempt.attempt_number, error = %err, "failed to record healing attempt");
        }

        let escalation = escalate.then(|| {
            let mut full = history.clone();
            full.push(attempt.clone());
            escalation_report(&file_key, self.max_attempts, &full)
        });

        HealOutcome {
            status: attempt.status,
            strategy: attempt.strategy,
            confidence_score: attempt.confidence,
            commit_published: attempt.commit_published,
            commit_ref: attempt.commit_ref.clone(),
            attempt_number: next_attempt,
            should_escalate: escalate,
            updated_source,
            updated_test,
            root_cause: attempt.root_cause.clone(),
            escalation_report: escalation,
            recorded: Some(attempt),
            usage,
        }
    }

    async fn load_history(&self, file_key: &str, run_id: &str) -> Vec<HealingAttempt> {
        match self.store.load(file_key).await {
            Ok(all) => all.into_iter().filter(|a| a.run_id == run_id).collect(),
            Err(err) => {
                warn!(file = %file_key, error = %err, "attempt history unavailable, continuing without it");
                Vec::new()
            }
        }
    }
}

fn commit_message(file_key: &str, attempt: &HealingAttempt) -> String {
    let mut message = format!(
        "mend: {} in {} (attempt {}, confidence {})",
        attempt.strategy.label().to_lowercase().replace('_', " "),
        file_key,
        attempt.attempt_number,
        attempt.confidence
    );
    if attempt.status == HealStatus::Partial {
        message.push_str(" [needs review]");
    }
    if !attempt.root_cause.is_empty() {
        message.push_str("\n\n");
        message.push_str(&truncate(&attempt.root_cause, MAX_EXPLANATION_CHARS));
    }
    message
}

/// Explanation stored for a step that never produced a usable diagnosis.
/// Secrets are scrubbed before anything reaches history or logs.
fn failure_explanation(err: &HealError) -> String {
    let text = match err {
        HealError::Transport(inner) => format!("Healing call failed: {}", inner),
        HealError::Parse(inner) => format!("Healing response unusable: {}", inner),
    };
    truncate(&redact_secrets(&text), MAX_EXPLANATION_CHARS)
}

/// Markdown report for the human reviewer.
pub fn escalation_report(file_key: &str, max_attempts: u32, history: &[HealingAttempt]) -> String {
    let mut out = format!("# Escalation: `{}`\n\n", file_key);
    out.push_str(&format!(
        "Automatic healing stopped after {} attempt(s) (maximum {}). A human needs to take a look.\n\n",
        history.len(),
        max_attempts
    ));

    if history.is_empty() {
        out.push_str("No healing attempts were recorded for this run.\n");
        return out;
    }

    out.push_str("| # | Tests | Strategy | Status | Confidence | Risk | Commit |\n");
    out.push_str("|---|-------|----------|--------|------------|------|--------|\n");
    for attempt in history {
        let commit = match (&attempt.commit_ref, attempt.commit_published) {
            (Some(commit), true) => commit.get(..10).unwrap_or(commit).to_string(),
            _ => "-".to_string(),
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {:?} | {} |\n",
            attempt.attempt_number,
            attempt.execution_status,
            attempt.strategy,
            attempt.status,
            attempt.confidence,
            attempt.risk,
            commit
        ));
    }

    for attempt in history {
        out.push_str(&format!("\n## Attempt {}\n\n", attempt.attempt_number));
        if attempt.root_cause.is_empty() {
            out.push_str("_No diagnosis recorded._\n");
        } else {
            out.push_str(&attempt.root_cause);
            out.push('\n');
        }
        if let Some(replacement) = &attempt.replacement {
            out.push_str(&format!(
                "\nProposed replacement for the {} file ({} lines).\n",
                match replacement.target() {
                    ReplacementTarget::Source => "source",
                    ReplacementTarget::Test => "test",
                },
                replacement.content().lines().count()
            ));
        }
    }
    out
}
