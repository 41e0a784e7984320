//! Typed execution results and the runner-output parser.
//!
//! Structured (Jest `--json`) output is preferred. When it is missing or
//! malformed the raw text is scanned heuristically. Both paths produce the
//! same `ParsedRun` shape.

use crate::llm::parse::{parse_json_lenient, ParseError};
use crate::util::{strip_ansi, truncate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const MAX_STACK_LINES: usize = 8;
const MAX_MESSAGE_CHARS: usize = 1_200;
const HEURISTIC_SUITE: &str = "(runner output)";

static JEST_TOTALS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests:\s+(.+)$").expect("jest totals pattern"));
static COUNT_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+(failed|skipped|todo|passed|total)").expect("count pair pattern")
});
static MOCHA_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\d+)\s+(passing|failing|pending)\b").expect("mocha count pattern")
});
static PASS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[✓✔√]\s+(.+?)(?:\s+\((\d+)\s*ms\))?\s*$").expect("pass marker pattern")
});
static FAIL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[✕✖×]\s+(.+?)(?:\s+\((\d+)\s*ms\))?\s*$").expect("fail marker pattern")
});
static SKIP_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*○\s+(?:skipped\s+|todo\s+)?(.+?)\s*$").expect("skip marker pattern")
});
static FAILURE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*●\s+(.+?)\s*$").expect("failure heading pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pass,
    Fail,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Pass => "PASS",
            ExecutionStatus::Fail => "FAIL",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub outcome: CaseOutcome,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub name: String,
    pub cases: Vec<CaseResult>,
    /// Suite-level failure (e.g. the file failed to compile)
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTotals {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

impl TestTotals {
    fn from_suites(suites: &[SuiteResult]) -> Self {
        let mut totals = TestTotals::default();
        for case in suites.iter().flat_map(|s| &s.cases) {
            match case.outcome {
                CaseOutcome::Passed => totals.passed += 1,
                CaseOutcome::Failed => totals.failed += 1,
                CaseOutcome::Skipped => totals.skipped += 1,
            }
            totals.total += 1;
        }
        totals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Structured,
    Heuristic,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRun {
    pub suites: Vec<SuiteResult>,
    pub totals: TestTotals,
    pub source: ParseSource,
}

impl ParsedRun {
    pub fn unavailable() -> Self {
        Self {
            suites: Vec::new(),
            totals: TestTotals::default(),
            source: ParseSource::Unavailable,
        }
    }

    fn has_suite_errors(&self) -> bool {
        self.suites.iter().any(|s| s.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub suites: Vec<SuiteResult>,
    pub totals: TestTotals,
    pub stdout: String,
    pub stderr: String,
    pub failure_summary: String,
    pub duration_ms: u64,
    /// Diagnostics only. The workspace no longer exists.
    pub sandbox_id: String,
    pub exit_code: Option<i32>,
    pub parse_source: ParseSource,
    /// Why the run ended where it did (setup failure, timeout, ...)
    pub note: Option<String>,
}

impl ExecutionResult {
    pub fn passed(&self) -> bool {
        self.status == ExecutionStatus::Pass
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::Timeout
    }

    /// Primary evidence handed to the healer.
    pub fn evidence(&self, max_chars: usize) -> String {
        let mut out = String::new();
        if let Some(note) = self.note.as_ref().filter(|n| !self.failure_summary.contains(n.as_str())) {
            out.push_str(note);
            out.push_str("\n\n");
        }
        if !self.failure_summary.is_empty() {
            out.push_str(&self.failure_summary);
        } else {
            let combined = format!("{}\n{}", self.stdout, self.stderr);
            out.push_str(&crate::util::tail_chars(strip_ansi(&combined).trim(), max_chars));
        }
        truncate(&out, max_chars)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  STRUCTURED (JEST JSON)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestReport {
    test_results: Option<Vec<JestSuite>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestSuite {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    assertion_results: Vec<JestAssertion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestAssertion {
    #[serde(default)]
    ancestor_titles: Vec<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    failure_messages: Vec<String>,
}

/// Parse the runner's machine-readable results file.
pub fn parse_structured(raw: &str) -> Result<ParsedRun, ParseError> {
    let report: JestReport = match serde_json::from_str(raw) {
        Ok(report) => report,
        Err(_) => parse_json_lenient(raw, "runner results")?,
    };
    let test_results = report.test_results.ok_or(ParseError::MissingField {
        context: "runner results",
        field: "testResults",
    })?;

    let suites: Vec<SuiteResult> = test_results.into_iter().map(convert_suite).collect();
    let totals = TestTotals::from_suites(&suites);
    Ok(ParsedRun {
        suites,
        totals,
        source: ParseSource::Structured,
    })
}

fn convert_suite(suite: JestSuite) -> SuiteResult {
    let cases: Vec<CaseResult> = suite
        .assertion_results
        .into_iter()
        .map(|a| {
            let outcome = match a.status.as_str() {
                "passed" => CaseOutcome::Passed,
                "failed" => CaseOutcome::Failed,
                _ => CaseOutcome::Skipped,
            };
            let name = a.full_name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| {
                let mut parts = a.ancestor_titles;
                parts.push(a.title);
                parts.join(" › ")
            });
            let (error_message, stack) = if a.failure_messages.is_empty() {
                (None, None)
            } else {
                let (message, stack) = split_failure_message(&a.failure_messages.join("\n"));
                (Some(message), stack)
            };
            CaseResult {
                name,
                outcome,
                duration_ms: a.duration.map(|d| d.max(0.0).round() as u64),
                error_message,
                stack,
            }
        })
        .collect();

    let suite_failed = suite.status.as_deref() == Some("failed");
    let message = suite
        .message
        .map(|m| strip_ansi(&m).trim().to_string())
        .filter(|m| !m.is_empty());
    // A failed suite with no failed cases means it never ran properly.
    let error = if suite_failed && !cases.iter().any(|c| c.outcome == CaseOutcome::Failed) {
        Some(message.unwrap_or_else(|| "test suite failed to run".to_string()))
    } else {
        None
    };

    SuiteResult {
        name: suite.name,
        cases,
        error,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  HEURISTIC (RAW TEXT)
// ═══════════════════════════════════════════════════════════════════════════

/// Regex-scan raw runner output into a single synthetic suite.
pub fn parse_heuristic(output: &str) -> ParsedRun {
    let clean = strip_ansi(output);
    let mut cases: Vec<CaseResult> = Vec::new();
    let mut suite_error: Option<String> = None;

    for line in clean.lines() {
        if let Some(caps) = FAIL_MARKER.captures(line) {
            cases.push(marker_case(&caps, CaseOutcome::Failed));
        } else if let Some(caps) = PASS_MARKER.captures(line) {
            cases.push(marker_case(&caps, CaseOutcome::Passed));
        } else if let Some(caps) = SKIP_MARKER.captures(line) {
            cases.push(marker_case(&caps, CaseOutcome::Skipped));
        }
    }

    for (title, body) in failure_blocks(&clean) {
        if title.contains("Test suite failed to run") {
            suite_error = Some(body.trim().to_string()).filter(|b| !b.is_empty()).or(Some(title));
            continue;
        }
        let (message, stack) = split_failure_message(&body);
        let leaf = title.rsplit('›').next().unwrap_or(&title).trim().to_string();
        match cases
            .iter_mut()
            .find(|c| c.outcome == CaseOutcome::Failed && c.error_message.is_none() && c.name == leaf)
        {
            Some(case) => {
                case.name = title;
                case.error_message = Some(message);
                case.stack = stack;
            }
            None => cases.push(CaseResult {
                name: title,
                outcome: CaseOutcome::Failed,
                duration_ms: None,
                error_message: Some(message),
                stack,
            }),
        }
    }

    let summary_totals = summary_line_totals(&clean);
    if cases.is_empty() && summary_totals.is_none() && suite_error.is_none() {
        return ParsedRun::unavailable();
    }

    let suites = vec![SuiteResult {
        name: HEURISTIC_SUITE.to_string(),
        cases,
        error: suite_error,
    }];
    // The runner's own summary line wins over counted markers.
    let totals = summary_totals.unwrap_or_else(|| TestTotals::from_suites(&suites));
    ParsedRun {
        suites,
        totals,
        source: ParseSource::Heuristic,
    }
}

fn marker_case(caps: &regex::Captures<'_>, outcome: CaseOutcome) -> CaseResult {
    CaseResult {
        name: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        outcome,
        duration_ms: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        error_message: None,
        stack: None,
    }
}

/// `● title` headings and the text under each, up to the next heading.
fn failure_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in text.lines() {
        if let Some(caps) = FAILURE_HEADING.captures(line) {
            if let Some((title, body)) = current.take() {
                blocks.push((title, body.join("\n")));
            }
            let title = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            current = Some((title, Vec::new()));
        } else if JEST_TOTALS_LINE.is_match(line) || line.trim_start().starts_with("Test Suites:") {
            if let Some((title, body)) = current.take() {
                blocks.push((title, body.join("\n")));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((title, body)) = current {
        blocks.push((title, body.join("\n")));
    }
    blocks
}

fn summary_line_totals(text: &str) -> Option<TestTotals> {
    if let Some(caps) = JEST_TOTALS_LINE.captures_iter(text).last() {
        let line = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut totals = TestTotals::default();
        let mut saw_total = false;
        for pair in COUNT_PAIR.captures_iter(line) {
            let n: u32 = pair[1].parse().unwrap_or(0);
            match &pair[2] {
                "failed" => totals.failed = n,
                "skipped" | "todo" => totals.skipped += n,
                "passed" => totals.passed = n,
                "total" => {
                    totals.total = n;
                    saw_total = true;
                }
                _ => {}
            }
        }
        if saw_total {
            return Some(totals);
        }
    }

    let mut totals = TestTotals::default();
    let mut found = false;
    for caps in MOCHA_COUNT.captures_iter(text) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passing" => totals.passed = n,
            "failing" => totals.failed = n,
            "pending" => totals.skipped = n,
            _ => {}
        }
        found = true;
    }
    if found {
        totals.total = totals.passed + totals.failed + totals.skipped;
        return Some(totals);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  CONVERGENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Structured results when readable, heuristic text scan otherwise.
pub fn parse_runner_output(results_file: Option<&str>, stdout: &str, stderr: &str) -> ParsedRun {
    if let Some(raw) = results_file.filter(|r| !r.trim().is_empty()) {
        match parse_structured(raw) {
            Ok(parsed) => return parsed,
            Err(err) => tracing::debug!(error = %err, "structured results unreadable, scanning output"),
        }
    }
    parse_heuristic(&format!("{}\n{}", stdout, stderr))
}

/// Map the run to a status.
pub fn classify(timed_out: bool, exit_success: bool, parsed: &ParsedRun) -> ExecutionStatus {
    if timed_out {
        return ExecutionStatus::Timeout;
    }
    let totals = &parsed.totals;
    if totals.failed > 0 {
        return ExecutionStatus::Fail;
    }
    if exit_success && totals.total > 0 && totals.passed > 0 && !parsed.has_suite_errors() {
        return ExecutionStatus::Pass;
    }
    ExecutionStatus::Error
}

/// Name, short message, and trimmed stack for each failing case, plus
/// suite-level errors.
pub fn failure_summary(suites: &[SuiteResult]) -> String {
    let mut sections = Vec::new();
    for suite in suites {
        if let Some(error) = &suite.error {
            sections.push(format!(
                "Suite failed to run: {}\n{}",
                suite.name,
                indent(&truncate(error, MAX_MESSAGE_CHARS))
            ));
        }
        for case in suite.cases.iter().filter(|c| c.outcome == CaseOutcome::Failed) {
            let mut section = format!("✕ {}", case.name);
            if let Some(message) = &case.error_message {
                section.push('\n');
                section.push_str(&indent(message));
            }
            if let Some(stack) = &case.stack {
                section.push('\n');
                section.push_str(&indent(stack));
            }
            sections.push(section);
        }
    }
    sections.join("\n\n")
}

/// Split a runner failure message at the first `at ...` frame.
pub fn split_failure_message(raw: &str) -> (String, Option<String>) {
    let clean = strip_ansi(raw);
    let lines: Vec<&str> = clean.lines().collect();
    let split_at = lines
        .iter()
        .position(|l| l.trim_start().starts_with("at "))
        .unwrap_or(lines.len());

    let message = lines[..split_at]
        .iter()
        .map(|l| l.trim_end())
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let stack: Vec<&str> = lines[split_at..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .take(MAX_STACK_LINES)
        .collect();

    (
        truncate(&message, MAX_MESSAGE_CHARS),
        (!stack.is_empty()).then(|| stack.join("\n")),
    )
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("  {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}
