//! Healing analyzer: diagnose a failed run and propose a full replacement
//! for either the source or the test.
//!
//! The model only proposes. `decide_status` applies the acceptance policy.

use crate::config::HealingConfig;
use crate::history::HealingAttempt;
use crate::llm::parse::{
    extract_json_object, extract_tag, fix_json_issues, normalize_generated_content,
    truncate_content, ParseError, TRUNCATION_MARKER,
};
use crate::llm::prompts::HEAL_SYSTEM;
use crate::llm::{invoke_with_timeout, ModelClient, ModelError, ModelRequest, ModelRole, Usage};
use crate::results::ExecutionResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const MAX_FILE_CHARS: usize = 30_000;
const MAX_PRIOR_CAUSE_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    LogicFix,
    MockAdjustment,
    TypeFix,
    ImportFix,
    AsyncFix,
    TestFix,
    Unknown,
}

impl Strategy {
    /// Lenient: accepts `logic_fix`, `Logic Fix`, `LOGIC-FIX`.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        match normalized.as_str() {
            "LOGIC_FIX" => Strategy::LogicFix,
            "MOCK_ADJUSTMENT" => Strategy::MockAdjustment,
            "TYPE_FIX" => Strategy::TypeFix,
            "IMPORT_FIX" => Strategy::ImportFix,
            "ASYNC_FIX" => Strategy::AsyncFix,
            "TEST_FIX" => Strategy::TestFix,
            _ => Strategy::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::LogicFix => "LOGIC_FIX",
            Strategy::MockAdjustment => "MOCK_ADJUSTMENT",
            Strategy::TypeFix => "TYPE_FIX",
            Strategy::ImportFix => "IMPORT_FIX",
            Strategy::AsyncFix => "ASYNC_FIX",
            Strategy::TestFix => "TEST_FIX",
            Strategy::Unknown => "UNKNOWN",
        }
    }

    /// Which file a strategy rewrites when the model does not say.
    pub fn default_target(&self) -> ReplacementTarget {
        match self {
            Strategy::TestFix | Strategy::MockAdjustment => ReplacementTarget::Test,
            _ => ReplacementTarget::Source,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    /// Unrecognized or missing risk is treated as HIGH.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Risk::Low,
            "MEDIUM" | "MED" | "MODERATE" => Risk::Medium,
            _ => Risk::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementTarget {
    Source,
    Test,
}

impl ReplacementTarget {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "source" | "src" | "fixed_source" => Some(ReplacementTarget::Source),
            "test" | "tests" | "fixed_test" => Some(ReplacementTarget::Test),
            _ => None,
        }
    }
}

/// Complete replacement of exactly one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "content", rename_all = "snake_case")]
pub enum Replacement {
    Source(String),
    Test(String),
}

impl Replacement {
    pub fn new(target: ReplacementTarget, content: String) -> Self {
        match target {
            ReplacementTarget::Source => Replacement::Source(content),
            ReplacementTarget::Test => Replacement::Test(content),
        }
    }

    pub fn target(&self) -> ReplacementTarget {
        match self {
            Replacement::Source(_) => ReplacementTarget::Source,
            Replacement::Test(_) => ReplacementTarget::Test,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Replacement::Source(c) | Replacement::Test(c) => c,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealingDiagnosis {
    pub root_cause: String,
    pub strategy: Strategy,
    pub confidence: u8,
    pub risk: Risk,
    /// `None` when the chosen payload was empty.
    pub replacement: Option<Replacement>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealStatus {
    Fixed,
    Partial,
    Failed,
    Escalated,
}

impl HealStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealStatus::Fixed => "FIXED",
            HealStatus::Partial => "PARTIAL",
            HealStatus::Failed => "FAILED",
            HealStatus::Escalated => "ESCALATED",
        }
    }

    /// FIXED and PARTIAL replacements are published and re-run.
    pub fn is_applied(&self) -> bool {
        matches!(self, HealStatus::Fixed | HealStatus::Partial)
    }
}

impl std::fmt::Display for HealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Acceptance policy for a diagnosis.
///
/// Empty or unchanged payloads and UNKNOWN strategies are FAILED whatever
/// the reported confidence. Line endings and trailing blank lines do not
/// count as a change. A replacement for a file the healer only saw
/// truncated is FAILED too, since it cannot be a faithful whole file.
/// Otherwise confidence at or above `threshold` with non-HIGH risk is
/// FIXED, anything else PARTIAL.
pub fn decide_status(
    diagnosis: &HealingDiagnosis,
    source_text: &str,
    test_text: &str,
    threshold: u8,
) -> HealStatus {
    if diagnosis.strategy == Strategy::Unknown {
        return HealStatus::Failed;
    }
    let Some(replacement) = &diagnosis.replacement else {
        return HealStatus::Failed;
    };
    let original = match replacement.target() {
        ReplacementTarget::Source => source_text,
        ReplacementTarget::Test => test_text,
    };
    if original.chars().count() > MAX_FILE_CHARS {
        return HealStatus::Failed;
    }
    let proposed = normalize_generated_content(replacement.content());
    let proposed = proposed.trim();
    if proposed.is_empty()
        || proposed == normalize_generated_content(original).trim()
        || proposed.contains(TRUNCATION_MARKER)
    {
        return HealStatus::Failed;
    }
    if diagnosis.confidence >= threshold && diagnosis.risk != Risk::High {
        HealStatus::Fixed
    } else {
        HealStatus::Partial
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  RESPONSE PARSING
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct RawDiagnosis {
    #[serde(default, alias = "rootCause")]
    root_cause: String,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    confidence: serde_json::Value,
    #[serde(default)]
    risk: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default, alias = "fixedSource")]
    fixed_source: Option<String>,
    #[serde(default, alias = "fixedTest")]
    fixed_test: Option<String>,
}

/// Parse the healer's answer. Chain: strict JSON, sanitized JSON, XML tags.
pub fn parse_healing_response(raw: &str) -> Result<HealingDiagnosis, ParseError> {
    if let Some(raw_diag) = parse_json_strict(raw).or_else(|| parse_json_sanitized(raw)) {
        let confidence = confidence_from_value(&raw_diag.confidence);
        return Ok(assemble(
            raw_diag.root_cause,
            &raw_diag.strategy,
            confidence,
            &raw_diag.risk,
            raw_diag.target.as_deref(),
            raw_diag.fixed_source,
            raw_diag.fixed_test,
        ));
    }
    parse_tags(raw).ok_or(ParseError::Exhausted("healing response"))
}

fn parse_json_strict(raw: &str) -> Option<RawDiagnosis> {
    let json = extract_json_object(raw)?;
    serde_json::from_str(json).ok()
}

fn parse_json_sanitized(raw: &str) -> Option<RawDiagnosis> {
    let json = extract_json_object(raw)?;
    serde_json::from_str(&fix_json_issues(json)).ok()
}

fn parse_tags(raw: &str) -> Option<HealingDiagnosis> {
    let strategy = extract_tag(raw, "strategy")?;
    let confidence = extract_tag(raw, "confidence")
        .map(|c| confidence_from_text(&c))
        .unwrap_or(0);
    Some(assemble(
        extract_tag(raw, "root_cause").unwrap_or_default(),
        &strategy,
        confidence,
        &extract_tag(raw, "risk").unwrap_or_default(),
        extract_tag(raw, "target").as_deref(),
        extract_tag(raw, "fixed_source"),
        extract_tag(raw, "fixed_test"),
    ))
}

fn assemble(
    root_cause: String,
    strategy: &str,
    confidence: u8,
    risk: &str,
    target: Option<&str>,
    fixed_source: Option<String>,
    fixed_test: Option<String>,
) -> HealingDiagnosis {
    let strategy = Strategy::parse(strategy);
    let source = fixed_source.filter(|s| !s.trim().is_empty());
    let test = fixed_test.filter(|s| !s.trim().is_empty());

    let target = target
        .and_then(ReplacementTarget::parse)
        .or(match (&source, &test) {
            (Some(_), None) => Some(ReplacementTarget::Source),
            (None, Some(_)) => Some(ReplacementTarget::Test),
            _ => None,
        })
        .unwrap_or_else(|| strategy.default_target());

    let payload = match target {
        ReplacementTarget::Source => source,
        ReplacementTarget::Test => test,
    };
    let replacement = payload.map(|content| {
        let unwrapped = crate::llm::parse::strip_markdown_fences(&content).to_string();
        Replacement::new(target, normalize_generated_content(&unwrapped))
    });

    HealingDiagnosis {
        root_cause: root_cause.trim().to_string(),
        strategy,
        confidence,
        risk: Risk::parse(risk),
        replacement,
        usage: None,
    }
}

fn confidence_from_value(value: &serde_json::Value) -> u8 {
    match value {
        serde_json::Value::Number(n) => clamp_confidence(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => confidence_from_text(s),
        _ => 0,
    }
}

fn confidence_from_text(text: &str) -> u8 {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    clamp_confidence(digits.parse::<f64>().unwrap_or(0.0))
}

/// Clamp to [0, 100]. Fractions in (0, 1) are read as probabilities.
fn clamp_confidence(raw: f64) -> u8 {
    let scaled = if raw > 0.0 && raw < 1.0 { raw * 100.0 } else { raw };
    scaled.clamp(0.0, 100.0).round() as u8
}

// ═══════════════════════════════════════════════════════════════════════════
//  ANALYZER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum HealError {
    #[error("healing call failed: {0}")]
    Transport(#[from] ModelError),

    #[error("healing response unreadable: {0}")]
    Parse(#[from] ParseError),
}

/// Everything the healer sees for one attempt.
pub struct HealingContext<'a> {
    pub source_path: &'a Path,
    pub source_text: &'a str,
    pub test_path: &'a Path,
    pub test_text: &'a str,
    pub execution: &'a ExecutionResult,
    pub attempt_number: u32,
    pub prior_attempts: &'a [HealingAttempt],
}

pub struct HealingAnalyzer {
    model: Arc<dyn ModelClient>,
    config: HealingConfig,
    timeout: Duration,
}

impl HealingAnalyzer {
    pub fn new(model: Arc<dyn ModelClient>, config: HealingConfig, timeout: Duration) -> Self {
        Self {
            model,
            config,
            timeout,
        }
    }

    pub fn build_prompt(&self, ctx: &HealingContext<'_>) -> String {
        let execution = ctx.execution;
        let totals = execution.totals;
        let mut prompt = format!(
            "ATTEMPT: {}\nEXECUTION STATUS: {} ({} failed, {} passed, {} total)\n",
            ctx.attempt_number, execution.status, totals.failed, totals.passed, totals.total
        );

        if execution.timed_out() {
            prompt.push_str(
                "\nNOTE: this run TIMED OUT and was killed. It is NOT an assertion failure. \
                 Look for infinite loops, promises that never settle, real timers, open handles, \
                 or unmocked network/filesystem calls.\n",
            );
        }

        prompt.push_str("\nFAILURE EVIDENCE:\n");
        prompt.push_str(&execution.evidence(self.config.max_evidence_chars));
        prompt.push('\n');

        if !ctx.prior_attempts.is_empty() {
            prompt.push_str("\nPREVIOUS ATTEMPTS (these did not work; do NOT repeat them):\n");
            for attempt in ctx.prior_attempts {
                prompt.push_str(&format!(
                    "- attempt {}: {} -> {} (confidence {}): {}\n",
                    attempt.attempt_number,
                    attempt.strategy,
                    attempt.status,
                    attempt.confidence,
                    crate::util::truncate(&attempt.root_cause, MAX_PRIOR_CAUSE_CHARS)
                ));
            }
        }

        prompt.push_str(&format!(
            "\nSOURCE FILE: {}\n{}\n\nTEST FILE: {}\n{}\n",
            ctx.source_path.display(),
            truncate_content(ctx.source_text, MAX_FILE_CHARS),
            ctx.test_path.display(),
            truncate_content(ctx.test_text, MAX_FILE_CHARS),
        ));
        prompt
    }

    pub async fn analyze(&self, ctx: &HealingContext<'_>) -> Result<HealingDiagnosis, HealError> {
        let request = ModelRequest {
            role: ModelRole::Healer,
            system: HEAL_SYSTEM.to_string(),
            user: self.build_prompt(ctx),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = invoke_with_timeout(self.model.as_ref(), request, self.timeout).await?;
        debug!(
            file = %ctx.source_path.display(),
            attempt = ctx.attempt_number,
            latency = ?response.latency,
            "healing response received"
        );

        let mut diagnosis = parse_healing_response(&response.content)?;
        diagnosis.usage = response.usage;
        info!(
            file = %ctx.source_path.display(),
            attempt = ctx.attempt_number,
            strategy = %diagnosis.strategy,
            confidence = diagnosis.confidence,
            risk = ?diagnosis.risk,
            "healing diagnosis parsed"
        );
        Ok(diagnosis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnosis(strategy: Strategy, confidence: u8, risk: Risk, replacement: Option<Replacement>) -> HealingDiagnosis {
        HealingDiagnosis {
            root_cause: "off by one".to_string(),
            strategy,
            confidence,
            risk,
            replacement,
            usage: None,
        }
    }

    const SOURCE: &str = "export const add = (a, b) => a - b;\n";
    const TEST: &str = "it('adds', () => expect(add(1, 2)).toBe(3));\n";
    const FIXED: &str = "export const add = (a, b) => a + b;\n";

    #[test]
    fn test_confidence_boundary() {
        let fix = Some(Replacement::Source(FIXED.to_string()));
        assert_eq!(
            decide_status(&diagnosis(Strategy::LogicFix, 70, Risk::Low, fix.clone()), SOURCE, TEST, 70),
            HealStatus::Fixed
        );
        assert_eq!(
            decide_status(&diagnosis(Strategy::LogicFix, 69, Risk::Low, fix.clone()), SOURCE, TEST, 70),
            HealStatus::Partial
        );
        assert_eq!(
            decide_status(&diagnosis(Strategy::LogicFix, 100, Risk::High, fix.clone()), SOURCE, TEST, 70),
            HealStatus::Partial
        );
        assert_eq!(
            decide_status(&diagnosis(Strategy::LogicFix, 85, Risk::Medium, fix), SOURCE, TEST, 70),
            HealStatus::Fixed
        );
    }

    #[test]
    fn test_empty_unchanged_or_unknown_is_failed() {
        let cases = [
            diagnosis(Strategy::LogicFix, 99, Risk::Low, None),
            diagnosis(Strategy::LogicFix, 99, Risk::Low, Some(Replacement::Source("  \n".into()))),
            diagnosis(Strategy::LogicFix, 99, Risk::Low, Some(Replacement::Source(format!("{}\n\n", SOURCE)))),
            diagnosis(Strategy::TestFix, 99, Risk::Low, Some(Replacement::Test(TEST.into()))),
            diagnosis(Strategy::Unknown, 99, Risk::Low, Some(Replacement::Source(FIXED.into()))),
        ];
        for case in &cases {
            assert_eq!(decide_status(case, SOURCE, TEST, 70), HealStatus::Failed);
        }

        // A CRLF file echoed back verbatim is unchanged after normalization.
        let crlf_source = SOURCE.replace('\n', "\r\n");
        let raw = serde_json::json!({
            "root_cause": "nothing",
            "strategy": "LOGIC_FIX",
            "confidence": 90,
            "risk": "LOW",
            "fixed_source": crlf_source,
        })
        .to_string();
        let echoed = parse_healing_response(&raw).unwrap();
        assert_eq!(decide_status(&echoed, &crlf_source, TEST, 70), HealStatus::Failed);

        let changed = diagnosis(Strategy::LogicFix, 90, Risk::Low, Some(Replacement::Source(FIXED.into())));
        assert_eq!(decide_status(&changed, &crlf_source, TEST, 70), HealStatus::Fixed);
    }

    #[test]
    fn test_replacement_for_truncated_file_is_failed() {
        let big_source = format!("{}{}", SOURCE, "// filler line\n".repeat(MAX_FILE_CHARS / 10));
        let seen = truncate_content(&big_source, MAX_FILE_CHARS);
        assert!(seen.contains(TRUNCATION_MARKER));

        // Echo of the truncated view, with the bug fixed.
        let echoed = seen.replace("a - b", "a + b");
        let diag = diagnosis(Strategy::LogicFix, 95, Risk::Low, Some(Replacement::Source(echoed)));
        assert_eq!(decide_status(&diag, &big_source, TEST, 70), HealStatus::Failed);

        // Even without the marker, a file too large to show whole is not replaced.
        let rewritten = big_source.replace("a - b", "a + b");
        let diag = diagnosis(Strategy::LogicFix, 95, Risk::Low, Some(Replacement::Source(rewritten)));
        assert_eq!(decide_status(&diag, &big_source, TEST, 70), HealStatus::Failed);
    }

    #[test]
    fn test_parse_strict_json() {
        let raw = serde_json::json!({
            "root_cause": "subtraction instead of addition",
            "strategy": "LOGIC_FIX",
            "confidence": 85,
            "risk": "LOW",
            "target": "source",
            "fixed_source": FIXED,
            "fixed_test": ""
        })
        .to_string();
        let diag = parse_healing_response(&raw).unwrap();
        assert_eq!(diag.strategy, Strategy::LogicFix);
        assert_eq!(diag.confidence, 85);
        assert_eq!(diag.risk, Risk::Low);
        assert_eq!(diag.replacement, Some(Replacement::Source(FIXED.to_string())));
    }

    #[test]
    fn test_parse_sanitized_json_with_raw_newlines() {
        let raw = "```json\n{\n  \"root_cause\": \"mock missing\",\n  \"strategy\": \"mock adjustment\",\n  \"confidence\": \"0.9\",\n  \"risk\": \"medium\",\n  \"fixed_test\": \"jest.mock('./db');\nit('x', () => expect(1).toBe(1));\",\n}\n```";
        let diag = parse_healing_response(raw).unwrap();
        assert_eq!(diag.strategy, Strategy::MockAdjustment);
        assert_eq!(diag.confidence, 90);
        assert_eq!(diag.risk, Risk::Medium);
        let replacement = diag.replacement.unwrap();
        assert_eq!(replacement.target(), ReplacementTarget::Test);
        assert!(replacement.content().contains("jest.mock('./db');\nit("));
    }

    #[test]
    fn test_parse_tag_fallback() {
        let raw = "I think the await is missing.\n<root_cause>missing await</root_cause>\n<strategy>ASYNC_FIX</strategy>\n<confidence>75%</confidence>\n<risk>LOW</risk>\n<fixed_source>\n```ts\nexport async function load() { return await get(); }\n```\n</fixed_source>";
        let diag = parse_healing_response(raw).unwrap();
        assert_eq!(diag.strategy, Strategy::AsyncFix);
        assert_eq!(diag.confidence, 75);
        assert_eq!(
            diag.replacement,
            Some(Replacement::Source(
                "export async function load() { return await get(); }\n".to_string()
            ))
        );
    }

    #[test]
    fn test_parse_exhausted() {
        let err = parse_healing_response("I could not figure it out.").unwrap_err();
        assert_eq!(err, ParseError::Exhausted("healing response"));
    }

    #[test]
    fn test_target_resolution_order() {
        // Explicit target wins even when it points at an empty payload.
        let diag = assemble(String::new(), "LOGIC_FIX", 80, "LOW", Some("test"), Some(FIXED.into()), None);
        assert!(diag.replacement.is_none());

        // Only non-empty payload.
        let diag = assemble(String::new(), "LOGIC_FIX", 80, "LOW", None, None, Some(TEST.into()));
        assert_eq!(diag.replacement.unwrap().target(), ReplacementTarget::Test);

        // Strategy default when both are present.
        let diag = assemble(String::new(), "TEST_FIX", 80, "LOW", None, Some(FIXED.into()), Some(TEST.into()));
        assert_eq!(diag.replacement.unwrap().target(), ReplacementTarget::Test);
        let diag = assemble(String::new(), "TYPE_FIX", 80, "LOW", None, Some(FIXED.into()), Some(TEST.into()));
        assert_eq!(diag.replacement.unwrap().target(), ReplacementTarget::Source);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(confidence_from_value(&serde_json::json!(250)), 100);
        assert_eq!(confidence_from_value(&serde_json::json!(-5)), 0);
        assert_eq!(confidence_from_value(&serde_json::json!(0.42)), 42);
        assert_eq!(confidence_from_value(&serde_json::json!("88 (fairly sure)")), 88);
        assert_eq!(confidence_from_value(&serde_json::Value::Null), 0);
    }

    #[test]
    fn test_strategy_and_risk_parsing() {
        assert_eq!(Strategy::parse("import-fix"), Strategy::ImportFix);
        assert_eq!(Strategy::parse("Test Fix"), Strategy::TestFix);
        assert_eq!(Strategy::parse("rewrite everything"), Strategy::Unknown);
        assert_eq!(Risk::parse("low"), Risk::Low);
        assert_eq!(Risk::parse(""), Risk::High);
    }

    #[test]
    fn test_replacement_serializes_with_target() {
        let json = serde_json::to_value(Replacement::Test("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"target": "test", "content": "x"}));
    }
}
