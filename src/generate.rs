//! Test-suite generation: prompt, invoke, validate, normalize.

use crate::config::GenerationConfig;
use crate::llm::parse::{fix_json_issues, normalize_generated_content, strip_markdown_fences};
use crate::llm::prompts::GENERATE_TESTS_SYSTEM;
use crate::llm::{invoke_with_timeout, ModelClient, ModelError, ModelRequest, ModelRole, Usage};
use crate::signatures::FunctionSignature;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const METADATA_MARKER: &str = "MEND_METADATA";
const DEFAULT_QUALITY: u8 = 50;

static TEST_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|[\s;{(])(?:it|test)(?:\.(?:only|concurrent|each\s*\([^)]*\)))?\s*\(\s*['"`]"#,
    )
    .expect("test case pattern")
});
static ASSERTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexpect\s*\(|\bassert(?:\.\w+)?\s*\(").expect("assertion pattern")
});
static META_QUALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["']?quality_score["']?\s*:\s*["']?(\d{1,3})"#).expect("quality pattern")
});
static META_COVERAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?coverage["']?\s*:\s*["']?(FULL|PARTIAL|MINIMAL)"#).expect("coverage pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Coverage {
    Full,
    Partial,
    Minimal,
}

impl Coverage {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FULL" => Some(Coverage::Full),
            "PARTIAL" => Some(Coverage::Partial),
            "MINIMAL" => Some(Coverage::Minimal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFunction {
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedTestSuite {
    pub test_path: PathBuf,
    pub code: String,
    pub coverage: Coverage,
    pub test_case_count: usize,
    pub skipped: Vec<SkippedFunction>,
    pub quality_score: u8,
    /// False when coverage and quality were inferred rather than self-reported
    pub metadata_reported: bool,
    #[serde(skip)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("test generation call failed: {0}")]
    Model(#[from] ModelError),

    #[error("generated suite failed validation: {0}")]
    Validation(String),
}

/// Sibling test file: `src/cart.ts` -> `src/cart.test.ts`.
pub fn test_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    let file_name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.test.{}", stem, ext),
        None => format!("{}.test.ts", stem),
    };
    source.with_file_name(file_name)
}

pub struct TestGenerator {
    model: Arc<dyn ModelClient>,
    config: GenerationConfig,
    timeout: Duration,
}

impl TestGenerator {
    pub fn new(model: Arc<dyn ModelClient>, config: GenerationConfig, timeout: Duration) -> Self {
        Self {
            model,
            config,
            timeout,
        }
    }

    /// The source goes in whole; eligibility already bounds its size.
    pub fn build_prompt(
        &self,
        source_path: &Path,
        source_text: &str,
        signatures: &[FunctionSignature],
    ) -> String {
        let test_path = test_path_for(source_path);
        let import_stem = source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");

        let inventory = if signatures.is_empty() {
            "(none detected; inspect the source)".to_string()
        } else {
            signatures
                .iter()
                .map(|s| s.describe())
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "FILE: {}\nTEST FILE: {} (import the module as './{}')\n\n\
             EXPORTED FUNCTIONS (heuristic inventory, may be incomplete):\n{}\n\n\
             SOURCE:\n{}\n",
            source_path.display(),
            test_path.display(),
            import_stem,
            inventory,
            source_text
        )
    }

    pub async fn generate(
        &self,
        source_path: &Path,
        source_text: &str,
        signatures: &[FunctionSignature],
    ) -> Result<GeneratedTestSuite, GenerationError> {
        let request = ModelRequest {
            role: ModelRole::Generator,
            system: GENERATE_TESTS_SYSTEM.to_string(),
            user: self.build_prompt(source_path, source_text, signatures),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = invoke_with_timeout(self.model.as_ref(), request, self.timeout).await?;
        debug!(file = %source_path.display(), latency = ?response.latency, "generation response received");

        let mut suite = finalize_generated_suite(
            source_path,
            &response.content,
            signatures,
            self.config.min_test_chars,
        )?;
        suite.usage = response.usage;
        info!(
            file = %source_path.display(),
            cases = suite.test_case_count,
            coverage = ?suite.coverage,
            quality = suite.quality_score,
            "test suite generated"
        );
        Ok(suite)
    }
}

/// Validate and normalize raw model output into a suite. Pure.
pub fn finalize_generated_suite(
    source_path: &Path,
    raw: &str,
    signatures: &[FunctionSignature],
    min_test_chars: usize,
) -> Result<GeneratedTestSuite, GenerationError> {
    let unwrapped = strip_markdown_fences(raw);
    let (code, metadata) = split_metadata(unwrapped);
    let code = normalize_generated_content(&code);

    if code.lines().any(|l| l.trim_start().starts_with("```")) {
        return Err(GenerationError::Validation(
            "output contains markdown fences".to_string(),
        ));
    }
    let test_case_count = count_test_cases(&code);
    if test_case_count == 0 {
        return Err(GenerationError::Validation(
            "no it()/test() blocks found".to_string(),
        ));
    }
    if !ASSERTION.is_match(&code) {
        return Err(GenerationError::Validation(
            "no assertions found".to_string(),
        ));
    }
    let length = code.chars().count();
    if length < min_test_chars {
        return Err(GenerationError::Validation(format!(
            "suite is too short ({} chars, minimum {})",
            length, min_test_chars
        )));
    }

    let metadata_reported = metadata.is_some();
    let metadata = metadata.unwrap_or_default();
    let coverage = metadata
        .coverage
        .unwrap_or_else(|| infer_coverage(&code, signatures));

    Ok(GeneratedTestSuite {
        test_path: test_path_for(source_path),
        code,
        coverage,
        test_case_count,
        skipped: metadata.skipped,
        quality_score: metadata.quality_score.unwrap_or(DEFAULT_QUALITY),
        metadata_reported,
        usage: None,
    })
}

#[derive(Debug, Default)]
struct GenerationMetadata {
    quality_score: Option<u8>,
    coverage: Option<Coverage>,
    skipped: Vec<SkippedFunction>,
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    quality_score: Option<f64>,
    #[serde(default)]
    coverage: Option<String>,
    #[serde(default)]
    skipped_functions: Vec<RawSkipped>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSkipped {
    Detailed(SkippedFunction),
    Name(String),
}

/// Remove the trailing metadata comment and parse it.
/// Chain: strict JSON, sanitized JSON, key-by-key regex.
fn split_metadata(code: &str) -> (String, Option<GenerationMetadata>) {
    let Some(marker) = code.rfind(METADATA_MARKER) else {
        return (code.to_string(), None);
    };
    let Some(open) = code[..marker].rfind("/*") else {
        return (code.to_string(), None);
    };
    let close = code[marker..]
        .find("*/")
        .map(|i| marker + i + 2)
        .unwrap_or(code.len());

    let body = code[marker + METADATA_MARKER.len()..close]
        .trim_end_matches("*/")
        .trim();
    let stripped = format!("{}{}", &code[..open], &code[close..]);

    let raw: Option<RawMetadata> = serde_json::from_str(body)
        .ok()
        .or_else(|| serde_json::from_str(&fix_json_issues(body)).ok());

    let metadata = match raw {
        Some(raw) => GenerationMetadata {
            quality_score: raw.quality_score.map(|q| q.clamp(0.0, 100.0).round() as u8),
            coverage: raw.coverage.as_deref().and_then(Coverage::parse),
            skipped: raw
                .skipped_functions
                .into_iter()
                .map(|s| match s {
                    RawSkipped::Detailed(f) => f,
                    RawSkipped::Name(name) => SkippedFunction {
                        name,
                        reason: String::new(),
                    },
                })
                .collect(),
        },
        None => GenerationMetadata {
            quality_score: META_QUALITY
                .captures(body)
                .and_then(|c| c[1].parse::<u32>().ok())
                .map(|q| q.min(100) as u8),
            coverage: META_COVERAGE
                .captures(body)
                .and_then(|c| Coverage::parse(&c[1])),
            skipped: Vec::new(),
        },
    };

    (stripped, Some(metadata))
}

/// Share of discovered function names that appear in the test code.
pub fn infer_coverage(code: &str, signatures: &[FunctionSignature]) -> Coverage {
    if signatures.is_empty() {
        return Coverage::Minimal;
    }
    let mentioned = signatures
        .iter()
        .filter(|s| {
            let short = s.name.rsplit('.').next().unwrap_or(&s.name);
            code.contains(short)
        })
        .count();
    let ratio = mentioned as f64 / signatures.len() as f64;
    if ratio >= 0.8 {
        Coverage::Full
    } else if ratio >= 0.4 {
        Coverage::Partial
    } else {
        Coverage::Minimal
    }
}

pub fn count_test_cases(code: &str) -> usize {
    TEST_CASE.find_iter(code).count()
}
