//! Cheap pre-check deciding whether a file enters the pipeline at all.
//!
//! Rejection is a value with a reason, never an error.

use crate::config::EligibilityConfig;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static EXPORTED_SYMBOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(export\s+(default\s+)?(async\s+)?(function\*?|const|let|var|class|abstract\s+class|enum)\b|export\s+default\b|module\.exports\s*=|exports\.[A-Za-z_$][\w$]*\s*=)",
    )
    .expect("exported symbol pattern")
});

static REEXPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*export\s+(\*|\{[^}]*\}|\*\s+as\s+\w+|type\s+\{[^}]*\})\s+from\s+['"][^'"]+['"];?\s*$"#)
        .expect("re-export pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Skip(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Eligibility::Eligible => None,
            Eligibility::Skip(reason) => Some(reason),
        }
    }
}

pub fn check_eligibility(path: &Path, content: &str, config: &EligibilityConfig) -> Eligibility {
    let path_str = path.to_string_lossy().replace('\\', "/");

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !config
        .extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&extension))
    {
        return Eligibility::Skip(format!("unsupported extension '.{}'", extension));
    }

    if let Some(pattern) = config
        .skip_patterns
        .iter()
        .find(|p| matches_skip_pattern(&path_str, p))
    {
        return Eligibility::Skip(format!("path matches skip pattern '{}'", pattern));
    }

    if is_barrel_file(path, content) {
        return Eligibility::Skip("barrel file with only re-exports".to_string());
    }

    if !EXPORTED_SYMBOL.is_match(content) {
        return Eligibility::Skip("no exported symbols".to_string());
    }

    let significant = content.chars().filter(|c| !c.is_whitespace()).count();
    if significant < config.min_source_chars {
        return Eligibility::Skip(format!(
            "too small ({} significant chars, minimum {})",
            significant, config.min_source_chars
        ));
    }
    let total = content.chars().count();
    if total > config.max_source_chars {
        return Eligibility::Skip(format!(
            "too large ({} chars, maximum {})",
            total, config.max_source_chars
        ));
    }

    Eligibility::Eligible
}

/// Directory patterns (`dist/`) match whole directory segments only, so
/// `src/redist/x.ts` is not caught by `dist/`. Other patterns match as
/// substrings of the `/`-prefixed path.
fn matches_skip_pattern(path: &str, pattern: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        let dir = dir.trim_start_matches('/');
        if !dir.is_empty() && !dir.contains('/') {
            let mut segments: Vec<&str> = path.split('/').collect();
            segments.pop();
            return segments.contains(&dir);
        }
    }
    // "/path" so root-anchored patterns like "/types." hit root files too.
    format!("/{}", path).contains(pattern)
}

/// `index.*` files made solely of `export ... from` lines, imports and comments.
fn is_barrel_file(path: &Path, content: &str) -> bool {
    let is_index = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s == "index");
    if !is_index {
        return false;
    }

    let mut saw_reexport = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("//")
            || trimmed.starts_with("/*")
            || trimmed.starts_with('*')
            || trimmed.starts_with("import ")
        {
            continue;
        }
        if REEXPORT_LINE.is_match(trimmed) {
            saw_reexport = true;
            continue;
        }
        return false;
    }
    saw_reexport
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "export function add(a: number, b: number): number {\n  if (a < 0) { throw new Error('negative'); }\n  return a + b;\n}\n";

    fn check(path: &str, content: &str) -> Eligibility {
        check_eligibility(Path::new(path), content, &EligibilityConfig::default())
    }

    #[test]
    fn test_accepts_exported_module() {
        assert_eq!(check("src/math.ts", BODY), Eligibility::Eligible);
        assert!(check("lib/math.mjs", BODY).is_eligible());
    }

    #[test]
    fn test_rejects_unsupported_extension() {
        let result = check("src/math.py", BODY);
        assert!(result.reason().unwrap().contains("extension"));
    }

    #[test]
    fn test_rejects_existing_tests_and_declarations() {
        assert!(!check("src/math.test.ts", BODY).is_eligible());
        assert!(!check("src/__tests__/math.ts", BODY).is_eligible());
        assert!(!check("src/math.spec.js", BODY).is_eligible());
        assert!(!check("src/types.d.ts", BODY).is_eligible());
        assert!(!check("jest.config.ts", BODY).is_eligible());
        assert!(!check("dist/math.js", BODY).is_eligible());
        assert!(!check("node_modules/pkg/index.js", BODY).is_eligible());
    }

    #[test]
    fn test_rejects_barrel_index() {
        let barrel = "// public api\nexport * from './math';\nexport { sub } from './sub';\nexport type { Foo } from './types';\n";
        let result = check("src/index.ts", barrel);
        assert_eq!(
            result,
            Eligibility::Skip("barrel file with only re-exports".to_string())
        );
    }

    #[test]
    fn test_index_with_logic_is_not_barrel() {
        let content = format!("export * from './math';\n{}", BODY);
        assert!(check("src/index.ts", &content).is_eligible());
    }

    #[test]
    fn test_rejects_missing_exports() {
        let content = "function hidden(a, b) {\n  return a + b + a * b - (a / b) + 12345;\n}\n";
        assert_eq!(
            check("src/hidden.js", content),
            Eligibility::Skip("no exported symbols".to_string())
        );
    }

    #[test]
    fn test_commonjs_exports_count() {
        let content = "function add(a, b) {\n  return a + b + a * b - (a / b) + 12345;\n}\nmodule.exports = { add };\n";
        assert!(check("src/add.cjs", content).is_eligible());
    }

    #[test]
    fn test_directory_patterns_match_whole_segments() {
        assert!(check("src/redist/math.ts", BODY).is_eligible());
        assert!(check("src/rebuild/math.ts", BODY).is_eligible());
        assert!(check("src/my_node_modules/math.ts", BODY).is_eligible());
        assert!(!check("packages/core/dist/math.js", BODY).is_eligible());
        assert!(!check("build/math.js", BODY).is_eligible());
        assert!(!check("src/a/__mocks__/math.ts", BODY).is_eligible());
    }

    #[test]
    fn test_rejects_oversized_source() {
        let config = EligibilityConfig {
            max_source_chars: 1_000,
            ..EligibilityConfig::default()
        };
        let big = format!("{}{}", BODY, "// padding\n".repeat(200));
        let result = check_eligibility(Path::new("src/math.ts"), &big, &config);
        assert!(result.reason().unwrap().starts_with("too large"));
        assert!(check_eligibility(Path::new("src/math.ts"), BODY, &config).is_eligible());
    }

    #[test]
    fn test_rejects_trivially_small() {
        let result = check("src/tiny.ts", "export const a = 1;");
        assert!(result.reason().unwrap().starts_with("too small"));
    }
}
