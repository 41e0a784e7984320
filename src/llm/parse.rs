//! Text extraction helpers for model output.
//!
//! Every helper here is a pure function. Callers compose them into an
//! explicit fallback chain: strict parse, then re-sanitized parse, then
//! tag/regex scraping.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;
use thiserror::Error;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").expect("trailing comma pattern"));

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("no JSON object found in {0}")]
    NoJson(&'static str),

    #[error("{context} is not valid JSON: {message}")]
    InvalidJson {
        context: &'static str,
        message: String,
    },

    #[error("{context} is missing required field '{field}'")]
    MissingField {
        context: &'static str,
        field: &'static str,
    },

    #[error("{0} could not be parsed by any strategy")]
    Exhausted(&'static str),
}

/// Strip markdown code fences from a response
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = match trimmed.strip_prefix("```") {
        Some(rest) => match rest.find('\n') {
            // Drop the language tag line (```json, ```ts, ...)
            Some(newline) if !rest[..newline].contains(char::is_whitespace) => &rest[newline + 1..],
            _ => rest,
        },
        None => trimmed,
    };
    let clean = clean.trim_end();
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between the first `open` and the last `close`
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract a JSON object from model output, handling fences and chatter
pub fn extract_json_object(response: &str) -> Option<&str> {
    let clean = strip_markdown_fences(response);
    extract_json_fragment(clean, '{', '}')
}

/// Try to fix common JSON issues from model responses
pub fn fix_json_issues(json: &str) -> String {
    let mut fixed = TRAILING_COMMA.replace_all(json, "$1").into_owned();

    fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");
    fixed = fixed.replace(['\u{2018}', '\u{2019}'], "'");

    escape_controls_in_strings(&fixed)
}

/// Escape raw newlines and tabs inside string literals (models emit whole
/// files this way) and drop other control characters.
fn escape_controls_in_strings(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in json.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => {}
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            if !c.is_control() || matches!(c, '\n' | '\t' | '\r') {
                out.push(c);
            }
        }
    }
    out
}

/// Strict parse, then one sanitized re-parse. No model round-trips.
pub fn parse_json_lenient<T>(response: &str, context: &'static str) -> Result<T, ParseError>
where
    T: DeserializeOwned,
{
    let json_str = extract_json_object(response).ok_or(ParseError::NoJson(context))?;

    match serde_json::from_str::<T>(json_str) {
        Ok(parsed) => Ok(parsed),
        Err(initial_error) => {
            let fixed = fix_json_issues(json_str);
            if fixed != json_str {
                if let Ok(parsed) = serde_json::from_str::<T>(&fixed) {
                    return Ok(parsed);
                }
            }
            Err(ParseError::InvalidJson {
                context,
                message: initial_error.to_string(),
            })
        }
    }
}

/// Content of the first `<tag>...</tag>` pair, trimmed of one layer of
/// blank lines and fences. Returns `None` when the tag is absent.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let rest = &text[start..];
    let end = rest.find(&close).unwrap_or(rest.len());
    let inner = rest[..end].trim_matches(|c| c == '\n' || c == '\r');
    Some(strip_markdown_fences(inner).to_string())
}

/// Inserted where `truncate_content` cut the middle of a file.
pub const TRUNCATION_MARKER: &str = "... [truncated] ...";

/// Truncate file contents for prompt safety (keep beginning + end)
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars / 2).collect();
        let tail: String = content.chars().rev().take(max_chars / 2).collect::<String>();
        format!(
            "{}\n\n{}\n\n{}",
            head,
            TRUNCATION_MARKER,
            tail.chars().rev().collect::<String>()
        )
    }
}

/// Normalize generated file content: LF line endings, one trailing newline.
pub fn normalize_generated_content(content: &str) -> String {
    let unified = content.replace("\r\n", "\n");
    let trimmed = unified.trim_end_matches(['\n', ' ', '\t']);
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{}\n", trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        a: u32,
        #[serde(default)]
        b: Vec<u32>,
    }

    #[test]
    fn test_truncate_content() {
        let content = "line1\nline2\nline3\nline4\nline5";
        let truncated = truncate_content(content, 15);
        assert!(truncated.contains("truncated"));
        assert!(truncated.starts_with("line1"));
        assert!(truncated.ends_with("line5"));
    }

    #[test]
    fn test_strip_fences_with_language_tag() {
        assert_eq!(strip_markdown_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fences("```ts\nconst x = 1;\n```"), "const x = 1;");
        assert_eq!(strip_markdown_fences("plain"), "plain");
    }

    #[test]
    fn test_lenient_parse_handles_trailing_commas_and_smart_quotes() {
        let raw = "Here you go:\n{\u{201C}a\u{201D}: 1, \"b\": [1, 2,\n],}";
        let parsed: Sample = parse_json_lenient(raw, "sample").unwrap();
        assert_eq!(parsed.a, 1);
        assert_eq!(parsed.b, vec![1, 2]);
    }

    #[test]
    fn test_lenient_parse_reports_no_json() {
        let err = parse_json_lenient::<Sample>("nothing here", "sample").unwrap_err();
        assert_eq!(err, ParseError::NoJson("sample"));
    }

    #[test]
    fn test_lenient_parse_reports_invalid_json() {
        let err = parse_json_lenient::<Sample>("{\"a\": }", "sample").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson { .. }));
    }

    #[test]
    fn test_fix_json_escapes_raw_newlines_in_strings() {
        let raw = "{\"code\": \"line1\nline2\tx\", \"n\": 1}";
        let fixed = fix_json_issues(raw);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["code"], "line1\nline2\tx");
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn test_extract_tag() {
        let text = "<strategy>LOGIC_FIX</strategy>\n<fixed_source>\n```ts\nexport const a = 1;\n```\n</fixed_source>";
        assert_eq!(extract_tag(text, "strategy").as_deref(), Some("LOGIC_FIX"));
        assert_eq!(
            extract_tag(text, "fixed_source").as_deref(),
            Some("export const a = 1;")
        );
        assert!(extract_tag(text, "risk").is_none());
    }

    #[test]
    fn test_extract_tag_unclosed_takes_rest() {
        let text = "<root_cause>runs to the end";
        assert_eq!(extract_tag(text, "root_cause").as_deref(), Some("runs to the end"));
    }

    #[test]
    fn test_normalize_generated_content() {
        assert_eq!(normalize_generated_content("a\r\nb\n\n\n"), "a\nb\n");
        assert_eq!(normalize_generated_content("  \n"), "");
    }
}
