//! Regex-based inventory of exported functions.
//!
//! This is an approximation that feeds prompt context only. It does not
//! parse the language: parameter lists and bodies are found by bracket
//! matching that ignores string and comment contents on a best-effort basis.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static FUNCTION_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*export[ \t]+(?:default[ \t]+)?(async[ \t]+)?function\*?[ \t]*([A-Za-z_$][\w$]*)?[ \t]*(?:<[^(]*>)?[ \t]*\(",
    )
    .expect("function declaration pattern")
});

static ARROW_OR_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*export[ \t]+(?:const|let|var)[ \t]+([A-Za-z_$][\w$]*)[ \t]*(?::[^=]+)?=[ \t]*(async[ \t]+)?(?:function\*?[ \t]*[A-Za-z_$]?[\w$]*[ \t]*)?(?:<[^(]*>)?[ \t]*\(",
    )
    .expect("arrow function pattern")
});

static CLASS_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*export[ \t]+(?:default[ \t]+)?(?:abstract[ \t]+)?class[ \t]+([A-Za-z_$][\w$]*)[^{]*\{")
        .expect("class pattern")
});

static METHOD_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:public[ \t]+)?(?:static[ \t]+)?(async[ \t]+)?\*?([A-Za-z_$][\w$]*)[ \t]*(?:<[^(]*>)?[ \t]*\(",
    )
    .expect("method pattern")
});

static BRANCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|for|while|case|catch)\b|&&|\|\||[^?]\?[^?.:]").expect("branch pattern")
});

const NOT_METHODS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "constructor", "function", "super",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn from_branch_count(branches: usize) -> Self {
        match branches {
            0..=2 => Complexity::Low,
            3..=7 => Complexity::Medium,
            _ => Complexity::High,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Complexity::Low => "LOW",
            Complexity::Medium => "MEDIUM",
            Complexity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    pub param_count: usize,
    pub is_async: bool,
    pub returns_promise: bool,
    pub complexity: Complexity,
}

impl FunctionSignature {
    /// One line for prompt grounding.
    pub fn describe(&self) -> String {
        format!(
            "- {}({} param{}){}{} complexity={}",
            self.name,
            self.param_count,
            if self.param_count == 1 { "" } else { "s" },
            if self.is_async { " async" } else { "" },
            if self.returns_promise { " -> Promise" } else { "" },
            self.complexity.label()
        )
    }
}

pub fn extract_signatures(content: &str) -> Vec<FunctionSignature> {
    let mut found: Vec<(usize, FunctionSignature)> = Vec::new();

    for caps in FUNCTION_DECL.captures_iter(content) {
        let Some(whole) = caps.get(0) else { continue };
        let name = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "default".to_string());
        if let Some(sig) = build_signature(content, whole.end() - 1, name, caps.get(1).is_some()) {
            found.push((whole.start(), sig));
        }
    }

    for caps in ARROW_OR_EXPR.captures_iter(content) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        // `export const total = (a + b) * 2;` is not a function
        let is_function_expr = whole.as_str().contains("function");
        if !is_function_expr && !is_arrow(content, whole.end() - 1) {
            continue;
        }
        if let Some(sig) =
            build_signature(content, whole.end() - 1, name.as_str().to_string(), caps.get(2).is_some())
        {
            found.push((whole.start(), sig));
        }
    }

    for caps in CLASS_DECL.captures_iter(content) {
        let (Some(whole), Some(class_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let open = whole.end() - 1;
        let Some(close) = matching_bracket(content, open) else {
            continue;
        };
        let class_body = &content[open + 1..close];
        for (offset, sig) in class_methods(class_body, class_name.as_str()) {
            found.push((open + 1 + offset, sig));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, sig)| sig).collect()
}

/// Public methods declared at depth zero of a class body.
fn class_methods(body: &str, class_name: &str) -> Vec<(usize, FunctionSignature)> {
    let mut methods = Vec::new();
    for caps in METHOD_DECL.captures_iter(body) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let name = name.as_str();
        if NOT_METHODS.contains(&name) || name.starts_with('_') {
            continue;
        }
        if brace_depth(&body[..whole.start()]) != 0 {
            continue;
        }
        let line_start = body[..whole.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line = &body[line_start..whole.end()];
        if line.contains("private ") || line.contains("protected ") || line.contains('#') {
            continue;
        }
        if let Some(sig) = build_signature(
            body,
            whole.end() - 1,
            format!("{}.{}", class_name, name),
            caps.get(1).is_some(),
        ) {
            methods.push((whole.start(), sig));
        }
    }
    methods
}

fn build_signature(
    content: &str,
    paren_open: usize,
    name: String,
    is_async: bool,
) -> Option<FunctionSignature> {
    let paren_close = matching_bracket(content, paren_open)?;
    let params = &content[paren_open + 1..paren_close];
    let after_params = &content[paren_close + 1..];

    // Return annotation sits between `)` and the body (`{` or `=>`).
    let body_start = after_params
        .find(['{', '='])
        .map(|i| paren_close + 1 + i);
    let annotation = match body_start {
        Some(start) => &content[paren_close + 1..start],
        None => "",
    };
    let returns_promise = is_async || annotation.contains("Promise<");

    let body = body_start.and_then(|start| body_text(content, start)).unwrap_or("");
    let branches = BRANCH.find_iter(&strip_strings_and_comments(body)).count();

    Some(FunctionSignature {
        name,
        param_count: count_params(params),
        is_async,
        returns_promise,
        complexity: Complexity::from_branch_count(branches),
    })
}

fn is_arrow(content: &str, paren_open: usize) -> bool {
    let Some(close) = matching_bracket(content, paren_open) else {
        return false;
    };
    let rest = content[close + 1..].trim_start();
    if rest.starts_with("=>") {
        return true;
    }
    // Return type annotation before the arrow
    rest.starts_with(':') && rest.lines().next().is_some_and(|line| line.contains("=>"))
}

/// Body text starting at `{` or `=>`. Expression-bodied arrows run to the
/// end of the line.
fn body_text(content: &str, start: usize) -> Option<&str> {
    let rest = &content[start..];
    if rest.starts_with('{') {
        let close = matching_bracket(content, start)?;
        return Some(&content[start..=close]);
    }
    let arrow = rest.strip_prefix("=>")?.trim_start();
    let arrow_start = content.len() - arrow.len();
    if arrow.starts_with('{') {
        let close = matching_bracket(content, arrow_start)?;
        return Some(&content[arrow_start..=close]);
    }
    let end = arrow.find('\n').unwrap_or(arrow.len());
    Some(&arrow[..end])
}

fn count_params(params: &str) -> usize {
    let cleaned = strip_strings_and_comments(params).replace("=>", "  ");
    if cleaned.trim().is_empty() {
        return 0;
    }
    let mut depth = 0i32;
    let mut count = 1;
    for c in cleaned.chars() {
        match c {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            ',' if depth == 0 => count += 1,
            _ => {}
        }
    }
    // Trailing comma
    if cleaned.trim_end().ends_with(',') {
        count -= 1;
    }
    count
}

/// Index of the bracket closing the one at `open`.
fn matching_bracket(content: &str, open: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let (open_ch, close_ch) = match bytes.get(open)? {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_string = None;
            }
        } else if b == b'"' || b == b'\'' || b == b'`' {
            in_string = Some(b);
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i += 2;
            continue;
        } else if b == open_ch {
            depth += 1;
        } else if b == close_ch {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn brace_depth(prefix: &str) -> i32 {
    let cleaned = strip_strings_and_comments(prefix);
    cleaned.chars().fold(0, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth - 1,
        _ => depth,
    })
}

/// Blank out string literal and comment contents so keywords inside them
/// are not counted.
fn strip_strings_and_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' | '`' => {
                out.push(c);
                while let Some(inner) = chars.next() {
                    if inner == '\\' {
                        chars.next();
                        continue;
                    }
                    if inner == c {
                        out.push(c);
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            _ => out.push(c),
        }
    }
    out
}
