//! Repair chain for model output that is *almost* JSON.
//!
//! Each rule is a pure string rewrite aimed at one malformation the model is
//! known to emit. Rules run in a fixed order; the chain stops at the first
//! rewrite that parses. Anything else stays broken and is reported with
//! enough context to inspect offline.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::{ParseFailure, RepairExhausted};

/// Characters kept either side of a parse failure position.
pub const WINDOW_RADIUS: usize = 20;

/// Keys the model emits at the top level of a song object. Used to anchor
/// rules that would be too greedy without a known follow-up key.
pub const KNOWN_KEYS: &[&str] = &[
    "description", "mood", "tags", "genre", "energy", "themes", "instruments", "era",
];

/// One narrowly-scoped rewrite.
pub struct RepairRule {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

/// The repair chain, in application order.
pub const RULES: &[RepairRule] = &[
    RepairRule { name: "surrounding_text", apply: strip_surrounding_text },
    RepairRule { name: "flattened_object", apply: restore_flattened_object },
    RepairRule { name: "array_closed_by_brace", apply: fix_array_closed_by_brace },
    RepairRule { name: "object_closed_by_bracket", apply: fix_object_closed_by_bracket },
    RepairRule { name: "bare_tags", apply: quote_bare_tags },
    // Must run before trailing_comma: a truncated `["a",` only becomes
    // `["a",]` once closed.
    RepairRule { name: "unbalanced_closers", apply: close_unbalanced },
    RepairRule { name: "trailing_comma", apply: remove_trailing_commas },
];

/// A value recovered by the repair chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub value: Value,
    /// Rules whose rewrite led to the parse, in order.
    pub rules: Vec<&'static str>,
}

// ```json, ```JSON, bare ```, anywhere in the content
static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)`{3,}(?:json|javascript|js)?").unwrap());

// "mood": "primary": "calm", "secondary": "wistful"}, "tags": ...
// The object lost its opening brace; its closing brace is still there,
// right before the next known key.
static FLATTENED_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#""(?P<key>[A-Za-z_]+)"\s*:\s*"(?P<inner>[A-Za-z_]+)"\s*:(?P<body>[^{{}}\[\]]*?)\}}(?P<tail>\s*,\s*"(?:{})")"#,
        KNOWN_KEYS.join("|")
    ))
    .unwrap()
});

// ["#a", "#b"}: string array closed with a brace
static ARRAY_CLOSED_BY_BRACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<arr>\[\s*"(?:[^"\\]|\\.)*"(?:\s*,\s*"(?:[^"\\]|\\.)*")*\s*)\}"#).unwrap()
});

// [#chill, #late-night]
static BARE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<pre>[\[,]\s*)#(?P<tag>[\w-]+)").unwrap());

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*(?P<close>[}\]])").unwrap());

/// Remove markdown code-fence markers and surrounding whitespace. Idempotent.
pub fn strip_code_fences(content: &str) -> String {
    let mut out = content.to_string();
    // Removing one fence can splice stray backticks into a new one.
    while CODE_FENCE_RE.is_match(&out) {
        out = CODE_FENCE_RE.replace_all(&out, "").into_owned();
    }
    out.trim().to_string()
}

/// Parse cleaned content, reporting where the parser gave up.
pub fn parse_json(custom_id: &str, content: &str) -> Result<Value, ParseFailure> {
    serde_json::from_str(content).map_err(|e| ParseFailure::MalformedJson {
        custom_id: custom_id.to_string(),
        message: e.to_string(),
        position: error_position(content, &e),
    })
}

/// Run the repair chain over content whose direct parse failed.
///
/// `raw` is the message content as received, `cleaned` the fence-stripped
/// text that was parsed. Any failure other than `MalformedJson` is returned
/// unchanged.
pub fn repair(raw: &str, cleaned: &str, malformed: ParseFailure) -> Result<Repaired, ParseFailure> {
    let (custom_id, message, position) = match malformed {
        ParseFailure::MalformedJson { custom_id, message, position } => (custom_id, message, position),
        other => return Err(other),
    };

    let mut current = cleaned.to_string();
    let mut applied = Vec::new();
    for rule in RULES {
        let next = (rule.apply)(&current);
        if next == current {
            continue;
        }
        current = next;
        applied.push(rule.name);
        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            log::debug!("{custom_id}: repaired by {}", applied.join(" > "));
            return Ok(Repaired { value, rules: applied });
        }
    }

    // The full chain failed. Try each rule alone to see whether an earlier
    // rewrite got in the way of a later one.
    for rule in RULES {
        let candidate = (rule.apply)(cleaned);
        if candidate == cleaned {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            log::warn!(
                "{custom_id}: rule '{}' parses alone but not after {}",
                rule.name,
                applied.join(" > ")
            );
            return Ok(Repaired { value, rules: vec![rule.name] });
        }
    }

    let (window, char_codes) = match position {
        Some(pos) => context_window(cleaned, pos),
        None => (String::new(), Vec::new()),
    };

    Err(ParseFailure::RepairExhausted(Box::new(RepairExhausted {
        custom_id,
        content: raw.to_string(),
        message,
        position,
        window,
        char_codes,
        rules_applied: applied,
    })))
}

/// Character offset of a serde_json error inside `content`.
pub fn error_position(content: &str, err: &serde_json::Error) -> Option<usize> {
    if err.line() == 0 {
        return None;
    }
    let line_start: usize = content
        .split_inclusive('\n')
        .take(err.line() - 1)
        .map(str::len)
        .sum();
    let byte = (line_start + err.column().saturating_sub(1)).min(content.len());
    Some(content.char_indices().take_while(|(i, _)| *i < byte).count())
}

/// Text around a character position, plus each character's code point.
pub fn context_window(content: &str, position: usize) -> (String, Vec<(char, u32)>) {
    let chars: Vec<char> = content.chars().collect();
    let end = (position + WINDOW_RADIUS + 1).min(chars.len());
    let start = position.saturating_sub(WINDOW_RADIUS).min(end);
    let window = &chars[start..end];
    (
        window.iter().collect(),
        window.iter().map(|&c| (c, c as u32)).collect(),
    )
}

/// Drop prose before the first JSON value and after the last one. Several
/// top-level values back to back are wrapped into one array.
fn strip_surrounding_text(s: &str) -> String {
    let Some(start) = s.find(['{', '[']) else {
        return s.to_string();
    };
    let body = &s[start..];

    let mut stream = serde_json::Deserializer::from_str(body).into_iter::<Value>();
    let mut ends = Vec::new();
    while let Some(Ok(_)) = stream.next() {
        ends.push(stream.byte_offset());
    }

    match ends.as_slice() {
        [] => body.to_string(),
        [end] => body[..*end].to_string(),
        _ => {
            let mut begin = 0;
            let parts: Vec<&str> = ends
                .iter()
                .map(|&end| {
                    let part = &body[begin..end];
                    begin = end;
                    part.trim()
                })
                .collect();
            format!("[{}]", parts.join(","))
        }
    }
}

fn restore_flattened_object(s: &str) -> String {
    FLATTENED_OBJECT_RE
        .replace_all(s, r#""${key}": {"${inner}":${body}}${tail}"#)
        .into_owned()
}

fn fix_array_closed_by_brace(s: &str) -> String {
    ARRAY_CLOSED_BY_BRACE_RE.replace_all(s, "${arr}]").into_owned()
}

/// `"mood": {"primary": "calm"]`: an object value closed with a bracket.
///
/// Only a `]` outside strings whose innermost open container is an object
/// following a `:` is rewritten.
fn fix_object_closed_by_bracket(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    // (opener, opened as an object member's value)
    let mut stack: Vec<(char, bool)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut prev = None;

    for c in s.chars() {
        out.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push((c, prev == Some(':'))),
            ']' if stack.last() == Some(&('{', true)) => {
                stack.pop();
                out.pop();
                out.push('}');
            }
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
        if !c.is_whitespace() {
            prev = Some(c);
        }
    }
    out
}

fn quote_bare_tags(s: &str) -> String {
    BARE_TAG_RE.replace_all(s, r##"${pre}"#${tag}""##).into_owned()
}

fn remove_trailing_commas(s: &str) -> String {
    TRAILING_COMMA_RE.replace_all(s, "${close}").into_owned()
}

/// Append the closers a truncated response is missing.
fn close_unbalanced(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' if stack.last() == Some(&c) => {
                stack.pop();
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return s.to_string();
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
