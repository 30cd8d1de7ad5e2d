//! One line of batch output → validated song metadata.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::repair;
use super::ParseFailure;
use crate::db::models::SongAnalysis;
use crate::TAG_SIGIL;

/// A batch output line. Only the message content is read.
#[derive(Debug, Deserialize)]
pub struct BatchResponseLine {
    pub custom_id: String,
    #[serde(default)]
    response: Option<ResponseEnvelope>,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    body: Option<ResponseBody>,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

impl BatchResponseLine {
    /// The first choice's message content, if it has any non-blank text.
    pub fn content(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .body
            .as_ref()?
            .choices
            .first()?
            .message
            .as_ref()?
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
    }
}

/// Validated metadata recovered from one line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub custom_id: String,
    /// One entry per song object in the content, in order.
    pub analyses: Vec<SongAnalysis>,
    /// Repair rules that were needed; empty for a direct parse.
    pub repaired_by: Vec<&'static str>,
}

impl ParsedResponse {
    pub fn was_repaired(&self) -> bool {
        !self.repaired_by.is_empty()
    }
}

/// Parse one raw JSONL line.
pub fn parse_response_line(line: &str) -> Result<ParsedResponse, ParseFailure> {
    let parsed: BatchResponseLine = serde_json::from_str(line).map_err(|e| {
        ParseFailure::InvalidLine {
            message: e.to_string(),
        }
    })?;
    parse_response(&parsed)
}

/// Extract, clean, parse (repairing if needed) and validate a line's content.
pub fn parse_response(line: &BatchResponseLine) -> Result<ParsedResponse, ParseFailure> {
    let custom_id = line.custom_id.clone();
    let empty = || ParseFailure::EmptyContent {
        custom_id: custom_id.clone(),
    };

    let content = line.content().ok_or_else(empty)?;
    let cleaned = repair::strip_code_fences(content);
    if cleaned.is_empty() {
        return Err(empty());
    }

    let (value, repaired_by) = match repair::parse_json(&custom_id, &cleaned) {
        Ok(value) => (value, Vec::new()),
        Err(malformed) => {
            log::debug!("{malformed}");
            let repaired = repair::repair(content, &cleaned, malformed)?;
            (repaired.value, repaired.rules)
        }
    };

    let analyses = validate_payload(value).map_err(|reason| ParseFailure::SchemaViolation {
        custom_id: custom_id.clone(),
        reason,
    })?;

    Ok(ParsedResponse {
        custom_id,
        analyses,
        repaired_by,
    })
}

/// Normalize a parsed payload (object or array of objects) to validated analyses.
pub fn validate_payload(value: Value) -> Result<Vec<SongAnalysis>, String> {
    match value {
        Value::Object(obj) => Ok(vec![validate_song_object(obj)?]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err("empty array".to_string());
            }
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(obj) => {
                        validate_song_object(obj).map_err(|reason| format!("item {i}: {reason}"))
                    }
                    other => Err(format!("item {i}: expected object, got {}", type_name(&other))),
                })
                .collect()
        }
        other => Err(format!("expected object or array, got {}", type_name(&other))),
    }
}

/// Check one song object against the metadata service's contract.
fn validate_song_object(obj: Map<String, Value>) -> Result<SongAnalysis, String> {
    let description = match obj.get("description") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => return Err("description is empty".to_string()),
        Some(other) => return Err(format!("description must be a string, got {}", type_name(other))),
        None => return Err("missing description".to_string()),
    };

    let tags = match obj.get("tags") {
        Some(Value::Array(items)) => {
            let mut tags = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => tags.extend(normalize_tag(s)),
                    other => return Err(format!("tags must be strings, got {}", type_name(other))),
                }
            }
            tags
        }
        Some(other) => return Err(format!("tags must be an array, got {}", type_name(other))),
        None => return Err("missing tags".to_string()),
    };
    if tags.is_empty() {
        return Err("tags is empty".to_string());
    }

    let mood = match obj.get("mood") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Object(inner)) => inner
            .get("primary")
            .and_then(Value::as_str)
            // Object keys are sorted, so this is the first string by key name.
            .or_else(|| inner.values().find_map(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        Some(other) => return Err(format!("mood must be a string or object, got {}", type_name(other))),
    };

    Ok(SongAnalysis {
        description,
        mood,
        tags,
        payload: Value::Object(obj),
    })
}

/// Trim a tag and give it exactly one leading sigil. Blank tags are dropped.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let bare = raw.trim().trim_start_matches(TAG_SIGIL).trim();
    if bare.is_empty() {
        None
    } else {
        Some(format!("{TAG_SIGIL}{bare}"))
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Wrap message content in the batch output envelope.
    fn line(custom_id: &str, content: &str) -> String {
        json!({
            "custom_id": custom_id,
            "response": {
                "status_code": 200,
                "body": {"choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]}
            }
        })
        .to_string()
    }

    #[test]
    fn test_direct_parse() {
        let content = r##"{"description": "Sunny jangle pop", "mood": "upbeat", "tags": ["#indie", "#summer"]}"##;
        let parsed = parse_response_line(&line("cid-1", content)).unwrap();
        assert_eq!(parsed.custom_id, "cid-1");
        assert!(!parsed.was_repaired());
        assert_eq!(parsed.analyses.len(), 1);
        assert_eq!(parsed.analyses[0].description, "Sunny jangle pop");
        assert_eq!(parsed.analyses[0].mood.as_deref(), Some("upbeat"));
        assert_eq!(parsed.analyses[0].tags, vec!["#indie", "#summer"]);
    }

    #[test]
    fn test_valid_object_roundtrips_without_repair() {
        let original = json!({
            "description": "Brooding synth ballad",
            "mood": "melancholic",
            "tags": ["#synthwave", "#night"],
            "energy": "low",
        });
        let parsed = parse_response_line(&line("cid", &original.to_string())).unwrap();
        assert!(parsed.repaired_by.is_empty());
        assert_eq!(parsed.analyses[0].payload, original);
    }

    #[test]
    fn test_fenced_content() {
        let content = "```json\n{\"description\": \"Warm\", \"tags\": [\"#chill\"]}\n```";
        let parsed = parse_response_line(&line("cid", content)).unwrap();
        assert!(!parsed.was_repaired());
        assert_eq!(parsed.analyses[0].tags, vec!["#chill"]);
    }

    #[test]
    fn test_array_content_normalized_to_sequence() {
        let content = r##"[{"description": "A", "tags": ["#a"]}, {"description": "B", "tags": ["#b"]}]"##;
        let parsed = parse_response_line(&line("cid", content)).unwrap();
        let descriptions: Vec<_> = parsed.analyses.iter().map(|a| a.description.as_str()).collect();
        assert_eq!(descriptions, vec!["A", "B"]);
    }

    #[test]
    fn test_flattened_object_line_repairs_to_nested_shape() {
        let content = r##"```json
{"description": "Hazy dream pop", "mood": "primary": "wistful", "secondary": "calm"}, "tags": ["#dreampop", "#shoegaze"]}
```"##;
        let parsed = parse_response_line(&line("cid-7", content)).unwrap();
        assert_eq!(parsed.repaired_by, vec!["flattened_object"]);

        let a = &parsed.analyses[0];
        assert_eq!(a.mood.as_deref(), Some("wistful"));
        assert_eq!(
            a.payload,
            json!({
                "description": "Hazy dream pop",
                "mood": {"primary": "wistful", "secondary": "calm"},
                "tags": ["#dreampop", "#shoegaze"],
            })
        );
    }

    #[test]
    fn test_missing_content_is_empty_content() {
        let l = json!({"custom_id": "cid", "response": {"body": {"choices": []}}}).to_string();
        assert_eq!(
            parse_response_line(&l).unwrap_err(),
            ParseFailure::EmptyContent { custom_id: "cid".into() }
        );

        let l = json!({"custom_id": "cid", "error": {"message": "expired"}}).to_string();
        assert_eq!(parse_response_line(&l).unwrap_err().kind(), "EmptyContent");
    }

    #[test]
    fn test_fence_only_content_is_empty_content() {
        let err = parse_response_line(&line("cid", "```json\n```")).unwrap_err();
        assert!(err.needs_manual_review());
    }

    #[test]
    fn test_invalid_outer_line() {
        let err = parse_response_line("{not json").unwrap_err();
        assert_eq!(err.kind(), "InvalidLine");
        assert_eq!(err.custom_id(), None);
    }

    #[test]
    fn test_schema_violation_empty_tags() {
        let content = r##"{"description": "Warm", "tags": []}"##;
        let err = parse_response_line(&line("cid", content)).unwrap_err();
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn test_schema_violation_after_repair() {
        // Repair fixes syntax, validation still rejects the blank description.
        let content = r##"{"description": "  ", "tags": [#chill]}"##;
        let err = parse_response_line(&line("cid", content)).unwrap_err();
        assert!(matches!(err, ParseFailure::SchemaViolation { .. }));
    }

    #[test]
    fn test_schema_violation_in_array_item() {
        let content = r##"[{"description": "A", "tags": ["#a"]}, "B"]"##;
        let err = parse_response_line(&line("cid", content)).unwrap_err();
        let ParseFailure::SchemaViolation { reason, .. } = err else {
            panic!("expected SchemaViolation");
        };
        assert!(reason.starts_with("item 1"));
    }

    #[test]
    fn test_repair_exhausted_line() {
        let content = r##"{"description": "Warm", "tags": ["#chill"], "mood": calm}"##;
        let err = parse_response_line(&line("cid-9", content)).unwrap_err();
        assert_eq!(err.kind(), "RepairExhausted");
        assert_eq!(err.custom_id(), Some("cid-9"));
    }

    #[test]
    fn test_tags_get_sigil() {
        let content = r###"{"description": "Warm", "tags": ["chill", " #night ", "##lofi", "  ", "#"]}"###;
        let parsed = parse_response_line(&line("cid", content)).unwrap();
        assert_eq!(parsed.analyses[0].tags, vec!["#chill", "#night", "#lofi"]);
    }

    #[test]
    fn test_only_blank_tags_is_violation() {
        let content = r##"{"description": "Warm", "tags": [" ", "#"]}"##;
        assert_eq!(parse_response_line(&line("cid", content)).unwrap_err().kind(), "SchemaViolation");
    }

    #[test]
    fn test_mood_shapes() {
        let mood = |m: Value| {
            let v = json!({"description": "d", "tags": ["#t"], "mood": m});
            validate_payload(v).map(|a| a[0].mood.clone())
        };
        assert_eq!(mood(json!("calm")).unwrap().as_deref(), Some("calm"));
        assert_eq!(mood(json!({"secondary": "x", "primary": "calm"})).unwrap().as_deref(), Some("calm"));
        assert_eq!(mood(json!({"label": "dark"})).unwrap().as_deref(), Some("dark"));
        assert_eq!(
            mood(json!({"secondary": "wistful", "energy": 3, "alt": "hazy"})).unwrap().as_deref(),
            Some("hazy")
        );
        assert_eq!(mood(Value::Null).unwrap(), None);
        assert!(mood(json!(3)).is_err());
    }

    #[test]
    fn test_non_object_payload_is_violation() {
        assert!(validate_payload(json!("text")).is_err());
        assert!(validate_payload(json!([])).is_err());
    }
}
