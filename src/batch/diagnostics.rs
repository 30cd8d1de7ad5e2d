//! Offline-inspection file for lines an ingestion pass could not use.

use serde::Serialize;
use std::path::Path;

use super::ParseFailure;

/// One failed line.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEntry {
    /// 1-based line number in the batch output file.
    pub line: usize,
    pub kind: &'static str,
    pub custom_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub char_codes: Vec<(char, u32)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules_applied: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub manual_review: bool,
}

impl DiagnosticEntry {
    pub fn from_failure(line: usize, failure: &ParseFailure) -> Self {
        let mut entry = Self {
            line,
            kind: failure.kind(),
            custom_id: failure.custom_id().map(str::to_string),
            message: failure.to_string(),
            position: None,
            window: None,
            char_codes: Vec::new(),
            rules_applied: Vec::new(),
            content: None,
            manual_review: failure.needs_manual_review(),
        };

        match failure {
            ParseFailure::RepairExhausted(report) => {
                entry.message = report.message.clone();
                entry.position = report.position;
                entry.window = Some(report.window.clone());
                entry.char_codes = report.char_codes.clone();
                entry.rules_applied = report.rules_applied.clone();
                entry.content = Some(report.content.clone());
            }
            ParseFailure::MalformedJson { position, .. } => entry.position = *position,
            _ => {}
        }
        entry
    }

    /// A line that parsed but whose job or song could not be found.
    pub fn unmapped(line: usize, custom_id: &str, message: String) -> Self {
        Self {
            line,
            kind: "Unmapped",
            custom_id: Some(custom_id.to_string()),
            message,
            position: None,
            window: None,
            char_codes: Vec::new(),
            rules_applied: Vec::new(),
            content: None,
            manual_review: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: String,
    pub source: String,
    pub failures: Vec<DiagnosticEntry>,
}

impl DiagnosticsReport {
    pub fn new(source: &Path, failures: Vec<DiagnosticEntry>) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            source: source.display().to_string(),
            failures,
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}
