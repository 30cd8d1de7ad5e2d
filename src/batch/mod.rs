//! Batch inference output: response parsing/repair, job mappings, diagnostics.

pub mod diagnostics;
pub mod mapping;
pub mod repair;
pub mod response;

use thiserror::Error;

/// Why one batch output line could not be turned into song metadata.
///
/// Failures are per line: they are collected, never raised out of a batch pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseFailure {
    #[error("not a batch response line: {message}")]
    InvalidLine { message: String },
    #[error("{custom_id}: response has no message content")]
    EmptyContent { custom_id: String },
    /// Direct parse failed. Escalates into the repair chain, never terminal.
    #[error("{custom_id}: malformed JSON: {message}")]
    MalformedJson {
        custom_id: String,
        message: String,
        /// Character offset into the cleaned content.
        position: Option<usize>,
    },
    #[error(
        "{}: unparseable after {} repair rules: {}",
        .0.custom_id,
        .0.rules_applied.len(),
        .0.message
    )]
    RepairExhausted(Box<RepairExhausted>),
    #[error("{custom_id}: schema violation: {reason}")]
    SchemaViolation { custom_id: String, reason: String },
}

impl ParseFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidLine { .. } => "InvalidLine",
            Self::EmptyContent { .. } => "EmptyContent",
            Self::MalformedJson { .. } => "MalformedJson",
            Self::RepairExhausted(_) => "RepairExhausted",
            Self::SchemaViolation { .. } => "SchemaViolation",
        }
    }

    pub fn custom_id(&self) -> Option<&str> {
        match self {
            Self::InvalidLine { .. } => None,
            Self::EmptyContent { custom_id }
            | Self::MalformedJson { custom_id, .. }
            | Self::SchemaViolation { custom_id, .. } => Some(custom_id),
            Self::RepairExhausted(r) => Some(&r.custom_id),
        }
    }

    /// EmptyContent lines are not retried automatically; someone has to look.
    pub fn needs_manual_review(&self) -> bool {
        matches!(self, Self::EmptyContent { .. })
    }
}

/// Context kept for a line that no repair rule could fix.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairExhausted {
    pub custom_id: String,
    /// Message content exactly as received.
    pub content: String,
    /// Parser message from the direct parse of the fence-stripped content.
    pub message: String,
    /// Character offset of the parse failure, when the parser reported one.
    pub position: Option<usize>,
    /// Up to 20 characters either side of `position`.
    pub window: String,
    /// `(char, code point)` for every character of `window`.
    pub char_codes: Vec<(char, u32)>,
    pub rules_applied: Vec<&'static str>,
}
