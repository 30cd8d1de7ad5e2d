use serde::Deserialize;

use super::{DbError, Result};

/// Embedding lifecycle flag stored on each song. `None` (SQL NULL) means the
/// song has never been queued for embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingStatus {
    Pending,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(DbError::InvalidValue(format!(
                "unknown embedding_status: {other}"
            ))),
        }
    }

    /// Convert a nullable column value.
    pub fn from_column(value: Option<String>) -> Result<Option<Self>> {
        value.as_deref().map(Self::parse).transpose()
    }
}

/// A catalog entry handed over by catalog sync (insert or update a song).
#[derive(Debug, Clone, Deserialize)]
pub struct NewSong {
    pub external_id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub locator: Option<String>,
}

/// A song metadata row read from the database.
#[derive(Debug, Clone)]
pub struct Song {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub locator: Option<String>,
    pub description: Option<String>,
    pub mood: Option<String>,
    pub tags: Vec<String>,
    pub ai_payload: Option<String>,
    pub embedding_status: Option<EmbeddingStatus>,
    pub last_analyzed_at: Option<String>,
}

/// How a batch job descriptor points at a song: the metadata row id, or the
/// external catalog id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SongRef {
    Row(i64),
    External(String),
}

impl std::fmt::Display for SongRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Row(id) => write!(f, "#{id}"),
            Self::External(ext) => write!(f, "{ext}"),
        }
    }
}

/// Validated AI metadata for one song, ready to store.
#[derive(Debug, Clone, PartialEq)]
pub struct SongAnalysis {
    pub description: String,
    pub mood: Option<String>,
    /// Non-empty, every entry starts with [`crate::TAG_SIGIL`].
    pub tags: Vec<String>,
    /// The validated object this analysis was taken from, kept for audit.
    pub payload: serde_json::Value,
}

/// An analyzed song that still has no vector row.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub song_id: i64,
    pub artist: String,
    pub title: String,
    pub description: String,
}

/// Catalog statistics.
#[derive(Debug)]
pub struct CatalogStats {
    pub total_songs: i64,
    pub analyzed_songs: i64,
    pub vectors: i64,
    /// (status label, count); NULL status is reported as "unset".
    pub statuses: Vec<(String, i64)>,
}
