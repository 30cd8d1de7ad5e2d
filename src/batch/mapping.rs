//! Batch job mappings: `custom_id` → job descriptor.
//!
//! A retry run writes its own mapping next to the primary one. Before retry
//! results are ingested the two are merged (retry wins) and written back over
//! the primary file, which stays the single authoritative mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::models::SongRef;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("mapping file not found: {}", .0.display())]
    MissingMappingFile(PathBuf),
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid mapping JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown custom_id: {0}")]
    UnknownCustomId(String),
    #[error("invalid job descriptor for {custom_id}: {reason}")]
    InvalidDescriptor { custom_id: String, reason: String },
}

/// A flat `custom_id` → descriptor object. Descriptors are kept as raw JSON so
/// fields this crate does not read survive a merge untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobMapping {
    pub entries: BTreeMap<String, Value>,
}

/// Typed view of a descriptor, enough to find the target song(s).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobDescriptor {
    #[serde(default, alias = "song")]
    pub song_id: Option<SongRef>,
    /// Set when one request asked about several songs at once.
    #[serde(default, alias = "songs")]
    pub song_ids: Vec<SongRef>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl JobDescriptor {
    /// Songs this job targets, in the order the model was asked about them.
    pub fn songs(&self) -> Vec<SongRef> {
        self.song_id.iter().chain(self.song_ids.iter()).cloned().collect()
    }
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged {
        primary_entries: usize,
        retry_entries: usize,
        /// Primary keys replaced by a retry entry.
        overridden: usize,
        total: usize,
    },
    /// One or both inputs were absent; nothing was written.
    Skipped { missing: Vec<PathBuf> },
}

impl JobMapping {
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MappingError::MissingMappingFile(path.to_path_buf())
            } else {
                MappingError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        serde_json::from_str(&contents).map_err(|e| MappingError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write pretty-printed JSON via a temp file + rename, so a crash leaves
    /// either the old or the new file.
    pub fn save(&self, path: &Path) -> Result<(), MappingError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| MappingError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let io_err = |e| MappingError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        writeln!(file, "{json}").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a result line's job.
    pub fn resolve(&self, custom_id: &str) -> Result<JobDescriptor, MappingError> {
        let raw = self
            .entries
            .get(custom_id)
            .ok_or_else(|| MappingError::UnknownCustomId(custom_id.to_string()))?;

        let invalid = |reason: String| MappingError::InvalidDescriptor {
            custom_id: custom_id.to_string(),
            reason,
        };
        let descriptor: JobDescriptor =
            serde_json::from_value(raw.clone()).map_err(|e| invalid(e.to_string()))?;
        if descriptor.songs().is_empty() {
            return Err(invalid("no song reference".to_string()));
        }
        Ok(descriptor)
    }
}

/// Merge two mappings. Retry entries replace primary entries with the same
/// `custom_id`; everything else is kept. Idempotent.
pub fn merge_mappings(primary: &JobMapping, retry: &JobMapping) -> JobMapping {
    let mut merged = primary.clone();
    merged
        .entries
        .extend(retry.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Merge the retry mapping file into the primary one, in place.
///
/// A missing input is not an error: the merge is skipped and reported.
pub fn merge_mapping_files(primary_path: &Path, retry_path: &Path) -> Result<MergeOutcome, MappingError> {
    let missing: Vec<PathBuf> = [primary_path, retry_path]
        .into_iter()
        .filter(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();
    if !missing.is_empty() {
        for path in &missing {
            log::warn!("{}; skipping merge", MappingError::MissingMappingFile(path.clone()));
        }
        return Ok(MergeOutcome::Skipped { missing });
    }

    let primary = JobMapping::load(primary_path)?;
    let retry = JobMapping::load(retry_path)?;
    let overridden = retry
        .entries
        .keys()
        .filter(|k| primary.entries.contains_key(*k))
        .count();

    let merged = merge_mappings(&primary, &retry);
    merged.save(primary_path)?;

    log::info!(
        "Merged {} retry entries into {} ({} overridden, {} total)",
        retry.len(),
        primary_path.display(),
        overridden,
        merged.len()
    );

    Ok(MergeOutcome::Merged {
        primary_entries: primary.len(),
        retry_entries: retry.len(),
        overridden,
        total: merged.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(v: Value) -> JobMapping {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_merge_overrides() {
        let merged = merge_mappings(&mapping(json!({"a": 1, "b": 2})), &mapping(json!({"b": 3, "c": 4})));
        assert_eq!(merged, mapping(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[test]
    fn test_merge_disjoint_is_order_independent() {
        let x = mapping(json!({"a": 1, "b": 2}));
        let y = mapping(json!({"c": 3, "d": 4}));
        assert_eq!(merge_mappings(&x, &y), merge_mappings(&y, &x));
        assert_eq!(merge_mappings(&x, &y).len(), 4);
    }

    #[test]
    fn test_merge_idempotent() {
        let p = mapping(json!({"a": 1, "b": 2}));
        let r = mapping(json!({"b": 3}));
        let once = merge_mappings(&p, &r);
        assert_eq!(merge_mappings(&once, &r), once);
    }

    #[test]
    fn test_merge_files_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("batch_mapping.json");
        let retry = dir.path().join("batch_mapping_retry.json");
        std::fs::write(&primary, r#"{"cid1":{"song":"s1"}}"#).unwrap();
        std::fs::write(&retry, r#"{"cid1":{"song":"s1-retry"},"cid2":{"song":"s2"}}"#).unwrap();

        let outcome = merge_mapping_files(&primary, &retry).unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                primary_entries: 1,
                retry_entries: 2,
                overridden: 1,
                total: 2,
            }
        );

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&primary).unwrap()).unwrap();
        assert_eq!(written, json!({"cid1": {"song": "s1-retry"}, "cid2": {"song": "s2"}}));
        // Pretty-printed, no temp file left behind.
        assert!(std::fs::read_to_string(&primary).unwrap().contains("\n  \"cid1\""));
        assert!(!dir.path().join("batch_mapping.json.tmp").exists());
    }

    #[test]
    fn test_merge_files_skipped_when_retry_missing() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary.json");
        let retry = dir.path().join("retry.json");
        std::fs::write(&primary, r#"{"cid1":{"song":"s1"}}"#).unwrap();

        let outcome = merge_mapping_files(&primary, &retry).unwrap();
        assert_eq!(outcome, MergeOutcome::Skipped { missing: vec![retry.clone()] });
        assert_eq!(std::fs::read_to_string(&primary).unwrap(), r#"{"cid1":{"song":"s1"}}"#);
    }

    #[test]
    fn test_merge_files_skipped_when_both_missing() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = merge_mapping_files(&dir.path().join("a.json"), &dir.path().join("b.json")).unwrap();
        let MergeOutcome::Skipped { missing } = outcome else {
            panic!("expected Skipped");
        };
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn test_merge_files_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary.json");
        let retry = dir.path().join("retry.json");
        std::fs::write(&primary, "{}").unwrap();
        std::fs::write(&retry, "{oops").unwrap();

        assert!(matches!(merge_mapping_files(&primary, &retry), Err(MappingError::Json { .. })));
        assert_eq!(std::fs::read_to_string(&primary).unwrap(), "{}");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = JobMapping::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, MappingError::MissingMappingFile(_)));
    }

    #[test]
    fn test_resolve_descriptor_shapes() {
        let m = mapping(json!({
            "a": {"song": "s1"},
            "b": {"song_id": 5, "artist": "Low", "title": "Words"},
            "c": {"songs": [1, "ext-2"]},
            "d": {"artist": "nobody"},
            "e": 7,
        }));

        assert_eq!(m.resolve("a").unwrap().songs(), vec![SongRef::External("s1".into())]);
        let b = m.resolve("b").unwrap();
        assert_eq!(b.songs(), vec![SongRef::Row(5)]);
        assert_eq!(b.title.as_deref(), Some("Words"));
        assert_eq!(
            m.resolve("c").unwrap().songs(),
            vec![SongRef::Row(1), SongRef::External("ext-2".into())]
        );
        assert!(matches!(m.resolve("d"), Err(MappingError::InvalidDescriptor { .. })));
        assert!(matches!(m.resolve("e"), Err(MappingError::InvalidDescriptor { .. })));
        assert!(matches!(m.resolve("zzz"), Err(MappingError::UnknownCustomId(_))));
    }
}
