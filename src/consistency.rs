//! Reconcile `songs.embedding_status` with the vector index.
//!
//! The index is the source of truth. Repair only ever moves indexed songs to
//! COMPLETED; songs claiming COMPLETED without a vector are reported, never
//! touched.

use crate::db::{Database, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RepairResult {
    /// Rows changed, or in a dry run, rows that would change.
    pub updated: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub vectors: i64,
    /// Indexed songs whose status is not COMPLETED. Fixed by repair.
    pub unmarked_indexed: i64,
    /// COMPLETED songs with no vector. Report only.
    pub completed_without_vector: i64,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.unmarked_indexed == 0 && self.completed_without_vector == 0
    }
}

pub fn drift_report(db: &Database) -> Result<DriftReport> {
    Ok(DriftReport {
        vectors: db.vector_count()?,
        unmarked_indexed: db.count_unmarked_indexed_songs()?,
        completed_without_vector: db.count_completed_without_vector()?,
    })
}

/// Mark every song present in the vector index COMPLETED.
///
/// One transaction; a second run changes nothing.
pub fn repair_embedding_status(db: &Database, dry_run: bool) -> Result<RepairResult> {
    if dry_run {
        let pending = db.count_unmarked_indexed_songs()?;
        log::info!("Dry run: {} songs would be marked COMPLETED", pending);
        return Ok(RepairResult {
            updated: pending as usize,
            dry_run,
        });
    }

    let updated = db.mark_indexed_songs_completed()?;
    if updated > 0 {
        log::info!("Marked {} indexed songs COMPLETED", updated);
    } else {
        log::debug!("Embedding status already consistent with vector index");
    }

    let orphaned = db.count_completed_without_vector()?;
    if orphaned > 0 {
        log::warn!("{} songs are COMPLETED but have no vector; left unchanged", orphaned);
    }

    Ok(RepairResult { updated, dry_run })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EmbeddingStatus;
    use crate::db::queries::tests::test_song;
    use rusqlite::params;

    /// A vector row written behind the status column's back, as a crashed
    /// embedding worker would leave it.
    fn insert_raw_vector(db: &Database, song_id: i64) {
        db.conn
            .execute(
                "INSERT INTO song_vectors (song_id, embedding, dimension) VALUES (?1, ?2, 1)",
                params![song_id, 1.0f32.to_le_bytes().to_vec()],
            )
            .unwrap();
    }

    fn set_status(db: &Database, song_id: i64, status: Option<&str>) {
        db.conn
            .execute(
                "UPDATE songs SET embedding_status = ?1 WHERE id = ?2",
                params![status, song_id],
            )
            .unwrap();
    }

    fn status(db: &Database, song_id: i64) -> Option<EmbeddingStatus> {
        db.get_song(song_id).unwrap().unwrap().embedding_status
    }

    #[test]
    fn test_repair_marks_indexed_song() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO songs (id, external_id, title, artist) VALUES (5, 'ext-5', 'Song', 'Band')",
                [],
            )
            .unwrap();
        insert_raw_vector(&db, 5);
        assert_eq!(status(&db, 5), None);

        let result = repair_embedding_status(&db, false).unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(status(&db, 5), Some(EmbeddingStatus::Completed));
    }

    #[test]
    fn test_repair_idempotent() {
        let db = Database::open_in_memory().unwrap();
        for ext in ["a", "b", "c"] {
            let id = db.upsert_song(&test_song(ext)).unwrap();
            insert_raw_vector(&db, id);
        }

        assert_eq!(repair_embedding_status(&db, false).unwrap().updated, 3);
        assert_eq!(repair_embedding_status(&db, false).unwrap().updated, 0);
        assert!(drift_report(&db).unwrap().is_consistent());
    }

    #[test]
    fn test_repair_fixes_failed_and_unset() {
        let db = Database::open_in_memory().unwrap();
        let failed = db.upsert_song(&test_song("failed")).unwrap();
        let unset = db.upsert_song(&test_song("unset")).unwrap();
        set_status(&db, failed, Some("FAILED"));
        insert_raw_vector(&db, failed);
        insert_raw_vector(&db, unset);

        assert_eq!(repair_embedding_status(&db, false).unwrap().updated, 2);
        assert_eq!(status(&db, failed), Some(EmbeddingStatus::Completed));
        assert_eq!(status(&db, unset), Some(EmbeddingStatus::Completed));
    }

    #[test]
    fn test_repair_leaves_unindexed_songs_alone() {
        let db = Database::open_in_memory().unwrap();
        let pending = db.upsert_song(&test_song("pending")).unwrap();
        let claims_done = db.upsert_song(&test_song("claims-done")).unwrap();
        let indexed = db.upsert_song(&test_song("indexed")).unwrap();
        set_status(&db, pending, Some("PENDING"));
        set_status(&db, claims_done, Some("COMPLETED"));
        set_status(&db, indexed, Some("COMPLETED"));
        insert_raw_vector(&db, indexed);

        let before = drift_report(&db).unwrap();
        assert_eq!(before.unmarked_indexed, 0);
        assert_eq!(before.completed_without_vector, 1);

        assert_eq!(repair_embedding_status(&db, false).unwrap().updated, 0);
        assert_eq!(status(&db, pending), Some(EmbeddingStatus::Pending));
        assert_eq!(status(&db, claims_done), Some(EmbeddingStatus::Completed));
        assert_eq!(status(&db, indexed), Some(EmbeddingStatus::Completed));
        assert_eq!(drift_report(&db).unwrap(), before);
    }

    #[test]
    fn test_repair_dry_run() {
        let db = Database::open_in_memory().unwrap();
        let id = db.upsert_song(&test_song("a")).unwrap();
        set_status(&db, id, Some("PENDING"));
        insert_raw_vector(&db, id);

        let result = repair_embedding_status(&db, true).unwrap();
        assert_eq!(result, RepairResult { updated: 1, dry_run: true });
        assert_eq!(status(&db, id), Some(EmbeddingStatus::Pending));
    }

    #[test]
    fn test_repair_empty_store() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(repair_embedding_status(&db, false).unwrap().updated, 0);
        assert_eq!(
            drift_report(&db).unwrap(),
            DriftReport {
                vectors: 0,
                unmarked_indexed: 0,
                completed_without_vector: 0,
            }
        );
    }
}
