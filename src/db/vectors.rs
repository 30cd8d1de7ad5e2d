//! Vector index: one embedding row per song, keyed by `songs.id`.

use super::models::PendingEmbedding;
use super::{Database, DbError, Result};
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Store (or replace) a song's embedding and mark it COMPLETED, in one
    /// transaction. This is a genuine embedding write, not a status repair.
    pub fn upsert_embedding(&self, song_id: i64, embedding: &[f32], model: Option<&str>) -> Result<()> {
        if embedding.is_empty() {
            return Err(DbError::InvalidValue(format!("empty embedding for song {song_id}")));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(DbError::InvalidValue(format!(
                "embedding for song {song_id} contains non-finite values"
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO song_vectors (song_id, embedding, dimension, model)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(song_id) DO UPDATE SET
                embedding = excluded.embedding,
                dimension = excluded.dimension,
                model = excluded.model,
                created_at = datetime('now')",
            params![song_id, encode_embedding(embedding), embedding.len() as i64, model],
        )?;
        tx.execute(
            "UPDATE songs SET embedding_status = 'COMPLETED', updated_at = datetime('now')
             WHERE id = ?1",
            params![song_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_embedding(&self, song_id: i64) -> Result<Option<Vec<f32>>> {
        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT embedding, dimension FROM song_vectors WHERE song_id = ?1",
                params![song_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(blob, dimension)| decode_embedding(&blob, dimension as usize))
            .transpose()
    }

    /// Record that embedding failed for a song. Songs that already have a
    /// vector row keep COMPLETED. Returns whether the row changed.
    pub fn mark_embedding_failed(&self, song_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE songs SET embedding_status = 'FAILED', updated_at = datetime('now')
             WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM song_vectors v WHERE v.song_id = songs.id)",
            params![song_id],
        )?;
        Ok(changed > 0)
    }

    /// Analyzed songs that have no vector row yet, oldest analysis first.
    pub fn songs_pending_embedding(&self, limit: usize) -> Result<Vec<PendingEmbedding>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.artist, s.title, s.description
             FROM songs s
             LEFT JOIN song_vectors v ON v.song_id = s.id
             WHERE v.song_id IS NULL
               AND s.description IS NOT NULL
               AND (s.embedding_status IS NULL OR s.embedding_status != 'FAILED')
             ORDER BY s.last_analyzed_at, s.id
             LIMIT ?1",
        )?;

        let pending = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PendingEmbedding {
                    song_id: row.get(0)?,
                    artist: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(pending)
    }

    pub fn vector_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM song_vectors", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Songs present in the vector index whose status is not COMPLETED.
    pub fn count_unmarked_indexed_songs(&self) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM songs s
             JOIN song_vectors v ON v.song_id = s.id
             WHERE s.embedding_status IS NULL OR s.embedding_status != 'COMPLETED'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Songs claiming COMPLETED with no vector row.
    pub fn count_completed_without_vector(&self) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM songs s
             LEFT JOIN song_vectors v ON v.song_id = s.id
             WHERE s.embedding_status = 'COMPLETED' AND v.song_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Set COMPLETED on every indexed song that lacks it, as one transaction.
    /// Returns the number of rows changed.
    pub fn mark_indexed_songs_completed(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE songs SET embedding_status = 'COMPLETED', updated_at = datetime('now')
             WHERE id IN (SELECT song_id FROM song_vectors)
               AND (embedding_status IS NULL OR embedding_status != 'COMPLETED')",
            [],
        )?;
        tx.commit()?;
        Ok(changed)
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let expected_len = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(DbError::InvalidValue(format!(
            "invalid embedding byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
