use super::models::{CatalogStats, EmbeddingStatus, NewSong, Song, SongAnalysis, SongRef};
use super::{Database, DbError, Result};
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Insert or update a song keyed by its external catalog id. Returns the row id.
    /// AI metadata and embedding status are left untouched on update.
    pub fn upsert_song(&self, s: &NewSong) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO songs (external_id, title, artist, locator, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(external_id) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                locator = excluded.locator,
                updated_at = datetime('now')",
            params![s.external_id, s.title, s.artist, s.locator],
        )?;

        let id: i64 = self.conn.query_row(
            "SELECT id FROM songs WHERE external_id = ?1",
            params![s.external_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Insert or update many songs in one transaction. Returns the number written.
    pub fn import_songs(&self, songs: &[NewSong]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO songs (external_id, title, artist, locator, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(external_id) DO UPDATE SET
                    title = excluded.title,
                    artist = excluded.artist,
                    locator = excluded.locator,
                    updated_at = datetime('now')",
            )?;
            for s in songs {
                stmt.execute(params![s.external_id, s.title, s.artist, s.locator])?;
            }
        }
        tx.commit()?;
        Ok(songs.len())
    }

    /// Resolve a job descriptor's song reference to a row id.
    pub fn find_song_id(&self, song: &SongRef) -> Result<Option<i64>> {
        let id = match song {
            SongRef::Row(id) => self
                .conn
                .query_row("SELECT id FROM songs WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?,
            SongRef::External(ext) => self
                .conn
                .query_row(
                    "SELECT id FROM songs WHERE external_id = ?1",
                    params![ext],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(id)
    }

    pub fn get_song(&self, id: i64) -> Result<Option<Song>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, external_id, title, artist, locator, description, mood, tags,
                        ai_payload, embedding_status, last_analyzed_at
                 FROM songs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        Song {
                            id: row.get(0)?,
                            external_id: row.get(1)?,
                            title: row.get(2)?,
                            artist: row.get(3)?,
                            locator: row.get(4)?,
                            description: row.get(5)?,
                            mood: row.get(6)?,
                            tags: Vec::new(),
                            ai_payload: row.get(8)?,
                            embedding_status: None,
                            last_analyzed_at: row.get(10)?,
                        },
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((mut song, tags, status)) = raw else {
            return Ok(None);
        };
        if let Some(tags) = tags {
            song.tags = serde_json::from_str(&tags)
                .map_err(|e| DbError::InvalidValue(format!("tags for song {id}: {e}")))?;
        }
        song.embedding_status = EmbeddingStatus::from_column(status)?;
        Ok(Some(song))
    }

    /// Store one validated analysis (used within a transaction).
    ///
    /// Queues the song for embedding (`PENDING`) unless it already has a vector
    /// row, in which case the status is left alone: a vector row and a
    /// non-COMPLETED status must never be written together here.
    pub fn store_song_analysis(
        conn: &rusqlite::Connection,
        song_id: i64,
        a: &SongAnalysis,
        analyzed_at: &str,
    ) -> Result<()> {
        let tags = serde_json::to_string(&a.tags)
            .map_err(|e| DbError::InvalidValue(format!("tags for song {song_id}: {e}")))?;
        let payload = a.payload.to_string();

        let updated = conn.execute(
            "UPDATE songs SET
                description = ?2,
                mood = ?3,
                tags = ?4,
                ai_payload = ?5,
                last_analyzed_at = ?6,
                embedding_status = CASE
                    WHEN EXISTS (SELECT 1 FROM song_vectors v WHERE v.song_id = songs.id)
                        THEN embedding_status
                    ELSE 'PENDING'
                END,
                updated_at = datetime('now')
             WHERE id = ?1",
            params![song_id, a.description, a.mood, tags, payload, analyzed_at],
        )?;

        if updated == 0 {
            return Err(DbError::InvalidValue(format!("song {song_id} does not exist")));
        }
        Ok(())
    }

    /// Store a set of analyses in a single transaction: all or nothing.
    pub fn store_analyses(&self, analyses: &[(i64, SongAnalysis)], analyzed_at: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (song_id, a) in analyses {
            Self::store_song_analysis(&tx, *song_id, a, analyzed_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get catalog statistics.
    pub fn stats(&self) -> Result<CatalogStats> {
        let total_songs: i64 = self.conn.query_row("SELECT COUNT(*) FROM songs", [], |row| row.get(0))?;

        let analyzed_songs: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM songs WHERE last_analyzed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let vectors = self.vector_count()?;

        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(embedding_status, 'unset'), COUNT(*)
             FROM songs
             GROUP BY COALESCE(embedding_status, 'unset')
             ORDER BY COUNT(*) DESC",
        )?;
        let statuses: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(CatalogStats {
            total_songs,
            analyzed_songs,
            vectors,
            statuses,
        })
    }
}
