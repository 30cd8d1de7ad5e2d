pub mod models;
pub mod queries;
pub mod vectors;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Handle over the metadata store and the vector index.
///
/// Both live in one SQLite file so that cross-store repairs can run inside a
/// single transaction. The connection is closed when the handle is dropped.
pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than supported v{SCHEMA_VERSION}"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: song metadata records
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS songs (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id         TEXT NOT NULL UNIQUE,
                title               TEXT NOT NULL,
                artist              TEXT NOT NULL,

                -- AI metadata (NULL until a batch result is ingested)
                description         TEXT,
                mood                TEXT,
                tags                TEXT,           -- JSON array of '#'-prefixed strings
                ai_payload          TEXT,           -- validated AI object, verbatim

                -- PENDING | COMPLETED | FAILED, NULL = never touched
                embedding_status    TEXT CHECK (embedding_status IN ('PENDING', 'COMPLETED', 'FAILED')),
                last_analyzed_at    TEXT,

                created_at          TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_songs_artist ON songs(artist);
            CREATE INDEX IF NOT EXISTS idx_songs_embedding_status ON songs(embedding_status);
            ",
        )?;
        Ok(())
    }

    /// V2: vector index + catalog locator
    fn migrate_v2(&self) -> Result<()> {
        try_add_column(&self.conn, "songs", "locator TEXT")?;

        self.conn.execute_batch(
            "
            -- One embedding per song. The join key is the declared foreign key,
            -- not an assumed rowid alignment.
            CREATE TABLE IF NOT EXISTS song_vectors (
                song_id     INTEGER PRIMARY KEY REFERENCES songs(id) ON DELETE CASCADE,
                embedding   BLOB NOT NULL,          -- little-endian f32
                dimension   INTEGER NOT NULL,
                model       TEXT,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }
}

/// Current on-disk schema version (`PRAGMA user_version`).
pub const SCHEMA_VERSION: i32 = 2;

/// Helper: try to add a column, ignore if it already exists.
fn try_add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("duplicate column") => {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
