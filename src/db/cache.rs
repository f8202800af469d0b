//! Response cache repository

use rusqlite::{OptionalExtension, params};

use super::{DbConn, DbPool};
use crate::cache::{CacheBackend, EntryRecord, StatsRecord};
use crate::{Error, Result};

const ENTRY_COLUMNS: &str =
    "text_hash, source_text, byte_size, created_at, last_accessed_at, access_count";

fn to_db(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_db(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

/// Every durable-store failure surfaces as `Error::Persistence`
fn persistence(e: impl std::fmt::Display) -> Error {
    Error::Persistence(e.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRecord> {
    Ok(EntryRecord {
        text_hash: row.get(0)?,
        source_text: row.get(1)?,
        byte_size: from_db(row.get(2)?),
        created_at: row.get(3)?,
        last_accessed_at: row.get(4)?,
        access_count: from_db(row.get(5)?),
    })
}

/// `SQLite`-backed durable store for the response cache
#[derive(Clone)]
pub struct CacheRepo {
    pool: DbPool,
}

impl CacheRepo {
    /// Create a new cache repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(persistence)
    }

    #[cfg(test)]
    fn find(&self, text_hash: &str) -> Result<Option<EntryRecord>> {
        self.conn()?
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE text_hash = ?1"),
                [text_hash],
                row_to_record,
            )
            .optional()
            .map_err(persistence)
    }
}

impl CacheBackend for CacheRepo {
    fn put(&self, record: &EntryRecord, audio: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r"INSERT INTO cache_entries (text_hash, source_text, audio, byte_size, created_at, last_accessed_at, access_count)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
              ON CONFLICT(text_hash) DO UPDATE SET
                source_text = excluded.source_text,
                audio = excluded.audio,
                byte_size = excluded.byte_size,
                created_at = excluded.created_at,
                last_accessed_at = excluded.last_accessed_at,
                access_count = excluded.access_count",
            params![
                record.text_hash,
                record.source_text,
                audio,
                to_db(record.byte_size),
                record.created_at,
                record.last_accessed_at,
                to_db(record.access_count),
            ],
        )
        .map_err(persistence)?;
        Ok(())
    }

    fn audio(&self, text_hash: &str) -> Result<Option<Vec<u8>>> {
        self.conn()?
            .query_row(
                "SELECT audio FROM cache_entries WHERE text_hash = ?1",
                [text_hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)
    }

    fn touch(&self, text_hash: &str, last_accessed_at: i64, access_count: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cache_entries SET last_accessed_at = ?1, access_count = ?2 WHERE text_hash = ?3",
            params![last_accessed_at, to_db(access_count), text_hash],
        )
        .map_err(persistence)?;
        Ok(())
    }

    fn delete(&self, text_hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_entries WHERE text_hash = ?1", [text_hash])
            .map_err(persistence)?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<EntryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM cache_entries ORDER BY last_accessed_at DESC"
            ))
            .map_err(persistence)?;

        let records = stmt
            .query_map([], row_to_record)
            .map_err(persistence)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence)?;
        Ok(records)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cache_entries", []).map_err(persistence)?;
        Ok(())
    }

    fn load_stats(&self) -> Result<Option<StatsRecord>> {
        self.conn()?
            .query_row(
                "SELECT total_hits, total_misses, last_cleanup_at FROM cache_stats WHERE id = 1",
                [],
                |row| {
                    Ok(StatsRecord {
                        total_hits: from_db(row.get(0)?),
                        total_misses: from_db(row.get(1)?),
                        last_cleanup_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(persistence)
    }

    fn save_stats(&self, stats: &StatsRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r"INSERT INTO cache_stats (id, total_hits, total_misses, last_cleanup_at)
              VALUES (1, ?1, ?2, ?3)
              ON CONFLICT(id) DO UPDATE SET
                total_hits = excluded.total_hits,
                total_misses = excluded.total_misses,
                last_cleanup_at = excluded.last_cleanup_at",
            params![
                to_db(stats.total_hits),
                to_db(stats.total_misses),
                stats.last_cleanup_at
            ],
        )
        .map_err(persistence)?;
        Ok(())
    }
}
