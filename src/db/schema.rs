//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Cached synthesis results, keyed by normalized text hash
        CREATE TABLE IF NOT EXISTS cache_entries (
            text_hash TEXT PRIMARY KEY,
            source_text TEXT NOT NULL,
            audio BLOB NOT NULL,
            byte_size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            last_accessed_at INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_lru
            ON cache_entries(last_accessed_at, access_count);

        -- Singleton statistics record
        CREATE TABLE IF NOT EXISTS cache_stats (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            total_hits INTEGER NOT NULL DEFAULT 0,
            total_misses INTEGER NOT NULL DEFAULT 0,
            last_cleanup_at INTEGER
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        // Verify tables exist
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('cache_entries', 'cache_stats')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap(); // Should not fail
    }
}
