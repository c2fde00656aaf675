use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: u32 = 2;

pub fn apply_pragmas(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    Ok(())
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS catalog_records (
            id               TEXT PRIMARY KEY,
            title            TEXT NOT NULL,
            author           TEXT NOT NULL,
            title_key        TEXT NOT NULL,
            author_key       TEXT NOT NULL,
            series           TEXT,
            publication_year INTEGER,
            rating           REAL,
            description      TEXT,
            cover_urls       TEXT NOT NULL DEFAULT '[]',
            genres           TEXT NOT NULL DEFAULT '[]',
            tags             TEXT NOT NULL DEFAULT '[]',
            file_url         TEXT,
            file_size        INTEGER,
            file_format      TEXT CHECK(file_format IN ('fb2', 'zip')),
            source_file_id   TEXT,
            storage_path     TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK (
                (file_url IS NULL AND file_size IS NULL AND file_format IS NULL
                    AND source_file_id IS NULL AND storage_path IS NULL)
                OR
                (file_url IS NOT NULL AND file_size IS NOT NULL AND file_format IS NOT NULL
                    AND source_file_id IS NOT NULL AND storage_path IS NOT NULL)
            )
        );

        CREATE TABLE IF NOT EXISTS download_tasks (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id    INTEGER NOT NULL,
            channel_id    TEXT NOT NULL,
            file_id       TEXT,
            book_id       TEXT,
            status        TEXT NOT NULL DEFAULT 'pending'
                          CHECK(status IN ('pending', 'processing', 'completed', 'failed')),
            error_message TEXT,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            priority      INTEGER NOT NULL DEFAULT 0,
            scheduled_for TEXT NOT NULL,
            started_at    TEXT,
            completed_at  TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processed_messages (
            source_file_id TEXT NOT NULL,
            book_id        TEXT NOT NULL,
            processed_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processed_publications (
            channel_id   TEXT NOT NULL,
            message_id   INTEGER NOT NULL,
            book_id      TEXT,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (channel_id, message_id)
        );
        ",
    )?;
    Ok(())
}

pub fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_records_identity ON catalog_records(title_key, author_key);
        CREATE INDEX IF NOT EXISTS idx_records_source   ON catalog_records(source_file_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_dequeue    ON download_tasks(status, priority DESC, scheduled_for);
        CREATE INDEX IF NOT EXISTS idx_ledger_source    ON processed_messages(source_file_id);
        ",
    )?;
    Ok(())
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    create_tables(conn)?;
    create_indexes(conn)?;
    Ok(())
}
