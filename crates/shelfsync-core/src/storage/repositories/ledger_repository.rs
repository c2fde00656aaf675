use std::sync::MutexGuard;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{LedgerEntry, ProcessedPublication};
use crate::storage::{from_sql_ts, from_sql_uuid, to_sql_ts};

/// Idempotency barrier for file attachment and publication processing.
pub trait LedgerRepository {
    fn contains_source_file(&self, source_file_id: &str) -> Result<bool>;
    fn find_by_book(&self, book_id: &Uuid) -> Result<Option<LedgerEntry>>;
    /// Append an entry. Returns `false` when the file or the book is already ledgered.
    fn record(&self, entry: &LedgerEntry) -> Result<bool>;
    fn list(&self, limit: usize) -> Result<Vec<LedgerEntry>>;
    fn count(&self) -> Result<usize>;

    fn is_publication_processed(&self, channel_id: &str, message_id: i64) -> Result<bool>;
    fn mark_publication(&self, channel_id: &str, message_id: i64, book_id: Option<&Uuid>) -> Result<bool>;
    fn find_publication(&self, channel_id: &str, message_id: i64) -> Result<Option<ProcessedPublication>>;
}

pub struct SqliteLedgerRepository<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl<'a> SqliteLedgerRepository<'a> {
    pub fn new(conn: MutexGuard<'a, Connection>) -> Self {
        Self { conn }
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
        Ok(LedgerEntry {
            source_file_id: row.get(0)?,
            book_id: from_sql_uuid(1, &row.get::<_, String>(1)?)?,
            processed_at: from_sql_ts(2, &row.get::<_, String>(2)?)?,
        })
    }
}

impl<'a> LedgerRepository for SqliteLedgerRepository<'a> {
    fn contains_source_file(&self, source_file_id: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM processed_messages WHERE source_file_id = ?1")?
            .exists(params![source_file_id])?;
        Ok(exists)
    }

    fn find_by_book(&self, book_id: &Uuid) -> Result<Option<LedgerEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT source_file_id, book_id, processed_at
                   FROM processed_messages WHERE book_id = ?1",
                params![book_id.to_string()],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn record(&self, entry: &LedgerEntry) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO processed_messages (source_file_id, book_id, processed_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.source_file_id,
                entry.book_id.to_string(),
                to_sql_ts(&entry.processed_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn list(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_file_id, book_id, processed_at
               FROM processed_messages ORDER BY processed_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM processed_messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn is_publication_processed(&self, channel_id: &str, message_id: i64) -> Result<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM processed_publications WHERE channel_id = ?1 AND message_id = ?2")?
            .exists(params![channel_id, message_id])?;
        Ok(exists)
    }

    fn mark_publication(&self, channel_id: &str, message_id: i64, book_id: Option<&Uuid>) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO processed_publications (channel_id, message_id, book_id, processed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                channel_id,
                message_id,
                book_id.map(Uuid::to_string),
                to_sql_ts(&Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn find_publication(&self, channel_id: &str, message_id: i64) -> Result<Option<ProcessedPublication>> {
        let publication = self
            .conn
            .query_row(
                "SELECT channel_id, message_id, book_id, processed_at
                   FROM processed_publications WHERE channel_id = ?1 AND message_id = ?2",
                params![channel_id, message_id],
                |row| {
                    let book_id: Option<String> = row.get(2)?;
                    Ok(ProcessedPublication {
                        channel_id: row.get(0)?,
                        message_id: row.get(1)?,
                        book_id: book_id.map(|raw| from_sql_uuid(2, &raw)).transpose()?,
                        processed_at: from_sql_ts(3, &row.get::<_, String>(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(publication)
    }
}
