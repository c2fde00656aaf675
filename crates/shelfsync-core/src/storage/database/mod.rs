mod connection;
mod migrations;
mod schema;

pub use connection::{ConnectionPool, DEFAULT_BUSY_TIMEOUT_MS};
pub use migrations::{Migration, get_applied_versions, run_migrations};
pub use schema::{SCHEMA_VERSION, init_schema};

use std::path::Path;

use chrono::Duration;
use uuid::Uuid;

use crate::error::{CatalogError, Result};
use crate::models::{
    CatalogRecord, DownloadTask, FileAttachment, LedgerEntry, NewTask, ProcessedPublication,
    TaskStatus,
};

use super::repositories::{
    LedgerRepository, RecordRepository, Repository, SqliteLedgerRepository,
    SqliteRecordRepository, SqliteTaskRepository, TaskRepository,
};

pub fn open_database(path: &Path, busy_timeout_ms: u64) -> Result<ConnectionPool> {
    let pool = ConnectionPool::open(path, busy_timeout_ms)?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}

pub fn open_in_memory() -> Result<ConnectionPool> {
    let pool = ConnectionPool::open_in_memory()?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}

/// The catalog database: records, the download queue, and the ledger.
///
/// Every method takes the connection lock for the duration of one call only,
/// so a `Database` can be shared behind an `Arc` by async tasks.
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let pool = open_database(path, busy_timeout_ms)?;
        Ok(Self { pool })
    }

    pub fn open_in_memory() -> Result<Self> {
        let pool = open_in_memory()?;
        Ok(Self { pool })
    }

    pub fn path(&self) -> Option<&str> {
        self.pool.path()
    }

    /// The underlying connection, for statements the facade does not cover.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn schema_versions(&self) -> Result<Vec<u32>> {
        let conn = self.pool.get_connection();
        migrations::get_applied_versions(&conn)
    }

    fn records(&self) -> SqliteRecordRepository<'_> {
        SqliteRecordRepository::new(self.pool.get_connection())
    }

    fn tasks(&self) -> SqliteTaskRepository<'_> {
        SqliteTaskRepository::new(self.pool.get_connection())
    }

    fn ledger(&self) -> SqliteLedgerRepository<'_> {
        SqliteLedgerRepository::new(self.pool.get_connection())
    }

    // ─── Catalog records ────────────────────────────────────

    pub fn upsert_record(&self, record: &CatalogRecord) -> Result<()> {
        self.records().save(record)
    }

    pub fn find_record(&self, id: &Uuid) -> Result<Option<CatalogRecord>> {
        self.records().find_by_id(id)
    }

    pub fn get_record(&self, id: &Uuid) -> Result<CatalogRecord> {
        self.find_record(id)?
            .ok_or_else(|| CatalogError::RecordNotFound(id.to_string()))
    }

    pub fn find_by_identity(&self, title: &str, author: &str) -> Result<Vec<CatalogRecord>> {
        self.records().find_by_identity(title, author)
    }

    pub fn search_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<CatalogRecord>> {
        self.records().search_candidates(terms, limit)
    }

    pub fn attach_file(&self, id: &Uuid, file: &FileAttachment) -> Result<bool> {
        self.records().attach_file(id, file)
    }

    /// Fill empty metadata columns from `record` without touching its file.
    pub fn fill_record_metadata(&self, record: &CatalogRecord) -> Result<()> {
        if !self.records().fill_metadata(record)? {
            return Err(CatalogError::RecordNotFound(record.id.to_string()));
        }
        Ok(())
    }

    pub fn delete_record(&self, id: &Uuid) -> Result<()> {
        if !self.records().delete(id)? {
            return Err(CatalogError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete_records(&self, ids: &[Uuid]) -> Result<usize> {
        self.records().delete_many(ids)
    }

    pub fn list_records(&self, limit: usize, offset: usize) -> Result<Vec<CatalogRecord>> {
        self.records().list(limit, offset)
    }

    pub fn count_records(&self) -> Result<usize> {
        self.records().count()
    }

    pub fn count_records_with_files(&self) -> Result<usize> {
        self.records().count_with_files()
    }

    // ─── Download queue ─────────────────────────────────────

    pub fn enqueue(&self, task: &NewTask) -> Result<i64> {
        self.tasks().enqueue(task)
    }

    pub fn dequeue_next(&self) -> Result<Option<DownloadTask>> {
        self.tasks().dequeue_next()
    }

    pub fn complete_task(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<DownloadTask> {
        self.tasks().complete(task_id, success, error_message)
    }

    pub fn find_task(&self, task_id: i64) -> Result<Option<DownloadTask>> {
        self.tasks().find_by_id(task_id)
    }

    pub fn retry_task(&self, task_id: i64, delay: Duration) -> Result<i64> {
        self.tasks().retry(task_id, delay)
    }

    pub fn reset_stuck_tasks(&self, older_than: Duration) -> Result<usize> {
        self.tasks().reset_stuck(older_than)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<DownloadTask>> {
        self.tasks().list(status, limit)
    }

    pub fn task_counts(&self) -> Result<Vec<(TaskStatus, usize)>> {
        self.tasks().counts_by_status()
    }

    // ─── Ledger ─────────────────────────────────────────────

    pub fn is_source_file_processed(&self, source_file_id: &str) -> Result<bool> {
        self.ledger().contains_source_file(source_file_id)
    }

    pub fn ledger_entry_for_book(&self, book_id: &Uuid) -> Result<Option<LedgerEntry>> {
        self.ledger().find_by_book(book_id)
    }

    pub fn record_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        self.ledger().record(entry)
    }

    pub fn list_ledger(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.ledger().list(limit)
    }

    pub fn count_ledger(&self) -> Result<usize> {
        self.ledger().count()
    }

    pub fn is_publication_processed(&self, channel_id: &str, message_id: i64) -> Result<bool> {
        self.ledger().is_publication_processed(channel_id, message_id)
    }

    pub fn mark_publication_processed(
        &self,
        channel_id: &str,
        message_id: i64,
        book_id: Option<&Uuid>,
    ) -> Result<bool> {
        self.ledger().mark_publication(channel_id, message_id, book_id)
    }

    pub fn find_processed_publication(
        &self,
        channel_id: &str,
        message_id: i64,
    ) -> Result<Option<ProcessedPublication>> {
        self.ledger().find_publication(channel_id, message_id)
    }
}
