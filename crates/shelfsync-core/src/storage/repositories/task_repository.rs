use std::str::FromStr;
use std::sync::MutexGuard;

use chrono::{Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{CatalogError, Result};
use crate::models::{DownloadTask, NewTask, TaskStatus};
use crate::storage::{from_sql_ts, from_sql_ts_opt, from_sql_uuid, to_sql_ts};

/// The durable download queue.
///
/// `dequeue_next` and `complete` are single SQL statements, so a task moves
/// between states atomically no matter how many connections contend for it.
pub trait TaskRepository {
    fn enqueue(&self, task: &NewTask) -> Result<i64>;
    fn dequeue_next(&self) -> Result<Option<DownloadTask>>;
    fn complete(&self, task_id: i64, success: bool, error_message: Option<&str>) -> Result<DownloadTask>;
    fn find_by_id(&self, task_id: i64) -> Result<Option<DownloadTask>>;
    /// Re-queue a failed task as a fresh pending task; the failed one stays for audit.
    fn retry(&self, task_id: i64, delay: Duration) -> Result<i64>;
    /// Fail `processing` tasks whose worker vanished before completing them.
    fn reset_stuck(&self, older_than: Duration) -> Result<usize>;
    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<DownloadTask>>;
    fn counts_by_status(&self) -> Result<Vec<(TaskStatus, usize)>>;
}

pub struct SqliteTaskRepository<'a> {
    conn: MutexGuard<'a, Connection>,
}

const TASK_COLUMNS: &str = "id, message_id, channel_id, file_id, book_id, status, error_message,
     retry_count, priority, scheduled_for, started_at, completed_at, created_at, updated_at";

impl<'a> SqliteTaskRepository<'a> {
    pub fn new(conn: MutexGuard<'a, Connection>) -> Self {
        Self { conn }
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<DownloadTask> {
        let status: String = row.get(5)?;
        let book_id: Option<String> = row.get(4)?;

        Ok(DownloadTask {
            id: row.get(0)?,
            message_id: row.get(1)?,
            channel_id: row.get(2)?,
            file_id: row.get(3)?,
            book_id: book_id.map(|raw| from_sql_uuid(4, &raw)).transpose()?,
            status: TaskStatus::from_str(&status).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into())
            })?,
            error_message: row.get(6)?,
            retry_count: row.get::<_, i64>(7)?.max(0) as u32,
            priority: row.get(8)?,
            scheduled_for: from_sql_ts(9, &row.get::<_, String>(9)?)?,
            started_at: from_sql_ts_opt(10, row.get(10)?)?,
            completed_at: from_sql_ts_opt(11, row.get(11)?)?,
            created_at: from_sql_ts(12, &row.get::<_, String>(12)?)?,
            updated_at: from_sql_ts(13, &row.get::<_, String>(13)?)?,
        })
    }
}

impl<'a> TaskRepository for SqliteTaskRepository<'a> {
    fn enqueue(&self, task: &NewTask) -> Result<i64> {
        let now = Utc::now();
        let scheduled_for = task.scheduled_for.unwrap_or(now);
        self.conn.execute(
            "INSERT INTO download_tasks
                (message_id, channel_id, file_id, book_id, status, retry_count, priority,
                 scheduled_for, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?8)",
            params![
                task.message_id,
                task.channel_id,
                task.file_id,
                task.book_id.as_ref().map(Uuid::to_string),
                task.retry_count as i64,
                task.priority,
                to_sql_ts(&scheduled_for),
                to_sql_ts(&now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn dequeue_next(&self) -> Result<Option<DownloadTask>> {
        let sql = format!(
            "UPDATE download_tasks
                SET status = 'processing', started_at = ?1, updated_at = ?1
              WHERE status = 'pending'
                AND id = (
                    SELECT id FROM download_tasks
                     WHERE status = 'pending' AND scheduled_for <= ?1
                     ORDER BY priority DESC, scheduled_for ASC, id ASC
                     LIMIT 1
                )
             RETURNING {TASK_COLUMNS}"
        );
        let task = self
            .conn
            .query_row(&sql, params![to_sql_ts(&Utc::now())], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    fn complete(&self, task_id: i64, success: bool, error_message: Option<&str>) -> Result<DownloadTask> {
        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let sql = format!(
            "UPDATE download_tasks
                SET status = ?2,
                    error_message = ?3,
                    completed_at = ?4,
                    updated_at = ?4,
                    retry_count = retry_count + ?5
              WHERE id = ?1 AND status = 'processing'
             RETURNING {TASK_COLUMNS}"
        );
        let completed = self
            .conn
            .query_row(
                &sql,
                params![
                    task_id,
                    target.to_string(),
                    error_message,
                    to_sql_ts(&Utc::now()),
                    if success { 0 } else { 1 },
                ],
                Self::row_to_task,
            )
            .optional()?;

        match completed {
            Some(task) => Ok(task),
            None => match self.find_by_id(task_id)? {
                Some(current) => Err(CatalogError::InvalidTransition {
                    task_id,
                    from: current.status.to_string(),
                    to: target.to_string(),
                }),
                None => Err(CatalogError::TaskNotFound(task_id)),
            },
        }
    }

    fn find_by_id(&self, task_id: i64) -> Result<Option<DownloadTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM download_tasks WHERE id = ?1");
        let task = self
            .conn
            .query_row(&sql, params![task_id], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    fn retry(&self, task_id: i64, delay: Duration) -> Result<i64> {
        let task = self
            .find_by_id(task_id)?
            .ok_or(CatalogError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Failed {
            return Err(CatalogError::InvalidTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }

        let mut fresh = NewTask::new(task.message_id, task.channel_id)
            .with_priority(task.priority)
            .scheduled_at(Utc::now() + delay);
        fresh.file_id = task.file_id;
        fresh.book_id = task.book_id;
        fresh.retry_count = task.retry_count;
        self.enqueue(&fresh)
    }

    fn reset_stuck(&self, older_than: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - older_than;
        let updated = self.conn.execute(
            "UPDATE download_tasks
                SET status = 'failed', error_message = 'stuck', completed_at = ?2,
                    updated_at = ?2, retry_count = retry_count + 1
              WHERE status = 'processing' AND started_at < ?1",
            params![to_sql_ts(&cutoff), to_sql_ts(&now)],
        )?;
        Ok(updated)
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<DownloadTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM download_tasks
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.to_string()), limit as i64],
                Self::row_to_task,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn counts_by_status(&self) -> Result<Vec<(TaskStatus, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM download_tasks GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = TaskStatus::from_str(&status) {
                counts.push((status, count as usize));
            }
        }
        Ok(counts)
    }
}
