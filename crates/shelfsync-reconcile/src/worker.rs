//! Download queue worker: one task at a time, polling when idle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shelfsync_core::{AppConfig, Database, DownloadTask};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attach::{AttachOutcome, FileAttacher, SkipReason};
use crate::blob::BlobStore;
use crate::channel::{SourceChannel, connect_with_retry, disconnect_within, fetch_message};
use crate::error::Result;
use crate::filename::{extract_from_filename, search_terms};
use crate::scorer::MatchScorer;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    /// Queue had nothing eligible.
    Idle,
    Attached { task_id: i64, book_id: Uuid },
    Skipped { task_id: i64, reason: SkipReason },
    Failed { task_id: i64, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub attached: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, result: &TaskResult) {
        match result {
            TaskResult::Idle => {}
            TaskResult::Attached { .. } => self.attached += 1,
            TaskResult::Skipped { .. } => self.skipped += 1,
            TaskResult::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct Worker {
    db: Arc<Database>,
    channel: Arc<dyn SourceChannel>,
    attacher: FileAttacher,
    scorer: MatchScorer,
    candidate_limit: usize,
    connect_retries: u32,
    poll_interval: Duration,
    shutdown_secs: u64,
}

impl Worker {
    pub fn new(
        db: Arc<Database>,
        channel: Arc<dyn SourceChannel>,
        blobs: Arc<dyn BlobStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            attacher: FileAttacher::new(db.clone(), blobs, config),
            scorer: MatchScorer::from_config(&config.matching),
            candidate_limit: config.matching.candidate_limit,
            connect_retries: config.channel.connect_retries,
            poll_interval: Duration::from_secs(config.worker.poll_interval_secs.max(1)),
            shutdown_secs: config.timeouts.shutdown_secs,
            db,
            channel,
        }
    }

    /// Take at most one task off the queue and settle it.
    ///
    /// Only queue bookkeeping errors are returned; everything that goes
    /// wrong while handling the task marks the task failed instead.
    pub async fn run_once(&self) -> Result<TaskResult> {
        let Some(task) = self.db.dequeue_next()? else {
            return Ok(TaskResult::Idle);
        };
        info!(
            task = task.id,
            message = task.message_id,
            channel = %task.channel_id,
            "processing download task"
        );

        let result = match self.handle(&task).await {
            Ok((book_id, AttachOutcome::Attached(_))) => {
                self.db.complete_task(task.id, true, None)?;
                TaskResult::Attached {
                    task_id: task.id,
                    book_id,
                }
            }
            Ok((_, AttachOutcome::Skipped(reason))) => {
                self.db.complete_task(task.id, true, Some(reason.as_str()))?;
                TaskResult::Skipped {
                    task_id: task.id,
                    reason,
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let message = e.to_string();
                warn!(task = task.id, retryable, error = %message, "download task failed");
                self.db.complete_task(task.id, false, Some(&message))?;
                TaskResult::Failed {
                    task_id: task.id,
                    error: message,
                }
            }
        };
        Ok(result)
    }

    async fn handle(&self, task: &DownloadTask) -> Result<(Uuid, AttachOutcome)> {
        connect_with_retry(self.channel.as_ref(), self.connect_retries).await?;
        let channel = self.channel.resolve_channel(&task.channel_id).await?;

        let no_document = (task.book_id.unwrap_or_default(), AttachOutcome::Skipped(SkipReason::NoDocument));
        let Some(message) = fetch_message(self.channel.as_ref(), &channel, task.message_id).await? else {
            return Ok(no_document);
        };
        let Some(document) = message.document(task.file_id.as_deref()) else {
            return Ok(no_document);
        };

        let book_id = match task.book_id {
            Some(id) => id,
            None => match self.resolve_book(&document.file_name)? {
                Ok(id) => id,
                Err(reason) => return Ok((Uuid::nil(), AttachOutcome::Skipped(reason))),
            },
        };

        let outcome = self
            .attacher
            .attach(self.channel.as_ref(), &channel, book_id, document)
            .await?;
        Ok((book_id, outcome))
    }

    /// Match a file name to a catalog record.
    fn resolve_book(&self, file_name: &str) -> Result<std::result::Result<Uuid, SkipReason>> {
        let extracted = extract_from_filename(file_name);
        let terms = search_terms(file_name);
        let candidates = self.db.search_candidates(&terms, self.candidate_limit)?;
        if candidates.is_empty() {
            return Ok(Err(SkipReason::BookNotImported));
        }
        Ok(match self.scorer.best_match(&extracted, &terms, &candidates) {
            Some(best) => {
                debug!(file = file_name, book = %best.record.id, score = best.score, "matched file");
                Ok(best.record.id)
            }
            None => Err(SkipReason::NoMatchingBook),
        })
    }

    /// Poll the queue until `shutdown` turns true, then disconnect.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(poll_secs = self.poll_interval.as_secs(), "worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(result) => {
                    stats.record(&result);
                    result == TaskResult::Idle
                }
                Err(e) => {
                    error!(error = %e, "queue error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = disconnect_within(self.channel.as_ref(), self.shutdown_secs).await {
            warn!(error = %e, "channel shutdown failed");
        }
        info!(
            attached = stats.attached,
            skipped = stats.skipped,
            failed = stats.failed,
            "worker stopped"
        );
        stats
    }
}
