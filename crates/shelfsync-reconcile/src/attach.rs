//! Moving a channel document onto a catalog record, exactly once.

use std::sync::Arc;

use serde::Serialize;
use shelfsync_core::{AppConfig, Database, FileAttachment, FileFormat, LedgerEntry};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::{BlobStore, sanitize_file_name};
use crate::channel::{ChannelRef, DocumentRef, SourceChannel};
use crate::error::{Result, with_timeout};

/// Why a file was not attached. These are outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BookNotFound,
    NoMatchingBook,
    BookNotImported,
    AlreadyProcessed,
    BookAlreadyHasFile,
    UnsupportedFormat,
    NoDocument,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookNotFound => "book_not_found",
            Self::NoMatchingBook => "no_matching_book",
            Self::BookNotImported => "book_not_imported",
            Self::AlreadyProcessed => "already_processed",
            Self::BookAlreadyHasFile => "book_already_has_file",
            Self::UnsupportedFormat => "unsupported_format",
            Self::NoDocument => "no_document",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachOutcome {
    Attached(FileAttachment),
    Skipped(SkipReason),
}

pub struct FileAttacher {
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    bucket: String,
    download_secs: u64,
    upload_secs: u64,
}

impl FileAttacher {
    pub fn new(db: Arc<Database>, blobs: Arc<dyn BlobStore>, config: &AppConfig) -> Self {
        Self {
            db,
            blobs,
            bucket: config.blob.bucket.clone(),
            download_secs: config.timeouts.download_secs,
            upload_secs: config.timeouts.upload_secs,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Download `document` from the channel, store it, and point `book_id` at it.
    ///
    /// Ledgered files and books that already carry a file are skipped before
    /// any transfer. If the upload succeeds but the record cannot take the
    /// file, the uploaded object is removed again.
    pub async fn attach(
        &self,
        source: &dyn SourceChannel,
        channel: &ChannelRef,
        book_id: Uuid,
        document: &DocumentRef,
    ) -> Result<AttachOutcome> {
        if self.db.is_source_file_processed(&document.file_id)? {
            return Ok(AttachOutcome::Skipped(SkipReason::AlreadyProcessed));
        }

        let Some(record) = self.db.find_record(&book_id)? else {
            return Ok(AttachOutcome::Skipped(SkipReason::BookNotFound));
        };
        if record.has_file() || self.db.ledger_entry_for_book(&book_id)?.is_some() {
            return Ok(AttachOutcome::Skipped(SkipReason::BookAlreadyHasFile));
        }

        let Some(format) = FileFormat::from_file_name(&document.file_name) else {
            return Ok(AttachOutcome::Skipped(SkipReason::UnsupportedFormat));
        };

        let bytes = with_timeout(
            "download",
            self.download_secs,
            source.download_media(channel, &document.file_id),
        )
        .await?;
        let file_size = bytes.len() as u64;

        let key = format!("books/{book_id}/{}", sanitize_file_name(&document.file_name));
        with_timeout(
            "upload",
            self.upload_secs,
            self.blobs
                .put(&self.bucket, &key, bytes, format.content_type(), true),
        )
        .await?;

        let file = FileAttachment {
            file_url: self.blobs.public_url(&self.bucket, &key),
            file_size,
            file_format: format,
            source_file_id: document.file_id.clone(),
            storage_path: key.clone(),
        };

        match self.db.attach_file(&book_id, &file) {
            Ok(true) => {}
            Ok(false) => {
                // Lost the race to another writer, or the record is gone.
                let current = self.db.find_record(&book_id)?;
                let ours = current
                    .as_ref()
                    .and_then(|r| r.file.as_ref())
                    .is_some_and(|f| f.storage_path == key);
                if !ours {
                    self.remove_orphan(&key).await;
                }
                let reason = match current {
                    Some(_) => SkipReason::BookAlreadyHasFile,
                    None => SkipReason::BookNotFound,
                };
                return Ok(AttachOutcome::Skipped(reason));
            }
            Err(e) => {
                self.remove_orphan(&key).await;
                return Err(e.into());
            }
        }

        if !self
            .db
            .record_ledger_entry(&LedgerEntry::new(&document.file_id, book_id))?
        {
            warn!(book = %book_id, file = %document.file_id, "ledger already had this attachment");
        }

        info!(
            book = %book_id,
            file = %document.file_id,
            size = file_size,
            key = %key,
            "attached file"
        );
        Ok(AttachOutcome::Attached(file))
    }

    async fn remove_orphan(&self, key: &str) {
        match self.blobs.remove(&self.bucket, key).await {
            Ok(()) => info!(key, "removed orphaned upload"),
            Err(e) => warn!(key, error = %e, "failed to remove orphaned upload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::channel::{ChannelMessage, MemoryChannel};
    use crate::error::ReconcileError;
    use async_trait::async_trait;
    use chrono::Utc;
    use shelfsync_core::CatalogRecord;

    const ARCHIVE: &str = "archive";

    fn document(file_id: &str, name: &str) -> DocumentRef {
        DocumentRef {
            file_id: file_id.to_string(),
            file_name: name.to_string(),
            size: 14,
            mime_type: None,
        }
    }

    async fn channel_with(doc: &DocumentRef) -> (MemoryChannel, ChannelRef) {
        let channel = MemoryChannel::new();
        channel.push_message(
            ARCHIVE,
            ChannelMessage::Document {
                id: 1,
                date: Utc::now(),
                caption: String::new(),
                document: doc.clone(),
            },
        );
        channel.put_media(&doc.file_id, b"<FictionBook/>".to_vec());
        channel.connect().await.unwrap();
        let chan = channel.resolve_channel(ARCHIVE).await.unwrap();
        (channel, chan)
    }

    fn setup() -> (Arc<Database>, Arc<MemoryBlobStore>, CatalogRecord) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let record = CatalogRecord::new("Остров", "Жуков");
        db.upsert_record(&record).unwrap();
        (db, Arc::new(MemoryBlobStore::new()), record)
    }

    #[tokio::test]
    async fn attaches_and_ledgers_a_new_file() {
        let (db, blobs, record) = setup();
        let doc = document("file-1", "Zhukov_Ostrov.fb2");
        let (channel, chan) = channel_with(&doc).await;
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        let outcome = attacher.attach(&channel, &chan, record.id, &doc).await.unwrap();
        let AttachOutcome::Attached(file) = outcome else {
            panic!("expected attachment, got {outcome:?}");
        };
        assert_eq!(file.storage_path, format!("books/{}/Zhukov_Ostrov.fb2", record.id));
        assert_eq!(file.file_format, FileFormat::Fb2);
        assert_eq!(file.file_size, 14);
        assert!(blobs.contains("books", &file.storage_path));

        let stored = db.get_record(&record.id).unwrap();
        assert_eq!(stored.file, Some(file));
        assert!(db.is_source_file_processed("file-1").unwrap());
    }

    #[tokio::test]
    async fn ledgered_file_is_never_transferred_again() {
        let (db, blobs, record) = setup();
        let doc = document("file-1", "Zhukov_Ostrov.fb2");
        let (channel, chan) = channel_with(&doc).await;
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        attacher.attach(&channel, &chan, record.id, &doc).await.unwrap();
        let again = attacher.attach(&channel, &chan, record.id, &doc).await.unwrap();

        assert_eq!(again, AttachOutcome::Skipped(SkipReason::AlreadyProcessed));
        assert_eq!(channel.download_count(), 1);
        assert_eq!(blobs.put_count(), 1);
        assert_eq!(db.count_ledger().unwrap(), 1);
    }

    #[tokio::test]
    async fn book_with_file_gets_no_second_file() {
        let (db, blobs, record) = setup();
        let first = document("file-1", "a.fb2");
        let second = document("file-2", "b.fb2");
        let (channel, chan) = channel_with(&first).await;
        channel.put_media("file-2", b"other".to_vec());
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        attacher.attach(&channel, &chan, record.id, &first).await.unwrap();
        let outcome = attacher.attach(&channel, &chan, record.id, &second).await.unwrap();
        assert_eq!(outcome, AttachOutcome::Skipped(SkipReason::BookAlreadyHasFile));
        assert_eq!(channel.download_count(), 1);
    }

    #[tokio::test]
    async fn unsupported_format_and_missing_book_are_skipped() {
        let (db, blobs, record) = setup();
        let epub = document("file-3", "Остров.epub");
        let (channel, chan) = channel_with(&epub).await;
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        let outcome = attacher.attach(&channel, &chan, record.id, &epub).await.unwrap();
        assert_eq!(outcome, AttachOutcome::Skipped(SkipReason::UnsupportedFormat));

        let fb2 = document("file-4", "x.fb2");
        let outcome = attacher.attach(&channel, &chan, Uuid::now_v7(), &fb2).await.unwrap();
        assert_eq!(outcome, AttachOutcome::Skipped(SkipReason::BookNotFound));
        assert_eq!(channel.download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_download_times_out_without_side_effects() {
        let (db, blobs, record) = setup();
        let doc = document("file-1", "a.fb2");
        let (channel, chan) = channel_with(&doc).await;
        channel.set_download_delay(std::time::Duration::from_secs(600));
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        let err = attacher.attach(&channel, &chan, record.id, &doc).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(blobs.is_empty());
        assert!(!db.is_source_file_processed("file-1").unwrap());
    }

    /// Lets another writer attach a file to the book while our upload runs.
    struct RacingBlobStore {
        inner: MemoryBlobStore,
        db: Arc<Database>,
        book_id: Uuid,
    }

    #[async_trait]
    impl BlobStore for RacingBlobStore {
        fn name(&self) -> &str {
            "racing"
        }

        async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str, upsert: bool) -> Result<()> {
            self.inner.put(bucket, key, bytes, content_type, upsert).await?;
            let winner = FileAttachment {
                file_url: "memory://books/winner.fb2".to_string(),
                file_size: 1,
                file_format: FileFormat::Fb2,
                source_file_id: "winner".to_string(),
                storage_path: "books/winner.fb2".to_string(),
            };
            self.db.attach_file(&self.book_id, &winner)?;
            Ok(())
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.inner.get(bucket, key).await
        }

        async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
            self.inner.remove(bucket, key).await
        }

        fn public_url(&self, bucket: &str, key: &str) -> String {
            self.inner.public_url(bucket, key)
        }
    }

    #[tokio::test]
    async fn losing_the_attach_race_removes_the_upload() {
        let (db, _, record) = setup();
        let doc = document("file-1", "a.fb2");
        let (channel, chan) = channel_with(&doc).await;
        let racing = Arc::new(RacingBlobStore {
            inner: MemoryBlobStore::new(),
            db: db.clone(),
            book_id: record.id,
        });
        let attacher = FileAttacher::new(db.clone(), racing.clone(), &AppConfig::default());

        let outcome = attacher.attach(&channel, &chan, record.id, &doc).await.unwrap();
        assert_eq!(outcome, AttachOutcome::Skipped(SkipReason::BookAlreadyHasFile));
        assert!(racing.inner.is_empty());
        assert_eq!(racing.inner.remove_count(), 1);
        assert!(!db.is_source_file_processed("file-1").unwrap());

        let stored = db.get_record(&record.id).unwrap();
        assert_eq!(stored.file.unwrap().source_file_id, "winner");
    }

    #[tokio::test]
    async fn failed_attach_write_removes_the_upload_and_propagates() {
        let (db, blobs, record) = setup();
        db.pool()
            .get_connection()
            .execute_batch(
                "CREATE TRIGGER reject_file_attach BEFORE UPDATE OF file_url ON catalog_records
                 BEGIN SELECT RAISE(ABORT, 'catalog is read-only'); END;",
            )
            .unwrap();
        let doc = document("file-1", "a.fb2");
        let (channel, chan) = channel_with(&doc).await;
        let attacher = FileAttacher::new(db.clone(), blobs.clone(), &AppConfig::default());

        let err = attacher.attach(&channel, &chan, record.id, &doc).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Catalog(_)), "{err:?}");
        assert!(err.to_string().contains("read-only"), "{err}");
        assert_eq!(blobs.put_count(), 1);
        assert_eq!(blobs.remove_count(), 1);
        assert!(blobs.is_empty());
        assert!(!db.get_record(&record.id).unwrap().has_file());
        assert!(!db.is_source_file_processed("file-1").unwrap());
    }

    #[test]
    fn skip_reasons_render_snake_case() {
        assert_eq!(SkipReason::BookAlreadyHasFile.to_string(), "book_already_has_file");
        assert_eq!(
            serde_json::to_string(&SkipReason::NoMatchingBook).unwrap(),
            "\"no_matching_book\""
        );
    }
}
