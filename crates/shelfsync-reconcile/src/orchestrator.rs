//! Drives one channel publication through find-or-create, enrichment,
//! deduplication and file attachment.
//!
//! Every step records a human-readable action. A step that fails is logged
//! and the workflow moves on where that is safe; only a missing catalog
//! record stops the later steps. [`Orchestrator::process_next`] never
//! returns an error and always tries to disconnect from the channel.

use std::sync::Arc;

use serde::Serialize;
use shelfsync_core::{AppConfig, CatalogRecord, Database, FileFormat};
use tracing::{info, warn};
use uuid::Uuid;

use crate::attach::{AttachOutcome, FileAttacher};
use crate::blob::{BlobStore, sanitize_file_name};
use crate::channel::{
    ChannelMessage, ChannelRef, SourceChannel, connect_with_retry, disconnect_within,
};
use crate::dedup::deduplicate;
use crate::error::{Result, with_timeout};
use crate::filename::{ExtractedMetadata, extract_from_filename, search_terms};
use crate::parser::{ParsedPublication, parse_publication};
use crate::scorer::MatchScorer;

const COVER_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub message: String,
    pub actions: Vec<String>,
    /// Publication handled in this run; `None` when there was nothing to do.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_id: Option<Uuid>,
}

impl ProcessOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

pub struct Orchestrator {
    db: Arc<Database>,
    channel: Arc<dyn SourceChannel>,
    blobs: Arc<dyn BlobStore>,
    attacher: FileAttacher,
    scorer: MatchScorer,
    config: AppConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        channel: Arc<dyn SourceChannel>,
        blobs: Arc<dyn BlobStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            attacher: FileAttacher::new(db.clone(), blobs.clone(), config),
            scorer: MatchScorer::from_config(&config.matching),
            config: config.clone(),
            db,
            channel,
            blobs,
        }
    }

    pub async fn process_next(&self) -> ProcessOutcome {
        let mut actions = Vec::new();
        let mut outcome = self.run(&mut actions).await;

        match disconnect_within(self.channel.as_ref(), self.config.timeouts.shutdown_secs).await {
            Ok(()) => actions.push("Disconnected from source channel".to_string()),
            Err(e) => {
                warn!(error = %e, "channel shutdown failed");
                actions.push(format!("Source channel shutdown failed: {e}"));
            }
        }

        outcome.actions = actions;
        if outcome.success {
            info!(book = ?outcome.book_id, "{}", outcome.message);
        } else {
            warn!("{}", outcome.message);
        }
        outcome
    }

    /// Process up to `count` publications, stopping early once none are left.
    pub async fn process_many(&self, count: usize) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..count {
            let outcome = self.process_next().await;
            let exhausted = outcome.publication_id.is_none();
            outcomes.push(outcome);
            if exhausted {
                break;
            }
        }
        outcomes
    }

    async fn run(&self, actions: &mut Vec<String>) -> ProcessOutcome {
        let retries = self.config.channel.connect_retries;
        if let Err(e) = connect_with_retry(self.channel.as_ref(), retries).await {
            return ProcessOutcome::failed(format!("Could not connect to source channel: {e}"));
        }
        actions.push("Connected to source channel".to_string());

        let main = match self.channel.resolve_channel(&self.config.channel.main).await {
            Ok(main) => main,
            Err(e) => {
                return ProcessOutcome::failed(format!(
                    "Could not resolve channel {}: {e}",
                    self.config.channel.main
                ));
            }
        };

        // 1. Fetch
        let message = match self.next_publication(&main).await {
            Ok(Some(message)) => message,
            Ok(None) => return ProcessOutcome::failed("No unprocessed publications"),
            Err(e) => return ProcessOutcome::failed(format!("Could not read publications: {e}")),
        };
        let publication_id = message.id();
        actions.push(format!("Fetched publication {publication_id}"));

        // 2. Parse
        let parsed = parse_publication(message.text());
        if !parsed.has_identity() {
            self.mark_processed(&main, publication_id, None, actions);
            return ProcessOutcome {
                publication_id: Some(publication_id),
                ..ProcessOutcome::failed(format!(
                    "Publication {publication_id} has no title or author"
                ))
            };
        }
        actions.push(format!(
            "Parsed «{}» by {} ({} sub-books, rating {})",
            parsed.title,
            parsed.author,
            parsed.books.len(),
            parsed.rating
        ));

        // 3. Find or create
        let record = match self.find_or_create(&parsed, actions) {
            Ok(record) => record,
            Err(e) => {
                return ProcessOutcome {
                    publication_id: Some(publication_id),
                    ..ProcessOutcome::failed(format!("Could not find or create record: {e}"))
                };
            }
        };
        let mut book_id = record.id;

        // 4. Enrich
        if let Err(e) = self.enrich(record, &parsed, &main, &message, actions).await {
            warn!(book = %book_id, error = %e, "enrichment failed");
            actions.push(format!("Enrichment failed: {e}"));
        }

        // 5. Deduplicate
        match deduplicate(&self.db, &parsed.title, &parsed.author) {
            Ok(dedup) => {
                for error in &dedup.errors {
                    actions.push(format!("Deduplication problem: {error}"));
                }
                if dedup.merged_anything() {
                    actions.push(format!("Merged {} duplicate record(s)", dedup.removed.len()));
                }
                if let Some(canonical) = dedup.canonical_id
                    && canonical != book_id
                {
                    actions.push(format!("Adopted canonical record {canonical}"));
                    book_id = canonical;
                }
            }
            Err(e) => {
                warn!(book = %book_id, error = %e, "deduplication failed");
                actions.push(format!("Deduplication failed: {e}"));
            }
        }

        // 6. File
        if let Err(e) = self.ensure_file(book_id, &main, &message, actions).await {
            warn!(book = %book_id, error = %e, "file attachment failed");
            actions.push(format!("File attachment failed: {e}"));
        }

        // 7. Mark processed
        self.mark_processed(&main, publication_id, Some(&book_id), actions);

        ProcessOutcome {
            success: true,
            message: format!("Processed «{}» by {}", parsed.title, parsed.author),
            actions: Vec::new(),
            publication_id: Some(publication_id),
            book_id: Some(book_id),
        }
    }

    /// Oldest text-bearing message in the window that was not handled yet.
    async fn next_publication(&self, main: &ChannelRef) -> Result<Option<ChannelMessage>> {
        let window = self.config.channel.publication_window;
        let messages = self.channel.list_messages(main, window, None).await?;
        for message in messages.into_iter().rev() {
            if !message.has_text() {
                continue;
            }
            if !self.db.is_publication_processed(&main.id, message.id())? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn find_or_create(&self, parsed: &ParsedPublication, actions: &mut Vec<String>) -> Result<CatalogRecord> {
        if let Some(existing) = self
            .db
            .find_by_identity(&parsed.title, &parsed.author)?
            .into_iter()
            .next()
        {
            actions.push(format!("Found existing record {}", existing.id));
            return Ok(existing);
        }

        let terms = search_terms(&format!("{} {}", parsed.author, parsed.title));
        let candidates = self
            .db
            .search_candidates(&terms, self.config.matching.candidate_limit)?;
        let extracted = ExtractedMetadata {
            author: parsed.author.clone(),
            title: parsed.title.clone(),
        };
        if let Some(best) = self.scorer.best_match(&extracted, &terms, &candidates) {
            actions.push(format!(
                "Matched existing record {} «{}» (score {})",
                best.record.id, best.record.title, best.score
            ));
            return Ok(best.record);
        }

        let record = CatalogRecord::new(&parsed.title, &parsed.author);
        self.db.upsert_record(&record)?;
        actions.push(format!("Created record {}", record.id));
        Ok(record)
    }

    /// Fill only fields that are still empty. The file columns are never written.
    async fn enrich(
        &self,
        mut record: CatalogRecord,
        parsed: &ParsedPublication,
        main: &ChannelRef,
        message: &ChannelMessage,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let mut filled = Vec::new();

        if record.publication_year.is_none()
            && let Some(year) = parsed.earliest_year()
        {
            record.publication_year = Some(year);
            filled.push("year");
        }
        if record.description.as_deref().is_none_or(str::is_empty) && !parsed.description.is_empty() {
            record.description = Some(parsed.description.clone());
            filled.push("description");
        }
        if record.series.is_none() && parsed.series.is_some() {
            record.series = parsed.series.clone();
            filled.push("series");
        }
        if record.rating.is_none() && parsed.rating > 0.0 {
            record.rating = Some(parsed.rating);
            filled.push("rating");
        }
        if record.genres.is_empty() && !parsed.genres.is_empty() {
            record.genres = parsed.genres.clone();
            filled.push("genres");
        }
        if record.tags.is_empty() && !parsed.tags.is_empty() {
            record.tags = parsed.tags.clone();
            filled.push("tags");
        }
        let mut cover_key = None;
        if record.cover_urls.is_empty() {
            match self.upload_cover(record.id, main, message).await {
                Ok(Some(key)) => {
                    record
                        .cover_urls
                        .push(self.blobs.public_url(&self.config.blob.bucket, &key));
                    cover_key = Some(key);
                    filled.push("cover");
                }
                Ok(None) => {}
                Err(e) => actions.push(format!("Cover upload failed: {e}")),
            }
        }

        if filled.is_empty() {
            actions.push("Nothing to enrich".to_string());
            return Ok(());
        }
        record.updated_at = chrono::Utc::now();
        if let Err(e) = self.db.fill_record_metadata(&record) {
            if let Some(key) = cover_key {
                self.remove_cover(&key).await;
            }
            return Err(e.into());
        }
        actions.push(format!("Enriched {}", filled.join(", ")));
        Ok(())
    }

    async fn remove_cover(&self, key: &str) {
        match self.blobs.remove(&self.config.blob.bucket, key).await {
            Ok(()) => info!(key, "removed unreferenced cover"),
            Err(e) => warn!(key, error = %e, "failed to remove unreferenced cover"),
        }
    }

    async fn upload_cover(
        &self,
        book_id: Uuid,
        main: &ChannelRef,
        message: &ChannelMessage,
    ) -> Result<Option<String>> {
        let Some(photo) = message.photos().into_iter().next() else {
            return Ok(None);
        };
        let bytes = with_timeout(
            "cover download",
            self.config.timeouts.download_secs,
            self.channel.download_media(main, &photo.file_id),
        )
        .await?;

        let name = photo.file_id.rsplit('/').next().unwrap_or("cover.jpg");
        let key = format!("covers/{book_id}/{}", sanitize_file_name(name));
        let bucket = &self.config.blob.bucket;
        with_timeout(
            "cover upload",
            self.config.timeouts.upload_secs,
            self.blobs.put(bucket, &key, bytes, COVER_CONTENT_TYPE, true),
        )
        .await?;
        Ok(Some(key))
    }

    async fn ensure_file(
        &self,
        book_id: Uuid,
        main: &ChannelRef,
        message: &ChannelMessage,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let Some(record) = self.db.find_record(&book_id)? else {
            actions.push(format!("Record {book_id} disappeared before file attachment"));
            return Ok(());
        };
        if record.has_file() {
            actions.push("Record already has a file".to_string());
            return Ok(());
        }

        // Direct: a document attached to the publication itself.
        for document in message.documents() {
            match self.attacher.attach(self.channel.as_ref(), main, book_id, document).await {
                Ok(AttachOutcome::Attached(file)) => {
                    actions.push(format!("Attached {} from the publication", file.storage_path));
                    return Ok(());
                }
                Ok(AttachOutcome::Skipped(reason)) => {
                    actions.push(format!("Skipped {}: {reason}", document.file_name));
                }
                Err(e) => actions.push(format!("Direct download of {} failed: {e}", document.file_name)),
            }
        }

        let Some(archive_id) = self.config.channel.archive.as_deref() else {
            actions.push("No file attached; no archive channel configured".to_string());
            return Ok(());
        };
        self.search_archive(&record, archive_id, actions).await
    }

    /// First archive file whose name matches this record wins.
    async fn search_archive(
        &self,
        record: &CatalogRecord,
        archive_id: &str,
        actions: &mut Vec<String>,
    ) -> Result<()> {
        let archive = self.channel.resolve_channel(archive_id).await?;
        let messages = self
            .channel
            .list_messages(&archive, self.config.channel.archive_window, None)
            .await?;

        for message in &messages {
            for document in message.documents() {
                if FileFormat::from_file_name(&document.file_name).is_none()
                    || self.db.is_source_file_processed(&document.file_id)?
                {
                    continue;
                }
                let extracted = extract_from_filename(&document.file_name);
                let terms = search_terms(&document.file_name);
                let candidates = self
                    .db
                    .search_candidates(&terms, self.config.matching.candidate_limit)?;
                let Some(best) = self.scorer.best_match(&extracted, &terms, &candidates) else {
                    continue;
                };
                if best.record.id != record.id {
                    continue;
                }

                match self
                    .attacher
                    .attach(self.channel.as_ref(), &archive, record.id, document)
                    .await
                {
                    Ok(AttachOutcome::Attached(file)) => {
                        actions.push(format!(
                            "Attached {} from archive message {} (score {})",
                            document.file_name,
                            message.id(),
                            best.score
                        ));
                        info!(book = %record.id, key = %file.storage_path, "attached archive file");
                        return Ok(());
                    }
                    Ok(AttachOutcome::Skipped(reason)) => {
                        actions.push(format!("Skipped archive file {}: {reason}", document.file_name));
                    }
                    Err(e) => {
                        actions.push(format!("Archive download of {} failed: {e}", document.file_name));
                    }
                }
            }
        }

        actions.push(format!(
            "No matching file among the last {} archive messages",
            messages.len()
        ));
        Ok(())
    }

    fn mark_processed(
        &self,
        main: &ChannelRef,
        publication_id: i64,
        book_id: Option<&Uuid>,
        actions: &mut Vec<String>,
    ) {
        match self.db.mark_publication_processed(&main.id, publication_id, book_id) {
            Ok(_) => actions.push(format!("Marked publication {publication_id} processed")),
            Err(e) => {
                warn!(publication = publication_id, error = %e, "failed to mark publication");
                actions.push(format!("Could not mark publication {publication_id} processed: {e}"));
            }
        }
    }
}
