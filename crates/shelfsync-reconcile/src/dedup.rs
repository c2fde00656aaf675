//! Merge catalog records that share a normalized (title, author) identity.

use serde::Serialize;
use shelfsync_core::{CatalogRecord, Database};
use tracing::{info, warn};
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupOutcome {
    /// Surviving record; `None` when nothing shares the identity.
    pub canonical_id: Option<Uuid>,
    pub removed: Vec<Uuid>,
    /// Duplicate whose file reference moved onto the canonical record.
    pub file_copied_from: Option<Uuid>,
    /// Update or delete failures. Copies already made are kept.
    pub errors: Vec<String>,
}

impl DedupOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merged_anything(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// The newest record wins; the first older record holding a file donates it
/// when the winner has none, then all older records go in one batch delete.
///
/// Only the identity lookup is fatal. Later failures land in
/// [`DedupOutcome::errors`].
pub fn deduplicate(db: &Database, title: &str, author: &str) -> Result<DedupOutcome> {
    let records = db.find_by_identity(title, author)?;
    let Some((canonical, duplicates)) = records.split_first() else {
        return Ok(DedupOutcome::default());
    };

    let mut outcome = DedupOutcome {
        canonical_id: Some(canonical.id),
        ..DedupOutcome::default()
    };
    if duplicates.is_empty() {
        return Ok(outcome);
    }

    if !canonical.has_file()
        && let Some(donor) = duplicates.iter().find(|r| r.has_file())
    {
        copy_file(db, canonical, donor, &mut outcome);
    }

    let ids: Vec<Uuid> = duplicates.iter().map(|r| r.id).collect();
    match db.delete_records(&ids) {
        Ok(deleted) => {
            info!(
                canonical = %canonical.id,
                deleted,
                title,
                author,
                "merged duplicate catalog records"
            );
            outcome.removed = ids;
        }
        Err(e) => {
            warn!(canonical = %canonical.id, error = %e, "failed to delete duplicates");
            outcome.errors.push(format!("delete duplicates: {e}"));
        }
    }

    Ok(outcome)
}

fn copy_file(db: &Database, canonical: &CatalogRecord, donor: &CatalogRecord, outcome: &mut DedupOutcome) {
    let Some(file) = donor.file.as_ref() else {
        return;
    };
    match db.attach_file(&canonical.id, file) {
        Ok(true) => outcome.file_copied_from = Some(donor.id),
        Ok(false) => {
            // A file landed on the canonical record in the meantime.
        }
        Err(e) => {
            warn!(canonical = %canonical.id, donor = %donor.id, error = %e, "failed to copy file reference");
            outcome.errors.push(format!("copy file from {}: {e}", donor.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shelfsync_core::{FileAttachment, FileFormat};

    fn record_created(title: &str, author: &str, minutes_ago: i64) -> CatalogRecord {
        let mut record = CatalogRecord::new(title, author);
        record.created_at = Utc::now() - Duration::minutes(minutes_ago);
        record.updated_at = record.created_at;
        record
    }

    fn attachment(source: &str) -> FileAttachment {
        FileAttachment {
            file_url: format!("https://cdn.example/books/{source}.fb2"),
            file_size: 2048,
            file_format: FileFormat::Fb2,
            source_file_id: source.to_string(),
            storage_path: format!("books/{source}.fb2"),
        }
    }

    #[test]
    fn single_record_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        let only = record_created("Остров", "Жуков", 0);
        db.upsert_record(&only).unwrap();

        let outcome = deduplicate(&db, "Остров", "Жуков").unwrap();
        assert_eq!(outcome.canonical_id, Some(only.id));
        assert!(!outcome.merged_anything());
        assert!(outcome.is_success());
    }

    #[test]
    fn no_records_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        let outcome = deduplicate(&db, "Остров", "Жуков").unwrap();
        assert_eq!(outcome, DedupOutcome::default());
    }

    #[test]
    fn converges_to_newest_and_keeps_the_only_file() {
        let db = Database::open_in_memory().unwrap();
        let oldest = record_created("Остров", "Жуков", 30);
        let mut with_file = record_created("остров ", "ЖУКОВ", 20);
        with_file.file = Some(attachment("file-7"));
        let newest = record_created("Остров", "Жуков", 1);
        for r in [&oldest, &with_file, &newest] {
            db.upsert_record(r).unwrap();
        }

        let outcome = deduplicate(&db, "Остров", "Жуков").unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.canonical_id, Some(newest.id));
        assert_eq!(outcome.file_copied_from, Some(with_file.id));
        assert_eq!(outcome.removed.len(), 2);

        let remaining = db.find_by_identity("Остров", "Жуков").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newest.id);
        assert_eq!(remaining[0].file.as_ref().unwrap().source_file_id, "file-7");
    }

    #[test]
    fn canonical_file_is_never_overwritten() {
        let db = Database::open_in_memory().unwrap();
        let mut older = record_created("Остров", "Жуков", 10);
        older.file = Some(attachment("old"));
        let mut newest = record_created("Остров", "Жуков", 0);
        newest.file = Some(attachment("new"));
        db.upsert_record(&older).unwrap();
        db.upsert_record(&newest).unwrap();

        let outcome = deduplicate(&db, "Остров", "Жуков").unwrap();
        assert_eq!(outcome.file_copied_from, None);

        let survivor = db.get_record(&newest.id).unwrap();
        assert_eq!(survivor.file.unwrap().source_file_id, "new");
    }
}
