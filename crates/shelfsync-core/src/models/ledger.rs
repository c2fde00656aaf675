use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof that a channel file was uploaded and attached to a record.
///
/// A source file with an entry is never downloaded again, and a book with an
/// entry never receives a second file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub source_file_id: String,
    pub book_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(source_file_id: impl Into<String>, book_id: Uuid) -> Self {
        Self {
            source_file_id: source_file_id.into(),
            book_id,
            processed_at: Utc::now(),
        }
    }
}

/// A channel publication that has already been run through the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedPublication {
    pub channel_id: String,
    pub message_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<Uuid>,

    pub processed_at: DateTime<Utc>,
}
