//! Source channel seam: the external publisher of posts and files.

pub mod export;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ReconcileError, Result};

pub use export::ExportChannel;
pub use memory::MemoryChannel;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Stable identifier of the file inside the channel; doubles as the
    /// ledger's source file id.
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A channel message, resolved once at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelMessage {
    Text {
        id: i64,
        date: DateTime<Utc>,
        text: String,
    },
    Photo {
        id: i64,
        date: DateTime<Utc>,
        caption: String,
        photo: PhotoRef,
    },
    Document {
        id: i64,
        date: DateTime<Utc>,
        caption: String,
        document: DocumentRef,
    },
    Album {
        id: i64,
        date: DateTime<Utc>,
        caption: String,
        photos: Vec<PhotoRef>,
        documents: Vec<DocumentRef>,
    },
}

impl ChannelMessage {
    pub fn id(&self) -> i64 {
        match self {
            Self::Text { id, .. }
            | Self::Photo { id, .. }
            | Self::Document { id, .. }
            | Self::Album { id, .. } => *id,
        }
    }

    pub fn date(&self) -> DateTime<Utc> {
        match self {
            Self::Text { date, .. }
            | Self::Photo { date, .. }
            | Self::Document { date, .. }
            | Self::Album { date, .. } => *date,
        }
    }

    /// Body text or caption.
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text, .. } => text,
            Self::Photo { caption, .. }
            | Self::Document { caption, .. }
            | Self::Album { caption, .. } => caption,
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text().trim().is_empty()
    }

    pub fn documents(&self) -> Vec<&DocumentRef> {
        match self {
            Self::Document { document, .. } => vec![document],
            Self::Album { documents, .. } => documents.iter().collect(),
            Self::Text { .. } | Self::Photo { .. } => Vec::new(),
        }
    }

    pub fn photos(&self) -> Vec<&PhotoRef> {
        match self {
            Self::Photo { photo, .. } => vec![photo],
            Self::Album { photos, .. } => photos.iter().collect(),
            Self::Text { .. } | Self::Document { .. } => Vec::new(),
        }
    }

    /// The document with `file_id`, or the first one when no id is given.
    pub fn document(&self, file_id: Option<&str>) -> Option<&DocumentRef> {
        let documents = self.documents();
        match file_id {
            Some(wanted) => documents.into_iter().find(|d| d.file_id == wanted),
            None => documents.into_iter().next(),
        }
    }
}

#[async_trait]
pub trait SourceChannel: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef>;
    /// Newest first; only messages with id below `before_id` when given.
    async fn list_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<ChannelMessage>>;
    async fn download_media(&self, channel: &ChannelRef, file_id: &str) -> Result<Vec<u8>>;
}

/// Connect, retrying up to `attempts` times with exponential backoff.
pub async fn connect_with_retry(channel: &dyn SourceChannel, attempts: u32) -> Result<()> {
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match channel.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let backoff = 2u64.pow(attempt);
                warn!(attempt = attempt + 1, error = %e, "channel connect failed, retrying in {backoff}s");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                attempt += 1;
            }
        }
    }
}

/// Disconnect without ever blocking longer than `secs`.
pub async fn disconnect_within(channel: &dyn SourceChannel, secs: u64) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(secs), channel.disconnect()).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout {
            operation: "channel disconnect".to_string(),
            secs,
        }),
    }
}

/// Look up a single message by id.
pub async fn fetch_message(
    source: &dyn SourceChannel,
    channel: &ChannelRef,
    message_id: i64,
) -> Result<Option<ChannelMessage>> {
    let messages = source
        .list_messages(channel, 1, Some(message_id.saturating_add(1)))
        .await?;
    Ok(messages.into_iter().find(|m| m.id() == message_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn accessors_cover_every_variant() {
        let doc = DocumentRef {
            file_id: "f1".into(),
            file_name: "book.fb2".into(),
            size: 10,
            mime_type: None,
        };
        let album = ChannelMessage::Album {
            id: 4,
            date: at(4),
            caption: "Автор: Жуков".into(),
            photos: vec![PhotoRef { file_id: "p1".into(), size: None }],
            documents: vec![doc.clone()],
        };
        assert_eq!(album.id(), 4);
        assert!(album.has_text());
        assert_eq!(album.photos().len(), 1);
        assert_eq!(album.document(None), Some(&doc));
        assert_eq!(album.document(Some("f1")), Some(&doc));
        assert_eq!(album.document(Some("missing")), None);

        let text = ChannelMessage::Text { id: 1, date: at(1), text: "  ".into() };
        assert!(!text.has_text());
        assert!(text.documents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_success() {
        let channel = MemoryChannel::new();
        channel.fail_next_connects(2);
        connect_with_retry(&channel, 3).await.unwrap();
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_bounded_attempts() {
        let channel = MemoryChannel::new();
        channel.fail_next_connects(5);
        assert!(connect_with_retry(&channel, 3).await.is_err());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn fetch_message_finds_exact_id() {
        let channel = MemoryChannel::new();
        channel.push_message("archive", ChannelMessage::Text { id: 5, date: at(5), text: "five".into() });
        channel.push_message("archive", ChannelMessage::Text { id: 7, date: at(7), text: "seven".into() });
        channel.connect().await.unwrap();
        let chan = channel.resolve_channel("archive").await.unwrap();

        let found = fetch_message(&channel, &chan, 5).await.unwrap().unwrap();
        assert_eq!(found.text(), "five");
        assert!(fetch_message(&channel, &chan, 6).await.unwrap().is_none());
    }
}
