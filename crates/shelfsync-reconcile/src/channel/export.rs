//! Channel backed by a Telegram Desktop JSON export (`result.json` plus
//! the exported media files next to it).

use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::{ChannelMessage, ChannelRef, DocumentRef, PhotoRef, SourceChannel};
use crate::error::{ReconcileError, Result};

const RESULT_FILE: &str = "result.json";
const NOT_EXPORTED_PREFIX: &str = "(File not included";

#[derive(Debug, Clone)]
struct ExportedChat {
    id: String,
    name: String,
    messages: Vec<ChannelMessage>,
}

pub struct ExportChannel {
    root: PathBuf,
    chats: Mutex<Option<Vec<ExportedChat>>>,
}

impl ExportChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chats: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chats(&self) -> MutexGuard<'_, Option<Vec<ExportedChat>>> {
        self.chats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_chat<T>(&self, channel_id: &str, f: impl FnOnce(&ExportedChat) -> T) -> Result<T> {
        let guard = self.chats();
        let chats = guard
            .as_ref()
            .ok_or_else(|| ReconcileError::Channel("not connected".to_string()))?;
        chats
            .iter()
            .find(|chat| chat.id == channel_id)
            .map(f)
            .ok_or_else(|| ReconcileError::Channel(format!("unknown channel: {channel_id}")))
    }

    /// Resolve an exported media path, refusing anything outside the export.
    fn media_path(&self, file_id: &str) -> Result<PathBuf> {
        let relative = Path::new(file_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || file_id.is_empty() {
            return Err(ReconcileError::Channel(format!("invalid media path: {file_id}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SourceChannel for ExportChannel {
    async fn connect(&self) -> Result<()> {
        let path = self.root.join(RESULT_FILE);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ReconcileError::Channel(format!("cannot read {}: {e}", path.display()))
        })?;
        let doc: Value = serde_json::from_str(&raw)?;
        let chats = parse_export(&doc);
        info!(
            export = %self.root.display(),
            chats = chats.len(),
            "loaded channel export"
        );
        *self.chats() = Some(chats);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.chats() = None;
        Ok(())
    }

    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef> {
        let guard = self.chats();
        let chats = guard
            .as_ref()
            .ok_or_else(|| ReconcileError::Channel("not connected".to_string()))?;
        let wanted = identifier.trim_start_matches('@');
        chats
            .iter()
            .find(|chat| chat.id == wanted || chat.name == wanted)
            .map(|chat| ChannelRef {
                id: chat.id.clone(),
                title: chat.name.clone(),
            })
            .ok_or_else(|| ReconcileError::Channel(format!("unknown channel: {identifier}")))
    }

    async fn list_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<ChannelMessage>> {
        self.with_chat(&channel.id, |chat| {
            let mut messages: Vec<ChannelMessage> = chat
                .messages
                .iter()
                .filter(|m| before_id.is_none_or(|before| m.id() < before))
                .cloned()
                .collect();
            messages.sort_by_key(|m| std::cmp::Reverse(m.id()));
            messages.truncate(limit);
            messages
        })
    }

    async fn download_media(&self, channel: &ChannelRef, file_id: &str) -> Result<Vec<u8>> {
        self.with_chat(&channel.id, |_| ())?;
        let path = self.media_path(file_id)?;
        debug!(path = %path.display(), "reading exported media");
        Ok(tokio::fs::read(&path).await?)
    }
}

/// Accepts both a single-chat export and a full account export.
fn parse_export(doc: &Value) -> Vec<ExportedChat> {
    if let Some(list) = doc
        .get("chats")
        .and_then(|c| c.get("list"))
        .and_then(Value::as_array)
    {
        return list.iter().filter_map(parse_chat).collect();
    }
    parse_chat(doc).into_iter().collect()
}

fn parse_chat(chat: &Value) -> Option<ExportedChat> {
    let id = match chat.get("id")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let name = chat
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let messages = chat
        .get("messages")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(parse_message).collect())
        .unwrap_or_default();
    Some(ExportedChat { id, name, messages })
}

fn parse_message(msg: &Value) -> Option<ChannelMessage> {
    if msg.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    let id = msg.get("id").and_then(Value::as_i64)?;
    let date = parse_date(msg)?;
    let text = flatten_text(msg.get("text"));

    if let Some(file) = exported_path(msg, "file") {
        let file_name = msg
            .get("file_name")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .or_else(|| {
                Path::new(&file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| file.clone());
        return Some(ChannelMessage::Document {
            id,
            date,
            caption: text,
            document: DocumentRef {
                file_id: file,
                file_name,
                size: msg.get("file_size").and_then(Value::as_u64).unwrap_or(0),
                mime_type: msg
                    .get("mime_type")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
            },
        });
    }

    if let Some(photo) = exported_path(msg, "photo") {
        return Some(ChannelMessage::Photo {
            id,
            date,
            caption: text,
            photo: PhotoRef {
                file_id: photo,
                size: msg.get("photo_file_size").and_then(Value::as_u64),
            },
        });
    }

    Some(ChannelMessage::Text { id, date, text })
}

fn exported_path(msg: &Value, key: &str) -> Option<String> {
    msg.get(key)
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty() && !p.starts_with(NOT_EXPORTED_PREFIX))
        .map(ToOwned::to_owned)
}

fn parse_date(msg: &Value) -> Option<DateTime<Utc>> {
    if let Some(unix) = msg
        .get("date_unixtime")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
    {
        return DateTime::from_timestamp(unix, 0);
    }
    let raw = msg.get("date").and_then(Value::as_str)?;
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// `text` is either a plain string or a list of plain strings and entity objects.
fn flatten_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.as_str(),
                other => other.get("text").and_then(Value::as_str).unwrap_or_default(),
            })
            .collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXPORT: &str = r#"{
        "name": "Книжная полка",
        "type": "public_channel",
        "id": 1001,
        "messages": [
            {"id": 1, "type": "service", "date": "2024-01-01T10:00:00", "action": "create_channel"},
            {"id": 2, "type": "message", "date": "2024-01-02T10:00:00", "date_unixtime": "1704189600",
             "text": ["Автор: ", {"type": "bold", "text": "Жуков"}, "\nНазвание: Остров"]},
            {"id": 3, "type": "message", "date": "2024-01-03T10:00:00",
             "file": "files/Zhukov_Ostrov.fb2", "file_name": "Жуков - Остров.fb2",
             "file_size": 14, "mime_type": "application/x-fictionbook+xml", "text": ""},
            {"id": 4, "type": "message", "date": "2024-01-04T10:00:00",
             "photo": "photos/photo_4.jpg", "photo_file_size": 3, "text": "обложка"},
            {"id": 5, "type": "message", "date": "2024-01-05T10:00:00",
             "file": "(File not included. Change data exporting settings to download.)",
             "text": "без файла"}
        ]
    }"#;

    fn export_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(RESULT_FILE), EXPORT).unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/Zhukov_Ostrov.fb2"), b"<FictionBook/>").unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_messages_from_export() {
        let dir = export_dir();
        let channel = ExportChannel::new(dir.path());
        channel.connect().await.unwrap();
        let chat = channel.resolve_channel("Книжная полка").await.unwrap();
        assert_eq!(chat.id, "1001");

        let messages = channel.list_messages(&chat, 10, None).await.unwrap();
        let ids: Vec<_> = messages.iter().map(ChannelMessage::id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2]);

        let text = messages.iter().find(|m| m.id() == 2).unwrap();
        assert_eq!(text.text(), "Автор: Жуков\nНазвание: Остров");
        assert_eq!(text.date().timestamp(), 1_704_189_600);

        let doc = messages.iter().find(|m| m.id() == 3).unwrap();
        let document = doc.document(None).unwrap();
        assert_eq!(document.file_name, "Жуков - Остров.fb2");
        assert_eq!(document.file_id, "files/Zhukov_Ostrov.fb2");

        assert!(matches!(messages[0], ChannelMessage::Text { .. }));
        assert!(matches!(messages[1], ChannelMessage::Photo { .. }));
    }

    #[tokio::test]
    async fn downloads_files_inside_the_export_only() {
        let dir = export_dir();
        let channel = ExportChannel::new(dir.path());
        channel.connect().await.unwrap();
        let chat = channel.resolve_channel("1001").await.unwrap();

        let bytes = channel
            .download_media(&chat, "files/Zhukov_Ostrov.fb2")
            .await
            .unwrap();
        assert_eq!(bytes, b"<FictionBook/>");
        assert!(channel.download_media(&chat, "../result.json").await.is_err());
        assert!(channel.download_media(&chat, "/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_forgets_the_export() {
        let dir = export_dir();
        let channel = ExportChannel::new(dir.path());
        channel.connect().await.unwrap();
        channel.disconnect().await.unwrap();
        assert!(channel.resolve_channel("1001").await.is_err());
    }

    #[tokio::test]
    async fn missing_export_fails_to_connect() {
        let dir = TempDir::new().unwrap();
        let channel = ExportChannel::new(dir.path().join("nope"));
        assert!(channel.connect().await.is_err());
    }
}
