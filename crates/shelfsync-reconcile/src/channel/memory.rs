use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelMessage, ChannelRef, SourceChannel};
use crate::error::{ReconcileError, Result};

/// In-process channel for tests and dry runs.
#[derive(Default)]
pub struct MemoryChannel {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, Vec<ChannelMessage>>,
    media: HashMap<String, Vec<u8>>,
    connected: bool,
    connect_failures_left: u32,
    download_delay: Option<Duration>,
    downloads: usize,
    disconnects: usize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_message(&self, channel: &str, message: ChannelMessage) {
        self.state()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(message);
    }

    pub fn put_media(&self, file_id: &str, bytes: impl Into<Vec<u8>>) {
        self.state().media.insert(file_id.to_string(), bytes.into());
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state().connect_failures_left = count;
    }

    /// Make every download take this long.
    pub fn set_download_delay(&self, delay: Duration) {
        self.state().download_delay = Some(delay);
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn download_count(&self) -> usize {
        self.state().downloads
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    fn ensure_connected(state: &MemoryState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(ReconcileError::Channel("not connected".to_string()))
        }
    }
}

#[async_trait]
impl SourceChannel for MemoryChannel {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state();
        if state.connect_failures_left > 0 {
            state.connect_failures_left -= 1;
            return Err(ReconcileError::Channel("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        if !state.channels.contains_key(identifier) {
            return Err(ReconcileError::Channel(format!("unknown channel: {identifier}")));
        }
        Ok(ChannelRef {
            id: identifier.to_string(),
            title: identifier.to_string(),
        })
    }

    async fn list_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<ChannelMessage>> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        let mut messages: Vec<ChannelMessage> = state
            .channels
            .get(&channel.id)
            .map(|all| {
                all.iter()
                    .filter(|m| before_id.is_none_or(|before| m.id() < before))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|m| std::cmp::Reverse(m.id()));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn download_media(&self, _channel: &ChannelRef, file_id: &str) -> Result<Vec<u8>> {
        let delay = {
            let state = self.state();
            Self::ensure_connected(&state)?;
            state.download_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let bytes = state
            .media
            .get(file_id)
            .cloned()
            .ok_or_else(|| ReconcileError::Channel(format!("media not found: {file_id}")))?;
        state.downloads += 1;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn text(id: i64) -> ChannelMessage {
        ChannelMessage::Text {
            id,
            date: DateTime::from_timestamp(id, 0).unwrap(),
            text: format!("message {id}"),
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_cursor() {
        let channel = MemoryChannel::new();
        for id in [3, 1, 2, 5, 4] {
            channel.push_message("main", text(id));
        }
        channel.connect().await.unwrap();
        let main = channel.resolve_channel("main").await.unwrap();

        let ids: Vec<_> = channel
            .list_messages(&main, 3, None)
            .await
            .unwrap()
            .iter()
            .map(ChannelMessage::id)
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);

        let ids: Vec<_> = channel
            .list_messages(&main, 10, Some(3))
            .await
            .unwrap()
            .iter()
            .map(ChannelMessage::id)
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn requires_connection() {
        let channel = MemoryChannel::new();
        channel.push_message("main", text(1));
        assert!(channel.resolve_channel("main").await.is_err());

        channel.connect().await.unwrap();
        assert!(channel.resolve_channel("nope").await.is_err());
        channel.disconnect().await.unwrap();
        assert_eq!(channel.disconnect_count(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn downloads_registered_media() {
        let channel = MemoryChannel::new();
        channel.push_message("main", text(1));
        channel.put_media("doc-1", b"<FictionBook/>".to_vec());
        channel.connect().await.unwrap();
        let main = channel.resolve_channel("main").await.unwrap();

        assert_eq!(channel.download_media(&main, "doc-1").await.unwrap(), b"<FictionBook/>");
        assert!(channel.download_media(&main, "doc-2").await.is_err());
        assert_eq!(channel.download_count(), 1);
    }
}
