//! In-memory inbox storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::delivery::{InboxMessage, InboxStatus, MessageKey, ShardIndex};
use crate::interfaces::storage::Result;
use crate::interfaces::{InboxStorage, Page, StorageError};

/// Inbox storage that keeps messages in memory.
#[derive(Default)]
pub struct InMemoryInboxStorage {
    messages: RwLock<Vec<InboxMessage>>,
    fail_on_write: RwLock<bool>,
}

impl InMemoryInboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, for failure-path tests.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    /// Snapshot of all rows, for assertions.
    pub async fn dump(&self) -> Vec<InboxMessage> {
        self.messages.read().await.clone()
    }

    /// Count of rows in the given status.
    pub async fn count_in_status(&self, status: InboxStatus) -> usize {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.status == status)
            .count()
    }
}

#[async_trait]
impl InboxStorage for InMemoryInboxStorage {
    async fn write(&self, message: InboxMessage) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StorageError::Unavailable("inbox write disabled".into()));
        }
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn read_page(&self, shard: ShardIndex, limit: usize) -> Result<Page> {
        let messages = self.messages.read().await;
        let mut pending: Vec<&InboxMessage> = messages
            .iter()
            .filter(|m| m.shard == shard && m.status == InboxStatus::ToDeliver)
            .collect();
        pending.sort_by(|a, b| InboxMessage::page_order(a, b));
        pending.truncate(limit);

        let delivered = messages
            .iter()
            .filter(|m| m.shard == shard && m.status == InboxStatus::Delivered);

        let mut page: Vec<InboxMessage> = pending.into_iter().cloned().collect();
        page.extend(delivered.cloned());
        Ok(Page { messages: page })
    }

    async fn mark_delivered(&self, keys: &[MessageKey], keep_until: DateTime<Utc>) -> Result<()> {
        let mut messages = self.messages.write().await;
        for message in messages.iter_mut() {
            if message.status == InboxStatus::ToDeliver && keys.contains(&message.key()) {
                message.status = InboxStatus::Delivered;
                message.keep_until = Some(keep_until);
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| {
            m.status != InboxStatus::Delivered || m.keep_until.map_or(true, |until| until >= now)
        });
        Ok(before - messages.len())
    }
}
