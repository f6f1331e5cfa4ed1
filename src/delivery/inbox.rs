//! Inbox message model and the write side of the sharded inbox.
//!
//! The inbox is a content-addressed queue of pending signals per shard.
//! Messages keep their `Delivered` row for the idempotence window so that
//! re-enqueued duplicates can be detected and dropped.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::strategy::ShardingStrategy;
use crate::entity::EntityId;
use crate::interfaces::{InboxStorage, StorageError};
use crate::signal::{Signal, SignalId, TypeUrl};

/// A shard index within a fixed total.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardIndex {
    pub index: u32,
    pub of_total: u32,
}

impl ShardIndex {
    /// Create an index, panicking in debug builds on out-of-range values.
    pub fn new(index: u32, of_total: u32) -> Self {
        debug_assert!(index < of_total, "shard index {index} out of {of_total}");
        ShardIndex { index, of_total }
    }
}

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.of_total)
    }
}

impl fmt::Debug for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardIndex({}/{})", self.index, self.of_total)
    }
}

/// Delivery status of an inbox message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    ToDeliver,
    Delivered,
}

/// The identity of an inbox message: one signal aimed at one target.
///
/// Re-enqueuing the same signal for the same target produces a second row
/// with the same key; delivery collapses such rows into one visible effect.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub signal_id: SignalId,
    pub target_type: TypeUrl,
    pub target_id: EntityId,
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageKey({} -> {} {})",
            self.signal_id,
            self.target_type.simple_name(),
            self.target_id
        )
    }
}

/// One pending (or recently delivered) signal in a shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub shard: ShardIndex,
    pub signal: Signal,
    pub target_type: TypeUrl,
    pub target_id: EntityId,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub keep_until: Option<DateTime<Utc>>,
    /// Marks a historical event replayed by a catch-up process.
    pub from_catch_up: bool,
}

impl InboxMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            signal_id: self.signal.id,
            target_type: self.target_type.clone(),
            target_id: self.target_id.clone(),
        }
    }

    /// Page ordering: `received_at` ascending, then signal id.
    pub fn page_order(a: &InboxMessage, b: &InboxMessage) -> std::cmp::Ordering {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.signal.id.cmp(&b.signal.id))
    }
}

/// The write side of the inbox, handed to repositories for dispatch.
///
/// Computes the shard for a target and persists the message; the enqueue
/// is acknowledged only after the storage write returns.
#[derive(Clone)]
pub struct InboxWriter {
    storage: Arc<dyn InboxStorage>,
    strategy: Arc<dyn ShardingStrategy>,
    shard_count: u32,
}

impl InboxWriter {
    pub(crate) fn new(
        storage: Arc<dyn InboxStorage>,
        strategy: Arc<dyn ShardingStrategy>,
        shard_count: u32,
    ) -> Self {
        InboxWriter {
            storage,
            strategy,
            shard_count,
        }
    }

    /// The shard a target lives in.
    pub fn shard_for(&self, target_type: &TypeUrl, target_id: &EntityId) -> ShardIndex {
        self.strategy
            .shard_for(target_id, target_type, self.shard_count)
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Enqueue a signal for one target.
    pub async fn enqueue(
        &self,
        target_type: TypeUrl,
        target_id: EntityId,
        signal: Signal,
        from_catch_up: bool,
    ) -> Result<ShardIndex, StorageError> {
        let shard = self.shard_for(&target_type, &target_id);
        let message = InboxMessage {
            shard,
            signal,
            target_type,
            target_id,
            status: InboxStatus::ToDeliver,
            received_at: Utc::now(),
            keep_until: None,
            from_catch_up,
        };
        self.storage.write(message).await?;
        Ok(shard)
    }
}
