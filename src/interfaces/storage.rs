//! Storage interfaces: inbox, event store, aggregate and record storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::delivery::{InboxMessage, MessageKey, ShardIndex};
use crate::entity::{EntityId, LifecycleFlags, Version};
use crate::signal::{AnyPayload, Signal, TenantId, TypeUrl};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {entity_type} {id}")]
    NotFound { entity_type: TypeUrl, id: EntityId },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] crate::signal::PayloadError),
}

/// Creates the storage a bounded context runs on.
///
/// One factory instance serves one context; every storage it creates is
/// shared behind `Arc` by the components that need it.
pub trait StorageFactory: Send + Sync {
    fn create_inbox_storage(&self, multitenant: bool) -> std::sync::Arc<dyn InboxStorage>;

    fn create_event_store(&self, context_name: &str) -> std::sync::Arc<dyn EventStore>;

    fn create_aggregate_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> std::sync::Arc<dyn AggregateStorage>;

    fn create_record_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> std::sync::Arc<dyn RecordStorage>;

    fn create_projection_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> std::sync::Arc<dyn RecordStorage>;
}

/// One page of inbox messages for a shard.
///
/// Contains `ToDeliver` messages in page order, plus the recently
/// delivered rows of the idempotence window, which delivery uses as its
/// deduplication set.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub messages: Vec<InboxMessage>,
}

/// Shard-indexed persistence of pending signals.
///
/// All mutating operations must be linearizable per shard.
#[async_trait]
pub trait InboxStorage: Send + Sync {
    /// Persist a message. The write must be durable before returning.
    async fn write(&self, message: InboxMessage) -> Result<()>;

    /// Read up to `limit` pending messages of a shard, ordered by
    /// `received_at` then signal id, together with the delivered rows
    /// still inside their idempotence window.
    async fn read_page(&self, shard: ShardIndex, limit: usize) -> Result<Page>;

    /// Transition rows with the given keys to `Delivered`, stamping
    /// `keep_until`.
    async fn mark_delivered(&self, keys: &[MessageKey], keep_until: DateTime<Utc>) -> Result<()>;

    /// Remove delivered rows whose `keep_until` has passed.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// A filtered slice of the event stream.
#[derive(Clone, Debug, Default)]
pub struct EventStreamQuery {
    /// Keep only events of these classes; empty keeps all.
    pub event_types: Vec<TypeUrl>,
    /// Keep events strictly after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Keep events strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Stop after this many events.
    pub limit: Option<usize>,
}

/// Append-only log of every event posted to the event bus.
///
/// The event bus is the only writer; catch-up processes are the readers.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events atomically.
    async fn append(&self, tenant: &TenantId, events: Vec<Signal>) -> Result<()>;

    /// Stream matching events by timestamp ascending.
    async fn read(
        &self,
        tenant: &TenantId,
        query: &EventStreamQuery,
    ) -> Result<BoxStream<'static, Signal>>;
}

/// A snapshot of an aggregate state at a version.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub state: AnyPayload,
    pub version: Version,
}

/// The stored history of one aggregate.
#[derive(Clone, Debug, Default)]
pub struct AggregateHistory {
    pub snapshot: Option<StateSnapshot>,
    /// Events after the snapshot, oldest first.
    pub events: Vec<Signal>,
    pub flags: LifecycleFlags,
}

/// Per-aggregate event history with snapshot optimization.
#[async_trait]
pub trait AggregateStorage: Send + Sync {
    /// Read the history of one aggregate, `None` if it never existed.
    async fn read(&self, tenant: &TenantId, id: &EntityId) -> Result<Option<AggregateHistory>>;

    /// Append produced events, optionally replacing the snapshot, and
    /// update lifecycle flags — atomically.
    async fn append(
        &self,
        tenant: &TenantId,
        id: &EntityId,
        events: Vec<Signal>,
        snapshot: Option<StateSnapshot>,
        flags: LifecycleFlags,
    ) -> Result<()>;

    /// Known aggregate ids of a tenant.
    async fn index(&self, tenant: &TenantId) -> Result<Vec<EntityId>>;
}

/// The persisted form of a non-event-sourced entity.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub id: EntityId,
    pub state: AnyPayload,
    pub version: Version,
    pub flags: LifecycleFlags,
}

/// Record-per-entity storage for process managers and projections.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    async fn read(&self, tenant: &TenantId, id: &EntityId) -> Result<Option<StoredRecord>>;

    /// Write the record atomically (state, version, flags together).
    async fn write(&self, tenant: &TenantId, record: StoredRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, tenant: &TenantId, id: &EntityId) -> Result<bool>;

    /// Known entity ids of a tenant.
    async fn index(&self, tenant: &TenantId) -> Result<Vec<EntityId>>;
}
