//! Collaborator interfaces consumed by the core.
//!
//! These traits define the contracts for:
//! - Schema validation (message typing lives outside the core)
//! - Storage (inbox, event store, aggregate and record storage)
//! - Work registry (shard lease coordination)
//! - Transport (integration bus channels)
//!
//! The core ships in-memory reference implementations in [`crate::storage`];
//! real backends are provided by the hosting application.

pub mod schema;
pub mod storage;
pub mod transport;
pub mod work_registry;

pub use schema::{NoValidationSchemaRegistry, SchemaRegistry, Violations};
pub use storage::{
    AggregateHistory, AggregateStorage, EventStore, EventStreamQuery, InboxStorage, Page,
    RecordStorage, StateSnapshot, StorageError, StorageFactory, StoredRecord,
};
pub use transport::{ChannelId, Publisher, Subscriber, TransportError, TransportFactory};
pub use work_registry::{LeaseLost, NodeId, ShardSession, ShardedWorkRegistry};
