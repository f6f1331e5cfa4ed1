//! sigrail - signal dispatch and delivery substrate
//!
//! Building blocks for event-sourced CQRS applications: signal buses,
//! class-keyed routing, transactional entity dispatch, sharded at-most-
//! once delivery, and projection catch-up.

pub mod bus;
pub mod context;
pub mod delivery;
pub mod diagnostics;
pub mod entity;
pub mod integration;
pub mod interfaces;
pub mod model;
pub mod repository;
pub mod route;
pub mod signal;
pub mod storage;

// Re-export common types for library usage
pub use context::{BoundedContext, BoundedContextBuilder, ContextError, SignalHub};
pub use delivery::{Delivery, DeliveryBuilder, DeliveryConfig, DeliveryMonitor, ShardIndex};
pub use entity::{EntityId, EntityRecord, LifecycleFlags, Version};
pub use model::{AggregateClass, HandlerError, ProcessManagerClass, ProjectionClass};
pub use repository::{AggregateRepository, ProcessManagerRepository, ProjectionRepository};
pub use route::{CommandRouting, EventRouting};
pub use signal::{
    Ack, AckStatus, AnyPayload, DispatchOutcome, Signal, SignalId, SignalMessage, TenantId,
    TypeUrl,
};
