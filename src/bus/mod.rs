//! Signal buses: validation → filters → routing → dispatch → ack.
//!
//! This module contains:
//! - [`SignalDispatcher`] and [`DispatcherRegistry`]: per-class dispatch index
//! - [`BusFilter`] / [`FilterChain`]: pre-dispatch filtering
//! - [`CommandBus`]: unicast — exactly one dispatcher per command class
//! - [`EventBus`]: multicast, and the single writer of the event store
//! - [`RejectionBus`]: multicast, parallel to the event family
//!
//! A bus never returns an error from `post`: every problem with a signal
//! is reported through its [`Ack`].

mod filter;
mod registry;

pub use filter::{BusFilter, FilterChain, FilterOutcome};
pub use registry::{DispatcherRegistry, SignalDispatcher};

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::interfaces::{EventStore, SchemaRegistry};
use crate::signal::{Ack, DispatchOutcome, Signal, SignalKind, TypeUrl};

/// Result type for bus registration.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised while wiring dispatchers into a bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("dispatcher `{dispatcher}` exposes no message classes")]
    InvalidDispatcher { dispatcher: String },

    #[error("`{class}` already has dispatcher `{existing}`")]
    DuplicateHandler { class: TypeUrl, existing: String },
}

/// Shared preflight of the bus pipeline: family check, default-payload
/// check, schema validation, filter chain. `Err` carries the ack to
/// answer with instead of dispatching.
fn preflight(
    signal: &Signal,
    expected: SignalKind,
    schema: &dyn SchemaRegistry,
    filters: &FilterChain,
) -> std::result::Result<(), Ack> {
    if signal.kind != expected {
        return Err(Ack::error(
            signal.id,
            "wrong_signal_kind",
            format!("expected {expected:?}, got {:?}", signal.kind),
        ));
    }
    if signal.payload.is_empty() {
        return Err(Ack::error(
            signal.id,
            "default_message",
            format!("`{}` carries no payload", signal.message_class()),
        ));
    }
    if let Err(violations) = schema.validate(&signal.payload) {
        return Err(Ack::error(signal.id, "invalid_payload", violations));
    }
    match filters.apply(&signal.envelope()) {
        None => Ok(()),
        Some(FilterOutcome::Pass) => Ok(()),
        Some(FilterOutcome::Ack(ack)) => Err(ack),
        Some(FilterOutcome::Drop) => {
            debug!(signal = %signal.id, "signal dropped by filter");
            Err(Ack::ok(signal.id))
        }
    }
}

fn ack_of_outcome(signal: &Signal, outcome: DispatchOutcome) -> Ack {
    match outcome {
        DispatchOutcome::Success { .. } | DispatchOutcome::Ignored { .. } => Ack::ok(signal.id),
        DispatchOutcome::Error { cause, .. } => Ack::error(signal.id, "dispatch_failed", cause),
        DispatchOutcome::Interrupted { stopped_at, .. } => Ack::error(
            signal.id,
            "interrupted",
            format!("blocked by failed signal {stopped_at}"),
        ),
    }
}

/// The unicast bus of the command family.
pub struct CommandBus {
    registry: DispatcherRegistry,
    filters: FilterChain,
    schema: Arc<dyn SchemaRegistry>,
}

impl CommandBus {
    pub fn new(schema: Arc<dyn SchemaRegistry>, filters: FilterChain) -> Self {
        CommandBus {
            registry: DispatcherRegistry::unicast(),
            filters,
            schema,
        }
    }

    /// Register a command dispatcher. Fails if any of its classes is
    /// already claimed.
    pub fn register(&self, dispatcher: Arc<dyn SignalDispatcher>) -> Result<()> {
        self.registry.register(dispatcher)
    }

    pub fn unregister(&self, dispatcher_id: &str) {
        self.registry.unregister(dispatcher_id);
    }

    pub fn registered_classes(&self) -> Vec<TypeUrl> {
        self.registry.registered_classes()
    }

    /// Post one command.
    #[tracing::instrument(name = "command_bus.post", skip_all, fields(signal = %signal.id, class = %signal.message_class()))]
    pub async fn post(&self, signal: Signal) -> Ack {
        if let Err(ack) = preflight(&signal, SignalKind::Command, &*self.schema, &self.filters) {
            return ack;
        }
        let dispatchers = self.registry.dispatchers_of(signal.message_class());
        let Some(dispatcher) = dispatchers.first() else {
            warn!(class = %signal.message_class(), "no dispatcher for command");
            return Ack::error(
                signal.id,
                "unsupported_command",
                format!("no dispatcher registered for `{}`", signal.message_class()),
            );
        };
        let outcome = dispatcher.dispatch(&signal).await;
        ack_of_outcome(&signal, outcome)
    }

    /// Post a batch; acks come back in input order.
    pub async fn post_all(&self, signals: Vec<Signal>) -> Vec<Ack> {
        let mut acks = Vec::with_capacity(signals.len());
        for signal in signals {
            acks.push(self.post(signal).await);
        }
        acks
    }
}

/// The multicast bus of the event family.
///
/// Every accepted event is appended to the event store before any
/// dispatcher sees it; the bus is the store's only writer.
pub struct EventBus {
    registry: DispatcherRegistry,
    filters: FilterChain,
    schema: Arc<dyn SchemaRegistry>,
    event_store: Arc<dyn EventStore>,
}

impl EventBus {
    pub fn new(
        schema: Arc<dyn SchemaRegistry>,
        filters: FilterChain,
        event_store: Arc<dyn EventStore>,
    ) -> Self {
        EventBus {
            registry: DispatcherRegistry::multicast(),
            filters,
            schema,
            event_store,
        }
    }

    pub fn register(&self, dispatcher: Arc<dyn SignalDispatcher>) -> Result<()> {
        self.registry.register(dispatcher)
    }

    pub fn unregister(&self, dispatcher_id: &str) {
        self.registry.unregister(dispatcher_id);
    }

    pub fn registered_classes(&self) -> Vec<TypeUrl> {
        self.registry.registered_classes()
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    /// Post one event.
    #[tracing::instrument(name = "event_bus.post", skip_all, fields(signal = %signal.id, class = %signal.message_class()))]
    pub async fn post(&self, signal: Signal) -> Ack {
        if let Err(ack) = preflight(&signal, SignalKind::Event, &*self.schema, &self.filters) {
            return ack;
        }
        if let Err(e) = self
            .event_store
            .append(&signal.context.tenant, vec![signal.clone()])
            .await
        {
            error!(error = %e, "event store append failed");
            return Ack::error(signal.id, "event_store", e);
        }

        let dispatchers = self.registry.dispatchers_of(signal.message_class());
        if dispatchers.is_empty() {
            debug!(class = %signal.message_class(), "no dispatcher for event");
        }
        for dispatcher in dispatchers {
            let outcome = dispatcher.dispatch(&signal).await;
            if let DispatchOutcome::Error { cause, .. } = outcome {
                error!(
                    dispatcher = dispatcher.id(),
                    signal = %signal.id,
                    error = %cause,
                    "event dispatch failed"
                );
            }
        }
        Ack::ok(signal.id)
    }

    /// Post a batch in order; acks come back in input order.
    pub async fn post_all(&self, signals: Vec<Signal>) -> Vec<Ack> {
        let mut acks = Vec::with_capacity(signals.len());
        for signal in signals {
            acks.push(self.post(signal).await);
        }
        acks
    }
}

/// The multicast bus of the rejection family.
///
/// Rejections are a family parallel to events, with their own registry;
/// they are not appended to the event store.
pub struct RejectionBus {
    registry: DispatcherRegistry,
    filters: FilterChain,
    schema: Arc<dyn SchemaRegistry>,
}

impl RejectionBus {
    pub fn new(schema: Arc<dyn SchemaRegistry>, filters: FilterChain) -> Self {
        RejectionBus {
            registry: DispatcherRegistry::multicast(),
            filters,
            schema,
        }
    }

    pub fn register(&self, dispatcher: Arc<dyn SignalDispatcher>) -> Result<()> {
        self.registry.register(dispatcher)
    }

    pub fn unregister(&self, dispatcher_id: &str) {
        self.registry.unregister(dispatcher_id);
    }

    pub fn registered_classes(&self) -> Vec<TypeUrl> {
        self.registry.registered_classes()
    }

    /// Post one rejection.
    #[tracing::instrument(name = "rejection_bus.post", skip_all, fields(signal = %signal.id, class = %signal.message_class()))]
    pub async fn post(&self, signal: Signal) -> Ack {
        if let Err(ack) = preflight(&signal, SignalKind::Rejection, &*self.schema, &self.filters) {
            return ack;
        }
        for dispatcher in self.registry.dispatchers_of(signal.message_class()) {
            let outcome = dispatcher.dispatch(&signal).await;
            if let DispatchOutcome::Error { cause, .. } = outcome {
                error!(
                    dispatcher = dispatcher.id(),
                    signal = %signal.id,
                    error = %cause,
                    "rejection dispatch failed"
                );
            }
        }
        Ack::ok(signal.id)
    }
}

#[cfg(test)]
mod tests;
