//! Diagnostic channel for asynchronous framework failures.
//!
//! Failures that cannot reach the original caller (they happen inside
//! the sharded delivery, long after the enqueue ack) are published here
//! as system events. Subscribing is optional; lagging subscribers skip
//! events rather than applying backpressure.

use tokio::sync::broadcast;

use crate::entity::EntityId;
use crate::signal::{SignalId, TypeUrl};

const CHANNEL_CAPACITY: usize = 1024;

/// A system event on the diagnostic channel.
#[derive(Clone, Debug, PartialEq)]
pub enum DiagnosticEvent {
    /// An entity's stored state cannot be restored.
    EntityStateCorrupted {
        entity_type: TypeUrl,
        id: EntityId,
        message: String,
    },
    /// A user handler failed outside the rejection protocol.
    HandlerFailedUnexpectedly {
        signal_id: SignalId,
        entity_type: TypeUrl,
        message: String,
    },
    /// A routing table produced no usable target.
    RoutingFailed {
        signal_id: SignalId,
        class: TypeUrl,
        message: String,
    },
    /// A transaction builder failed its invariant validation.
    ConstraintViolated {
        entity_type: TypeUrl,
        id: EntityId,
        message: String,
    },
}

/// Broadcast hub of diagnostic events.
#[derive(Clone)]
pub struct DiagnosticsHub {
    sender: broadcast::Sender<DiagnosticEvent>,
}

impl Default for DiagnosticsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        DiagnosticsHub { sender }
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn publish(&self, event: DiagnosticEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.sender.subscribe()
    }
}
