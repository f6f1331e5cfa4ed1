//! Integration bus: event exchange between bounded contexts.
//!
//! The publishing side subscribes to the local event bus and republishes
//! selected event classes to transport channels (one channel per class).
//! The subscribing side receives frames from a channel, marks the signal
//! external, and posts it into the local event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bus::{BusError, EventBus, SignalDispatcher};
use crate::interfaces::{ChannelId, Publisher, TransportError, TransportFactory};
use crate::signal::{DispatchOutcome, IgnoreReason, Signal, SignalKind, TypeUrl};

/// Result type for integration operations.
pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Errors raised while wiring the integration bus.
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Bridges one bounded context to the transport fabric.
pub struct IntegrationBus {
    context_name: String,
    transport: Arc<dyn TransportFactory>,
    event_bus: Arc<EventBus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IntegrationBus {
    pub fn new(
        context_name: impl Into<String>,
        transport: Arc<dyn TransportFactory>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        IntegrationBus {
            context_name: context_name.into(),
            transport,
            event_bus,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Republish domestic events of the given classes to the transport.
    ///
    /// Events that arrived from another context are not re-exported.
    pub fn publish_events(&self, classes: Vec<TypeUrl>) -> Result<()> {
        let adapter = Arc::new(PublishAdapter {
            id: format!("integration:{}", self.context_name),
            classes,
            transport: Arc::clone(&self.transport),
            publishers: Mutex::new(HashMap::new()),
        });
        self.event_bus.register(adapter)?;
        Ok(())
    }

    /// Receive external events of one class and post them locally.
    pub async fn subscribe_to_external(&self, class: TypeUrl) -> Result<()> {
        let channel = ChannelId::new(class.as_str());
        let subscriber = self.transport.create_subscriber(&channel);
        let mut stream = subscriber.subscribe().await?;
        let event_bus = Arc::clone(&self.event_bus);
        let context_name = self.context_name.clone();

        let task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let mut signal: Signal = match serde_json::from_slice(&frame) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(context = %context_name, error = %e, "undecodable external frame");
                        continue;
                    }
                };
                if signal.kind != SignalKind::Event {
                    debug!(context = %context_name, "dropping non-event external signal");
                    continue;
                }
                signal.context.external = true;
                let ack = event_bus.post(signal).await;
                if !ack.is_ok() {
                    error!(context = %context_name, ?ack, "external event not accepted");
                }
            }
        });
        self.tasks.lock().expect("integration lock").push(task);
        info!(context = %self.context_name, class = %class, "subscribed to external events");
        Ok(())
    }

    /// Stop the subscriber tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("integration lock").drain(..) {
            task.abort();
        }
    }
}

impl Drop for IntegrationBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Event-bus dispatcher forwarding domestic events to the transport.
struct PublishAdapter {
    id: String,
    classes: Vec<TypeUrl>,
    transport: Arc<dyn TransportFactory>,
    publishers: Mutex<HashMap<TypeUrl, Arc<dyn Publisher>>>,
}

impl PublishAdapter {
    fn publisher_of(&self, class: &TypeUrl) -> Arc<dyn Publisher> {
        let mut publishers = self.publishers.lock().expect("integration lock");
        Arc::clone(publishers.entry(class.clone()).or_insert_with(|| {
            self.transport
                .create_publisher(&ChannelId::new(class.as_str()))
        }))
    }
}

#[async_trait]
impl SignalDispatcher for PublishAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn message_classes(&self) -> Vec<TypeUrl> {
        self.classes.clone()
    }

    async fn dispatch(&self, signal: &Signal) -> DispatchOutcome {
        if signal.is_external() {
            return DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            };
        }
        let frame = match serde_json::to_vec(signal) {
            Ok(frame) => frame,
            Err(e) => {
                return DispatchOutcome::Error {
                    signal_id: signal.id,
                    cause: format!("failed to encode signal: {e}"),
                }
            }
        };
        let publisher = self.publisher_of(signal.message_class());
        match publisher.publish(frame).await {
            Ok(()) => DispatchOutcome::quiet_success(signal.id),
            Err(e) => DispatchOutcome::Error {
                signal_id: signal.id,
                cause: e.to_string(),
            },
        }
    }
}
