//! Process manager repository.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{error, warn};

use crate::bus::SignalDispatcher;
use crate::context::SignalHub;
use crate::delivery::{DeliveryError, DispatchEndpoint, InboxMessage, InboxWriter};
use crate::diagnostics::DiagnosticEvent;
use crate::entity::transaction::{NoOpListener, TransactionError};
use crate::entity::{EntityId, EntityRecord, Transaction, TransactionListener, VersioningStrategy};
use crate::interfaces::{RecordStorage, StorageError};
use crate::model::{ErasedHandler, HandlerError, HandlerOutput, ProcessManagerClass};
use crate::route::{CommandRouting, EventRouting};
use crate::signal::{
    DispatchOutcome, EventFactory, IgnoreReason, Signal, SignalKind, TenantId, TypeUrl,
};

use super::{pack_record, unpack_record};

struct Binding {
    storage: Arc<dyn RecordStorage>,
    writer: InboxWriter,
    hub: SignalHub,
}

struct Inner<S> {
    class: ProcessManagerClass<S>,
    command_routing: CommandRouting,
    event_routing: EventRouting,
    rejection_routing: EventRouting,
    listener: Arc<dyn TransactionListener<S>>,
    binding: OnceLock<Binding>,
    dispatcher_id: String,
}

/// Repository of one process manager class.
///
/// State is mutated directly by commands, events, and rejections inside
/// an auto-incrementing transaction; the process may emit events or
/// substitute consumed commands with new ones.
pub struct ProcessManagerRepository<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ProcessManagerRepository<S> {
    fn clone(&self) -> Self {
        ProcessManagerRepository {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: crate::signal::SignalMessage> ProcessManagerRepository<S> {
    pub fn new(class: ProcessManagerClass<S>, command_routing: CommandRouting) -> Self {
        let dispatcher_id = format!("process-manager:{}", class.state_type());
        ProcessManagerRepository {
            inner: Arc::new(Inner {
                class,
                command_routing,
                event_routing: EventRouting::by_producer(),
                rejection_routing: EventRouting::by_producer(),
                listener: Arc::new(NoOpListener),
                binding: OnceLock::new(),
                dispatcher_id,
            }),
        }
    }

    /// Replace the event routing used for reactors.
    pub fn with_event_routing(mut self, routing: EventRouting) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("unshared before registration");
        inner.event_routing = routing;
        self
    }

    /// Replace the rejection routing used for rejection reactors.
    pub fn with_rejection_routing(mut self, routing: EventRouting) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("unshared before registration");
        inner.rejection_routing = routing;
        self
    }

    /// Replace the transaction listener policy.
    pub fn with_listener(mut self, listener: Arc<dyn TransactionListener<S>>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("unshared before registration");
        inner.listener = listener;
        self
    }

    pub fn entity_type(&self) -> &TypeUrl {
        self.inner.class.state_type()
    }

    /// Load the current record of one process manager.
    pub async fn find(
        &self,
        tenant: &TenantId,
        id: &EntityId,
    ) -> Result<Option<EntityRecord<S>>, StorageError> {
        let Some(binding) = self.inner.binding.get() else {
            return Err(StorageError::Unavailable(
                "repository not attached to a context".into(),
            ));
        };
        match binding.storage.read(tenant, id).await? {
            None => Ok(None),
            Some(stored) => Ok(Some(unpack_record(&stored)?)),
        }
    }

    /// Known process manager ids of a tenant.
    pub async fn index(&self, tenant: &TenantId) -> Result<Vec<EntityId>, StorageError> {
        let Some(binding) = self.inner.binding.get() else {
            return Err(StorageError::Unavailable(
                "repository not attached to a context".into(),
            ));
        };
        binding.storage.index(tenant).await
    }

    pub(crate) fn bind(
        &self,
        storage: Arc<dyn RecordStorage>,
        writer: InboxWriter,
        hub: SignalHub,
    ) -> bool {
        self.inner
            .binding
            .set(Binding {
                storage,
                writer,
                hub,
            })
            .is_ok()
    }

    pub(crate) fn check(&self) -> Vec<crate::model::SignatureMismatch> {
        self.inner.class.check()
    }

    pub(crate) fn command_classes(&self) -> Vec<TypeUrl> {
        self.inner.class.command_classes()
    }

    pub(crate) fn reaction_classes(&self) -> Vec<TypeUrl> {
        self.inner.class.reaction_classes()
    }

    pub(crate) fn rejection_classes(&self) -> Vec<TypeUrl> {
        self.inner.class.rejection_classes()
    }

    pub(crate) fn command_dispatcher(&self) -> Arc<dyn SignalDispatcher> {
        Arc::new(Dispatcher {
            inner: Arc::clone(&self.inner),
            role: Role::Commands,
        })
    }

    pub(crate) fn event_dispatcher(&self) -> Arc<dyn SignalDispatcher> {
        Arc::new(Dispatcher {
            inner: Arc::clone(&self.inner),
            role: Role::Events,
        })
    }

    pub(crate) fn rejection_dispatcher(&self) -> Arc<dyn SignalDispatcher> {
        Arc::new(Dispatcher {
            inner: Arc::clone(&self.inner),
            role: Role::Rejections,
        })
    }

    pub(crate) fn endpoint(&self) -> Arc<dyn DispatchEndpoint> {
        Arc::new(Endpoint {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl<S: crate::signal::SignalMessage> Inner<S> {
    async fn route_and_enqueue(&self, signal: &Signal) -> DispatchOutcome {
        let Some(binding) = self.binding.get() else {
            return DispatchOutcome::Error {
                signal_id: signal.id,
                cause: "repository not attached to a context".into(),
            };
        };
        let entity_type = self.class.state_type().clone();
        let targets = match signal.kind {
            SignalKind::Command => match self.command_routing.apply(signal) {
                Ok(target) => std::iter::once(target).collect(),
                Err(e) => {
                    binding
                        .hub
                        .diagnostics
                        .publish(DiagnosticEvent::RoutingFailed {
                            signal_id: signal.id,
                            class: signal.message_class().clone(),
                            message: e.to_string(),
                        });
                    return DispatchOutcome::Error {
                        signal_id: signal.id,
                        cause: e.to_string(),
                    };
                }
            },
            SignalKind::Event => self.event_routing.apply(signal),
            SignalKind::Rejection => self.rejection_routing.apply(signal),
        };
        if targets.is_empty() {
            return DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            };
        }
        for target in targets {
            let enqueued = binding
                .writer
                .enqueue(entity_type.clone(), target, signal.clone(), false)
                .await;
            if let Err(e) = enqueued {
                return DispatchOutcome::Error {
                    signal_id: signal.id,
                    cause: e.to_string(),
                };
            }
        }
        DispatchOutcome::quiet_success(signal.id)
    }

    fn handler_failed(
        &self,
        binding: &Binding,
        signal: &Signal,
        message: String,
    ) -> Result<DispatchOutcome, DeliveryError> {
        binding
            .hub
            .diagnostics
            .publish(DiagnosticEvent::HandlerFailedUnexpectedly {
                signal_id: signal.id,
                entity_type: self.class.state_type().clone(),
                message: message.clone(),
            });
        if self.listener.propagation_required() {
            return Err(DeliveryError::Endpoint {
                signal_id: Some(signal.id),
                message,
            });
        }
        Ok(DispatchOutcome::Error {
            signal_id: signal.id,
            cause: message,
        })
    }

    async fn deliver(&self, message: &InboxMessage) -> Result<DispatchOutcome, DeliveryError> {
        let Some(binding) = self.binding.get() else {
            return Err(DeliveryError::Endpoint {
                signal_id: Some(message.signal.id),
                message: "repository not attached to a context".into(),
            });
        };
        let signal = &message.signal;
        let tenant = signal.context.tenant.clone();

        let descriptor = match signal.kind {
            SignalKind::Command => self.class.command_handler(signal),
            SignalKind::Event => self.class.reactor(signal),
            SignalKind::Rejection => self.class.rejection_reactor(signal),
        };
        let Some(descriptor) = descriptor else {
            return Ok(DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            });
        };
        let ErasedHandler::Mutate(handler) = &descriptor.handler else {
            return self.handler_failed(binding, signal, "handler must mutate state".into());
        };

        let record = match binding.storage.read(&tenant, &message.target_id).await? {
            Some(stored) => unpack_record(&stored).map_err(|e| {
                binding
                    .hub
                    .diagnostics
                    .publish(DiagnosticEvent::EntityStateCorrupted {
                        entity_type: self.class.state_type().clone(),
                        id: message.target_id.clone(),
                        message: e.to_string(),
                    });
                DeliveryError::Endpoint {
                    signal_id: Some(signal.id),
                    message: e.to_string(),
                }
            })?,
            None => EntityRecord::fresh(message.target_id.clone()),
        };

        let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement)
            .with_listener(Arc::clone(&self.listener));
        if let Some(validator) = self.class.validator() {
            tx = tx.with_validator(validator);
        }

        let mut output: Option<HandlerOutput> = None;
        let phase = tx.apply_phase(signal, |builder| {
            output = Some(handler(builder, signal)?);
            Ok(())
        });
        if let Err(e) = phase {
            // A rejection travels its own bus; anything else is a failure.
            match e {
                TransactionError::PhaseFailed {
                    source: HandlerError::Rejected(payload),
                    ..
                } => {
                    let rejection = Signal::rejection(payload, signal);
                    let rejection_id = rejection.id;
                    let ack = binding.hub.rejection_bus.post(rejection).await;
                    if !ack.is_ok() {
                        warn!(?ack, "rejection not accepted by the rejection bus");
                    }
                    return Ok(DispatchOutcome::Success {
                        signal_id: signal.id,
                        produced_events: 0,
                        produced_commands: 0,
                        rejection: Some(rejection_id),
                    });
                }
                error => {
                    if let TransactionError::ConstraintViolated { entity, message } = &error {
                        binding
                            .hub
                            .diagnostics
                            .publish(DiagnosticEvent::ConstraintViolated {
                                entity_type: self.class.state_type().clone(),
                                id: entity.clone(),
                                message: message.clone(),
                            });
                    }
                    return self.handler_failed(binding, signal, error.to_string());
                }
            }
        }

        let committed = match tx.commit() {
            Ok(committed) => committed,
            Err(e) => return self.handler_failed(binding, signal, e.to_string()),
        };
        binding
            .storage
            .write(&tenant, pack_record(&committed.record)?)
            .await?;

        match output.unwrap_or(HandlerOutput::Nothing) {
            HandlerOutput::Events(payloads) => {
                let factory = EventFactory::for_producer(committed.record.id.clone(), signal);
                let events: Vec<Signal> = payloads
                    .into_iter()
                    .map(|p| factory.create_from_payload(p, committed.record.version))
                    .collect();
                let produced = events.len() as u32;
                let acks = binding.hub.event_bus.post_all(events).await;
                for ack in acks.iter().filter(|a| !a.is_ok()) {
                    error!(?ack, "produced event not accepted by the event bus");
                }
                Ok(DispatchOutcome::Success {
                    signal_id: signal.id,
                    produced_events: produced,
                    produced_commands: 0,
                    rejection: None,
                })
            }
            HandlerOutput::Commands(payloads) => {
                let commands: Vec<Signal> = payloads
                    .into_iter()
                    .map(|p| Signal::command_from_payload(p, signal))
                    .collect();
                let produced = commands.len() as u32;
                let acks = binding.hub.command_bus.post_all(commands).await;
                for ack in acks.iter().filter(|a| !a.is_ok()) {
                    error!(?ack, "produced command not accepted by the command bus");
                }
                Ok(DispatchOutcome::Success {
                    signal_id: signal.id,
                    produced_events: 0,
                    produced_commands: produced,
                    rejection: None,
                })
            }
            HandlerOutput::Nothing => Ok(DispatchOutcome::quiet_success(signal.id)),
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Commands,
    Events,
    Rejections,
}

struct Dispatcher<S> {
    inner: Arc<Inner<S>>,
    role: Role,
}

#[async_trait]
impl<S: crate::signal::SignalMessage> SignalDispatcher for Dispatcher<S> {
    fn id(&self) -> &str {
        &self.inner.dispatcher_id
    }

    fn message_classes(&self) -> Vec<TypeUrl> {
        match self.role {
            Role::Commands => self.inner.class.command_classes(),
            Role::Events => self.inner.class.reaction_classes(),
            Role::Rejections => self.inner.class.rejection_classes(),
        }
    }

    async fn dispatch(&self, signal: &Signal) -> DispatchOutcome {
        self.inner.route_and_enqueue(signal).await
    }
}

struct Endpoint<S> {
    inner: Arc<Inner<S>>,
}

#[async_trait]
impl<S: crate::signal::SignalMessage> DispatchEndpoint for Endpoint<S> {
    fn entity_type(&self) -> &TypeUrl {
        self.inner.class.state_type()
    }

    async fn deliver(&self, message: &InboxMessage) -> Result<DispatchOutcome, DeliveryError> {
        self.inner.deliver(message).await
    }
}
