//! Event-sourced aggregate repository.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{error, warn};

use crate::context::SignalHub;
use crate::delivery::{DeliveryError, DispatchEndpoint, InboxMessage, InboxWriter};
use crate::diagnostics::DiagnosticEvent;
use crate::entity::{
    EntityId, EntityRecord, Transaction, TransactionListener, Version, VersioningStrategy,
};
use crate::entity::transaction::{NoOpListener, TransactionError};
use crate::interfaces::{AggregateStorage, StateSnapshot, StorageError};
use crate::model::{AggregateClass, ErasedHandler, HandlerError, HandlerOutput};
use crate::route::{CommandRouting, EventRouting};
use crate::signal::{
    AnyPayload, DispatchOutcome, EventFactory, IgnoreReason, Signal, SignalKind, TenantId, TypeUrl,
};
use crate::bus::SignalDispatcher;

struct Binding {
    storage: Arc<dyn AggregateStorage>,
    writer: InboxWriter,
    hub: SignalHub,
}

struct Inner<S> {
    class: AggregateClass<S>,
    command_routing: CommandRouting,
    event_routing: EventRouting,
    snapshot_every: Option<u64>,
    listener: Arc<dyn TransactionListener<S>>,
    binding: OnceLock<Binding>,
    dispatcher_id: String,
}

/// Repository of one event-sourced aggregate class.
///
/// State is the fold of the aggregate's event history; `find` replays it
/// (snapshot-optimized). Command handlers decide on the current state and
/// the produced events are applied phase by phase inside a transaction
/// with the `FromEvent` version strategy.
pub struct AggregateRepository<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for AggregateRepository<S> {
    fn clone(&self) -> Self {
        AggregateRepository {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: crate::signal::SignalMessage> AggregateRepository<S> {
    pub fn new(class: AggregateClass<S>, command_routing: CommandRouting) -> Self {
        let dispatcher_id = format!("aggregate:{}", class.state_type());
        AggregateRepository {
            inner: Arc::new(Inner {
                class,
                command_routing,
                event_routing: EventRouting::by_producer(),
                snapshot_every: None,
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

    /// Snapshot the state every `n` events.
    pub fn with_snapshot_every(mut self, n: u64) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("unshared before registration");
        inner.snapshot_every = Some(n.max(1));
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

    /// Load the current state of one aggregate, `None` if it never
    /// produced an event.
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
            Some(_) => match self.inner.load(binding, tenant, id).await {
                Ok(record) => Ok(Some(record)),
                Err(DeliveryError::Storage(e)) => Err(e),
                Err(e) => Err(StorageError::Unavailable(e.to_string())),
            },
        }
    }

    /// Known aggregate ids of a tenant.
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
        storage: Arc<dyn AggregateStorage>,
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

    pub(crate) fn endpoint(&self) -> Arc<dyn DispatchEndpoint> {
        Arc::new(Endpoint {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl<S: crate::signal::SignalMessage> Inner<S> {
    /// Route a bus signal and enqueue it for its targets.
    async fn route_and_enqueue(&self, signal: &Signal) -> DispatchOutcome {
        let Some(binding) = self.binding.get() else {
            return DispatchOutcome::Error {
                signal_id: signal.id,
                cause: "repository not attached to a context".into(),
            };
        };
        let entity_type = self.class.state_type().clone();
        match signal.kind {
            SignalKind::Command => match self.command_routing.apply(signal) {
                Ok(target) => {
                    self.enqueue_one(binding, entity_type, target, signal).await
                }
                Err(e) => {
                    binding.hub.diagnostics.publish(DiagnosticEvent::RoutingFailed {
                        signal_id: signal.id,
                        class: signal.message_class().clone(),
                        message: e.to_string(),
                    });
                    DispatchOutcome::Error {
                        signal_id: signal.id,
                        cause: e.to_string(),
                    }
                }
            },
            SignalKind::Event => {
                let targets = self.event_routing.apply(signal);
                if targets.is_empty() {
                    return DispatchOutcome::Ignored {
                        signal_id: signal.id,
                        reason: IgnoreReason::OutOfScope,
                    };
                }
                for target in targets {
                    let outcome = self
                        .enqueue_one(binding, entity_type.clone(), target, signal)
                        .await;
                    if !outcome.is_success() {
                        return outcome;
                    }
                }
                DispatchOutcome::quiet_success(signal.id)
            }
            SignalKind::Rejection => DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            },
        }
    }

    async fn enqueue_one(
        &self,
        binding: &Binding,
        entity_type: TypeUrl,
        target: EntityId,
        signal: &Signal,
    ) -> DispatchOutcome {
        match binding
            .writer
            .enqueue(entity_type, target, signal.clone(), false)
            .await
        {
            Ok(_) => DispatchOutcome::quiet_success(signal.id),
            Err(e) => DispatchOutcome::Error {
                signal_id: signal.id,
                cause: e.to_string(),
            },
        }
    }

    /// Replay one aggregate from its stored history.
    async fn load(
        &self,
        binding: &Binding,
        tenant: &TenantId,
        id: &EntityId,
    ) -> Result<EntityRecord<S>, DeliveryError> {
        let Some(history) = binding.storage.read(tenant, id).await? else {
            return Ok(EntityRecord::fresh(id.clone()));
        };
        let (mut state, mut version) = match &history.snapshot {
            Some(snapshot) => (
                snapshot
                    .state
                    .unpack::<S>()
                    .map_err(|e| self.corrupted(binding, id, e.to_string()))?,
                snapshot.version,
            ),
            None => (S::default(), Version::initial()),
        };
        for event in &history.events {
            let Some(descriptor) = self.class.applier(event) else {
                return Err(self.corrupted(
                    binding,
                    id,
                    format!("no applier for stored event `{}`", event.message_class()),
                ));
            };
            let ErasedHandler::Mutate(apply) = &descriptor.handler else {
                return Err(self.corrupted(binding, id, "applier is not a mutator".into()));
            };
            apply(&mut state, event)
                .map(drop)
                .map_err(|e| self.corrupted(binding, id, e.to_string()))?;
            if let Some(v) = event.context.version {
                version = v;
            }
        }
        Ok(EntityRecord {
            id: id.clone(),
            state,
            version,
            flags: history.flags,
        })
    }

    fn corrupted(&self, binding: &Binding, id: &EntityId, message: String) -> DeliveryError {
        binding
            .hub
            .diagnostics
            .publish(DiagnosticEvent::EntityStateCorrupted {
                entity_type: self.class.state_type().clone(),
                id: id.clone(),
                message: message.clone(),
            });
        DeliveryError::Endpoint {
            signal_id: None,
            message,
        }
    }

    /// Report a handler failure: diagnostics, then either a fatal error
    /// (listener requires propagation) or a contained error outcome.
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

    /// Apply produced events to the entity, persist, and post them.
    async fn apply_and_store(
        &self,
        binding: &Binding,
        tenant: &TenantId,
        record: EntityRecord<S>,
        trigger: &Signal,
        payloads: Vec<AnyPayload>,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let prior_version = record.version;
        let factory = EventFactory::for_producer(record.id.clone(), trigger);
        let mut tx = Transaction::start(&record, VersioningStrategy::FromEvent)
            .with_listener(Arc::clone(&self.listener));
        if let Some(validator) = self.class.validator() {
            tx = tx.with_validator(validator);
        }

        let mut events = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let version = Version::of(tx.current_version().number + 1);
            let event = factory.create_from_payload(payload, version);
            let Some(descriptor) = self.class.applier(&event) else {
                return self.handler_failed(
                    binding,
                    trigger,
                    format!("no applier for produced event `{}`", event.message_class()),
                );
            };
            let ErasedHandler::Mutate(apply) = &descriptor.handler else {
                return self.handler_failed(binding, trigger, "applier is not a mutator".into());
            };
            match tx.apply_phase(&event, |builder| apply(builder, &event).map(drop)) {
                Ok(()) => events.push(event),
                Err(e) => {
                    if let TransactionError::ConstraintViolated { entity, message } = &e {
                        binding
                            .hub
                            .diagnostics
                            .publish(DiagnosticEvent::ConstraintViolated {
                                entity_type: self.class.state_type().clone(),
                                id: entity.clone(),
                                message: message.clone(),
                            });
                    }
                    return self.handler_failed(binding, trigger, e.to_string());
                }
            }
        }

        let committed = match tx.commit() {
            Ok(committed) => committed,
            Err(e) => return self.handler_failed(binding, trigger, e.to_string()),
        };
        let produced = events.len() as u32;

        let snapshot = self.snapshot_due(&prior_version, &committed.record)?;
        binding
            .storage
            .append(
                tenant,
                &committed.record.id,
                events.clone(),
                snapshot,
                committed.record.flags,
            )
            .await?;

        // Produced events hit the bus in handler order, right after the
        // commit is durable.
        let acks = binding.hub.event_bus.post_all(events).await;
        for ack in acks.iter().filter(|a| !a.is_ok()) {
            error!(?ack, "produced event not accepted by the event bus");
        }

        Ok(DispatchOutcome::Success {
            signal_id: trigger.id,
            produced_events: produced,
            produced_commands: 0,
            rejection: None,
        })
    }

    fn snapshot_due(
        &self,
        prior: &Version,
        record: &EntityRecord<S>,
    ) -> Result<Option<StateSnapshot>, DeliveryError> {
        let Some(every) = self.snapshot_every else {
            return Ok(None);
        };
        if record.version.number / every == prior.number / every {
            return Ok(None);
        }
        let state = AnyPayload::pack_unchecked(&record.state)
            .map_err(|e| DeliveryError::Storage(StorageError::Serialization(e)))?;
        Ok(Some(StateSnapshot {
            state,
            version: record.version,
        }))
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
            SignalKind::Rejection => None,
        };
        let Some(descriptor) = descriptor else {
            return Ok(DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            });
        };
        let ErasedHandler::Inspect(handler) = &descriptor.handler else {
            return self.handler_failed(binding, signal, "handler must not mutate state".into());
        };

        let record = self.load(binding, &tenant, &message.target_id).await?;
        match handler(&record.state, signal) {
            Ok(HandlerOutput::Events(payloads)) => {
                self.apply_and_store(binding, &tenant, record, signal, payloads)
                    .await
            }
            Ok(HandlerOutput::Nothing) => Ok(DispatchOutcome::quiet_success(signal.id)),
            Ok(HandlerOutput::Commands(_)) => {
                self.handler_failed(binding, signal, "aggregates cannot produce commands".into())
            }
            Err(HandlerError::Rejected(payload)) => {
                let rejection = Signal::rejection(payload, signal);
                let rejection_id = rejection.id;
                let ack = binding.hub.rejection_bus.post(rejection).await;
                if !ack.is_ok() {
                    warn!(?ack, "rejection not accepted by the rejection bus");
                }
                Ok(DispatchOutcome::Success {
                    signal_id: signal.id,
                    produced_events: 0,
                    produced_commands: 0,
                    rejection: Some(rejection_id),
                })
            }
            Err(e) => self.handler_failed(binding, signal, e.to_string()),
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Commands,
    Events,
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
