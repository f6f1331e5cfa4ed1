//! Projection repository.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::bus::SignalDispatcher;
use crate::context::SignalHub;
use crate::delivery::catch_up::CatchUpTarget;
use crate::delivery::{DeliveryError, DispatchEndpoint, InboxMessage, InboxWriter};
use crate::diagnostics::DiagnosticEvent;
use crate::entity::transaction::{NoOpListener, TransactionError};
use crate::entity::{EntityId, EntityRecord, Transaction, TransactionListener, VersioningStrategy};
use crate::interfaces::{RecordStorage, StorageError};
use crate::model::{ErasedHandler, ProjectionClass};
use crate::route::EventRouting;
use crate::signal::{DispatchOutcome, IgnoreReason, Signal, SignalKind, TenantId, TypeUrl};

use super::{pack_record, unpack_record};

struct Binding {
    storage: Arc<dyn RecordStorage>,
    writer: InboxWriter,
    hub: SignalHub,
}

struct Inner<S> {
    class: ProjectionClass<S>,
    event_routing: EventRouting,
    listener: Arc<dyn TransactionListener<S>>,
    binding: OnceLock<Binding>,
    dispatcher_id: String,
}

/// Repository of one projection class.
///
/// Projection state derives from events only; versions auto-increment
/// per applied event. Catch-up rebuilds the state from the event store
/// through the same endpoint.
pub struct ProjectionRepository<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ProjectionRepository<S> {
    fn clone(&self) -> Self {
        ProjectionRepository {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: crate::signal::SignalMessage> ProjectionRepository<S> {
    pub fn new(class: ProjectionClass<S>, event_routing: EventRouting) -> Self {
        let dispatcher_id = format!("projection:{}", class.state_type());
        ProjectionRepository {
            inner: Arc::new(Inner {
                class,
                event_routing,
                listener: Arc::new(NoOpListener),
                binding: OnceLock::new(),
                dispatcher_id,
            }),
        }
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

    /// Read the current state of one projection instance.
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

    /// Known projection instances of a tenant.
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

    pub(crate) fn subscription_classes(&self) -> Vec<TypeUrl> {
        self.inner.class.subscription_classes()
    }

    pub(crate) fn event_dispatcher(&self) -> Arc<dyn SignalDispatcher> {
        Arc::new(Dispatcher {
            inner: Arc::clone(&self.inner),
        })
    }

    pub(crate) fn endpoint(&self) -> Arc<dyn DispatchEndpoint> {
        Arc::new(Endpoint {
            inner: Arc::clone(&self.inner),
        })
    }

    pub(crate) fn catch_up_target(&self) -> Arc<dyn CatchUpTarget> {
        Arc::new(Target {
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
        if signal.kind != SignalKind::Event {
            return DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            };
        }
        let targets = self.event_routing.apply(signal);
        if targets.is_empty() {
            return DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            };
        }
        for target in targets {
            let enqueued = binding
                .writer
                .enqueue(
                    self.class.state_type().clone(),
                    target,
                    signal.clone(),
                    false,
                )
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

        if signal.kind != SignalKind::Event {
            return Ok(DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            });
        }
        let Some(descriptor) = self.class.subscriber(signal) else {
            return Ok(DispatchOutcome::Ignored {
                signal_id: signal.id,
                reason: IgnoreReason::OutOfScope,
            });
        };
        let ErasedHandler::Mutate(handler) = &descriptor.handler else {
            return self.handler_failed(binding, signal, "subscriber must mutate state".into());
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

        let phase = tx.apply_phase(signal, |builder| handler(builder, signal).map(drop));
        if let Err(e) = phase {
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
            return self.handler_failed(binding, signal, e.to_string());
        }

        let committed = match tx.commit() {
            Ok(committed) => committed,
            Err(e) => return self.handler_failed(binding, signal, e.to_string()),
        };
        binding
            .storage
            .write(&tenant, pack_record(&committed.record)?)
            .await?;
        Ok(DispatchOutcome::quiet_success(signal.id))
    }
}

struct Dispatcher<S> {
    inner: Arc<Inner<S>>,
}

#[async_trait]
impl<S: crate::signal::SignalMessage> SignalDispatcher for Dispatcher<S> {
    fn id(&self) -> &str {
        &self.inner.dispatcher_id
    }

    fn message_classes(&self) -> Vec<TypeUrl> {
        self.inner.class.subscription_classes()
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

struct Target<S> {
    inner: Arc<Inner<S>>,
}

#[async_trait]
impl<S: crate::signal::SignalMessage> CatchUpTarget for Target<S> {
    fn projection_type(&self) -> &TypeUrl {
        self.inner.class.state_type()
    }

    async fn purge(
        &self,
        tenant: &TenantId,
        targets: &BTreeSet<EntityId>,
    ) -> Result<(), StorageError> {
        let Some(binding) = self.inner.binding.get() else {
            return Err(StorageError::Unavailable(
                "repository not attached to a context".into(),
            ));
        };
        let ids: Vec<EntityId> = if targets.is_empty() {
            binding.storage.index(tenant).await?
        } else {
            targets.iter().cloned().collect()
        };
        for id in ids {
            binding.storage.delete(tenant, &id).await?;
        }
        Ok(())
    }

    async fn dispatch_replay(
        &self,
        event: &Signal,
        narrow_to: &BTreeSet<EntityId>,
    ) -> Result<BTreeSet<EntityId>, StorageError> {
        let Some(binding) = self.inner.binding.get() else {
            return Err(StorageError::Unavailable(
                "repository not attached to a context".into(),
            ));
        };
        let routed = self.inner.event_routing.apply(event);
        let targets: BTreeSet<EntityId> = if narrow_to.is_empty() {
            routed
        } else {
            routed.intersection(narrow_to).cloned().collect()
        };
        for target in &targets {
            binding
                .writer
                .enqueue(
                    self.inner.class.state_type().clone(),
                    target.clone(),
                    event.clone(),
                    true,
                )
                .await?;
        }
        Ok(targets)
    }
}
