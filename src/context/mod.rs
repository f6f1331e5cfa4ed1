//! The dependency-injection root of one bounded context.
//!
//! A context is built once: the builder creates the buses, the sharded
//! delivery, and the diagnostics hub, then registers repositories —
//! running the signature checker, wiring storage, registering dispatchers
//! in the buses and endpoints in the delivery. Tests construct a fresh
//! context; there are no global singletons.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{BusError, CommandBus, EventBus, FilterChain, RejectionBus};
use crate::delivery::catch_up::CatchUpProcess;
use crate::delivery::{Delivery, DeliveryBuilder};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsHub};
use crate::integration::IntegrationBus;
use crate::interfaces::{
    NoValidationSchemaRegistry, SchemaRegistry, StorageFactory, TransportFactory,
};
use crate::model::{ModelError, Severity, SignatureMismatch};
use crate::repository::{AggregateRepository, ProcessManagerRepository, ProjectionRepository};
use crate::signal::{Ack, DispatchOutcome, Signal, SignalMessage, TypeUrl};
use crate::storage::InMemoryStorageFactory;

/// Result type for context assembly.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised while assembling a bounded context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("`{entity_type}` is already attached to a context")]
    AlreadyBound { entity_type: TypeUrl },
}

/// The bus handles and diagnostics a repository works against.
///
/// Entities and repositories never reach for a global environment; they
/// receive this hub at registration time.
#[derive(Clone)]
pub struct SignalHub {
    pub command_bus: Arc<CommandBus>,
    pub event_bus: Arc<EventBus>,
    pub rejection_bus: Arc<RejectionBus>,
    pub diagnostics: DiagnosticsHub,
}

struct Wiring {
    name: String,
    hub: SignalHub,
    delivery: Arc<Delivery>,
    storage_factory: Arc<dyn StorageFactory>,
    catch_ups: HashMap<TypeUrl, CatchUpProcess>,
}

type Registration = Box<dyn FnOnce(&mut Wiring) -> Result<()> + Send>;

/// Builder of a [`BoundedContext`].
pub struct BoundedContextBuilder {
    name: String,
    storage_factory: Option<Arc<dyn StorageFactory>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    schema_registry: Arc<dyn SchemaRegistry>,
    delivery: DeliveryBuilder,
    command_filters: FilterChain,
    event_filters: FilterChain,
    rejection_filters: FilterChain,
    auto_start_delivery: bool,
    registrations: Vec<Registration>,
}

impl BoundedContextBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        BoundedContextBuilder {
            name: name.into(),
            storage_factory: None,
            transport_factory: None,
            schema_registry: Arc::new(NoValidationSchemaRegistry),
            delivery: DeliveryBuilder::new(),
            command_filters: FilterChain::default(),
            event_filters: FilterChain::default(),
            rejection_filters: FilterChain::default(),
            auto_start_delivery: true,
            registrations: Vec::new(),
        }
    }

    pub fn with_storage(mut self, factory: Arc<dyn StorageFactory>) -> Self {
        self.storage_factory = Some(factory);
        self
    }

    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_schema_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.schema_registry = registry;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryBuilder) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn add_command_filter(mut self, filter: Arc<dyn crate::bus::BusFilter>) -> Self {
        self.command_filters.push(filter);
        self
    }

    pub fn add_event_filter(mut self, filter: Arc<dyn crate::bus::BusFilter>) -> Self {
        self.event_filters.push(filter);
        self
    }

    pub fn add_rejection_filter(mut self, filter: Arc<dyn crate::bus::BusFilter>) -> Self {
        self.rejection_filters.push(filter);
        self
    }

    /// Do not start delivery workers; the host drives shards explicitly
    /// through [`Delivery::deliver_messages_from`].
    pub fn manual_delivery(mut self) -> Self {
        self.auto_start_delivery = false;
        self
    }

    /// Register an aggregate repository.
    pub fn register_aggregate<S: SignalMessage>(
        mut self,
        repository: AggregateRepository<S>,
    ) -> Self {
        self.registrations.push(Box::new(move |wiring: &mut Wiring| {
            let entity_type = repository.entity_type().clone();
            enforce_signatures(&entity_type, repository.check())?;
            let storage = wiring
                .storage_factory
                .create_aggregate_storage(&wiring.name, &entity_type);
            if !repository.bind(storage, wiring.delivery.writer(), wiring.hub.clone()) {
                return Err(ContextError::AlreadyBound { entity_type });
            }
            wiring.hub.command_bus.register(repository.command_dispatcher())?;
            if !repository.reaction_classes().is_empty() {
                wiring.hub.event_bus.register(repository.event_dispatcher())?;
            }
            wiring.delivery.register_endpoint(repository.endpoint());
            info!(entity_type = %entity_type, commands = repository.command_classes().len(), "aggregate registered");
            Ok(())
        }));
        self
    }

    /// Register a process manager repository.
    pub fn register_process_manager<S: SignalMessage>(
        mut self,
        repository: ProcessManagerRepository<S>,
    ) -> Self {
        self.registrations.push(Box::new(move |wiring: &mut Wiring| {
            let entity_type = repository.entity_type().clone();
            enforce_signatures(&entity_type, repository.check())?;
            let storage = wiring
                .storage_factory
                .create_record_storage(&wiring.name, &entity_type);
            if !repository.bind(storage, wiring.delivery.writer(), wiring.hub.clone()) {
                return Err(ContextError::AlreadyBound { entity_type });
            }
            if !repository.command_classes().is_empty() {
                wiring.hub.command_bus.register(repository.command_dispatcher())?;
            }
            if !repository.reaction_classes().is_empty() {
                wiring.hub.event_bus.register(repository.event_dispatcher())?;
            }
            if !repository.rejection_classes().is_empty() {
                wiring
                    .hub
                    .rejection_bus
                    .register(repository.rejection_dispatcher())?;
            }
            wiring.delivery.register_endpoint(repository.endpoint());
            info!(entity_type = %entity_type, "process manager registered");
            Ok(())
        }));
        self
    }

    /// Register a projection repository. The projection also gets a
    /// catch-up process, reachable via [`BoundedContext::catch_up`].
    pub fn register_projection<S: SignalMessage>(
        mut self,
        repository: ProjectionRepository<S>,
    ) -> Self {
        self.registrations.push(Box::new(move |wiring: &mut Wiring| {
            let entity_type = repository.entity_type().clone();
            enforce_signatures(&entity_type, repository.check())?;
            let storage = wiring
                .storage_factory
                .create_projection_storage(&wiring.name, &entity_type);
            if !repository.bind(storage, wiring.delivery.writer(), wiring.hub.clone()) {
                return Err(ContextError::AlreadyBound { entity_type });
            }
            if !repository.subscription_classes().is_empty() {
                wiring.hub.event_bus.register(repository.event_dispatcher())?;
            }
            wiring.delivery.register_endpoint(repository.endpoint());

            let catch_up = CatchUpProcess::new(
                repository.catch_up_target(),
                Arc::clone(wiring.hub.event_bus.event_store()),
                Arc::clone(&wiring.hub.event_bus),
                Arc::clone(&wiring.delivery),
            );
            wiring.catch_ups.insert(entity_type.clone(), catch_up);
            info!(entity_type = %entity_type, "projection registered");
            Ok(())
        }));
        self
    }

    /// Assemble the context.
    pub fn build(self) -> Result<BoundedContext> {
        let storage_factory = self
            .storage_factory
            .unwrap_or_else(|| Arc::new(InMemoryStorageFactory::new()));
        let event_store = storage_factory.create_event_store(&self.name);
        let inbox_storage = storage_factory.create_inbox_storage(false);
        let delivery = Arc::new(self.delivery.finish(inbox_storage));

        let hub = SignalHub {
            command_bus: Arc::new(CommandBus::new(
                Arc::clone(&self.schema_registry),
                self.command_filters,
            )),
            event_bus: Arc::new(EventBus::new(
                Arc::clone(&self.schema_registry),
                self.event_filters,
                event_store,
            )),
            rejection_bus: Arc::new(RejectionBus::new(
                Arc::clone(&self.schema_registry),
                self.rejection_filters,
            )),
            diagnostics: DiagnosticsHub::new(),
        };

        let integration = self
            .transport_factory
            .map(|transport| IntegrationBus::new(&self.name, transport, Arc::clone(&hub.event_bus)));

        let mut wiring = Wiring {
            name: self.name.clone(),
            hub: hub.clone(),
            delivery: Arc::clone(&delivery),
            storage_factory: Arc::clone(&storage_factory),
            catch_ups: HashMap::new(),
        };
        for registration in self.registrations {
            registration(&mut wiring)?;
        }

        if self.auto_start_delivery {
            delivery.start_workers();
        }
        info!(context = %self.name, "bounded context built");

        Ok(BoundedContext {
            name: self.name,
            hub,
            delivery,
            integration,
            catch_ups: wiring.catch_ups,
            storage_factory,
        })
    }
}

fn enforce_signatures(entity_type: &TypeUrl, mismatches: Vec<SignatureMismatch>) -> Result<()> {
    let mut errors = Vec::new();
    for mismatch in mismatches {
        match mismatch.severity {
            Severity::Warn => warn!(entity_type = %entity_type, %mismatch, "handler signature warning"),
            Severity::Error => errors.push(mismatch),
        }
    }
    if let Some(first) = errors.first() {
        return Err(ContextError::Model(ModelError::SignatureErrors {
            entity_type: entity_type.clone(),
            count: errors.len(),
            first: first.to_string(),
        }));
    }
    Ok(())
}

/// One assembled bounded context.
pub struct BoundedContext {
    name: String,
    hub: SignalHub,
    delivery: Arc<Delivery>,
    integration: Option<IntegrationBus>,
    catch_ups: HashMap<TypeUrl, CatchUpProcess>,
    storage_factory: Arc<dyn StorageFactory>,
}

impl BoundedContext {
    pub fn builder(name: impl Into<String>) -> BoundedContextBuilder {
        BoundedContextBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post one command; the ack reflects validation and enqueueing.
    pub async fn post_command(&self, command: Signal) -> Ack {
        self.hub.command_bus.post(command).await
    }

    /// Post a batch of commands; acks come back in input order.
    pub async fn post_commands(&self, commands: Vec<Signal>) -> Vec<Ack> {
        self.hub.command_bus.post_all(commands).await
    }

    /// Post one event.
    pub async fn post_event(&self, event: Signal) -> Ack {
        self.hub.event_bus.post(event).await
    }

    pub fn command_bus(&self) -> &Arc<CommandBus> {
        &self.hub.command_bus
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.hub.event_bus
    }

    pub fn rejection_bus(&self) -> &Arc<RejectionBus> {
        &self.hub.rejection_bus
    }

    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    pub fn delivery(&self) -> &Arc<Delivery> {
        &self.delivery
    }

    pub fn integration(&self) -> Option<&IntegrationBus> {
        self.integration.as_ref()
    }

    pub fn storage_factory(&self) -> &Arc<dyn StorageFactory> {
        &self.storage_factory
    }

    /// The catch-up process of a projection type.
    pub fn catch_up(&self, projection_type: &TypeUrl) -> Option<&CatchUpProcess> {
        self.catch_ups.get(projection_type)
    }

    /// Observe diagnostic events.
    pub fn subscribe_diagnostics(
        &self,
    ) -> tokio::sync::broadcast::Receiver<DiagnosticEvent> {
        self.hub.diagnostics.subscribe()
    }

    /// Observe per-signal dispatch outcomes from the delivery layer.
    pub fn subscribe_outcomes(&self) -> tokio::sync::broadcast::Receiver<DispatchOutcome> {
        self.delivery.subscribe_outcomes()
    }

    /// Stop delivery workers and integration subscribers.
    pub async fn shutdown(&self) {
        self.delivery.shutdown().await;
        if let Some(integration) = &self.integration {
            integration.shutdown();
        }
        info!(context = %self.name, "bounded context stopped");
    }
}
