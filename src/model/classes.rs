//! Entity class metadata: handler tables with typed registration.
//!
//! An entity class is assembled once by the hosting application and then
//! owned by a repository. Registration methods capture the message types
//! in closures and erase them into [`HandlerDescriptor`] rows; parameter
//! and return shapes are recorded for the signature checker.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{
    check_signatures, ErasedHandler, FieldFilter, HandlerDescriptor, HandlerError, HandlerKind,
    HandlerMap, HandlerOutput, ParamSpec, ProducedMessages, Result, SignatureMismatch,
};
use crate::entity::{EntityId, Version};
use crate::entity::transaction::Validator;
use crate::signal::{PayloadError, Signal, SignalId, SignalMessage, TenantId, TypeUrl};

/// The view of a command's context a handler receives.
#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    signal: &'a Signal,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(signal: &'a Signal) -> Self {
        CommandContext { signal }
    }

    pub fn command_id(&self) -> SignalId {
        self.signal.id
    }

    /// The command this one was produced in reaction to, if any.
    pub fn parent_command_id(&self) -> Option<SignalId> {
        self.signal.context.parent_command_id
    }

    pub fn actor(&self) -> Option<&'a str> {
        self.signal.context.actor.as_deref()
    }

    pub fn tenant(&self) -> &'a TenantId {
        &self.signal.context.tenant
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.signal.context.timestamp
    }

    pub fn is_external(&self) -> bool {
        self.signal.is_external()
    }
}

/// The view of an event's context a handler receives.
#[derive(Clone, Copy)]
pub struct EventContext<'a> {
    signal: &'a Signal,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(signal: &'a Signal) -> Self {
        EventContext { signal }
    }

    pub fn event_id(&self) -> SignalId {
        self.signal.id
    }

    pub fn producer(&self) -> Option<&'a EntityId> {
        self.signal.context.producer.as_ref()
    }

    pub fn version(&self) -> Option<Version> {
        self.signal.context.version
    }

    pub fn parent_command_id(&self) -> Option<SignalId> {
        self.signal.context.parent_command_id
    }

    pub fn tenant(&self) -> &'a TenantId {
        &self.signal.context.tenant
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.signal.context.timestamp
    }

    pub fn is_external(&self) -> bool {
        self.signal.is_external()
    }
}

/// The view of a rejection's context a reactor receives.
///
/// Carries the chain back to the rejected command; the command message
/// itself rides in the enrichments.
#[derive(Clone, Copy)]
pub struct RejectionContext<'a> {
    signal: &'a Signal,
}

impl<'a> RejectionContext<'a> {
    pub(crate) fn new(signal: &'a Signal) -> Self {
        RejectionContext { signal }
    }

    pub fn rejection_id(&self) -> SignalId {
        self.signal.id
    }

    pub fn rejected_command_id(&self) -> Option<SignalId> {
        self.signal.context.parent_command_id
    }

    pub fn tenant(&self) -> &'a TenantId {
        &self.signal.context.tenant
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.signal.context.timestamp
    }

    /// The rejected command's message, if it was enriched onto the signal.
    pub fn command_message<C: SignalMessage>(
        &self,
    ) -> Option<std::result::Result<C, PayloadError>> {
        self.signal.context.enrichment::<C>()
    }
}

fn validator_arc<S, F>(validate: F) -> Arc<Validator<S>>
where
    F: Fn(&S) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(validate)
}

/// Metadata of an event-sourced aggregate class.
///
/// Commands are decided on the current state and produce events; each
/// produced (or replayed) event is folded into the state by an applier.
/// Reactors let the aggregate produce events in reaction to external ones.
pub struct AggregateClass<S> {
    state_type: TypeUrl,
    commands: HandlerMap<S>,
    appliers: HandlerMap<S>,
    reactors: HandlerMap<S>,
    validator: Option<Arc<Validator<S>>>,
}

impl<S: SignalMessage> Default for AggregateClass<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SignalMessage> AggregateClass<S> {
    pub fn new() -> Self {
        AggregateClass {
            state_type: TypeUrl::of::<S>(),
            commands: HandlerMap::default(),
            appliers: HandlerMap::default(),
            reactors: HandlerMap::default(),
            validator: None,
        }
    }

    /// Register a command handler: decides on the state, produces events.
    pub fn handle_command<C, P, Marker, F>(mut self, handler: F) -> Result<Self>
    where
        C: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&S, C, &CommandContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: C = signal.payload.unpack()?;
            let produced = handler(state, message, &CommandContext::new(signal))?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.commands.insert(HandlerDescriptor {
            kind: HandlerKind::CommandHandler,
            message_class: TypeUrl::of::<C>(),
            param_spec: ParamSpec::MsgCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Inspect(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register an event applier: folds one event into the state.
    pub fn apply_event<E, F>(mut self, applier: F) -> Result<Self>
    where
        E: SignalMessage,
        F: Fn(&mut S, E) + Send + Sync + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: E = signal.payload.unpack()?;
            applier(state, message);
            Ok(HandlerOutput::Nothing)
        };
        self.appliers.insert(HandlerDescriptor {
            kind: HandlerKind::EventApplier,
            message_class: TypeUrl::of::<E>(),
            param_spec: ParamSpec::Msg,
            return_spec: super::ReturnSpec::Nothing,
            produced_classes: Vec::new(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register a fallible event applier.
    ///
    /// Most appliers are total; use this for folds that can detect a
    /// corrupt history and must abort the transaction.
    pub fn try_apply_event<E, F>(mut self, applier: F) -> Result<Self>
    where
        E: SignalMessage,
        F: Fn(&mut S, E) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: E = signal.payload.unpack()?;
            applier(state, message)?;
            Ok(HandlerOutput::Nothing)
        };
        self.appliers.insert(HandlerDescriptor {
            kind: HandlerKind::EventApplier,
            message_class: TypeUrl::of::<E>(),
            param_spec: ParamSpec::Msg,
            return_spec: super::ReturnSpec::Nothing,
            produced_classes: Vec::new(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register an event reactor: produces events in reaction to one.
    pub fn react_on_event<E, P, Marker, F>(mut self, reactor: F) -> Result<Self>
    where
        E: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&S, E, &EventContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: E = signal.payload.unpack()?;
            let produced = reactor(state, message, &EventContext::new(signal))?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.reactors.insert(HandlerDescriptor {
            kind: HandlerKind::EventReactor,
            message_class: TypeUrl::of::<E>(),
            param_spec: ParamSpec::EventMsgEventCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Inspect(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Attach a state invariant validator, run on the builder each phase.
    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&S) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(validator_arc(validate));
        self
    }

    pub fn state_type(&self) -> &TypeUrl {
        &self.state_type
    }

    pub fn command_classes(&self) -> Vec<TypeUrl> {
        self.commands.classes()
    }

    pub fn reaction_classes(&self) -> Vec<TypeUrl> {
        self.reactors.classes()
    }

    pub fn command_handler(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.commands.handler_for(signal)
    }

    pub fn applier(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.appliers.handler_for(signal)
    }

    pub fn reactor(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.reactors.handler_for(signal)
    }

    pub fn validator(&self) -> Option<Arc<Validator<S>>> {
        self.validator.clone()
    }

    /// Run the signature checker over every handler table of this class.
    pub fn check(&self) -> Vec<SignatureMismatch> {
        check_signatures(
            self.commands
                .descriptors()
                .chain(self.appliers.descriptors())
                .chain(self.reactors.descriptors()),
        )
    }
}

/// Metadata of a process manager class.
///
/// State is mutated directly by commands, events, and rejections; the
/// process may emit events or substitute commands with new commands.
pub struct ProcessManagerClass<S> {
    state_type: TypeUrl,
    commands: HandlerMap<S>,
    substitutes: HandlerMap<S>,
    reactors: HandlerMap<S>,
    rejection_reactors: HandlerMap<S>,
    validator: Option<Arc<Validator<S>>>,
}

impl<S: SignalMessage> Default for ProcessManagerClass<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SignalMessage> ProcessManagerClass<S> {
    pub fn new() -> Self {
        ProcessManagerClass {
            state_type: TypeUrl::of::<S>(),
            commands: HandlerMap::default(),
            substitutes: HandlerMap::default(),
            reactors: HandlerMap::default(),
            rejection_reactors: HandlerMap::default(),
            validator: None,
        }
    }

    /// Register a command handler: mutates the state, produces events.
    pub fn handle_command<C, P, Marker, F>(mut self, handler: F) -> Result<Self>
    where
        C: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&mut S, C, &CommandContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: C = signal.payload.unpack()?;
            let produced = handler(state, message, &CommandContext::new(signal))?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.commands.insert(HandlerDescriptor {
            kind: HandlerKind::CommandHandler,
            message_class: TypeUrl::of::<C>(),
            param_spec: ParamSpec::MsgCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register a command substitute: consumes a command, emits commands.
    pub fn substitute_command<C, P, Marker, F>(mut self, substitute: F) -> Result<Self>
    where
        C: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&mut S, C, &CommandContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: C = signal.payload.unpack()?;
            let produced = substitute(state, message, &CommandContext::new(signal))?;
            Ok(HandlerOutput::Commands(produced.into_payloads()?))
        };
        self.substitutes.insert(HandlerDescriptor {
            kind: HandlerKind::CommandSubstitute,
            message_class: TypeUrl::of::<C>(),
            param_spec: ParamSpec::MsgCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register an event reactor: mutates the state, may produce events.
    pub fn react_on_event<E, P, Marker, F>(mut self, reactor: F) -> Result<Self>
    where
        E: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&mut S, E, &EventContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: E = signal.payload.unpack()?;
            let produced = reactor(state, message, &EventContext::new(signal))?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.reactors.insert(HandlerDescriptor {
            kind: HandlerKind::EventReactor,
            message_class: TypeUrl::of::<E>(),
            param_spec: ParamSpec::EventMsgEventCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register a rejection reactor.
    pub fn react_on_rejection<R, P, Marker, F>(mut self, reactor: F) -> Result<Self>
    where
        R: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&mut S, R, &RejectionContext<'_>) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: R = signal.payload.unpack()?;
            let produced = reactor(state, message, &RejectionContext::new(signal))?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.rejection_reactors.insert(HandlerDescriptor {
            kind: HandlerKind::RejectionReactor,
            message_class: TypeUrl::of::<R>(),
            param_spec: ParamSpec::RejectionMsgCmdCtx,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Register a rejection reactor that also receives the rejected
    /// command's message.
    pub fn react_on_rejection_with_command<R, C, P, Marker, F>(
        mut self,
        reactor: F,
    ) -> Result<Self>
    where
        R: SignalMessage,
        C: SignalMessage,
        P: ProducedMessages<Marker> + 'static,
        F: Fn(&mut S, R, &RejectionContext<'_>, C) -> std::result::Result<P, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: R = signal.payload.unpack()?;
            let ctx = RejectionContext::new(signal);
            let command: C = ctx
                .command_message::<C>()
                .ok_or_else(|| HandlerError::failed("rejected command message unavailable"))??;
            let produced = reactor(state, message, &ctx, command)?;
            Ok(HandlerOutput::Events(produced.into_payloads()?))
        };
        self.rejection_reactors.insert(HandlerDescriptor {
            kind: HandlerKind::RejectionReactor,
            message_class: TypeUrl::of::<R>(),
            param_spec: ParamSpec::RejectionMsgCmdCtxCmdMsg,
            return_spec: P::RETURN_SPEC,
            produced_classes: P::classes(),
            field_filter: None,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Attach a state invariant validator.
    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&S) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(validator_arc(validate));
        self
    }

    pub fn state_type(&self) -> &TypeUrl {
        &self.state_type
    }

    pub fn command_classes(&self) -> Vec<TypeUrl> {
        let mut classes = self.commands.classes();
        classes.extend(self.substitutes.classes());
        classes.sort();
        classes.dedup();
        classes
    }

    pub fn reaction_classes(&self) -> Vec<TypeUrl> {
        self.reactors.classes()
    }

    pub fn rejection_classes(&self) -> Vec<TypeUrl> {
        self.rejection_reactors.classes()
    }

    pub fn command_handler(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.commands
            .handler_for(signal)
            .or_else(|| self.substitutes.handler_for(signal))
    }

    pub fn reactor(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.reactors.handler_for(signal)
    }

    pub fn rejection_reactor(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.rejection_reactors.handler_for(signal)
    }

    pub fn validator(&self) -> Option<Arc<Validator<S>>> {
        self.validator.clone()
    }

    pub fn check(&self) -> Vec<SignatureMismatch> {
        check_signatures(
            self.commands
                .descriptors()
                .chain(self.substitutes.descriptors())
                .chain(self.reactors.descriptors())
                .chain(self.rejection_reactors.descriptors()),
        )
    }
}

/// Metadata of a projection class.
///
/// State is mutated by event subscribers only; versions auto-increment.
pub struct ProjectionClass<S> {
    state_type: TypeUrl,
    subscribers: HandlerMap<S>,
    validator: Option<Arc<Validator<S>>>,
}

impl<S: SignalMessage> Default for ProjectionClass<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SignalMessage> ProjectionClass<S> {
    pub fn new() -> Self {
        ProjectionClass {
            state_type: TypeUrl::of::<S>(),
            subscribers: HandlerMap::default(),
            validator: None,
        }
    }

    /// Register an event subscriber.
    pub fn subscribe_to_event<E, F>(self, subscriber: F) -> Result<Self>
    where
        E: SignalMessage,
        F: Fn(&mut S, E, &EventContext<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.subscribe_filtered(None, subscriber)
    }

    /// Register an event subscriber narrowed to messages whose payload
    /// `field` equals `value`.
    pub fn subscribe_to_event_where<E, F>(
        self,
        field: impl Into<String>,
        value: serde_json::Value,
        subscriber: F,
    ) -> Result<Self>
    where
        E: SignalMessage,
        F: Fn(&mut S, E, &EventContext<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.subscribe_filtered(
            Some(FieldFilter {
                field: field.into(),
                value,
            }),
            subscriber,
        )
    }

    fn subscribe_filtered<E, F>(mut self, filter: Option<FieldFilter>, subscriber: F) -> Result<Self>
    where
        E: SignalMessage,
        F: Fn(&mut S, E, &EventContext<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |state: &mut S,
                           signal: &Signal|
              -> std::result::Result<HandlerOutput, HandlerError> {
            let message: E = signal.payload.unpack()?;
            subscriber(state, message, &EventContext::new(signal))?;
            Ok(HandlerOutput::Nothing)
        };
        self.subscribers.insert(HandlerDescriptor {
            kind: HandlerKind::EventSubscriber,
            message_class: TypeUrl::of::<E>(),
            param_spec: ParamSpec::EventMsgEventCtx,
            return_spec: super::ReturnSpec::Nothing,
            produced_classes: Vec::new(),
            field_filter: filter,
            handler: ErasedHandler::Mutate(Arc::new(erased)),
        })?;
        Ok(self)
    }

    /// Attach a state invariant validator.
    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&S) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(validator_arc(validate));
        self
    }

    pub fn state_type(&self) -> &TypeUrl {
        &self.state_type
    }

    pub fn subscription_classes(&self) -> Vec<TypeUrl> {
        self.subscribers.classes()
    }

    pub fn subscriber(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        self.subscribers.handler_for(signal)
    }

    pub fn validator(&self) -> Option<Arc<Validator<S>>> {
        self.validator.clone()
    }

    pub fn check(&self) -> Vec<SignatureMismatch> {
        check_signatures(self.subscribers.descriptors())
    }
}
