//! Handler model: descriptor tables and the signature checker.
//!
//! Entities expose their behavior as handler tables built at registration
//! time. Each entry records the handler kind, the consumed message class,
//! the parameter and return shapes, and a type-erased function. The
//! signature checker is a pure predicate over these tables; there is no
//! runtime introspection.

mod classes;

pub use classes::{
    AggregateClass, CommandContext, EventContext, ProcessManagerClass, ProjectionClass,
    RejectionContext,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::signal::{AnyPayload, PayloadError, Signal, SignalMessage, TypeUrl};

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while assembling or validating handler tables.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("duplicate {kind} for `{class}`{}", fmt_filter(.filter))]
    DuplicateHandler {
        kind: HandlerKind,
        class: TypeUrl,
        filter: Option<FieldFilter>,
    },

    #[error("handler table of `{entity_type}` has {count} signature error(s): {first}")]
    SignatureErrors {
        entity_type: TypeUrl,
        count: usize,
        first: String,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

fn fmt_filter(filter: &Option<FieldFilter>) -> String {
    match filter {
        Some(f) => format!(" where {f}"),
        None => String::new(),
    }
}

/// What a handler does with the message it consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    CommandHandler,
    CommandSubstitute,
    EventApplier,
    EventReactor,
    RejectionReactor,
    EventSubscriber,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::CommandHandler => "command handler",
            HandlerKind::CommandSubstitute => "command substitute",
            HandlerKind::EventApplier => "event applier",
            HandlerKind::EventReactor => "event reactor",
            HandlerKind::RejectionReactor => "rejection reactor",
            HandlerKind::EventSubscriber => "event subscriber",
        };
        f.write_str(name)
    }
}

/// The parameter shape of a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamSpec {
    Msg,
    MsgCtx,
    EventMsgEventCtx,
    RejectionMsgCmdCtx,
    RejectionMsgCmdCtxCmdMsg,
}

/// The return shape of a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnSpec {
    Single,
    Iterable,
    Optional,
    Pair,
    Nothing,
}

/// Failure of a single handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Business logic turned the signal down; carries the rejection message.
    #[error("rejected with `{}`", .0.type_url)]
    Rejected(AnyPayload),

    /// The handler failed unexpectedly.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl HandlerError {
    /// Reject the consumed signal with a typed rejection message.
    pub fn reject<R: SignalMessage>(rejection: &R) -> Self {
        match AnyPayload::pack(rejection) {
            Ok(payload) => HandlerError::Rejected(payload),
            Err(error) => HandlerError::Payload(error),
        }
    }

    /// Fail unexpectedly with a message.
    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// What a successful handler produced.
#[derive(Clone, Debug)]
pub enum HandlerOutput {
    Events(Vec<AnyPayload>),
    Commands(Vec<AnyPayload>),
    Nothing,
}

/// Type-erased handler function over an entity state `S`.
#[derive(Clone)]
pub enum ErasedHandler<S> {
    /// Reads the state; state mutation happens through produced events.
    Inspect(Arc<dyn Fn(&S, &Signal) -> std::result::Result<HandlerOutput, HandlerError> + Send + Sync>),
    /// Mutates the state builder directly.
    Mutate(
        Arc<dyn Fn(&mut S, &Signal) -> std::result::Result<HandlerOutput, HandlerError> + Send + Sync>,
    ),
}

/// An optional value filter narrowing a handler to messages whose given
/// payload field equals the given value.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: serde_json::Value,
}

impl FieldFilter {
    /// Whether the payload satisfies the filter.
    pub fn matches(&self, payload: &AnyPayload) -> bool {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&payload.value) else {
            return false;
        };
        value.get(&self.field) == Some(&self.value)
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.field, self.value)
    }
}

/// One row of a handler table.
#[derive(Clone)]
pub struct HandlerDescriptor<S> {
    pub kind: HandlerKind,
    pub message_class: TypeUrl,
    pub param_spec: ParamSpec,
    pub return_spec: ReturnSpec,
    /// Message classes this handler can produce, known at registration.
    pub produced_classes: Vec<TypeUrl>,
    pub field_filter: Option<FieldFilter>,
    pub handler: ErasedHandler<S>,
}

impl<S> fmt::Debug for HandlerDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind)
            .field("message_class", &self.message_class)
            .field("param_spec", &self.param_spec)
            .field("return_spec", &self.return_spec)
            .field("field_filter", &self.field_filter)
            .finish()
    }
}

/// A table of handlers keyed by consumed message class.
///
/// Two handlers for the same `(message_class, field_filter)` pair are a
/// registration error.
pub struct HandlerMap<S> {
    by_class: BTreeMap<TypeUrl, Vec<HandlerDescriptor<S>>>,
}

impl<S> Default for HandlerMap<S> {
    fn default() -> Self {
        HandlerMap {
            by_class: BTreeMap::new(),
        }
    }
}

impl<S> HandlerMap<S> {
    pub fn insert(&mut self, descriptor: HandlerDescriptor<S>) -> Result<()> {
        let row = self.by_class.entry(descriptor.message_class.clone()).or_default();
        if row.iter().any(|d| d.field_filter == descriptor.field_filter) {
            return Err(ModelError::DuplicateHandler {
                kind: descriptor.kind,
                class: descriptor.message_class,
                filter: descriptor.field_filter,
            });
        }
        row.push(descriptor);
        Ok(())
    }

    /// The handler applicable to the signal: a matching field-filtered
    /// entry wins over the filterless one.
    pub fn handler_for(&self, signal: &Signal) -> Option<&HandlerDescriptor<S>> {
        let row = self.by_class.get(signal.message_class())?;
        row.iter()
            .find(|d| {
                d.field_filter
                    .as_ref()
                    .is_some_and(|f| f.matches(&signal.payload))
            })
            .or_else(|| row.iter().find(|d| d.field_filter.is_none()))
    }

    /// All message classes with at least one handler.
    pub fn classes(&self) -> Vec<TypeUrl> {
        self.by_class.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor<S>> {
        self.by_class.values().flatten()
    }
}

/// Severity of a signature mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Logged; registration proceeds.
    Warn,
    /// Prevents registration.
    Error,
}

/// One criterion a handler failed to meet.
#[derive(Clone, Debug)]
pub struct SignatureMismatch {
    pub severity: Severity,
    pub kind: HandlerKind,
    pub message_class: TypeUrl,
    pub description: String,
}

impl fmt::Display for SignatureMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for `{}`: {}",
            self.kind, self.message_class, self.description
        )
    }
}

/// Check every descriptor of an entity class against the signature rules.
///
/// Rules:
/// - a handler must not produce the message class it consumes (ERROR);
/// - appliers and subscribers must return nothing (ERROR);
/// - producing kinds declared with `Nothing` return are suspicious (WARN).
pub fn check_signatures<'a, S: 'a>(
    descriptors: impl Iterator<Item = &'a HandlerDescriptor<S>>,
) -> Vec<SignatureMismatch> {
    let mut mismatches = Vec::new();
    for descriptor in descriptors {
        if descriptor
            .produced_classes
            .contains(&descriptor.message_class)
        {
            mismatches.push(SignatureMismatch {
                severity: Severity::Error,
                kind: descriptor.kind,
                message_class: descriptor.message_class.clone(),
                description: "produces the message class it consumes".to_string(),
            });
        }
        match descriptor.kind {
            HandlerKind::EventApplier | HandlerKind::EventSubscriber => {
                if descriptor.return_spec != ReturnSpec::Nothing {
                    mismatches.push(SignatureMismatch {
                        severity: Severity::Error,
                        kind: descriptor.kind,
                        message_class: descriptor.message_class.clone(),
                        description: "must not return messages".to_string(),
                    });
                }
            }
            HandlerKind::CommandHandler
            | HandlerKind::CommandSubstitute
            | HandlerKind::EventReactor
            | HandlerKind::RejectionReactor => {
                if descriptor.return_spec == ReturnSpec::Nothing {
                    mismatches.push(SignatureMismatch {
                        severity: Severity::Warn,
                        kind: descriptor.kind,
                        message_class: descriptor.message_class.clone(),
                        description: "never produces messages".to_string(),
                    });
                }
            }
        }
    }
    mismatches
}

/// Marker for [`ProducedMessages`] implemented on a single message.
pub struct SingleMarker;
/// Marker for [`ProducedMessages`] implemented on `Vec<M>`.
pub struct IterableMarker;
/// Marker for [`ProducedMessages`] implemented on `Option<M>`.
pub struct OptionalMarker;
/// Marker for [`ProducedMessages`] implemented on a two-tuple.
pub struct PairMarker;
/// Marker for [`ProducedMessages`] implemented on `()`.
pub struct NothingMarker;

/// A handler return value: one of the enumerated return shapes.
///
/// The marker parameter keeps the shape implementations coherent; it is
/// inferred at registration and never written by hand.
pub trait ProducedMessages<Marker>: Send {
    const RETURN_SPEC: ReturnSpec;

    /// The message classes this shape can produce, known statically.
    fn classes() -> Vec<TypeUrl>;

    /// Serialize into payloads, dropping nothing silently.
    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError>;
}

impl<M: SignalMessage> ProducedMessages<SingleMarker> for M {
    const RETURN_SPEC: ReturnSpec = ReturnSpec::Single;

    fn classes() -> Vec<TypeUrl> {
        vec![TypeUrl::of::<M>()]
    }

    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError> {
        Ok(vec![AnyPayload::pack(&self)?])
    }
}

impl<M: SignalMessage> ProducedMessages<IterableMarker> for Vec<M> {
    const RETURN_SPEC: ReturnSpec = ReturnSpec::Iterable;

    fn classes() -> Vec<TypeUrl> {
        vec![TypeUrl::of::<M>()]
    }

    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError> {
        self.iter().map(AnyPayload::pack).collect()
    }
}

impl<M: SignalMessage> ProducedMessages<OptionalMarker> for Option<M> {
    const RETURN_SPEC: ReturnSpec = ReturnSpec::Optional;

    fn classes() -> Vec<TypeUrl> {
        vec![TypeUrl::of::<M>()]
    }

    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError> {
        match self {
            Some(message) => Ok(vec![AnyPayload::pack(&message)?]),
            None => Ok(Vec::new()),
        }
    }
}

impl<A: SignalMessage, B: SignalMessage> ProducedMessages<PairMarker> for (A, B) {
    const RETURN_SPEC: ReturnSpec = ReturnSpec::Pair;

    fn classes() -> Vec<TypeUrl> {
        vec![TypeUrl::of::<A>(), TypeUrl::of::<B>()]
    }

    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError> {
        Ok(vec![AnyPayload::pack(&self.0)?, AnyPayload::pack(&self.1)?])
    }
}

impl ProducedMessages<NothingMarker> for () {
    const RETURN_SPEC: ReturnSpec = ReturnSpec::Nothing;

    fn classes() -> Vec<TypeUrl> {
        Vec::new()
    }

    fn into_payloads(self) -> std::result::Result<Vec<AnyPayload>, PayloadError> {
        Ok(Vec::new())
    }
}
