//! Signals: commands, events, and rejections, with their origin context.
//!
//! This module contains:
//! - [`Signal`]: the uniform wrapper around a message
//! - [`SignalContext`]: the origin chain (parent ids, actor, tenant, time)
//! - [`Envelope`]: a routing view over a signal
//! - [`EventFactory`]: stamps produced events with producer id and version
//! - [`Ack`] / [`DispatchOutcome`]: the acknowledgement and outcome taxonomy

mod payload;

pub use payload::{AnyPayload, PayloadError, SignalMessage, TypeUrl, TYPE_URL_PREFIX};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityId, Version};

/// Unique identifier of one signal.
///
/// Ordering follows the byte order of the underlying UUID, which equals
/// the lexicographic order of its hyphenated form.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SignalId(Uuid);

impl SignalId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        SignalId(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        SignalId(id)
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalId({})", self.0)
    }
}

/// Tenant discriminator carried by every signal.
///
/// There is no ambient tenant scope: storage and delivery always receive
/// the tenant explicitly through the context.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// The tenant of a single-tenant deployment.
    pub fn single() -> Self {
        TenantId("default".to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        TenantId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        TenantId::single()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

/// The three signal families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Command,
    Event,
    Rejection,
}

/// Origin chain and metadata of a signal.
///
/// Every signal except a root command has exactly one parent origin:
/// either the command or the event in reaction to which it was produced.
/// Events additionally carry the producing entity id and its version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalContext {
    pub parent_command_id: Option<SignalId>,
    pub parent_event_id: Option<SignalId>,
    pub actor: Option<String>,
    pub tenant: TenantId,
    pub timestamp: DateTime<Utc>,
    pub external: bool,
    pub enrichments: BTreeMap<TypeUrl, AnyPayload>,
    pub producer: Option<EntityId>,
    pub version: Option<Version>,
}

impl SignalContext {
    fn root(actor: Option<String>, tenant: TenantId) -> Self {
        SignalContext {
            parent_command_id: None,
            parent_event_id: None,
            actor,
            tenant,
            timestamp: Utc::now(),
            external: false,
            enrichments: BTreeMap::new(),
            producer: None,
            version: None,
        }
    }

    /// The context of a signal produced in reaction to `parent`.
    ///
    /// The parent chain keeps the nearest command and the nearest event:
    /// reacting to an event preserves the event's originating command.
    fn in_reaction_to(parent: &Signal) -> Self {
        let (parent_command_id, parent_event_id) = match parent.kind {
            SignalKind::Command => (Some(parent.id), None),
            SignalKind::Event | SignalKind::Rejection => (
                parent.context.parent_command_id,
                Some(parent.id),
            ),
        };
        SignalContext {
            parent_command_id,
            parent_event_id,
            actor: parent.context.actor.clone(),
            tenant: parent.context.tenant.clone(),
            timestamp: Utc::now(),
            external: false,
            enrichments: BTreeMap::new(),
            producer: None,
            version: None,
        }
    }

    /// Attach a typed enrichment, keyed by its type URL.
    pub fn enrich<M: SignalMessage>(&mut self, value: &M) -> Result<(), PayloadError> {
        let packed = AnyPayload::pack_unchecked(value)?;
        self.enrichments.insert(packed.type_url.clone(), packed);
        Ok(())
    }

    /// Read a typed enrichment back, if present.
    pub fn enrichment<M: SignalMessage>(&self) -> Option<Result<M, PayloadError>> {
        self.enrichments
            .get(&TypeUrl::of::<M>())
            .map(|payload| payload.unpack::<M>())
    }
}

/// A command, event, or rejection in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub kind: SignalKind,
    pub payload: AnyPayload,
    pub context: SignalContext,
}

impl Signal {
    /// Create a root command posted by an actor.
    pub fn command<M: SignalMessage>(
        message: &M,
        actor: Option<&str>,
        tenant: TenantId,
    ) -> Result<Self, PayloadError> {
        Ok(Signal {
            id: SignalId::generate(),
            kind: SignalKind::Command,
            payload: AnyPayload::pack(message)?,
            context: SignalContext::root(actor.map(str::to_string), tenant),
        })
    }

    /// Create a command produced in reaction to another signal.
    pub fn command_in_reaction_to<M: SignalMessage>(
        message: &M,
        parent: &Signal,
    ) -> Result<Self, PayloadError> {
        Ok(Signal {
            id: SignalId::generate(),
            kind: SignalKind::Command,
            payload: AnyPayload::pack(message)?,
            context: SignalContext::in_reaction_to(parent),
        })
    }

    /// Create a command from an already-packed payload, in reaction to
    /// another signal. Used when the producing handler is type-erased.
    pub fn command_from_payload(payload: AnyPayload, parent: &Signal) -> Self {
        Signal {
            id: SignalId::generate(),
            kind: SignalKind::Command,
            payload,
            context: SignalContext::in_reaction_to(parent),
        }
    }

    /// Create a rejection of a command.
    ///
    /// The rejected command's payload rides along as an enrichment so that
    /// rejection reactors can inspect the command that failed.
    pub fn rejection(payload: AnyPayload, command: &Signal) -> Self {
        let mut context = SignalContext::in_reaction_to(command);
        context
            .enrichments
            .insert(command.payload.type_url.clone(), command.payload.clone());
        Signal {
            id: SignalId::generate(),
            kind: SignalKind::Rejection,
            payload,
            context,
        }
    }

    /// The message class of the payload.
    pub fn message_class(&self) -> &TypeUrl {
        &self.payload.type_url
    }

    /// The id of the nearest parent in the origin chain, if any.
    pub fn origin_id(&self) -> Option<SignalId> {
        self.context
            .parent_event_id
            .or(self.context.parent_command_id)
    }

    /// Whether this signal arrived from another bounded context.
    pub fn is_external(&self) -> bool {
        self.context.external
    }

    /// A routing view over this signal.
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope { signal: self }
    }
}

/// A borrowed view over a signal exposing the fields routing and
/// filtering care about.
#[derive(Clone, Copy)]
pub struct Envelope<'a> {
    signal: &'a Signal,
}

impl<'a> Envelope<'a> {
    pub fn signal(&self) -> &'a Signal {
        self.signal
    }

    pub fn signal_id(&self) -> SignalId {
        self.signal.id
    }

    pub fn message_class(&self) -> &'a TypeUrl {
        self.signal.message_class()
    }

    pub fn tenant_id(&self) -> &'a TenantId {
        &self.signal.context.tenant
    }

    pub fn origin_id(&self) -> Option<SignalId> {
        self.signal.origin_id()
    }

    pub fn is_external(&self) -> bool {
        self.signal.is_external()
    }
}

/// Stamps produced events with producer identity, version, and the
/// origin chain of the signal that triggered them.
pub struct EventFactory {
    producer: EntityId,
    origin: Origin,
}

enum Origin {
    /// Events produced while handling a signal inherit its chain.
    Trigger(Box<Signal>),
    /// Imported events have no parent, like root commands.
    Import { tenant: TenantId },
}

impl EventFactory {
    /// A factory for events produced by `producer` while handling `trigger`.
    pub fn for_producer(producer: EntityId, trigger: &Signal) -> Self {
        EventFactory {
            producer,
            origin: Origin::Trigger(Box::new(trigger.clone())),
        }
    }

    /// A factory for events imported into the context without a parent
    /// signal, such as the lifecycle events of framework processes.
    pub fn for_import(producer: EntityId, tenant: TenantId) -> Self {
        EventFactory {
            producer,
            origin: Origin::Import { tenant },
        }
    }

    /// Create an event from a typed message.
    pub fn create<M: SignalMessage>(
        &self,
        message: &M,
        version: Version,
    ) -> Result<Signal, PayloadError> {
        Ok(self.create_from_payload(AnyPayload::pack(message)?, version))
    }

    /// Create an event from an already-packed payload.
    pub fn create_from_payload(&self, payload: AnyPayload, version: Version) -> Signal {
        let mut context = match &self.origin {
            Origin::Trigger(trigger) => SignalContext::in_reaction_to(trigger),
            Origin::Import { tenant } => SignalContext::root(None, tenant.clone()),
        };
        context.producer = Some(self.producer.clone());
        context.version = Some(version);
        Signal {
            id: SignalId::generate(),
            kind: SignalKind::Event,
            payload,
            context,
        }
    }
}

/// Acknowledgement of one posted signal.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    pub signal_id: SignalId,
    pub status: AckStatus,
}

/// Status of an acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub enum AckStatus {
    /// The signal was accepted and handed to its dispatchers.
    Ok,
    /// The signal was not accepted; carries a structured cause.
    Error { code: String, message: String },
    /// The signal was turned down by business logic.
    Rejection(Box<Signal>),
}

impl Ack {
    pub fn ok(signal_id: SignalId) -> Self {
        Ack {
            signal_id,
            status: AckStatus::Ok,
        }
    }

    pub fn error(signal_id: SignalId, code: impl Into<String>, message: impl fmt::Display) -> Self {
        Ack {
            signal_id,
            status: AckStatus::Error {
                code: code.into(),
                message: message.to_string(),
            },
        }
    }

    pub fn rejection(signal_id: SignalId, rejection: Signal) -> Self {
        Ack {
            signal_id,
            status: AckStatus::Rejection(Box::new(rejection)),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, AckStatus::Ok)
    }
}

/// Why a signal was skipped without effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The same signal id already took effect within the idempotence window.
    Duplicate,
    /// A bus filter dropped the signal.
    FilteredOut,
    /// The receiving entity declared no interest in the signal.
    OutOfScope,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Duplicate => f.write_str("duplicate"),
            IgnoreReason::FilteredOut => f.write_str("filtered_out"),
            IgnoreReason::OutOfScope => f.write_str("out_of_scope"),
        }
    }
}

/// The outcome of dispatching one signal to one target.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// The handler ran and the transaction committed.
    Success {
        signal_id: SignalId,
        produced_events: u32,
        produced_commands: u32,
        rejection: Option<SignalId>,
    },
    /// The handler failed or the framework detected an invariant violation.
    Error { signal_id: SignalId, cause: String },
    /// Not attempted: an earlier signal in the batch failed transactionally.
    Interrupted {
        signal_id: SignalId,
        stopped_at: SignalId,
    },
    /// Skipped by design.
    Ignored {
        signal_id: SignalId,
        reason: IgnoreReason,
    },
}

impl DispatchOutcome {
    /// Successful outcome with nothing produced.
    pub fn quiet_success(signal_id: SignalId) -> Self {
        DispatchOutcome::Success {
            signal_id,
            produced_events: 0,
            produced_commands: 0,
            rejection: None,
        }
    }

    pub fn signal_id(&self) -> SignalId {
        match self {
            DispatchOutcome::Success { signal_id, .. }
            | DispatchOutcome::Error { signal_id, .. }
            | DispatchOutcome::Interrupted { signal_id, .. }
            | DispatchOutcome::Ignored { signal_id, .. } => *signal_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success { .. })
    }
}
