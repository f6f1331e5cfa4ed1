//! Typed payload container.
//!
//! A signal carries its message as a `(type_url, bytes)` pair so that the
//! dispatch fabric never needs to know concrete message types. Payload
//! types implement [`SignalMessage`] to declare a stable type name and to
//! round-trip through [`AnyPayload`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Prefix of all type URLs produced by [`TypeUrl::of`].
pub const TYPE_URL_PREFIX: &str = "type.sigrail.dev";

/// Result type for payload operations.
pub type Result<T> = std::result::Result<T, PayloadError>;

/// Errors that can occur while packing or unpacking payloads.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to serialize `{type_url}`: {source}")]
    Serialize {
        type_url: TypeUrl,
        source: serde_json::Error,
    },

    #[error("failed to deserialize `{type_url}`: {source}")]
    Deserialize {
        type_url: TypeUrl,
        source: serde_json::Error,
    },

    #[error("payload is `{actual}`, expected `{expected}`")]
    TypeMismatch { expected: TypeUrl, actual: TypeUrl },

    #[error("a default instance of `{0}` cannot be used as a payload")]
    DefaultMessage(TypeUrl),
}

/// A fully-qualified message type URL, e.g. `type.sigrail.dev/calc.AddNumber`.
///
/// Serves as the message class throughout the dispatch fabric: dispatcher
/// registries, routing tables, and handler maps are all keyed by it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeUrl(String);

impl TypeUrl {
    /// Type URL of a message type.
    pub fn of<M: SignalMessage>() -> Self {
        TypeUrl(format!("{}/{}", TYPE_URL_PREFIX, M::TYPE_NAME))
    }

    /// Wrap an already-qualified type URL string.
    pub fn parse(value: impl Into<String>) -> Self {
        TypeUrl(value.into())
    }

    /// The full URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unqualified message name (the part after the last `.` or `/`).
    pub fn simple_name(&self) -> &str {
        self.0
            .rsplit(|c| c == '.' || c == '/')
            .next()
            .unwrap_or(&self.0)
    }

    /// Whether the URL names the given message type.
    pub fn is<M: SignalMessage>(&self) -> bool {
        *self == TypeUrl::of::<M>()
    }
}

impl fmt::Display for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeUrl({})", self.0)
    }
}

/// A message that can travel inside a signal.
///
/// Implementors declare a stable, dot-separated type name which never
/// changes once signals of the type have been stored. The `Default` bound
/// exists so that default instances can be detected and rejected: a signal
/// whose payload equals the type's default value is never enqueued.
pub trait SignalMessage:
    Serialize + DeserializeOwned + Clone + Default + PartialEq + Send + Sync + 'static
{
    /// Stable dot-separated type name, e.g. `"calc.AddNumber"`.
    const TYPE_NAME: &'static str;
}

/// Type-erased payload: a type URL plus serialized bytes.
///
/// Field-for-field this is the `Any` of the wire format; the bytes are the
/// JSON serialization of the message.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnyPayload {
    pub type_url: TypeUrl,
    pub value: Vec<u8>,
}

impl AnyPayload {
    /// Pack a message, rejecting default instances.
    pub fn pack<M: SignalMessage>(message: &M) -> Result<Self> {
        if *message == M::default() {
            return Err(PayloadError::DefaultMessage(TypeUrl::of::<M>()));
        }
        Self::pack_unchecked(message)
    }

    /// Pack a message without the default-instance check.
    ///
    /// Used for context enrichments, where a default value is legal.
    pub fn pack_unchecked<M: SignalMessage>(message: &M) -> Result<Self> {
        let type_url = TypeUrl::of::<M>();
        let value = serde_json::to_vec(message).map_err(|source| PayloadError::Serialize {
            type_url: type_url.clone(),
            source,
        })?;
        Ok(AnyPayload { type_url, value })
    }

    /// Unpack into a concrete message type, verifying the type URL.
    pub fn unpack<M: SignalMessage>(&self) -> Result<M> {
        if !self.type_url.is::<M>() {
            return Err(PayloadError::TypeMismatch {
                expected: TypeUrl::of::<M>(),
                actual: self.type_url.clone(),
            });
        }
        serde_json::from_slice(&self.value).map_err(|source| PayloadError::Deserialize {
            type_url: self.type_url.clone(),
            source,
        })
    }

    /// Whether the payload names the given message type.
    pub fn is<M: SignalMessage>(&self) -> bool {
        self.type_url.is::<M>()
    }

    /// Whether the payload is structurally empty.
    ///
    /// Deep default-instance detection belongs to the schema registry; this
    /// catches payloads that carry no bytes or no type at all.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty() || self.type_url.as_str().is_empty()
    }
}

impl fmt::Debug for AnyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyPayload({}, {} bytes)", self.type_url, self.value.len())
    }
}
