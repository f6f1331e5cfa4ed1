//! Entity model: identifiers, versions, lifecycle, and records.
//!
//! This module contains:
//! - [`EntityId`]: opaque entity identifier with a deterministic byte form
//! - [`Version`]: per-producer monotonic version
//! - [`VersioningStrategy`]: how a transaction advances the version
//! - [`LifecycleFlags`]: archived/deleted bits
//! - [`EntityRecord`]: the persisted `(id, state, version, flags)` tuple
//! - [`Transaction`]: staged, atomic application of one signal

pub mod transaction;

pub use transaction::{
    Committed, NoOpListener, Phase, PropagationRequiredListener, Transaction, TransactionError,
    TransactionListener,
};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::{AnyPayload, SignalMessage};

/// An opaque entity identifier.
///
/// Primitive integers, strings, UUIDs, and typed messages are all valid
/// identifiers. Comparison, hashing, and sharding use the deterministic
/// serialized form produced by [`EntityId::to_bytes`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    Int(i64),
    Str(String),
    Uuid(Uuid),
    Packed(AnyPayload),
}

impl EntityId {
    /// Pack a typed message identifier.
    pub fn packed<M: SignalMessage>(id: &M) -> Result<Self, crate::signal::PayloadError> {
        Ok(EntityId::Packed(AnyPayload::pack_unchecked(id)?))
    }

    /// Deterministic serialized form, stable across processes and nodes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            EntityId::Int(v) => {
                let mut bytes = vec![b'i'];
                bytes.extend_from_slice(&v.to_be_bytes());
                bytes
            }
            EntityId::Str(v) => {
                let mut bytes = vec![b's'];
                bytes.extend_from_slice(v.as_bytes());
                bytes
            }
            EntityId::Uuid(v) => {
                let mut bytes = vec![b'u'];
                bytes.extend_from_slice(v.as_bytes());
                bytes
            }
            EntityId::Packed(any) => {
                let mut bytes = vec![b'p'];
                bytes.extend_from_slice(any.type_url.as_str().as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(&any.value);
                bytes
            }
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(v) => write!(f, "{v}"),
            EntityId::Str(v) => f.write_str(v),
            EntityId::Uuid(v) => write!(f, "{v}"),
            EntityId::Packed(any) => {
                write!(f, "{}:{}", any.type_url.simple_name(), any.value.len())
            }
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Str(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Str(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Uuid(value)
    }
}

/// A per-producer version: a monotonic number plus the wall-clock instant
/// at which it was assigned.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub number: u64,
    pub timestamp: DateTime<Utc>,
}

impl Version {
    /// The zero version of a freshly created entity.
    pub fn initial() -> Self {
        Version {
            number: 0,
            timestamp: Utc::now(),
        }
    }

    /// A version with the given number, stamped now.
    pub fn of(number: u64) -> Self {
        Version {
            number,
            timestamp: Utc::now(),
        }
    }

    /// The next auto-incremented version, stamped now.
    pub fn increment(&self) -> Self {
        Version {
            number: self.number + 1,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}", self.number, self.timestamp.to_rfc3339())
    }
}

/// How a transaction advances the entity version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersioningStrategy {
    /// Assign `previous + 1` at each phase; used by projections and
    /// process managers. Versions carried by incoming events are advisory.
    AutoIncrement,
    /// Copy the version of the applied event; used by aggregates.
    /// Monotonicity against the current version is enforced.
    FromEvent,
}

/// Two independent lifecycle bits of an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlags {
    pub archived: bool,
    pub deleted: bool,
}

impl LifecycleFlags {
    /// Whether the entity is in the active (neither bit set) state.
    pub fn is_active(&self) -> bool {
        !self.archived && !self.deleted
    }
}

/// The persisted form of an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord<S> {
    pub id: EntityId,
    pub state: S,
    pub version: Version,
    pub flags: LifecycleFlags,
}

impl<S: Default> EntityRecord<S> {
    /// A fresh record with default state and the initial version.
    pub fn fresh(id: EntityId) -> Self {
        EntityRecord {
            id,
            state: S::default(),
            version: Version::initial(),
            flags: LifecycleFlags::default(),
        }
    }
}

#[cfg(test)]
mod tests;
