//! Domain repositories.
//!
//! A repository owns an entity class and its routing tables, acts as the
//! bus-facing dispatcher (route → enqueue into the sharded inbox), and
//! provides the delivery-facing endpoint (load entity → run transaction →
//! store → post produced signals).

mod aggregate;
mod process_manager;
mod projection;

pub use aggregate::AggregateRepository;
pub use process_manager::ProcessManagerRepository;
pub use projection::ProjectionRepository;

use crate::entity::EntityRecord;
use crate::interfaces::{StorageError, StoredRecord};
use crate::signal::SignalMessage;

/// Serialize an entity record for record storage.
pub(crate) fn pack_record<S: SignalMessage>(
    record: &EntityRecord<S>,
) -> Result<StoredRecord, StorageError> {
    Ok(StoredRecord {
        id: record.id.clone(),
        state: crate::signal::AnyPayload::pack_unchecked(&record.state)?,
        version: record.version,
        flags: record.flags,
    })
}

/// Restore an entity record from record storage.
pub(crate) fn unpack_record<S: SignalMessage>(
    stored: &StoredRecord,
) -> Result<EntityRecord<S>, StorageError> {
    Ok(EntityRecord {
        id: stored.id.clone(),
        state: stored.state.unpack()?,
        version: stored.version,
        flags: stored.flags,
    })
}
