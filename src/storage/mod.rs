//! In-memory reference implementations of the collaborator interfaces.
//!
//! These are the defaults an embedded host or a test runs on. Real
//! backends implement the same traits outside the core. The write paths
//! carry fail-injection switches for failure-path tests.

mod event_store;
mod inbox;
mod records;
mod transport;
mod work_registry;

pub use event_store::InMemoryEventStore;
pub use inbox::InMemoryInboxStorage;
pub use records::{InMemoryAggregateStorage, InMemoryRecordStorage};
pub use transport::InMemoryTransport;
pub use work_registry::InMemoryWorkRegistry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::interfaces::{
    AggregateStorage, EventStore, InboxStorage, RecordStorage, StorageFactory,
};
use crate::signal::TypeUrl;

/// Storage factory backed entirely by memory.
///
/// Returns the same instance for the same `(context, entity type)` pair,
/// so every component of a context shares one underlying store.
#[derive(Default)]
pub struct InMemoryStorageFactory {
    inbox: OnceLock<Arc<InMemoryInboxStorage>>,
    event_stores: Mutex<HashMap<String, Arc<InMemoryEventStore>>>,
    aggregates: Mutex<HashMap<(String, TypeUrl), Arc<InMemoryAggregateStorage>>>,
    records: Mutex<HashMap<(String, TypeUrl), Arc<InMemoryRecordStorage>>>,
}

impl InMemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared inbox storage instance, for tests that inspect it.
    pub fn inbox(&self) -> Arc<InMemoryInboxStorage> {
        Arc::clone(
            self.inbox
                .get_or_init(|| Arc::new(InMemoryInboxStorage::default())),
        )
    }
}

impl StorageFactory for InMemoryStorageFactory {
    fn create_inbox_storage(&self, _multitenant: bool) -> Arc<dyn InboxStorage> {
        self.inbox()
    }

    fn create_event_store(&self, context_name: &str) -> Arc<dyn EventStore> {
        let mut stores = self.event_stores.lock().expect("factory lock");
        let store = Arc::clone(
            stores
                .entry(context_name.to_string())
                .or_insert_with(|| Arc::new(InMemoryEventStore::default())),
        );
        store as Arc<dyn EventStore>
    }

    fn create_aggregate_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> Arc<dyn AggregateStorage> {
        let mut stores = self.aggregates.lock().expect("factory lock");
        let store = Arc::clone(
            stores
                .entry((context_name.to_string(), entity_type.clone()))
                .or_insert_with(|| Arc::new(InMemoryAggregateStorage::default())),
        );
        store as Arc<dyn AggregateStorage>
    }

    fn create_record_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> Arc<dyn RecordStorage> {
        let mut stores = self.records.lock().expect("factory lock");
        let store = Arc::clone(
            stores
                .entry((context_name.to_string(), entity_type.clone()))
                .or_insert_with(|| Arc::new(InMemoryRecordStorage::default())),
        );
        store as Arc<dyn RecordStorage>
    }

    fn create_projection_storage(
        &self,
        context_name: &str,
        entity_type: &TypeUrl,
    ) -> Arc<dyn RecordStorage> {
        self.create_record_storage(context_name, entity_type)
    }
}
