//! In-memory event store.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::interfaces::storage::Result;
use crate::interfaces::{EventStore, EventStreamQuery, StorageError};
use crate::signal::{Signal, TenantId};

/// Event store that keeps the append-only log in memory.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<TenantId, Vec<Signal>>>,
    fail_on_append: RwLock<bool>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, for failure-path tests.
    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }

    /// Total number of stored events of a tenant.
    pub async fn len(&self, tenant: &TenantId) -> usize {
        self.events
            .read()
            .await
            .get(tenant)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, tenant: &TenantId, events: Vec<Signal>) -> Result<()> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::Unavailable("event append disabled".into()));
        }
        self.events
            .write()
            .await
            .entry(tenant.clone())
            .or_default()
            .extend(events);
        Ok(())
    }

    async fn read(
        &self,
        tenant: &TenantId,
        query: &EventStreamQuery,
    ) -> Result<BoxStream<'static, Signal>> {
        let events = self.events.read().await;
        let mut matching: Vec<Signal> = events
            .get(tenant)
            .map(|log| {
                log.iter()
                    .filter(|e| {
                        (query.event_types.is_empty()
                            || query.event_types.contains(e.message_class()))
                            && query.after.map_or(true, |after| e.context.timestamp > after)
                            && query
                                .before
                                .map_or(true, |before| e.context.timestamp < before)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| {
            a.context
                .timestamp
                .cmp(&b.context.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(stream::iter(matching).boxed())
    }
}
