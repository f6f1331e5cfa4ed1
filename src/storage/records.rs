//! In-memory aggregate and record storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::entity::{EntityId, LifecycleFlags};
use crate::interfaces::storage::Result;
use crate::interfaces::{
    AggregateHistory, AggregateStorage, RecordStorage, StateSnapshot, StorageError, StoredRecord,
};
use crate::signal::{Signal, TenantId};

#[derive(Clone, Default)]
struct AggregateRow {
    snapshot: Option<StateSnapshot>,
    events: Vec<Signal>,
    flags: LifecycleFlags,
}

/// Aggregate storage that keeps histories in memory.
#[derive(Default)]
pub struct InMemoryAggregateStorage {
    rows: RwLock<HashMap<(TenantId, EntityId), AggregateRow>>,
    fail_on_append: RwLock<bool>,
}

impl InMemoryAggregateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, for failure-path tests.
    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }

    /// Number of stored events of one aggregate.
    pub async fn event_count(&self, tenant: &TenantId, id: &EntityId) -> usize {
        self.rows
            .read()
            .await
            .get(&(tenant.clone(), id.clone()))
            .map(|row| row.events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AggregateStorage for InMemoryAggregateStorage {
    async fn read(&self, tenant: &TenantId, id: &EntityId) -> Result<Option<AggregateHistory>> {
        let rows = self.rows.read().await;
        let Some(row) = rows.get(&(tenant.clone(), id.clone())) else {
            return Ok(None);
        };
        // Events already folded into the snapshot are not replayed again.
        let snapshot_version = row.snapshot.as_ref().map(|s| s.version.number);
        let events = row
            .events
            .iter()
            .filter(|e| {
                snapshot_version.map_or(true, |at| {
                    e.context.version.map_or(true, |v| v.number > at)
                })
            })
            .cloned()
            .collect();
        Ok(Some(AggregateHistory {
            snapshot: row.snapshot.clone(),
            events,
            flags: row.flags,
        }))
    }

    async fn append(
        &self,
        tenant: &TenantId,
        id: &EntityId,
        events: Vec<Signal>,
        snapshot: Option<StateSnapshot>,
        flags: LifecycleFlags,
    ) -> Result<()> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::Unavailable(
                "aggregate append disabled".into(),
            ));
        }
        let mut rows = self.rows.write().await;
        let row = rows.entry((tenant.clone(), id.clone())).or_default();
        row.events.extend(events);
        if snapshot.is_some() {
            row.snapshot = snapshot;
        }
        row.flags = flags;
        Ok(())
    }

    async fn index(&self, tenant: &TenantId) -> Result<Vec<EntityId>> {
        let rows = self.rows.read().await;
        Ok(rows
            .keys()
            .filter(|(t, _)| t == tenant)
            .map(|(_, id)| id.clone())
            .collect())
    }
}

/// Record storage that keeps entity records in memory.
#[derive(Default)]
pub struct InMemoryRecordStorage {
    rows: RwLock<HashMap<(TenantId, EntityId), StoredRecord>>,
    fail_on_write: RwLock<bool>,
}

impl InMemoryRecordStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, for failure-path tests.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }
}

#[async_trait]
impl RecordStorage for InMemoryRecordStorage {
    async fn read(&self, tenant: &TenantId, id: &EntityId) -> Result<Option<StoredRecord>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(tenant.clone(), id.clone())).cloned())
    }

    async fn write(&self, tenant: &TenantId, record: StoredRecord) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StorageError::Unavailable("record write disabled".into()));
        }
        let mut rows = self.rows.write().await;
        rows.insert((tenant.clone(), record.id.clone()), record);
        Ok(())
    }

    async fn delete(&self, tenant: &TenantId, id: &EntityId) -> Result<bool> {
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&(tenant.clone(), id.clone())).is_some())
    }

    async fn index(&self, tenant: &TenantId) -> Result<Vec<EntityId>> {
        let rows = self.rows.read().await;
        Ok(rows
            .keys()
            .filter(|(t, _)| t == tenant)
            .map(|(_, id)| id.clone())
            .collect())
    }
}
