//! In-memory shard work registry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::delivery::ShardIndex;
use crate::interfaces::{LeaseLost, NodeId, ShardSession, ShardedWorkRegistry};

/// Work registry that coordinates leases within one process.
///
/// The compare-and-swap contract is upheld by a single mutex over the
/// lease table, making every mutation linearizable.
pub struct InMemoryWorkRegistry {
    leases: Mutex<HashMap<u32, ShardSession>>,
    lease_duration: Duration,
}

impl Default for InMemoryWorkRegistry {
    fn default() -> Self {
        Self::with_lease_duration(Duration::from_secs(30))
    }
}

impl InMemoryWorkRegistry {
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        InMemoryWorkRegistry {
            leases: Mutex::new(HashMap::new()),
            lease_duration,
        }
    }

    fn lease_until(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Force-expire the lease of a shard, simulating a dead holder.
    pub async fn expire_now(&self, shard: ShardIndex) {
        let mut leases = self.leases.lock().await;
        if let Some(session) = leases.get_mut(&shard.index) {
            session.lease_until = Utc::now() - chrono::Duration::milliseconds(1);
        }
    }

    /// The node currently holding the shard, if any lease is unexpired.
    pub async fn holder_of(&self, shard: ShardIndex) -> Option<NodeId> {
        let leases = self.leases.lock().await;
        leases
            .get(&shard.index)
            .filter(|s| s.lease_until > Utc::now())
            .map(|s| s.node.clone())
    }
}

#[async_trait]
impl ShardedWorkRegistry for InMemoryWorkRegistry {
    async fn pick_up(&self, shard: ShardIndex, node: &NodeId) -> Option<ShardSession> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(&shard.index) {
            if existing.lease_until > Utc::now() {
                return None;
            }
        }
        let session = ShardSession {
            shard,
            node: node.clone(),
            token: Uuid::new_v4(),
            lease_until: self.lease_until(),
        };
        leases.insert(shard.index, session.clone());
        Some(session)
    }

    async fn release(&self, session: &ShardSession) {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(&session.shard.index) {
            if existing.token == session.token {
                leases.remove(&session.shard.index);
            }
        }
    }

    async fn extend_lease(&self, session: &ShardSession) -> Result<ShardSession, LeaseLost> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&session.shard.index) {
            Some(existing)
                if existing.token == session.token && existing.lease_until > Utc::now() =>
            {
                existing.lease_until = self.lease_until();
                Ok(existing.clone())
            }
            _ => Err(LeaseLost {
                shard: session.shard,
                node: session.node.clone(),
            }),
        }
    }
}
