//! Shard lease coordination.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::delivery::ShardIndex;

/// Identity of one delivery node in the fleet.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        NodeId(value.into())
    }

    /// A random node identity, for hosts that do not assign one.
    pub fn generate() -> Self {
        NodeId(format!("node-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// An exclusive lease on one shard, held by one node.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardSession {
    pub shard: ShardIndex,
    pub node: NodeId,
    pub token: Uuid,
    pub lease_until: DateTime<Utc>,
}

/// The lease was lost to another holder.
#[derive(Debug, thiserror::Error)]
#[error("lease on shard {shard} lost by {node}")]
pub struct LeaseLost {
    pub shard: ShardIndex,
    pub node: NodeId,
}

/// Grants nodes exclusive, time-bounded access to shards.
///
/// `pick_up` must be an atomic compare-and-swap: at any instant at most
/// one unexpired session exists per shard across the fleet.
#[async_trait]
pub trait ShardedWorkRegistry: Send + Sync {
    /// Try to acquire the shard. Returns `None` while another node holds
    /// an unexpired lease.
    async fn pick_up(&self, shard: ShardIndex, node: &NodeId) -> Option<ShardSession>;

    /// Release the lease. A stale session token is ignored.
    async fn release(&self, session: &ShardSession);

    /// Extend the lease, verifying the session still holds it.
    ///
    /// This doubles as the ownership check delivery performs before
    /// marking a page delivered.
    async fn extend_lease(&self, session: &ShardSession) -> Result<ShardSession, LeaseLost>;
}
