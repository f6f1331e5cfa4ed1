//! Sharding strategies.

use sha2::{Digest, Sha256};

use super::ShardIndex;
use crate::entity::EntityId;
use crate::signal::TypeUrl;

/// Maps a target to the shard it lives in.
///
/// The mapping must be deterministic across processes and nodes: every
/// node of the fleet computes the same shard for the same target.
pub trait ShardingStrategy: Send + Sync {
    fn shard_for(&self, id: &EntityId, entity_type: &TypeUrl, of_total: u32) -> ShardIndex;
}

/// Uniform sharding over a SHA-256 of the target identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct UniformHashStrategy;

impl ShardingStrategy for UniformHashStrategy {
    fn shard_for(&self, id: &EntityId, entity_type: &TypeUrl, of_total: u32) -> ShardIndex {
        let mut hasher = Sha256::new();
        hasher.update(entity_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(id.to_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(prefix) % u64::from(of_total.max(1))) as u32;
        ShardIndex::new(index, of_total.max(1))
    }
}
