//! Shard assignment
//!
//! Decides which shard ids of `[0, total)` this process runs. A distributed
//! manager swaps in an assigner backed by a coordination store.

use tracing::info;

/// Chooses this process's slice of the shard id space
pub trait ShardAssigner: Send + Sync {
    /// Shard ids to run, ascending, each `< total_shards`
    fn assign(&self, total_shards: u32) -> Vec<u32>;
}

/// Every shard in one process
#[derive(Debug, Clone, Copy, Default)]
pub struct AllShards;

impl ShardAssigner for AllShards {
    fn assign(&self, total_shards: u32) -> Vec<u32> {
        (0..total_shards).collect()
    }
}

/// A contiguous pool of `shards_per_pool` shards
///
/// Pool `n` runs shards `[n * shards_per_pool, (n + 1) * shards_per_pool)`,
/// clipped to the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAssigner {
    pub pool_id: u32,
    pub shards_per_pool: u32,
}

impl PoolAssigner {
    pub fn new(pool_id: u32, shards_per_pool: u32) -> Self {
        Self {
            pool_id,
            shards_per_pool: shards_per_pool.max(1),
        }
    }
}

impl ShardAssigner for PoolAssigner {
    fn assign(&self, total_shards: u32) -> Vec<u32> {
        let start_shard = self.pool_id.saturating_mul(self.shards_per_pool).min(total_shards);
        let end_shard = self
            .pool_id
            .saturating_add(1)
            .saturating_mul(self.shards_per_pool)
            .min(total_shards);

        info!(
            pool_id = self.pool_id,
            start_shard,
            end_shard,
            shard_count = end_shard - start_shard,
            "Assigning shard pool"
        );

        (start_shard..end_shard).collect()
    }
}
