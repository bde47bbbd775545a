use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Maps a routing key (a query id) to one of a fixed number of shards.
///
/// Every record of a query routes by its query id, so all of a query's records
/// land in the same shard and per-query scans touch a single shard.
pub struct PartitionManager {
    pub num_partitions: u32,
}

impl PartitionManager {
    pub fn new(num_partitions: u32) -> Arc<Self> {
        Arc::new(Self {
            num_partitions: num_partitions.max(1),
        })
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_partitions
    }
}
