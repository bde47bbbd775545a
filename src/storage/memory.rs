//! Record store backend.
//!
//! `RecordStore` is the seam between the stores and wherever records live. The
//! in-process `MemoryStore` shards records by query id and keeps them serialized,
//! so every read hands out an independent copy the way a networked cache would.

use super::error::StorageResult;
use super::partitioner::PartitionManager;
use crate::query::types::TaskKey;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// A record key that knows which query it belongs to.
pub trait RecordKey: Clone + Hash + Eq + Send + Sync + 'static {
    fn route(&self) -> &str;
}

impl RecordKey for String {
    fn route(&self) -> &str {
        self
    }
}

impl RecordKey for TaskKey {
    fn route(&self) -> &str {
        self.query_id()
    }
}

#[async_trait]
pub trait RecordStore<K: RecordKey, V>: Send + Sync {
    async fn get(&self, key: &K) -> StorageResult<Option<V>>;

    async fn put(&self, key: K, value: &V) -> StorageResult<()>;

    /// Replaces the value only if the key exists. Returns the previous value.
    async fn put_if_present(&self, key: &K, value: &V) -> StorageResult<Option<V>>;

    async fn remove(&self, key: &K) -> StorageResult<Option<V>>;

    /// Every record routed to `route`.
    async fn scan_route(&self, route: &str) -> StorageResult<Vec<(K, V)>>;

    async fn scan_all(&self) -> StorageResult<Vec<(K, V)>>;
}

pub struct MemoryStore<K, V> {
    local_data: DashMap<u32, DashMap<K, Vec<u8>>>,
    partitioner: Arc<PartitionManager>,
    _value: PhantomData<fn() -> V>,
}

impl<K, V> MemoryStore<K, V>
where
    K: RecordKey,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(partitioner: Arc<PartitionManager>) -> Self {
        Self {
            local_data: DashMap::new(),
            partitioner,
            _value: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.local_data.iter().map(|partition| partition.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition_of(&self, key: &K) -> u32 {
        self.partitioner.get_partition(key.route())
    }

    fn decode_all(
        &self,
        entries: impl Iterator<Item = (K, Vec<u8>)>,
    ) -> StorageResult<Vec<(K, V)>> {
        entries
            .map(|(key, bytes)| -> StorageResult<(K, V)> {
                Ok((key, serde_json::from_slice(&bytes)?))
            })
            .collect()
    }
}

#[async_trait]
impl<K, V> RecordStore<K, V> for MemoryStore<K, V>
where
    K: RecordKey,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &K) -> StorageResult<Option<V>> {
        let partition = self.partition_of(key);
        let Some(partition_map) = self.local_data.get(&partition) else {
            return Ok(None);
        };
        match partition_map.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: K, value: &V) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let partition = self.partition_of(&key);
        self.local_data
            .entry(partition)
            .or_default()
            .insert(key, bytes);
        Ok(())
    }

    async fn put_if_present(&self, key: &K, value: &V) -> StorageResult<Option<V>> {
        let bytes = serde_json::to_vec(value)?;
        let partition = self.partition_of(key);
        let Some(partition_map) = self.local_data.get(&partition) else {
            return Ok(None);
        };
        let previous = match partition_map.get_mut(key) {
            Some(mut slot) => std::mem::replace(slot.value_mut(), bytes),
            None => return Ok(None),
        };
        Ok(Some(serde_json::from_slice(&previous)?))
    }

    async fn remove(&self, key: &K) -> StorageResult<Option<V>> {
        let partition = self.partition_of(key);
        let Some(partition_map) = self.local_data.get(&partition) else {
            return Ok(None);
        };
        match partition_map.remove(key) {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn scan_route(&self, route: &str) -> StorageResult<Vec<(K, V)>> {
        let partition = self.partitioner.get_partition(route);
        let Some(partition_map) = self.local_data.get(&partition) else {
            return Ok(Vec::new());
        };
        let matching: Vec<(K, Vec<u8>)> = partition_map
            .iter()
            .filter(|entry| entry.key().route() == route)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.decode_all(matching.into_iter())
    }

    async fn scan_all(&self) -> StorageResult<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for partition_map in self.local_data.iter() {
            for entry in partition_map.iter() {
                entries.push((entry.key().clone(), entry.value().clone()));
            }
        }
        self.decode_all(entries.into_iter())
    }
}
