//! LRU cache of loaded passive partitions.
//!
//! Owned by the index task alone, so there is no interior locking: a miss
//! loads synchronously through the supplied factory and may evict the
//! least recently used handle. Evicted handles stay alive for any
//! evaluator still holding them.

use super::partition::Partition;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

pub type PartitionHandle = Arc<RwLock<Partition>>;

pub struct PartitionCache {
    capacity: usize,
    entries: HashMap<Uuid, PartitionHandle>,
    /// Back is most recently used.
    recency: VecDeque<Uuid>,
}

impl PartitionCache {
    pub fn new(capacity: usize) -> Self {
        PartitionCache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    /// Returns the cached handle or loads one via `factory`, evicting the
    /// least recently used entry when over capacity. Load failures leave
    /// the cache untouched.
    pub fn get_or_load(
        &mut self,
        uuid: Uuid,
        factory: impl FnOnce() -> Result<Partition>,
    ) -> Result<PartitionHandle> {
        if let Some(handle) = self.entries.get(&uuid) {
            let handle = Arc::clone(handle);
            self.touch(uuid);
            return Ok(handle);
        }
        let partition = factory()?;
        let handle = Arc::new(RwLock::new(partition));
        self.entries.insert(uuid, Arc::clone(&handle));
        self.recency.push_back(uuid);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.recency.pop_front() {
                self.entries.remove(&evicted);
                tracing::debug!(partition = %evicted, "evicted from partition cache");
            }
        }
        Ok(handle)
    }

    fn touch(&mut self, uuid: Uuid) {
        if let Some(pos) = self.recency.iter().position(|u| *u == uuid) {
            self.recency.remove(pos);
        }
        self.recency.push_back(uuid);
    }
}
