//! Key -> server thread routing and batch slicing.

use std::collections::HashMap;
use std::ops::Range;

use crate::mailbox::{Key, ThreadId};
use crate::utils::ParasyncError;

use rangemap::RangeMap;

/// Routes keys of one table to the server threads holding its shards.
#[derive(Debug, Clone)]
pub enum PartitionManager {
    Hash(HashPartitionManager),
    Range(RangePartitionManager),
}

/// `server = servers[key % num_servers]`.
#[derive(Debug, Clone)]
pub struct HashPartitionManager {
    servers: Vec<ThreadId>,
}

impl HashPartitionManager {
    pub fn new(servers: Vec<ThreadId>) -> Result<Self, ParasyncError> {
        if servers.is_empty() {
            return logged_err!(
                Partition;
                "hash partitioning over zero servers"
            );
        }
        Ok(HashPartitionManager { servers })
    }

    fn server_for_key(&self, key: Key) -> ThreadId {
        self.servers[key as usize % self.servers.len()]
    }
}

/// Sorted disjoint `[begin, end)` ranges, one per server.
#[derive(Debug, Clone)]
pub struct RangePartitionManager {
    servers: Vec<ThreadId>,
    ranges: Vec<Range<Key>>,
    map: RangeMap<Key, usize>,
}

impl RangePartitionManager {
    /// Fails unless there is exactly one non-empty range per server and the
    /// ranges are sorted and disjoint.
    pub fn new(
        servers: Vec<ThreadId>,
        ranges: Vec<Range<Key>>,
    ) -> Result<Self, ParasyncError> {
        if servers.is_empty() || servers.len() != ranges.len() {
            return logged_err!(
                Partition;
                "{} ranges given for {} servers",
                ranges.len(),
                servers.len()
            );
        }
        if let Some(r) = ranges.iter().find(|r| r.is_empty()) {
            return logged_err!(Partition; "empty key range {:?}", r);
        }
        if let Some(w) = ranges.windows(2).find(|w| w[0].end > w[1].start) {
            return logged_err!(
                Partition;
                "key ranges {:?} and {:?} unsorted or overlapping",
                w[0],
                w[1]
            );
        }

        let mut map = RangeMap::new();
        for (idx, range) in ranges.iter().enumerate() {
            map.insert(range.clone(), idx);
        }
        Ok(RangePartitionManager {
            servers,
            ranges,
            map,
        })
    }

    pub fn ranges(&self) -> &[Range<Key>] {
        &self.ranges
    }

    fn server_for_key(&self, key: Key) -> Result<ThreadId, ParasyncError> {
        match self.map.get(&key) {
            Some(&idx) => Ok(self.servers[idx]),
            None => Err(ParasyncError::Partition(format!(
                "key {} outside all configured ranges",
                key
            ))),
        }
    }
}

impl PartitionManager {
    /// Hash partitioning over the given server threads.
    pub fn new_hash(servers: Vec<ThreadId>) -> Result<Self, ParasyncError> {
        Ok(PartitionManager::Hash(HashPartitionManager::new(servers)?))
    }

    /// Range partitioning, one range per server thread.
    pub fn new_range(
        servers: Vec<ThreadId>,
        ranges: Vec<Range<Key>>,
    ) -> Result<Self, ParasyncError> {
        Ok(PartitionManager::Range(RangePartitionManager::new(
            servers, ranges,
        )?))
    }

    /// Every server thread holding a shard of the table.
    pub fn server_thread_ids(&self) -> &[ThreadId] {
        match self {
            PartitionManager::Hash(pm) => &pm.servers,
            PartitionManager::Range(pm) => &pm.servers,
        }
    }

    pub fn num_servers(&self) -> usize {
        self.server_thread_ids().len()
    }

    pub fn server_for_key(&self, key: Key) -> Result<ThreadId, ParasyncError> {
        match self {
            PartitionManager::Hash(pm) => Ok(pm.server_for_key(key)),
            PartitionManager::Range(pm) => pm.server_for_key(key),
        }
    }

    /// Groups keys by owning server. Groups come out in order of first
    /// appearance; order within a group follows the input.
    pub fn slice_keys(
        &self,
        keys: &[Key],
    ) -> Result<Vec<(ThreadId, Vec<Key>)>, ParasyncError> {
        let mut slots: HashMap<ThreadId, usize> = HashMap::new();
        let mut sliced: Vec<(ThreadId, Vec<Key>)> = vec![];
        for &key in keys {
            let server = self.server_for_key(key)?;
            let slot = *slots.entry(server).or_insert_with(|| {
                sliced.push((server, vec![]));
                sliced.len() - 1
            });
            sliced[slot].1.push(key);
        }
        Ok(sliced)
    }

    /// Groups key-value pairs by owning server, like `slice_keys`.
    #[allow(clippy::type_complexity)]
    pub fn slice_kvs<V: Copy>(
        &self,
        keys: &[Key],
        vals: &[V],
    ) -> Result<Vec<(ThreadId, (Vec<Key>, Vec<V>))>, ParasyncError> {
        if keys.len() != vals.len() {
            return logged_err!(
                Partition;
                "slicing {} keys with {} values",
                keys.len(),
                vals.len()
            );
        }
        let mut slots: HashMap<ThreadId, usize> = HashMap::new();
        let mut sliced: Vec<(ThreadId, (Vec<Key>, Vec<V>))> = vec![];
        for (&key, &val) in keys.iter().zip(vals) {
            let server = self.server_for_key(key)?;
            let slot = *slots.entry(server).or_insert_with(|| {
                sliced.push((server, (vec![], vec![])));
                sliced.len() - 1
            });
            sliced[slot].1 .0.push(key);
            sliced[slot].1 .1.push(val);
        }
        Ok(sliced)
    }
}
