//! Per-table, per-server key -> value store.

use std::collections::HashMap;

use crate::mailbox::{Flag, Key, Message};
use crate::utils::{Codec, ParasyncError, Value};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Storage backend kind chosen at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// Hash map keyed by parameter key.
    Map,
}

impl StorageType {
    /// Creates a fresh storage instance of this kind for value type `V`.
    pub fn new_storage<V: Value>(&self) -> Box<dyn Storage> {
        match self {
            StorageType::Map => Box::new(MapStorage::<V>::new()),
        }
    }
}

/// Type-erased storage interface. The value type is fixed when the storage
/// is created, so values cross this boundary as encoded bytes.
pub trait Storage: Send {
    /// Accumulates encoded values into the given keys, inserting keys that
    /// are absent.
    fn sub_add(
        &mut self,
        keys: &[Key],
        vals: &[u8],
    ) -> Result<(), ParasyncError>;

    /// Reads the given keys, materializing absent ones at zero, and returns
    /// the values encoded in key order.
    fn sub_get(&mut self, keys: &[Key]) -> Bytes;

    /// Number of keys currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies an `Add` message: keys at data index 0, values at index 1.
    fn add(&mut self, msg: &Message) -> Result<(), ParasyncError> {
        let keys = msg.get_data::<Key>(0)?;
        match msg.data.get(1) {
            Some(vals) => self.sub_add(&keys, vals),
            None => Err(ParasyncError::msg("add message carries no values")),
        }
    }

    /// Serves a `Get` message, producing the reply addressed back to its
    /// sender with the requested keys and their values.
    fn get(&mut self, msg: &Message) -> Result<Message, ParasyncError> {
        let keys = msg.get_data::<Key>(0)?;
        let vals = self.sub_get(&keys);
        let mut reply = msg.reply(Flag::Get);
        reply.data.push(Key::encode(&keys));
        reply.data.push(vals);
        Ok(reply)
    }
}

/// `HashMap`-backed storage.
#[derive(Debug, Default)]
pub struct MapStorage<V> {
    map: HashMap<Key, V>,
}

impl<V: Value> MapStorage<V> {
    pub fn new() -> Self {
        MapStorage {
            map: HashMap::new(),
        }
    }

    /// Current value of a key, without materializing it.
    pub fn peek(&self, key: Key) -> Option<V> {
        self.map.get(&key).copied()
    }
}

impl<V: Value> Storage for MapStorage<V> {
    fn sub_add(
        &mut self,
        keys: &[Key],
        vals: &[u8],
    ) -> Result<(), ParasyncError> {
        let vals = V::decode(vals)?;
        if vals.len() != keys.len() {
            return Err(ParasyncError::msg(format!(
                "add of {} keys carries {} values",
                keys.len(),
                vals.len()
            )));
        }
        for (&key, val) in keys.iter().zip(vals) {
            *self.map.entry(key).or_default() += val;
        }
        Ok(())
    }

    fn sub_get(&mut self, keys: &[Key]) -> Bytes {
        let vals: Vec<V> = keys
            .iter()
            .map(|&key| *self.map.entry(key).or_default())
            .collect();
        V::encode(&vals)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
