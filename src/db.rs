//! One keyspace: the key dictionary, the expiry index and the blocking
//! bookkeeping that the wait queues maintain per database.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::client::ClientId;
use crate::config::Config;
use crate::dict::Dict;
use crate::object::Object;

pub struct Db {
    pub(crate) dict: Dict<Bytes, Object>,
    /// Unix-ms deadlines. Keys are clones of the main dictionary's keys,
    /// which for reference-counted byte strings means the same backing
    /// allocation; this index never owns distinct key storage.
    pub(crate) expires: Dict<Bytes, i64>,
    /// Key -> clients blocked on it, in registration order.
    pub(crate) blocking_keys: Dict<Bytes, VecDeque<ClientId>>,
    /// Keys already queued on the engine-wide ready list, to keep a key
    /// from being queued twice by a burst of pushes.
    pub(crate) ready_keys: Dict<Bytes, ()>,
    pub(crate) id: u32,
}

impl Db {
    pub(crate) fn new(id: u32, config: &Config) -> Self {
        let mut dict = Dict::new();
        dict.set_can_resize(config.can_resize);
        dict.set_force_resize_ratio(config.force_resize_ratio);
        let mut expires = Dict::new();
        expires.set_can_resize(config.can_resize);
        expires.set_force_resize_ratio(config.force_resize_ratio);
        Db {
            dict,
            expires,
            blocking_keys: Dict::new(),
            ready_keys: Dict::new(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Adds a key that must not already exist.
    pub(crate) fn add(&mut self, key: Bytes, value: Object) {
        self.dict
            .add(key, value)
            .expect("added key is not already present");
    }

    /// Installs a value under a key, replacing whatever was stored
    /// there. A recorded expiry is left untouched; callers that must
    /// clear it do so explicitly.
    pub(crate) fn overwrite(&mut self, key: Bytes, value: Object) {
        let _ = self.dict.replace(key, value);
    }

    /// Removes a key and, in lockstep, its expiry. True when the key
    /// existed.
    pub(crate) fn delete(&mut self, key: &[u8]) -> bool {
        if !self.expires.is_empty() {
            let _ = self.expires.remove(key);
        }
        self.dict.remove(key).is_ok()
    }

    pub(crate) fn is_expired(&mut self, key: &[u8], now_ms: i64) -> bool {
        if self.expires.is_empty() {
            return false;
        }
        match self.expires.get(key) {
            Some(&when) => when <= now_ms,
            None => false,
        }
    }

    pub(crate) fn set_expire(&mut self, key: Bytes, at_ms: i64) {
        let _ = self.expires.replace(key, at_ms);
    }

    pub(crate) fn get_expire(&mut self, key: &[u8]) -> Option<i64> {
        if self.expires.is_empty() {
            return None;
        }
        self.expires.get(key).copied()
    }

    pub(crate) fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_ok()
    }

    /// Moves a value (and its expiry) under a new key, replacing any
    /// previous destination. False when the source is missing.
    pub(crate) fn rename(&mut self, from: &[u8], to: Bytes) -> bool {
        let Some((_, value)) = self.dict.unlink(from) else {
            return false;
        };
        let moved_expire = self.expires.unlink(from).map(|(_, when)| when);
        self.delete(to.as_ref());
        self.dict
            .add(to.clone(), value)
            .expect("destination was just deleted");
        if let Some(when) = moved_expire {
            let _ = self.expires.replace(to, when);
        }
        true
    }

    pub(crate) fn random_key(&mut self) -> Option<Bytes> {
        self.dict.random_entry().map(|(key, _)| key.clone())
    }

    /// Swaps in fresh tables and hands back the old pair, for an
    /// asynchronous flush.
    pub(crate) fn take_all(&mut self, config: &Config) -> (Dict<Bytes, Object>, Dict<Bytes, i64>) {
        let fresh = Db::new(self.id, config);
        let dict = std::mem::replace(&mut self.dict, fresh.dict);
        let expires = std::mem::replace(&mut self.expires, fresh.expires);
        (dict, expires)
    }

    pub(crate) fn clear(&mut self) {
        self.dict.clear();
        self.expires.clear();
    }
}
