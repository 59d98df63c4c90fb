//! Hash value type with two encodings.
//!
//! Small hashes live in a compact vector of field/value pairs kept in
//! insertion order with linear lookup. Once a field or value grows past
//! the configured byte limit, or the pair count passes the entry limit,
//! the whole value is promoted to a real hash map in a single pass.
//! Promotion is one way; a hash never goes back to the compact form.

use bytes::Bytes;

use crate::dict::{Dict, Iter as DictIter, SipHashBuilder, INITIAL_SIZE};

/// Promotion thresholds, copied out of the engine configuration.
#[derive(Clone, Copy, Debug)]
pub struct HashLimits {
    pub max_small_entries: usize,
    pub max_small_value: usize,
}

impl Default for HashLimits {
    fn default() -> Self {
        HashLimits {
            max_small_entries: 128,
            max_small_value: 64,
        }
    }
}

/// Minimum fill percentage before a map-encoded hash is shrunk.
const MIN_FILL_PERCENT: usize = 10;

pub enum HashValue {
    Small(Vec<(Bytes, Bytes)>),
    Map(Dict<Bytes, Bytes>),
}

impl HashValue {
    pub fn new() -> Self {
        HashValue::Small(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            HashValue::Small(pairs) => pairs.len(),
            HashValue::Map(dict) => dict.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn uses_map(&self) -> bool {
        matches!(self, HashValue::Map(_))
    }

    pub fn get(&mut self, field: &[u8]) -> Option<&Bytes> {
        match self {
            HashValue::Small(pairs) => pairs
                .iter()
                .find(|(f, _)| f.as_ref() == field)
                .map(|(_, v)| v),
            HashValue::Map(dict) => dict.get(field),
        }
    }

    pub fn exists(&mut self, field: &[u8]) -> bool {
        self.get(field).is_some()
    }

    /// Byte length of the value stored under `field`, 0 when missing.
    pub fn value_len(&mut self, field: &[u8]) -> usize {
        self.get(field).map_or(0, |v| v.len())
    }

    /// Adds a field or overwrites its value. Returns true on overwrite.
    ///
    /// Oversized fields or values force the map encoding before the
    /// write; a pair count past the limit promotes right after it.
    pub fn set(&mut self, field: Bytes, value: Bytes, limits: &HashLimits) -> bool {
        if let HashValue::Small(_) = self {
            if field.len() > limits.max_small_value || value.len() > limits.max_small_value {
                self.convert_to_map();
            }
        }
        match self {
            HashValue::Small(pairs) => {
                if let Some(slot) = pairs.iter_mut().find(|(f, _)| f == &field) {
                    slot.1 = value;
                    return true;
                }
                pairs.push((field, value));
            }
            HashValue::Map(dict) => return dict.replace(field, value).is_some(),
        }
        let overflow =
            matches!(&*self, HashValue::Small(pairs) if pairs.len() > limits.max_small_entries);
        if overflow {
            self.convert_to_map();
        }
        false
    }

    /// Removes a field. A map-encoded hash that drops below the minimum
    /// fill after the delete is scheduled for shrinking.
    pub fn delete(&mut self, field: &[u8]) -> bool {
        match self {
            HashValue::Small(pairs) => {
                if let Some(pos) = pairs.iter().position(|(f, _)| f.as_ref() == field) {
                    pairs.remove(pos);
                    true
                } else {
                    false
                }
            }
            HashValue::Map(dict) => {
                if dict.remove(field).is_ok() {
                    if ht_needs_resize(dict) {
                        let _ = dict.resize();
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Field/value pairs: insertion order for the compact encoding,
    /// unspecified order for the map encoding.
    pub fn iter(&self) -> HashIter<'_> {
        match self {
            HashValue::Small(pairs) => HashIter::Small(pairs.iter()),
            HashValue::Map(dict) => HashIter::Map(dict.iter()),
        }
    }

    /// Stateless scan step; the compact encoding is emitted whole with a
    /// final cursor of 0.
    pub fn scan<F>(&self, cursor: u64, mut emit: F) -> u64
    where
        F: FnMut(&Bytes, &Bytes),
    {
        match self {
            HashValue::Small(pairs) => {
                for (f, v) in pairs {
                    emit(f, v);
                }
                0
            }
            HashValue::Map(dict) => dict.scan(cursor, emit),
        }
    }

    /// One-shot promotion of the compact encoding into a hash map.
    fn convert_to_map(&mut self) {
        let pairs = match self {
            HashValue::Small(pairs) => std::mem::take(pairs),
            HashValue::Map(_) => panic!("hash is already map encoded"),
        };
        let mut dict = Dict::new();
        for (field, value) in pairs {
            if dict.add(field, value).is_err() {
                panic!("compact hash holds a duplicated field");
            }
        }
        *self = HashValue::Map(dict);
    }
}

impl Default for HashValue {
    fn default() -> Self {
        Self::new()
    }
}

pub enum HashIter<'a> {
    Small(std::slice::Iter<'a, (Bytes, Bytes)>),
    Map(DictIter<'a, Bytes, Bytes, SipHashBuilder>),
}

impl<'a> Iterator for HashIter<'a> {
    type Item = (&'a Bytes, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            HashIter::Small(it) => it.next().map(|(f, v)| (f, v)),
            HashIter::Map(it) => it.next(),
        }
    }
}

fn ht_needs_resize(dict: &Dict<Bytes, Bytes>) -> bool {
    let size = dict.slots();
    size > INITIAL_SIZE && dict.len() * 100 / size < MIN_FILL_PERCENT
}
