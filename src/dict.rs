//! Incrementally rehashed chained hash map.
//!
//! This is the table that backs every keyspace structure in the engine:
//! the key -> value dictionary itself, the expiry index, hash values in
//! their large encoding, and the blocking/ready bookkeeping. Buckets are
//! singly linked chains; growth happens incrementally by migrating a few
//! buckets at a time from the old table to the new one, so no single
//! insert ever pays for a full rehash.
//!
//! The map holds two tables. Outside of a rehash only table 0 is
//! populated. During a rehash both tables are live and a cursor tracks
//! the next table-0 bucket to migrate; every index below the cursor is
//! already empty. Lookups probe table 0 first and fall through to
//! table 1 only while rehashing.

use std::borrow::Borrow;
use std::cell::Cell;
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::{Duration, Instant};

use rand::Rng;
use siphasher::sip::SipHasher13;
use thiserror::Error;

/// Initial bucket count for a freshly used map.
pub const INITIAL_SIZE: usize = 4;

/// Buckets migrated per batch by [`Dict::rehash_for`].
const TIMED_REHASH_BATCH: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DictError {
    #[error("key already exists")]
    DuplicateKey,
    #[error("key not found")]
    NotFound,
    #[error("resize refused")]
    ResizeRefused,
}

/// SipHash-1-3 build-hasher keyed with two 64-bit values.
///
/// Every map gets its own random keys so chain shapes are not
/// predictable from the outside. Tests pin the keys with
/// [`SipHashBuilder::with_keys`].
#[derive(Clone, Debug)]
pub struct SipHashBuilder {
    k0: u64,
    k1: u64,
}

impl SipHashBuilder {
    pub fn random() -> Self {
        let mut rng = rand::rng();
        Self {
            k0: rng.random(),
            k1: rng.random(),
        }
    }

    pub fn with_keys(k0: u64, k1: u64) -> Self {
        Self { k0, k1 }
    }
}

impl Default for SipHashBuilder {
    fn default() -> Self {
        Self::random()
    }
}

impl BuildHasher for SipHashBuilder {
    type Hasher = SipHasher13;

    fn build_hasher(&self) -> SipHasher13 {
        SipHasher13::new_with_keys(self.k0, self.k1)
    }
}

type Link<K, V> = Option<Box<Entry<K, V>>>;

struct Entry<K, V> {
    key: K,
    value: V,
    /// Cached so bucket migration never has to hash the key again.
    hash: u64,
    next: Link<K, V>,
}

struct Table<K, V> {
    buckets: Box<[Link<K, V>]>,
    used: usize,
}

impl<K, V> Table<K, V> {
    fn empty() -> Self {
        Table {
            buckets: Vec::new().into_boxed_slice(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Table {
            buckets: buckets.into_boxed_slice(),
            used: 0,
        }
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }

    fn mask(&self) -> usize {
        self.buckets.len().wrapping_sub(1)
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Unlink chains iteratively so a long chain cannot blow the stack
        // through recursive box drops.
        for bucket in self.buckets.iter_mut() {
            let mut chain = bucket.take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
            }
        }
    }
}

/// Chained hash map with incremental background rehash.
pub struct Dict<K, V, S = SipHashBuilder> {
    tables: [Table<K, V>; 2],
    /// Index of the next table-0 bucket to migrate, -1 when stable.
    rehash_idx: isize,
    /// Live safe iterators. While non-zero no rehash step runs.
    iterators: Cell<u32>,
    hasher: S,
    can_resize: bool,
    force_resize_ratio: usize,
}

impl<K: Hash + Eq, V> Dict<K, V, SipHashBuilder> {
    pub fn new() -> Self {
        Self::with_hasher(SipHashBuilder::random())
    }
}

impl<K: Hash + Eq, V> Default for Dict<K, V, SipHashBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Dict<K, V, S> {
    /// Master switch for expansion. Even when disabled the table still
    /// grows once the used/size ratio passes the force ratio.
    pub fn set_can_resize(&mut self, allowed: bool) {
        self.can_resize = allowed;
    }

    pub fn set_force_resize_ratio(&mut self, ratio: usize) {
        self.force_resize_ratio = ratio;
    }

    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bucket count across both tables.
    pub fn slots(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// Digest of the map shape: both table pointers, sizes and entry
    /// counts folded through Wang's 64-bit integer mix. Two equal
    /// fingerprints mean the map was (almost certainly) not structurally
    /// modified in between. Used as the tamper check for plain iterators.
    pub fn fingerprint(&self) -> u64 {
        let integers = [
            self.tables[0].buckets.as_ptr() as u64,
            self.tables[0].size() as u64,
            self.tables[0].used as u64,
            self.tables[1].buckets.as_ptr() as u64,
            self.tables[1].size() as u64,
            self.tables[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for v in integers {
            hash = hash.wrapping_add(v);
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    fn iter_next<'a>(
        &'a self,
        table: &mut usize,
        bucket: &mut isize,
        entry: &mut Option<&'a Entry<K, V>>,
    ) -> Option<(&'a K, &'a V)> {
        loop {
            if let Some(current) = entry.take() {
                *entry = current.next.as_deref();
                return Some((&current.key, &current.value));
            }
            *bucket += 1;
            if *bucket as usize >= self.tables[*table].size() {
                if self.is_rehashing() && *table == 0 {
                    *table = 1;
                    *bucket = 0;
                } else {
                    return None;
                }
            }
            if (*bucket as usize) < self.tables[*table].size() {
                *entry = self.tables[*table].buckets[*bucket as usize].as_deref();
            }
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Dict<K, V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Dict {
            tables: [Table::empty(), Table::empty()],
            rehash_idx: -1,
            iterators: Cell::new(0),
            hasher,
            can_resize: true,
            force_resize_ratio: 5,
        }
    }

    fn hash_key<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Migrates up to `n` non-empty buckets from table 0 to table 1.
    ///
    /// The cursor also advances past empty buckets; to bound the work of
    /// one call it gives up after visiting `10 * n` empty buckets without
    /// finding a populated one. Returns true while buckets remain.
    pub fn rehash(&mut self, n: usize) -> bool {
        let mut empty_visits = n * 10;
        if !self.is_rehashing() {
            return false;
        }

        let mut budget = n;
        while budget > 0 && self.tables[0].used != 0 {
            budget -= 1;

            // The cursor cannot run off the table while entries remain.
            debug_assert!((self.rehash_idx as usize) < self.tables[0].size());
            while self.tables[0].buckets[self.rehash_idx as usize].is_none() {
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            let idx = self.rehash_idx as usize;
            let mut chain = self.tables[0].buckets[idx].take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let dest = (entry.hash as usize) & self.tables[1].mask();
                entry.next = self.tables[1].buckets[dest].take();
                self.tables[1].buckets[dest] = Some(entry);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_idx += 1;
        }

        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::replace(&mut self.tables[1], Table::empty());
            self.rehash_idx = -1;
            return false;
        }
        true
    }

    /// Rehashes in batches of 100 buckets until the wall-clock budget is
    /// spent. Returns the number of buckets migrated.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        let start = Instant::now();
        let mut moved = 0;
        while self.rehash(TIMED_REHASH_BATCH) {
            moved += TIMED_REHASH_BATCH;
            if start.elapsed() > budget {
                break;
            }
        }
        moved
    }

    /// One bucket of opportunistic rehash, suppressed while safe
    /// iterators are alive. Called from lookup and mutation paths so an
    /// actively used map migrates itself.
    fn rehash_step(&mut self) {
        if self.iterators.get() == 0 {
            self.rehash(1);
        }
    }

    /// Grows (or first-initializes) the bucket array to the next power of
    /// two that holds `size` entries. Refused while a rehash is running
    /// or when the table already has that size.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() || self.tables[0].used > size {
            return Err(DictError::ResizeRefused);
        }
        let real_size = next_power(size);
        if real_size == self.tables[0].size() {
            return Err(DictError::ResizeRefused);
        }

        let fresh = Table::with_size(real_size);
        if self.tables[0].size() == 0 {
            // First initialization, nothing to migrate.
            self.tables[0] = fresh;
            return Ok(());
        }
        self.tables[1] = fresh;
        self.rehash_idx = 0;
        Ok(())
    }

    /// Shrinks the table to the smallest power of two holding the current
    /// entries, keeping the used/buckets ratio near one.
    pub fn resize(&mut self) -> Result<(), DictError> {
        if !self.can_resize || self.is_rehashing() {
            return Err(DictError::ResizeRefused);
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            let _ = self.expand(INITIAL_SIZE);
            return;
        }
        // Grow at the 1:1 ratio when resizing is allowed. When it is
        // globally suppressed (fork-friendly mode) growth is deferred
        // until the ratio passes the force threshold.
        if self.tables[0].used >= self.tables[0].size()
            && (self.can_resize
                || self.tables[0].used / self.tables[0].size() > self.force_resize_ratio)
        {
            let _ = self.expand(self.tables[0].used * 2);
        }
    }

    /// Locates an entry as (table, chain depth). Immutable counterpart of
    /// the mutating operations below, which renavigate by depth.
    fn locate<Q>(&self, hash: u64, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.len() == 0 {
            return None;
        }
        for table in 0..2 {
            if self.tables[table].size() == 0 {
                break;
            }
            let idx = (hash as usize) & self.tables[table].mask();
            let mut depth = 0;
            let mut cursor = self.tables[table].buckets[idx].as_deref();
            while let Some(entry) = cursor {
                if entry.hash == hash && entry.key.borrow() == key {
                    return Some((table, depth));
                }
                depth += 1;
                cursor = entry.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.hash_key(key);
        let (table, depth) = self.locate(hash, key)?;
        let idx = (hash as usize) & self.tables[table].mask();
        let mut entry = self.tables[table].buckets[idx].as_deref()?;
        for _ in 0..depth {
            entry = entry.next.as_deref()?;
        }
        Some(&entry.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.hash_key(key);
        let (table, depth) = self.locate(hash, key)?;
        let idx = (hash as usize) & self.tables[table].mask();
        let mut entry = self.tables[table].buckets[idx].as_deref_mut()?;
        for _ in 0..depth {
            let here = entry;
            entry = here.next.as_deref_mut()?;
        }
        Some(&mut entry.value)
    }

    pub fn contains_key<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(key).is_some()
    }

    /// Inserts a new key. Fails with [`DictError::DuplicateKey`] when the
    /// key is already present; the existing entry is left untouched.
    pub fn add(&mut self, key: K, value: V) -> Result<(), DictError> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.hash_key(&key);
        self.expand_if_needed();
        if self.locate(hash, &key).is_some() {
            return Err(DictError::DuplicateKey);
        }
        self.insert_fresh(hash, key, value);
        Ok(())
    }

    /// Add-or-overwrite. Returns the previous value when the key existed.
    /// The new value is installed before the old one is released, which
    /// is the order reference-counted value domains require.
    pub fn replace(&mut self, key: K, value: V) -> Option<V> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.hash_key(&key);
        if let Some((table, depth)) = self.locate(hash, &key) {
            let idx = (hash as usize) & self.tables[table].mask();
            let mut entry = self.tables[table].buckets[idx]
                .as_deref_mut()
                .expect("located entry");
            for _ in 0..depth {
                let here = entry;
                entry = here.next.as_deref_mut().expect("located entry");
            }
            return Some(std::mem::replace(&mut entry.value, value));
        }
        self.expand_if_needed();
        self.insert_fresh(hash, key, value);
        None
    }

    /// New entries go to the head of their chain; recently added keys
    /// tend to be the ones accessed next. While rehashing all inserts
    /// target the new table so table 0 only ever drains.
    fn insert_fresh(&mut self, hash: u64, key: K, value: V) {
        let table = if self.is_rehashing() { 1 } else { 0 };
        let idx = (hash as usize) & self.tables[table].mask();
        let next = self.tables[table].buckets[idx].take();
        self.tables[table].buckets[idx] = Some(Box::new(Entry {
            key,
            value,
            hash,
            next,
        }));
        self.tables[table].used += 1;
    }

    /// Detaches an entry and hands back its key and value, so a caller
    /// can inspect the value before dropping it without a second lookup.
    pub fn unlink<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.hash_key(key);
        let (table, depth) = self.locate(hash, key)?;
        let idx = (hash as usize) & self.tables[table].mask();
        let mut link = &mut self.tables[table].buckets[idx];
        for _ in 0..depth {
            let here = link;
            link = &mut here.as_deref_mut().expect("located entry").next;
        }
        let mut boxed = link.take().expect("located entry");
        *link = boxed.next.take();
        self.tables[table].used -= 1;
        let Entry { key, value, .. } = *boxed;
        Some((key, value))
    }

    /// Removes an entry and drops it. Fails with [`DictError::NotFound`]
    /// for a missing key.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<(), DictError>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        match self.unlink(key) {
            Some(_) => Ok(()),
            None => Err(DictError::NotFound),
        }
    }

    /// Drops every entry and returns the map to its pristine state.
    pub fn clear(&mut self) {
        self.tables[0] = Table::empty();
        self.tables[1] = Table::empty();
        self.rehash_idx = -1;
        self.iterators.set(0);
    }

    /// Uniform-ish random entry. While rehashing the two tables are
    /// treated as one logical index range starting at the rehash cursor,
    /// since everything below the cursor in table 0 is already empty.
    pub fn random_entry(&mut self) -> Option<(&K, &V)> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let mut rng = rand::rng();
        let (table, idx) = if self.is_rehashing() {
            let s0 = self.tables[0].size();
            let s1 = self.tables[1].size();
            let base = self.rehash_idx as usize;
            loop {
                let h = base + rng.random_range(0..(s0 + s1 - base));
                let (table, idx) = if h >= s0 { (1, h - s0) } else { (0, h) };
                if self.tables[table].buckets[idx].is_some() {
                    break (table, idx);
                }
            }
        } else {
            loop {
                let idx = rng.random_range(0..self.tables[0].size());
                if self.tables[0].buckets[idx].is_some() {
                    break (0, idx);
                }
            }
        };

        // The bucket is a chain; count it, then pick a uniform position.
        let mut chain_len = 0;
        let mut cursor = self.tables[table].buckets[idx].as_deref();
        while let Some(entry) = cursor {
            chain_len += 1;
            cursor = entry.next.as_deref();
        }
        let mut pick = rng.random_range(0..chain_len);
        let mut entry = self.tables[table].buckets[idx].as_deref().expect("non-empty bucket");
        while pick > 0 {
            entry = entry.next.as_deref().expect("picked within chain");
            pick -= 1;
        }
        Some((&entry.key, &entry.value))
    }

    /// Samples up to `count` entries from random locations.
    ///
    /// Makes no uniqueness or distribution promise; it walks contiguous
    /// buckets from a random start and emits whole chains, jumping to a
    /// new start after a run of empty buckets. Much cheaper than calling
    /// [`Dict::random_entry`] `count` times.
    pub fn sample(&mut self, count: usize) -> Vec<(&K, &V)> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }
        let mut max_steps = count * 10;

        // Do rehash work proportional to the requested sample first.
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut max_mask = self.tables[0].mask();
        if tables > 1 && self.tables[1].mask() > max_mask {
            max_mask = self.tables[1].mask();
        }

        let mut rng = rand::rng();
        let mut i = rng.random_range(0..=max_mask);
        let mut empty_run = 0;
        let mut out: Vec<(&K, &V)> = Vec::with_capacity(count);

        while out.len() < count && max_steps > 0 {
            max_steps -= 1;
            for table in 0..tables {
                // Buckets of table 0 below the rehash cursor are empty.
                if tables == 2 && table == 0 && i < self.rehash_idx as usize {
                    // Out of range for the new table too means nothing
                    // lives below the cursor in either table; jump ahead.
                    if i >= self.tables[1].size() {
                        i = self.rehash_idx as usize;
                    }
                    continue;
                }
                if i >= self.tables[table].size() {
                    continue;
                }
                let mut cursor = self.tables[table].buckets[i].as_deref();
                if cursor.is_none() {
                    empty_run += 1;
                    if empty_run >= 5 && empty_run > count {
                        i = rng.random_range(0..=max_mask);
                        empty_run = 0;
                    }
                } else {
                    empty_run = 0;
                    while let Some(entry) = cursor {
                        out.push((&entry.key, &entry.value));
                        if out.len() == count {
                            return out;
                        }
                        cursor = entry.next.as_deref();
                    }
                }
            }
            i = (i + 1) & max_mask;
        }
        out
    }

    /// One step of the stateless full-table scan.
    ///
    /// Start with cursor 0, feed each returned cursor back in, stop when
    /// it returns 0 again. Every entry alive for the whole scan is
    /// visited at least once; entries may be visited more than once. The
    /// cursor survives table resizes between calls because it advances by
    /// incrementing the reversed bit pattern (64-bit words): growing the
    /// table only appends high bits to bucket indices, and those are
    /// exactly the bits the reversed increment exhausts before moving on.
    ///
    /// While rehashing the smaller table is emitted first, then every
    /// bucket of the larger table that expands the same cursor.
    pub fn scan<F>(&self, cursor: u64, mut emit: F) -> u64
    where
        F: FnMut(&K, &V),
    {
        if self.len() == 0 {
            return 0;
        }
        let mut v = cursor;

        if !self.is_rehashing() {
            let m0 = self.tables[0].mask() as u64;
            self.emit_bucket(0, (v & m0) as usize, &mut emit);

            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
            return v;
        }

        // Keep `small` the smaller table; a shrink swaps the roles.
        let (small, large) = if self.tables[0].size() > self.tables[1].size() {
            (1, 0)
        } else {
            (0, 1)
        };
        let m0 = self.tables[small].mask() as u64;
        let m1 = self.tables[large].mask() as u64;

        self.emit_bucket(small, (v & m0) as usize, &mut emit);

        // All buckets of the larger table that are expansions of the
        // current cursor in the smaller one.
        loop {
            self.emit_bucket(large, (v & m1) as usize, &mut emit);
            v = (((v | m0).wrapping_add(1)) & !m0) | (v & m0);
            if v & (m0 ^ m1) == 0 {
                break;
            }
        }

        v |= !m0;
        v = v.reverse_bits().wrapping_add(1).reverse_bits();
        v
    }

    fn emit_bucket<F>(&self, table: usize, idx: usize, emit: &mut F)
    where
        F: FnMut(&K, &V),
    {
        let mut cursor = self.tables[table].buckets[idx].as_deref();
        while let Some(entry) = cursor {
            emit(&entry.key, &entry.value);
            cursor = entry.next.as_deref();
        }
    }

    /// Plain iterator. Takes the map fingerprint at creation and panics
    /// on drop if it changed: catching that means some code mutated the
    /// map through interior means while iterating, a programming error.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            dict: self,
            table: 0,
            bucket: -1,
            entry: None,
            fingerprint: self.fingerprint(),
        }
    }

    /// Safe iterator. While one is alive the opportunistic rehash step is
    /// suppressed, so the two-table walk cannot be disturbed.
    pub fn iter_safe(&self) -> SafeIter<'_, K, V, S> {
        SafeIter {
            dict: self,
            table: 0,
            bucket: -1,
            entry: None,
            registered: false,
        }
    }
}

/// Fingerprint-guarded iterator over all live entries.
pub struct Iter<'a, K, V, S> {
    dict: &'a Dict<K, V, S>,
    table: usize,
    bucket: isize,
    entry: Option<&'a Entry<K, V>>,
    fingerprint: u64,
}

impl<'a, K: Hash + Eq, V, S: BuildHasher> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.dict
            .iter_next(&mut self.table, &mut self.bucket, &mut self.entry)
    }
}

impl<'a, K, V, S> Drop for Iter<'a, K, V, S> {
    fn drop(&mut self) {
        // A changed fingerprint means the map was mutated mid-iteration.
        assert_eq!(
            self.fingerprint,
            self.dict.fingerprint(),
            "dict mutated during unguarded iteration"
        );
    }
}

/// Iterator that pauses incremental rehash for its lifetime.
pub struct SafeIter<'a, K, V, S> {
    dict: &'a Dict<K, V, S>,
    table: usize,
    bucket: isize,
    entry: Option<&'a Entry<K, V>>,
    registered: bool,
}

impl<'a, K: Hash + Eq, V, S: BuildHasher> Iterator for SafeIter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.registered {
            self.registered = true;
            self.dict.iterators.set(self.dict.iterators.get() + 1);
        }
        self.dict
            .iter_next(&mut self.table, &mut self.bucket, &mut self.entry)
    }
}

impl<'a, K, V, S> Drop for SafeIter<'a, K, V, S> {
    fn drop(&mut self) {
        if self.registered {
            self.dict.iterators.set(self.dict.iterators.get() - 1);
        }
    }
}

fn next_power(size: usize) -> usize {
    let mut i = INITIAL_SIZE;
    if size >= usize::MAX / 2 {
        return usize::MAX / 2 + 1;
    }
    loop {
        if i >= size {
            return i;
        }
        i *= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_dict() -> Dict<String, u64> {
        Dict::with_hasher(SipHashBuilder::with_keys(7, 13))
    }

    /// Finishes any in-flight rehash, then starts a fresh one by doubling
    /// the table, leaving the dict deterministically in rehashing state.
    fn force_rehashing(d: &mut Dict<String, u64>) {
        while d.rehash(64) {}
        let doubled = d.tables[0].size() * 2;
        d.expand(doubled).unwrap();
        assert!(d.is_rehashing());
    }

    #[test]
    fn test_add_get_remove() {
        let mut d = small_dict();
        assert_eq!(d.len(), 0);
        assert!(d.add("alpha".to_string(), 1).is_ok());
        assert!(d.add("beta".to_string(), 2).is_ok());
        assert_eq!(d.add("alpha".to_string(), 9), Err(DictError::DuplicateKey));
        assert_eq!(d.get("alpha"), Some(&1));
        assert_eq!(d.get("beta"), Some(&2));
        assert_eq!(d.get("gamma"), None);
        assert_eq!(d.len(), 2);

        assert!(d.remove("alpha").is_ok());
        assert_eq!(d.remove("alpha"), Err(DictError::NotFound));
        assert_eq!(d.get("alpha"), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_replace_returns_old_value() {
        let mut d = small_dict();
        assert_eq!(d.replace("k".to_string(), 1), None);
        assert_eq!(d.replace("k".to_string(), 2), Some(1));
        assert_eq!(d.get("k"), Some(&2));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_unlink_hands_back_ownership() {
        let mut d = small_dict();
        d.add("k".to_string(), 42).unwrap();
        let (k, v) = d.unlink("k").unwrap();
        assert_eq!(k, "k");
        assert_eq!(v, 42);
        assert_eq!(d.len(), 0);
        assert!(d.unlink("k").is_none());
    }

    #[test]
    fn test_lookup_survives_incremental_rehash() {
        let mut d = small_dict();
        for i in 0..1000u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        // Drive any in-flight rehash one step at a time while checking
        // lookups against the expected values.
        for i in 0..1000u64 {
            assert_eq!(d.get(format!("key:{i}").as_str()), Some(&i));
        }
        while d.rehash(1) {}
        assert!(!d.is_rehashing());
        assert_eq!(d.len(), 1000);
    }

    #[test]
    fn test_size_accounting_through_mixed_ops() {
        let mut d = small_dict();
        for i in 0..500u64 {
            d.add(format!("key:{i}"), i).unwrap();
            assert_eq!(d.len(), d.tables[0].used + d.tables[1].used);
        }
        for i in 0..500u64 {
            if i % 2 == 0 {
                d.remove(format!("key:{i}").as_str()).unwrap();
            }
            assert_eq!(d.len(), d.tables[0].used + d.tables[1].used);
        }
        assert_eq!(d.len(), 250);
    }

    #[test]
    fn test_no_key_lives_in_both_tables() {
        let mut d = small_dict();
        for i in 0..512u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        force_rehashing(&mut d);
        while d.is_rehashing() {
            d.rehash(1);
            let mut seen = HashSet::new();
            for table in 0..2 {
                let mut chains = 0;
                for bucket in d.tables[table].buckets.iter() {
                    let mut cursor = bucket.as_deref();
                    while let Some(entry) = cursor {
                        assert!(seen.insert(entry.key.clone()), "key present twice");
                        chains += 1;
                        cursor = entry.next.as_deref();
                    }
                }
                assert_eq!(chains, d.tables[table].used);
            }
        }
    }

    #[test]
    fn test_rehash_leaves_migrated_prefix_empty() {
        let mut d = small_dict();
        for i in 0..256u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        force_rehashing(&mut d);
        d.rehash(4);
        if d.is_rehashing() {
            assert!(d.rehash_idx > 0);
            for idx in 0..d.rehash_idx as usize {
                assert!(d.tables[0].buckets[idx].is_none());
            }
        }
    }

    #[test]
    fn test_deleting_everything_empties_both_tables() {
        let mut d = small_dict();
        for i in 0..300u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        for i in 0..300u64 {
            d.remove(format!("key:{i}").as_str()).unwrap();
        }
        assert_eq!(d.len(), 0);
        d.clear();
        assert_eq!(d.slots(), 0);
        assert!(!d.is_rehashing());
    }

    #[test]
    fn test_expand_refused_while_rehashing() {
        let mut d = small_dict();
        for i in 0..64u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        force_rehashing(&mut d);
        assert_eq!(d.expand(1024), Err(DictError::ResizeRefused));
        assert_eq!(d.resize(), Err(DictError::ResizeRefused));
    }

    #[test]
    fn test_growth_deferred_when_resize_disabled() {
        let mut d = small_dict();
        d.set_can_resize(false);
        for i in 0..16u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        while d.rehash(16) {}
        let size_before = d.tables[0].size();
        // At a 1:1 ratio with resizing disabled the ratio check (> 5)
        // fails, so growth is deferred rather than triggered.
        assert!(d.tables[0].used <= size_before * 5 + size_before);

        for i in 16..200u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        // Once the ratio passes the force threshold growth happens even
        // with resizing disabled.
        assert!(d.slots() > size_before);
        for i in 0..200u64 {
            assert_eq!(d.get(format!("key:{i}").as_str()), Some(&i));
        }
    }

    #[test]
    fn test_resize_shrinks_after_mass_delete() {
        let mut d = small_dict();
        for i in 0..1024u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        while d.rehash(64) {}
        for i in 0..1000u64 {
            d.remove(format!("key:{i}").as_str()).unwrap();
        }
        assert!(d.resize().is_ok());
        while d.rehash(64) {}
        assert_eq!(d.tables[0].size(), 32);
        for i in 1000..1024u64 {
            assert_eq!(d.get(format!("key:{i}").as_str()), Some(&i));
        }
    }

    #[test]
    fn test_scan_emits_every_key_at_least_once() {
        let mut d = small_dict();
        for i in 0..777u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.clone());
            });
            // Interleave rehash work between scan calls.
            d.rehash(1);
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 777);
    }

    #[test]
    fn test_scan_tolerates_growth_between_calls() {
        let mut d = small_dict();
        for i in 0..64u64 {
            d.add(format!("stable:{i}"), i).unwrap();
        }
        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut extra = 0u64;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.clone());
            });
            // Grow the table mid-scan; stable keys must still be covered.
            // The inserts are capped so the scan can outrun the growth.
            if extra < 512 {
                for _ in 0..8 {
                    d.add(format!("extra:{extra}"), extra).unwrap();
                    extra += 1;
                }
            }
            if cursor == 0 {
                break;
            }
        }
        for i in 0..64u64 {
            assert!(seen.contains(&format!("stable:{i}")), "missing stable:{i}");
        }
    }

    #[test]
    fn test_fingerprint_tracks_structural_change() {
        let mut d = small_dict();
        d.add("a".to_string(), 1).unwrap();
        let before = d.fingerprint();
        assert_eq!(before, d.fingerprint());
        d.add("b".to_string(), 2).unwrap();
        assert_ne!(before, d.fingerprint());
    }

    #[test]
    fn test_safe_iterator_blocks_rehash_step() {
        let mut d = small_dict();
        for i in 0..128u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        force_rehashing(&mut d);
        assert_eq!(d.rehash_idx, 0);
        {
            let mut it = d.iter_safe();
            it.next();
            assert_eq!(d.iterators.get(), 1);
        }
        assert_eq!(d.iterators.get(), 0);
        // Lookups step the rehash again once the iterator is gone.
        let _ = d.get("key:0");
        assert!(d.rehash_idx != 0 || !d.is_rehashing());
    }

    #[test]
    fn test_iterator_covers_both_tables() {
        let mut d = small_dict();
        for i in 0..96u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        force_rehashing(&mut d);
        d.rehash(4);
        assert!(d.is_rehashing());
        let seen: HashSet<String> = d.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(seen.len(), 96);
    }

    #[test]
    fn test_random_entry_and_sample_bounds() {
        let mut d = small_dict();
        assert!(d.random_entry().is_none());
        for i in 0..64u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        for _ in 0..32 {
            let (k, v) = d.random_entry().unwrap();
            assert_eq!(k, &format!("key:{v}"));
        }
        let sampled = d.sample(16);
        assert!(sampled.len() <= 16);
        assert!(!sampled.is_empty());
        let more_than_present = d.sample(1000);
        assert!(more_than_present.len() <= 64);
    }

    #[test]
    fn test_timed_rehash_reports_progress() {
        let mut d = small_dict();
        for i in 0..4096u64 {
            d.add(format!("key:{i}"), i).unwrap();
        }
        if d.is_rehashing() {
            let moved = d.rehash_for(Duration::from_millis(50));
            assert!(moved > 0);
        }
    }
}
