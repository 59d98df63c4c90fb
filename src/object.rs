//! The tagged value stored under every key.

use bytes::Bytes;

use crate::hash_value::HashValue;
use crate::list_value::ListValue;

pub enum Object {
    Str(Bytes),
    Hash(HashValue),
    List(ListValue),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::Hash(_) => "hash",
            Object::List(_) => "list",
        }
    }

    /// Work needed to reclaim this value, in per-element units. Lists
    /// count segments, map-encoded hashes count fields, everything that
    /// is a single allocation counts one. Used to decide between inline
    /// and background reclamation.
    pub fn free_effort(&self) -> usize {
        match self {
            Object::List(list) => list.segment_count(),
            Object::Hash(hash) if hash.uses_map() => hash.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_value::HashLimits;
    use crate::list_value::{ListEnd, ListEntry};

    #[test]
    fn test_free_effort_per_type() {
        assert_eq!(Object::Str(Bytes::from_static(b"v")).free_effort(), 1);

        let mut list = ListValue::new(4, 0);
        for i in 0..20 {
            list.push(ListEnd::Tail, ListEntry::Int(i));
        }
        assert_eq!(Object::List(list).free_effort(), 5);

        let limits = HashLimits {
            max_small_entries: 2,
            max_small_value: 64,
        };
        let mut small = HashValue::new();
        small.set(Bytes::from_static(b"f"), Bytes::from_static(b"v"), &limits);
        assert_eq!(Object::Hash(small).free_effort(), 1);

        let mut big = HashValue::new();
        for i in 0..10u32 {
            big.set(
                Bytes::from(i.to_string()),
                Bytes::from_static(b"v"),
                &limits,
            );
        }
        assert_eq!(Object::Hash(big).free_effort(), 10);
    }
}
