//! Engine tunables.

/// Recognized configuration knobs and their defaults. A value of the
/// struct is handed to the engine at construction; the engine threads
/// the relevant fields into the structures it builds.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of databases the engine hosts.
    pub databases: usize,
    /// Entry count above which a hash value leaves its compact encoding.
    pub hash_max_small_entries: usize,
    /// Field or value byte length above which a hash value leaves its
    /// compact encoding.
    pub hash_max_small_value: usize,
    /// Maximum elements per list segment.
    pub list_max_segment_size: usize,
    /// Uncompressed segments kept at each list end. Accepted for parity
    /// with the configuration surface.
    pub list_compress_depth: usize,
    /// Reclamation effort above which a deleted value goes to the
    /// background reclaimer instead of being dropped inline.
    pub lazyfree_threshold: usize,
    /// Master switch for keyspace table growth.
    pub can_resize: bool,
    /// Growth is forced past this used/buckets ratio even when
    /// `can_resize` is off.
    pub force_resize_ratio: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            databases: 16,
            hash_max_small_entries: 128,
            hash_max_small_value: 64,
            list_max_segment_size: 128,
            list_compress_depth: 0,
            lazyfree_threshold: 64,
            can_resize: true,
            force_resize_ratio: 5,
        }
    }
}
