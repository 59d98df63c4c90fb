//! Core in-memory data engine of a Redis-style key/value server.
//!
//! This crate implements the storage heart of such a server and leaves
//! the network and persistence layers to its embedder:
//!
//! - An incrementally rehashed chained hash map with a stateless scan
//!   cursor, fingerprint-guarded iteration and random sampling
//! - Dual-encoded hash and segmented list value types
//! - Per-database keyspaces with lazy key expiry
//! - Background reclamation of expensive deleted values
//! - Blocking pop wait queues with FIFO wakeups on push
//!
//! The engine runs single-threaded and cooperative: commands execute to
//! completion on the caller's thread, and the only other thread is the
//! reclaimer, which owns whatever is handed to it. See [`engine::Engine`]
//! for the entry point.

pub mod blocking;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod dict;
pub mod engine;
pub mod hash_value;
pub mod lazyfree;
pub mod list_value;
pub mod logger;
pub mod object;

pub use client::{Client, ClientId, Reply};
pub use commands::CommandError;
pub use config::Config;
pub use dict::{Dict, DictError, SipHashBuilder};
pub use engine::{Engine, EventClass, EventSink, Propagator};
pub use hash_value::{HashLimits, HashValue};
pub use lazyfree::LazyFree;
pub use list_value::{Direction, ListEnd, ListEntry, ListValue};
pub use object::Object;
