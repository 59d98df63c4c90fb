//! Composition root: databases, clients, hooks and the command entry
//! point.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use jiff::Timestamp;
use slog::{debug, info, Logger};

use crate::client::{Client, ClientId, Reply};
use crate::commands;
use crate::config::Config;
use crate::db::Db;
use crate::lazyfree::LazyFree;
use crate::object::Object;

/// Coarse class of a keyspace event, mirrored from the notification
/// configuration surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    Generic,
    String,
    Hash,
    List,
}

/// The closed event-name vocabulary the engine emits.
pub const EVENT_NAMES: &[&str] = &[
    "set",
    "del",
    "hset",
    "hincrby",
    "hincrbyfloat",
    "hdel",
    "lpush",
    "rpush",
    "lpop",
    "rpop",
    "linsert",
    "lrem",
    "ltrim",
    "expire",
    "expired",
    "evicted",
];

/// Keyspace-event hook, fired on every mutation.
pub trait EventSink {
    fn notify(&mut self, class: EventClass, event: &str, key: &[u8], db: u32);
}

/// Default sink that ignores every event.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&mut self, _class: EventClass, _event: &str, _key: &[u8], _db: u32) {}
}

/// Replication/AOF hook. The engine reports the effective commands it
/// performs on behalf of woken blocked clients through this.
pub trait Propagator {
    fn propagate(&mut self, db: u32, argv: &[Bytes]);
}

pub struct NullPropagator;

impl Propagator for NullPropagator {
    fn propagate(&mut self, _db: u32, _argv: &[Bytes]) {}
}

/// One entry of the engine-wide ready-keys FIFO.
pub(crate) struct ReadyKey {
    pub(crate) db: usize,
    pub(crate) key: Bytes,
}

pub struct Engine {
    pub(crate) dbs: Vec<Db>,
    pub(crate) clients: HashMap<ClientId, Client>,
    next_client: ClientId,
    /// Keys that became ready during the current command, drained at the
    /// post-command quiescent point.
    pub(crate) ready: VecDeque<ReadyKey>,
    lazyfree: LazyFree,
    pub(crate) config: Config,
    events: Box<dyn EventSink>,
    propagator: Box<dyn Propagator>,
    /// Wall clock cached per command, unix milliseconds.
    pub(crate) now_ms: i64,
    pub(crate) log: Logger,
}

impl Engine {
    pub fn new(config: Config, lazyfree: LazyFree, log: Logger) -> Self {
        let databases = config.databases.max(1);
        let dbs = (0..databases)
            .map(|index| Db::new(index as u32, &config))
            .collect();
        Engine {
            dbs,
            clients: HashMap::new(),
            next_client: 1,
            ready: VecDeque::new(),
            lazyfree,
            config,
            events: Box::new(NullEventSink),
            propagator: Box::new(NullPropagator),
            now_ms: Timestamp::now().as_millisecond(),
            log,
        }
    }

    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events = sink;
    }

    pub fn set_propagator(&mut self, propagator: Box<dyn Propagator>) {
        self.propagator = propagator;
    }

    pub fn new_client(&mut self) -> ClientId {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, Client::new(id));
        id
    }

    /// Drops a client, tearing down any blocking registrations first.
    pub fn remove_client(&mut self, id: ClientId) {
        self.unblock_client(id);
        self.clients.remove(&id);
    }

    pub fn client(&self, id: ClientId) -> &Client {
        self.clients.get(&id).expect("known client id")
    }

    pub fn client_mut(&mut self, id: ClientId) -> &mut Client {
        self.clients.get_mut(&id).expect("known client id")
    }

    pub fn take_replies(&mut self, id: ClientId) -> Vec<Reply> {
        self.client_mut(id).take_replies()
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db_len(&self, db: usize) -> usize {
        self.dbs[db].len()
    }

    /// Runs one command for a client, then serves any clients whose
    /// blocked keys became ready. This is the per-command quiescent
    /// point of the cooperative model.
    pub fn execute(&mut self, id: ClientId, argv: &[Bytes]) {
        self.now_ms = Timestamp::now().as_millisecond();
        if argv.is_empty() {
            self.client_mut(id)
                .add_reply_error("ERR empty command".to_string());
            return;
        }
        if let Err(error) = commands::dispatch(self, id, argv) {
            let text = error.to_string();
            self.client_mut(id).add_reply_error(text);
        }
        self.handle_ready_keys();
    }

    /// Periodic housekeeping: sweeps blocked clients past their
    /// deadline.
    pub fn cron(&mut self) {
        self.now_ms = Timestamp::now().as_millisecond();
        let now = self.now_ms;
        self.handle_blocked_timeouts(now);
    }

    pub(crate) fn notify(&mut self, class: EventClass, event: &str, key: &[u8], db: usize) {
        debug_assert!(EVENT_NAMES.contains(&event), "unknown event {event}");
        let db_id = self.dbs[db].id;
        self.events.notify(class, event, key, db_id);
    }

    pub(crate) fn propagate(&mut self, db: usize, argv: &[Bytes]) {
        let db_id = self.dbs[db].id;
        self.propagator.propagate(db_id, argv);
    }

    /// Expiry is lazy: a key past its deadline is removed the moment any
    /// lookup touches it, and the removal is propagated as a DEL.
    pub(crate) fn expire_if_needed(&mut self, db: usize, key: &[u8]) {
        let now = self.now_ms;
        if self.dbs[db].is_expired(key, now) {
            self.dbs[db].delete(key);
            self.propagate(
                db,
                &[Bytes::from_static(b"DEL"), Bytes::copy_from_slice(key)],
            );
            self.notify(EventClass::Generic, "expired", key, db);
        }
    }

    pub fn lookup_read(&mut self, db: usize, key: &[u8]) -> Option<&Object> {
        self.expire_if_needed(db, key);
        self.dbs[db].dict.get(key)
    }

    pub fn lookup_write(&mut self, db: usize, key: &[u8]) -> Option<&mut Object> {
        self.expire_if_needed(db, key);
        self.dbs[db].dict.get_mut(key)
    }

    /// Unlinks a key and decides how to reclaim the value: inline when
    /// it is cheap, through the background reclaimer when its effort
    /// passes the threshold. The unlink itself always happens now, so
    /// the key is gone from the keyspace either way.
    pub fn delete_async(&mut self, db: usize, key: &[u8]) -> bool {
        let threshold = self.config.lazyfree_threshold;
        let keyspace = &mut self.dbs[db];
        if !keyspace.expires.is_empty() {
            let _ = keyspace.expires.remove(key);
        }
        match keyspace.dict.unlink(key) {
            Some((_, value)) => {
                let effort = value.free_effort();
                if effort > threshold {
                    debug!(self.log, "value handed to reclaimer"; "effort" => effort);
                    self.lazyfree.queue_value(value);
                }
                true
            }
            None => false,
        }
    }

    /// Empties one database. The asynchronous flavor swaps in fresh
    /// tables and hands the old pair to the reclaimer.
    pub fn flush_db(&mut self, db: usize, asynchronous: bool) {
        let keys = self.dbs[db].len();
        if asynchronous {
            let config = self.config.clone();
            let (dict, expires) = self.dbs[db].take_all(&config);
            self.lazyfree.queue_database(dict, expires);
        } else {
            self.dbs[db].clear();
        }
        info!(self.log, "database flushed"; "db" => self.dbs[db].id, "keys" => keys);
    }

    pub fn lazyfree_pending(&self) -> usize {
        self.lazyfree.pending()
    }
}
