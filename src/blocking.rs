//! Blocking wait queues on list keys.
//!
//! A client that pops from an empty or missing list key is parked: it
//! is registered in a per-key FIFO of waiters and its socket stops
//! being read by the serving layer. When a push makes one of those keys
//! non-empty the key is queued on an engine-wide ready list, and after
//! the running command completes the engine walks that list and serves
//! waiters oldest first. Timeouts are enforced by a periodic sweep, not
//! by parking threads.

use std::collections::VecDeque;

use bytes::Bytes;
use slog::debug;

use crate::client::{ClientId, Reply};
use crate::commands::CommandError;
use crate::engine::{Engine, EventClass, ReadyKey};
use crate::list_value::{ListEnd, ListEntry, ListValue};
use crate::object::Object;

impl Engine {
    /// Parks a client on a set of keys. The keys are recorded on the
    /// client (deduplicated, registration order) and the client is
    /// appended to each key's waiter FIFO. The pop end and the optional
    /// move target are captured here so the waker needs nothing from
    /// the command that blocked.
    pub fn block_for_keys(
        &mut self,
        id: ClientId,
        keys: &[Bytes],
        timeout_ms: i64,
        target: Option<Bytes>,
        end: ListEnd,
    ) {
        let now = self.now_ms;
        let (db, fresh_keys) = {
            let client = self.client_mut(id);
            client.blocking.deadline_ms = if timeout_ms > 0 {
                Some(now + timeout_ms)
            } else {
                None
            };
            client.blocking.target = target;
            client.blocking.end = end;

            let mut fresh_keys = Vec::new();
            for key in keys {
                // A key listed twice still registers once.
                if client.blocking.keys.iter().any(|known| known == key) {
                    continue;
                }
                client.blocking.keys.push(key.clone());
                fresh_keys.push(key.clone());
            }
            (client.db, fresh_keys)
        };

        for key in fresh_keys {
            let waiters = &mut self.dbs[db].blocking_keys;
            let registered = waiters
                .get_mut(key.as_ref())
                .map(|queue| queue.push_back(id))
                .is_some();
            if !registered {
                let _ = waiters.replace(key, VecDeque::from([id]));
            }
        }
        self.client_mut(id).blocked = true;
    }

    /// Reverses every registration of a blocked client. Safe to call for
    /// a client that is not blocked.
    pub fn unblock_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if !client.blocked && client.blocking.keys.is_empty() {
            return;
        }
        let db = client.db;
        let keys = std::mem::take(&mut client.blocking.keys);
        client.blocking.target = None;
        client.blocking.deadline_ms = None;
        client.blocked = false;

        // Walk only the client's own registrations, never all waiter
        // lists.
        for key in keys {
            let waiters = &mut self.dbs[db].blocking_keys;
            let now_empty = match waiters.get_mut(key.as_ref()) {
                Some(queue) => {
                    queue.retain(|&waiter| waiter != id);
                    queue.is_empty()
                }
                None => false,
            };
            if now_empty {
                let _ = waiters.remove(key.as_ref());
            }
        }
    }

    /// Called from every list-push path. Queues the key for the
    /// post-command waker unless nobody waits on it or it is already
    /// queued.
    pub(crate) fn signal_list_as_ready(&mut self, db: usize, key: &Bytes) {
        let keyspace = &mut self.dbs[db];
        if keyspace.blocking_keys.get(key.as_ref()).is_none() {
            return;
        }
        if keyspace.ready_keys.get(key.as_ref()).is_some() {
            return;
        }
        let _ = keyspace.ready_keys.replace(key.clone(), ());
        self.ready.push_back(ReadyKey {
            db,
            key: key.clone(),
        });
    }

    /// Serves clients blocked on keys that received pushes. Runs after
    /// every command.
    ///
    /// The engine-wide FIFO is swapped for a fresh one before the walk,
    /// so serving a move variant can push to another blocked key and
    /// have it picked up by the next round of the outer loop.
    pub fn handle_ready_keys(&mut self) {
        while !self.ready.is_empty() {
            let batch = std::mem::take(&mut self.ready);
            for ready in batch {
                let db = ready.db;
                let key = ready.key;
                let _ = self.dbs[db].ready_keys.remove(key.as_ref());

                if !matches!(self.dbs[db].dict.get(key.as_ref()), Some(Object::List(_))) {
                    continue;
                }

                // Serve in the order the clients blocked.
                let waiting = self.dbs[db]
                    .blocking_keys
                    .get(key.as_ref())
                    .map_or(0, |queue| queue.len());
                for _ in 0..waiting {
                    let receiver = match self.dbs[db]
                        .blocking_keys
                        .get(key.as_ref())
                        .and_then(|queue| queue.front().copied())
                    {
                        Some(receiver) => receiver,
                        None => break,
                    };
                    let end = self.client(receiver).blocking.end;
                    let target = self.client(receiver).blocking.target.clone();
                    let value = match self.dbs[db].dict.get_mut(key.as_ref()) {
                        Some(Object::List(list)) => list.pop(end),
                        _ => None,
                    };
                    let Some(value) = value else {
                        break;
                    };
                    debug!(self.log, "waking blocked client"; "client" => receiver);
                    self.unblock_client(receiver);
                    if self.serve_blocked(receiver, &key, target, db, &value, end).is_err() {
                        // The move target had the wrong type; undo the
                        // pop so the element is not lost.
                        if let Some(Object::List(list)) = self.dbs[db].dict.get_mut(key.as_ref())
                        {
                            list.push(end, value);
                        }
                    }
                }

                let drained = matches!(
                    self.dbs[db].dict.get(key.as_ref()),
                    Some(Object::List(list)) if list.is_empty()
                );
                if drained {
                    self.dbs[db].delete(key.as_ref());
                }
            }
        }
    }

    /// Delivers one popped element to a woken client, including the
    /// push side of the atomic-move variant, and propagates the
    /// effective commands.
    fn serve_blocked(
        &mut self,
        receiver: ClientId,
        key: &Bytes,
        target: Option<Bytes>,
        db: usize,
        value: &ListEntry,
        end: ListEnd,
    ) -> Result<(), ()> {
        let Some(destination) = target else {
            let pop_name = match end {
                ListEnd::Head => Bytes::from_static(b"LPOP"),
                ListEnd::Tail => Bytes::from_static(b"RPOP"),
            };
            self.propagate(db, &[pop_name, key.clone()]);
            self.client_mut(receiver).add_reply(Reply::Array(vec![
                Reply::Bulk(key.clone()),
                Reply::Bulk(value.to_bytes()),
            ]));
            return Ok(());
        };

        let wrong_type = matches!(
            self.dbs[db].dict.get(destination.as_ref()),
            Some(existing) if !matches!(existing, Object::List(_))
        );
        if wrong_type {
            self.client_mut(receiver)
                .add_reply_error(CommandError::WrongType.to_string());
            return Err(());
        }

        self.propagate(db, &[Bytes::from_static(b"RPOP"), key.clone()]);
        if self.dbs[db].dict.get(destination.as_ref()).is_none() {
            let list = ListValue::new(
                self.config.list_max_segment_size,
                self.config.list_compress_depth,
            );
            self.dbs[db].add(destination.clone(), Object::List(list));
        }
        if let Some(Object::List(list)) = self.dbs[db].dict.get_mut(destination.as_ref()) {
            list.push(ListEnd::Head, value.clone());
        }
        self.notify(EventClass::List, "lpush", destination.as_ref(), db);
        self.signal_list_as_ready(db, &destination);
        self.propagate(
            db,
            &[
                Bytes::from_static(b"LPUSH"),
                destination.clone(),
                value.to_bytes(),
            ],
        );
        self.client_mut(receiver).add_reply_bulk(value.to_bytes());
        Ok(())
    }

    /// Unblocks every client whose deadline has passed, replying a null
    /// array as the pop commands do on timeout.
    pub fn handle_blocked_timeouts(&mut self, now_ms: i64) {
        let timed_out: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| {
                client.blocked
                    && client
                        .blocking
                        .deadline_ms
                        .map_or(false, |deadline| deadline <= now_ms)
            })
            .map(|client| client.id)
            .collect();
        for id in timed_out {
            self.unblock_client(id);
            self.client_mut(id).add_reply(Reply::NilArray);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lazyfree::LazyFree;
    use crate::logger::null_logger;

    fn engine() -> Engine {
        Engine::new(
            Config::default(),
            LazyFree::spawn(null_logger()),
            null_logger(),
        )
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn list_of(engine: &Engine, values: &[&str]) -> Object {
        let mut list = ListValue::new(
            engine.config.list_max_segment_size,
            engine.config.list_compress_depth,
        );
        for v in values {
            list.push(ListEnd::Tail, ListEntry::from_bytes(key(v)));
        }
        Object::List(list)
    }

    #[test]
    fn test_waiters_served_in_registration_order() {
        let mut engine = engine();
        let first = engine.new_client();
        let second = engine.new_client();
        let third = engine.new_client();
        for id in [first, second, third] {
            engine.block_for_keys(id, &[key("q")], 0, None, ListEnd::Head);
            assert!(engine.client(id).blocked);
        }

        // Two elements arrive; the first two waiters in order get them.
        let list = list_of(&engine, &["v1", "v2"]);
        engine.dbs[0].add(key("q"), list);
        engine.signal_list_as_ready(0, &key("q"));
        engine.handle_ready_keys();

        assert_eq!(
            engine.take_replies(first),
            vec![Reply::Array(vec![
                Reply::Bulk(key("q")),
                Reply::Bulk(key("v1"))
            ])]
        );
        assert_eq!(
            engine.take_replies(second),
            vec![Reply::Array(vec![
                Reply::Bulk(key("q")),
                Reply::Bulk(key("v2"))
            ])]
        );
        assert!(engine.take_replies(third).is_empty());
        assert!(!engine.client(first).blocked);
        assert!(!engine.client(second).blocked);
        assert!(engine.client(third).blocked);
        // The drained key is gone from the keyspace.
        assert!(engine.lookup_read(0, b"q").is_none());
    }

    #[test]
    fn test_signal_is_noop_without_waiters() {
        let mut engine = engine();
        let list = list_of(&engine, &["v"]);
        engine.dbs[0].add(key("k"), list);
        engine.signal_list_as_ready(0, &key("k"));
        assert!(engine.ready.is_empty());
    }

    #[test]
    fn test_signal_deduplicates_per_key() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(waiter, &[key("k")], 0, None, ListEnd::Head);
        engine.signal_list_as_ready(0, &key("k"));
        engine.signal_list_as_ready(0, &key("k"));
        assert_eq!(engine.ready.len(), 1);
    }

    #[test]
    fn test_blocking_set_deduplicates_keys() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(
            waiter,
            &[key("a"), key("a"), key("b")],
            0,
            None,
            ListEnd::Head,
        );
        assert_eq!(engine.client(waiter).blocking.keys.len(), 2);
        let queue_len = engine.dbs[0]
            .blocking_keys
            .get(b"a".as_ref())
            .map(|q| q.len());
        assert_eq!(queue_len, Some(1));
    }

    #[test]
    fn test_unblock_is_idempotent_and_cleans_registrations() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(waiter, &[key("a"), key("b")], 0, None, ListEnd::Head);
        engine.unblock_client(waiter);
        assert!(!engine.client(waiter).blocked);
        assert!(engine.client(waiter).blocking.keys.is_empty());
        assert!(engine.dbs[0].blocking_keys.get(b"a".as_ref()).is_none());
        assert!(engine.dbs[0].blocking_keys.get(b"b".as_ref()).is_none());
        // A second unblock finds nothing to undo.
        engine.unblock_client(waiter);
    }

    #[test]
    fn test_tail_end_recorded_at_block_time_is_honored() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(waiter, &[key("q")], 0, None, ListEnd::Tail);
        let list = list_of(&engine, &["first", "last"]);
        engine.dbs[0].add(key("q"), list);
        engine.signal_list_as_ready(0, &key("q"));
        engine.handle_ready_keys();
        assert_eq!(
            engine.take_replies(waiter),
            vec![Reply::Array(vec![
                Reply::Bulk(key("q")),
                Reply::Bulk(key("last"))
            ])]
        );
    }

    #[test]
    fn test_move_variant_pushes_to_target() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(waiter, &[key("src")], 0, Some(key("dst")), ListEnd::Tail);
        let list = list_of(&engine, &["v"]);
        engine.dbs[0].add(key("src"), list);
        engine.signal_list_as_ready(0, &key("src"));
        engine.handle_ready_keys();

        assert_eq!(engine.take_replies(waiter), vec![Reply::Bulk(key("v"))]);
        let moved = match engine.lookup_read(0, b"dst") {
            Some(Object::List(list)) => list.len(),
            _ => 0,
        };
        assert_eq!(moved, 1);
        assert!(engine.lookup_read(0, b"src").is_none());
    }

    #[test]
    fn test_move_variant_undoes_pop_on_wrong_typed_target() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.dbs[0].add(key("dst"), Object::Str(key("not a list")));
        engine.block_for_keys(waiter, &[key("src")], 0, Some(key("dst")), ListEnd::Tail);
        let list = list_of(&engine, &["v"]);
        engine.dbs[0].add(key("src"), list);
        engine.signal_list_as_ready(0, &key("src"));
        engine.handle_ready_keys();

        let replies = engine.take_replies(waiter);
        assert!(matches!(&replies[..], [Reply::Error(text)] if text.starts_with("WRONGTYPE")));
        // The popped element went back to the source list.
        let restored = match engine.lookup_read(0, b"src") {
            Some(Object::List(list)) => list.len(),
            _ => 0,
        };
        assert_eq!(restored, 1);
    }

    #[test]
    fn test_timeout_sweep_unblocks_with_null_reply() {
        let mut engine = engine();
        let waiter = engine.new_client();
        engine.block_for_keys(waiter, &[key("q")], 50, None, ListEnd::Head);
        let deadline = engine.client(waiter).blocking.deadline_ms.unwrap();

        engine.handle_blocked_timeouts(deadline - 1);
        assert!(engine.client(waiter).blocked);

        engine.handle_blocked_timeouts(deadline);
        assert!(!engine.client(waiter).blocked);
        assert_eq!(engine.take_replies(waiter), vec![Reply::NilArray]);
    }
}
