//! List commands, including the blocking pops.

use bytes::Bytes;

use crate::client::{ClientId, Reply};
use crate::commands::{parse_int, parse_timeout_ms, CommandError};
use crate::engine::{Engine, EventClass};
use crate::list_value::{Direction, ListEnd, ListEntry, ListValue};
use crate::object::Object;

fn new_list(engine: &Engine) -> ListValue {
    ListValue::new(
        engine.config.list_max_segment_size,
        engine.config.list_compress_depth,
    )
}

pub fn lpush(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    push_generic(engine, id, argv, ListEnd::Head, false, "lpush")
}

pub fn rpush(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    push_generic(engine, id, argv, ListEnd::Tail, false, "rpush")
}

pub fn lpushx(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    push_generic(engine, id, argv, ListEnd::Head, true, "lpushx")
}

pub fn rpushx(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    push_generic(engine, id, argv, ListEnd::Tail, true, "rpushx")
}

/// Shared push body. Creates the list unless the X variant requires it
/// to exist, then signals the key as ready for any blocked waiters.
fn push_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    end: ListEnd,
    require_existing: bool,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() < 3 {
        return Err(CommandError::WrongArity(name));
    }
    let db = engine.client(id).db;
    engine.expire_if_needed(db, argv[1].as_ref());
    let exists = match engine.dbs[db].dict.get(argv[1].as_ref()) {
        Some(Object::List(_)) => true,
        Some(_) => return Err(CommandError::WrongType),
        None => false,
    };
    if !exists {
        if require_existing {
            engine.client_mut(id).add_reply_int(0);
            return Ok(());
        }
        let list = new_list(engine);
        engine.dbs[db].add(argv[1].clone(), Object::List(list));
    }

    let new_len = {
        let Some(Object::List(list)) = engine.dbs[db].dict.get_mut(argv[1].as_ref()) else {
            unreachable!("list ensured above")
        };
        for raw in &argv[2..] {
            list.push(end, ListEntry::from_bytes(raw.clone()));
        }
        list.len()
    };

    let event = match end {
        ListEnd::Head => "lpush",
        ListEnd::Tail => "rpush",
    };
    engine.notify(EventClass::List, event, argv[1].as_ref(), db);
    engine.signal_list_as_ready(db, &argv[1]);
    engine.client_mut(id).add_reply_int(new_len as i64);
    Ok(())
}

pub fn lpop(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    pop_generic(engine, id, argv, ListEnd::Head, "lpop")
}

pub fn rpop(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    pop_generic(engine, id, argv, ListEnd::Tail, "rpop")
}

fn pop_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    end: ListEnd,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity(name));
    }
    let db = engine.client(id).db;
    let popped = match engine.lookup_write(db, argv[1].as_ref()) {
        None => None,
        Some(Object::List(list)) => list.pop(end),
        Some(_) => return Err(CommandError::WrongType),
    };
    let Some(value) = popped else {
        engine.client_mut(id).add_reply_nil();
        return Ok(());
    };

    let event = match end {
        ListEnd::Head => "lpop",
        ListEnd::Tail => "rpop",
    };
    engine.notify(EventClass::List, event, argv[1].as_ref(), db);
    let drained = matches!(
        engine.dbs[db].dict.get(argv[1].as_ref()),
        Some(Object::List(list)) if list.is_empty()
    );
    if drained {
        engine.notify(EventClass::Generic, "del", argv[1].as_ref(), db);
        engine.dbs[db].delete(argv[1].as_ref());
    }
    engine.client_mut(id).add_reply_bulk(value.to_bytes());
    Ok(())
}

pub fn llen(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("llen"));
    }
    let db = engine.client(id).db;
    let len = match engine.lookup_read(db, argv[1].as_ref()) {
        None => 0,
        Some(Object::List(list)) => list.len() as i64,
        Some(_) => return Err(CommandError::WrongType),
    };
    engine.client_mut(id).add_reply_int(len);
    Ok(())
}

pub fn lindex(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("lindex"));
    }
    let index = parse_int(&argv[2])?;
    let db = engine.client(id).db;
    let value = match engine.lookup_read(db, argv[1].as_ref()) {
        None => None,
        Some(Object::List(list)) => list.get(index).map(ListEntry::to_bytes),
        Some(_) => return Err(CommandError::WrongType),
    };
    match value {
        Some(value) => engine.client_mut(id).add_reply_bulk(value),
        None => engine.client_mut(id).add_reply_nil(),
    }
    Ok(())
}

pub fn lset(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("lset"));
    }
    let index = parse_int(&argv[2])?;
    let db = engine.client(id).db;
    let replaced = match engine.lookup_write(db, argv[1].as_ref()) {
        None => return Err(CommandError::NoSuchKey),
        Some(Object::List(list)) => list.replace(index, ListEntry::from_bytes(argv[3].clone())),
        Some(_) => return Err(CommandError::WrongType),
    };
    if !replaced {
        return Err(CommandError::OutOfRange);
    }
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

/// Handles LINSERT: `LINSERT key BEFORE|AFTER pivot element`. Seeks the
/// pivot from the head and splices around it through the cursor, so no
/// second seek is needed for the insert itself.
pub fn linsert(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 5 {
        return Err(CommandError::WrongArity("linsert"));
    }
    let before = if argv[2].eq_ignore_ascii_case(b"BEFORE") {
        true
    } else if argv[2].eq_ignore_ascii_case(b"AFTER") {
        false
    } else {
        return Err(CommandError::Syntax);
    };

    let db = engine.client(id).db;
    let (inserted, new_len) = match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            engine.client_mut(id).add_reply_int(0);
            return Ok(());
        }
        Some(Object::List(list)) => {
            let mut inserted = false;
            let mut cursor = list.cursor_from(0, Direction::TowardTail);
            while let Some(entry) = cursor.next() {
                if entry.matches(argv[3].as_ref()) {
                    let element = ListEntry::from_bytes(argv[4].clone());
                    if before {
                        cursor.insert_before(element);
                    } else {
                        cursor.insert_after(element);
                    }
                    inserted = true;
                    break;
                }
            }
            (inserted, list.len())
        }
        Some(_) => return Err(CommandError::WrongType),
    };

    if !inserted {
        // Pivot not found.
        engine.client_mut(id).add_reply_int(-1);
        return Ok(());
    }
    engine.notify(EventClass::List, "linsert", argv[1].as_ref(), db);
    engine.client_mut(id).add_reply_int(new_len as i64);
    Ok(())
}

pub fn lrange(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("lrange"));
    }
    let mut start = parse_int(&argv[2])?;
    let mut stop = parse_int(&argv[3])?;
    let db = engine.client(id).db;
    let out = match engine.lookup_read(db, argv[1].as_ref()) {
        None => Vec::new(),
        Some(Object::List(list)) => {
            let len = list.len() as i64;
            if start < 0 {
                start += len;
            }
            if stop < 0 {
                stop += len;
            }
            if start < 0 {
                start = 0;
            }
            if start > stop || start >= len {
                Vec::new()
            } else {
                if stop >= len {
                    stop = len - 1;
                }
                let span = (stop - start + 1) as usize;
                list.iter_from(start, Direction::TowardTail)
                    .take(span)
                    .map(|entry| Reply::Bulk(entry.to_bytes()))
                    .collect()
            }
        }
        Some(_) => return Err(CommandError::WrongType),
    };
    engine.client_mut(id).add_reply(Reply::Array(out));
    Ok(())
}

pub fn ltrim(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("ltrim"));
    }
    let mut start = parse_int(&argv[2])?;
    let mut stop = parse_int(&argv[3])?;
    let db = engine.client(id).db;
    match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            engine.client_mut(id).add_reply(Reply::ok());
            return Ok(());
        }
        Some(Object::List(list)) => {
            let len = list.len() as i64;
            if start < 0 {
                start += len;
            }
            if stop < 0 {
                stop += len;
            }
            if start < 0 {
                start = 0;
            }
            let (left, right) = if start > stop || start >= len {
                // Everything goes.
                (len, 0)
            } else {
                if stop >= len {
                    stop = len - 1;
                }
                (start, len - stop - 1)
            };
            list.del_range(0, left);
            list.del_range(-right, right);
        }
        Some(_) => return Err(CommandError::WrongType),
    }

    engine.notify(EventClass::List, "ltrim", argv[1].as_ref(), db);
    let drained = matches!(
        engine.dbs[db].dict.get(argv[1].as_ref()),
        Some(Object::List(list)) if list.is_empty()
    );
    if drained {
        engine.dbs[db].delete(argv[1].as_ref());
        engine.notify(EventClass::Generic, "del", argv[1].as_ref(), db);
    }
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

/// Handles LREM: `LREM key count element`. Positive counts walk from
/// the head, negative from the tail, zero removes every match.
pub fn lrem(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("lrem"));
    }
    let requested = parse_int(&argv[2])?;
    let db = engine.client(id).db;

    let (start, direction, to_remove) = if requested < 0 {
        (-1, Direction::TowardHead, -requested)
    } else {
        (0, Direction::TowardTail, requested)
    };

    let removed = match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            engine.client_mut(id).add_reply_int(0);
            return Ok(());
        }
        Some(Object::List(list)) => {
            let mut removed = 0;
            let mut cursor = list.cursor_from(start, direction);
            while let Some(entry) = cursor.next() {
                if entry.matches(argv[3].as_ref()) {
                    cursor.delete();
                    removed += 1;
                    if to_remove != 0 && removed == to_remove {
                        break;
                    }
                }
            }
            removed
        }
        Some(_) => return Err(CommandError::WrongType),
    };

    if removed > 0 {
        engine.notify(EventClass::Generic, "lrem", argv[1].as_ref(), db);
    }
    let drained = matches!(
        engine.dbs[db].dict.get(argv[1].as_ref()),
        Some(Object::List(list)) if list.is_empty()
    );
    if drained {
        engine.dbs[db].delete(argv[1].as_ref());
        engine.notify(EventClass::Generic, "del", argv[1].as_ref(), db);
    }
    engine.client_mut(id).add_reply_int(removed);
    Ok(())
}

pub fn rpoplpush(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("rpoplpush"));
    }
    let db = engine.client(id).db;
    match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            engine.client_mut(id).add_reply_nil();
            Ok(())
        }
        Some(Object::List(list)) => {
            if list.is_empty() {
                engine.client_mut(id).add_reply_nil();
                return Ok(());
            }
            tail_to_head_move(engine, id, db, &argv[1], &argv[2])
        }
        Some(_) => Err(CommandError::WrongType),
    }
}

/// The RPOPLPUSH body shared with the blocking variant: pop the source
/// tail, push the destination head, delete the source when it drains.
/// The destination type is checked before anything is popped.
fn tail_to_head_move(
    engine: &mut Engine,
    id: ClientId,
    db: usize,
    source: &Bytes,
    destination: &Bytes,
) -> Result<(), CommandError> {
    engine.expire_if_needed(db, destination.as_ref());
    let destination_wrong = matches!(
        engine.dbs[db].dict.get(destination.as_ref()),
        Some(existing) if !matches!(existing, Object::List(_))
    );
    if destination_wrong {
        return Err(CommandError::WrongType);
    }

    let value = {
        let Some(Object::List(list)) = engine.dbs[db].dict.get_mut(source.as_ref()) else {
            unreachable!("source checked by caller")
        };
        list.pop(ListEnd::Tail).expect("source list is not empty")
    };

    if engine.dbs[db].dict.get(destination.as_ref()).is_none() {
        let list = new_list(engine);
        engine.dbs[db].add(destination.clone(), Object::List(list));
    }
    if let Some(Object::List(list)) = engine.dbs[db].dict.get_mut(destination.as_ref()) {
        list.push(ListEnd::Head, value.clone());
    }
    engine.notify(EventClass::List, "lpush", destination.as_ref(), db);
    engine.signal_list_as_ready(db, destination);

    engine.notify(EventClass::List, "rpop", source.as_ref(), db);
    let drained = matches!(
        engine.dbs[db].dict.get(source.as_ref()),
        Some(Object::List(list)) if list.is_empty()
    );
    if drained {
        engine.dbs[db].delete(source.as_ref());
        engine.notify(EventClass::Generic, "del", source.as_ref(), db);
    }
    engine.client_mut(id).add_reply_bulk(value.to_bytes());
    Ok(())
}

pub fn blpop(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    blocking_pop_generic(engine, id, argv, ListEnd::Head, "blpop")
}

pub fn brpop(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    blocking_pop_generic(engine, id, argv, ListEnd::Tail, "brpop")
}

/// Shared BLPOP/BRPOP body.
///
/// The first listed key holding a non-empty list is popped right away,
/// in which case this is an ordinary pop and is propagated as one.
/// Otherwise the client parks on all the keys. Inside MULTI blocking is
/// impossible, so an empty result is returned immediately.
///
/// # Arguments
///
/// * `argv` - `[name, key, key..., timeout]`, timeout in (possibly
///   fractional) seconds with 0 meaning forever
/// * `end` - which end of the first ready list to pop
///
/// # Returns
///
/// * `Ok(())` - either a `[key, value]` array was queued, a null array
///   was queued (MULTI), or the client is now blocked with no reply
/// * `Err(CommandError::WrongType)` - one of the keys holds a non-list
fn blocking_pop_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    end: ListEnd,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() < 3 {
        return Err(CommandError::WrongArity(name));
    }
    let timeout_ms = parse_timeout_ms(&argv[argv.len() - 1])?;
    let keys = &argv[1..argv.len() - 1];
    let db = engine.client(id).db;

    for key in keys {
        engine.expire_if_needed(db, key.as_ref());
        let popped = match engine.dbs[db].dict.get_mut(key.as_ref()) {
            None => None,
            Some(Object::List(list)) => list.pop(end),
            Some(_) => return Err(CommandError::WrongType),
        };
        let Some(value) = popped else {
            continue;
        };

        let (event, pop_name) = match end {
            ListEnd::Head => ("lpop", Bytes::from_static(b"LPOP")),
            ListEnd::Tail => ("rpop", Bytes::from_static(b"RPOP")),
        };
        engine.notify(EventClass::List, event, key.as_ref(), db);
        let drained = matches!(
            engine.dbs[db].dict.get(key.as_ref()),
            Some(Object::List(list)) if list.is_empty()
        );
        if drained {
            engine.dbs[db].delete(key.as_ref());
            engine.notify(EventClass::Generic, "del", key.as_ref(), db);
        }
        // Replicates as the plain pop it effectively was.
        engine.propagate(db, &[pop_name, key.clone()]);
        engine.client_mut(id).add_reply(Reply::Array(vec![
            Reply::Bulk(key.clone()),
            Reply::Bulk(value.to_bytes()),
        ]));
        return Ok(());
    }

    if engine.client(id).in_multi {
        engine.client_mut(id).add_reply(Reply::NilArray);
        return Ok(());
    }
    engine.block_for_keys(id, keys, timeout_ms, None, end);
    Ok(())
}

/// Handles BRPOPLPUSH: `source destination timeout`. Falls back to the
/// plain move when the source has elements; parks with the destination
/// recorded as the move target otherwise.
pub fn brpoplpush(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("brpoplpush"));
    }
    let timeout_ms = parse_timeout_ms(&argv[3])?;
    let db = engine.client(id).db;
    engine.expire_if_needed(db, argv[1].as_ref());
    match engine.dbs[db].dict.get(argv[1].as_ref()) {
        None => {
            if engine.client(id).in_multi {
                engine.client_mut(id).add_reply_nil();
                return Ok(());
            }
            let keys = [argv[1].clone()];
            engine.block_for_keys(id, &keys, timeout_ms, Some(argv[2].clone()), ListEnd::Tail);
            Ok(())
        }
        Some(Object::List(_)) => tail_to_head_move(engine, id, db, &argv[1], &argv[2]),
        Some(_) => Err(CommandError::WrongType),
    }
}
