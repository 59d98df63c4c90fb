//! Keyspace commands: deletion, expiry, iteration and housekeeping.

use bytes::Bytes;

use crate::client::{ClientId, Reply};
use crate::commands::{parse_cursor, parse_int, CommandError};
use crate::engine::{Engine, EventClass};
use crate::object::Object;

pub fn del(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 2 {
        return Err(CommandError::WrongArity("del"));
    }
    let db = engine.client(id).db;
    let mut removed = 0;
    for key in &argv[1..] {
        engine.expire_if_needed(db, key.as_ref());
        if engine.dbs[db].delete(key.as_ref()) {
            engine.notify(EventClass::Generic, "del", key.as_ref(), db);
            removed += 1;
        }
    }
    engine.client_mut(id).add_reply_int(removed);
    Ok(())
}

/// DEL that never pays the reclamation cost inline for big values: the
/// unlink happens now, the drop may happen on the reclaimer thread.
pub fn unlink(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 2 {
        return Err(CommandError::WrongArity("unlink"));
    }
    let db = engine.client(id).db;
    let mut removed = 0;
    for key in &argv[1..] {
        engine.expire_if_needed(db, key.as_ref());
        if engine.delete_async(db, key.as_ref()) {
            engine.notify(EventClass::Generic, "del", key.as_ref(), db);
            removed += 1;
        }
    }
    engine.client_mut(id).add_reply_int(removed);
    Ok(())
}

pub fn exists(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 2 {
        return Err(CommandError::WrongArity("exists"));
    }
    let db = engine.client(id).db;
    let mut found = 0;
    for key in &argv[1..] {
        if engine.lookup_read(db, key.as_ref()).is_some() {
            found += 1;
        }
    }
    engine.client_mut(id).add_reply_int(found);
    Ok(())
}

pub fn expire(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    expire_generic(engine, id, argv, 1000, "expire")
}

pub fn pexpire(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    expire_generic(engine, id, argv, 1, "pexpire")
}

/// A deadline in the past deletes the key immediately instead of
/// recording it, and the deletion is what gets propagated.
fn expire_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    unit_ms: i64,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity(name));
    }
    let ttl = parse_int(&argv[2])?;
    let db = engine.client(id).db;
    if engine.lookup_write(db, argv[1].as_ref()).is_none() {
        engine.client_mut(id).add_reply_int(0);
        return Ok(());
    }
    let when = engine.now_ms.saturating_add(ttl.saturating_mul(unit_ms));
    if when <= engine.now_ms {
        engine.dbs[db].delete(argv[1].as_ref());
        engine.propagate(db, &[Bytes::from_static(b"DEL"), argv[1].clone()]);
        engine.notify(EventClass::Generic, "del", argv[1].as_ref(), db);
    } else {
        engine.dbs[db].set_expire(argv[1].clone(), when);
        engine.notify(EventClass::Generic, "expire", argv[1].as_ref(), db);
    }
    engine.client_mut(id).add_reply_int(1);
    Ok(())
}

pub fn ttl(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    ttl_generic(engine, id, argv, true, "ttl")
}

pub fn pttl(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    ttl_generic(engine, id, argv, false, "pttl")
}

fn ttl_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    in_seconds: bool,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity(name));
    }
    let db = engine.client(id).db;
    if engine.lookup_read(db, argv[1].as_ref()).is_none() {
        engine.client_mut(id).add_reply_int(-2);
        return Ok(());
    }
    let reply = match engine.dbs[db].get_expire(argv[1].as_ref()) {
        None => -1,
        Some(when) => {
            let remaining = (when - engine.now_ms).max(0);
            if in_seconds {
                (remaining + 500) / 1000
            } else {
                remaining
            }
        }
    };
    engine.client_mut(id).add_reply_int(reply);
    Ok(())
}

pub fn persist(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("persist"));
    }
    let db = engine.client(id).db;
    let cleared = engine.lookup_read(db, argv[1].as_ref()).is_some()
        && engine.dbs[db].remove_expire(argv[1].as_ref());
    engine.client_mut(id).add_reply_int(cleared as i64);
    Ok(())
}

pub fn rename(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("rename"));
    }
    let db = engine.client(id).db;
    engine.expire_if_needed(db, argv[1].as_ref());
    if !engine.dbs[db].rename(argv[1].as_ref(), argv[2].clone()) {
        return Err(CommandError::NoSuchKey);
    }
    // A list landing on a key with blocked waiters must wake them.
    let moved_list = matches!(
        engine.dbs[db].dict.get(argv[2].as_ref()),
        Some(Object::List(_))
    );
    if moved_list {
        engine.signal_list_as_ready(db, &argv[2]);
    }
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

pub fn randomkey(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 1 {
        return Err(CommandError::WrongArity("randomkey"));
    }
    let db = engine.client(id).db;
    match engine.dbs[db].random_key() {
        Some(key) => engine.client_mut(id).add_reply_bulk(key),
        None => engine.client_mut(id).add_reply_nil(),
    }
    Ok(())
}

pub fn dbsize(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 1 {
        return Err(CommandError::WrongArity("dbsize"));
    }
    let db = engine.client(id).db;
    let len = engine.db_len(db) as i64;
    engine.client_mut(id).add_reply_int(len);
    Ok(())
}

pub fn select(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("select"));
    }
    let index = parse_int(&argv[1])?;
    if index < 0 || index as usize >= engine.db_count() {
        return Err(CommandError::InvalidDbIndex);
    }
    engine.client_mut(id).db = index as usize;
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

pub fn flushdb(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    let asynchronous = match argv.len() {
        1 => false,
        2 if argv[1].eq_ignore_ascii_case(b"ASYNC") => true,
        2 => return Err(CommandError::Syntax),
        _ => return Err(CommandError::WrongArity("flushdb")),
    };
    let db = engine.client(id).db;
    engine.flush_db(db, asynchronous);
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

/// Handles OBJECT ENCODING, reporting which internal representation a
/// value currently uses.
pub fn object(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("object"));
    }
    if !argv[1].eq_ignore_ascii_case(b"ENCODING") {
        return Err(CommandError::Syntax);
    }
    let db = engine.client(id).db;
    let encoding = match engine.lookup_read(db, argv[2].as_ref()) {
        None => return Err(CommandError::NoSuchKey),
        Some(Object::Str(_)) => "raw",
        Some(Object::Hash(hash)) if hash.uses_map() => "hashtable",
        Some(Object::Hash(_)) => "compact",
        Some(Object::List(_)) => "segmented",
    };
    engine
        .client_mut(id)
        .add_reply_bulk(Bytes::from_static(encoding.as_bytes()));
    Ok(())
}

/// Handles SCAN: `SCAN cursor [COUNT n]`.
///
/// Drives the stateless map cursor until roughly COUNT keys are
/// gathered, with a hard bound of ten bucket visits per requested key
/// so a sparse table cannot stall the caller. Keys already past their
/// deadline are filtered from the reply.
pub fn scan(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 && argv.len() != 4 {
        return Err(CommandError::WrongArity("scan"));
    }
    let mut cursor = parse_cursor(&argv[1])?;
    let mut count = 10usize;
    if argv.len() == 4 {
        if !argv[2].eq_ignore_ascii_case(b"COUNT") {
            return Err(CommandError::Syntax);
        }
        let requested = parse_int(&argv[3])?;
        if requested < 1 {
            return Err(CommandError::Syntax);
        }
        count = requested as usize;
    }

    let db = engine.client(id).db;
    let mut keys: Vec<Bytes> = Vec::new();
    let mut iterations = count * 10;
    loop {
        cursor = engine.dbs[db].dict.scan(cursor, |key, _| {
            keys.push(key.clone());
        });
        iterations -= 1;
        if cursor == 0 || keys.len() >= count || iterations == 0 {
            break;
        }
    }

    let now = engine.now_ms;
    let keyspace = &mut engine.dbs[db];
    keys.retain(|key| !keyspace.is_expired(key.as_ref(), now));

    let replies: Vec<Reply> = keys.into_iter().map(Reply::Bulk).collect();
    engine.client_mut(id).add_reply(Reply::Array(vec![
        Reply::Bulk(Bytes::from(cursor.to_string())),
        Reply::Array(replies),
    ]));
    Ok(())
}
