//! Hash commands.

use bytes::Bytes;

use crate::client::{ClientId, Reply};
use crate::commands::{parse_cursor, parse_float, parse_int, CommandError};
use crate::engine::{Engine, EventClass};
use crate::hash_value::{HashLimits, HashValue};
use crate::object::Object;

fn limits(engine: &Engine) -> HashLimits {
    HashLimits {
        max_small_entries: engine.config.hash_max_small_entries,
        max_small_value: engine.config.hash_max_small_value,
    }
}

/// Fetches the hash stored at `key`, creating an empty one when the key
/// is missing.
fn write_or_create<'a>(
    engine: &'a mut Engine,
    db: usize,
    key: &Bytes,
) -> Result<&'a mut HashValue, CommandError> {
    engine.expire_if_needed(db, key.as_ref());
    let keyspace = &mut engine.dbs[db];
    if keyspace.dict.get(key.as_ref()).is_none() {
        keyspace.add(key.clone(), Object::Hash(HashValue::new()));
    }
    match keyspace.dict.get_mut(key.as_ref()) {
        Some(Object::Hash(hash)) => Ok(hash),
        Some(_) => Err(CommandError::WrongType),
        None => unreachable!("hash was just created"),
    }
}

/// Handles HSET (and the legacy HMSET spelling): `HSET key field value
/// [field value ...]`. Replies with the number of fields created.
pub fn hset(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 4 || argv.len() % 2 != 0 {
        return Err(CommandError::WrongArity("hset"));
    }
    let db = engine.client(id).db;
    let limits = limits(engine);
    let mut created = 0;
    {
        let hash = write_or_create(engine, db, &argv[1])?;
        for pair in argv[2..].chunks_exact(2) {
            if !hash.set(pair[0].clone(), pair[1].clone(), &limits) {
                created += 1;
            }
        }
    }
    engine.notify(EventClass::Hash, "hset", argv[1].as_ref(), db);
    engine.client_mut(id).add_reply_int(created);
    Ok(())
}

pub fn hsetnx(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("hsetnx"));
    }
    let db = engine.client(id).db;
    let limits = limits(engine);
    let created = {
        let hash = write_or_create(engine, db, &argv[1])?;
        if hash.exists(argv[2].as_ref()) {
            false
        } else {
            hash.set(argv[2].clone(), argv[3].clone(), &limits);
            true
        }
    };
    if created {
        engine.notify(EventClass::Hash, "hset", argv[1].as_ref(), db);
    }
    engine.client_mut(id).add_reply_int(created as i64);
    Ok(())
}

pub fn hget(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("hget"));
    }
    let db = engine.client(id).db;
    let value = match engine.lookup_write(db, argv[1].as_ref()) {
        None => None,
        Some(Object::Hash(hash)) => hash.get(argv[2].as_ref()).cloned(),
        Some(_) => return Err(CommandError::WrongType),
    };
    match value {
        Some(value) => engine.client_mut(id).add_reply_bulk(value),
        None => engine.client_mut(id).add_reply_nil(),
    }
    Ok(())
}

/// Missing keys behave as empty hashes: a series of nulls comes back.
pub fn hmget(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 3 {
        return Err(CommandError::WrongArity("hmget"));
    }
    let db = engine.client(id).db;
    let mut out = Vec::with_capacity(argv.len() - 2);
    match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            for _ in &argv[2..] {
                out.push(Reply::Nil);
            }
        }
        Some(Object::Hash(hash)) => {
            for field in &argv[2..] {
                match hash.get(field.as_ref()) {
                    Some(value) => out.push(Reply::Bulk(value.clone())),
                    None => out.push(Reply::Nil),
                }
            }
        }
        Some(_) => return Err(CommandError::WrongType),
    }
    engine.client_mut(id).add_reply(Reply::Array(out));
    Ok(())
}

pub fn hdel(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() < 3 {
        return Err(CommandError::WrongArity("hdel"));
    }
    let db = engine.client(id).db;
    let mut deleted = 0;
    let mut key_removed = false;
    match engine.lookup_write(db, argv[1].as_ref()) {
        None => {
            engine.client_mut(id).add_reply_int(0);
            return Ok(());
        }
        Some(Object::Hash(hash)) => {
            for field in &argv[2..] {
                if hash.delete(field.as_ref()) {
                    deleted += 1;
                    if hash.is_empty() {
                        key_removed = true;
                        break;
                    }
                }
            }
        }
        Some(_) => return Err(CommandError::WrongType),
    }
    if key_removed {
        engine.dbs[db].delete(argv[1].as_ref());
    }
    if deleted > 0 {
        engine.notify(EventClass::Hash, "hdel", argv[1].as_ref(), db);
        if key_removed {
            engine.notify(EventClass::Generic, "del", argv[1].as_ref(), db);
        }
    }
    engine.client_mut(id).add_reply_int(deleted);
    Ok(())
}

pub fn hlen(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("hlen"));
    }
    let db = engine.client(id).db;
    let len = match engine.lookup_read(db, argv[1].as_ref()) {
        None => 0,
        Some(Object::Hash(hash)) => hash.len() as i64,
        Some(_) => return Err(CommandError::WrongType),
    };
    engine.client_mut(id).add_reply_int(len);
    Ok(())
}

pub fn hstrlen(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("hstrlen"));
    }
    let db = engine.client(id).db;
    let len = match engine.lookup_write(db, argv[1].as_ref()) {
        None => 0,
        Some(Object::Hash(hash)) => hash.value_len(argv[2].as_ref()) as i64,
        Some(_) => return Err(CommandError::WrongType),
    };
    engine.client_mut(id).add_reply_int(len);
    Ok(())
}

pub fn hexists(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("hexists"));
    }
    let db = engine.client(id).db;
    let exists = match engine.lookup_write(db, argv[1].as_ref()) {
        None => false,
        Some(Object::Hash(hash)) => hash.exists(argv[2].as_ref()),
        Some(_) => return Err(CommandError::WrongType),
    };
    engine.client_mut(id).add_reply_int(exists as i64);
    Ok(())
}

pub fn hgetall(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    hgetall_generic(engine, id, argv, true, true, "hgetall")
}

pub fn hkeys(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    hgetall_generic(engine, id, argv, true, false, "hkeys")
}

pub fn hvals(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    hgetall_generic(engine, id, argv, false, true, "hvals")
}

fn hgetall_generic(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    want_fields: bool,
    want_values: bool,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity(name));
    }
    let db = engine.client(id).db;
    let mut out = Vec::new();
    match engine.lookup_read(db, argv[1].as_ref()) {
        None => {}
        Some(Object::Hash(hash)) => {
            for (field, value) in hash.iter() {
                if want_fields {
                    out.push(Reply::Bulk(field.clone()));
                }
                if want_values {
                    out.push(Reply::Bulk(value.clone()));
                }
            }
        }
        Some(_) => return Err(CommandError::WrongType),
    }
    engine.client_mut(id).add_reply(Reply::Array(out));
    Ok(())
}

pub fn hincrby(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("hincrby"));
    }
    let increment = parse_int(&argv[3])?;
    let db = engine.client(id).db;
    let limits = limits(engine);
    let next = {
        let hash = write_or_create(engine, db, &argv[1])?;
        let current = match hash.get(argv[2].as_ref()) {
            Some(raw) => parse_int(raw).map_err(|_| CommandError::HashValueNotInteger)?,
            None => 0,
        };
        let next = current
            .checked_add(increment)
            .ok_or(CommandError::Overflow)?;
        hash.set(argv[2].clone(), Bytes::from(next.to_string()), &limits);
        next
    };
    engine.notify(EventClass::Hash, "hincrby", argv[1].as_ref(), db);
    engine.client_mut(id).add_reply_int(next);
    Ok(())
}

/// Handles HINCRBYFLOAT. The effective update is reported through the
/// propagation hook as an HSET of the final value, so a replay cannot
/// drift on float formatting.
pub fn hincrbyfloat(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("hincrbyfloat"));
    }
    let increment = parse_float(&argv[3])?;
    let db = engine.client(id).db;
    let limits = limits(engine);
    let formatted = {
        let hash = write_or_create(engine, db, &argv[1])?;
        let current = match hash.get(argv[2].as_ref()) {
            Some(raw) => parse_float(raw).map_err(|_| CommandError::HashValueNotFloat)?,
            None => 0.0,
        };
        let next = current + increment;
        if !next.is_finite() {
            return Err(CommandError::NanOrInfinity);
        }
        let formatted = format_float(next);
        hash.set(
            argv[2].clone(),
            Bytes::from(formatted.clone()),
            &limits,
        );
        formatted
    };
    engine.notify(EventClass::Hash, "hincrbyfloat", argv[1].as_ref(), db);
    engine.propagate(
        db,
        &[
            Bytes::from_static(b"HSET"),
            argv[1].clone(),
            argv[2].clone(),
            Bytes::from(formatted.clone()),
        ],
    );
    engine.client_mut(id).add_reply_bulk(Bytes::from(formatted));
    Ok(())
}

/// Human-friendly float form: the shortest decimal that round-trips,
/// with no trailing ".0" on whole numbers.
fn format_float(value: f64) -> String {
    value.to_string()
}

/// Handles HSCAN: `HSCAN key cursor [COUNT n]`. The compact encoding is
/// returned whole in one call.
pub fn hscan(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 && argv.len() != 5 {
        return Err(CommandError::WrongArity("hscan"));
    }
    let mut cursor = parse_cursor(&argv[2])?;
    let mut count = 10usize;
    if argv.len() == 5 {
        if !argv[3].eq_ignore_ascii_case(b"COUNT") {
            return Err(CommandError::Syntax);
        }
        let requested = parse_int(&argv[4])?;
        if requested < 1 {
            return Err(CommandError::Syntax);
        }
        count = requested as usize;
    }

    let db = engine.client(id).db;
    let mut items: Vec<Reply> = Vec::new();
    match engine.lookup_read(db, argv[1].as_ref()) {
        None => cursor = 0,
        Some(Object::Hash(hash)) => {
            let mut iterations = count * 10;
            loop {
                cursor = hash.scan(cursor, |field, value| {
                    items.push(Reply::Bulk(field.clone()));
                    items.push(Reply::Bulk(value.clone()));
                });
                iterations -= 1;
                if cursor == 0 || items.len() / 2 >= count || iterations == 0 {
                    break;
                }
            }
        }
        Some(_) => return Err(CommandError::WrongType),
    }

    engine.client_mut(id).add_reply(Reply::Array(vec![
        Reply::Bulk(Bytes::from(cursor.to_string())),
        Reply::Array(items),
    ]));
    Ok(())
}
