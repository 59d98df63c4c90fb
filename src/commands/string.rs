//! String commands.

use bytes::Bytes;

use crate::client::{ClientId, Reply};
use crate::commands::{parse_int, CommandError};
use crate::engine::{Engine, EventClass};
use crate::object::Object;

/// Handles the SET command.
///
/// Overwrites any existing value regardless of its type and clears a
/// previous expiry, then installs the new one when requested.
///
/// # Arguments
///
/// * `argv` - `[SET, key, value]` or `[SET, key, value, EX|PX, amount]`
///
/// # Returns
///
/// * `Ok(())` - a simple OK was queued on the client
/// * `Err(CommandError::WrongArity)` - wrong argument count
/// * `Err(CommandError::Syntax)` - unknown option or non-positive expiry
/// * `Err(CommandError::NotInteger)` - unparsable expiry amount
pub fn set(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 3 && argv.len() != 5 {
        return Err(CommandError::WrongArity("set"));
    }
    let mut expire_at = None;
    if argv.len() == 5 {
        let unit = argv[3].to_ascii_uppercase();
        let amount = parse_int(&argv[4])?;
        if amount <= 0 {
            return Err(CommandError::Syntax);
        }
        let millis = match unit.as_slice() {
            b"EX" => amount.checked_mul(1000).ok_or(CommandError::NotInteger)?,
            b"PX" => amount,
            _ => return Err(CommandError::Syntax),
        };
        expire_at = Some(engine.now_ms + millis);
    }

    let db = engine.client(id).db;
    let key = argv[1].clone();
    engine.dbs[db].overwrite(key.clone(), Object::Str(argv[2].clone()));
    engine.dbs[db].remove_expire(key.as_ref());
    if let Some(at) = expire_at {
        engine.dbs[db].set_expire(key.clone(), at);
    }
    engine.notify(EventClass::String, "set", key.as_ref(), db);
    engine.client_mut(id).add_reply(Reply::ok());
    Ok(())
}

pub fn get(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("get"));
    }
    let db = engine.client(id).db;
    let value = match engine.lookup_read(db, argv[1].as_ref()) {
        None => None,
        Some(Object::Str(raw)) => Some(raw.clone()),
        Some(_) => return Err(CommandError::WrongType),
    };
    match value {
        Some(raw) => engine.client_mut(id).add_reply_bulk(raw),
        None => engine.client_mut(id).add_reply_nil(),
    }
    Ok(())
}

pub fn incr(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    incr_decr(engine, id, argv, 1, "incr")
}

pub fn decr(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    incr_decr(engine, id, argv, -1, "decr")
}

/// Shared INCR/DECR body. A missing key counts from zero; the existing
/// value must be a canonically encoded integer. Any expiry on the key
/// survives the update.
fn incr_decr(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
    delta: i64,
    name: &'static str,
) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity(name));
    }
    let db = engine.client(id).db;
    let current = match engine.lookup_write(db, argv[1].as_ref()) {
        None => 0,
        Some(Object::Str(raw)) => parse_int(raw)?,
        Some(_) => return Err(CommandError::WrongType),
    };
    let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
    engine.dbs[db].overwrite(argv[1].clone(), Object::Str(Bytes::from(next.to_string())));
    engine.client_mut(id).add_reply_int(next);
    Ok(())
}

pub fn type_of(engine: &mut Engine, id: ClientId, argv: &[Bytes]) -> Result<(), CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("type"));
    }
    let db = engine.client(id).db;
    let name = engine
        .lookup_read(db, argv[1].as_ref())
        .map_or("none", Object::type_name);
    engine
        .client_mut(id)
        .add_reply(Reply::Simple(name.to_string()));
    Ok(())
}
