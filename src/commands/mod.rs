//! Command layer: argument handling and dispatch on top of the engine
//! core. Replies are appended to the issuing client's buffer; errors
//! bubble up to the dispatcher, which turns them into error replies.

mod error;
mod generic;
mod hash;
mod list;
mod string;

use bytes::Bytes;

use crate::client::ClientId;
use crate::engine::Engine;

pub use error::CommandError;

pub(crate) fn dispatch(
    engine: &mut Engine,
    id: ClientId,
    argv: &[Bytes],
) -> Result<(), CommandError> {
    let name = argv[0].to_ascii_uppercase();
    match name.as_slice() {
        b"SET" => string::set(engine, id, argv),
        b"GET" => string::get(engine, id, argv),
        b"INCR" => string::incr(engine, id, argv),
        b"DECR" => string::decr(engine, id, argv),
        b"TYPE" => string::type_of(engine, id, argv),

        b"DEL" => generic::del(engine, id, argv),
        b"UNLINK" => generic::unlink(engine, id, argv),
        b"EXISTS" => generic::exists(engine, id, argv),
        b"EXPIRE" => generic::expire(engine, id, argv),
        b"PEXPIRE" => generic::pexpire(engine, id, argv),
        b"TTL" => generic::ttl(engine, id, argv),
        b"PTTL" => generic::pttl(engine, id, argv),
        b"PERSIST" => generic::persist(engine, id, argv),
        b"RENAME" => generic::rename(engine, id, argv),
        b"RANDOMKEY" => generic::randomkey(engine, id, argv),
        b"DBSIZE" => generic::dbsize(engine, id, argv),
        b"SELECT" => generic::select(engine, id, argv),
        b"FLUSHDB" => generic::flushdb(engine, id, argv),
        b"SCAN" => generic::scan(engine, id, argv),
        b"OBJECT" => generic::object(engine, id, argv),

        b"HSET" | b"HMSET" => hash::hset(engine, id, argv),
        b"HSETNX" => hash::hsetnx(engine, id, argv),
        b"HGET" => hash::hget(engine, id, argv),
        b"HMGET" => hash::hmget(engine, id, argv),
        b"HDEL" => hash::hdel(engine, id, argv),
        b"HLEN" => hash::hlen(engine, id, argv),
        b"HSTRLEN" => hash::hstrlen(engine, id, argv),
        b"HEXISTS" => hash::hexists(engine, id, argv),
        b"HGETALL" => hash::hgetall(engine, id, argv),
        b"HKEYS" => hash::hkeys(engine, id, argv),
        b"HVALS" => hash::hvals(engine, id, argv),
        b"HINCRBY" => hash::hincrby(engine, id, argv),
        b"HINCRBYFLOAT" => hash::hincrbyfloat(engine, id, argv),
        b"HSCAN" => hash::hscan(engine, id, argv),

        b"LPUSH" => list::lpush(engine, id, argv),
        b"RPUSH" => list::rpush(engine, id, argv),
        b"LPUSHX" => list::lpushx(engine, id, argv),
        b"RPUSHX" => list::rpushx(engine, id, argv),
        b"LPOP" => list::lpop(engine, id, argv),
        b"RPOP" => list::rpop(engine, id, argv),
        b"LLEN" => list::llen(engine, id, argv),
        b"LINDEX" => list::lindex(engine, id, argv),
        b"LSET" => list::lset(engine, id, argv),
        b"LINSERT" => list::linsert(engine, id, argv),
        b"LRANGE" => list::lrange(engine, id, argv),
        b"LTRIM" => list::ltrim(engine, id, argv),
        b"LREM" => list::lrem(engine, id, argv),
        b"RPOPLPUSH" => list::rpoplpush(engine, id, argv),
        b"BLPOP" => list::blpop(engine, id, argv),
        b"BRPOP" => list::brpop(engine, id, argv),
        b"BRPOPLPUSH" => list::brpoplpush(engine, id, argv),

        _ => Err(CommandError::UnknownCommand(
            String::from_utf8_lossy(&argv[0]).into_owned(),
        )),
    }
}

/// Strict decimal parse: the text must round-trip, so "+1", "01",
/// "-0" and surrounding whitespace are all rejected.
pub(crate) fn parse_int(raw: &[u8]) -> Result<i64, CommandError> {
    let text = std::str::from_utf8(raw).map_err(|_| CommandError::NotInteger)?;
    let n: i64 = text.parse().map_err(|_| CommandError::NotInteger)?;
    if n.to_string() != text {
        return Err(CommandError::NotInteger);
    }
    Ok(n)
}

pub(crate) fn parse_float(raw: &[u8]) -> Result<f64, CommandError> {
    let text = std::str::from_utf8(raw).map_err(|_| CommandError::NotFloat)?;
    let value: f64 = text.trim().parse().map_err(|_| CommandError::NotFloat)?;
    if value.is_nan() {
        return Err(CommandError::NotFloat);
    }
    Ok(value)
}

/// Timeout in seconds, possibly fractional; 0 blocks forever.
pub(crate) fn parse_timeout_ms(raw: &[u8]) -> Result<i64, CommandError> {
    let seconds = parse_float(raw).map_err(|_| CommandError::InvalidTimeout)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CommandError::InvalidTimeout);
    }
    Ok((seconds * 1000.0) as i64)
}

pub(crate) fn parse_cursor(raw: &[u8]) -> Result<u64, CommandError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(CommandError::InvalidCursor)
}
