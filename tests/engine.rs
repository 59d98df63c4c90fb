//! End-to-end scenarios run through the command layer.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rudis_core::logger::null_logger;
use rudis_core::{Config, Engine, LazyFree, Reply};

fn engine() -> Engine {
    engine_with(Config::default())
}

fn engine_with(config: Config) -> Engine {
    Engine::new(config, LazyFree::spawn(null_logger()), null_logger())
}

fn argv(parts: &[&str]) -> Vec<Bytes> {
    parts
        .iter()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect()
}

fn run(engine: &mut Engine, client: u64, parts: &[&str]) -> Vec<Reply> {
    engine.execute(client, &argv(parts));
    engine.take_replies(client)
}

fn bulk(text: &str) -> Reply {
    Reply::Bulk(Bytes::copy_from_slice(text.as_bytes()))
}

fn wait_for_reclaimer(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.lazyfree_pending() != 0 {
        assert!(Instant::now() < deadline, "reclaimer did not drain");
        std::thread::yield_now();
    }
}

#[test]
fn test_set_get_del_round_trip() {
    let mut engine = engine();
    let client = engine.new_client();

    assert_eq!(run(&mut engine, client, &["SET", "a", "1"]), vec![Reply::ok()]);
    assert_eq!(run(&mut engine, client, &["GET", "a"]), vec![bulk("1")]);
    assert_eq!(run(&mut engine, client, &["DEL", "a"]), vec![Reply::Int(1)]);
    assert_eq!(run(&mut engine, client, &["GET", "a"]), vec![Reply::Nil]);
}

#[test]
fn test_hash_commands_and_promotion() {
    let mut config = Config::default();
    config.hash_max_small_entries = 64;
    let mut engine = engine_with(config);
    let client = engine.new_client();

    assert_eq!(
        run(&mut engine, client, &["HSET", "h", "f1", "v1", "f2", "v2"]),
        vec![Reply::Int(2)]
    );
    assert_eq!(run(&mut engine, client, &["HGET", "h", "f1"]), vec![bulk("v1")]);
    assert_eq!(run(&mut engine, client, &["HLEN", "h"]), vec![Reply::Int(2)]);
    assert_eq!(
        run(&mut engine, client, &["OBJECT", "ENCODING", "h"]),
        vec![bulk("compact")]
    );

    // A value longer than the small-value limit forces the map form.
    let long_value = "x".repeat(100);
    assert_eq!(
        run(&mut engine, client, &["HSET", "h", "big", &long_value]),
        vec![Reply::Int(1)]
    );
    assert_eq!(
        run(&mut engine, client, &["OBJECT", "ENCODING", "h"]),
        vec![bulk("hashtable")]
    );
    assert_eq!(run(&mut engine, client, &["HGET", "h", "f2"]), vec![bulk("v2")]);
    assert_eq!(
        run(&mut engine, client, &["HGET", "h", "big"]),
        vec![bulk(&long_value)]
    );
    assert_eq!(run(&mut engine, client, &["HLEN", "h"]), vec![Reply::Int(3)]);
}

#[test]
fn test_list_push_range_and_removal() {
    let mut engine = engine();
    let client = engine.new_client();

    assert_eq!(
        run(&mut engine, client, &["RPUSH", "L", "a", "b", "c"]),
        vec![Reply::Int(3)]
    );
    assert_eq!(
        run(&mut engine, client, &["LRANGE", "L", "0", "-1"]),
        vec![Reply::Array(vec![bulk("a"), bulk("b"), bulk("c")])]
    );
    assert_eq!(
        run(&mut engine, client, &["LREM", "L", "1", "b"]),
        vec![Reply::Int(1)]
    );
    assert_eq!(
        run(&mut engine, client, &["LRANGE", "L", "0", "-1"]),
        vec![Reply::Array(vec![bulk("a"), bulk("c")])]
    );
}

#[test]
fn test_blpop_wakes_on_push_and_key_vanishes() {
    let mut engine = engine();
    let blocked = engine.new_client();
    let pusher = engine.new_client();

    assert!(run(&mut engine, blocked, &["BLPOP", "K", "0"]).is_empty());
    assert!(engine.client(blocked).blocked);

    assert_eq!(run(&mut engine, pusher, &["RPUSH", "K", "v"]), vec![Reply::Int(1)]);

    // The wakeup happened at the push command's completion.
    assert!(!engine.client(blocked).blocked);
    assert_eq!(
        engine.take_replies(blocked),
        vec![Reply::Array(vec![bulk("K"), bulk("v")])]
    );
    assert_eq!(run(&mut engine, pusher, &["EXISTS", "K"]), vec![Reply::Int(0)]);
}

#[test]
fn test_blocked_waiters_fifo_partial_service() {
    let mut engine = engine();
    let clients: Vec<u64> = (0..4).map(|_| engine.new_client()).collect();
    let pusher = engine.new_client();

    for &client in &clients {
        assert!(run(&mut engine, client, &["BLPOP", "q", "0"]).is_empty());
    }
    // Two values serve exactly the first two waiters in block order.
    run(&mut engine, pusher, &["RPUSH", "q", "v1", "v2"]);

    assert_eq!(
        engine.take_replies(clients[0]),
        vec![Reply::Array(vec![bulk("q"), bulk("v1")])]
    );
    assert_eq!(
        engine.take_replies(clients[1]),
        vec![Reply::Array(vec![bulk("q"), bulk("v2")])]
    );
    assert!(engine.client(clients[2]).blocked);
    assert!(engine.client(clients[3]).blocked);
}

#[test]
fn test_brpop_takes_from_tail() {
    let mut engine = engine();
    let blocked = engine.new_client();
    let pusher = engine.new_client();

    assert!(run(&mut engine, blocked, &["BRPOP", "K", "0"]).is_empty());
    run(&mut engine, pusher, &["RPUSH", "K", "first", "last"]);
    assert_eq!(
        engine.take_replies(blocked),
        vec![Reply::Array(vec![bulk("K"), bulk("last")])]
    );
}

#[test]
fn test_brpoplpush_chain_wakes_next_waiter() {
    let mut engine = engine();
    let mover = engine.new_client();
    let sink = engine.new_client();
    let pusher = engine.new_client();

    // mover waits on "a" and will forward into "b"; sink waits on "b".
    assert!(run(&mut engine, mover, &["BRPOPLPUSH", "a", "b", "0"]).is_empty());
    assert!(run(&mut engine, sink, &["BLPOP", "b", "0"]).is_empty());

    // One push into "a" must flow through both blocked clients.
    run(&mut engine, pusher, &["RPUSH", "a", "v"]);

    assert_eq!(engine.take_replies(mover), vec![bulk("v")]);
    assert_eq!(
        engine.take_replies(sink),
        vec![Reply::Array(vec![bulk("b"), bulk("v")])]
    );
    assert_eq!(run(&mut engine, pusher, &["EXISTS", "a", "b"]), vec![Reply::Int(0)]);
}

#[test]
fn test_blpop_inside_multi_never_blocks() {
    let mut engine = engine();
    let client = engine.new_client();
    engine.client_mut(client).in_multi = true;
    assert_eq!(
        run(&mut engine, client, &["BLPOP", "nothing", "0"]),
        vec![Reply::NilArray]
    );
    assert!(!engine.client(client).blocked);
}

#[test]
fn test_blpop_timeout_sweep() {
    let mut engine = engine();
    let client = engine.new_client();
    assert!(run(&mut engine, client, &["BLPOP", "K", "0.05"]).is_empty());
    assert!(engine.client(client).blocked);

    std::thread::sleep(Duration::from_millis(80));
    engine.cron();
    assert!(!engine.client(client).blocked);
    assert_eq!(engine.take_replies(client), vec![Reply::NilArray]);
}

#[test]
fn test_scan_covers_large_keyspace() {
    let mut engine = engine();
    let client = engine.new_client();

    let total = 50_000;
    for i in 0..total {
        let key = format!("key:{i}");
        engine.execute(client, &argv(&["SET", &key, "v"]));
    }
    engine.take_replies(client);

    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor = "0".to_string();
    loop {
        let replies = run(&mut engine, client, &["SCAN", &cursor, "COUNT", "10"]);
        let [Reply::Array(outer)] = &replies[..] else {
            panic!("unexpected SCAN reply {replies:?}");
        };
        let [Reply::Bulk(next), Reply::Array(keys)] = &outer[..] else {
            panic!("unexpected SCAN reply shape");
        };
        for key in keys {
            let Reply::Bulk(raw) = key else {
                panic!("non-bulk key");
            };
            seen.insert(String::from_utf8_lossy(raw).into_owned());
        }
        cursor = String::from_utf8_lossy(next).into_owned();
        if cursor == "0" {
            break;
        }
    }
    assert_eq!(seen.len(), total);
    for i in 0..total {
        assert!(seen.contains(&format!("key:{i}")));
    }
}

#[test]
fn test_unlink_of_big_hash_returns_immediately_and_drains() {
    let mut engine = engine();
    let client = engine.new_client();

    let mut parts: Vec<String> = vec!["HSET".to_string(), "big_hash".to_string()];
    for i in 0..10_000 {
        parts.push(format!("f{i}"));
        parts.push("v".to_string());
    }
    let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    assert_eq!(
        run(&mut engine, client, &part_refs),
        vec![Reply::Int(10_000)]
    );

    assert_eq!(
        run(&mut engine, client, &["UNLINK", "big_hash"]),
        vec![Reply::Int(1)]
    );
    assert_eq!(
        run(&mut engine, client, &["EXISTS", "big_hash"]),
        vec![Reply::Int(0)]
    );
    wait_for_reclaimer(&engine);
}

#[test]
fn test_expiry_is_lazy_and_ttl_reports() {
    let mut engine = engine();
    let client = engine.new_client();

    run(&mut engine, client, &["SET", "gone", "v", "PX", "40"]);
    run(&mut engine, client, &["SET", "kept", "v"]);

    let ttl = run(&mut engine, client, &["PTTL", "gone"]);
    assert!(matches!(&ttl[..], [Reply::Int(ms)] if *ms > 0 && *ms <= 40));
    assert_eq!(run(&mut engine, client, &["TTL", "kept"]), vec![Reply::Int(-1)]);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(run(&mut engine, client, &["GET", "gone"]), vec![Reply::Nil]);
    assert_eq!(run(&mut engine, client, &["TTL", "gone"]), vec![Reply::Int(-2)]);
    assert_eq!(run(&mut engine, client, &["GET", "kept"]), vec![bulk("v")]);
}

#[test]
fn test_expire_in_the_past_deletes() {
    let mut engine = engine();
    let client = engine.new_client();
    run(&mut engine, client, &["SET", "k", "v"]);
    assert_eq!(
        run(&mut engine, client, &["PEXPIRE", "k", "-1"]),
        vec![Reply::Int(1)]
    );
    assert_eq!(run(&mut engine, client, &["EXISTS", "k"]), vec![Reply::Int(0)]);
}

#[test]
fn test_wrong_type_replies() {
    let mut engine = engine();
    let client = engine.new_client();
    run(&mut engine, client, &["SET", "s", "v"]);

    for wrong in [
        &["LPUSH", "s", "x"][..],
        &["HGET", "s", "f"],
        &["LLEN", "s"],
        &["HSET", "s", "f", "v"],
        &["BLPOP", "s", "0"],
    ] {
        let replies = run(&mut engine, client, wrong);
        assert!(
            matches!(&replies[..], [Reply::Error(text)] if text.starts_with("WRONGTYPE")),
            "{wrong:?} -> {replies:?}"
        );
    }
}

#[test]
fn test_incr_and_overflow() {
    let mut engine = engine();
    let client = engine.new_client();

    assert_eq!(run(&mut engine, client, &["INCR", "n"]), vec![Reply::Int(1)]);
    assert_eq!(run(&mut engine, client, &["INCR", "n"]), vec![Reply::Int(2)]);
    assert_eq!(run(&mut engine, client, &["DECR", "n"]), vec![Reply::Int(1)]);

    run(&mut engine, client, &["SET", "n", &i64::MAX.to_string()]);
    let replies = run(&mut engine, client, &["INCR", "n"]);
    assert!(matches!(&replies[..], [Reply::Error(text)] if text.contains("overflow")));
}

#[test]
fn test_hincrby_and_float_variants() {
    let mut engine = engine();
    let client = engine.new_client();

    assert_eq!(
        run(&mut engine, client, &["HINCRBY", "h", "n", "5"]),
        vec![Reply::Int(5)]
    );
    assert_eq!(
        run(&mut engine, client, &["HINCRBY", "h", "n", "-2"]),
        vec![Reply::Int(3)]
    );
    assert_eq!(
        run(&mut engine, client, &["HINCRBYFLOAT", "h", "f", "10.5"]),
        vec![bulk("10.5")]
    );
    assert_eq!(
        run(&mut engine, client, &["HINCRBYFLOAT", "h", "f", "0.1"]),
        vec![bulk("10.6")]
    );
    let replies = run(&mut engine, client, &["HINCRBY", "h", "f", "1"]);
    assert!(matches!(&replies[..], [Reply::Error(text)] if text.contains("not an integer")));
}

#[test]
fn test_list_editing_commands() {
    let mut engine = engine();
    let client = engine.new_client();

    run(&mut engine, client, &["RPUSH", "L", "a", "c"]);
    assert_eq!(
        run(&mut engine, client, &["LINSERT", "L", "BEFORE", "c", "b"]),
        vec![Reply::Int(3)]
    );
    assert_eq!(
        run(&mut engine, client, &["LINSERT", "L", "AFTER", "zzz", "x"]),
        vec![Reply::Int(-1)]
    );
    assert_eq!(run(&mut engine, client, &["LSET", "L", "0", "A"]), vec![Reply::ok()]);
    let replies = run(&mut engine, client, &["LSET", "L", "9", "no"]);
    assert!(matches!(&replies[..], [Reply::Error(text)] if text.contains("out of range")));

    assert_eq!(
        run(&mut engine, client, &["LINDEX", "L", "-1"]),
        vec![bulk("c")]
    );
    assert_eq!(run(&mut engine, client, &["LTRIM", "L", "1", "-1"]), vec![Reply::ok()]);
    assert_eq!(
        run(&mut engine, client, &["LRANGE", "L", "0", "-1"]),
        vec![Reply::Array(vec![bulk("b"), bulk("c")])]
    );

    assert_eq!(
        run(&mut engine, client, &["RPOPLPUSH", "L", "L2"]),
        vec![bulk("c")]
    );
    assert_eq!(
        run(&mut engine, client, &["LRANGE", "L2", "0", "-1"]),
        vec![Reply::Array(vec![bulk("c")])]
    );
}

#[test]
fn test_rename_and_select() {
    let mut engine = engine();
    let client = engine.new_client();

    run(&mut engine, client, &["SET", "a", "v"]);
    assert_eq!(run(&mut engine, client, &["RENAME", "a", "b"]), vec![Reply::ok()]);
    assert_eq!(run(&mut engine, client, &["GET", "b"]), vec![bulk("v")]);
    let replies = run(&mut engine, client, &["RENAME", "missing", "x"]);
    assert!(matches!(&replies[..], [Reply::Error(text)] if text.contains("no such key")));

    assert_eq!(run(&mut engine, client, &["SELECT", "1"]), vec![Reply::ok()]);
    assert_eq!(run(&mut engine, client, &["GET", "b"]), vec![Reply::Nil]);
    assert_eq!(run(&mut engine, client, &["SELECT", "0"]), vec![Reply::ok()]);
    assert_eq!(run(&mut engine, client, &["GET", "b"]), vec![bulk("v")]);
}

#[test]
fn test_flushdb_async_empties_keyspace() {
    let mut engine = engine();
    let client = engine.new_client();
    for i in 0..500 {
        let key = format!("k{i}");
        engine.execute(client, &argv(&["SET", &key, "v"]));
    }
    engine.take_replies(client);

    assert_eq!(run(&mut engine, client, &["FLUSHDB", "ASYNC"]), vec![Reply::ok()]);
    assert_eq!(run(&mut engine, client, &["DBSIZE"]), vec![Reply::Int(0)]);
    wait_for_reclaimer(&engine);
}

#[test]
fn test_hscan_returns_all_fields() {
    let mut engine = engine();
    let client = engine.new_client();
    for i in 0..300 {
        let field = format!("f{i}");
        engine.execute(client, &argv(&["HSET", "h", &field, "v"]));
    }
    engine.take_replies(client);

    let mut seen = HashSet::new();
    let mut cursor = "0".to_string();
    loop {
        let replies = run(&mut engine, client, &["HSCAN", "h", &cursor, "COUNT", "10"]);
        let [Reply::Array(outer)] = &replies[..] else {
            panic!("unexpected HSCAN reply");
        };
        let [Reply::Bulk(next), Reply::Array(items)] = &outer[..] else {
            panic!("unexpected HSCAN shape");
        };
        for pair in items.chunks_exact(2) {
            let Reply::Bulk(field) = &pair[0] else {
                panic!("non-bulk field");
            };
            seen.insert(String::from_utf8_lossy(field).into_owned());
        }
        cursor = String::from_utf8_lossy(next).into_owned();
        if cursor == "0" {
            break;
        }
    }
    assert_eq!(seen.len(), 300);
}
