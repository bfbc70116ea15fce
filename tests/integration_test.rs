//! Black-box tests against the command-execution surface, the wire codec,
//! RDB round-tripping, and replication bookkeeping — driven directly, the
//! same way the teacher crate's own integration tests drive `Command::execute`
//! against a real `Db` rather than opening sockets.

use std::time::Duration;

use bytes::Bytes;
use tempfile::tempdir;

use redwire::core::command::{self, execute, ExecContext};
use redwire::core::persistence::rdb;
use redwire::core::persistence::saver;
use redwire::core::protocol::{decode, encode_to_vec, RespValue};
use redwire::core::replication::offset::{collect_acks, OffsetTracker};
use redwire::core::replication::{Role, ReplicationState};
use redwire::core::store::Store;

fn bulk(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}

fn ctx(store: &Store) -> ExecContext<'_> {
    ExecContext {
        store,
        role_is_primary: true,
        master_replid: "0123456789abcdef0123456789abcdef01234567",
        master_repl_offset: 0,
    }
}

#[test]
fn set_then_get_roundtrips_a_value() {
    let store = Store::new();
    let c = ctx(&store);

    let reply = execute("SET", &[bulk("key"), bulk("value")], &c).unwrap();
    assert_eq!(reply, RespValue::ok());

    let reply = execute("GET", &[bulk("key")], &c).unwrap();
    assert_eq!(reply, RespValue::bulk(b"value".to_vec()));
}

#[test]
fn get_on_missing_key_is_null_bulk() {
    let store = Store::new();
    let c = ctx(&store);
    let reply = execute("GET", &[bulk("missing")], &c).unwrap();
    assert_eq!(reply, RespValue::null_bulk());
}

#[test]
fn set_with_px_expires_the_key() {
    let store = Store::new();
    let c = ctx(&store);

    execute("SET", &[bulk("key"), bulk("value"), bulk("PX"), bulk("20")], &c).unwrap();
    assert_eq!(
        execute("GET", &[bulk("key")], &c).unwrap(),
        RespValue::bulk(b"value".to_vec())
    );

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(execute("GET", &[bulk("key")], &c).unwrap(), RespValue::null_bulk());
}

#[test]
fn hset_and_hgetall_round_trip_fields() {
    let store = Store::new();
    let c = ctx(&store);

    let reply = execute(
        "HSET",
        &[bulk("h"), bulk("f1"), bulk("v1"), bulk("f2"), bulk("v2")],
        &c,
    )
    .unwrap();
    assert_eq!(reply, RespValue::ok());

    let RespValue::Array(Some(items)) = execute("HGETALL", &[bulk("h")], &c).unwrap() else {
        panic!("expected array reply");
    };
    assert_eq!(items.len(), 4);
}

#[test]
fn hget_against_a_string_key_is_wrongtype() {
    let store = Store::new();
    let c = ctx(&store);
    execute("SET", &[bulk("key"), bulk("value")], &c).unwrap();
    let err = execute("HGET", &[bulk("key"), bulk("field")], &c).unwrap_err();
    assert_eq!(err, redwire::core::errors::RedwireError::WrongType);
}

#[test]
fn del_and_exists_count_affected_keys() {
    let store = Store::new();
    let c = ctx(&store);

    execute("SET", &[bulk("a"), bulk("1")], &c).unwrap();
    execute("SET", &[bulk("b"), bulk("2")], &c).unwrap();

    assert_eq!(
        execute("EXISTS", &[bulk("a"), bulk("b"), bulk("c")], &c).unwrap(),
        RespValue::Integer(2)
    );
    assert_eq!(
        execute("DEL", &[bulk("a"), bulk("b"), bulk("c")], &c).unwrap(),
        RespValue::Integer(2)
    );
    assert_eq!(
        execute("EXISTS", &[bulk("a"), bulk("b")], &c).unwrap(),
        RespValue::Integer(0)
    );
}

#[test]
fn info_reports_role_and_replid() {
    let store = Store::new();
    let c = ctx(&store);
    let RespValue::Bulk(Some(body)) = execute("INFO", &[], &c).unwrap() else {
        panic!("expected bulk reply");
    };
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains("role:master"));
    assert!(body.contains(c.master_replid));
}

#[test]
fn write_commands_propagate_through_the_wire_codec() {
    // A command executed against a primary is re-encoded with encode_command
    // for propagation; decoding that frame must produce the same name/args a
    // replica's own decode loop would hand to `execute`.
    let store = Store::new();
    let c = ctx(&store);
    execute("SET", &[bulk("k"), bulk("v")], &c).unwrap();

    let wire = redwire::core::protocol::encode_command(&["SET", "k", "v"]);
    let (value, consumed) = decode(&wire).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    let (name, args) = value.into_command_parts().unwrap();
    assert_eq!(name, "SET");
    assert_eq!(args, vec![bulk("k"), bulk("v")]);
    assert!(command::is_write_command(&name));
}

#[test]
fn rdb_round_trips_strings_and_hashes_through_a_file() {
    let store = Store::new();
    let c = ctx(&store);
    execute("SET", &[bulk("k1"), bulk("v1")], &c).unwrap();
    execute("HSET", &[bulk("h1"), bulk("f"), bulk("v")], &c).unwrap();
    execute("SET", &[bulk("soon"), bulk("gone"), bulk("PX"), bulk("100000")], &c).unwrap();

    let dir = tempdir().unwrap();
    let path = redwire::core::persistence::rdb_path(dir.path(), "dump");
    saver::save_now(&store, &path).unwrap();

    let restored = Store::new();
    saver::load_into(&restored, &path).unwrap();

    let restored_ctx = ctx(&restored);
    assert_eq!(
        execute("GET", &[bulk("k1")], &restored_ctx).unwrap(),
        RespValue::bulk(b"v1".to_vec())
    );
    assert_eq!(
        execute("HGET", &[bulk("h1"), bulk("f")], &restored_ctx).unwrap(),
        RespValue::bulk(b"v".to_vec())
    );
    assert_eq!(
        execute("GET", &[bulk("soon")], &restored_ctx).unwrap(),
        RespValue::bulk(b"gone".to_vec())
    );
}

#[test]
fn rdb_drops_entries_already_expired_at_load_time() {
    let entries = vec![(
        "key".to_string(),
        redwire::core::store::Value::Str(bulk("value")),
        Some(std::time::Instant::now() - Duration::from_secs(5)),
    )];
    let bytes = rdb::marshal(&entries);
    let restored = rdb::unmarshal(&bytes).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn replication_offset_advances_by_propagated_frame_length() {
    let state = ReplicationState::new(Role::Primary);
    let wire = redwire::core::protocol::encode_command(&["SET", "k", "v"]);
    let new_offset = state.advance_offset(wire.len() as u64);
    assert_eq!(new_offset, wire.len() as u64);
    assert_eq!(state.offset(), wire.len() as u64);
}

#[test]
fn wait_is_satisfied_once_every_replica_acks_past_the_captured_offset() {
    let tracker = OffsetTracker::new();
    tracker.set_captured_offset(42);
    let rx = tracker.fresh_ack_channel();
    tracker.deliver_ack(1, 42);
    tracker.deliver_ack(2, 100);

    let satisfied = collect_acks(rx, 2, 42, Duration::from_millis(200));
    assert_eq!(satisfied, 2);
}

#[test]
fn unknown_command_is_rejected() {
    let store = Store::new();
    let c = ctx(&store);
    let err = execute("NOSUCHCOMMAND", &[], &c).unwrap_err();
    assert!(matches!(err, redwire::core::errors::RedwireError::Command(_)));
}

#[test]
fn encode_then_decode_preserves_a_full_command_frame() {
    let frame = encode_to_vec(&RespValue::array(vec![
        RespValue::bulk(b"HSET".to_vec()),
        RespValue::bulk(b"h".to_vec()),
        RespValue::bulk(b"f".to_vec()),
        RespValue::bulk(b"v".to_vec()),
    ]));
    let (decoded, consumed) = decode(&frame).unwrap().unwrap();
    assert_eq!(consumed, frame.len());
    let (name, args) = decoded.into_command_parts().unwrap();
    assert_eq!(name, "HSET");
    assert_eq!(args.len(), 3);
}
