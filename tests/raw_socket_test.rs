//! Socket-level scenario tests: each spins up the real event loop on an
//! in-process listener and drives it with a plain `std::net::TcpStream`
//! client, exactly as the teacher crate's own integration tests open a real
//! listener rather than mocking the socket layer. Scenarios follow §8 of the
//! design spec.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use redwire::config::Config;
use redwire::server::event_loop;

/// Ports are fixed per test (rather than an ephemeral `:0`) because
/// `event_loop::run` never returns the bound address to its caller — it
/// loops for the process lifetime, matching a real server's `main`.
fn spawn_server(port: u16, dir: PathBuf, dbfilename: &str) {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port,
        replicaof: None,
        dir,
        dbfilename: dbfilename.to_string(),
    };
    std::thread::spawn(move || {
        let _ = event_loop::run(config);
    });
    // Give the listener a moment to bind before the test connects.
    std::thread::sleep(Duration::from_millis(150));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to test server");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

/// Sends `request` and reads back exactly `expected.len()` bytes, asserting
/// they match. RESP replies are self-delimiting by construction here since
/// every scenario below knows its expected reply shape up front.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).unwrap();
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, expected);
}

#[test]
fn scenario_basic_set_get() {
    let dir = tempfile::tempdir().unwrap();
    spawn_server(17001, dir.path().to_path_buf(), "dump");
    let mut client = connect(17001);

    roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$3\r\nbar\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nqux\r\n", b"$-1\r\n");
}

#[test]
fn scenario_px_expiry() {
    let dir = tempfile::tempdir().unwrap();
    spawn_server(17002, dir.path().to_path_buf(), "dump");
    let mut client = connect(17002);

    roundtrip(
        &mut client,
        b"*5\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$2\r\nPX\r\n$2\r\n50\r\n",
        b"+OK\r\n",
    );
    std::thread::sleep(Duration::from_millis(100));
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$-1\r\n");
}

#[test]
fn scenario_hset_hgetall() {
    let dir = tempfile::tempdir().unwrap();
    spawn_server(17003, dir.path().to_path_buf(), "dump");
    let mut client = connect(17003);

    roundtrip(
        &mut client,
        b"*6\r\n$4\r\nHSET\r\n$1\r\nh\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n",
        b"+OK\r\n",
    );

    client.write_all(b"*2\r\n$7\r\nHGETALL\r\n$1\r\nh\r\n").unwrap();
    // Field order within a hash isn't stable (§8 scenario 3); every field
    // and value here is exactly one byte, so the reply length is fixed
    // regardless of order — read exactly that many bytes, then check the
    // multiset of (field, value) pairs instead of a byte-exact reply.
    let mut buf = [0u8; 32];
    client.read_exact(&mut buf).unwrap();
    let body = String::from_utf8_lossy(&buf);
    assert!(body.starts_with("*4\r\n"));
    assert!(body.contains("$1\r\na\r\n$1\r\n1\r\n"));
    assert!(body.contains("$1\r\nb\r\n$1\r\n2\r\n"));
}

#[test]
fn scenario_rdb_round_trip_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    spawn_server(17004, dir.path().to_path_buf(), "dump");
    let mut first = connect(17004);
    roundtrip(&mut first, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n", b"+OK\r\n");
    roundtrip(&mut first, b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$5\r\nhello\r\n", b"+OK\r\n");
    roundtrip(
        &mut first,
        b"*4\r\n$4\r\nHSET\r\n$1\r\nh\r\n$1\r\nx\r\n$1\r\ny\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut first, b"*1\r\n$4\r\nSAVE\r\n", b"+OK\r\n");
    drop(first);

    // Simulate a process restart: a fresh server instance pointed at the
    // same --dir/--dbfilename, on a different port since the original
    // instance's listener can't be torn down from here.
    spawn_server(17005, dir.path().to_path_buf(), "dump");
    let mut second = connect(17005);
    roundtrip(&mut second, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n", b"$1\r\n1\r\n");
    roundtrip(&mut second, b"*2\r\n$3\r\nGET\r\n$1\r\nb\r\n", b"$5\r\nhello\r\n");
    roundtrip(&mut second, b"*3\r\n$4\r\nHGET\r\n$1\r\nh\r\n$1\r\nx\r\n", b"$1\r\ny\r\n");
}
