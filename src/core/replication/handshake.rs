//! Replica-side handshake, grounded on `redis-go`'s `setupSlave`/`Replica`
//! bring-up and the teacher crate's `ReplicaWorker::perform_handshake`
//! control flow — re-threaded onto a single blocking `TcpStream` dialogue
//! that runs to completion before the event loop starts, per §4.6/§5.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::core::errors::RedwireError;
use crate::core::protocol::{decode, encode_command, RespValue};

/// Result of a successful handshake: the primary's replid/offset and the raw
/// RDB payload to load before entering the event loop.
pub struct HandshakeResult {
    pub master_replid: String,
    pub master_offset: u64,
    pub rdb_payload: Vec<u8>,
    pub stream: TcpStream,
}

fn send_command(stream: &mut TcpStream, parts: &[&str]) -> Result<(), RedwireError> {
    stream.write_all(&encode_command(parts))?;
    Ok(())
}

/// Reads one RESP frame, blocking and growing `buf` with additional reads as
/// needed. Used for every handshake step except the RDB payload, which is
/// read by `read_rdb_payload` immediately after the `PSYNC` reply line.
fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<RespValue, RedwireError> {
    loop {
        if let Some((value, consumed)) = decode(buf)? {
            buf.drain(..consumed);
            return Ok(value);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(RedwireError::Replication(
                "primary closed connection during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn expect_simple(stream: &mut TcpStream, buf: &mut Vec<u8>, what: &str) -> Result<String, RedwireError> {
    match read_frame(stream, buf)? {
        RespValue::Simple(s) => Ok(s),
        other => Err(RedwireError::Replication(format!(
            "expected simple string for {what}, got {other:?}"
        ))),
    }
}

/// Parses `FULLRESYNC <replid> <offset>`.
fn parse_fullresync(line: &str) -> Result<(String, u64), RedwireError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(replid), Some(offset)) => {
            let offset: u64 = offset
                .parse()
                .map_err(|_| RedwireError::Replication(format!("malformed FULLRESYNC offset: {offset}")))?;
            Ok((replid.to_string(), offset))
        }
        _ => Err(RedwireError::Replication(format!("malformed FULLRESYNC reply: {line}"))),
    }
}

/// Reads the bulk-style `$<n>\r\n<n bytes>` RDB payload that follows the
/// `FULLRESYNC` line. Unlike a normal bulk string there is no trailing CRLF
/// after the payload.
fn read_rdb_payload(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Vec<u8>, RedwireError> {
    loop {
        if let Some(crlf) = buf.windows(2).position(|w| w == b"\r\n") {
            if buf.first() != Some(&b'$') {
                return Err(RedwireError::Replication("expected bulk length header for RDB payload".into()));
            }
            let len_line = std::str::from_utf8(&buf[1..crlf])
                .map_err(|_| RedwireError::Replication("non-utf8 RDB length header".into()))?;
            let len: usize = len_line
                .parse()
                .map_err(|_| RedwireError::Replication(format!("malformed RDB length: {len_line}")))?;
            let header_len = crlf + 2;
            if buf.len() < header_len + len {
                let mut chunk = [0u8; 65536];
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    return Err(RedwireError::Replication("primary closed connection mid-RDB-transfer".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
                continue;
            }
            let payload = buf[header_len..header_len + len].to_vec();
            buf.drain(..header_len + len);
            return Ok(payload);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(RedwireError::Replication("primary closed connection during RDB header".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Performs the full four-step handshake against `primary_addr`, blocking
/// throughout. Runs on the main thread before the event loop starts.
pub fn perform_handshake(primary_addr: &str, own_port: u16) -> Result<HandshakeResult, RedwireError> {
    let mut stream = TcpStream::connect(primary_addr)
        .map_err(|e| RedwireError::Replication(format!("could not connect to primary {primary_addr}: {e}")))?;
    let mut buf = Vec::new();

    send_command(&mut stream, &["PING"])?;
    expect_simple(&mut stream, &mut buf, "PING")?;

    let port_str = own_port.to_string();
    send_command(&mut stream, &["REPLCONF", "listening-port", &port_str])?;
    expect_simple(&mut stream, &mut buf, "REPLCONF listening-port")?;

    send_command(&mut stream, &["REPLCONF", "capa", "psync2"])?;
    expect_simple(&mut stream, &mut buf, "REPLCONF capa")?;

    send_command(&mut stream, &["PSYNC", "?", "-1"])?;
    let fullresync_line = expect_simple(&mut stream, &mut buf, "PSYNC")?;
    let (master_replid, master_offset) = parse_fullresync(&fullresync_line)?;
    let rdb_payload = read_rdb_payload(&mut stream, &mut buf)?;

    Ok(HandshakeResult {
        master_replid,
        master_offset,
        rdb_payload,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fullresync_line() {
        let (replid, offset) = parse_fullresync("FULLRESYNC abc123 42").unwrap();
        assert_eq!(replid, "abc123");
        assert_eq!(offset, 42);
    }

    #[test]
    fn rejects_malformed_fullresync_line() {
        assert!(parse_fullresync("FULLRESYNC abc123").is_err());
        assert!(parse_fullresync("PONG").is_err());
    }
}
