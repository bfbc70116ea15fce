//! A single client or replica socket: a non-blocking `mio::net::TcpStream`
//! plus an inbound read buffer and an outbound write queue.
//!
//! Grounded on `redis-go`'s `core.Conn` (`Read`/`QueueDatas`/`DrainQueue`)
//! from `async_server.go`'s `handleReadableEvent`/`handleWritableEvent`: a
//! fixed-size scratch read, queued byte segments drained FIFO with
//! partial-write splice-back.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use crate::core::errors::RedwireError;

/// Matches the source's `config.DefaultMessageSize` scratch buffer.
const READ_SCRATCH_SIZE: usize = 1024;

/// Outcome of draining the write queue.
pub enum DrainOutcome {
    /// Everything queued was written; the caller should switch this
    /// connection back to read-only interest.
    Complete,
    /// The socket would block with data still queued; the caller should
    /// switch to read+write interest and wait for the next writable event.
    WouldBlock,
}

pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    pub peer_addr: SocketAddr,
    read_buf: Vec<u8>,
    write_queue: VecDeque<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream, token: Token, peer_addr: SocketAddr) -> Self {
        Connection {
            stream,
            token,
            peer_addr,
            read_buf: Vec::new(),
            write_queue: VecDeque::new(),
        }
    }

    /// Reads everything currently available into the internal buffer,
    /// looping on the fixed-size scratch buffer until the kernel reports
    /// `WouldBlock` or a short read. Returns the number of bytes read.
    pub fn read_available(&mut self) -> Result<usize, RedwireError> {
        let mut total = 0;
        let mut scratch = [0u8; READ_SCRATCH_SIZE];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    if total == 0 {
                        return Err(RedwireError::Io(std::sync::Arc::new(io::Error::new(
                            ErrorKind::UnexpectedEof,
                            "peer closed connection",
                        ))));
                    }
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    total += n;
                    if n < READ_SCRATCH_SIZE {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Read-only view of buffered inbound bytes, for frame decoding.
    pub fn inbound(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drops the first `n` decoded bytes from the inbound buffer.
    pub fn consume_inbound(&mut self, n: usize) {
        self.read_buf.drain(..n);
    }

    /// Appends raw bytes to the outbound queue (`QueueDatas`).
    pub fn queue_data(&mut self, data: &[u8]) {
        self.write_queue.extend(data.iter().copied());
    }

    pub fn has_queued_data(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Bytes currently sitting in the outbound queue, awaiting drain.
    pub fn queued_len(&self) -> usize {
        self.write_queue.len()
    }

    /// Attempts to flush the entire write queue (`DrainQueue`). On a partial
    /// write the unwritten remainder stays queued for the next attempt.
    pub fn drain(&mut self) -> Result<DrainOutcome, RedwireError> {
        while !self.write_queue.is_empty() {
            let chunk = self.write_queue.make_contiguous();
            match self.stream.write(chunk) {
                Ok(0) => return Ok(DrainOutcome::WouldBlock),
                Ok(n) => {
                    self.write_queue.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(DrainOutcome::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(DrainOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn pair() -> (TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn queue_then_drain_writes_everything() {
        let (stream, mut client) = pair();
        let mut conn = Connection::new(stream, Token(1), "127.0.0.1:0".parse().unwrap());
        conn.queue_data(b"+OK\r\n");
        let outcome = conn.drain().unwrap();
        assert!(matches!(outcome, DrainOutcome::Complete));
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"+OK\r\n");
    }

    #[test]
    fn reads_available_bytes_into_buffer() {
        let (stream, mut client) = pair();
        let mut conn = Connection::new(stream, Token(1), "127.0.0.1:0".parse().unwrap());
        client.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = conn.read_available().unwrap();
        assert_eq!(n, 5);
        assert_eq!(conn.inbound(), b"hello");
        conn.consume_inbound(5);
        assert!(conn.inbound().is_empty());
    }
}
