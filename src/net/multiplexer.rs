//! Thin wrapper around `mio::Poll`, grounded on `redis-go`'s
//! `internal/multiplexer.Iomuliplexer` interface
//! (`AddWatchFd`/`ModifyWatchingFd`/`RemoveWatchFd`/`Poll`/`IsReadable`/
//! `IsWritable`). `mio` already supplies level-triggered readiness by
//! default (no `EPOLLET` equivalent is set), matching the interface's
//! documented semantics, so this wrapper only renames the entry points —
//! readability/writability checks stay on `mio::event::Event` itself.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

pub use mio::event::Event;

/// Interest set matching the source's `mul.OpRead` / `mul.OpWrite` constants.
pub fn read_interest() -> Interest {
    Interest::READABLE
}

pub fn write_interest() -> Interest {
    Interest::READABLE.add(Interest::WRITABLE)
}

/// Wraps a `mio::Poll` plus its reusable event buffer.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Multiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Equivalent of `AddWatchFd`.
    pub fn add_watch(&mut self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Equivalent of `ModifyWatchingFd`.
    pub fn modify_watch(&mut self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Equivalent of `RemoveWatchFd`.
    pub fn remove_watch(&mut self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Equivalent of `Poll(-1)`: blocks until at least one fd is ready, or
    /// `timeout` elapses if given. `EINTR` is swallowed by `mio` internally
    /// (it retries), matching the source's explicit `errors.Is(err, EINTR)` check.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<&Events> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(&self.events)
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}
