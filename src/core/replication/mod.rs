//! Replication: role tracking, the global offset, per-client ack channels,
//! and the replica-side handshake. Grounded on `redis-go`'s
//! `internal/command/wait.go` (`OffsTracker`) and `async_server.go`'s
//! `setupMaster`/`promoteToSlave`, re-threaded onto OS threads per §4.6.

pub mod handshake;
pub mod offset;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use rand::Rng;

/// Which side of a primary/replica pair this node is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// A 40 hex-character replication ID, generated once at startup the way a
/// real primary generates its `runid` — sixteen random bytes, hex-encoded.
pub fn generate_replid() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Process-wide replication bookkeeping: current role and the monotonically
/// increasing global offset, which both primary and replica advance by the
/// exact byte length of every write command's RESP frame.
pub struct ReplicationState {
    role: RwLock<Role>,
    replid: RwLock<String>,
    offset: AtomicU64,
}

impl ReplicationState {
    pub fn new(role: Role) -> Self {
        ReplicationState {
            role: RwLock::new(role),
            replid: RwLock::new(generate_replid()),
            offset: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write().unwrap() = role;
    }

    pub fn replid(&self) -> String {
        self.replid.read().unwrap().clone()
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Advances the global offset by `frame_len` bytes, returning the new value.
    pub fn advance_offset(&self, frame_len: u64) -> u64 {
        self.offset.fetch_add(frame_len, Ordering::SeqCst) + frame_len
    }

    /// Adopts the primary's replid and starting offset after a successful
    /// `PSYNC` handshake (this node is the replica).
    pub fn adopt_master(&self, replid: String, offset: u64) {
        *self.replid.write().unwrap() = replid;
        self.offset.store(offset, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replid_is_forty_hex_chars() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn offset_advances_cumulatively() {
        let state = ReplicationState::new(Role::Primary);
        assert_eq!(state.advance_offset(10), 10);
        assert_eq!(state.advance_offset(5), 15);
        assert_eq!(state.offset(), 15);
    }
}
