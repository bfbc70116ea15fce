//! `ServerState`: every piece of state the event loop and its worker threads
//! share, grounded on `redis-go`'s `AsyncServer` (`connectedClients`,
//! `connectedReplicas`, `store`, `master`) plus this spec's replication and
//! persistence additions layered on top.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mio::Token;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::core::errors::RedwireError;
use crate::core::persistence::saver::PersistenceCounters;
use crate::core::replication::offset::OffsetTracker;
use crate::core::replication::{ReplicationState, Role};
use crate::core::store::Store;
use crate::net::connection::{Connection, DrainOutcome};
use crate::server::task_queue::TaskQueue;

/// A connected ordinary client: its socket plus the ack-channel state `WAIT`
/// uses.
pub struct ClientRecord {
    pub conn: Connection,
    pub offsets: Arc<OffsetTracker>,
}

/// A connection promoted to replica via `PSYNC` — note there is no
/// `OffsetTracker` here; only clients need one (§4.6).
pub struct ReplicaRecord {
    pub conn: Connection,
    pub ack_offset: AtomicU64,
}

/// Result of a `propagate_to_replicas` fan-out: replicas evicted for
/// exceeding the queue cap, and the drain outcome of every replica that
/// received the write.
pub struct PropagateResult {
    pub dropped: Vec<(Token, Connection)>,
    pub outcomes: Vec<(Token, Result<DrainOutcome, RedwireError>)>,
}

pub struct ServerState {
    pub store: Arc<Store>,
    pub replication: ReplicationState,
    pub clients: Mutex<HashMap<Token, ClientRecord>>,
    pub replicas: Mutex<HashMap<Token, ReplicaRecord>>,
    pub persistence: Arc<PersistenceCounters>,
    pub config: Config,
    pub rdb_path: PathBuf,
    pub task_queue: TaskQueue,
}

impl ServerState {
    pub fn new(config: Config, rdb_path: PathBuf, store: Arc<Store>, role: Role) -> Self {
        ServerState {
            store,
            replication: ReplicationState::new(role),
            clients: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
            persistence: Arc::new(PersistenceCounters::new()),
            config,
            rdb_path,
            task_queue: TaskQueue::new(),
        }
    }

    pub fn max_clients(&self) -> usize {
        100
    }

    pub fn max_replicas(&self) -> usize {
        100
    }

    pub fn total_connections(&self) -> usize {
        self.clients.lock().len() + self.replicas.lock().len()
    }

    /// Moves a connection from the client table to the replica table
    /// (`promoteToSlave`). Its offset-tracker entry is dropped in the
    /// process, matching "only clients need one".
    pub fn promote_to_replica(&self, token: Token) {
        let client = self.clients.lock().remove(&token);
        if let Some(client) = client {
            self.replicas.lock().insert(
                token,
                ReplicaRecord {
                    conn: client.conn,
                    ack_offset: AtomicU64::new(0),
                },
            );
        }
    }

    /// Appends `raw_cmd` to every connected replica's write queue
    /// (`propagateCmd`) and opportunistically drains each one right away, the
    /// same "append then attempt to drain" pattern §4.2 requires of ordinary
    /// replies. No acknowledgement is awaited.
    ///
    /// The source appends unbounded; per the open-question decision in
    /// DESIGN.md this implementation bounds each replica's queue at
    /// `REPLICA_QUEUE_CAP` bytes and disconnects a replica that can't keep
    /// up rather than growing without limit. Disconnected replicas are
    /// removed from the registry here and returned in `dropped` so the
    /// caller can deregister their socket from the multiplexer; the drain
    /// outcome of every replica that survived is returned in `outcomes` so
    /// the caller can update its write-interest subscription.
    pub fn propagate_to_replicas(&self, raw_cmd: &[u8]) -> PropagateResult {
        const REPLICA_QUEUE_CAP: usize = 16 * 1024 * 1024;

        let mut replicas = self.replicas.lock();
        let overflowing: Vec<Token> = replicas
            .iter()
            .filter(|(_, r)| r.conn.queued_len() + raw_cmd.len() > REPLICA_QUEUE_CAP)
            .map(|(token, _)| *token)
            .collect();

        let mut dropped = Vec::with_capacity(overflowing.len());
        for token in overflowing {
            if let Some(record) = replicas.remove(&token) {
                warn!(token = token.0, "replica write queue exceeded cap, disconnecting");
                dropped.push((token, record.conn));
            }
        }

        let mut outcomes = Vec::with_capacity(replicas.len());
        for (token, replica) in replicas.iter_mut() {
            replica.conn.queue_data(raw_cmd);
            outcomes.push((*token, replica.conn.drain()));
        }
        PropagateResult { dropped, outcomes }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.lock().len()
    }

    /// Removes a connection from whichever table it lives in
    /// (`CloseConnecttion`). Returns true if something was removed.
    pub fn remove_connection(&self, token: Token) -> bool {
        if self.clients.lock().remove(&token).is_some() {
            return true;
        }
        self.replicas.lock().remove(&token).is_some()
    }

    /// Records an incoming `REPLCONF ACK <offset>` from the replica at
    /// `token`, updating its stored offset and delivering it to every open
    /// client ack-channel (a client may be waiting on any replica's ack).
    pub fn record_replica_ack(&self, token: Token, offset: u64) {
        if let Some(replica) = self.replicas.lock().get(&token) {
            replica.ack_offset.store(offset, Ordering::SeqCst);
        }
        let clients = self.clients.lock();
        for client in clients.values() {
            client.offsets.deliver_ack(token.0 as u64, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::sync::atomic::AtomicU64;

    fn replica_conn(token: Token) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        Connection::new(mio::net::TcpStream::from_std(server), token, addr)
    }

    fn test_state() -> ServerState {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            replicaof: None,
            dir: ".".into(),
            dbfilename: "dump".into(),
        };
        ServerState::new(config, PathBuf::from("dump.rdb"), Arc::new(Store::new()), Role::Primary)
    }

    #[test]
    fn propagate_disconnects_a_replica_that_exceeds_the_queue_cap() {
        let state = test_state();
        let token = Token(5);
        state.replicas.lock().insert(
            token,
            ReplicaRecord { conn: replica_conn(token), ack_offset: AtomicU64::new(0) },
        );

        // A command bigger than the cap should evict the replica rather than
        // grow its queue without bound.
        let huge = vec![0u8; 17 * 1024 * 1024];
        let result = state.propagate_to_replicas(&huge);

        assert_eq!(result.dropped.len(), 1);
        assert_eq!(result.dropped[0].0, token);
        assert!(result.outcomes.is_empty());
        assert!(state.replicas.lock().is_empty());
    }

    #[test]
    fn propagate_keeps_replicas_under_the_cap() {
        let state = test_state();
        let token = Token(7);
        state.replicas.lock().insert(
            token,
            ReplicaRecord { conn: replica_conn(token), ack_offset: AtomicU64::new(0) },
        );

        let result = state.propagate_to_replicas(b"small");
        assert!(result.dropped.is_empty());
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].0, token);
        assert!(result.outcomes[0].1.is_ok());
        assert_eq!(state.replicas.lock().len(), 1);
    }
}
