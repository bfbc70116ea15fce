//! The single-threaded cooperative event loop, grounded on `redis-go`'s
//! `AsyncServer.Start`/`handleReadableEvent`/`handleWritableEvent` control
//! flow (`server/async_server.go`), re-expressed over `mio` instead of a
//! hand-rolled epoll wrapper.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::command::{self, ExecContext};
use crate::core::errors::{is_normal_disconnect, RedwireError};
use crate::core::persistence::saver;
use crate::core::protocol::{decode, encode_to_vec, RespValue};
use crate::core::replication::offset::{collect_acks, OffsetTracker};
use crate::core::replication::{handshake, Role};
use crate::core::store::Store;
use crate::net::connection::{Connection, DrainOutcome};
use crate::net::multiplexer::{read_interest, write_interest, Multiplexer};
use crate::server::state::{ClientRecord, ReplicaRecord, ServerState};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const MASTER_TOKEN: Token = Token(2);
const FIRST_DYNAMIC_TOKEN: usize = 3;

const WAIT_DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Runs the server to completion (it only returns on a fatal I/O error on
/// the listener itself). Binds, optionally performs the replica handshake,
/// spawns the persistence ticker, then enters the poll loop.
pub fn run(config: Config) -> Result<(), RedwireError> {
    let rdb_path = crate::core::persistence::rdb_path(&config.dir, &config.dbfilename);
    let store = Arc::new(Store::new());

    let replica_of = config.replica_of_addr().map_err(RedwireError::Replication)?;
    let role = if replica_of.is_some() { Role::Replica } else { Role::Primary };

    let state = Arc::new(ServerState::new(config, rdb_path.clone(), Arc::clone(&store), role));

    saver::load_into(&store, &rdb_path).map_err(|e| {
        error!("fatal: RDB load failed: {e}");
        e
    })?;

    let mut master_stream: Option<TcpStream> = None;
    if let Some(primary_addr) = &replica_of {
        info!(primary_addr, "starting replica handshake");
        let result = handshake::perform_handshake(primary_addr, state.config.port).map_err(|e| {
            error!("fatal: replica handshake failed: {e}");
            e
        })?;
        let entries = crate::core::persistence::rdb::unmarshal(&result.rdb_payload)?;
        let mut values = HashMap::new();
        let mut expiry = HashMap::new();
        for (key, value, deadline) in entries {
            if let Some(d) = deadline {
                expiry.insert(key.clone(), d);
            }
            values.insert(key, value);
        }
        store.load(values, expiry);
        state.replication.adopt_master(result.master_replid, result.master_offset);
        result.stream.set_nonblocking(true)?;
        master_stream = Some(TcpStream::from_std(result.stream));
        info!("replica handshake complete, entering event loop");
    } else {
        info!("starting as primary");
    }

    let mut multiplexer = Multiplexer::new(1024)?;
    let waker = Arc::new(Waker::new(multiplexer.registry(), WAKER_TOKEN)?);
    state.task_queue.set_waker(Arc::clone(&waker));

    let bind_addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| RedwireError::Internal(format!("invalid bind address: {e}")))?;
    let mut listener = TcpListener::bind(bind_addr)?;
    multiplexer.add_watch(&mut listener, LISTENER_TOKEN, read_interest())?;
    info!(%bind_addr, "listening for connections");

    let mut master_conn: Option<Connection> = master_stream.take().map(|stream| {
        let peer = stream.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        Connection::new(stream, MASTER_TOKEN, peer)
    });
    if let Some(conn) = master_conn.as_mut() {
        multiplexer.add_watch(&mut conn.stream, MASTER_TOKEN, read_interest())?;
    }

    let _ticker = saver::spawn_ticker(Arc::clone(&store), rdb_path.clone(), Arc::clone(&state.persistence));

    let mut next_token = FIRST_DYNAMIC_TOKEN;

    loop {
        let events = match multiplexer.poll(Some(Duration::from_millis(200))) {
            Ok(events) => events,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let ready: Vec<(Token, bool, bool)> = events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in ready {
            if token == WAKER_TOKEN {
                continue;
            }
            if token == LISTENER_TOKEN {
                if let Err(e) = accept_new_connection(&mut listener, &mut multiplexer, &state, &mut next_token) {
                    warn!("error accepting connection: {e}");
                }
                continue;
            }
            if token == MASTER_TOKEN {
                if let Some(conn) = master_conn.as_mut() {
                    if readable {
                        if let Err(e) = handle_master_readable(conn, &mut multiplexer, &state) {
                            warn!("error reading from primary, closing replication link: {e}");
                            let _ = multiplexer.remove_watch(&mut conn.stream);
                            master_conn = None;
                        }
                    }
                }
                continue;
            }

            if readable {
                if let Err(e) = handle_readable(token, &mut multiplexer, &state) {
                    if !is_normal_disconnect(&e) {
                        warn!("error serving connection {}: {e}", token.0);
                    }
                    close_connection(token, &mut multiplexer, &state);
                    continue;
                }
            }
            if writable {
                handle_writable(token, &mut multiplexer, &state);
            }
        }

        drain_task_queue(&mut multiplexer, &state);
    }
}

/// Runs `f` against the connection at `token`, wherever it currently lives
/// (client table or replica table — PSYNC can move it mid-flight). Mirrors
/// `getConn`'s client-then-replica lookup order.
fn with_conn_mut<R>(token: Token, state: &ServerState, f: impl FnOnce(&mut Connection, bool) -> R) -> Option<R> {
    let mut clients = state.clients.lock();
    if let Some(client) = clients.get_mut(&token) {
        return Some(f(&mut client.conn, false));
    }
    drop(clients);
    let mut replicas = state.replicas.lock();
    replicas.get_mut(&token).map(|r| f(&mut r.conn, true))
}

fn accept_new_connection(
    listener: &mut TcpListener,
    multiplexer: &mut Multiplexer,
    state: &Arc<ServerState>,
    next_token: &mut usize,
) -> Result<(), RedwireError> {
    loop {
        if state.total_connections() >= state.max_clients() + state.max_replicas() {
            return Ok(());
        }
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                multiplexer.add_watch(&mut stream, token, read_interest())?;
                let conn = Connection::new(stream, token, peer_addr);
                state.clients.lock().insert(
                    token,
                    ClientRecord {
                        conn,
                        offsets: Arc::new(OffsetTracker::new()),
                    },
                );
                info!(%peer_addr, "client connected");
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Handles one readable event on a client/replica connection, running the
/// full "execution pipeline per readable frame" from §4.5.
fn handle_readable(token: Token, multiplexer: &mut Multiplexer, state: &Arc<ServerState>) -> Result<(), RedwireError> {
    loop {
        let bytes_read = match with_conn_mut(token, state, |conn, _| conn.read_available()) {
            Some(result) => result?,
            None => return Ok(()),
        };
        if bytes_read == 0 {
            return Ok(());
        }
        process_buffered_frames(token, multiplexer, state)?;
    }
}

fn process_buffered_frames(token: Token, multiplexer: &mut Multiplexer, state: &Arc<ServerState>) -> Result<(), RedwireError> {
    loop {
        // The raw frame bytes are captured here, before `consume_inbound`
        // drops them, so a write command can be propagated to replicas
        // byte-for-byte rather than re-encoded (§4.6: "forwarded verbatim,
        // original bytes, pre-parse").
        let frame = with_conn_mut(token, state, |conn, _| -> Result<Option<(RespValue, usize, Vec<u8>)>, RedwireError> {
            match decode(conn.inbound())? {
                Some((value, consumed)) => {
                    let raw = conn.inbound()[..consumed].to_vec();
                    conn.consume_inbound(consumed);
                    Ok(Some((value, consumed, raw)))
                }
                None => Ok(None),
            }
        });
        let Some(frame) = frame else { return Ok(()) };
        let Some((value, consumed, raw)) = frame? else { return Ok(()) };

        let (name, args) = value.into_command_parts()?;
        dispatch_one(token, &name, args, consumed, &raw, multiplexer, state)?;
    }
}

fn dispatch_one(
    token: Token,
    name: &str,
    args: Vec<bytes::Bytes>,
    frame_len: usize,
    raw_frame: &[u8],
    multiplexer: &mut Multiplexer,
    state: &Arc<ServerState>,
) -> Result<(), RedwireError> {
    let is_write = command::is_write_command(name);
    let role_is_primary = state.replication.role() == Role::Primary;
    let is_replica_conn = state.replicas.lock().contains_key(&token);

    match name {
        "PSYNC" => return handle_psync(token, multiplexer, state),
        "WAIT" => return handle_wait(token, &args, multiplexer, state),
        "SAVE" => {
            let reply = match saver::save_now(&state.store, &state.rdb_path) {
                Ok(()) => RespValue::ok(),
                Err(e) => RespValue::error(format!("ERR {e}")),
            };
            queue_reply(token, &reply, multiplexer, state);
            return Ok(());
        }
        "BGSAVE" => {
            let store = Arc::clone(&state.store);
            let path = state.rdb_path.clone();
            std::thread::spawn(move || {
                if let Err(e) = saver::save_now(&store, &path) {
                    error!("BGSAVE failed: {e}");
                }
            });
            queue_reply(token, &RespValue::ok(), multiplexer, state);
            return Ok(());
        }
        "REPLCONF" if args.len() == 2 && args[0].eq_ignore_ascii_case(b"GETACK") => {
            let offset = state.replication.offset().to_string();
            let reply = replconf_ack_frame(&offset);
            queue_and_flush(token, &reply, multiplexer, state);
            return Ok(());
        }
        "REPLCONF" if args.len() == 2 && args[0].eq_ignore_ascii_case(b"ACK") => {
            if let Ok(offset) = std::str::from_utf8(&args[1]).unwrap_or("").parse::<u64>() {
                state.record_replica_ack(token, offset);
            }
            return Ok(());
        }
        _ => {}
    }

    let replid = state.replication.replid();
    let ctx = ExecContext {
        store: &state.store,
        role_is_primary,
        master_replid: &replid,
        master_repl_offset: state.replication.offset(),
    };
    let reply = match command::execute(name, &args, &ctx) {
        Ok(reply) => reply,
        Err(e @ (RedwireError::Command(_) | RedwireError::WrongType | RedwireError::NotAnInteger)) => {
            RespValue::error(format!("{e}"))
        }
        Err(e) => return Err(e),
    };

    if is_write {
        state.persistence.mark_dirty();
    }

    // Step 5: primary propagates writes verbatim (the exact inbound bytes,
    // captured before parsing) and advances the captured offset on the
    // originating client's tracker. `frame_len` is the same byte count
    // forwarded to replicas, so a replica's own `consumed` when it decodes
    // the propagated frame matches exactly, keeping the offset invariant
    // (§8) from drifting.
    if role_is_primary && is_write && !is_replica_conn {
        let result = state.propagate_to_replicas(raw_frame);
        deregister_dropped_replicas(result.dropped, multiplexer);
        apply_replica_drain_outcomes(result.outcomes, multiplexer, state);
        let new_offset = state.replication.advance_offset(frame_len as u64);
        if let Some(client) = state.clients.lock().get(&token) {
            client.offsets.set_captured_offset(new_offset);
        }
    } else if is_write {
        state.replication.advance_offset(frame_len as u64);
    }

    // A replica executing the primary's write does not reply (§4.6: "the
    // replica does not reply except to REPLCONF GETACK *").
    if is_replica_conn && is_write {
        return Ok(());
    }

    queue_reply(token, &reply, multiplexer, state);
    Ok(())
}

/// Deregisters sockets for replicas `propagate_to_replicas` evicted for
/// exceeding the write-queue cap. The registry entry is already gone by
/// the time this runs; only the multiplexer watch remains to clean up.
fn deregister_dropped_replicas(dropped: Vec<(Token, Connection)>, multiplexer: &mut Multiplexer) {
    for (_, mut conn) in dropped {
        let _ = multiplexer.remove_watch(&mut conn.stream);
    }
}

/// Applies the per-replica drain outcome `propagate_to_replicas` already
/// produced (it queues and opportunistically drains in the same step) to
/// the multiplexer: re-subscribe for writability if a replica couldn't
/// keep up, or close it if the write failed outright.
fn apply_replica_drain_outcomes(
    outcomes: Vec<(Token, Result<DrainOutcome, RedwireError>)>,
    multiplexer: &mut Multiplexer,
    state: &ServerState,
) {
    for (token, outcome) in outcomes {
        apply_drain_result(token, outcome, multiplexer, state);
    }
}

fn replconf_ack_frame(offset: &str) -> Vec<u8> {
    encode_to_vec(&RespValue::array(vec![
        RespValue::bulk(b"REPLCONF".to_vec()),
        RespValue::bulk(b"ACK".to_vec()),
        RespValue::bulk(offset.as_bytes().to_vec()),
    ]))
}

fn queue_reply(token: Token, reply: &RespValue, multiplexer: &mut Multiplexer, state: &ServerState) {
    let bytes = encode_to_vec(reply);
    queue_and_flush(token, &bytes, multiplexer, state);
}

/// Appends `bytes` to `token`'s write queue, then opportunistically
/// attempts to drain it right away (§4.2: "`QueueData` appends and then
/// opportunistically attempts to drain"), instead of leaving the reply
/// sitting in the queue until some later writable event that, for a
/// read-only-registered client fd, would otherwise never come.
fn queue_and_flush(token: Token, bytes: &[u8], multiplexer: &mut Multiplexer, state: &ServerState) {
    let outcome = with_conn_mut(token, state, |conn, _| {
        conn.queue_data(bytes);
        conn.drain()
    });
    let Some(outcome) = outcome else { return };
    apply_drain_result(token, outcome, multiplexer, state);
}

/// Shared tail of every drain attempt: on a full drain, drop back to
/// read-only interest; on `WouldBlock`, subscribe for writability so the
/// next writable event resumes the drain; on a real I/O error, close the
/// connection the same way `handle_writable` does.
fn apply_drain_result(
    token: Token,
    outcome: Result<DrainOutcome, RedwireError>,
    multiplexer: &mut Multiplexer,
    state: &ServerState,
) {
    match outcome {
        Ok(DrainOutcome::Complete) => set_interest(token, multiplexer, state, read_interest()),
        Ok(DrainOutcome::WouldBlock) => set_interest(token, multiplexer, state, write_interest()),
        Err(e) => {
            if !is_normal_disconnect(&e) {
                warn!("write error on connection {}: {e}", token.0);
            }
            close_connection(token, multiplexer, state);
        }
    }
}

/// Re-subscribes `token`'s fd for `interest`, wherever it currently lives
/// (client table or replica table).
fn set_interest(token: Token, multiplexer: &mut Multiplexer, state: &ServerState, interest: Interest) {
    let mut clients = state.clients.lock();
    if let Some(client) = clients.get_mut(&token) {
        let _ = multiplexer.modify_watch(&mut client.conn.stream, token, interest);
        return;
    }
    drop(clients);
    let mut replicas = state.replicas.lock();
    if let Some(replica) = replicas.get_mut(&token) {
        let _ = multiplexer.modify_watch(&mut replica.conn.stream, token, interest);
    }
}

/// Queues `bytes` on a connection not held in either registry table (the
/// bootstrap connection to the primary) and drains it directly.
fn flush_conn(conn: &mut Connection, token: Token, multiplexer: &mut Multiplexer) -> Result<(), RedwireError> {
    match conn.drain()? {
        DrainOutcome::Complete => multiplexer.modify_watch(&mut conn.stream, token, read_interest())?,
        DrainOutcome::WouldBlock => multiplexer.modify_watch(&mut conn.stream, token, write_interest())?,
    }
    Ok(())
}

/// `PSYNC ? -1`: replies `FULLRESYNC <replid> <offset>` then the RDB
/// snapshot as a bulk payload, then promotes the connection to replica.
fn handle_psync(token: Token, multiplexer: &mut Multiplexer, state: &Arc<ServerState>) -> Result<(), RedwireError> {
    let replid = state.replication.replid();
    let offset = state.replication.offset();
    let mut out = Vec::new();
    out.extend_from_slice(format!("+FULLRESYNC {replid} {offset}\r\n").as_bytes());

    let (values, expiry) = state.store.snapshot();
    let entries: Vec<_> = values
        .into_iter()
        .map(|(k, v)| {
            let deadline = expiry.get(&k).copied();
            (k, v, deadline)
        })
        .collect();
    let rdb = crate::core::persistence::rdb::marshal(&entries);
    out.extend_from_slice(format!("${}\r\n", rdb.len()).as_bytes());
    out.extend_from_slice(&rdb);

    let Some(mut client) = state.clients.lock().remove(&token) else {
        return Ok(());
    };
    client.conn.queue_data(&out);
    // Opportunistic drain, same as any other reply (§4.2); the RDB payload
    // is usually large enough that this lands on WouldBlock and the fresh
    // replica entry starts out write-subscribed, but a small/empty store
    // can drain in one go, in which case it goes straight back to read-only.
    flush_conn(&mut client.conn, token, multiplexer)?;
    state.replicas.lock().insert(
        token,
        ReplicaRecord {
            conn: client.conn,
            ack_offset: AtomicU64::new(offset),
        },
    );
    info!(token = token.0, "promoted connection to replica");
    Ok(())
}

/// `WAIT numreplicas timeout_ms`: per §4.6, replaces the client's ack
/// channel, fans out `REPLCONF GETACK *` to every replica, then hands the
/// blocking collection off to a worker thread that posts its result back
/// via the task queue.
fn handle_wait(
    token: Token,
    args: &[bytes::Bytes],
    multiplexer: &mut Multiplexer,
    state: &Arc<ServerState>,
) -> Result<(), RedwireError> {
    if args.len() != 2 {
        queue_reply(
            token,
            &RespValue::error("ERR wrong number of arguments for 'wait' command"),
            multiplexer,
            state,
        );
        return Ok(());
    }
    let num_replicas: usize = std::str::from_utf8(&args[0]).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
    let timeout_ms: u64 = std::str::from_utf8(&args[1])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(WAIT_DEFAULT_TIMEOUT_MS);

    let Some(tracker) = state.clients.lock().get(&token).map(|c| Arc::clone(&c.offsets)) else {
        return Ok(());
    };
    let captured_offset = tracker.captured_offset();
    let rx = tracker.fresh_ack_channel();

    let getack = encode_to_vec(&RespValue::array(vec![
        RespValue::bulk(b"REPLCONF".to_vec()),
        RespValue::bulk(b"GETACK".to_vec()),
        RespValue::bulk(b"*".to_vec()),
    ]));
    let result = state.propagate_to_replicas(&getack);
    deregister_dropped_replicas(result.dropped, multiplexer);
    apply_replica_drain_outcomes(result.outcomes, multiplexer, state);

    let state = Arc::clone(state);
    std::thread::spawn(move || {
        let count = collect_acks(rx, num_replicas, captured_offset, Duration::from_millis(timeout_ms));
        state.task_queue.push(Box::new(move |state: &ServerState, multiplexer: &mut Multiplexer| {
            let bytes = encode_to_vec(&RespValue::Integer(count as i64));
            queue_and_flush(token, &bytes, multiplexer, state);
        }));
    });
    Ok(())
}

/// Handles a readable event on the bootstrap master connection: executes
/// the replicated command silently (per §4.6's "does not reply" rule) and
/// answers only `REPLCONF GETACK *` with an `ACK`.
fn handle_master_readable(
    conn: &mut Connection,
    multiplexer: &mut Multiplexer,
    state: &Arc<ServerState>,
) -> Result<(), RedwireError> {
    conn.read_available()?;
    loop {
        let Some((value, consumed)) = decode(conn.inbound())? else {
            return Ok(());
        };
        conn.consume_inbound(consumed);
        let (name, args) = value.into_command_parts()?;

        if name == "REPLCONF" && args.len() == 2 && args[0].eq_ignore_ascii_case(b"GETACK") {
            let offset = state.replication.offset().to_string();
            conn.queue_data(&replconf_ack_frame(&offset));
            flush_conn(conn, MASTER_TOKEN, multiplexer)?;
            continue;
        }

        let replid = state.replication.replid();
        let ctx = ExecContext {
            store: &state.store,
            role_is_primary: false,
            master_replid: &replid,
            master_repl_offset: state.replication.offset(),
        };
        let _ = command::execute(&name, &args, &ctx);
        if command::is_write_command(&name) {
            state.persistence.mark_dirty();
            state.replication.advance_offset(consumed as u64);
        }
    }
}

fn handle_writable(token: Token, multiplexer: &mut Multiplexer, state: &Arc<ServerState>) {
    let outcome = with_conn_mut(token, state, |conn, _| conn.drain());
    let Some(outcome) = outcome else { return };
    apply_drain_result(token, outcome, multiplexer, state);
}

fn close_connection(token: Token, multiplexer: &mut Multiplexer, state: &ServerState) {
    let mut clients = state.clients.lock();
    if let Some(mut record) = clients.remove(&token) {
        let _ = multiplexer.remove_watch(&mut record.conn.stream);
        return;
    }
    drop(clients);

    let mut replicas = state.replicas.lock();
    if let Some(mut record) = replicas.remove(&token) {
        let _ = multiplexer.remove_watch(&mut record.conn.stream);
    }
}

fn drain_task_queue(multiplexer: &mut Multiplexer, state: &Arc<ServerState>) {
    for task in state.task_queue.drain() {
        task(state, multiplexer);
    }
}
