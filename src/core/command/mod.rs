//! Command dispatch: maps an upper-cased command name to a handler.
//!
//! `PSYNC`, `WAIT`, `SAVE`, and `BGSAVE` are not dispatched from here — all
//! four need access to state this module doesn't hold (the connection/replica
//! tables, the task queue, the RDB path and persistence counters), so the
//! event loop intercepts them before reaching this module, the same way the
//! teacher crate's `ConnectionHandler` special-cases `PSYNC` ahead of its
//! generic `Router::route`.

use bytes::Bytes;

use crate::core::errors::RedwireError;
use crate::core::persistence::rdb::REPORTED_REDIS_VERSION;
use crate::core::protocol::RespValue;
use crate::core::store::{Expiry, Store};

/// Command names whose execution counts toward the replication offset and is
/// propagated verbatim to replicas.
pub fn is_write_command(name: &str) -> bool {
    matches!(name, "SET" | "HSET" | "DEL")
}

pub struct ExecContext<'a> {
    pub store: &'a Store,
    pub role_is_primary: bool,
    pub master_replid: &'a str,
    pub master_repl_offset: u64,
}

/// Executes every command except `PSYNC` and `WAIT`. Returns the RESP reply
/// to queue for writing.
pub fn execute(name: &str, args: &[Bytes], ctx: &ExecContext) -> Result<RespValue, RedwireError> {
    match name {
        "PING" => ping(args),
        "SET" => set(args, ctx.store),
        "GET" => get(args, ctx.store),
        "HSET" => hset(args, ctx.store),
        "HGET" => hget(args, ctx.store),
        "HGETALL" => hgetall(args, ctx.store),
        "DEL" => del(args, ctx.store),
        "EXISTS" => exists(args, ctx.store),
        "INFO" => Ok(info(ctx)),
        "REPLCONF" => replconf(args),
        "CONFIG" => config_get(args),
        "COMMAND" => Ok(command_meta(args)),
        other => Err(RedwireError::Command(format!("ERR unknown command '{other}'"))),
    }
}

fn arg_str(arg: &Bytes) -> Result<&str, RedwireError> {
    std::str::from_utf8(arg).map_err(|_| RedwireError::Command("ERR invalid UTF-8 argument".into()))
}

fn ping(args: &[Bytes]) -> Result<RespValue, RedwireError> {
    match args.len() {
        0 => Ok(RespValue::Simple("PONG".into())),
        1 => Ok(RespValue::bulk(args[0].clone())),
        _ => Err(RedwireError::Command(
            "ERR wrong number of arguments for 'ping' command".into(),
        )),
    }
}

fn parse_expiry(rest: &[Bytes]) -> Result<Option<Expiry>, RedwireError> {
    if rest.is_empty() {
        return Ok(None);
    }
    if rest.len() != 2 {
        return Err(RedwireError::Command("ERR syntax error".into()));
    }
    let option = arg_str(&rest[0])?.to_uppercase();
    let amount: u64 = arg_str(&rest[1])?
        .parse()
        .map_err(|_| RedwireError::Command("ERR value is not an integer or out of range".into()))?;
    match option.as_str() {
        "PX" => Ok(Some(Expiry::Px(amount))),
        "EX" => Ok(Some(Expiry::Ex(amount))),
        _ => Err(RedwireError::Command("ERR syntax error".into())),
    }
}

fn set(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.len() < 2 {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'set' command".into(),
        ));
    }
    let key = arg_str(&args[0])?.to_string();
    let value = args[1].clone();
    let expiry = parse_expiry(&args[2..])?;
    store.set(key, value, expiry);
    Ok(RespValue::ok())
}

fn get(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.len() != 1 {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'get' command".into(),
        ));
    }
    let key = arg_str(&args[0])?;
    match store.get(key)? {
        Some(value) => Ok(RespValue::bulk(value)),
        None => Ok(RespValue::null_bulk()),
    }
}

fn hset(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.len() < 3 || (args.len() - 1) % 2 != 0 {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'hset' command".into(),
        ));
    }
    let key = arg_str(&args[0])?.to_string();
    let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
    for chunk in args[1..].chunks_exact(2) {
        pairs.push((arg_str(&chunk[0])?.to_string(), chunk[1].clone()));
    }
    store.hset(key, pairs)?;
    Ok(RespValue::ok())
}

fn hget(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.len() != 2 {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'hget' command".into(),
        ));
    }
    let key = arg_str(&args[0])?;
    let field = arg_str(&args[1])?;
    match store.hget(key, field)? {
        Some(value) => Ok(RespValue::bulk(value)),
        None => Ok(RespValue::null_bulk()),
    }
}

fn hgetall(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.len() != 1 {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'hgetall' command".into(),
        ));
    }
    let key = arg_str(&args[0])?;
    let pairs = store.hgetall(key)?;
    let mut items = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        items.push(RespValue::bulk(field.into_bytes()));
        items.push(RespValue::bulk(value));
    }
    Ok(RespValue::array(items))
}

fn del(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.is_empty() {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'del' command".into(),
        ));
    }
    let keys: Vec<String> = args.iter().map(|a| arg_str(a).map(str::to_string)).collect::<Result<_, _>>()?;
    Ok(RespValue::Integer(store.del(&keys) as i64))
}

fn exists(args: &[Bytes], store: &Store) -> Result<RespValue, RedwireError> {
    if args.is_empty() {
        return Err(RedwireError::Command(
            "ERR wrong number of arguments for 'exists' command".into(),
        ));
    }
    let keys: Vec<String> = args.iter().map(|a| arg_str(a).map(str::to_string)).collect::<Result<_, _>>()?;
    Ok(RespValue::Integer(store.exists(&keys) as i64))
}

fn info(ctx: &ExecContext) -> RespValue {
    let role = if ctx.role_is_primary { "master" } else { "slave" };
    let body = format!(
        "role:{role}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\nredis_version:{REPORTED_REDIS_VERSION}\r\n",
        ctx.master_replid, ctx.master_repl_offset
    );
    RespValue::bulk(body.into_bytes())
}

/// Handles the `REPLCONF listening-port`/`capa` subcommands (answered with
/// "OK" per §4.6). `GETACK`/`ACK` are routed by the event loop directly since
/// they need access to the replication offset and ack channels.
fn replconf(args: &[Bytes]) -> Result<RespValue, RedwireError> {
    if args.is_empty() {
        return Err(RedwireError::Command("ERR wrong number of arguments".into()));
    }
    Ok(RespValue::ok())
}

fn config_get(args: &[Bytes]) -> Result<RespValue, RedwireError> {
    if args.len() != 2 || arg_str(&args[0])?.to_uppercase() != "GET" {
        return Err(RedwireError::Command("ERR syntax error".into()));
    }
    let name = arg_str(&args[1])?.to_string();
    // No tunable parameters beyond the startup flags in this spec's scope;
    // every name resolves to an empty value, matching "array [name, value]".
    Ok(RespValue::array(vec![
        RespValue::bulk(name.into_bytes()),
        RespValue::bulk(Vec::new()),
    ]))
}

const COMMAND_NAMES: &[&str] = &[
    "PING", "SET", "GET", "HSET", "HGET", "HGETALL", "INFO", "REPLCONF", "PSYNC", "WAIT",
    "CONFIG", "SAVE", "BGSAVE", "COMMAND", "DEL", "EXISTS",
];

fn command_meta(args: &[Bytes]) -> RespValue {
    if args.is_empty() {
        return RespValue::Integer(COMMAND_NAMES.len() as i64);
    }
    match arg_str(&args[0]).ok().map(str::to_uppercase).as_deref() {
        Some("COUNT") => RespValue::Integer(COMMAND_NAMES.len() as i64),
        Some("LIST") => RespValue::array(
            COMMAND_NAMES
                .iter()
                .map(|n| RespValue::bulk(n.as_bytes().to_vec()))
                .collect(),
        ),
        Some("DOCS") => RespValue::array(Vec::new()),
        _ => RespValue::array(Vec::new()),
    }
}
