//! Startup configuration, parsed from CLI flags with `clap`.
//!
//! The teacher crate hand-parses `env::args()` directly; this spec's flag
//! set is small and fully enumerable, so `clap`'s derive macro is used
//! instead — still the pack's idiomatic choice for argument parsing (see
//! the `spineldb-cli` example), just applied where the teacher itself
//! happens not to.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "redwire", about = "A RESP-compatible key-value store with replication and RDB snapshots")]
pub struct Config {
    /// Address to bind the client-facing listener on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the client-facing listener on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the primary to replicate from. Unset means this
    /// node starts as a primary.
    #[arg(long)]
    pub replicaof: Option<String>,

    /// Directory the RDB file is read from and written to.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Base name of the RDB file (the ".rdb" suffix is appended).
    #[arg(long, default_value = "dump")]
    pub dbfilename: String,
}

impl Config {
    /// Parses `--replicaof "<host> <port>"` into a connectable address.
    pub fn replica_of_addr(&self) -> Result<Option<String>, String> {
        let Some(raw) = &self.replicaof else {
            return Ok(None);
        };
        let mut parts = raw.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) => Ok(Some(format!("{host}:{port}"))),
            _ => Err(format!("invalid --replicaof value: {raw:?}, expected \"<host> <port>\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_of_addr_parses_host_and_port() {
        let cfg = Config {
            host: "0.0.0.0".into(),
            port: 6379,
            replicaof: Some("127.0.0.1 6380".into()),
            dir: ".".into(),
            dbfilename: "dump".into(),
        };
        assert_eq!(cfg.replica_of_addr().unwrap(), Some("127.0.0.1:6380".to_string()));
    }

    #[test]
    fn replica_of_addr_rejects_malformed_value() {
        let cfg = Config {
            host: "0.0.0.0".into(),
            port: 6379,
            replicaof: Some("just-a-host".into()),
            dir: ".".into(),
            dbfilename: "dump".into(),
        };
        assert!(cfg.replica_of_addr().is_err());
    }
}
