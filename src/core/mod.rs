//! Storage engine, wire protocol, command dispatch, replication, and
//! persistence — everything that doesn't touch a socket directly.

pub mod command;
pub mod errors;
pub mod persistence;
pub mod protocol;
pub mod replication;
pub mod store;
