//! Socket-facing layer: the readiness multiplexer and per-connection state.

pub mod connection;
pub mod multiplexer;
