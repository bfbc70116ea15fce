//! The primary error type for the whole server.

use std::sync::Arc;
use thiserror::Error;

/// All failures that can occur while serving a connection or running the loop.
///
/// Mirrors the teacher crate's flat, thiserror-derived error enum: a handful of
/// semantically distinct variants rather than one per call site, with `Io` wrapping
/// an `Arc<std::io::Error>` so the type stays `Clone`.
#[derive(Error, Debug)]
pub enum RedwireError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Command(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Clone for RedwireError {
    fn clone(&self) -> Self {
        match self {
            RedwireError::Io(e) => RedwireError::Io(Arc::clone(e)),
            RedwireError::Protocol(s) => RedwireError::Protocol(s.clone()),
            RedwireError::Command(s) => RedwireError::Command(s.clone()),
            RedwireError::WrongType => RedwireError::WrongType,
            RedwireError::NotAnInteger => RedwireError::NotAnInteger,
            RedwireError::Replication(s) => RedwireError::Replication(s.clone()),
            RedwireError::Persistence(s) => RedwireError::Persistence(s.clone()),
            RedwireError::Internal(s) => RedwireError::Internal(s.clone()),
        }
    }
}

impl PartialEq for RedwireError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RedwireError::Io(a), RedwireError::Io(b)) => a.to_string() == b.to_string(),
            (RedwireError::Protocol(a), RedwireError::Protocol(b)) => a == b,
            (RedwireError::Command(a), RedwireError::Command(b)) => a == b,
            (RedwireError::WrongType, RedwireError::WrongType) => true,
            (RedwireError::NotAnInteger, RedwireError::NotAnInteger) => true,
            (RedwireError::Replication(a), RedwireError::Replication(b)) => a == b,
            (RedwireError::Persistence(a), RedwireError::Persistence(b)) => a == b,
            (RedwireError::Internal(a), RedwireError::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl From<std::io::Error> for RedwireError {
    fn from(e: std::io::Error) -> Self {
        RedwireError::Io(Arc::new(e))
    }
}

impl From<std::num::ParseIntError> for RedwireError {
    fn from(_: std::num::ParseIntError) -> Self {
        RedwireError::NotAnInteger
    }
}

impl From<std::string::FromUtf8Error> for RedwireError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        RedwireError::WrongType
    }
}

/// True for socket errors that represent an ordinary, expected disconnect rather
/// than something worth a warn-level log.
pub fn is_normal_disconnect(e: &RedwireError) -> bool {
    matches!(e, RedwireError::Io(io) if matches!(
        io.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
