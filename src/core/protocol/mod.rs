//! RESP (REdis Serialization Protocol) wire codec.
//!
//! Only the five RESP2 frame types are handled — no RESP3 maps, sets, doubles,
//! booleans, or verbatim strings. The command surface this server exposes never
//! needs them.

mod resp;

pub use resp::{decode, encode, encode_command, encode_to_vec, RespValue};
