//! Binary snapshot codec (RDB-style), grounded bit-for-bit on
//! `redis-go`'s `internal/rdb/{marshall,unmarshall,rdb}.go` — the original
//! implementation this spec was distilled from — rather than on the teacher
//! crate's own (divergent) SPLDB length-encoding scheme. The teacher's
//! save/load control flow (temp-file-then-atomic-rename, advisory file lock,
//! background-save task shape) is kept; the wire layout is the original's.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::core::errors::RedwireError;
use crate::core::store::Value;

pub const RDB_VERSION: &str = "0011";
pub const REPORTED_REDIS_VERSION: &str = "6.0.16";

const OP_EOF: u8 = 0xFF;
const OP_SELECTDB: u8 = 0xFE;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_RESIZEDB: u8 = 0xFB;
const OP_AUX: u8 = 0xFA;

const VALUE_TYPE_STRING: u8 = 0x00;
const VALUE_TYPE_HASH: u8 = 0x01;

/// The two-bit length-encoding mode selected by the top two bits of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LengthEncoding {
    /// A direct length value (6-bit, 14-bit, or 32-bit).
    Direct,
    /// A fixed-width integer stored in place of a length-prefixed string body.
    Int8,
    Int16,
    Int32,
}

/// Encodes `length` using the spec's two-bit-prefix scheme into `out`.
fn write_length(out: &mut Vec<u8>, length: u32) {
    match length {
        0..=0x3F => out.push(length as u8),
        0x40..=0x3FFF => {
            let first = 0x40 | ((length >> 8) as u8 & 0x3F);
            let second = (length & 0xFF) as u8;
            out.push(first);
            out.push(second);
        }
        _ => {
            out.push(0x80);
            out.extend_from_slice(&length.to_le_bytes());
        }
    }
}

/// Encodes the "special integer" length-encoding form (mode `11`) selecting
/// int8/int16/int32 width in the low six bits.
fn write_special_length(out: &mut Vec<u8>, width_code: u8) {
    out.push(0xC0 | (width_code & 0x3F));
}

fn read_length(buf: &mut &[u8]) -> Result<(u32, LengthEncoding), RedwireError> {
    let first = read_byte(buf)?;
    match first >> 6 {
        0b00 => Ok(((first & 0x3F) as u32, LengthEncoding::Direct)),
        0b01 => {
            let second = read_byte(buf)?;
            let len = (((first & 0x3F) as u32) << 8) | second as u32;
            Ok((len, LengthEncoding::Direct))
        }
        0b10 => {
            let bytes = read_exact(buf, 4)?;
            let len = u32::from_le_bytes(bytes.try_into().unwrap());
            Ok((len, LengthEncoding::Direct))
        }
        0b11 => match first & 0x3F {
            0 => Ok((1, LengthEncoding::Int8)),
            1 => Ok((2, LengthEncoding::Int16)),
            2 => Ok((4, LengthEncoding::Int32)),
            other => Err(RedwireError::Persistence(format!(
                "unknown special length encoding: {other}"
            ))),
        },
        _ => unreachable!(),
    }
}

fn read_byte(buf: &mut &[u8]) -> Result<u8, RedwireError> {
    let (&b, rest) = buf
        .split_first()
        .ok_or_else(|| RedwireError::Persistence("unexpected end of RDB data".into()))?;
    *buf = rest;
    Ok(b)
}

fn read_exact<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], RedwireError> {
    if buf.len() < n {
        return Err(RedwireError::Persistence("unexpected end of RDB data".into()));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Writes a length-prefixed string, using the integer special-encoding when
/// the string's decimal value fits in int8/int16/int32, matching the
/// original's `getStringFormat` heuristic.
fn write_string(out: &mut Vec<u8>, data: &[u8]) {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(n) = s.parse::<i64>() {
            if (-128..=127).contains(&n) {
                write_special_length(out, 0);
                out.push(n as i8 as u8);
                return;
            } else if (-32768..=32767).contains(&n) {
                write_special_length(out, 1);
                out.extend_from_slice(&(n as i16).to_le_bytes());
                return;
            } else if (-2147483648..=2147483647).contains(&n) {
                write_special_length(out, 2);
                out.extend_from_slice(&(n as i32).to_le_bytes());
                return;
            }
        }
    }
    write_length(out, data.len() as u32);
    out.extend_from_slice(data);
}

fn read_string(buf: &mut &[u8]) -> Result<Vec<u8>, RedwireError> {
    let (len, encoding) = read_length(buf)?;
    match encoding {
        LengthEncoding::Direct => Ok(read_exact(buf, len as usize)?.to_vec()),
        LengthEncoding::Int8 => {
            let b = read_byte(buf)?;
            Ok((b as i8).to_string().into_bytes())
        }
        LengthEncoding::Int16 => {
            let bytes = read_exact(buf, 2)?;
            let v = i16::from_le_bytes(bytes.try_into().unwrap());
            Ok(v.to_string().into_bytes())
        }
        LengthEncoding::Int32 => {
            let bytes = read_exact(buf, 4)?;
            let v = i32::from_le_bytes(bytes.try_into().unwrap());
            Ok(v.to_string().into_bytes())
        }
    }
}

/// Marshals a full store snapshot into the on-disk/wire RDB byte layout.
/// `entries` are (key, value, optional expiry) triples already filtered of
/// wall-clock-expired keys by the caller, matching "skip entries whose expiry
/// is in the past at snapshot time".
pub fn marshal(entries: &[(String, Value, Option<Instant>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"REDIS");
    out.extend_from_slice(RDB_VERSION.as_bytes());

    out.push(OP_AUX);
    write_string(&mut out, REPORTED_REDIS_VERSION.as_bytes());
    write_string(&mut out, bit_width().as_bytes());
    write_string(&mut out, ctime_string().as_bytes());
    write_string(&mut out, used_memory_string().as_bytes());

    let now = Instant::now();
    let live: Vec<&(String, Value, Option<Instant>)> = entries
        .iter()
        .filter(|(_, _, expiry)| match expiry {
            Some(deadline) => *deadline > now,
            None => true,
        })
        .collect();

    out.push(OP_SELECTDB);
    out.push(0x00);
    out.push(OP_RESIZEDB);
    write_length(&mut out, live.len() as u32);
    write_length(&mut out, live.iter().filter(|(_, _, e)| e.is_some()).count() as u32);

    for (key, value, expiry) in live {
        if let Some(deadline) = expiry {
            out.push(OP_EXPIRETIME_MS);
            let ms = instant_to_epoch_ms(*deadline, now);
            out.extend_from_slice(&ms.to_le_bytes());
        }
        write_string(&mut out, key.as_bytes());
        match value {
            Value::Str(bytes) => {
                out.push(VALUE_TYPE_STRING);
                write_string(&mut out, bytes);
            }
            Value::Hash(map) => {
                out.push(VALUE_TYPE_HASH);
                write_length(&mut out, map.len() as u32);
                for (field, val) in map {
                    write_string(&mut out, field.as_bytes());
                    write_string(&mut out, val);
                }
            }
        }
    }

    out.push(OP_EOF);
    out
}

/// Unmarshals an RDB byte buffer back into (key, value, optional absolute
/// deadline) triples, discarding entries already expired at load time.
pub fn unmarshal(data: &[u8]) -> Result<Vec<(String, Value, Option<Instant>)>, RedwireError> {
    let mut buf = data;

    let header = read_exact(&mut buf, 9)?;
    if &header[..5] != b"REDIS" {
        return Err(RedwireError::Persistence("invalid RDB header".into()));
    }

    if read_byte(&mut buf)? != OP_AUX {
        return Err(RedwireError::Persistence("expected AUX opcode".into()));
    }
    let _redis_ver = read_string(&mut buf)?;
    let _redis_bits = read_string(&mut buf)?;
    let _ctime = read_string(&mut buf)?;
    let _used_mem = read_string(&mut buf)?;

    if read_byte(&mut buf)? != OP_SELECTDB {
        return Err(RedwireError::Persistence("expected SELECTDB opcode".into()));
    }
    let _db_index = read_byte(&mut buf)?;

    if read_byte(&mut buf)? != OP_RESIZEDB {
        return Err(RedwireError::Persistence("expected RESIZEDB opcode".into()));
    }
    let (store_size, _) = read_length(&mut buf)?;
    let (_expiry_size, _) = read_length(&mut buf)?;

    let now_instant = Instant::now();
    let now_epoch_ms = now_epoch_ms();
    let mut entries = Vec::with_capacity(store_size as usize);

    for _ in 0..store_size {
        let opcode = read_byte(&mut buf)?;
        let (has_expiry, expire_epoch_ms) = match opcode {
            OP_EXPIRETIME_MS => {
                let bytes = read_exact(&mut buf, 8)?;
                let ms = i64::from_le_bytes(bytes.try_into().unwrap());
                (true, ms)
            }
            OP_EXPIRETIME => {
                let bytes = read_exact(&mut buf, 4)?;
                let secs = i32::from_le_bytes(bytes.try_into().unwrap()) as i64;
                (true, secs * 1000)
            }
            _ => {
                // Not an expiry opcode: "unread" by re-slicing from one byte earlier.
                buf = &data[data.len() - buf.len() - 1..];
                (false, 0)
            }
        };

        let key = String::from_utf8(read_string(&mut buf)?)
            .map_err(|_| RedwireError::Persistence("non-utf8 key in RDB".into()))?;
        let value_type = read_byte(&mut buf)?;
        let value = match value_type {
            VALUE_TYPE_STRING => Value::Str(read_string(&mut buf)?.into()),
            VALUE_TYPE_HASH => {
                let (field_count, _) = read_length(&mut buf)?;
                let mut map = HashMap::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    let field = String::from_utf8(read_string(&mut buf)?)
                        .map_err(|_| RedwireError::Persistence("non-utf8 hash field in RDB".into()))?;
                    let val = read_string(&mut buf)?;
                    map.insert(field, val.into());
                }
                Value::Hash(map)
            }
            other => {
                return Err(RedwireError::Persistence(format!(
                    "unknown RDB value type: {other:#x}"
                )))
            }
        };

        if has_expiry && expire_epoch_ms <= now_epoch_ms {
            continue; // expired before load completed
        }

        let deadline = if has_expiry {
            Some(now_instant + Duration::from_millis((expire_epoch_ms - now_epoch_ms).max(0) as u64))
        } else {
            None
        };

        entries.push((key, value, deadline));
    }

    if read_byte(&mut buf)? != OP_EOF {
        return Err(RedwireError::Persistence("missing RDB EOF marker".into()));
    }

    Ok(entries)
}

fn bit_width() -> String {
    if cfg!(target_pointer_width = "64") {
        "64".to_string()
    } else {
        "32".to_string()
    }
}

fn ctime_string() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs.to_string()
}

fn used_memory_string() -> String {
    // No portable, dependency-free way to sample RSS here; report a stable
    // placeholder the aux section's contract does not otherwise constrain.
    "0".to_string()
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn instant_to_epoch_ms(deadline: Instant, now: Instant) -> i64 {
    let now_ms = now_epoch_ms();
    if deadline >= now {
        now_ms + deadline.duration_since(now).as_millis() as i64
    } else {
        now_ms - now.duration_since(deadline).as_millis() as i64
    }
}

/// Writes `bytes` to `path` under an exclusive advisory file lock, via a
/// truncate+create open, matching "writes are performed to a file opened
/// with truncate+create, with an exclusive advisory file lock held across
/// the write, then closed".
pub fn write_file(path: &std::path::Path, bytes: &[u8]) -> io::Result<()> {
    use fs2::FileExt;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.lock_exclusive()?;
    let mut file = file;
    let result = file.write_all(bytes);
    let _ = file.unlock();
    result
}

pub fn read_file(path: &std::path::Path) -> io::Result<Vec<u8>> {
    use fs2::FileExt;
    let mut file = std::fs::File::open(path)?;
    file.lock_shared()?;
    let mut bytes = Vec::new();
    let result = file.read_to_end(&mut bytes);
    let _ = file.unlock();
    result?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn length_encoding_roundtrips_any_u32(n in any::<u32>()) {
            let mut out = Vec::new();
            write_length(&mut out, n);
            let (decoded, _) = read_length(&mut &out[..]).unwrap();
            prop_assert_eq!(decoded, n);
        }
    }

    #[test]
    fn length_encoding_roundtrips_6_bit() {
        let mut out = Vec::new();
        write_length(&mut out, 42);
        let (len, enc) = read_length(&mut &out[..]).unwrap();
        assert_eq!(len, 42);
        assert_eq!(enc, LengthEncoding::Direct);
    }

    #[test]
    fn length_encoding_roundtrips_14_bit() {
        let mut out = Vec::new();
        write_length(&mut out, 10_000);
        let (len, _) = read_length(&mut &out[..]).unwrap();
        assert_eq!(len, 10_000);
    }

    #[test]
    fn length_encoding_roundtrips_32_bit() {
        let mut out = Vec::new();
        write_length(&mut out, 5_000_000);
        let (len, _) = read_length(&mut &out[..]).unwrap();
        assert_eq!(len, 5_000_000);
    }

    #[test]
    fn string_encoding_roundtrips_integer_shaped_string() {
        let mut out = Vec::new();
        write_string(&mut out, b"123");
        let decoded = read_string(&mut &out[..]).unwrap();
        assert_eq!(decoded, b"123");
    }

    #[test]
    fn string_encoding_roundtrips_plain_text() {
        let mut out = Vec::new();
        write_string(&mut out, b"hello");
        let decoded = read_string(&mut &out[..]).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let mut hash = HashMap::new();
        hash.insert("x".to_string(), Bytes::from_static(b"y"));
        let entries = vec![
            ("a".to_string(), Value::Str(Bytes::from_static(b"1")), None),
            ("b".to_string(), Value::Str(Bytes::from_static(b"hello")), None),
            ("h".to_string(), Value::Hash(hash), None),
        ];
        let bytes = marshal(&entries);
        assert!(bytes.starts_with(b"REDIS0011"));
        let restored = unmarshal(&bytes).unwrap();
        assert_eq!(restored.len(), 3);
        let get = |k: &str| restored.iter().find(|(key, _, _)| key == k).map(|(_, v, _)| v.clone());
        assert_eq!(get("a"), Some(Value::Str(Bytes::from_static(b"1"))));
        assert_eq!(get("b"), Some(Value::Str(Bytes::from_static(b"hello"))));
    }

    #[test]
    fn empty_store_marshals_to_minimal_valid_rdb() {
        let bytes = marshal(&[]);
        let restored = unmarshal(&bytes).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn expired_entry_is_skipped_on_marshal() {
        let past = Instant::now() - Duration::from_secs(10);
        let entries = vec![("gone".to_string(), Value::Str(Bytes::from_static(b"x")), Some(past))];
        let bytes = marshal(&entries);
        let restored = unmarshal(&bytes).unwrap();
        assert!(restored.is_empty());
    }
}
