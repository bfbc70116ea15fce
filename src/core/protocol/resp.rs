use bytes::Bytes;

use crate::core::errors::RedwireError;

/// A single RESP2 value, the unit the wire codec decodes and encodes.
///
/// `Bulk(None)` and `Array(None)` are the two "null" forms the protocol defines
/// (`$-1\r\n` and `*-1\r\n`); `Get` on a missing key encodes as `Bulk(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple("OK".into())
    }

    pub fn null_bulk() -> Self {
        RespValue::Bulk(None)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(msg.into())
    }

    /// Interprets this value as a command frame: a non-empty array of bulk
    /// strings, element 0 upper-cased is the name, the rest are raw arguments.
    pub fn into_command_parts(self) -> Result<(String, Vec<Bytes>), RedwireError> {
        let RespValue::Array(Some(items)) = self else {
            return Err(RedwireError::Protocol(
                "expected array of bulk strings".into(),
            ));
        };
        if items.is_empty() {
            return Err(RedwireError::Protocol("empty command array".into()));
        }
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::Bulk(Some(b)) => parts.push(b),
                _ => return Err(RedwireError::Protocol("command element not a bulk string".into())),
            }
        }
        let name = String::from_utf8_lossy(&parts[0]).to_uppercase();
        Ok((name, parts.into_iter().skip(1).collect()))
    }
}

/// Finds the first `\r\n` in `buf`, returning the index of the `\r`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decodes one RESP value from the front of `buf`.
///
/// Returns `Ok(Some((value, consumed)))` on a complete frame, `Ok(None)` when
/// `buf` does not yet hold a complete frame (the caller should read more and
/// retry — this is the spec's `IncompleteFrame` signal), or `Err` on a
/// malformed frame (the caller closes the connection).
pub fn decode(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RedwireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let prefix = buf[0];
    let rest = &buf[1..];
    match prefix {
        b'+' => decode_line(rest, 1, |s| RespValue::Simple(s.to_string())),
        b'-' => decode_line(rest, 1, |s| RespValue::Error(s.to_string())),
        b':' => decode_integer(rest, 1),
        b'$' => decode_bulk(rest, 1),
        b'*' => decode_array(buf, rest, 1),
        other => Err(RedwireError::Protocol(format!(
            "unknown frame prefix: {other:#x}"
        ))),
    }
}

fn decode_line(
    rest: &[u8],
    prefix_len: usize,
    make: impl FnOnce(&str) -> RespValue,
) -> Result<Option<(RespValue, usize)>, RedwireError> {
    let Some(crlf) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&rest[..crlf])
        .map_err(|_| RedwireError::Protocol("non-utf8 line".into()))?;
    Ok(Some((make(line), prefix_len + crlf + 2)))
}

fn decode_integer(rest: &[u8], prefix_len: usize) -> Result<Option<(RespValue, usize)>, RedwireError> {
    let Some(crlf) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&rest[..crlf])
        .map_err(|_| RedwireError::Protocol("non-utf8 integer".into()))?;
    let value: i64 = line
        .parse()
        .map_err(|_| RedwireError::Protocol(format!("malformed integer: {line}")))?;
    Ok(Some((RespValue::Integer(value), prefix_len + crlf + 2)))
}

fn decode_bulk(rest: &[u8], prefix_len: usize) -> Result<Option<(RespValue, usize)>, RedwireError> {
    let Some(crlf) = find_crlf(rest) else {
        return Ok(None);
    };
    let len_line = std::str::from_utf8(&rest[..crlf])
        .map_err(|_| RedwireError::Protocol("non-utf8 bulk length".into()))?;
    let len: i64 = len_line
        .parse()
        .map_err(|_| RedwireError::Protocol(format!("malformed bulk length: {len_line}")))?;

    let header_len = prefix_len + crlf + 2;
    if len == -1 {
        return Ok(Some((RespValue::Bulk(None), header_len)));
    }
    if len < 0 {
        return Err(RedwireError::Protocol(format!("negative bulk length: {len}")));
    }
    let len = len as usize;
    let body_start = crlf + 2;
    let total_needed = body_start + len + 2;
    if rest.len() < total_needed {
        return Ok(None);
    }
    let data = &rest[body_start..body_start + len];
    if &rest[body_start + len..body_start + len + 2] != b"\r\n" {
        return Err(RedwireError::Protocol("bulk string missing trailing CRLF".into()));
    }
    Ok(Some((
        RespValue::Bulk(Some(Bytes::copy_from_slice(data))),
        prefix_len + total_needed,
    )))
}

fn decode_array(
    full: &[u8],
    rest: &[u8],
    prefix_len: usize,
) -> Result<Option<(RespValue, usize)>, RedwireError> {
    let Some(crlf) = find_crlf(rest) else {
        return Ok(None);
    };
    let len_line = std::str::from_utf8(&rest[..crlf])
        .map_err(|_| RedwireError::Protocol("non-utf8 array length".into()))?;
    let len: i64 = len_line
        .parse()
        .map_err(|_| RedwireError::Protocol(format!("malformed array length: {len_line}")))?;

    let mut consumed = prefix_len + crlf + 2;
    if len == -1 {
        return Ok(Some((RespValue::Array(None), consumed)));
    }
    if len < 0 {
        return Err(RedwireError::Protocol(format!("negative array length: {len}")));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let Some(remaining) = full.get(consumed..) else {
            return Ok(None);
        };
        match decode(remaining)? {
            Some((value, used)) => {
                items.push(value);
                consumed += used;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(Some(items)), consumed)))
}

/// Serializes `value` onto the end of `out`.
pub fn encode(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(data)) => {
            out.push(b'$');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode(item, out);
            }
        }
    }
}

/// Convenience: encode `value` into a freshly allocated buffer.
pub fn encode_to_vec(value: &RespValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode(value, &mut out);
    out
}

/// Encodes a command as a client would send it: an array of bulk strings.
pub fn encode_command(parts: &[&str]) -> Vec<u8> {
    let items = parts
        .iter()
        .map(|p| RespValue::bulk(p.as_bytes().to_vec()))
        .collect();
    encode_to_vec(&RespValue::Array(Some(items)))
}
