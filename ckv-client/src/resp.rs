//! # RESP2 Framing
//!
//! Purpose: Frame requests and parse replies on top of any `Transport`.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Callers pass the per-connection scratch buffers.
//! 2. **Binary-Safe**: Bulk strings are raw bytes.
//! 3. **Fail Fast**: Any framing violation is a `CacheError::Protocol`, which marks the
//!    transport failed so it never returns to its pool half-read.

use std::io::BufRead;

use ckv_common::{CacheError, CacheResult};

/// Upper bound for a single bulk string or array announced by the server.
const MAX_FRAME_LEN: i64 = 512 * 1024 * 1024;

/// Parsed RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status replies.
    Simple(Vec<u8>),
    /// `-ERR ...` replies.
    Error(Vec<u8>),
    /// `:123` replies.
    Integer(i64),
    /// `$...` bulk strings, `None` for the null bulk.
    Bulk(Option<Vec<u8>>),
    /// `*...` arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Converts an error reply into `CacheError::Server`, passing others through.
    pub fn into_result(self) -> CacheResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(CacheError::Server(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            other => Ok(other),
        }
    }
}

/// Appends a RESP2 array-of-bulk-strings command to `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    write_header(out, b'*', args.len());
    for arg in args {
        write_header(out, b'$', arg.len());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads exactly one reply.
pub fn read_response<R: BufRead + ?Sized>(reader: &mut R, line: &mut Vec<u8>) -> CacheResult<RespValue> {
    read_line(reader, line)?;
    let (&tag, rest) = line
        .split_first()
        .ok_or_else(|| CacheError::Protocol("empty reply line".into()))?;

    match tag {
        b'+' => Ok(RespValue::Simple(rest.to_vec())),
        b'-' => Ok(RespValue::Error(rest.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_i64(rest)?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(rest)?;
            if len < 0 {
                return Ok(RespValue::Array(Vec::new()));
            }
            check_len(len)?;
            let mut items = Vec::with_capacity(len.min(64) as usize);
            for _ in 0..len {
                items.push(read_response(reader, line)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(CacheError::Protocol(format!("unknown reply tag {:#04x}", other))),
    }
}

fn read_bulk<R: BufRead + ?Sized>(reader: &mut R, len: i64) -> CacheResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    check_len(len)?;
    // Payload plus trailing CRLF in one read.
    let mut data = vec![0u8; len as usize + 2];
    reader.read_exact(&mut data)?;
    if !data.ends_with(b"\r\n") {
        return Err(CacheError::Protocol("bulk string missing CRLF".into()));
    }
    data.truncate(len as usize);
    Ok(RespValue::Bulk(Some(data)))
}

fn read_line<R: BufRead + ?Sized>(reader: &mut R, buf: &mut Vec<u8>) -> CacheResult<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Err(CacheError::Protocol("connection closed by server".into()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(CacheError::Protocol("reply line missing CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn check_len(len: i64) -> CacheResult<()> {
    if len > MAX_FRAME_LEN {
        return Err(CacheError::Protocol(format!("frame length {} too large", len)));
    }
    Ok(())
}

fn parse_i64(data: &[u8]) -> CacheResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| CacheError::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(data))))
}

fn write_header(out: &mut Vec<u8>, tag: u8, len: usize) {
    out.push(tag);
    out.extend_from_slice(len.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}
