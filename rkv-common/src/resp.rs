//! # RESP2 Wire Protocol
//!
//! Purpose: One shared implementation of the Redis RESP2 wire format, used by
//! the server's inbound request parser, the AOF reader/writer, the sync
//! client, and the cluster router's peer protocol.
//!
//! ## Design Principles
//! 1. **Single Source of Truth**: every component decodes/encodes the same
//!    `RespValue` shape instead of four slightly different parsers drifting
//!    apart.
//! 2. **Incremental Parsing**: `RequestParser` consumes whatever bytes are
//!    available and reports `Ok(None)` when more input is needed, so it
//!    works the same whether fed by a blocking socket read or an async one.
//! 3. **Dual Framing**: both the inline form (a single CRLF-terminated line,
//!    space-separated) and the standard multibulk array form are accepted
//!    for requests, matching real Redis clients and `redis-cli`.

use bytes::{Buf, BytesMut};

use crate::error::{RkvError, RkvResult};

/// A single RESP2 reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK\r\n` style simple string.
    Simple(Vec<u8>),
    /// `-ERR message\r\n` style error.
    Error(Vec<u8>),
    /// `:123\r\n` style integer.
    Integer(i64),
    /// `$5\r\nhello\r\n` style bulk string, or `$-1\r\n` for a null.
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...\r\n` style array, or `*-1\r\n` for a null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple(b"OK".to_vec())
    }

    pub fn null_bulk() -> Self {
        RespValue::Bulk(None)
    }

    pub fn null_array() -> Self {
        RespValue::Array(None)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn from_error(err: &RkvError) -> Self {
        RespValue::Error(err.wire_message().into_bytes())
    }

    /// Encodes this value into `out` following RESP2 framing.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
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
                    item.encode(out);
                }
            }
        }
    }
}

/// Encodes a command as a RESP2 multibulk array, the form every real Redis
/// client sends for requests.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one full RESP2 reply from a blocking, buffered reader. Used by the
/// sync client and by the cluster router when forwarding to peers.
pub fn read_reply<R: std::io::BufRead>(reader: &mut R) -> RkvResult<RespValue> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.is_empty() {
        return Err(RkvError::Protocol("empty reply line".into()));
    }
    let prefix = line[0];
    let rest = &line[1..];
    match prefix {
        b'+' => Ok(RespValue::Simple(rest.to_vec())),
        b'-' => Ok(RespValue::Error(rest.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_bulk_len(rest)?;
            match len {
                None => Ok(RespValue::Bulk(None)),
                Some(len) => {
                    let mut data = vec![0u8; len];
                    reader.read_exact(&mut data)?;
                    let mut crlf = [0u8; 2];
                    reader.read_exact(&mut crlf)?;
                    if crlf != *b"\r\n" {
                        return Err(RkvError::Protocol("missing bulk terminator".into()));
                    }
                    Ok(RespValue::Bulk(Some(data)))
                }
            }
        }
        b'*' => {
            let len = parse_array_len(rest)?;
            match len {
                None => Ok(RespValue::Array(None)),
                Some(len) => {
                    let mut items = Vec::with_capacity(len);
                    for _ in 0..len {
                        items.push(read_reply(reader)?);
                    }
                    Ok(RespValue::Array(Some(items)))
                }
            }
        }
        other => Err(RkvError::Protocol(format!(
            "unexpected reply prefix '{}'",
            other as char
        ))),
    }
}

fn read_line<R: std::io::BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> RkvResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(RkvError::Protocol("unexpected eof".into()));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(RkvError::Protocol("line missing CRLF terminator".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> RkvResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RkvError::Protocol("invalid integer".into()))
}

fn parse_bulk_len(data: &[u8]) -> RkvResult<Option<usize>> {
    let value = parse_i64(data)?;
    if value < 0 {
        Ok(None)
    } else {
        Ok(Some(value as usize))
    }
}

fn parse_array_len(data: &[u8]) -> RkvResult<Option<usize>> {
    parse_bulk_len(data)
}

/// Incremental parser for inbound requests, accepting either the inline form
/// or the standard multibulk array form. Feeds off whatever bytes are
/// currently buffered and reports `Ok(None)` when a full request has not
/// arrived yet.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
}

#[derive(Debug)]
enum ParseState {
    /// Waiting for the first byte of a new request.
    Idle,
    /// Reading a multibulk array: how many bulk arguments remain, and the
    /// ones already parsed.
    ReadingArray { remaining: usize, args: Vec<Vec<u8>> },
    /// Reading the `$<len>\r\n` header for the next bulk argument.
    ReadingBulkHeader { remaining: usize, args: Vec<Vec<u8>> },
    /// Reading the bulk argument body plus its trailing CRLF.
    ReadingBulkBody {
        remaining: usize,
        args: Vec<Vec<u8>>,
        len: usize,
    },
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState::Idle
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to parse one complete request out of `buf`. Consumes the
    /// bytes belonging to that request on success; leaves `buf` untouched
    /// (aside from whatever was already consumed mid-request) when more
    /// data is needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> RkvResult<Option<Vec<Vec<u8>>>> {
        loop {
            match &mut self.state {
                ParseState::Idle => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(None);
                    };
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    if buf[0] == b'*' {
                        let len = parse_i64(&buf[1..line_end])?;
                        buf.advance(line_end + 2);
                        if len <= 0 {
                            return Ok(Some(Vec::new()));
                        }
                        self.state = ParseState::ReadingArray {
                            remaining: len as usize,
                            args: Vec::with_capacity(len as usize),
                        };
                    } else {
                        // Inline command: one line, whitespace-separated.
                        let line = buf.split_to(line_end + 2);
                        let line = &line[..line.len() - 2];
                        let args = line
                            .split(|b| *b == b' ')
                            .filter(|piece| !piece.is_empty())
                            .map(|piece| piece.to_vec())
                            .collect();
                        return Ok(Some(args));
                    }
                }
                ParseState::ReadingArray { remaining, args } => {
                    if *remaining == 0 {
                        let args = std::mem::take(args);
                        self.state = ParseState::Idle;
                        return Ok(Some(args));
                    }
                    let remaining = *remaining;
                    let args = std::mem::take(args);
                    self.state = ParseState::ReadingBulkHeader { remaining, args };
                }
                ParseState::ReadingBulkHeader { remaining, args } => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(None);
                    };
                    if buf.is_empty() || buf[0] != b'$' {
                        return Err(RkvError::Protocol("expected bulk string".into()));
                    }
                    let len = parse_i64(&buf[1..line_end])?;
                    if len < 0 {
                        return Err(RkvError::Protocol("negative bulk length".into()));
                    }
                    buf.advance(line_end + 2);
                    let remaining = *remaining;
                    let args = std::mem::take(args);
                    self.state = ParseState::ReadingBulkBody {
                        remaining,
                        args,
                        len: len as usize,
                    };
                }
                ParseState::ReadingBulkBody {
                    remaining,
                    args,
                    len,
                } => {
                    if buf.len() < *len + 2 {
                        return Ok(None);
                    }
                    let data = buf.split_to(*len).to_vec();
                    if &buf[..2] != b"\r\n" {
                        return Err(RkvError::Protocol("missing bulk terminator".into()));
                    }
                    buf.advance(2);
                    let mut args = std::mem::take(args);
                    args.push(data);
                    let remaining = *remaining - 1;
                    self.state = ParseState::ReadingArray { remaining, args };
                }
            }
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_simple_and_bulk() {
        let mut out = Vec::new();
        RespValue::ok().encode(&mut out);
        assert_eq!(out, b"+OK\r\n");

        out.clear();
        RespValue::bulk(b"hi".to_vec()).encode(&mut out);
        assert_eq!(out, b"$2\r\nhi\r\n");

        out.clear();
        RespValue::null_bulk().encode(&mut out);
        assert_eq!(out, b"$-1\r\n");
    }

    #[test]
    fn parses_multibulk_request() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"[..]);
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
    }

    #[test]
    fn parses_inline_request() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"PING".to_vec()]);
    }

    #[test]
    fn returns_none_on_partial_input() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"o\r\n");
        let args = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
    }

    #[test]
    fn round_trips_through_read_reply() {
        let mut out = Vec::new();
        RespValue::Array(Some(vec![
            RespValue::Integer(1),
            RespValue::bulk(b"a".to_vec()),
        ]))
        .encode(&mut out);
        let mut reader = std::io::Cursor::new(out);
        let value = read_reply(&mut reader).unwrap();
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::Integer(1),
                RespValue::bulk(b"a".to_vec())
            ]))
        );
    }
}
