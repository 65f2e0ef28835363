//! Incremental HTTP/1.x integrity checking.
//!
//! The checker is called against the same receive buffer as bytes arrive.
//! The first call of a message parses the start line, the header block and
//! as much body as is available. For chunked messages each later call
//! (`had_header == true`) parses exactly one chunk segment starting at the
//! front of the buffer.
//!
//! When the header block of a chunked message is complete but its first
//! chunk is not, the checker returns `Shortage` with
//! [`HttpMessage::consumed`] set to the header length. The caller drops
//! those bytes and continues in chunk mode.

use crate::integrity::IntegrityResult;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Ordered header multimap; duplicate names are kept in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any earlier value with the same name
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name` in arrival order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all headers in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no header was parsed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all headers
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Parsed view of an HTTP message or of one chunk of it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessage {
    /// Whether the message body uses chunked transfer encoding
    pub is_chunked: bool,
    /// First two tokens of the start line: (method, target) for requests,
    /// (version, status code) for responses
    pub common_line: (String, String),
    /// Header fields
    pub headers: HttpHeaders,
    /// Body bytes, or the data of the current chunk
    pub body: Bytes,
    /// Bytes of the input committed by the last call
    pub consumed: usize,
}

impl HttpMessage {
    /// Reset every field before parsing a new message
    pub fn reset(&mut self) {
        self.is_chunked = false;
        self.common_line.0.clear();
        self.common_line.1.clear();
        self.headers.clear();
        self.body = Bytes::new();
        self.consumed = 0;
    }

    /// Whether the start line was a status line
    pub fn is_response(&self) -> bool {
        self.common_line.0.starts_with("HTTP/")
    }

    /// Whether this is the terminating zero-length chunk
    pub fn is_last_chunk(&self) -> bool {
        self.is_chunked && self.body.is_empty()
    }
}

impl fmt::Display for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ common_line=({}, {}), is_chunked={}, headers={}, body_len={}, consumed={} }}",
            self.common_line.0,
            self.common_line.1,
            self.is_chunked,
            self.headers.len(),
            self.body.len(),
            self.consumed
        )
    }
}

/// Check an HTTP receive buffer.
///
/// `Success(n)` means `n` bytes form a complete message (or one complete
/// chunk when `had_header` is set); `msg.consumed == n`.
pub fn check_http(
    buf: &[u8],
    capacity: usize,
    had_header: bool,
    msg: &mut HttpMessage,
) -> IntegrityResult {
    if had_header {
        msg.is_chunked = true;
        msg.body = Bytes::new();
        msg.consumed = 0;
        return match parse_chunk(buf, capacity) {
            ChunkResult::Complete { consumed, data } => {
                msg.body = Bytes::copy_from_slice(data);
                msg.consumed = consumed;
                IntegrityResult::Success(consumed)
            }
            ChunkResult::Shortage(need) => IntegrityResult::Shortage(need),
            ChunkResult::Corruption => IntegrityResult::Corruption,
        };
    }

    msg.reset();

    let header_end = match find(buf, HEADER_END) {
        Some(pos) => pos,
        None => {
            if buf.len() >= capacity {
                return IntegrityResult::Corruption;
            }
            return IntegrityResult::Shortage(1);
        }
    };
    let header_len = header_end + HEADER_END.len();
    if header_len > capacity {
        return IntegrityResult::Corruption;
    }

    if parse_head(&buf[..header_end], msg).is_none() {
        trace!("malformed HTTP head ({} bytes)", header_end);
        msg.reset();
        return IntegrityResult::Corruption;
    }

    if msg.is_chunked {
        return match parse_chunk(&buf[header_len..], capacity - header_len) {
            ChunkResult::Complete { consumed, data } => {
                msg.body = Bytes::copy_from_slice(data);
                msg.consumed = header_len + consumed;
                IntegrityResult::Success(msg.consumed)
            }
            ChunkResult::Shortage(need) => {
                msg.consumed = header_len;
                IntegrityResult::Shortage(need)
            }
            ChunkResult::Corruption => IntegrityResult::Corruption,
        };
    }

    let content_length = match msg.headers.get("Content-Length") {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(len) => len,
            Err(_) => {
                trace!("bad Content-Length {:?}", value);
                return IntegrityResult::Corruption;
            }
        },
        None => 0,
    };

    let total = match header_len.checked_add(content_length) {
        Some(total) if total <= capacity => total,
        _ => return IntegrityResult::Corruption,
    };

    if buf.len() < total {
        return IntegrityResult::Shortage(total - buf.len());
    }

    msg.body = Bytes::copy_from_slice(&buf[header_len..total]);
    msg.consumed = total;
    IntegrityResult::Success(total)
}

/// Parse start line and header fields; `None` on malformed input
fn parse_head(head: &[u8], msg: &mut HttpMessage) -> Option<()> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");

    let start_line = lines.next()?;
    let mut tokens = start_line.split_whitespace();
    let first = tokens.next()?;
    let second = tokens.next()?;
    msg.common_line = (first.to_string(), second.to_string());

    for line in lines {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        msg.headers.push(name, value.trim());
    }

    msg.is_chunked = msg
        .headers
        .get_all("Transfer-Encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    Some(())
}

enum ChunkResult<'a> {
    Complete { consumed: usize, data: &'a [u8] },
    Shortage(usize),
    Corruption,
}

/// Parse one `size CRLF data CRLF` segment at the front of `buf`
fn parse_chunk(buf: &[u8], capacity: usize) -> ChunkResult<'_> {
    let line_end = match find(buf, CRLF) {
        Some(pos) => pos,
        None => {
            if buf.len() >= capacity {
                return ChunkResult::Corruption;
            }
            return ChunkResult::Shortage(1);
        }
    };

    let size_line = match std::str::from_utf8(&buf[..line_end]) {
        Ok(line) => line,
        Err(_) => return ChunkResult::Corruption,
    };
    // Chunk extensions are ignored
    let size_str = size_line.split(';').next().unwrap_or("").trim();
    let size = match usize::from_str_radix(size_str, 16) {
        Ok(size) => size,
        Err(_) => return ChunkResult::Corruption,
    };
    let data_start = line_end + CRLF.len();

    if size == 0 {
        // Last chunk: optional trailers, then an empty line
        let rest = &buf[data_start..];
        if rest.starts_with(CRLF) {
            return ChunkResult::Complete {
                consumed: data_start + CRLF.len(),
                data: &[],
            };
        }
        return match find(rest, HEADER_END) {
            Some(pos) => ChunkResult::Complete {
                consumed: data_start + pos + HEADER_END.len(),
                data: &[],
            },
            None if buf.len() >= capacity => ChunkResult::Corruption,
            None if rest.len() < CRLF.len() => ChunkResult::Shortage(CRLF.len() - rest.len()),
            None => ChunkResult::Shortage(1),
        };
    }

    let total = match data_start
        .checked_add(size)
        .and_then(|n| n.checked_add(CRLF.len()))
    {
        Some(total) if total <= capacity => total,
        _ => return ChunkResult::Corruption,
    };

    if buf.len() < total {
        return ChunkResult::Shortage(total - buf.len());
    }

    if &buf[data_start + size..total] != CRLF {
        return ChunkResult::Corruption;
    }

    ChunkResult::Complete {
        consumed: total,
        data: &buf[data_start..data_start + size],
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Encode a response with a `Content-Length` body
pub fn build_response(status: u16, reason: &str, headers: &HttpHeaders, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.freeze()
}
