//! Streaming RESP reply parsers.
//!
//! Both parsers are push-based: the connection engine feeds them raw
//! byte chunks exactly as they arrive off the socket, and they emit
//! zero or more decoded replies per chunk. Input may be fragmented at
//! any byte boundary, including inside a length header or a bulk
//! payload.
//!
//! Two implementations satisfy the same [`ReplyParser`] contract and
//! are selected by name at client creation:
//!
//! - [`StreamParser`] (default, `"stream"`) keeps an explicit stack of
//!   open arrays, so elements decoded before a chunk boundary are never
//!   reparsed.
//! - [`BufferedParser`] (`"buffered"`) accumulates input and re-attempts
//!   a whole-value parse, treating "incomplete" as control flow.
//!
//! Bulk payloads are ref-counted slices of the accumulation buffer
//! (`Bytes`), not copies. A malformed frame is fatal: the engine tears
//! the connection down.

use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;

use crate::error::{RedlinkError, Result};
use crate::resp::types::Reply;

/// One output of a parser push.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// A complete decoded reply.
    Reply(Reply),
    /// A top-level `-` error frame, routed to the error callback side
    /// of the contract. Errors nested inside arrays stay embedded as
    /// [`Reply::Error`] elements.
    ErrorReply(String),
}

/// Push-based reply decoder.
pub trait ReplyParser: Send {
    /// Consume one chunk, appending decoded events to `out`.
    ///
    /// An `Err` return is a framing violation; the parser state is
    /// unspecified afterwards and the connection must be torn down.
    fn execute(&mut self, chunk: &[u8], out: &mut Vec<ParserEvent>) -> Result<()>;
}

/// Parser implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserKind {
    #[default]
    Stream,
    Buffered,
}

impl ParserKind {
    /// Look a parser up by its registered name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stream" => Some(Self::Stream),
            "buffered" => Some(Self::Buffered),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Buffered => "buffered",
        }
    }
}

/// Instantiate the parser selected by `kind`.
pub fn build(kind: ParserKind) -> Box<dyn ReplyParser> {
    match kind {
        ParserKind::Stream => Box::new(StreamParser::new()),
        ParserKind::Buffered => Box::new(BufferedParser::new()),
    }
}

// ── Shared scanning helpers ────────────────────────────────────────

/// Find the `\r` of the next CRLF at or after `offset`.
///
/// `Ok(None)` means the terminator has not arrived yet.
fn find_crlf(buf: &[u8], offset: usize) -> Result<Option<usize>> {
    match memchr(b'\r', &buf[offset.min(buf.len())..]) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 >= buf.len() {
                Ok(None)
            } else if buf[abs + 1] == b'\n' {
                Ok(Some(abs))
            } else {
                Err(RedlinkError::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Ok(None),
    }
}

/// Parse a decimal integer from a header line without allocating.
fn parse_int(line: &[u8]) -> Result<i64> {
    let (negative, digits) = match line.first() {
        Some(b'-') => (true, &line[1..]),
        Some(b'+') => (false, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(RedlinkError::Protocol("integer has no digits".into()));
    }

    // Accumulate negative so i64::MIN survives; negate at the end.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RedlinkError::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RedlinkError::Protocol("integer overflow".into()))?;
    }
    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| RedlinkError::Protocol("integer overflow".into()))
    }
}

fn line_to_string(line: &[u8]) -> Result<String> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|e| RedlinkError::Protocol(format!("invalid UTF-8 in status line: {e}")))
}

fn unknown_prefix(byte: u8) -> RedlinkError {
    RedlinkError::Protocol(format!("unknown reply type byte: 0x{byte:02x}"))
}

/// Fold a finished value into the enclosing array stack.
///
/// Returns the completed top-level value once no open array remains.
fn fold_into_stack(stack: &mut Vec<ArrayFrame>, mut value: Reply) -> Option<Reply> {
    loop {
        match stack.last_mut() {
            None => return Some(value),
            Some(frame) => {
                frame.items.push(value);
                if frame.items.len() < frame.expected {
                    return None;
                }
                let frame = stack.pop().expect("frame just inspected");
                value = Reply::Array(frame.items);
            }
        }
    }
}

fn emit(out: &mut Vec<ParserEvent>, value: Reply) {
    match value {
        Reply::Error(message) => out.push(ParserEvent::ErrorReply(message)),
        other => out.push(ParserEvent::Reply(other)),
    }
}

/// An array whose elements are still arriving.
#[derive(Debug)]
struct ArrayFrame {
    expected: usize,
    items: Vec<Reply>,
}

// ── StreamParser ───────────────────────────────────────────────────

/// Incremental parser with an explicit array stack.
///
/// Consumes each node from the front of its buffer as soon as the node
/// is complete, so a multi-megabyte array fragmented across hundreds of
/// chunks decodes each element exactly once.
pub struct StreamParser {
    buf: BytesMut,
    stack: Vec<ArrayFrame>,
    /// Scan position hint for a line terminator that has not arrived
    /// yet, so repeated pushes do not rescan the same bytes.
    scanned: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            stack: Vec::new(),
            scanned: 0,
        }
    }

    /// Try to decode one node at the front of the buffer.
    ///
    /// `Ok(None)` means more input is required; nothing was consumed.
    fn step(&mut self) -> Result<Option<Reply>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let prefix = self.buf[0];
        match prefix {
            b'+' | b'-' | b':' => {
                let start = self.scanned.max(1);
                let cr = match find_crlf(&self.buf, start)? {
                    Some(cr) => cr,
                    None => {
                        self.scanned = self.buf.len().saturating_sub(1);
                        return Ok(None);
                    }
                };
                let line = &self.buf[1..cr];
                let value = match prefix {
                    b'+' => Reply::Simple(line_to_string(line)?),
                    b'-' => Reply::Error(line_to_string(line)?),
                    _ => Reply::Int(parse_int(line)?),
                };
                self.consume(cr + 2);
                Ok(Some(value))
            }
            b'$' => {
                let cr = match find_crlf(&self.buf, 1)? {
                    Some(cr) => cr,
                    None => return Ok(None),
                };
                let len = parse_int(&self.buf[1..cr])?;
                if len < 0 {
                    self.consume(cr + 2);
                    return Ok(Some(Reply::Nil));
                }
                let len = len as usize;
                let total = cr + 2 + len + 2;
                if self.buf.len() < total {
                    return Ok(None);
                }
                if &self.buf[total - 2..total] != b"\r\n" {
                    return Err(RedlinkError::Protocol(
                        "bulk payload not terminated by \\r\\n".into(),
                    ));
                }
                self.buf.advance(cr + 2);
                let payload = self.buf.split_to(len).freeze();
                self.buf.advance(2);
                self.scanned = 0;
                Ok(Some(Reply::Bulk(payload)))
            }
            b'*' => {
                let cr = match find_crlf(&self.buf, 1)? {
                    Some(cr) => cr,
                    None => return Ok(None),
                };
                let count = parse_int(&self.buf[1..cr])?;
                self.consume(cr + 2);
                if count < 0 {
                    return Ok(Some(Reply::Nil));
                }
                if count == 0 {
                    return Ok(Some(Reply::Array(Vec::new())));
                }
                self.stack.push(ArrayFrame {
                    expected: count as usize,
                    items: Vec::with_capacity(count as usize),
                });
                // No value produced yet; the elements follow.
                self.step_after_open()
            }
            other => Err(unknown_prefix(other)),
        }
    }

    /// After opening an array frame, keep stepping so that elements
    /// already in the buffer are folded immediately.
    fn step_after_open(&mut self) -> Result<Option<Reply>> {
        loop {
            match self.step()? {
                None => return Ok(None),
                Some(value) => match fold_into_stack(&mut self.stack, value) {
                    Some(done) => return Ok(Some(done)),
                    None => continue,
                },
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.advance(n);
        self.scanned = 0;
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser for StreamParser {
    fn execute(&mut self, chunk: &[u8], out: &mut Vec<ParserEvent>) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        loop {
            match self.step()? {
                None => return Ok(()),
                Some(value) => match fold_into_stack(&mut self.stack, value) {
                    Some(done) => emit(out, done),
                    None => continue,
                },
            }
        }
    }
}

// ── BufferedParser ─────────────────────────────────────────────────

/// Accumulating parser: appends each chunk, then repeatedly attempts a
/// whole-value parse from the front, backing off when the buffer is
/// still incomplete.
pub struct BufferedParser {
    buf: BytesMut,
}

impl BufferedParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Parse one value from the front of `buf`.
    ///
    /// `Ok(None)` means the buffer is too short; callers should push
    /// more data and retry.
    fn parse(buf: &Bytes) -> Result<Option<(Reply, usize)>> {
        let Some(&prefix) = buf.first() else {
            return Ok(None);
        };
        match prefix {
            b'+' | b'-' | b':' => {
                let Some(cr) = find_crlf(buf, 1)? else {
                    return Ok(None);
                };
                let line = &buf[1..cr];
                let value = match prefix {
                    b'+' => Reply::Simple(line_to_string(line)?),
                    b'-' => Reply::Error(line_to_string(line)?),
                    _ => Reply::Int(parse_int(line)?),
                };
                Ok(Some((value, cr + 2)))
            }
            b'$' => {
                let Some(cr) = find_crlf(buf, 1)? else {
                    return Ok(None);
                };
                let len = parse_int(&buf[1..cr])?;
                if len < 0 {
                    return Ok(Some((Reply::Nil, cr + 2)));
                }
                let len = len as usize;
                let data_start = cr + 2;
                let total = data_start + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                if &buf[total - 2..total] != b"\r\n" {
                    return Err(RedlinkError::Protocol(
                        "bulk payload not terminated by \\r\\n".into(),
                    ));
                }
                // Ref-counted slice of the accumulation buffer.
                let payload = buf.slice(data_start..data_start + len);
                Ok(Some((Reply::Bulk(payload), total)))
            }
            b'*' => {
                let Some(cr) = find_crlf(buf, 1)? else {
                    return Ok(None);
                };
                let count = parse_int(&buf[1..cr])?;
                let mut next = cr + 2;
                if count < 0 {
                    return Ok(Some((Reply::Nil, next)));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let sub = buf.slice(next..);
                    match Self::parse(&sub)? {
                        Some((value, consumed)) => {
                            items.push(value);
                            next += consumed;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Reply::Array(items), next)))
            }
            other => Err(unknown_prefix(other)),
        }
    }
}

impl Default for BufferedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser for BufferedParser {
    fn execute(&mut self, chunk: &[u8], out: &mut Vec<ParserEvent>) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        loop {
            if self.buf.is_empty() {
                return Ok(());
            }
            let snapshot = self.buf.split().freeze();
            match Self::parse(&snapshot)? {
                Some((value, consumed)) => {
                    if consumed < snapshot.len() {
                        self.buf.extend_from_slice(&snapshot[consumed..]);
                    }
                    emit(out, value);
                }
                None => {
                    // Still waiting for more data.
                    self.buf.extend_from_slice(&snapshot);
                    return Ok(());
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the same input through both parsers and assert identical
    /// output.
    fn parse_all(input: &[u8]) -> Vec<ParserEvent> {
        let mut stream = StreamParser::new();
        let mut buffered = BufferedParser::new();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        stream.execute(input, &mut a).unwrap();
        buffered.execute(input, &mut b).unwrap();
        assert_eq!(a, b, "parser implementations disagree");
        a
    }

    /// Feed the input one byte at a time through both parsers.
    fn parse_fragmented(input: &[u8]) -> Vec<ParserEvent> {
        let mut stream = StreamParser::new();
        let mut buffered = BufferedParser::new();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        for byte in input {
            stream.execute(std::slice::from_ref(byte), &mut a).unwrap();
            buffered.execute(std::slice::from_ref(byte), &mut b).unwrap();
        }
        assert_eq!(a, b, "parser implementations disagree under fragmentation");
        a
    }

    fn reply(events: Vec<ParserEvent>) -> Reply {
        assert_eq!(events.len(), 1);
        match events.into_iter().next().unwrap() {
            ParserEvent::Reply(r) => r,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn simple_string() {
        assert_eq!(reply(parse_all(b"+OK\r\n")), Reply::Simple("OK".into()));
    }

    #[test]
    fn simple_string_empty() {
        assert_eq!(reply(parse_all(b"+\r\n")), Reply::Simple(String::new()));
    }

    #[test]
    fn error_goes_to_error_channel() {
        let events = parse_all(b"-ERR unknown command\r\n");
        assert_eq!(
            events,
            vec![ParserEvent::ErrorReply("ERR unknown command".into())]
        );
    }

    #[test]
    fn integers() {
        assert_eq!(reply(parse_all(b":1000\r\n")), Reply::Int(1000));
        assert_eq!(reply(parse_all(b":-42\r\n")), Reply::Int(-42));
        assert_eq!(reply(parse_all(b":0\r\n")), Reply::Int(0));
        assert_eq!(
            reply(parse_all(b":-9223372036854775808\r\n")),
            Reply::Int(i64::MIN)
        );
    }

    #[test]
    fn integer_overflow_is_fatal() {
        let mut p = StreamParser::new();
        assert!(p
            .execute(b":9223372036854775808\r\n", &mut Vec::new())
            .is_err());
    }

    #[test]
    fn integer_garbage_is_fatal() {
        let mut p = StreamParser::new();
        assert!(p.execute(b":12a\r\n", &mut Vec::new()).is_err());
        let mut p = BufferedParser::new();
        assert!(p.execute(b":\r\n", &mut Vec::new()).is_err());
    }

    #[test]
    fn bulk_string() {
        assert_eq!(
            reply(parse_all(b"$5\r\nhello\r\n")),
            Reply::Bulk(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn bulk_string_empty() {
        assert_eq!(
            reply(parse_all(b"$0\r\n\r\n")),
            Reply::Bulk(Bytes::new())
        );
    }

    #[test]
    fn bulk_null() {
        assert_eq!(reply(parse_all(b"$-1\r\n")), Reply::Nil);
    }

    #[test]
    fn bulk_with_embedded_crlf() {
        assert_eq!(
            reply(parse_all(b"$6\r\nhe\r\nlo\r\n")),
            Reply::Bulk(Bytes::from_static(b"he\r\nlo"))
        );
    }

    #[test]
    fn bulk_bad_terminator_is_fatal() {
        let mut p = StreamParser::new();
        assert!(p.execute(b"$5\r\nhelloXX", &mut Vec::new()).is_err());
        let mut p = BufferedParser::new();
        assert!(p.execute(b"$5\r\nhelloXX", &mut Vec::new()).is_err());
    }

    #[test]
    fn array_null_and_empty() {
        assert_eq!(reply(parse_all(b"*-1\r\n")), Reply::Nil);
        assert_eq!(reply(parse_all(b"*0\r\n")), Reply::Array(vec![]));
    }

    #[test]
    fn array_mixed() {
        assert_eq!(
            reply(parse_all(b"*3\r\n:1\r\n$5\r\nhello\r\n+OK\r\n")),
            Reply::Array(vec![
                Reply::Int(1),
                Reply::Bulk(Bytes::from_static(b"hello")),
                Reply::Simple("OK".into()),
            ])
        );
    }

    #[test]
    fn array_nested() {
        assert_eq!(
            reply(parse_all(b"*2\r\n*2\r\n:1\r\n:2\r\n*1\r\n:3\r\n")),
            Reply::Array(vec![
                Reply::Array(vec![Reply::Int(1), Reply::Int(2)]),
                Reply::Array(vec![Reply::Int(3)]),
            ])
        );
    }

    #[test]
    fn nested_error_stays_embedded() {
        let events = parse_all(b"*2\r\n-ERR inner\r\n:1\r\n");
        assert_eq!(
            events,
            vec![ParserEvent::Reply(Reply::Array(vec![
                Reply::Error("ERR inner".into()),
                Reply::Int(1),
            ]))]
        );
    }

    #[test]
    fn multiple_replies_in_one_chunk() {
        let events = parse_all(b"+OK\r\n:42\r\n$3\r\nbar\r\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ParserEvent::Reply(Reply::Simple("OK".into())));
        assert_eq!(events[1], ParserEvent::Reply(Reply::Int(42)));
        assert_eq!(
            events[2],
            ParserEvent::Reply(Reply::Bulk(Bytes::from_static(b"bar")))
        );
    }

    #[test]
    fn byte_by_byte_fragmentation() {
        let events =
            parse_fragmented(b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n+PONG\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ParserEvent::Reply(Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"subscribe")),
                Reply::Bulk(Bytes::from_static(b"ch1")),
                Reply::Int(1),
            ]))
        );
        assert_eq!(events[1], ParserEvent::Reply(Reply::Simple("PONG".into())));
    }

    #[test]
    fn partial_array_resumes_across_chunks() {
        let mut p = StreamParser::new();
        let mut out = Vec::new();
        p.execute(b"*2\r\n$3\r\nfoo\r\n", &mut out).unwrap();
        assert!(out.is_empty());
        p.execute(b"$3\r\nbar\r\n", &mut out).unwrap();
        assert_eq!(
            out,
            vec![ParserEvent::Reply(Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"foo")),
                Reply::Bulk(Bytes::from_static(b"bar")),
            ]))]
        );
    }

    #[test]
    fn bulk_payload_split_mid_header_and_mid_body() {
        let mut p = BufferedParser::new();
        let mut out = Vec::new();
        p.execute(b"$1", &mut out).unwrap();
        p.execute(b"0\r\nabc", &mut out).unwrap();
        assert!(out.is_empty());
        p.execute(b"defghij\r\n", &mut out).unwrap();
        assert_eq!(
            out,
            vec![ParserEvent::Reply(Reply::Bulk(Bytes::from_static(
                b"abcdefghij"
            )))]
        );
    }

    #[test]
    fn unknown_prefix_is_fatal() {
        let mut p = StreamParser::new();
        assert!(p.execute(b"X123\r\n", &mut Vec::new()).is_err());
        let mut p = BufferedParser::new();
        assert!(p.execute(b"X123\r\n", &mut Vec::new()).is_err());
    }

    #[test]
    fn cr_without_lf_is_fatal() {
        let mut p = StreamParser::new();
        assert!(p.execute(b"+OK\rX\n", &mut Vec::new()).is_err());
    }

    #[test]
    fn kind_lookup() {
        assert_eq!(ParserKind::from_name("stream"), Some(ParserKind::Stream));
        assert_eq!(
            ParserKind::from_name("buffered"),
            Some(ParserKind::Buffered)
        );
        assert_eq!(ParserKind::from_name("hiredis"), None);
        assert_eq!(ParserKind::default().name(), "stream");
    }

    #[test]
    fn build_returns_working_parsers() {
        for kind in [ParserKind::Stream, ParserKind::Buffered] {
            let mut parser = build(kind);
            let mut out = Vec::new();
            parser.execute(b"+OK\r\n", &mut out).unwrap();
            assert_eq!(out, vec![ParserEvent::Reply(Reply::Simple("OK".into()))]);
        }
    }

    #[test]
    fn pubsub_push_shapes_decode() {
        let events = parse_all(
            b"*3\r\n$7\r\nmessage\r\n$3\r\nch1\r\n$5\r\nhello\r\n",
        );
        assert_eq!(
            events,
            vec![ParserEvent::Reply(Reply::Array(vec![
                Reply::Bulk(Bytes::from_static(b"message")),
                Reply::Bulk(Bytes::from_static(b"ch1")),
                Reply::Bulk(Bytes::from_static(b"hello")),
            ]))]
        );
    }

    #[test]
    fn binary_payload_preserved() {
        let input = b"$4\r\n\x00\x01\x02\xff\r\n";
        assert_eq!(
            reply(parse_all(input)),
            Reply::Bulk(Bytes::from_static(&[0x00, 0x01, 0x02, 0xff]))
        );
    }
}
