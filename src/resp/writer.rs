//! Request serializer.
//!
//! Encodes a command name plus arguments into the multi-bulk request
//! framing: `*<argc>\r\n$<len>\r\narg\r\n…`. All-text commands are
//! assembled into one contiguous buffer and written in a single call;
//! when any argument is a raw byte payload the encoder emits header
//! segments and passes the payload `Bytes` through untouched, so large
//! values never cross an intermediate copy.

use bytes::Bytes;
use itoa::Buffer as IntBuffer;

use crate::command::Arg;

/// Encoder output: one buffer, or an ordered list of write segments.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Single(Bytes),
    Chunks(Vec<Bytes>),
}

impl Encoded {
    /// Total number of bytes across all segments.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Single(buf) => buf.len(),
            Self::Chunks(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    /// Flatten into the segment list handed to the transport writer.
    pub fn into_chunks(self) -> Vec<Bytes> {
        match self {
            Self::Single(buf) => vec![buf],
            Self::Chunks(chunks) => chunks,
        }
    }

    /// Collapse into one contiguous buffer (tests and diagnostics).
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Self::Single(buf) => buf.to_vec(),
            Self::Chunks(chunks) => {
                let mut out = Vec::with_capacity(self.byte_len());
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
                out
            }
        }
    }
}

/// Encode `(name, args)` into wire framing.
pub fn encode(name: &str, args: &[Arg]) -> Encoded {
    if args.iter().any(Arg::is_blob) {
        encode_segmented(name, args)
    } else {
        encode_single(name, args)
    }
}

/// Fast path: every argument is text, one buffer, one write.
fn encode_single(name: &str, args: &[Arg]) -> Encoded {
    // Precalculate capacity so the buffer never reallocates.
    let mut cap = 1 + 10 + 2 + bulk_len(name.len());
    for arg in args {
        cap += bulk_len(arg.len());
    }

    let mut buf = Vec::with_capacity(cap);
    let mut ints = IntBuffer::new();

    buf.push(b'*');
    buf.extend_from_slice(ints.format(args.len() + 1).as_bytes());
    buf.extend_from_slice(b"\r\n");
    push_bulk(&mut buf, &mut ints, name.as_bytes());
    for arg in args {
        push_bulk(&mut buf, &mut ints, arg.as_bytes());
    }

    Encoded::Single(Bytes::from(buf))
}

/// Segmented path: headers coalesce into text runs, blob payloads pass
/// through as their own write segments.
fn encode_segmented(name: &str, args: &[Arg]) -> Encoded {
    let mut chunks = Vec::with_capacity(args.len() + 2);
    let mut run: Vec<u8> = Vec::with_capacity(64);
    let mut ints = IntBuffer::new();

    run.push(b'*');
    run.extend_from_slice(ints.format(args.len() + 1).as_bytes());
    run.extend_from_slice(b"\r\n");
    push_bulk(&mut run, &mut ints, name.as_bytes());

    for arg in args {
        match arg {
            Arg::Text(text) => push_bulk(&mut run, &mut ints, text.as_bytes()),
            Arg::Blob(payload) => {
                run.push(b'$');
                run.extend_from_slice(ints.format(payload.len()).as_bytes());
                run.extend_from_slice(b"\r\n");
                chunks.push(Bytes::from(std::mem::take(&mut run)));
                chunks.push(payload.clone());
                run.extend_from_slice(b"\r\n");
            }
        }
    }

    if !run.is_empty() {
        chunks.push(Bytes::from(run));
    }
    Encoded::Chunks(chunks)
}

#[inline]
fn bulk_len(payload: usize) -> usize {
    1 + 10 + 2 + payload + 2
}

#[inline]
fn push_bulk(buf: &mut Vec<u8>, ints: &mut IntBuffer, payload: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(ints.format(payload.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}

// ── Tests ──────────────────────────────────────────────────────────
