//! # Reply Decoder
//!
//! Incremental RESP2 reply parser over a queue of pooled chunks.
//!
//! The transport pushes filled chunks in arrival order; `decode` consumes
//! them positionally and returns `Ok(None)` whenever input runs out, keeping
//! enough state to resume exactly where it stopped. That includes stopping
//! between the CR and LF of a line terminator, in the middle of a length
//! header, or inside a bulk payload.
//!
//! ```text
//! chunks: [ "$5\r\nBo" ][ "om!\r" ][ "\n*2\r\n..." ]
//!            ^ pos
//! step:   Prefix -> Line(BulkLength) -> Payload{5} -> Trailer{2} -> Prefix
//! token:  bytes of the line/payload accumulated so far
//! frames: arrays still waiting for elements (outermost first)
//! ```
//!
//! Fully consumed chunks are checked back into the pool immediately.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::trace;

use pkv_common::{PkvError, PkvResult};

use crate::buffer::{BufferPool, Chunk};
use crate::resp::Reply;

/// Cap on up-front element allocation for a declared array length.
const MAX_PREALLOC_ITEMS: usize = 1024;

/// Cap on up-front payload allocation for a declared bulk length.
const MAX_PREALLOC_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Simple,
    Error,
    Integer,
    BulkLength,
    ArrayLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Waiting for the type byte of the next frame.
    Prefix,
    /// Reading a CRLF-terminated line.
    Line(LineKind),
    /// Copying a bulk payload.
    Payload { remaining: usize },
    /// Discarding the CRLF after a bulk payload.
    Trailer { remaining: usize },
}

#[derive(Debug)]
struct PendingArray {
    expected: usize,
    items: Vec<Reply>,
}

/// Resumable RESP2 reply decoder.
pub struct Decoder {
    pool: BufferPool,
    chunks: VecDeque<Chunk>,
    /// Read offset into `chunks.front()`.
    pos: usize,
    step: Step,
    token: BytesMut,
    frames: Vec<PendingArray>,
}

impl Decoder {
    /// Creates a decoder that returns consumed chunks to `pool`.
    pub fn new(pool: BufferPool) -> Self {
        Decoder {
            pool,
            chunks: VecDeque::new(),
            pos: 0,
            step: Step::Prefix,
            token: BytesMut::with_capacity(64),
            frames: Vec::new(),
        }
    }

    /// Appends a filled chunk to the input queue.
    pub fn push(&mut self, chunk: Chunk) {
        if chunk.is_empty() {
            self.pool.checkin(chunk);
            return;
        }
        self.chunks.push_back(chunk);
    }

    /// Unread bytes currently queued.
    pub fn buffered(&self) -> usize {
        let total: usize = self.chunks.iter().map(Chunk::len).sum();
        total - self.pos
    }

    /// True when no partial frame is in progress and no input is queued.
    pub fn is_idle(&self) -> bool {
        self.step == Step::Prefix && self.frames.is_empty() && self.buffered() == 0
    }

    /// Last queued chunk if it still has free space, so the next socket read
    /// can fill it instead of taking a fresh chunk.
    pub(crate) fn writable_tail(&mut self) -> Option<&mut Chunk> {
        self.chunks.back_mut().filter(|chunk| chunk.remaining() > 0)
    }

    /// Decodes the next complete reply, or `Ok(None)` if more input is needed.
    ///
    /// Returns `Corruption` for an unknown frame prefix or a malformed length;
    /// the stream must not be decoded further after that.
    pub fn decode(&mut self) -> PkvResult<Option<Reply>> {
        loop {
            match self.step {
                Step::Prefix => {
                    let byte = match self.next_byte() {
                        Some(byte) => byte,
                        None => return Ok(None),
                    };
                    self.step = match byte {
                        b'+' => Step::Line(LineKind::Simple),
                        b'-' => Step::Line(LineKind::Error),
                        b':' => Step::Line(LineKind::Integer),
                        b'$' => Step::Line(LineKind::BulkLength),
                        b'*' => Step::Line(LineKind::ArrayLength),
                        other => {
                            return Err(PkvError::corruption(format!(
                                "unexpected frame prefix {:#04x}",
                                other
                            )))
                        }
                    };
                }
                Step::Line(kind) => {
                    if !self.read_line() {
                        return Ok(None);
                    }
                    let line = self.token.split().freeze();
                    self.step = Step::Prefix;
                    let value = match kind {
                        LineKind::Simple => Reply::Simple(line),
                        LineKind::Error => Reply::Error(line),
                        LineKind::Integer => Reply::Integer(line),
                        LineKind::BulkLength => {
                            let len = parse_length(&line)?;
                            if len < 0 {
                                Reply::Bulk(None)
                            } else {
                                let len = len as usize;
                                self.token.reserve(len.min(MAX_PREALLOC_BYTES));
                                self.step = Step::Payload { remaining: len };
                                continue;
                            }
                        }
                        LineKind::ArrayLength => {
                            let len = parse_length(&line)?;
                            if len < 0 {
                                Reply::Array(None)
                            } else if len == 0 {
                                Reply::Array(Some(Vec::new()))
                            } else {
                                let expected = len as usize;
                                self.frames.push(PendingArray {
                                    expected,
                                    items: Vec::with_capacity(expected.min(MAX_PREALLOC_ITEMS)),
                                });
                                continue;
                            }
                        }
                    };
                    if let Some(reply) = self.complete(value) {
                        return Ok(Some(reply));
                    }
                }
                Step::Payload { remaining } => {
                    let left = self.copy_payload(remaining);
                    if left > 0 {
                        self.step = Step::Payload { remaining: left };
                        return Ok(None);
                    }
                    self.step = Step::Trailer { remaining: 2 };
                }
                Step::Trailer { remaining } => {
                    let left = self.skip(remaining);
                    if left > 0 {
                        self.step = Step::Trailer { remaining: left };
                        return Ok(None);
                    }
                    self.step = Step::Prefix;
                    let payload = self.token.split().freeze();
                    if let Some(reply) = self.complete(Reply::Bulk(Some(payload))) {
                        return Ok(Some(reply));
                    }
                }
            }
        }
    }

    /// Returns every queued chunk to the pool and forgets partial state.
    pub fn reset(&mut self) {
        self.pool.checkin_all(self.chunks.drain(..));
        self.pos = 0;
        self.step = Step::Prefix;
        self.token.clear();
        self.frames.clear();
    }

    /// Folds a finished value into the innermost open array, closing arrays
    /// as they fill. Returns the top-level reply once it is complete.
    fn complete(&mut self, mut value: Reply) -> Option<Reply> {
        while let Some(mut top) = self.frames.pop() {
            top.items.push(value);
            if top.items.len() < top.expected {
                self.frames.push(top);
                return None;
            }
            value = Reply::Array(Some(top.items));
        }
        trace!(?value, "decoded reply");
        Some(value)
    }

    /// Drops fully read chunks from the front of the queue.
    fn release_exhausted(&mut self) {
        while let Some(front) = self.chunks.front() {
            if self.pos < front.len() {
                break;
            }
            if let Some(chunk) = self.chunks.pop_front() {
                self.pool.checkin(chunk);
            }
            self.pos = 0;
        }
    }

    fn next_byte(&mut self) -> Option<u8> {
        self.release_exhausted();
        let byte = *self.chunks.front()?.as_slice().get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Accumulates bytes into `token` until CRLF, across chunk boundaries.
    ///
    /// Returns true once the terminator has been consumed (and stripped).
    fn read_line(&mut self) -> bool {
        loop {
            self.release_exhausted();
            let chunk = match self.chunks.front() {
                Some(chunk) => chunk,
                None => return false,
            };
            let unread = &chunk.as_slice()[self.pos..];
            match unread.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.token.extend_from_slice(&unread[..idx]);
                    self.pos += idx + 1;
                    // The CR may have arrived in an earlier chunk; it is already in `token`.
                    if self.token.last() == Some(&b'\r') {
                        self.token.truncate(self.token.len() - 1);
                        return true;
                    }
                    self.token.extend_from_slice(b"\n");
                }
                None => {
                    self.token.extend_from_slice(unread);
                    self.pos += unread.len();
                }
            }
        }
    }

    /// Copies up to `remaining` payload bytes into `token`; returns what is still missing.
    fn copy_payload(&mut self, mut remaining: usize) -> usize {
        while remaining > 0 {
            self.release_exhausted();
            let chunk = match self.chunks.front() {
                Some(chunk) => chunk,
                None => break,
            };
            let unread = &chunk.as_slice()[self.pos..];
            let take = unread.len().min(remaining);
            self.token.extend_from_slice(&unread[..take]);
            self.pos += take;
            remaining -= take;
        }
        remaining
    }

    /// Discards up to `remaining` bytes; returns what is still missing.
    fn skip(&mut self, mut remaining: usize) -> usize {
        while remaining > 0 {
            self.release_exhausted();
            let available = match self.chunks.front() {
                Some(chunk) => chunk.len() - self.pos,
                None => break,
            };
            let take = available.min(remaining);
            self.pos += take;
            remaining -= take;
        }
        remaining
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.pool.checkin_all(self.chunks.drain(..));
    }
}

/// Parses a signed decimal length header (`value = value * 10 + digit`).
fn parse_length(data: &[u8]) -> PkvResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(PkvError::corruption("empty length header"));
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(PkvError::corruption(format!(
                "invalid length header {:?}",
                String::from_utf8_lossy(data)
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or_else(|| PkvError::corruption("length header overflow"))?;
    }

    Ok(if negative { -value } else { value })
}
