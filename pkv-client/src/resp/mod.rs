//! # RESP2 Framing
//!
//! Purpose: Encode client commands into pooled chunks and decode server
//! replies from a stream of chunks that may split any token anywhere.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: The decoder keeps its position in an explicit
//!    state value, so running out of input mid-token is a pause, not an error.
//! 2. **Binary-Safe**: Bulk payloads are copied by length and never scanned.
//! 3. **Opaque Scalars**: Integers stay raw bytes; numeric conversion belongs
//!    to whoever issued the command (`Reply::as_i64` is a convenience only).
//! 4. **Fail Fast**: Unknown frame prefixes are fatal corruption.

pub mod decoder;
pub mod encoder;

use bytes::Bytes;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// One decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status line.
    Simple(Bytes),
    /// `-ERR ...` error line, without the prefix.
    Error(Bytes),
    /// `:123` integer, kept as the raw digits.
    Integer(Bytes),
    /// `$n` bulk string; `None` for `$-1`.
    Bulk(Option<Bytes>),
    /// `*n` array; `None` for `*-1`.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Returns true for null bulk strings and null arrays.
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    /// Parses an integer reply (or a numeric bulk/simple string).
    pub fn as_i64(&self) -> Option<i64> {
        let raw = match self {
            Reply::Integer(raw) | Reply::Simple(raw) | Reply::Bulk(Some(raw)) => raw,
            _ => return None,
        };
        std::str::from_utf8(raw).ok()?.parse().ok()
    }

    /// Scalar payload as the single-reply primitive hands it to callers.
    ///
    /// Arrays and error replies have no scalar form.
    pub fn into_scalar(self) -> Option<Option<Bytes>> {
        match self {
            Reply::Simple(raw) | Reply::Integer(raw) => Some(Some(raw)),
            Reply::Bulk(payload) => Some(payload),
            Reply::Error(_) | Reply::Array(_) => None,
        }
    }

    /// Flattens a reply into the ordered list the multi-reply primitive returns.
    ///
    /// Nested arrays are flattened depth-first, a null array contributes
    /// nothing, and a scalar contributes itself. Error replies nested inside an
    /// array contribute their text.
    pub fn flatten_into(self, out: &mut Vec<Option<Bytes>>) {
        match self {
            Reply::Array(Some(items)) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            Reply::Array(None) => {}
            Reply::Simple(raw) | Reply::Integer(raw) | Reply::Error(raw) => out.push(Some(raw)),
            Reply::Bulk(payload) => out.push(payload),
        }
    }
}
