//! # Command Encoder
//!
//! Serializes commands as RESP2 arrays of bulk strings into pooled chunks:
//!
//! ```text
//! *<argc>\r\n ( $<len>\r\n <bytes> \r\n ) x argc
//! ```
//!
//! Output spills into as many chunks as it needs; a single argument may be
//! split across chunk boundaries. `flush` hands the finished chunks to the
//! transport, which checks them back into the pool once the write is done.

use bytes::Bytes;

use pkv_common::{PkvError, PkvResult};

use crate::buffer::{BufferPool, Chunk};

const CRLF: &[u8] = b"\r\n";

/// Chunked RESP2 command writer.
pub struct Encoder {
    pool: BufferPool,
    /// Chunk currently being filled.
    current: Option<Chunk>,
    /// Finalized chunks waiting for `flush`, in wire order.
    ready: Vec<Chunk>,
    /// Empty chunks reserved for the command being written.
    reserved: Vec<Chunk>,
    buffered: usize,
    commands: usize,
}

impl Encoder {
    /// Creates an encoder that draws chunks from `pool`.
    pub fn new(pool: BufferPool) -> Self {
        Encoder {
            pool,
            current: None,
            ready: Vec::new(),
            reserved: Vec::new(),
            buffered: 0,
            commands: 0,
        }
    }

    /// Bytes written since the last flush.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Commands written since the last flush.
    pub fn pending_commands(&self) -> usize {
        self.commands
    }

    /// Appends one command.
    ///
    /// Every chunk the command needs is reserved before the first byte is
    /// written, so a `CapacityTimeout` leaves previously written commands
    /// intact and never emits a partial command. A command larger than the
    /// whole pool fails with `CommandTooLarge` before any chunk is taken.
    pub async fn write<A: AsRef<[u8]>>(&mut self, args: &[A]) -> PkvResult<()> {
        let needed = encoded_len(args);
        let space = self.current.as_ref().map_or(0, Chunk::remaining);
        if needed > space {
            let chunk_size = self.pool.chunk_size();
            let count = (needed - space + chunk_size - 1) / chunk_size;
            if count > self.pool.max_chunks() {
                return Err(PkvError::CommandTooLarge {
                    size: needed,
                    limit: self.pool.max_chunks() * chunk_size,
                });
            }
            let chunks = self.pool.checkout_many(count).await?;
            self.reserved.extend(chunks);
        }

        let mut digits = [0u8; 20];
        self.put(b"*");
        self.put(format_decimal(args.len() as u64, &mut digits));
        self.put(CRLF);
        for arg in args {
            let arg = arg.as_ref();
            self.put(b"$");
            self.put(format_decimal(arg.len() as u64, &mut digits));
            self.put(CRLF);
            self.put(arg);
            self.put(CRLF);
        }

        self.buffered += needed;
        self.commands += 1;
        Ok(())
    }

    /// Takes every filled chunk, in wire order, and resets the accounting.
    ///
    /// The caller owns the chunks until it checks them back into the pool.
    pub fn flush(&mut self) -> Vec<Chunk> {
        if let Some(current) = self.current.take() {
            if current.is_empty() {
                self.current = Some(current);
            } else {
                self.ready.push(current);
            }
        }
        self.buffered = 0;
        self.commands = 0;
        std::mem::take(&mut self.ready)
    }

    /// Copies `data` into the current chunk, moving to reserved chunks as each fills.
    fn put(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let full = self.current.as_ref().map_or(true, |chunk| chunk.remaining() == 0);
            if full {
                if let Some(done) = self.current.take() {
                    self.ready.push(done);
                }
                let next = self
                    .reserved
                    .pop()
                    .expect("encoder reserves every chunk a command needs");
                self.current = Some(next);
            }
            if let Some(chunk) = self.current.as_mut() {
                let written = chunk.put(data);
                data = &data[written..];
            }
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Some(chunk) = self.current.take() {
            self.pool.checkin(chunk);
        }
        self.pool.checkin_all(self.ready.drain(..));
        self.pool.checkin_all(self.reserved.drain(..));
    }
}

/// Exact wire size of a command.
pub fn encoded_len<A: AsRef<[u8]>>(args: &[A]) -> usize {
    let header = 1 + digit_count(args.len()) + CRLF.len();
    args.iter().fold(header, |total, arg| {
        let len = arg.as_ref().len();
        total + 1 + digit_count(len) + CRLF.len() + len + CRLF.len()
    })
}

/// Encodes a command into one contiguous buffer, bypassing the pool.
pub fn encode_to_bytes<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut out = Vec::with_capacity(encoded_len(args));
    let mut digits = [0u8; 20];
    out.push(b'*');
    out.extend_from_slice(format_decimal(args.len() as u64, &mut digits));
    out.extend_from_slice(CRLF);
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        out.extend_from_slice(format_decimal(arg.len() as u64, &mut digits));
        out.extend_from_slice(CRLF);
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }
    Bytes::from(out)
}

fn digit_count(mut value: usize) -> usize {
    let mut count = 1;
    while value >= 10 {
        value /= 10;
        count += 1;
    }
    count
}

/// Writes ASCII decimal digits into a stack buffer (no heap allocation).
///
/// Shared with the client helpers that put integers (TTLs) into arguments.
pub(crate) fn format_decimal(mut value: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::{Decoder, Reply};
    use pkv_common::BufferConfig;
    use std::time::Duration;

    fn pool(chunk_size: usize, max_chunks: usize) -> BufferPool {
        BufferPool::new(&BufferConfig {
            chunk_size,
            chunks_per_segment: 4,
            initial_segments: 1,
            max_chunks,
            checkout_timeout_ms: 20,
        })
        .unwrap()
    }

    fn concat(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.as_slice().to_vec()).collect()
    }

    #[tokio::test]
    async fn output_is_independent_of_chunk_size() {
        let expected: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nKey\r\n";
        for size in [5, 100] {
            let pool = pool(size, 64);
            let mut encoder = Encoder::new(pool.clone());
            encoder.write(&["GET", "Key"]).await.unwrap();
            assert_eq!(encoder.buffered(), expected.len());
            let chunks = encoder.flush();
            assert!(chunks.iter().all(|c| c.len() <= size));
            assert_eq!(chunks.len(), (expected.len() + size - 1) / size);
            assert_eq!(concat(&chunks), expected, "chunk size {size}");
            pool.checkin_all(chunks);
        }
    }

    #[tokio::test]
    async fn commands_accumulate_in_order() {
        let pool = pool(7, 64);
        let mut encoder = Encoder::new(pool.clone());
        encoder.write(&["PING"]).await.unwrap();
        encoder.write(&[&b"SET"[..], b"k", b"\r\n\x00binary"]).await.unwrap();
        assert_eq!(encoder.pending_commands(), 2);

        let mut expected = encode_to_bytes(&["PING"]).to_vec();
        expected.extend_from_slice(&encode_to_bytes(&[&b"SET"[..], b"k", b"\r\n\x00binary"]));
        let chunks = encoder.flush();
        assert_eq!(concat(&chunks), expected);
        assert_eq!(encoder.pending_commands(), 0);
        assert_eq!(encoder.buffered(), 0);
        pool.checkin_all(chunks);
    }

    #[tokio::test]
    async fn capacity_timeout_leaves_no_partial_command() {
        let pool = pool(8, 16);
        let mut encoder = Encoder::new(pool.clone());
        encoder.write(&["GET", "a"]).await.unwrap();
        // Another user holds most of the pool, leaving two free chunks.
        let held = pool.checkout_many(11).await.unwrap();

        let large = vec![b'x'; 64];
        let err = encoder.write(&[&large[..]]).await.unwrap_err();
        assert!(matches!(err, PkvError::CapacityTimeout { .. }));
        assert_eq!(pool.available(), 2);

        let chunks = encoder.flush();
        assert_eq!(concat(&chunks), encode_to_bytes(&["GET", "a"]).to_vec());
        pool.checkin_all(chunks);
        pool.checkin_all(held);
    }

    #[tokio::test]
    async fn command_larger_than_pool_fails_without_waiting() {
        // A zero checkout timeout waits forever, so this must not reach checkout.
        let pool = BufferPool::new(&BufferConfig {
            chunk_size: 8,
            chunks_per_segment: 4,
            initial_segments: 1,
            max_chunks: 4,
            checkout_timeout_ms: 0,
        })
        .unwrap();
        let mut encoder = Encoder::new(pool.clone());
        encoder.write(&["GET", "a"]).await.unwrap();

        let large = vec![b'x'; 64];
        let result = tokio::time::timeout(Duration::from_secs(1), encoder.write(&[&large[..]]))
            .await
            .expect("oversized command must fail fast");
        match result {
            Err(err @ PkvError::CommandTooLarge { .. }) => assert!(!err.is_retryable()),
            other => panic!("unexpected result: {other:?}"),
        }

        // Nothing reserved, and the earlier command is untouched.
        let chunks = encoder.flush();
        assert_eq!(concat(&chunks), encode_to_bytes(&["GET", "a"]).to_vec());
        pool.checkin_all(chunks);
        assert_eq!(pool.available(), pool.allocated());
    }

    #[tokio::test]
    async fn encoded_command_decodes_back_to_arguments() {
        let args: Vec<Vec<u8>> = vec![
            b"MSET".to_vec(),
            Vec::new(),
            (0..=255u8).collect(),
            b"*1\r\n$-1\r\n".to_vec(),
        ];
        for size in [1, 3, 16, 1024] {
            let pool = pool(size, 4096);
            let mut encoder = Encoder::new(pool.clone());
            encoder.write(&args).await.unwrap();

            let mut decoder = Decoder::new(pool.clone());
            for chunk in encoder.flush() {
                decoder.push(chunk);
            }
            let reply = decoder.decode().unwrap().unwrap();
            let expected = Reply::Array(Some(
                args.iter()
                    .map(|a| Reply::Bulk(Some(Bytes::from(a.clone()))))
                    .collect(),
            ));
            assert_eq!(reply, expected, "chunk size {size}");
        }
    }

    #[test]
    fn length_accounting() {
        assert_eq!(encoded_len(&["GET", "Key"]), 22);
        assert_eq!(encoded_len::<&str>(&[]), 4);
        let mut digits = [0u8; 20];
        assert_eq!(format_decimal(0, &mut digits), b"0");
        assert_eq!(format_decimal(1234567, &mut digits), b"1234567");
        assert_eq!(format_decimal(u64::MAX, &mut digits), b"18446744073709551615");
        assert_eq!(digit_count(9), 1);
        assert_eq!(digit_count(10), 2);
    }
}
