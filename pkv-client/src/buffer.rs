//! # Buffer Pool
//!
//! Purpose: Hand out fixed-size chunks for socket reads and command encoding,
//! recycling them instead of allocating per request, and bound the total
//! memory every pipeline of a client can hold.
//!
//! ## Design Principles
//! 1. **Segment Allocation**: Chunks are carved out of one contiguous
//!    `BytesMut` block (a segment) so a burst of demand costs one allocation.
//! 2. **Bounded Growth**: The pool never allocates past `max_chunks`; when it
//!    is exhausted callers wait for a check-in, up to a deadline.
//! 3. **Minimal Locking**: The mutex only guards the free list and counters;
//!    waiting happens on a `Notify`, never while holding the lock.
//! 4. **Distinct Failure**: Exhaustion surfaces as `CapacityTimeout`, never as
//!    an I/O error.
//!
//! ## Structure Overview
//!
//! ```text
//! BufferPool (cheap clone)
//!   └── PoolInner
//!         ├── state: Mutex<PoolState>
//!         │     ├── available: Vec<Chunk>   (checked-in chunks)
//!         │     ├── allocated: usize        (chunks ever carved)
//!         │     └── segments: usize
//!         └── signal: Notify                (one wake-up per check-in)
//!
//! segment #n:  [ chunk | chunk | chunk | ... ]  (one allocation, split_to per chunk)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use pkv_common::{BufferConfig, PkvError, PkvResult};

/// A fixed-size region of a segment, owned by exactly one reader or writer
/// while checked out.
///
/// `data` always has length `chunk_size`; `len` tracks the filled prefix.
pub struct Chunk {
    data: BytesMut,
    len: usize,
    segment: usize,
    /// Identity of the pool that carved this chunk.
    pool_id: u64,
}

impl Chunk {
    /// Total bytes this chunk can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently filled.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when nothing has been written yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left in the chunk.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Index of the segment this chunk was carved from.
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Filled bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copies as much of `src` as fits and returns the number of bytes copied.
    ///
    /// Never writes past capacity; the caller moves to a new chunk for the rest.
    pub(crate) fn put(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        self.data[self.len..self.len + count].copy_from_slice(&src[..count]);
        self.len += count;
        count
    }

    /// Unfilled tail, used as the target of socket reads.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `count` bytes of the spare region as filled.
    pub(crate) fn advance(&mut self, count: usize) {
        debug_assert!(count <= self.remaining());
        self.len += count.min(self.remaining());
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("segment", &self.segment)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct PoolState {
    available: Vec<Chunk>,
    allocated: usize,
    segments: usize,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolInner {
    id: u64,
    chunk_size: usize,
    chunks_per_segment: usize,
    max_chunks: usize,
    checkout_timeout: Option<Duration>,
    state: Mutex<PoolState>,
    signal: Notify,
}

/// Thread-safe chunk pool shared by every pipeline of one client.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool and eagerly allocates `initial_segments` segments.
    pub fn new(config: &BufferConfig) -> PkvResult<Self> {
        config.validate()?;
        let pool = BufferPool {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                chunk_size: config.chunk_size,
                chunks_per_segment: config.chunks_per_segment,
                max_chunks: config.max_chunks,
                checkout_timeout: config.checkout_timeout(),
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    allocated: 0,
                    segments: 0,
                }),
                signal: Notify::new(),
            }),
        };

        {
            let mut state = pool.inner.state.lock();
            for _ in 0..config.initial_segments {
                if !pool.inner.grow(&mut state) {
                    break;
                }
            }
        }
        Ok(pool)
    }

    /// Size of every chunk handed out by this pool.
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Upper bound on chunks this pool will ever allocate.
    pub fn max_chunks(&self) -> usize {
        self.inner.max_chunks
    }

    /// Chunks currently checked in.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    /// Chunks allocated so far (checked in or out).
    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// Segments allocated so far.
    pub fn segments(&self) -> usize {
        self.inner.state.lock().segments
    }

    /// Returns a chunk without waiting, growing the pool by one segment if
    /// the free list is empty and the limit allows it.
    pub fn try_checkout(&self) -> Option<Chunk> {
        let mut state = self.inner.state.lock();
        if let Some(chunk) = state.available.pop() {
            return Some(chunk);
        }
        if self.inner.grow(&mut state) {
            return state.available.pop();
        }
        None
    }

    /// Checks out a chunk, waiting up to the configured checkout timeout.
    pub async fn checkout(&self) -> PkvResult<Chunk> {
        self.checkout_timeout(self.inner.checkout_timeout).await
    }

    /// Checks out a chunk, waiting up to `timeout` (`None` waits forever).
    ///
    /// Fails with `CapacityTimeout` if the pool stays exhausted.
    pub async fn checkout_timeout(&self, timeout: Option<Duration>) -> PkvResult<Chunk> {
        if let Some(chunk) = self.try_checkout() {
            return Ok(chunk);
        }

        let started = Instant::now();
        let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);
        loop {
            // Register before re-checking so a check-in between the two is not missed.
            let notified = self.inner.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.try_checkout() {
                return Ok(chunk);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = started.elapsed();
                        debug!(?waited, "buffer checkout timed out");
                        return Err(PkvError::CapacityTimeout { waited });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Checks out `count` chunks sharing one deadline.
    ///
    /// Either every chunk is returned or none is: on timeout the chunks taken
    /// so far go back to the pool.
    pub async fn checkout_many(&self, count: usize) -> PkvResult<Vec<Chunk>> {
        let started = Instant::now();
        let mut chunks = Vec::with_capacity(count);
        while chunks.len() < count {
            let timeout = self
                .inner
                .checkout_timeout
                .map(|limit| limit.saturating_sub(started.elapsed()));
            match self.checkout_timeout(timeout).await {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    self.checkin_all(chunks);
                    return Err(err);
                }
            }
        }
        Ok(chunks)
    }

    /// Returns a chunk to the pool and wakes at most one waiter.
    pub fn checkin(&self, mut chunk: Chunk) {
        if chunk.pool_id != self.inner.id || chunk.capacity() != self.inner.chunk_size {
            warn!(
                chunk_pool = chunk.pool_id,
                pool = self.inner.id,
                capacity = chunk.capacity(),
                "ignoring check-in of a chunk from another pool"
            );
            return;
        }
        chunk.reset();
        self.inner.state.lock().available.push(chunk);
        self.inner.signal.notify_one();
    }

    /// Returns every chunk in `chunks` to the pool.
    pub fn checkin_all(&self, chunks: impl IntoIterator<Item = Chunk>) {
        for chunk in chunks {
            self.checkin(chunk);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BufferPool")
            .field("chunk_size", &self.inner.chunk_size)
            .field("available", &state.available.len())
            .field("allocated", &state.allocated)
            .field("max_chunks", &self.inner.max_chunks)
            .finish()
    }
}

impl PoolInner {
    /// Allocates one more segment into the free list.
    ///
    /// The last segment is truncated so `allocated` never exceeds `max_chunks`.
    fn grow(&self, state: &mut PoolState) -> bool {
        let count = self
            .chunks_per_segment
            .min(self.max_chunks.saturating_sub(state.allocated));
        if count == 0 {
            return false;
        }

        let segment = state.segments;
        let mut block = BytesMut::zeroed(self.chunk_size * count);
        for _ in 0..count {
            let data = block.split_to(self.chunk_size);
            state.available.push(Chunk {
                data,
                len: 0,
                segment,
                pool_id: self.id,
            });
        }
        state.allocated += count;
        state.segments += 1;
        debug!(segment, chunks = count, allocated = state.allocated, "allocated buffer segment");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(chunk_size: usize, per_segment: usize, initial: usize, max: usize, timeout_ms: u64) -> BufferPool {
        BufferPool::new(&BufferConfig {
            chunk_size,
            chunks_per_segment: per_segment,
            initial_segments: initial,
            max_chunks: max,
            checkout_timeout_ms: timeout_ms,
        })
        .unwrap()
    }

    #[test]
    fn preallocates_initial_segments() {
        let pool = pool(64, 4, 2, 16, 10);
        assert_eq!(pool.segments(), 2);
        assert_eq!(pool.allocated(), 8);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn grows_one_segment_at_a_time() {
        let pool = pool(32, 4, 0, 8, 10);
        assert_eq!(pool.allocated(), 0);

        let first = pool.try_checkout().unwrap();
        assert_eq!(pool.segments(), 1);
        assert_eq!(pool.allocated(), 4);
        assert_eq!(first.capacity(), 32);
        assert_eq!(first.segment(), 0);

        let mut held = vec![first];
        for _ in 0..3 {
            held.push(pool.try_checkout().unwrap());
        }
        assert_eq!(pool.segments(), 1);

        held.push(pool.try_checkout().unwrap());
        assert_eq!(pool.segments(), 2);
        assert_eq!(held.last().unwrap().segment(), 1);
    }

    #[test]
    fn never_exceeds_max_chunks() {
        let pool = pool(16, 4, 0, 6, 10);
        let mut held = Vec::new();
        while let Some(chunk) = pool.try_checkout() {
            held.push(chunk);
        }
        assert_eq!(held.len(), 6);
        assert_eq!(pool.allocated(), 6);
    }

    #[test]
    fn checkin_resets_and_recycles() {
        let pool = pool(8, 1, 1, 1, 10);
        let mut chunk = pool.try_checkout().unwrap();
        assert_eq!(chunk.put(b"0123456789"), 8);
        assert_eq!(chunk.remaining(), 0);
        pool.checkin(chunk);

        let chunk = pool.try_checkout().unwrap();
        assert!(chunk.is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn foreign_chunk_is_ignored() {
        let small = pool(8, 1, 1, 1, 10);
        let large = pool(16, 1, 1, 1, 10);
        let chunk = large.try_checkout().unwrap();
        small.checkin(chunk);
        assert_eq!(small.available(), 1);
    }

    #[test]
    fn same_size_chunk_from_another_pool_is_ignored() {
        let ours = pool(8, 1, 1, 1, 10);
        let theirs = pool(8, 1, 1, 1, 10);
        let foreign = theirs.try_checkout().unwrap();

        ours.checkin(foreign);
        assert_eq!(ours.available(), 1);
        assert_eq!(ours.allocated(), ours.max_chunks());
        assert!(ours.available() <= ours.max_chunks());
    }

    #[tokio::test]
    async fn exhausted_checkout_times_out() {
        let pool = pool(8, 2, 1, 2, 30);
        let _a = pool.checkout().await.unwrap();
        let _b = pool.checkout().await.unwrap();

        let started = Instant::now();
        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, PkvError::CapacityTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn checkin_unblocks_exactly_one_waiter() {
        let pool = pool(8, 1, 1, 1, 300);
        let held = pool.checkout().await.unwrap();

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout().await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.checkin(held);

        let results = [first.await.unwrap(), second.await.unwrap()];
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(PkvError::CapacityTimeout { .. })))
            .count();
        assert_eq!(granted, 1);
        assert_eq!(timed_out, 1);
    }

    #[tokio::test]
    async fn checkout_many_is_all_or_nothing() {
        let pool = pool(8, 2, 1, 3, 20);
        let held = pool.checkout().await.unwrap();
        let err = pool.checkout_many(3).await.unwrap_err();
        assert!(matches!(err, PkvError::CapacityTimeout { .. }));
        assert_eq!(pool.available() + 1, pool.allocated());

        pool.checkin(held);
        let chunks = pool.checkout_many(3).await.unwrap();
        assert_eq!(chunks.len(), 3);
    }
}
