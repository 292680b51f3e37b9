//! # Pipeline
//!
//! Purpose: Drive one physical connection in full duplex: callers enqueue
//! commands from any task, a send loop encodes and writes them in order, and
//! a receive loop decodes replies and resolves the matching work items.
//!
//! ## Design Principles
//! 1. **FIFO Hand-off**: The send loop moves each item from the request queue
//!    to the response queue before its bytes hit the socket; replies are
//!    matched by position, which is what RESP pipelining guarantees.
//! 2. **Self-Restarting Loops**: Each loop is guarded by a compare-and-swap
//!    state token. A loop that finishes a pass releases the token, re-checks
//!    for work, and re-claims it, so no submission is ever stranded and no
//!    two instances of the same loop run at once.
//! 3. **Fail Once, Fail Everyone In Flight**: The first fatal error is stored;
//!    every item already sent is failed with it. Items not yet sent stay in
//!    the request queue so the pool can migrate them.
//! 4. **No Auto-Heal**: An errored pipeline stays errored; replacement is the
//!    pool's job.
//!
//! ## Structure Overview
//!
//! ```text
//! Pipeline (cheap clone)
//!   └── Shared
//!         ├── requests:  Mutex<VecDeque<WorkItem>>   callers -> send loop
//!         ├── responses: Mutex<VecDeque<WorkItem>>   send loop -> receive loop
//!         ├── error:     OnceLock<PkvError>          set at most once
//!         ├── sending / receiving: LoopState         Idle <-> Running (CAS)
//!         ├── writer: tokio Mutex<{stream, Encoder}>
//!         └── reader: tokio Mutex<{stream, Decoder}>
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use pkv_common::{PkvError, PkvResult};

use crate::buffer::{BufferPool, Chunk};
use crate::resp::{Decoder, Encoder};
use crate::work::{IdSource, MultiReply, ReplyFuture, SingleReply, WorkItem};

/// Buffered bytes that force a flush before the request queue is drained.
const FLUSH_THRESHOLD: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identity and timeouts for a new pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Pool slot the pipeline occupies.
    pub slot: usize,
    /// How many times the slot has been (re)connected.
    pub generation: u64,
    /// Endpoint label used in logs.
    pub endpoint: String,
    /// Read/write timeout; `None` waits forever.
    pub io_timeout: Option<Duration>,
    /// Work item id source, usually shared with the pool.
    pub ids: IdSource,
}

/// Compare-and-swap token guarding one loop.
struct LoopState(AtomicU8);

impl LoopState {
    const IDLE: u8 = 0;
    const RUNNING: u8 = 1;

    fn new() -> Self {
        LoopState(AtomicU8::new(Self::IDLE))
    }

    fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(Self::IDLE, Self::RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(Self::IDLE, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::RUNNING
    }
}

struct WriteHalf {
    stream: BoxedWriter,
    encoder: Encoder,
}

struct ReadHalf {
    stream: BoxedReader,
    decoder: Decoder,
}

struct Shared {
    options: PipelineOptions,
    pool: BufferPool,
    requests: Mutex<VecDeque<WorkItem>>,
    responses: Mutex<VecDeque<WorkItem>>,
    error: OnceLock<PkvError>,
    sending: LoopState,
    receiving: LoopState,
    writer: tokio::sync::Mutex<WriteHalf>,
    reader: tokio::sync::Mutex<ReadHalf>,
    disposed: AtomicBool,
    closed: Notify,
}

/// One connection plus its send/receive machinery.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Wraps a connected TCP stream.
    pub fn from_tcp(stream: TcpStream, pool: BufferPool, options: PipelineOptions) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_halves(Box::new(reader), Box::new(writer), pool, options)
    }

    /// Wraps any duplex byte stream (TLS, in-memory, ...).
    pub fn from_stream<S>(stream: S, pool: BufferPool, options: PipelineOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(Box::new(reader), Box::new(writer), pool, options)
    }

    fn from_halves(
        reader: BoxedReader,
        writer: BoxedWriter,
        pool: BufferPool,
        options: PipelineOptions,
    ) -> Self {
        debug!(
            slot = options.slot,
            generation = options.generation,
            endpoint = %options.endpoint,
            "pipeline created"
        );
        Pipeline {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(WriteHalf {
                    stream: writer,
                    encoder: Encoder::new(pool.clone()),
                }),
                reader: tokio::sync::Mutex::new(ReadHalf {
                    stream: reader,
                    decoder: Decoder::new(pool.clone()),
                }),
                options,
                pool,
                requests: Mutex::new(VecDeque::new()),
                responses: Mutex::new(VecDeque::new()),
                error: OnceLock::new(),
                sending: LoopState::new(),
                receiving: LoopState::new(),
                disposed: AtomicBool::new(false),
                closed: Notify::new(),
            }),
        }
    }

    /// Enqueues a command expecting one reply and returns its reply future.
    ///
    /// The command is queued before this returns, so submissions made one
    /// after another are written in that order.
    pub fn submit<I, A>(&self, args: I) -> ReplyFuture<SingleReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let (item, reply) = WorkItem::single(self.shared.options.ids.next_id(), collect_args(args));
        self.shared.enqueue(item);
        reply
    }

    /// Enqueues a command expecting an array reply.
    pub fn submit_multi<I, A>(&self, args: I) -> ReplyFuture<MultiReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let (item, reply) = WorkItem::multi(self.shared.options.ids.next_id(), collect_args(args));
        self.shared.enqueue(item);
        reply
    }

    /// Sends one command and waits for its single reply.
    pub async fn send_command<I, A>(&self, args: I) -> PkvResult<SingleReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.submit(args).await
    }

    /// Sends one command and waits for its array of replies.
    pub async fn send_multi_command<I, A>(&self, args: I) -> PkvResult<MultiReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.submit_multi(args).await
    }

    /// Moves every unsent request to `other`, ahead of anything already
    /// queued there, preserving order. Returns how many were moved.
    pub fn save_queue(&self, other: &Pipeline) -> usize {
        let items: Vec<WorkItem> = self.shared.requests.lock().drain(..).collect();
        let moved = items.len();
        if moved == 0 {
            return 0;
        }
        {
            let mut queue = other.shared.requests.lock();
            for item in items.into_iter().rev() {
                queue.push_front(item);
            }
        }
        debug!(
            from_slot = self.shared.options.slot,
            from_generation = self.shared.options.generation,
            to_generation = other.shared.options.generation,
            moved,
            "migrated unsent requests"
        );
        other.shared.start_send();
        moved
    }

    /// Fails every sent-but-unanswered item with the stored error.
    ///
    /// Does nothing while the pipeline is healthy.
    pub fn fail_remaining(&self) {
        self.shared.fail_remaining();
    }

    /// Closes the connection and fails anything still queued with `Disposed`.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// True once a fatal error (or disposal) has been recorded.
    pub fn is_errored(&self) -> bool {
        self.shared.is_errored()
    }

    /// The stored error, if any.
    pub fn error(&self) -> Option<PkvError> {
        self.shared.error.get().cloned()
    }

    /// Requests not yet written.
    pub fn queued(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Requests written and awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.in_flight() == 0
    }

    /// Pool slot index.
    pub fn slot(&self) -> usize {
        self.shared.options.slot
    }

    /// Connection generation within the slot.
    pub fn generation(&self) -> u64 {
        self.shared.options.generation
    }

    /// Endpoint this pipeline is connected to.
    pub fn endpoint(&self) -> &str {
        &self.shared.options.endpoint
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("slot", &self.slot())
            .field("generation", &self.generation())
            .field("endpoint", &self.endpoint())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .field("sending", &self.shared.sending.is_running())
            .field("receiving", &self.shared.receiving.is_running())
            .field("error", &self.shared.error.get())
            .finish()
    }
}

impl Shared {
    fn is_errored(&self) -> bool {
        self.error.get().is_some()
    }

    fn in_flight(&self) -> usize {
        self.responses.lock().len()
    }

    fn enqueue(self: &Arc<Self>, item: WorkItem) {
        {
            // Checked under the queue lock: every drain of `requests` runs after
            // the error is set, so a pushed item is always migrated or failed.
            let mut requests = self.requests.lock();
            if let Some(err) = self.error.get() {
                drop(requests);
                item.fail(err.clone());
                return;
            }
            trace!(slot = self.options.slot, item = ?item, "enqueue");
            requests.push_back(item);
        }
        self.start_send();
    }

    fn pop_request(&self) -> Option<WorkItem> {
        self.requests.lock().pop_front()
    }

    fn has_requests(&self) -> bool {
        !self.requests.lock().is_empty()
    }

    fn push_response(&self, item: WorkItem) {
        self.responses.lock().push_back(item);
    }

    fn pop_response(&self) -> Option<WorkItem> {
        self.responses.lock().pop_front()
    }

    /// Records the first fatal error and fails everything in flight.
    fn fail(&self, err: PkvError) {
        if self.error.set(err.clone()).is_ok() {
            warn!(
                slot = self.options.slot,
                generation = self.options.generation,
                endpoint = %self.options.endpoint,
                error = %err,
                "pipeline failed"
            );
        }
        self.fail_remaining();
    }

    fn fail_remaining(&self) {
        let err = match self.error.get() {
            Some(err) => err.clone(),
            None => return,
        };
        let drained: Vec<WorkItem> = self.responses.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!(slot = self.options.slot, count = drained.len(), "failing in-flight requests");
        }
        for item in drained {
            item.fail(err.clone());
        }
    }

    fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.error.set(PkvError::Disposed);
        self.closed.notify_waiters();
        self.fail_remaining();
        let queued: Vec<WorkItem> = self.requests.lock().drain(..).collect();
        for item in queued {
            item.fail(PkvError::Disposed);
        }
        debug!(
            slot = self.options.slot,
            generation = self.options.generation,
            "pipeline disposed"
        );

        // Outside a runtime the stream is closed when the last handle drops.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(self);
            handle.spawn(async move {
                let mut writer = shared.writer.lock().await;
                let _ = writer.stream.shutdown().await;
            });
        }
    }

    fn start_send(self: &Arc<Self>) {
        if self.is_errored() || !self.sending.try_claim() {
            return;
        }
        tokio::spawn(Arc::clone(self).run_send_loop());
    }

    fn start_receive(self: &Arc<Self>) {
        if self.is_errored() || !self.receiving.try_claim() {
            return;
        }
        tokio::spawn(Arc::clone(self).run_receive_loop());
    }

    /// Entered with `sending` claimed.
    async fn run_send_loop(self: Arc<Self>) {
        loop {
            let result = self.send_pass().await;
            self.sending.release();
            if let Err(err) = result {
                self.fail(err);
                return;
            }
            if self.is_errored() {
                // Catch items moved to the response queue after a concurrent drain.
                self.fail_remaining();
                return;
            }
            if !self.has_requests() || !self.sending.try_claim() {
                return;
            }
        }
    }

    /// Drains the request queue into the socket.
    async fn send_pass(self: &Arc<Self>) -> PkvResult<()> {
        let mut guard = self.writer.lock().await;
        let WriteHalf { stream, encoder } = &mut *guard;

        while !self.is_errored() {
            let item = match self.pop_request() {
                Some(item) => item,
                None => break,
            };

            match encoder.write(item.args()).await {
                Ok(()) => self.push_response(item),
                Err(PkvError::CapacityTimeout { .. }) if encoder.pending_commands() > 0 => {
                    // Our own unflushed chunks may be what exhausted the pool.
                    self.flush_writes(stream, encoder).await?;
                    match encoder.write(item.args()).await {
                        Ok(()) => self.push_response(item),
                        Err(err) => item.fail(err),
                    }
                }
                Err(err) => {
                    debug!(slot = self.options.slot, item = ?item, error = %err, "command not encoded");
                    item.fail(err);
                }
            }

            if encoder.buffered() >= FLUSH_THRESHOLD {
                self.flush_writes(stream, encoder).await?;
            }
        }

        if encoder.pending_commands() > 0 {
            self.flush_writes(stream, encoder).await?;
        }
        Ok(())
    }

    /// Writes the encoder's chunks, returns them to the pool, and kicks the
    /// receive loop.
    async fn flush_writes(
        self: &Arc<Self>,
        stream: &mut BoxedWriter,
        encoder: &mut Encoder,
    ) -> PkvResult<()> {
        let commands = encoder.pending_commands();
        let chunks = encoder.flush();
        let result = with_io_timeout(self.options.io_timeout, "write", write_chunks(stream, &chunks)).await;
        self.pool.checkin_all(chunks);
        result?;
        trace!(slot = self.options.slot, commands, "flushed");
        self.start_receive();
        Ok(())
    }

    /// Entered with `receiving` claimed.
    async fn run_receive_loop(self: Arc<Self>) {
        loop {
            let result = self.receive_pass().await;
            self.receiving.release();
            match result {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    warn!(slot = self.options.slot, error = %err, "receive stalled on buffer capacity");
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
            if self.is_errored() || self.in_flight() == 0 || !self.receiving.try_claim() {
                return;
            }
        }
    }

    /// Resolves in-flight items until the response queue is empty.
    async fn receive_pass(&self) -> PkvResult<()> {
        let mut guard = self.reader.lock().await;
        let ReadHalf { stream, decoder } = &mut *guard;

        while self.in_flight() > 0 && !self.is_errored() {
            let reply = loop {
                if let Some(reply) = decoder.decode()? {
                    break reply;
                }
                self.fill(stream, decoder).await?;
            };
            match self.pop_response() {
                Some(item) => {
                    trace!(slot = self.options.slot, item = ?item, "resolved");
                    item.resolve(reply);
                }
                None => {
                    return Err(PkvError::corruption("reply received with no request in flight"));
                }
            }
        }
        Ok(())
    }

    /// Reads more bytes from the socket into the decoder's queue.
    async fn fill(&self, stream: &mut BoxedReader, decoder: &mut Decoder) -> PkvResult<()> {
        let read = match decoder.writable_tail() {
            Some(tail) => self.read_into(stream, tail).await?,
            None => {
                let mut chunk = self.pool.checkout().await?;
                match self.read_into(stream, &mut chunk).await {
                    Ok(read) => {
                        decoder.push(chunk);
                        read
                    }
                    Err(err) => {
                        self.pool.checkin(chunk);
                        return Err(err);
                    }
                }
            }
        };

        if read == 0 {
            return Err(PkvError::transport(
                "read",
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
            ));
        }
        Ok(())
    }

    async fn read_into(&self, stream: &mut BoxedReader, chunk: &mut Chunk) -> PkvResult<usize> {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.disposed.load(Ordering::Acquire) {
            return Err(PkvError::Disposed);
        }

        let read = tokio::select! {
            _ = &mut closed => return Err(PkvError::Disposed),
            read = with_io_timeout(self.options.io_timeout, "read", stream.read(chunk.spare_mut())) => read?,
        };
        chunk.advance(read);
        Ok(read)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let err = self.error.get().cloned().unwrap_or(PkvError::Disposed);
        for item in self.requests.get_mut().drain(..) {
            item.fail(err.clone());
        }
        for item in self.responses.get_mut().drain(..) {
            item.fail(err.clone());
        }
    }
}

async fn write_chunks(stream: &mut BoxedWriter, chunks: &[Chunk]) -> io::Result<()> {
    for chunk in chunks {
        stream.write_all(chunk.as_slice()).await?;
    }
    stream.flush().await
}

async fn with_io_timeout<T, F>(limit: Option<Duration>, context: &'static str, io: F) -> PkvResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timed out")),
        },
        None => io.await,
    };
    result.map_err(|err| PkvError::transport(context, err))
}

fn collect_args<I, A>(args: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = A>,
    A: Into<Bytes>,
{
    args.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkv_common::BufferConfig;
    use tokio::io::{duplex, DuplexStream};

    fn buffers() -> BufferPool {
        BufferPool::new(&BufferConfig {
            chunk_size: 16,
            chunks_per_segment: 8,
            initial_segments: 1,
            max_chunks: 512,
            checkout_timeout_ms: 200,
        })
        .unwrap()
    }

    fn pipeline(io_timeout: Option<Duration>) -> (Pipeline, DuplexStream) {
        pipeline_with_capacity(io_timeout, 4096)
    }

    fn pipeline_with_capacity(io_timeout: Option<Duration>, capacity: usize) -> (Pipeline, DuplexStream) {
        let (client, server) = duplex(capacity);
        let options = PipelineOptions {
            io_timeout,
            endpoint: "duplex".to_string(),
            ..PipelineOptions::default()
        };
        (Pipeline::from_stream(client, buffers(), options), server)
    }

    /// Reads exactly `len` request bytes from the server end.
    async fn read_request(server: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn wire(args: &[&str]) -> Vec<u8> {
        crate::resp::encoder::encode_to_bytes(args).to_vec()
    }

    #[tokio::test]
    async fn pipelined_replies_resolve_in_order() {
        let (pipeline, mut server) = pipeline(Some(Duration::from_secs(2)));
        let first = pipeline.submit(["GET", "a"]);
        let second = pipeline.submit(["GET", "b"]);
        let third = pipeline.submit_multi(["MGET", "a", "b"]);

        let mut expected = wire(&["GET", "a"]);
        expected.extend(wire(&["GET", "b"]));
        expected.extend(wire(&["MGET", "a", "b"]));
        assert_eq!(read_request(&mut server, expected.len()).await, expected);

        // One byte at a time, to cross every boundary.
        let replies: &[u8] = b"$5\r\nBoom!\r\n$-1\r\n*2\r\n$5\r\nBoom!\r\n$-1\r\n";
        for byte in replies {
            server.write_all(std::slice::from_ref(byte)).await.unwrap();
        }

        assert_eq!(first.await.unwrap(), Some(Bytes::from_static(b"Boom!")));
        assert_eq!(second.await.unwrap(), None);
        assert_eq!(
            third.await.unwrap(),
            vec![Some(Bytes::from_static(b"Boom!")), None]
        );
        assert!(pipeline.is_idle());
        assert!(!pipeline.is_errored());
    }

    #[tokio::test]
    async fn error_reply_is_local_to_its_item() {
        let (pipeline, mut server) = pipeline(Some(Duration::from_secs(2)));
        let failing = pipeline.submit(["GET", "a"]);
        let ok = pipeline.submit(["PING"]);

        let len = wire(&["GET", "a"]).len() + wire(&["PING"]).len();
        read_request(&mut server, len).await;
        server.write_all(b"-ERR Oh no.\r\n+PONG\r\n").await.unwrap();

        match failing.await {
            Err(PkvError::Protocol { message }) => assert_eq!(message, "ERR Oh no."),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(ok.await.unwrap(), Some(Bytes::from_static(b"PONG")));
        assert!(!pipeline.is_errored());
    }

    #[tokio::test]
    async fn transport_error_fails_every_in_flight_item_once() {
        let (pipeline, mut server) = pipeline(Some(Duration::from_secs(2)));
        let replies: Vec<_> = (0..5)
            .map(|i| pipeline.submit(["GET".to_string(), format!("k{i}")]))
            .collect();

        let len: usize = (0..5)
            .map(|i| wire(&["GET", &format!("k{i}")]).len())
            .sum();
        read_request(&mut server, len).await;
        // Answer the first, then hang up.
        server.write_all(b"+OK\r\n").await.unwrap();
        drop(server);

        let mut results = Vec::new();
        for reply in replies {
            results.push(reply.await);
        }
        assert_eq!(results[0].as_ref().unwrap(), &Some(Bytes::from_static(b"OK")));
        for result in &results[1..] {
            match result {
                Err(err) => assert!(err.is_fatal_to_connection(), "{err:?}"),
                Ok(value) => panic!("unexpected success: {value:?}"),
            }
        }
        assert!(pipeline.is_errored());
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn corruption_errors_the_pipeline() {
        let (pipeline, mut server) = pipeline(Some(Duration::from_secs(2)));
        let reply = pipeline.submit(["PING"]);
        read_request(&mut server, wire(&["PING"]).len()).await;
        server.write_all(b"!bogus\r\n").await.unwrap();

        assert!(matches!(reply.await, Err(PkvError::Corruption { .. })));
        assert!(pipeline.is_errored());

        // Errored pipelines fail fast.
        let late = pipeline.submit(["PING"]);
        assert!(matches!(late.await, Err(PkvError::Corruption { .. })));
    }

    #[tokio::test]
    async fn unsent_requests_migrate_in_order() {
        // A tiny duplex buffer and a server that never reads: the first large
        // write stalls until the I/O timeout fires.
        let (client, _stalled_server) = duplex(32);
        let old = Pipeline::from_stream(
            client,
            buffers(),
            PipelineOptions {
                io_timeout: Some(Duration::from_millis(100)),
                ..PipelineOptions::default()
            },
        );
        let big = vec![b'x'; 1024];
        let stalled = old.submit([Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from(big)]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let later: Vec<_> = (0..3)
            .map(|i| old.submit(["ECHO".to_string(), format!("m{i}")]))
            .collect();

        assert!(matches!(stalled.await, Err(PkvError::Transport { .. })));
        assert!(old.is_errored());
        assert_eq!(old.queued(), 3);

        let (fresh, mut server) = pipeline(Some(Duration::from_secs(2)));
        old.fail_remaining();
        assert_eq!(old.save_queue(&fresh), 3);
        old.dispose();

        let mut expected = Vec::new();
        for i in 0..3 {
            expected.extend(wire(&["ECHO", &format!("m{i}")]));
        }
        assert_eq!(read_request(&mut server, expected.len()).await, expected);
        server.write_all(b"$2\r\nm0\r\n$2\r\nm1\r\n$2\r\nm2\r\n").await.unwrap();

        for (i, reply) in later.into_iter().enumerate() {
            assert_eq!(reply.await.unwrap(), Some(Bytes::from(format!("m{i}"))));
        }
    }

    #[tokio::test]
    async fn dispose_fails_queued_and_in_flight() {
        let (pipeline, mut server) = pipeline(None);
        let reply = pipeline.submit(["PING"]);
        read_request(&mut server, wire(&["PING"]).len()).await;

        pipeline.dispose();
        assert!(matches!(reply.await, Err(PkvError::Disposed)));
        assert!(pipeline.is_errored());
        assert!(matches!(
            pipeline.submit(["PING"]).await,
            Err(PkvError::Disposed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_racing_repair_all_resolve() {
        for round in 0..20 {
            // Neither server end reads or replies; only failure paths resolve items.
            let (old, _old_server) = pipeline_with_capacity(Some(Duration::from_secs(2)), 1 << 20);
            let (fresh, _fresh_server) = pipeline_with_capacity(Some(Duration::from_secs(2)), 1 << 20);
            let start = Arc::new(tokio::sync::Barrier::new(5));

            let mut submitters = Vec::new();
            for _ in 0..4 {
                let old = old.clone();
                let start = Arc::clone(&start);
                submitters.push(tokio::spawn(async move {
                    start.wait().await;
                    (0..200).map(|_| old.submit(["PING"])).collect::<Vec<_>>()
                }));
            }

            start.wait().await;
            for _ in 0..round % 4 {
                tokio::task::yield_now().await;
            }
            old.shared.fail(PkvError::transport(
                "read",
                io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
            ));
            old.fail_remaining();
            old.save_queue(&fresh);
            old.dispose();

            let mut replies = Vec::new();
            for submitter in submitters {
                replies.extend(submitter.await.unwrap());
            }
            assert!(old.submit(["PING"]).await.is_err());
            fresh.dispose();

            for reply in replies {
                let resolved = tokio::time::timeout(Duration::from_secs(5), reply).await;
                assert!(resolved.is_ok(), "reply left pending in round {round}");
            }
        }
    }

    #[test]
    fn loop_state_is_exclusive() {
        let state = LoopState::new();
        assert!(state.try_claim());
        assert!(!state.try_claim());
        assert!(state.is_running());
        state.release();
        assert!(state.try_claim());
    }
}
