//! # Work Items
//!
//! Purpose: Represent one outstanding command from submission until it is
//! answered, failed, or migrated to another pipeline.
//!
//! ## Design Principles
//! 1. **Resolve Exactly Once**: `resolve` and `fail` consume the item, so a
//!    second resolution does not type-check.
//! 2. **Never Silently Dropped**: Dropping an unresolved item fails its caller
//!    with `Abandoned` instead of leaving it waiting forever.
//! 3. **Two Primitives**: A completion either expects one scalar reply or a
//!    flattened list of replies.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use pkv_common::{PkvError, PkvResult};

use crate::resp::Reply;

/// Scalar reply handed to `send_command` callers (`None` for a null bulk).
pub type SingleReply = Option<Bytes>;

/// Ordered replies handed to `send_multi_command` callers.
pub type MultiReply = Vec<Option<Bytes>>;

/// Monotonic work item identifiers, owned by one pool (or standalone pipeline).
#[derive(Debug, Clone, Default)]
pub struct IdSource {
    next: Arc<AtomicU64>,
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next identifier (starting at 1).
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

enum Completion {
    Single(oneshot::Sender<PkvResult<SingleReply>>),
    Multi(oneshot::Sender<PkvResult<MultiReply>>),
}

impl Completion {
    fn fail(self, err: PkvError) {
        // A caller that stopped waiting is not an error for the pipeline.
        match self {
            Completion::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Completion::Multi(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// One command in flight.
pub struct WorkItem {
    id: u64,
    args: Vec<Bytes>,
    completion: Option<Completion>,
}

impl WorkItem {
    /// Builds an item expecting a single reply.
    pub fn single(id: u64, args: Vec<Bytes>) -> (Self, ReplyFuture<SingleReply>) {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem {
            id,
            args,
            completion: Some(Completion::Single(tx)),
        };
        (item, ReplyFuture { rx })
    }

    /// Builds an item expecting an array of replies.
    pub fn multi(id: u64, args: Vec<Bytes>) -> (Self, ReplyFuture<MultiReply>) {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem {
            id,
            args,
            completion: Some(Completion::Multi(tx)),
        };
        (item, ReplyFuture { rx })
    }

    /// Diagnostic identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Command arguments, in wire order.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Delivers a decoded reply.
    ///
    /// Error replies go to the error path as `PkvError::Protocol`; arrays sent
    /// to a single-reply item fail with `UnexpectedReply`.
    pub fn resolve(mut self, reply: Reply) {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => return,
        };

        if let Reply::Error(message) = reply {
            completion.fail(PkvError::Protocol {
                message: String::from_utf8_lossy(&message).into_owned(),
            });
            return;
        }

        match completion {
            Completion::Single(tx) => {
                let result = reply.into_scalar().ok_or(PkvError::UnexpectedReply {
                    expected: "a single reply",
                });
                let _ = tx.send(result);
            }
            Completion::Multi(tx) => {
                let mut replies = Vec::new();
                reply.flatten_into(&mut replies);
                let _ = tx.send(Ok(replies));
            }
        }
    }

    /// Delivers a failure.
    pub fn fail(mut self, err: PkvError) {
        if let Some(completion) = self.completion.take() {
            completion.fail(err);
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.fail(PkvError::Abandoned);
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = self
            .args
            .first()
            .map(|name| String::from_utf8_lossy(name).into_owned());
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("command", &command)
            .field("argc", &self.args.len())
            .finish()
    }
}

/// Future side of a work item.
#[must_use = "a reply future does nothing unless awaited"]
pub struct ReplyFuture<T> {
    rx: oneshot::Receiver<PkvResult<T>>,
}

impl<T> ReplyFuture<T> {
    /// A future that is already failed.
    pub fn failed(err: PkvError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        ReplyFuture { rx }
    }
}

impl<T> Future for ReplyFuture<T> {
    type Output = PkvResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PkvError::Abandoned)))
    }
}
