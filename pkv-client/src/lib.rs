//! # PipeKV Client
//!
//! Purpose: Provide an async Redis-compatible client that multiplexes many
//! concurrent callers over a small pool of pipelined RESP2 connections.
//!
//! ## Design Principles
//! 1. **Pipelining**: Each connection keeps sending while replies are still
//!    outstanding; replies are matched to requests by order.
//! 2. **Pooled Buffers**: All socket I/O goes through fixed-size chunks drawn
//!    from a shared, bounded pool.
//! 3. **Incremental Parsing**: Replies are decoded as bytes arrive, across
//!    any chunk boundary.
//! 4. **Self-Healing Pool**: Failed connections are replaced on demand and
//!    their unsent commands carried over.
//!
//! ## Structure Overview
//!
//! ```text
//! PkvClient
//!   └── PipelinePool ── Slot[0..pool_size] ── Pipeline
//!                                               ├── Encoder ─┐
//!                                               └── Decoder ─┴── BufferPool
//! ```

pub mod buffer;
#[cfg(feature = "cache")]
mod cache;
mod client;
mod connection;
pub mod pipeline;
mod pool;
pub mod resp;
pub mod work;

pub use buffer::{BufferPool, Chunk};
#[cfg(feature = "cache")]
pub use cache::Cache;
pub use client::PkvClient;
pub use pipeline::{Pipeline, PipelineOptions};
pub use pkv_common::{BufferConfig, ClientConfig, ErrorKind, PkvError, PkvResult};
pub use pool::PipelinePool;
pub use resp::Reply;
pub use work::{IdSource, MultiReply, ReplyFuture, SingleReply, WorkItem};
