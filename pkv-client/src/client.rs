//! # Client API
//!
//! Purpose: Expose a compact async API for issuing Redis-compatible commands
//! over a pool of pipelined RESP2 connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `PkvClient` hides pooling, pipelining and framing.
//! 2. **Two Primitives**: Everything goes through `send_command` or
//!    `send_multi_command`; the typed helpers only shape arguments and
//!    interpret replies.
//! 3. **Borrow-Friendly API**: Keys and values are accepted as `&[u8]`.
//! 4. **Cheap Clones**: Clones share the same pool and connections.

use std::time::Duration;

use bytes::Bytes;

use pkv_common::{ClientConfig, PkvError, PkvResult};

use crate::pipeline::Pipeline;
use crate::pool::PipelinePool;
use crate::resp::encoder::format_decimal;
use crate::work::{MultiReply, SingleReply};

/// Pipelined client handle.
#[derive(Clone)]
pub struct PkvClient {
    pool: PipelinePool,
}

impl PkvClient {
    /// Creates a client for one endpoint with default configuration.
    ///
    /// Connections are opened lazily by the first command.
    pub fn connect(addr: impl Into<String>) -> PkvResult<Self> {
        Self::with_config(ClientConfig::with_endpoint(addr))
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> PkvResult<Self> {
        Ok(PkvClient {
            pool: PipelinePool::new(config)?,
        })
    }

    /// Underlying pool, for warm-up and diagnostics.
    pub fn pool(&self) -> &PipelinePool {
        &self.pool
    }

    /// Picks the next pipeline from the pool.
    pub async fn pipeline(&self) -> PkvResult<Pipeline> {
        self.pool.get_pipeline().await
    }

    /// Sends one command and returns its single reply.
    pub async fn send_command<I, A>(&self, args: I) -> PkvResult<SingleReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.pool.get_pipeline().await?.send_command(args).await
    }

    /// Sends one command and returns its array reply, flattened.
    pub async fn send_multi_command<I, A>(&self, args: I) -> PkvResult<MultiReply>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.pool.get_pipeline().await?.send_multi_command(args).await
    }

    /// Pings the server. Returns the raw reply payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> PkvResult<Bytes> {
        let mut args = vec![Bytes::from_static(b"PING")];
        if let Some(data) = payload {
            args.push(Bytes::copy_from_slice(data));
        }
        self.send_command(args)
            .await?
            .ok_or(PkvError::UnexpectedReply { expected: "a PING reply" })
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &[u8]) -> PkvResult<Option<Bytes>> {
        self.send_command([Bytes::from_static(b"GET"), Bytes::copy_from_slice(key)])
            .await
    }

    /// Fetches several values in one round trip, in key order.
    pub async fn mget(&self, keys: &[&[u8]]) -> PkvResult<Vec<Option<Bytes>>> {
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push(Bytes::from_static(b"MGET"));
        args.extend(keys.iter().map(|key| Bytes::copy_from_slice(key)));
        self.send_multi_command(args).await
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> PkvResult<()> {
        self.send_command([
            Bytes::from_static(b"SET"),
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        ])
        .await?;
        Ok(())
    }

    /// Sets a value and attaches an expiration in seconds.
    pub async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> PkvResult<()> {
        let mut digits = [0u8; 20];
        let seconds = Bytes::copy_from_slice(format_decimal(ttl.as_secs(), &mut digits));
        self.send_command([
            Bytes::from_static(b"SET"),
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            Bytes::from_static(b"EX"),
            seconds,
        ])
        .await?;
        Ok(())
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn del(&self, key: &[u8]) -> PkvResult<bool> {
        let reply = self
            .send_command([Bytes::from_static(b"DEL"), Bytes::copy_from_slice(key)])
            .await?;
        Ok(parse_integer(reply)? > 0)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub async fn expire(&self, key: &[u8], ttl: Duration) -> PkvResult<bool> {
        let mut digits = [0u8; 20];
        let seconds = Bytes::copy_from_slice(format_decimal(ttl.as_secs(), &mut digits));
        let reply = self
            .send_command([
                Bytes::from_static(b"EXPIRE"),
                Bytes::copy_from_slice(key),
                seconds,
            ])
            .await?;
        Ok(parse_integer(reply)? == 1)
    }

    /// Closes every connection. Later commands fail with `Disposed`.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Interprets an integer reply delivered as raw digits.
fn parse_integer(reply: SingleReply) -> PkvResult<i64> {
    reply
        .as_deref()
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|text| text.parse().ok())
        .ok_or(PkvError::UnexpectedReply {
            expected: "an integer reply",
        })
}
