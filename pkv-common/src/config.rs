//! # Client Configuration
//!
//! Purpose: Describe everything the pipelining engine consumes from the
//! outside: endpoints, credentials, pool sizing, buffer geometry and timeouts.
//!
//! ## Design Principles
//! 1. **Plain Data**: Structs are `serde`-deserialisable with defaults for every
//!    field, so a partial JSON/TOML document is enough.
//! 2. **Milliseconds On The Wire**: Durations are stored as `*_ms` integers and
//!    exposed through accessors; `0` means "no timeout".
//! 3. **Validate Once**: `validate` runs before any socket is opened.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PkvError, PkvResult};

/// Default number of pipelines per client.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default number of chunks carved out of one segment.
pub const DEFAULT_CHUNKS_PER_SEGMENT: usize = 16;

/// Buffer pool geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of every chunk in bytes. Fixed for the lifetime of the pool.
    pub chunk_size: usize,
    /// Chunks allocated together as one segment.
    pub chunks_per_segment: usize,
    /// Segments allocated eagerly at construction.
    pub initial_segments: usize,
    /// Upper bound on chunks ever allocated.
    pub max_chunks: usize,
    /// How long a checkout waits for a chunk when the pool is exhausted.
    pub checkout_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_segment: DEFAULT_CHUNKS_PER_SEGMENT,
            initial_segments: 1,
            max_chunks: 1024,
            checkout_timeout_ms: 1000,
        }
    }
}

impl BufferConfig {
    /// Checkout wait window; `None` waits forever.
    pub fn checkout_timeout(&self) -> Option<Duration> {
        millis(self.checkout_timeout_ms)
    }

    /// Rejects geometry the pool cannot honour.
    pub fn validate(&self) -> PkvResult<()> {
        if self.chunk_size == 0 {
            return Err(config_error("chunk_size must be positive"));
        }
        if self.chunks_per_segment == 0 {
            return Err(config_error("chunks_per_segment must be positive"));
        }
        if self.max_chunks < self.chunks_per_segment {
            return Err(config_error(
                "max_chunks must hold at least one segment",
            ));
        }
        Ok(())
    }
}

/// Configuration for a client and its pipeline pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoints, tried in order on every new connection.
    pub endpoints: Vec<String>,
    /// Password for the AUTH handshake. `None` skips authentication.
    pub password: Option<String>,
    /// ACL username, only sent together with `password`.
    pub username: Option<String>,
    /// Number of pipelines (physical connections).
    pub pool_size: usize,
    /// Periodically PING idle pipelines and repair stale ones.
    pub keepalive: bool,
    /// Keepalive period.
    pub keepalive_interval_ms: u64,
    /// Per-connection read/write timeout.
    pub io_timeout_ms: u64,
    /// Dial timeout per endpoint.
    pub connect_timeout_ms: u64,
    /// Buffer pool geometry shared by every pipeline.
    pub buffer: BufferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoints: vec!["127.0.0.1:6379".to_string()],
            password: None,
            username: None,
            pool_size: DEFAULT_POOL_SIZE,
            keepalive: false,
            keepalive_interval_ms: 10_000,
            io_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            buffer: BufferConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at a single endpoint.
    pub fn with_endpoint(addr: impl Into<String>) -> Self {
        ClientConfig {
            endpoints: vec![addr.into()],
            ..ClientConfig::default()
        }
    }

    /// Per-connection I/O timeout.
    pub fn io_timeout(&self) -> Option<Duration> {
        millis(self.io_timeout_ms)
    }

    /// Dial timeout per endpoint.
    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    /// Keepalive period; `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        if !self.keepalive {
            return None;
        }
        millis(self.keepalive_interval_ms)
    }

    /// Rejects configurations the pool cannot run with.
    pub fn validate(&self) -> PkvResult<()> {
        if self.endpoints.is_empty() {
            return Err(config_error("at least one endpoint is required"));
        }
        if self.pool_size == 0 {
            return Err(config_error("pool_size must be positive"));
        }
        if self.keepalive && self.keepalive_interval_ms == 0 {
            return Err(config_error("keepalive_interval_ms must be positive"));
        }
        self.buffer.validate()
    }
}

fn millis(value: u64) -> Option<Duration> {
    if value == 0 {
        None
    } else {
        Some(Duration::from_millis(value))
    }
}

fn config_error(reason: &str) -> PkvError {
    PkvError::Config {
        reason: reason.to_string(),
    }
}
