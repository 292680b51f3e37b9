//! # Connection Factory
//!
//! Purpose: Turn a slot index into a ready pipeline: dial the configured
//! endpoints in order, tune the socket, and authenticate.
//!
//! ## Design Principles
//! 1. **Ordered Failover**: Endpoints are tried first to last; the first one
//!    that connects and authenticates wins.
//! 2. **Ready Means Authenticated**: A pipeline is only handed to the pool
//!    after its AUTH reply arrived, so callers never race the handshake.
//! 3. **Attributed Failures**: Every failure is wrapped in `PkvError::Connect`
//!    naming the endpoint that produced it.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use pkv_common::{ClientConfig, PkvError, PkvResult};

use crate::buffer::BufferPool;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::work::IdSource;

/// Opens authenticated pipelines for the pool.
#[derive(Clone)]
pub(crate) struct Connector {
    config: Arc<ClientConfig>,
    buffers: BufferPool,
    ids: IdSource,
}

impl Connector {
    pub(crate) fn new(config: Arc<ClientConfig>, buffers: BufferPool, ids: IdSource) -> Self {
        Connector {
            config,
            buffers,
            ids,
        }
    }

    /// Connects a pipeline for `slot`, trying each endpoint in order.
    pub(crate) async fn open(&self, slot: usize, generation: u64) -> PkvResult<Pipeline> {
        let mut last_error = None;
        for endpoint in &self.config.endpoints {
            match self.open_endpoint(endpoint, slot, generation).await {
                Ok(pipeline) => {
                    info!(slot, generation, endpoint = %endpoint, "pipeline connected");
                    return Ok(pipeline);
                }
                Err(err) => {
                    warn!(slot, endpoint = %endpoint, error = %err, "endpoint unavailable");
                    last_error = Some(PkvError::connect(endpoint.as_str(), err));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PkvError::Config {
            reason: "no endpoints configured".to_string(),
        }))
    }

    async fn open_endpoint(&self, endpoint: &str, slot: usize, generation: u64) -> PkvResult<Pipeline> {
        let stream = self.dial(endpoint).await?;
        let pipeline = Pipeline::from_tcp(
            stream,
            self.buffers.clone(),
            PipelineOptions {
                slot,
                generation,
                endpoint: endpoint.to_string(),
                io_timeout: self.config.io_timeout(),
                ids: self.ids.clone(),
            },
        );
        if let Err(err) = self.authenticate(&pipeline).await {
            pipeline.dispose();
            return Err(err);
        }
        Ok(pipeline)
    }

    async fn dial(&self, endpoint: &str) -> PkvResult<TcpStream> {
        let connect = TcpStream::connect(endpoint);
        let result = match self.config.connect_timeout() {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            },
            None => connect.await,
        };
        let stream = result.map_err(|err| PkvError::transport("connect", err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| PkvError::transport("set_nodelay", err))?;
        Ok(stream)
    }

    /// Sends `AUTH [username] password` when a password is configured.
    async fn authenticate(&self, pipeline: &Pipeline) -> PkvResult<()> {
        let password = match &self.config.password {
            Some(password) => password,
            None => return Ok(()),
        };
        let mut args = vec![Bytes::from_static(b"AUTH")];
        if let Some(username) = &self.config.username {
            args.push(Bytes::from(username.clone()));
        }
        args.push(Bytes::from(password.clone()));
        pipeline.send_command(args).await?;
        debug!(slot = pipeline.slot(), "authenticated");
        Ok(())
    }
}
