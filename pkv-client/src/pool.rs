//! # Pipeline Pool
//!
//! Purpose: Spread commands over a fixed number of pipelined connections and
//! replace connections that fail, without losing commands that were never
//! sent.
//!
//! ## Design Principles
//! 1. **Fixed Slots**: `pool_size` slots, each holding exactly one live
//!    pipeline. Slots are filled together on first use.
//! 2. **Round-Robin**: An atomic cursor picks the next slot; no locks on the
//!    happy path beyond a read lock on the slot.
//! 3. **Single Repairer**: A per-slot async mutex makes sure only one caller
//!    reconnects an errored slot; everyone else waits for and reuses its
//!    result.
//! 4. **Migrate, Don't Drop**: Repair fails what was in flight on the old
//!    connection and moves what was still queued onto the new one, in order.
//!
//! ## Repair Sequence
//!
//! ```text
//! get_pipeline -> slot errored?
//!   lock slot.repair
//!     re-check (someone may have repaired already)
//!     new = connect(slot, generation + 1)
//!     old.fail_remaining()       sent, unanswered   -> stored error
//!     old.save_queue(&new)       unsent, in order   -> new pipeline
//!     old.dispose()
//!     slot.current = new
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pkv_common::{ClientConfig, PkvError, PkvResult};

use crate::buffer::BufferPool;
use crate::connection::Connector;
use crate::pipeline::Pipeline;
use crate::work::IdSource;

struct Slot {
    index: usize,
    current: RwLock<Pipeline>,
    generation: AtomicU64,
    repair: tokio::sync::Mutex<()>,
}

impl Slot {
    fn current(&self) -> Pipeline {
        self.current.read().clone()
    }
}

struct PoolInner {
    config: Arc<ClientConfig>,
    buffers: BufferPool,
    connector: Connector,
    slots: OnceCell<Vec<Slot>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Pool handle. Clones share the same connections.
#[derive(Clone)]
pub struct PipelinePool {
    inner: Arc<PoolInner>,
}

impl PipelinePool {
    /// Validates `config` and builds the pool. No connection is made until
    /// the first `get_pipeline`.
    pub fn new(config: ClientConfig) -> PkvResult<Self> {
        config.validate()?;
        let buffers = BufferPool::new(&config.buffer)?;
        let config = Arc::new(config);
        let connector = Connector::new(Arc::clone(&config), buffers.clone(), IdSource::new());
        Ok(PipelinePool {
            inner: Arc::new(PoolInner {
                config,
                buffers,
                connector,
                slots: OnceCell::new(),
                cursor: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                keepalive: Mutex::new(None),
            }),
        })
    }

    /// Returns a healthy pipeline, connecting or repairing as needed.
    pub async fn get_pipeline(&self) -> PkvResult<Pipeline> {
        let slots = self.slots().await?;
        let index = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        let slot = &slots[index];
        let pipeline = slot.current();
        if !pipeline.is_errored() {
            return Ok(pipeline);
        }
        self.inner.repair(slot).await
    }

    /// Connects every slot now instead of on first use.
    pub async fn warm_up(&self) -> PkvResult<()> {
        self.slots().await.map(|_| ())
    }

    /// Disposes every pipeline and stops keepalive. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Configured number of slots.
    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// True once the slots have been connected.
    pub fn is_connected(&self) -> bool {
        self.inner.slots.initialized()
    }

    /// Snapshot of the current pipeline in each slot (empty before connect).
    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.inner
            .slots
            .get()
            .map(|slots| slots.iter().map(Slot::current).collect())
            .unwrap_or_default()
    }

    /// Shared buffer pool, for diagnostics.
    pub fn buffers(&self) -> &BufferPool {
        &self.inner.buffers
    }

    async fn slots(&self) -> PkvResult<&Vec<Slot>> {
        if self.is_closed() {
            return Err(PkvError::Disposed);
        }
        let inner = &self.inner;
        let slots = inner
            .slots
            .get_or_try_init(|| async {
                let slots = inner.connect_all().await?;
                if let Some(interval) = inner.config.keepalive_interval() {
                    let task = spawn_keepalive(Arc::downgrade(inner), interval);
                    *inner.keepalive.lock() = Some(task);
                }
                Ok::<_, PkvError>(slots)
            })
            .await?;
        if self.is_closed() {
            // Closed while connecting: the shutdown pass may have missed these.
            for slot in slots {
                slot.current().dispose();
            }
            return Err(PkvError::Disposed);
        }
        Ok(slots)
    }
}

impl PoolInner {
    async fn connect_all(&self) -> PkvResult<Vec<Slot>> {
        let mut slots: Vec<Slot> = Vec::with_capacity(self.config.pool_size);
        for index in 0..self.config.pool_size {
            match self.connector.open(index, 0).await {
                Ok(pipeline) => slots.push(Slot {
                    index,
                    current: RwLock::new(pipeline),
                    generation: AtomicU64::new(0),
                    repair: tokio::sync::Mutex::new(()),
                }),
                Err(err) => {
                    for slot in &slots {
                        slot.current().dispose();
                    }
                    return Err(err);
                }
            }
        }
        info!(pool_size = slots.len(), "pipeline pool connected");
        Ok(slots)
    }

    async fn repair(&self, slot: &Slot) -> PkvResult<Pipeline> {
        let _claim = slot.repair.lock().await;
        let old = slot.current();
        if !old.is_errored() {
            return Ok(old);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(PkvError::Disposed);
        }

        let generation = slot.generation.load(Ordering::Acquire) + 1;
        info!(
            slot = slot.index,
            generation,
            cause = ?old.error(),
            "repairing pipeline"
        );
        let fresh = self.connector.open(slot.index, generation).await?;
        if self.closed.load(Ordering::Acquire) {
            fresh.dispose();
            return Err(PkvError::Disposed);
        }

        old.fail_remaining();
        let migrated = old.save_queue(&fresh);
        old.dispose();
        *slot.current.write() = fresh.clone();
        slot.generation.store(generation, Ordering::Release);
        debug!(slot = slot.index, generation, migrated, "pipeline replaced");
        Ok(fresh)
    }

    /// PINGs idle pipelines and repairs errored ones.
    async fn keepalive_pass(&self, timeout: Duration) {
        let slots = match self.slots.get() {
            Some(slots) => slots,
            None => return,
        };
        for slot in slots {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let pipeline = slot.current();
            if !pipeline.is_errored() && pipeline.is_idle() {
                match tokio::time::timeout(timeout, pipeline.send_command(["PING"])).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => debug!(slot = slot.index, error = %err, "keepalive ping failed"),
                    Err(_) => warn!(slot = slot.index, "keepalive ping timed out"),
                }
            }
            if slot.current().is_errored() {
                if let Err(err) = self.repair(slot).await {
                    warn!(slot = slot.index, error = %err, "keepalive repair failed");
                }
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        if let Some(slots) = self.slots.get() {
            for slot in slots {
                slot.current().dispose();
            }
        }
        debug!("pipeline pool closed");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The task holds only a weak handle, so dropping the last pool handle ends it.
fn spawn_keepalive(pool: Weak<PoolInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let inner = match pool.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            inner.keepalive_pass(interval).await;
        }
    })
}
