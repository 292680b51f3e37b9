//! # Pipeline Benchmark Harness
//!
//! Purpose: Drive a Redis-compatible server through the pipelined client from
//! many concurrent tasks so throughput and latency can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys and values are pre-built from fixed seeds.
//! 2. **Shared Pool**: Every task draws from one `PkvClient`, which is the
//!    situation pipelining is built for.
//! 3. **Positional Arguments**: `pkv-bench [addr] [tasks] [ops] [value_size] [config.json]`.

use std::env;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pkv_client::PkvClient;
use pkv_common::ClientConfig;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_TASKS: usize = 64;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const KEY_COUNT: usize = 1 << 12;

struct BenchConfig {
    tasks: usize,
    op_count: usize,
    value_size: usize,
    client: ClientConfig,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let tasks = parse_usize(args.next(), DEFAULT_TASKS).max(1);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        let mut client = match args.next() {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading client config {path}"))?;
                serde_json::from_str::<ClientConfig>(&raw)
                    .with_context(|| format!("parsing client config {path}"))?
            }
            None => ClientConfig::default(),
        };
        client.endpoints = vec![addr];

        Ok(BenchConfig {
            tasks,
            op_count,
            value_size,
            client,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn write_u64_le(value: u64, buffer: &mut [u8]) {
    let bytes = value.to_le_bytes();
    let copy_len = buffer.len().min(bytes.len());
    buffer[..copy_len].copy_from_slice(&bytes[..copy_len]);
}

fn build_keys(count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(format!("pkv-bench:{i:08}")))
        .collect()
}

fn build_value(size: usize, seed: u64) -> Bytes {
    let mut buffer = vec![b'v'; size];
    write_u64_le(seed, &mut buffer);
    Bytes::from(buffer)
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

/// Runs `op_count` commands split across `tasks` workers; returns total latency.
async fn run_phase(
    client: &PkvClient,
    config: &BenchConfig,
    keys: &[Bytes],
    value: &Bytes,
    write: bool,
) -> Result<Duration> {
    let per_task = config.op_count / config.tasks;
    let mut handles = Vec::with_capacity(config.tasks);
    for task in 0..config.tasks {
        let client = client.clone();
        let keys = keys.to_vec();
        let value = value.clone();
        handles.push(tokio::spawn(async move {
            let mut latency = Duration::ZERO;
            for op in 0..per_task {
                let key = keys[(task * per_task + op) % keys.len()].clone();
                let started = Instant::now();
                if write {
                    client
                        .send_command([Bytes::from_static(b"SET"), key, value.clone()])
                        .await?;
                } else {
                    client.send_command([Bytes::from_static(b"GET"), key]).await?;
                }
                latency += started.elapsed();
            }
            Ok::<_, pkv_common::PkvError>(latency)
        }));
    }

    let mut total = Duration::ZERO;
    for handle in handles {
        total += handle.await.context("bench task panicked")??;
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BenchConfig::from_args()?;
    let client = PkvClient::with_config(config.client.clone()).context("building client")?;
    client.pool().warm_up().await.context("connecting")?;
    info!(endpoints = ?config.client.endpoints, pool_size = config.client.pool_size, "connected");

    let keys = build_keys(KEY_COUNT);
    let value = build_value(config.value_size, 0x5A5A_5A5A_5A5A_5A5A);
    let ops = (config.op_count / config.tasks) * config.tasks;
    println!(
        "tasks={}, ops={}, value_size={}, pool_size={}",
        config.tasks, ops, config.value_size, config.client.pool_size
    );
    if ops == 0 {
        return Ok(());
    }

    for (label, write) in [("set", true), ("get", false)] {
        let start = Instant::now();
        let latency = run_phase(&client, &config, &keys, &value, write).await?;
        report(label, ops, start.elapsed());
        println!("{label}: mean latency {:.1} us", latency.as_secs_f64() * 1e6 / ops as f64);
    }

    client.close();
    Ok(())
}
