#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

use pkv_client::{ClientConfig, PkvClient};

/// What the mock server does with one command.
pub enum Action {
    Reply(Vec<u8>),
    Close,
    /// Swallow the command and never answer it.
    Hang,
}

/// Handler arguments: connection index, command index on that connection, args.
pub type Handler = fn(usize, usize, &[Vec<u8>]) -> Action;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Starts a RESP mock server accepting any number of connections.
pub async fn spawn_server(handler: Handler) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let conn = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut idx = 0;
                while let Ok(Some(args)) = read_command(&mut reader).await {
                    match handler(conn, idx, &args) {
                        Action::Reply(bytes) => {
                            if write.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Action::Close => return,
                        Action::Hang => {}
                    }
                    idx += 1;
                }
            });
        }
    });

    (addr, accepted)
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").to_string()
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = Vec::new();
    if !read_line(reader, &mut line).await? {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if !read_line(reader, &mut line).await? {
            return Ok(None);
        }
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        if &data[len..] != b"\r\n" {
            return Err(invalid("missing crlf"));
        }
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(true)
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("length"))
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

pub fn simple(msg: &str) -> Action {
    Action::Reply(format!("+{msg}\r\n").into_bytes())
}

pub fn bulk(data: &[u8]) -> Action {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Action::Reply(out)
}

pub fn integer(value: i64) -> Action {
    Action::Reply(format!(":{value}\r\n").into_bytes())
}

pub fn error(msg: &str) -> Action {
    Action::Reply(format!("-{msg}\r\n").into_bytes())
}

pub fn test_config(endpoints: Vec<String>, pool_size: usize) -> ClientConfig {
    ClientConfig {
        endpoints,
        pool_size,
        io_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

pub fn client_with_addr(addr: String, pool_size: usize) -> PkvClient {
    PkvClient::with_config(test_config(vec![addr], pool_size)).expect("client")
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
