//! TCP relay: accept loop plus a bidirectional copy per connection
//!
//! Each accepted connection gets two sibling copy tasks, one per direction.
//! Bytes are attributed to the counter as they are written to the peer, so a
//! failed write is never counted. When one direction sees EOF it half-closes
//! the opposite socket's write side, letting the peer observe EOF while the
//! other direction keeps flowing.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stats::ProxyStats;

use super::buffer;
use super::Relay;

/// TCP forwarder for one proxy entry
pub struct TcpRelay {
    name: String,
    listen_addr: SocketAddr,
    target_addr: String,
    stats: Arc<ProxyStats>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Option<SocketAddr>,
    handle: Option<JoinHandle<()>>,
}

/// Shared per-relay state handed to every connection handler
struct ConnCtx {
    name: String,
    target_addr: String,
    stats: Arc<ProxyStats>,
}

impl TcpRelay {
    pub fn new(
        name: &str,
        listen_port: u16,
        target_host: &str,
        target_port: u16,
        stats: Arc<ProxyStats>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], listen_port)),
            target_addr: format!("{}:{}", target_host, target_port),
            stats,
            shutdown_tx,
            local_addr: None,
            handle: None,
        }
    }

    /// Bound address once started; with listen_port 0 the OS picks the port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Relay for TcpRelay {
    async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.listen_addr,
                source,
            })?;
        let local = listener.local_addr()?;
        self.local_addr = Some(local);

        info!("[{}] TCP listening on {} -> {}", self.name, local, self.target_addr);

        let ctx = Arc::new(ConnCtx {
            name: self.name.clone(),
            target_addr: self.target_addr.clone(),
            stats: self.stats.clone(),
        });
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(accept_loop(listener, ctx, shutdown_rx)));
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnCtx>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((client, peer)) => {
                        debug!("[{}] connection from {}", ctx.name, peer);
                        let ctx = ctx.clone();
                        handlers.spawn(handle_conn(client, ctx));
                    }
                    Err(e) => {
                        warn!("[{}] accept error: {}", ctx.name, e);
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    // Refuse new work first, then drain what is in flight.
    drop(listener);
    while handlers.join_next().await.is_some() {}
    debug!("[{}] TCP relay drained", ctx.name);
}

async fn handle_conn(client: TcpStream, ctx: Arc<ConnCtx>) {
    if ctx.stats.is_limit_exceeded() {
        warn!("[{}] connection rejected, traffic limit exceeded", ctx.name);
        return;
    }

    let upstream = match TcpStream::connect(&ctx.target_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "[{}] failed to connect to target {}: {}",
                ctx.name, ctx.target_addr, e
            );
            return;
        }
    };

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let stats = &ctx.stats;
    let upload = copy_counted(client_read, upstream_write, |n| stats.add_upload(n));
    let download = copy_counted(upstream_read, client_write, |n| stats.add_download(n));
    tokio::join!(upload, download);
}

/// Copy until EOF or error, crediting each successfully written chunk, then
/// half-close the write side so the peer sees EOF.
async fn copy_counted<F: Fn(u64)>(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    account: F,
) {
    let mut buf = buffer::get_buffer();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("relay read error: {}", e);
                break;
            }
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        account(n as u64);
    }

    let _ = writer.shutdown().await;
    buffer::return_buffer(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Protocol, StatsManager};

    /// Loopback echo server; returns its bound port.
    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    fn counters(limit: u64) -> Arc<ProxyStats> {
        StatsManager::new().register("echo", Protocol::Tcp, 0, 0, limit, 0)
    }

    #[tokio::test]
    async fn test_echo_accounting() {
        let echo_port = spawn_echo_server().await;
        let stats = counters(0);
        let mut relay = TcpRelay::new("echo", 0, "127.0.0.1", echo_port, stats.clone());
        relay.start().await.unwrap();
        let addr = relay.local_addr().unwrap();

        let payload = vec![0xAB; 1000];
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; 1000];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        client.shutdown().await.unwrap();
        // Our FIN propagates through the relay to the echo server and its
        // close comes back: expect EOF rather than a hang.
        assert_eq!(client.read(&mut received).await.unwrap(), 0);
        drop(client);

        relay.stop().await;
        assert_eq!(stats.total_upload(), 1000);
        assert_eq!(stats.total_download(), 1000);
    }

    #[tokio::test]
    async fn test_limit_rejects_connection() {
        let echo_port = spawn_echo_server().await;
        let stats = counters(1024);
        // Simulate an earlier client that pushed the totals past the cap.
        stats.add_upload(600);
        stats.add_download(600);

        let mut relay = TcpRelay::new("capped", 0, "127.0.0.1", echo_port, stats.clone());
        relay.start().await.unwrap();
        let addr = relay.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        // The relay closes the connection without dialing upstream.
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        relay.stop().await;
        assert_eq!(stats.total(), 1200);
    }

    #[tokio::test]
    async fn test_stop_refuses_new_connections() {
        let echo_port = spawn_echo_server().await;
        let mut relay = TcpRelay::new("echo", 0, "127.0.0.1", echo_port, counters(0));
        relay.start().await.unwrap();
        let addr = relay.local_addr().unwrap();
        relay.stop().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_upstream_dial_failure_closes_client() {
        // Point the relay at a port nothing listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let stats = counters(0);
        let mut relay = TcpRelay::new("dead", 0, "127.0.0.1", dead_port, stats.clone());
        relay.start().await.unwrap();

        let mut client = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        relay.stop().await;
        assert_eq!(stats.total(), 0);
    }
}
