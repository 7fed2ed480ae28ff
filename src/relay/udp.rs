//! UDP relay: one listen socket, synthesized per-client sessions
//!
//! UDP has no connections, so the relay keys a session on the datagram's
//! source address. Each session owns a connected upstream socket and a
//! downstream reader task; the listen socket is shared between the read loop
//! and every downstream writer (tokio's `UdpSocket` sends through `&self`).
//! Sessions expire when idle: the reader usually reclaims its own session on
//! a read deadline, and a periodic sweep catches the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stats::ProxyStats;

use super::Relay;

/// Maximum UDP datagram size
const UDP_BUFFER_SIZE: usize = 65535;

/// A session is reclaimed after this long without traffic in either direction
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the stale-session sweep
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// One synthesized client session
struct UdpSession {
    upstream: UdpSocket,
    client_addr: SocketAddr,
    last_active: Mutex<Instant>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }
}

type SessionMap = Arc<RwLock<HashMap<SocketAddr, Arc<UdpSession>>>>;

/// UDP forwarder for one proxy entry
pub struct UdpRelay {
    name: String,
    listen_addr: SocketAddr,
    target_addr: String,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    stats: Arc<ProxyStats>,
    sessions: SessionMap,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Option<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
}

/// Shared state for the read loop, session readers and the cleanup sweep
struct RelayCtx {
    name: String,
    target: SocketAddr,
    idle_timeout: Duration,
    stats: Arc<ProxyStats>,
    sessions: SessionMap,
    listen: Arc<UdpSocket>,
    shutdown_tx: broadcast::Sender<()>,
    limit_logged: AtomicBool,
}

impl UdpRelay {
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
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stats,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            local_addr: None,
            handles: Vec::new(),
        }
    }

    /// Override the idle timeout and sweep period.
    pub fn with_timeouts(mut self, idle_timeout: Duration, cleanup_interval: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.cleanup_interval = cleanup_interval;
        self
    }

    /// Bound address once started; with listen_port 0 the OS picks the port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live client sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[async_trait]
impl Relay for UdpRelay {
    async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.listen_addr,
                source,
            })?;
        let local = socket.local_addr()?;
        self.local_addr = Some(local);

        let target = tokio::net::lookup_host(&self.target_addr)
            .await?
            .next()
            .ok_or_else(|| {
                Error::Config(format!("No addresses found for {}", self.target_addr))
            })?;

        info!("[{}] UDP listening on {} -> {}", self.name, local, target);

        let ctx = Arc::new(RelayCtx {
            name: self.name.clone(),
            target,
            idle_timeout: self.idle_timeout,
            stats: self.stats.clone(),
            sessions: self.sessions.clone(),
            listen: Arc::new(socket),
            shutdown_tx: self.shutdown_tx.clone(),
            limit_logged: AtomicBool::new(false),
        });

        self.handles
            .push(tokio::spawn(read_loop(ctx.clone(), self.shutdown_tx.subscribe())));
        self.handles.push(tokio::spawn(cleanup_loop(
            ctx,
            self.cleanup_interval,
            self.shutdown_tx.subscribe(),
        )));
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        // Session readers exit on the same signal; dropping the entries
        // closes their upstream sockets.
        self.sessions.write().unwrap().clear();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn read_loop(ctx: Arc<RelayCtx>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (n, client_addr) = tokio::select! {
            result = ctx.listen.recv_from(&mut buf) => {
                match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("[{}] read error: {}", ctx.name, e);
                        continue;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        };

        ctx.stats.add_upload(n as u64);

        // No connection to refuse on UDP: the cap is logged once and
        // forwarding continues.
        if ctx.stats.is_limit_exceeded() && !ctx.limit_logged.swap(true, Ordering::Relaxed) {
            warn!("[{}] traffic limit exceeded, UDP keeps forwarding", ctx.name);
        }

        let Some(session) = get_or_create_session(&ctx, client_addr).await else {
            continue;
        };

        session.touch();
        if let Err(e) = session.upstream.send(&buf[..n]).await {
            warn!("[{}] write to target error: {}", ctx.name, e);
        }
    }
}

async fn get_or_create_session(
    ctx: &Arc<RelayCtx>,
    client_addr: SocketAddr,
) -> Option<Arc<UdpSession>> {
    if let Some(session) = ctx.sessions.read().unwrap().get(&client_addr) {
        return Some(session.clone());
    }

    // Dial outside the lock; the map is re-checked below in case a second
    // packet from the same source raced us here.
    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("[{}] failed to bind session socket: {}", ctx.name, e);
            return None;
        }
    };
    if let Err(e) = upstream.connect(ctx.target).await {
        warn!("[{}] failed to connect to target: {}", ctx.name, e);
        return None;
    }

    let session = Arc::new(UdpSession {
        upstream,
        client_addr,
        last_active: Mutex::new(Instant::now()),
    });

    {
        let mut map = ctx.sessions.write().unwrap();
        if let Some(existing) = map.get(&client_addr) {
            return Some(existing.clone());
        }
        map.insert(client_addr, session.clone());
    }

    debug!("[{}] new session for {}", ctx.name, client_addr);
    tokio::spawn(session_loop(
        ctx.clone(),
        session.clone(),
        ctx.shutdown_tx.subscribe(),
    ));
    Some(session)
}

/// Per-session downstream reader: upstream replies flow back to the client
/// through the shared listen socket. The read deadline doubles as the idle
/// check; an expired session removes itself.
async fn session_loop(
    ctx: Arc<RelayCtx>,
    session: Arc<UdpSession>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            read = timeout(ctx.idle_timeout, session.upstream.recv(&mut buf)) => read,
            _ = shutdown_rx.recv() => return,
        };

        match read {
            Ok(Ok(n)) => {
                ctx.stats.add_download(n as u64);
                session.touch();
                if let Err(e) = ctx.listen.send_to(&buf[..n], session.client_addr).await {
                    warn!("[{}] write to client error: {}", ctx.name, e);
                }
            }
            Ok(Err(e)) => {
                debug!(
                    "[{}] session {} upstream error: {}",
                    ctx.name, session.client_addr, e
                );
                remove_session(ctx.as_ref(), session.client_addr);
                return;
            }
            Err(_) => {
                if session.idle_for() > ctx.idle_timeout {
                    debug!("[{}] session {} idle, closing", ctx.name, session.client_addr);
                    remove_session(ctx.as_ref(), session.client_addr);
                    return;
                }
            }
        }
    }
}

fn remove_session(ctx: &RelayCtx, client_addr: SocketAddr) {
    ctx.sessions.write().unwrap().remove(&client_addr);
}

/// Safety net behind the per-session deadline: sweep out anything idle.
async fn cleanup_loop(
    ctx: Arc<RelayCtx>,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut map = ctx.sessions.write().unwrap();
                let before = map.len();
                map.retain(|_, session| session.idle_for() <= ctx.idle_timeout);
                let evicted = before - map.len();
                if evicted > 0 {
                    debug!("[{}] evicted {} stale sessions", ctx.name, evicted);
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}
