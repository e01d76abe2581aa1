use crate::client;
use crate::handlers::HandlerRegistry;
use crate::pool::WorkerPool;
use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use stoa_core::config::Config;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Process-wide counters surfaced on the status page.
pub struct ServerStats {
    launched: chrono::DateTime<chrono::Local>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_clients: AtomicUsize,
    total_requests: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            launched: chrono::Local::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active_clients: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn launched_display(&self) -> String {
        self.launched.format("%d/%b/%Y %H:%M:%S %z").to_string()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn client_connected(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn request_served(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Small-integer client slots; the lowest free id is handed to each new
/// connection.
struct ClientSlots {
    taken: std::sync::Mutex<Vec<bool>>,
}

impl ClientSlots {
    fn new(count: usize) -> Self {
        Self {
            taken: std::sync::Mutex::new(vec![false; count]),
        }
    }

    fn acquire(&self) -> Option<usize> {
        let mut taken = self.taken.lock().expect("slot mutex");
        let index = taken.iter().position(|t| !t)?;
        taken[index] = true;
        Some(index + 1)
    }

    fn release(&self, id: usize) {
        let mut taken = self.taken.lock().expect("slot mutex");
        if id >= 1 && id <= taken.len() {
            taken[id - 1] = false;
        }
    }

    fn available(&self) -> usize {
        let taken = self.taken.lock().expect("slot mutex");
        taken.iter().filter(|t| !**t).count()
    }
}

/// Bind, accept, and drive clients until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let registry = Arc::new(HandlerRegistry::from_config(&config)?);
    let pool = Arc::new(Mutex::new(WorkerPool::new(config.fastcgi.clone())));
    if config.handlers.iter().any(|h| h == "dynamic") {
        pool.lock().await.start_minimum().await?;
    }
    let stats = Arc::new(ServerStats::new());
    let slots = Arc::new(ClientSlots::new(config.server.max_clients));
    let tls_acceptor = build_tls_acceptor(&config)?;

    let bind_addr = format!("{}:{}", config.server.address, config.server.port);
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid listen address {bind_addr}"))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let listener = socket.listen(config.server.queue_backlog)?;
    info!(
        addr = %bind_addr,
        tls = tls_acceptor.is_some(),
        max_clients = config.server.max_clients,
        "stoad listening"
    );

    let mut tasks: JoinSet<usize> = JoinSet::new();
    let mut reported_full = false;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        if slots.available() == 0 && !reported_full {
            warn!("client slots exhausted; new peers stay in the listen backlog");
            reported_full = true;
        }
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                match done {
                    Ok(slot) => slots.release(slot),
                    Err(e) => warn!(error = %e, "client task panicked"),
                }
            }
            accepted = listener.accept(), if slots.available() > 0 => {
                reported_full = false;
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let Some(slot) = slots.acquire() else {
                    continue;
                };
                debug!(client = slot, peer = %peer, "client connected");

                let config = Arc::clone(&config);
                let pool = Arc::clone(&pool);
                let stats = Arc::clone(&stats);
                let registry = Arc::clone(&registry);
                match tls_acceptor.clone() {
                    Some(acceptor) => {
                        tasks.spawn(async move {
                            stats.client_connected();
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(e) = client::handle_connection(
                                        tls_stream, slot, peer, true, config, pool,
                                        Arc::clone(&stats), registry,
                                    )
                                    .await
                                    {
                                        debug!(client = slot, error = %e, "client error");
                                    }
                                }
                                Err(e) => {
                                    warn!(peer = %peer, error = %e, "tls handshake failed");
                                }
                            }
                            stats.client_disconnected();
                            slot
                        });
                    }
                    None => {
                        tasks.spawn(async move {
                            stats.client_connected();
                            if let Err(e) = client::handle_connection(
                                stream, slot, peer, false, config, pool,
                                Arc::clone(&stats), registry,
                            )
                            .await
                            {
                                debug!(client = slot, error = %e, "client error");
                            }
                            stats.client_disconnected();
                            slot
                        });
                    }
                }
            }
        }
    }

    // Stop accepting, give in-flight responses a bounded step, then take
    // the workers down.
    drop(listener);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace expired; aborting remaining clients");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    pool.lock().await.shutdown().await;
    info!("stoad stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn build_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    let cert_path = config
        .tls
        .cert_path
        .as_ref()
        .ok_or_else(|| anyhow!("tls.cert_path missing"))?;
    let key_path = config
        .tls
        .key_path
        .as_ref()
        .ok_or_else(|| anyhow!("tls.key_path missing"))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open tls cert {}", cert_path.display()))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("invalid tls certificate")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path)
            .with_context(|| format!("failed to open tls key {}", key_path.display()))?,
    ))
    .context("invalid tls key")?
    .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let server_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls configuration rejected")?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}
