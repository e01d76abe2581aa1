use crate::fastcgi::codec::{
    self, EndRequest, Record, FCGI_END_REQUEST, FCGI_RESPONDER, FCGI_STDOUT,
};
use crate::http::parser::{find_header_boundary, parse_backend_headers};
use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use stoa_core::config::FastCgiConfig;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_micros(500);
const PID_PROBE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Launches worker processes. The production launcher runs the configured
/// command; tests stub it out to exercise selection policy without spawning.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, command: &str, bind: &str) -> Result<LaunchedWorker>;
}

pub struct LaunchedWorker {
    pub child: Option<Child>,
    pub pid: Option<u32>,
}

pub struct CommandLauncher;

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, command: &str, bind: &str) -> Result<LaunchedWorker> {
        let rendered = command.replace("{bind}", bind);
        let mut parts = rendered.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("empty fastcgi command"))?;
        let child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker: {rendered}"))?;
        let pid = child.id();
        Ok(LaunchedWorker {
            child: Some(child),
            pid,
        })
    }
}

#[derive(Debug)]
pub struct Worker {
    pub id: usize,
    pub bind: String,
    pub pid: Option<u32>,
    pub clients: usize,
    pub requests: u64,
    pub last_active: Instant,
    child: Option<Child>,
}

/// One scoreboard line for the status page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreboardRow {
    pub id: usize,
    pub bind: String,
    pub pid: Option<u32>,
    pub clients: usize,
    pub requests: u64,
    pub idle_secs: u64,
}

/// Internal selection verdict, factored out of `connect` so policy is
/// testable without sockets.
#[derive(Debug, PartialEq, Eq)]
enum Selection {
    Existing(usize),
    Spawn,
    Unavailable,
}

pub struct WorkerPool {
    config: FastCgiConfig,
    workers: HashMap<usize, Worker>,
    aborted_sessions: u64,
    launcher: Box<dyn WorkerLauncher>,
}

impl WorkerPool {
    pub fn new(config: FastCgiConfig) -> Self {
        Self::with_launcher(config, Box::new(CommandLauncher))
    }

    pub fn with_launcher(config: FastCgiConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            workers: HashMap::new(),
            aborted_sessions: 0,
            launcher,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Bring the pool up to the configured minimum.
    pub async fn start_minimum(&mut self) -> Result<()> {
        while self.workers.len() < self.config.min_processes {
            let id = self.spawn_worker()?;
            self.discover_pid(id).await;
        }
        Ok(())
    }

    /// Obtain a worker connection for a client.
    ///
    /// Policy: preferred worker if still alive, else an idle worker, else a
    /// fresh spawn up to the maximum, else the least busy, else fail.
    /// Retries are time-boxed; the client count is incremented exactly once,
    /// on success.
    pub async fn connect(
        &mut self,
        client_id: usize,
        preferred: Option<usize>,
    ) -> Result<(usize, TcpStream)> {
        self.cull();
        self.recycle_exhausted();

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            let id = match self.select(preferred) {
                Selection::Existing(id) => id,
                Selection::Spawn => {
                    let id = self.spawn_worker()?;
                    self.discover_pid(id).await;
                    id
                }
                Selection::Unavailable => break,
            };
            let bind = match self.workers.get(&id) {
                Some(w) => w.bind.clone(),
                None => continue,
            };
            match TcpStream::connect(&bind).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let worker = self
                        .workers
                        .get_mut(&id)
                        .ok_or_else(|| anyhow!("worker {} vanished", id))?;
                    worker.clients += 1;
                    worker.requests += 1;
                    worker.last_active = Instant::now();
                    debug!(worker = id, client = client_id, "worker connection established");
                    return Ok((id, stream));
                }
                Err(e) => {
                    // The expensive liveness check is reserved for exactly
                    // this path.
                    if !self.worker_alive(id) {
                        warn!(worker = id, "worker process gone; removing from pool");
                        self.remove_worker(id);
                    }
                    last_err = Some(anyhow::Error::from(e).context(format!(
                        "connect to worker {} at {} failed",
                        id, bind
                    )));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no FastCGI worker available")))
    }

    /// Return a connection slot after a session finishes or aborts.
    pub fn release(&mut self, worker_id: usize) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.clients = worker.clients.saturating_sub(1);
            worker.last_active = Instant::now();
        }
    }

    pub fn note_aborted(&mut self) {
        self.aborted_sessions += 1;
    }

    pub fn aborted_sessions(&self) -> u64 {
        self.aborted_sessions
    }

    pub fn scoreboard(&self) -> Vec<ScoreboardRow> {
        let mut rows: Vec<ScoreboardRow> = self
            .workers
            .values()
            .map(|w| ScoreboardRow {
                id: w.id,
                bind: w.bind.clone(),
                pid: w.pid,
                clients: w.clients,
                requests: w.requests,
                idle_secs: w.last_active.elapsed().as_secs(),
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Terminate every worker; used on shutdown. Kills are batched: signal
    /// the whole list first, then reap.
    pub async fn shutdown(&mut self) {
        let ids: Vec<usize> = self.workers.keys().copied().collect();
        let mut children = Vec::new();
        for id in ids {
            if let Some(mut worker) = self.workers.remove(&id) {
                info!(worker = id, pid = ?worker.pid, "terminating worker");
                if let Some(mut child) = worker.child.take() {
                    let _ = child.start_kill();
                    children.push(child);
                }
            }
        }
        for mut child in children {
            let _ = child.wait().await;
        }
    }

    fn select(&mut self, preferred: Option<usize>) -> Selection {
        if let Some(id) = preferred {
            if self.workers.contains_key(&id) {
                return Selection::Existing(id);
            }
        }
        if let Some(id) = self
            .workers
            .values()
            .filter(|w| w.clients == 0)
            .map(|w| w.id)
            .min()
        {
            return Selection::Existing(id);
        }
        if self.workers.len() < self.config.max_processes {
            return Selection::Spawn;
        }
        self.workers
            .values()
            .filter(|w| w.clients < self.config.max_clients)
            .min_by_key(|w| (w.clients, w.id))
            .map(|w| Selection::Existing(w.id))
            .unwrap_or(Selection::Unavailable)
    }

    /// Drop surplus workers idle past the configured threshold. Runs at the
    /// top of every `connect`.
    fn cull(&mut self) {
        let limit = Duration::from_secs(self.config.cull_time_limit * 60);
        let min = self.config.min_processes;
        let mut doomed: Vec<usize> = self
            .workers
            .values()
            .filter(|w| w.clients == 0 && w.last_active.elapsed() >= limit)
            .map(|w| w.id)
            .collect();
        doomed.sort();
        while self.workers.len() > min {
            let Some(id) = doomed.pop() else { break };
            info!(worker = id, "culling idle worker");
            self.remove_worker(id);
        }
    }

    /// Cheap liveness check: recycle drained workers past the request
    /// threshold.
    fn recycle_exhausted(&mut self) {
        let threshold = self.config.max_requests;
        let doomed: Vec<usize> = self
            .workers
            .values()
            .filter(|w| w.clients == 0 && w.requests >= threshold)
            .map(|w| w.id)
            .collect();
        for id in doomed {
            info!(worker = id, "recycling worker past max_requests");
            self.remove_worker(id);
        }
    }

    fn spawn_worker(&mut self) -> Result<usize> {
        let (id, bind) = self
            .free_slot()
            .ok_or_else(|| anyhow!("no free worker slot"))?;
        let launched = self.launcher.launch(&self.config.command, &bind)?;
        info!(worker = id, bind = %bind, pid = ?launched.pid, "spawned worker");
        self.workers.insert(
            id,
            Worker {
                id,
                bind,
                pid: launched.pid,
                clients: 0,
                requests: 0,
                last_active: Instant::now(),
                child: launched.child,
            },
        );
        Ok(id)
    }

    /// Worker ids are 1-based indexes into the configured bind list.
    fn free_slot(&self) -> Option<(usize, String)> {
        self.config
            .binds
            .iter()
            .enumerate()
            .map(|(i, bind)| (i + 1, bind.clone()))
            .find(|(id, _)| !self.workers.contains_key(id))
    }

    fn remove_worker(&mut self, id: usize) {
        if let Some(mut worker) = self.workers.remove(&id) {
            if let Some(mut child) = worker.child.take() {
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
    }

    /// Accurate but expensive existence check, reserved for connect
    /// failures.
    fn worker_alive(&mut self, id: usize) -> bool {
        let Some(worker) = self.workers.get_mut(&id) else {
            return false;
        };
        match worker.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_exit)) => false,
                Ok(None) => true,
                Err(_) => false,
            },
            // Launched detached; assume alive and let connect retries decide.
            None => true,
        }
    }

    /// Ask a fresh worker for its PID over FastCGI: a zero-id HEAD request
    /// to a well-known endpoint answered with an `X-Worker-Pid` header.
    async fn discover_pid(&mut self, id: usize) {
        let Some(bind) = self.workers.get(&id).map(|w| w.bind.clone()) else {
            return;
        };
        match timeout(PID_PROBE_TIMEOUT, probe_worker_pid(&bind)).await {
            Ok(Ok(pid)) => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.pid = Some(pid);
                }
            }
            Ok(Err(e)) => {
                debug!(worker = id, error = %e, "pid probe failed; keeping launcher pid");
            }
            Err(_) => {
                debug!(worker = id, "pid probe timed out; keeping launcher pid");
            }
        }
    }
}

/// Send the zero-id HEAD probe and parse `X-Worker-Pid` from the reply.
async fn probe_worker_pid(bind: &str) -> Result<u32> {
    // A fresh worker may not have bound its socket yet.
    let mut stream = None;
    for _ in 0..20 {
        match TcpStream::connect(bind).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut stream = stream.ok_or_else(|| anyhow!("pid probe connect failed: {bind}"))?;

    codec::write_begin_request(&mut stream, 0, FCGI_RESPONDER, 0).await?;
    let mut params = BytesMut::new();
    codec::encode_param(&mut params, b"REQUEST_METHOD", b"HEAD")?;
    codec::encode_param(&mut params, b"SCRIPT_NAME", b"/__worker_pid")?;
    codec::write_record(&mut stream, codec::FCGI_PARAMS, 0, &params).await?;
    codec::write_record(&mut stream, codec::FCGI_PARAMS, 0, &[]).await?;
    codec::write_record(&mut stream, codec::FCGI_STDIN, 0, &[]).await?;

    let mut record = Record::new();
    let mut head = BytesMut::new();
    loop {
        codec::read_record_into(&mut stream, &mut record).await?;
        match record.header.record_type {
            FCGI_STDOUT => {
                head.extend_from_slice(&record.content);
                if let Some((pos, _sep)) = find_header_boundary(&head) {
                    let (_status, headers) = parse_backend_headers(&head[..pos])
                        .map_err(|e| anyhow!("pid probe header parse: {e}"))?;
                    let pid = headers
                        .get("x-worker-pid")
                        .and_then(|v| v.trim().parse::<u32>().ok())
                        .ok_or_else(|| anyhow!("pid probe reply missing X-Worker-Pid"))?;
                    return Ok(pid);
                }
            }
            FCGI_END_REQUEST => {
                let end = EndRequest::decode(&record.content)?;
                return Err(anyhow!(
                    "pid probe ended without headers (protocol_status {})",
                    end.protocol_status
                ));
            }
            _ => {}
        }
    }
}
