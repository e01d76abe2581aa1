use crate::http::{Request, Response};
use crate::pool::WorkerPool;
use crate::server::ServerStats;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use stoa_core::config::Config;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub mod admin;
pub mod auth;
pub mod directory;
pub mod dynamic;
pub mod private_docs;
pub mod rewrite;
pub mod static_files;

/// Redispatch rounds are bounded so a rewrite loop cannot spin forever.
const MAX_DISPATCH_ROUNDS: usize = 4;

/// Result of one handler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Skip,
    Fatal,
}

#[derive(Debug, Clone, Copy)]
pub struct StepFlags {
    /// Queue terminates after this step succeeds.
    pub is_final: bool,
    /// A Fatal outcome advances the queue instead of aborting dispatch.
    pub skip_on_error: bool,
    /// Skipped on reprocessing unless reauthorization was requested.
    pub use_once: bool,
    /// When false, handler-derived request state is reset before the next
    /// dispatch round.
    pub persist: bool,
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            is_final: false,
            skip_on_error: false,
            use_once: false,
            persist: true,
        }
    }
}

/// Shared state and output slots for one handler invocation.
pub struct StepContext<'a> {
    pub config: &'a Arc<Config>,
    pub pool: &'a Arc<Mutex<WorkerPool>>,
    pub stats: &'a Arc<ServerStats>,
    pub registry: &'a HandlerRegistry,
    pub pipeline_names: &'a [String],
    pub client_id: usize,
    pub peer: SocketAddr,
    pub secure: bool,
    pub reprocessing: bool,
    /// Response produced by the step, if any.
    pub response: Option<Response>,
    /// Request mutated; run the pipeline again from the top.
    pub reprocess: bool,
    /// Run the auth step again for the mutated request.
    pub reauthorize: bool,
}

#[async_trait]
pub trait HandlerStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn flags(&self) -> StepFlags;
    fn matches(&self, config: &Config, request: &Request) -> bool;
    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome;
}

/// The process-wide handler instances, resolved from the configured
/// pipeline names, with a per-step execution counter.
pub struct HandlerRegistry {
    steps: Vec<Arc<dyn HandlerStep>>,
    counters: Vec<std::sync::atomic::AtomicU64>,
}

impl HandlerRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut steps: Vec<Arc<dyn HandlerStep>> = Vec::with_capacity(config.handlers.len());
        for name in &config.handlers {
            let step: Arc<dyn HandlerStep> = match name.as_str() {
                "auth" => Arc::new(auth::AuthStep::from_config(config)),
                "admin" => Arc::new(admin::AdminStep),
                "private" => Arc::new(private_docs::PrivateStep),
                "rewrite" => Arc::new(rewrite::RewriteStep::from_config(config)?),
                "dynamic" => Arc::new(dynamic::DynamicStep),
                "static" => Arc::new(static_files::StaticStep),
                "directory" => Arc::new(directory::DirectoryStep),
                other => return Err(anyhow!("unknown handler step: {}", other)),
            };
            steps.push(step);
        }
        let counters = steps
            .iter()
            .map(|_| std::sync::atomic::AtomicU64::new(0))
            .collect();
        Ok(Self { steps, counters })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn HandlerStep>> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    fn note_executed(&self, name: &str) {
        if let Some(index) = self.steps.iter().position(|s| s.name() == name) {
            self.counters[index].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// `(step name, executions)` per configured step, for the status page.
    pub fn step_counts(&self) -> Vec<(&'static str, u64)> {
        self.steps
            .iter()
            .zip(self.counters.iter())
            .map(|(step, count)| {
                (
                    step.name(),
                    count.load(std::sync::atomic::Ordering::Relaxed),
                )
            })
            .collect()
    }
}

/// Ordered, cursor-driven step queue for one dispatch round.
pub struct HandlerQueue {
    entries: Vec<QueueEntry>,
    cursor: usize,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    name: String,
    /// Inserted by reauthorization; bypasses the use-once skip.
    forced: bool,
}

impl HandlerQueue {
    pub fn new(pipeline: &[String]) -> Self {
        Self {
            entries: pipeline
                .iter()
                .map(|name| QueueEntry {
                    name: name.clone(),
                    forced: false,
                })
                .collect(),
            cursor: 0,
        }
    }

    fn next(&mut self) -> Option<(String, bool)> {
        let entry = self.entries.get(self.cursor)?;
        let out = (entry.name.clone(), entry.forced);
        self.cursor += 1;
        Some(out)
    }

    /// Insert a step to run immediately after the current one.
    pub fn insert_after_cursor(&mut self, name: &str) {
        self.entries.insert(
            self.cursor.min(self.entries.len()),
            QueueEntry {
                name: name.to_string(),
                forced: true,
            },
        );
    }
}

/// Drive the handler pipeline for one parsed request and produce the
/// response.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    registry: &HandlerRegistry,
    config: &Arc<Config>,
    pool: &Arc<Mutex<WorkerPool>>,
    stats: &Arc<ServerStats>,
    client_id: usize,
    peer: SocketAddr,
    secure: bool,
    request: &mut Request,
) -> Response {
    let mut executed_once: HashSet<String> = HashSet::new();
    let mut reprocess_flags = StepFlags::default();
    let mut ctx = StepContext {
        config,
        pool,
        stats,
        registry,
        pipeline_names: &config.handlers,
        client_id,
        peer,
        secure,
        reprocessing: false,
        response: None,
        reprocess: false,
        reauthorize: false,
    };

    for round in 0..MAX_DISPATCH_ROUNDS {
        ctx.reprocessing = round > 0;
        let mut queue = HandlerQueue::new(&config.handlers);

        while let Some((name, forced)) = queue.next() {
            let Some(step) = registry.get(&name) else {
                continue;
            };
            let flags = step.flags();
            if ctx.reprocessing && flags.use_once && executed_once.contains(&name) && !forced {
                continue;
            }
            if !step.matches(config, request) {
                continue;
            }
            executed_once.insert(name.clone());
            registry.note_executed(&name);

            let outcome = step.execute(&mut ctx, request).await;
            debug!(
                client = client_id,
                step = %name,
                outcome = ?outcome,
                "handler step executed"
            );
            match outcome {
                Outcome::Ok => {
                    if ctx.reauthorize && !ctx.reprocess {
                        ctx.reauthorize = false;
                        queue.insert_after_cursor("auth");
                    }
                    if ctx.reprocess {
                        reprocess_flags = flags;
                        break;
                    }
                    if ctx.response.is_some() || flags.is_final {
                        break;
                    }
                }
                Outcome::Skip => continue,
                Outcome::Fatal => {
                    if flags.skip_on_error {
                        warn!(client = client_id, step = %name, "handler failed; skipping");
                        continue;
                    }
                    return ctx.response.take().unwrap_or_else(|| {
                        Response::error_page(500, "The request could not be processed.")
                    });
                }
            }
        }

        if let Some(response) = ctx.response.take() {
            return response;
        }
        if ctx.reprocess {
            ctx.reprocess = false;
            if ctx.reauthorize {
                // Let the auth step run once more for the mutated request.
                ctx.reauthorize = false;
                executed_once.remove("auth");
            }
            // File resolution always restarts from the mutated URL; a
            // non-persistent requester additionally drops its docroot view.
            request.file = None;
            if !reprocess_flags.persist {
                request.docroot = None;
            }
            continue;
        }
        break;
    }

    Response::error_page(500, "No handler available for this request.")
}
