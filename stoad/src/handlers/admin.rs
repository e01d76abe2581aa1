use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::response::SERVER_SIGNATURE;
use crate::http::{Request, Response};
use async_trait::async_trait;
use std::fmt::Write as _;
use stoa_core::config::Config;

const STATUS_PAGE_TEMPLATE: &str = "<!DOCTYPE html>\n<html>\n<head><title>stoa server status</title></head>\n<body>\n<h1>Server status</h1>\n<dl>\n<dt>Version</dt><dd>{version}</dd>\n<dt>Launched</dt><dd>{launched}</dd>\n<dt>Traffic out</dt><dd>{traffic-up}</dd>\n<dt>Traffic in</dt><dd>{traffic-down}</dd>\n<dt>Active clients</dt><dd>{clients}</dd>\n<dt>Aborted worker sessions</dt><dd>{aborted}</dd>\n<dt>Handlers</dt><dd>{handlers}</dd>\n</dl>\n<h2>FastCGI scoreboard</h2>\n<table border=\"1\">\n<tr><th>id</th><th>bind</th><th>pid</th><th>clients</th><th>requests</th><th>idle (s)</th></tr>\n{fcgi-scoreboard}\n</table>\n<hr>\n<address>{signature}</address>\n</body>\n</html>\n";

const INFO_PAGE_TEMPLATE: &str = "<!DOCTYPE html>\n<html>\n<head><title>stoa server info</title></head>\n<body>\n<h1>Server information</h1>\n<dl>\n<dt>Version</dt><dd>{version}</dd>\n<dt>Handler pipeline</dt><dd>{handlers}</dd>\n<dt>Document root</dt><dd>{docroot}</dd>\n<dt>Keep-alive</dt><dd>{keep-alive}</dd>\n<dt>FastCGI extensions</dt><dd>{extensions}</dd>\n<dt>Worker processes</dt><dd>{workers}</dd>\n</dl>\n<hr>\n<address>{signature}</address>\n</body>\n</html>\n";

/// Renders the reserved `/server-status` and `/server-info` pages.
pub struct AdminStep;

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[async_trait]
impl HandlerStep for AdminStep {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            is_final: true,
            use_once: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, _config: &Config, request: &Request) -> bool {
        request.path == "/server-status" || request.path == "/server-info"
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let status_page = request.path == "/server-status";
        let enabled = if status_page {
            ctx.config.admin.status_enabled
        } else {
            ctx.config.admin.info_enabled
        };
        if !enabled {
            ctx.response = Some(Response::error_page(404, "This page is disabled."));
            return Outcome::Ok;
        }
        if ctx.config.auth.admin.is_some() && request.username.is_none() {
            ctx.response = Some(Response::error_page(
                403,
                "The admin pages require authentication.",
            ));
            return Outcome::Ok;
        }

        let handler_counts = ctx
            .registry
            .step_counts()
            .iter()
            .map(|(name, count)| format!("{} ({})", name, count))
            .collect::<Vec<_>>()
            .join(", ");

        let html = if status_page {
            let scoreboard = {
                let pool = ctx.pool.lock().await;
                let mut rows = String::new();
                for row in pool.scoreboard() {
                    let _ = write!(
                        &mut rows,
                        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                        row.id,
                        row.bind,
                        row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                        row.clients,
                        row.requests,
                        row.idle_secs,
                    );
                }
                (rows, pool.aborted_sessions())
            };
            stoa_core::template::substitute(
                STATUS_PAGE_TEMPLATE,
                &[
                    ("version", env!("CARGO_PKG_VERSION").to_string()),
                    ("launched", ctx.stats.launched_display()),
                    ("traffic-up", format_bytes(ctx.stats.bytes_out())),
                    ("traffic-down", format_bytes(ctx.stats.bytes_in())),
                    ("clients", ctx.stats.active_clients().to_string()),
                    ("fcgi-scoreboard", scoreboard.0),
                    ("aborted", scoreboard.1.to_string()),
                    ("handlers", handler_counts),
                    ("signature", SERVER_SIGNATURE.to_string()),
                ],
            )
        } else {
            stoa_core::template::substitute(
                INFO_PAGE_TEMPLATE,
                &[
                    ("version", env!("CARGO_PKG_VERSION").to_string()),
                    ("handlers", ctx.pipeline_names.join(", ")),
                    (
                        "docroot",
                        ctx.config.paths.docroot.display().to_string(),
                    ),
                    (
                        "keep-alive",
                        format!(
                            "{}s timeout, {} requests",
                            ctx.config.server.keep_alive_timeout,
                            ctx.config.server.keep_alive_max_requests
                        ),
                    ),
                    ("extensions", ctx.config.fastcgi.extensions.join(", ")),
                    (
                        "workers",
                        format!(
                            "{}..{} (recycle at {} requests)",
                            ctx.config.fastcgi.min_processes,
                            ctx.config.fastcgi.max_processes,
                            ctx.config.fastcgi.max_requests
                        ),
                    ),
                    ("signature", SERVER_SIGNATURE.to_string()),
                ],
            )
        };

        ctx.response = Some(Response::with_body(200, "text/html; charset=utf-8", html));
        Outcome::Ok
    }
}
