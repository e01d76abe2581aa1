use super::static_files::resolve_under_docroot;
use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::fastcgi::FcgiSession;
use crate::http::request::FileInfo;
use crate::http::{Request, Response};
use async_trait::async_trait;
use stoa_core::config::Config;
use tracing::warn;

/// Dispatches FastCGI-extension requests to the worker pool.
pub struct DynamicStep;

fn peer_allowed(config: &Config, peer_ip: &str) -> bool {
    if config.fastcgi.allow_from.is_empty() {
        return true;
    }
    config
        .fastcgi
        .allow_from
        .iter()
        .any(|entry| peer_ip == entry || peer_ip.starts_with(entry.as_str()))
}

#[async_trait]
impl HandlerStep for DynamicStep {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            is_final: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, config: &Config, request: &Request) -> bool {
        match request.extension() {
            Some(ext) => config
                .fastcgi
                .extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let peer_ip = ctx.peer.ip().to_string();
        if !peer_allowed(ctx.config, &peer_ip) {
            warn!(client = ctx.client_id, peer = %peer_ip, "dynamic request denied by allow_from");
            ctx.response = Some(Response::error_page(
                403,
                "Dynamic content is not available from this address.",
            ));
            return Outcome::Ok;
        }

        let Some(disk_path) = resolve_under_docroot(ctx.config, request) else {
            ctx.response = Some(Response::error_page(404, "The requested script was not found."));
            return Outcome::Ok;
        };
        if !disk_path.is_file() {
            ctx.response = Some(Response::error_page(404, "The requested script was not found."));
            return Outcome::Ok;
        }
        let extension = request.extension().unwrap_or("").to_string();
        request.file = Some(FileInfo {
            disk_path,
            extension,
            content_type: "application/octet-stream",
        });

        let response = FcgiSession::run(
            ctx.pool,
            ctx.config,
            request,
            ctx.client_id,
            ctx.peer,
            ctx.secure,
        )
        .await;
        ctx.response = Some(response);
        Outcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_from_supports_exact_and_prefix_forms() {
        let mut config = Config::default();
        assert!(peer_allowed(&config, "203.0.113.9"));

        config.fastcgi.allow_from = vec!["127.0.0.1".to_string(), "10.0.".to_string()];
        assert!(peer_allowed(&config, "127.0.0.1"));
        assert!(peer_allowed(&config, "10.0.3.4"));
        assert!(!peer_allowed(&config, "203.0.113.9"));
    }
}
