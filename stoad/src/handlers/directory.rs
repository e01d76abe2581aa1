use super::static_files::resolve_under_docroot;
use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::{Request, Response};
use async_trait::async_trait;
use stoa_core::config::Config;
use tracing::debug;

/// Directory requests: add the trailing slash, then pick an index file.
pub struct DirectoryStep;

#[async_trait]
impl HandlerStep for DirectoryStep {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            is_final: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, _config: &Config, request: &Request) -> bool {
        request.extension().is_none()
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let Some(disk_path) = resolve_under_docroot(ctx.config, request) else {
            ctx.response = Some(Response::error_page(404, "The requested path was not found."));
            return Outcome::Ok;
        };

        let is_dir = tokio::fs::metadata(&disk_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        if !request.path.ends_with('/') {
            if !is_dir {
                ctx.response =
                    Some(Response::error_page(404, "The requested path was not found."));
                return Outcome::Ok;
            }
            let scheme = if ctx.secure { "https" } else { "http" };
            let host = match request.host() {
                Some(host) => host.to_string(),
                None => format!("{}:{}", ctx.config.server.address, ctx.config.server.port),
            };
            let mut location = format!("{}://{}{}/", scheme, host, request.path);
            if !request.query.is_empty() {
                location.push('?');
                location.push_str(&request.query);
            }
            debug!(location = %location, "directory redirect");
            ctx.response = Some(Response::redirect(301, &location));
            return Outcome::Ok;
        }

        if !is_dir {
            ctx.response = Some(Response::error_page(404, "The requested path was not found."));
            return Outcome::Ok;
        }

        for index in &ctx.config.server.index_files {
            if tokio::fs::metadata(disk_path.join(index))
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false)
            {
                request.path.push_str(index);
                ctx.reprocess = true;
                return Outcome::Ok;
            }
        }

        ctx.response = Some(Response::error_page(
            404,
            "No index document exists for this directory.",
        ));
        Outcome::Ok
    }
}
