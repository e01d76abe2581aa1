use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::parser::{format_http_date, parse_http_date};
use crate::http::request::FileInfo;
use crate::http::{Request, Response, ResponseBody};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use stoa_core::config::Config;
use tracing::debug;

/// Resolve the request path below its effective docroot. Traversal
/// segments reject the request outright.
pub fn resolve_under_docroot(config: &Config, request: &Request) -> Option<PathBuf> {
    if request.path.split('/').any(|segment| segment == "..") {
        return None;
    }
    let docroot = request
        .docroot
        .clone()
        .unwrap_or_else(|| config.paths.docroot.clone());
    Some(docroot.join(request.path.trim_start_matches('/')))
}

/// Serves files straight off the document tree.
pub struct StaticStep;

#[async_trait]
impl HandlerStep for StaticStep {
    fn name(&self) -> &'static str {
        "static"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            is_final: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, config: &Config, request: &Request) -> bool {
        match request.extension() {
            Some(ext) => !config
                .fastcgi
                .extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let Some(disk_path) = resolve_under_docroot(ctx.config, request) else {
            ctx.response = Some(Response::error_page(404, "The requested file was not found."));
            return Outcome::Ok;
        };

        let meta = match tokio::fs::metadata(&disk_path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                debug!(path = %disk_path.display(), "static file missing");
                ctx.response =
                    Some(Response::error_page(404, "The requested file was not found."));
                return Outcome::Ok;
            }
        };

        let extension = request.extension().unwrap_or("").to_string();
        let content_type = stoa_core::mime::content_type_for(&extension);
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        request.file = Some(FileInfo {
            disk_path: disk_path.clone(),
            extension,
            content_type,
        });

        if let Some(since) = request
            .headers
            .get("if-modified-since")
            .and_then(parse_http_date)
        {
            if unix_secs(modified) <= unix_secs(since) {
                let mut response = Response::new(304);
                response
                    .headers
                    .insert("Last-Modified", format_http_date(modified));
                ctx.response = Some(response);
                return Outcome::Ok;
            }
        }

        let file = match tokio::fs::File::open(&disk_path).await {
            Ok(f) => f,
            Err(_) => {
                ctx.response =
                    Some(Response::error_page(404, "The requested file was not found."));
                return Outcome::Ok;
            }
        };

        let mut response = Response::new(200);
        response.headers.insert("Content-Type", content_type);
        response
            .headers
            .insert("Last-Modified", format_http_date(modified));
        response.body = ResponseBody::File {
            file,
            remaining: meta.len(),
        };
        ctx.response = Some(response);
        Outcome::Ok
    }
}

/// HTTP dates carry second granularity; comparisons must match it.
fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
