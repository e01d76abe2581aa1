use super::auth::PRIVATE_PREFIXES;
use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::{Request, Response};
use async_trait::async_trait;
use stoa_core::config::Config;

/// Remaps the reserved private prefixes onto the server's own document
/// tree.
pub struct PrivateStep;

fn matching_prefix(path: &str) -> Option<&'static str> {
    PRIVATE_PREFIXES
        .iter()
        .copied()
        .find(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

#[async_trait]
impl HandlerStep for PrivateStep {
    fn name(&self) -> &'static str {
        "private"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            use_once: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, _config: &Config, request: &Request) -> bool {
        matching_prefix(&request.path).is_some()
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let Some(prefix) = matching_prefix(&request.path) else {
            return Outcome::Skip;
        };
        if ctx.config.auth.admin.is_some() && request.username.is_none() {
            ctx.response = Some(Response::error_page(
                403,
                "The private document tree requires authentication.",
            ));
            return Outcome::Ok;
        }

        request.docroot = Some(ctx.config.paths.server_docroot.join(&prefix[1..]));
        let rest = &request.path[prefix.len()..];
        request.path = if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };
        ctx.reprocess = true;
        Outcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_requires_segment_boundary() {
        assert_eq!(matching_prefix("/api-docs"), Some("/api-docs"));
        assert_eq!(matching_prefix("/api-docs/guide.html"), Some("/api-docs"));
        assert_eq!(matching_prefix("/api-docsx"), None);
        assert_eq!(matching_prefix("/extras/"), Some("/extras"));
        assert_eq!(matching_prefix("/other"), None);
    }
}
