use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::{Request, Response};
use async_trait::async_trait;
use stoa_core::auth::DigestAuthenticator;
use stoa_core::config::Config;
use tracing::info;

/// Paths reserved for the admin pages; gated by the admin credentials.
pub const ADMIN_PATHS: &[&str] = &["/server-status", "/server-info"];
/// Private document trees, gated like the admin pages.
pub const PRIVATE_PREFIXES: &[&str] = &["/api-docs", "/extras"];

/// HTTP Digest challenge/verify for protected prefixes and admin paths.
pub struct AuthStep {
    admin: Option<DigestAuthenticator>,
    scopes: Vec<(String, DigestAuthenticator)>,
}

impl AuthStep {
    pub fn from_config(config: &Config) -> Self {
        let admin = config.auth.admin.as_ref().map(|creds| {
            DigestAuthenticator::new(
                &creds.realm,
                [(creds.user.clone(), creds.password.clone())],
            )
        });
        let mut scopes: Vec<(String, DigestAuthenticator)> = config
            .auth
            .protected
            .iter()
            .map(|scope| {
                (
                    scope.prefix.clone(),
                    DigestAuthenticator::new(
                        &scope.realm,
                        [(scope.user.clone(), scope.password.clone())],
                    ),
                )
            })
            .collect();
        // Longest prefix wins.
        scopes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
        Self { admin, scopes }
    }

    fn scope_for(&self, path: &str) -> Option<&DigestAuthenticator> {
        if is_admin_gated(path) {
            return self.admin.as_ref();
        }
        self.scopes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, auth)| auth)
    }
}

pub fn is_admin_gated(path: &str) -> bool {
    ADMIN_PATHS.contains(&path)
        || PRIVATE_PREFIXES
            .iter()
            .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

#[async_trait]
impl HandlerStep for AuthStep {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            use_once: true,
            persist: false,
            ..StepFlags::default()
        }
    }

    fn matches(&self, _config: &Config, request: &Request) -> bool {
        self.scope_for(&request.path).is_some()
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let Some(authenticator) = self.scope_for(&request.path) else {
            return Outcome::Skip;
        };

        let verified = request
            .headers
            .get("authorization")
            .and_then(|header| {
                authenticator.verify(header, request.method.as_str(), &request.target())
            });

        match verified {
            Some(username) => {
                info!(
                    client = ctx.client_id,
                    user = %username,
                    path = %request.path,
                    realm = authenticator.realm(),
                    "digest auth accepted"
                );
                request.username = Some(username);
                Outcome::Ok
            }
            None => {
                info!(
                    client = ctx.client_id,
                    path = %request.path,
                    realm = authenticator.realm(),
                    "digest auth challenge issued"
                );
                let mut response =
                    Response::error_page(401, "This resource requires authentication.");
                response
                    .headers
                    .insert("WWW-Authenticate", authenticator.challenge());
                ctx.response = Some(response);
                Outcome::Ok
            }
        }
    }
}
