use super::{HandlerStep, Outcome, StepContext, StepFlags};
use crate::http::request::RewriteInfo;
use crate::http::{Request, Response};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use stoa_core::config::Config;
use tracing::debug;

struct CompiledRule {
    pattern: Regex,
    exclude: Option<Regex>,
    replace: String,
    is_file: bool,
    is_dir: bool,
    strict: bool,
    last: bool,
    redirect: u16,
}

/// User-configured URL rewriting, applied to `path?query` targets.
pub struct RewriteStep {
    rules: Vec<CompiledRule>,
}

impl RewriteStep {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rewrite.len());
        for rule in &config.rewrite {
            rules.push(CompiledRule {
                pattern: Regex::new(&rule.r#match)?,
                exclude: rule.exclude.as_deref().map(Regex::new).transpose()?,
                replace: rule.replace.clone(),
                is_file: rule.is_file,
                is_dir: rule.is_dir,
                strict: rule.strict,
                last: rule.last,
                redirect: rule.redirect,
            });
        }
        Ok(Self { rules })
    }

    fn rule_applies(rule: &CompiledRule, target: &str) -> bool {
        if !rule.pattern.is_match(target) {
            return false;
        }
        if let Some(exclude) = rule.exclude.as_ref() {
            if exclude.is_match(target) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl HandlerStep for RewriteStep {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn flags(&self) -> StepFlags {
        StepFlags {
            use_once: true,
            skip_on_error: true,
            ..StepFlags::default()
        }
    }

    fn matches(&self, _config: &Config, request: &Request) -> bool {
        let target = request.target();
        self.rules.iter().any(|rule| Self::rule_applies(rule, &target))
    }

    async fn execute(&self, ctx: &mut StepContext<'_>, request: &mut Request) -> Outcome {
        let original = request.target();
        let mut current = original.clone();
        let mut applied = false;

        for rule in &self.rules {
            if !Self::rule_applies(rule, &current) {
                continue;
            }
            let candidate = rule
                .pattern
                .replace(&current, rule.replace.as_str())
                .into_owned();

            if rule.is_file || rule.is_dir {
                let path_part = candidate.split('?').next().unwrap_or("");
                let docroot = request
                    .docroot
                    .clone()
                    .unwrap_or_else(|| ctx.config.paths.docroot.clone());
                let disk = docroot.join(path_part.trim_start_matches('/'));
                let ok = if rule.is_file {
                    disk.is_file()
                } else {
                    disk.is_dir()
                };
                if !ok {
                    if rule.strict {
                        return Outcome::Fatal;
                    }
                    continue;
                }
            }

            if rule.redirect > 0 {
                debug!(from = %current, to = %candidate, status = rule.redirect, "rewrite redirect");
                ctx.response = Some(Response::redirect(rule.redirect, &candidate));
                request.rewrite = Some(RewriteInfo {
                    original_url: original,
                    redirect_status: rule.redirect,
                });
                return Outcome::Ok;
            }

            debug!(from = %current, to = %candidate, "rewrite applied");
            current = candidate;
            applied = true;
            if rule.last {
                break;
            }
        }

        if applied && current != original {
            let (path, query) = match current.split_once('?') {
                Some((p, q)) => (p.to_string(), q.to_string()),
                None => (current, String::new()),
            };
            request.path = path;
            request.query = query;
            request.rewrite = Some(RewriteInfo {
                original_url: original,
                redirect_status: 0,
            });
            ctx.reprocess = true;
            ctx.reauthorize = true;
        }
        Outcome::Ok
    }
}
