use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::net::SocketAddr;

use super::types::*;

const KNOWN_HANDLERS: &[&str] = &[
    "auth",
    "admin",
    "private",
    "rewrite",
    "dynamic",
    "static",
    "directory",
];

pub fn validate_config(config: &Config) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_tls_config(&config.tls)?;
    validate_fastcgi_config(&config.fastcgi, &config.handlers)?;
    validate_handler_pipeline(&config.handlers)?;
    validate_auth_config(&config.auth)?;
    validate_rewrite_rules(&config.rewrite)?;
    Ok(())
}

fn validate_server_config(server: &ServerConfig) -> Result<()> {
    if server.address.trim().is_empty() {
        return Err(anyhow!("server.address must not be empty"));
    }
    if server.port == 0 {
        return Err(anyhow!("server.port must not be 0"));
    }
    if server.max_clients == 0 {
        return Err(anyhow!("server.max_clients must be >= 1"));
    }
    if server.keep_alive_max_requests == 0 {
        return Err(anyhow!("server.keep_alive_max_requests must be >= 1"));
    }
    if server.index_files.iter().any(|f| f.contains('/')) {
        return Err(anyhow!("server.index_files entries must be bare file names"));
    }
    Ok(())
}

fn validate_tls_config(tls: &TlsConfig) -> Result<()> {
    if !tls.enabled {
        return Ok(());
    }
    if tls.cert_path.is_none() || tls.key_path.is_none() {
        return Err(anyhow!(
            "tls.cert_path and tls.key_path are required when tls.enabled"
        ));
    }
    if tls.passphrase.is_some() {
        return Err(anyhow!(
            "tls.passphrase is not supported (encrypted private keys must be decrypted offline)"
        ));
    }
    Ok(())
}

fn validate_fastcgi_config(fastcgi: &FastCgiConfig, handlers: &[String]) -> Result<()> {
    let dynamic_enabled = handlers.iter().any(|h| h == "dynamic");
    if !dynamic_enabled {
        return Ok(());
    }
    if fastcgi.command.trim().is_empty() {
        return Err(anyhow!("fastcgi.command must not be empty"));
    }
    if !fastcgi.command.contains("{bind}") {
        return Err(anyhow!("fastcgi.command must contain the {{bind}} placeholder"));
    }
    if fastcgi.min_processes == 0 {
        return Err(anyhow!("fastcgi.min_processes must be >= 1"));
    }
    if fastcgi.min_processes > fastcgi.max_processes {
        return Err(anyhow!(
            "fastcgi.min_processes ({}) exceeds fastcgi.max_processes ({})",
            fastcgi.min_processes,
            fastcgi.max_processes
        ));
    }
    if fastcgi.binds.len() < fastcgi.max_processes {
        return Err(anyhow!(
            "fastcgi.binds must provide one addr:port per worker slot ({} < {})",
            fastcgi.binds.len(),
            fastcgi.max_processes
        ));
    }
    let mut seen = HashSet::new();
    for bind in &fastcgi.binds {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|_| anyhow!("invalid fastcgi.binds entry: {}", bind))?;
        if !seen.insert(addr) {
            return Err(anyhow!("duplicate fastcgi.binds entry: {}", bind));
        }
    }
    if fastcgi.max_clients == 0 {
        return Err(anyhow!("fastcgi.max_clients must be >= 1"));
    }
    if fastcgi.extensions.is_empty() {
        return Err(anyhow!("fastcgi.extensions must not be empty"));
    }
    if fastcgi.extensions.iter().any(|e| e.starts_with('.')) {
        return Err(anyhow!("fastcgi.extensions entries must omit the leading dot"));
    }
    Ok(())
}

fn validate_handler_pipeline(handlers: &[String]) -> Result<()> {
    if handlers.is_empty() {
        return Err(anyhow!("handlers pipeline must not be empty"));
    }
    let mut seen = HashSet::new();
    for name in handlers {
        if !KNOWN_HANDLERS.contains(&name.as_str()) {
            return Err(anyhow!("unknown handler step: {}", name));
        }
        if !seen.insert(name.as_str()) {
            return Err(anyhow!("duplicate handler step: {}", name));
        }
    }
    Ok(())
}

fn validate_auth_config(auth: &AuthConfig) -> Result<()> {
    if let Some(admin) = auth.admin.as_ref() {
        if admin.user.trim().is_empty() || admin.password.is_empty() {
            return Err(anyhow!("auth.admin user/password must not be empty"));
        }
        if admin.realm.trim().is_empty() {
            return Err(anyhow!("auth.admin.realm must not be empty"));
        }
    }
    for scope in &auth.protected {
        if !scope.prefix.starts_with('/') {
            return Err(anyhow!(
                "auth.protected prefix must start with '/': {}",
                scope.prefix
            ));
        }
        if scope.realm.trim().is_empty() {
            return Err(anyhow!(
                "auth.protected realm must not be empty for {}",
                scope.prefix
            ));
        }
        if scope.user.trim().is_empty() || scope.password.is_empty() {
            return Err(anyhow!(
                "auth.protected user/password must not be empty for {}",
                scope.prefix
            ));
        }
    }
    Ok(())
}

fn validate_rewrite_rules(rules: &[RewriteRuleConfig]) -> Result<()> {
    for rule in rules {
        regex::Regex::new(&rule.r#match)
            .map_err(|e| anyhow!("invalid rewrite match pattern '{}': {}", rule.r#match, e))?;
        if let Some(exclude) = rule.exclude.as_deref() {
            regex::Regex::new(exclude)
                .map_err(|e| anyhow!("invalid rewrite exclude pattern '{}': {}", exclude, e))?;
        }
        match rule.redirect {
            0 | 301 | 302 | 307 => {}
            other => {
                return Err(anyhow!(
                    "rewrite redirect must be 0, 301, 302 or 307 (got {})",
                    other
                ))
            }
        }
    }
    Ok(())
}
