use super::defaults::*;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub fastcgi: FastCgiConfig,
    /// Ordered handler pipeline; names resolve against the built-in registry.
    #[serde(default = "default_handler_pipeline")]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub rewrite: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Concurrent client connection cap; a full house leaves new peers in
    /// the kernel backlog.
    #[serde(default = "default_server_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_server_queue_backlog")]
    pub queue_backlog: u32,
    /// Seconds an idle kept-alive connection may wait for its next request.
    #[serde(default = "default_server_keep_alive_timeout")]
    pub keep_alive_timeout: u64,
    #[serde(default = "default_server_keep_alive_max_requests")]
    pub keep_alive_max_requests: u32,
    #[serde(default = "default_server_index_files")]
    pub index_files: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            port: default_server_port(),
            max_clients: default_server_max_clients(),
            queue_backlog: default_server_queue_backlog(),
            keep_alive_timeout: default_server_keep_alive_timeout(),
            keep_alive_max_requests: default_server_keep_alive_max_requests(),
            index_files: default_server_index_files(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Accepted for config compatibility; encrypted keys are rejected at
    /// validation time.
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FastCgiConfig {
    /// Worker launch command; `{bind}` is replaced with the worker's
    /// `addr:port`.
    #[serde(default = "default_fastcgi_command")]
    pub command: String,
    #[serde(default = "default_fastcgi_min_processes")]
    pub min_processes: usize,
    #[serde(default = "default_fastcgi_max_processes")]
    pub max_processes: usize,
    /// Requests served before a worker is recycled.
    #[serde(default = "default_fastcgi_max_requests")]
    pub max_requests: u64,
    /// Minutes a surplus worker may sit idle before it is culled.
    #[serde(default = "default_fastcgi_cull_time_limit")]
    pub cull_time_limit: u64,
    /// Concurrent clients a single worker may serve.
    #[serde(default = "default_fastcgi_max_clients")]
    pub max_clients: usize,
    /// File suffixes dispatched to workers.
    #[serde(default = "default_fastcgi_extensions")]
    pub extensions: Vec<String>,
    /// One `addr:port` per potential worker slot.
    #[serde(default = "default_fastcgi_binds")]
    pub binds: Vec<String>,
    /// Client addresses allowed to reach dynamic handlers; empty allows all.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Output flushes beyond this count switch the response to chunked
    /// transfer.
    #[serde(default = "default_fastcgi_chunk_flush_threshold")]
    pub chunk_flush_threshold: u32,
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            command: default_fastcgi_command(),
            min_processes: default_fastcgi_min_processes(),
            max_processes: default_fastcgi_max_processes(),
            max_requests: default_fastcgi_max_requests(),
            cull_time_limit: default_fastcgi_cull_time_limit(),
            max_clients: default_fastcgi_max_clients(),
            extensions: default_fastcgi_extensions(),
            binds: default_fastcgi_binds(),
            allow_from: Vec::new(),
            chunk_flush_threshold: default_fastcgi_chunk_flush_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub admin: Option<AdminCredentials>,
    #[serde(default)]
    pub protected: Vec<ProtectedPrefix>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
    #[serde(default = "default_auth_admin_realm")]
    pub realm: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProtectedPrefix {
    pub prefix: String,
    pub realm: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default = "default_admin_status_enabled")]
    pub status_enabled: bool,
    #[serde(default = "default_admin_info_enabled")]
    pub info_enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            status_enabled: default_admin_status_enabled(),
            info_enabled: default_admin_info_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RewriteRuleConfig {
    pub r#match: String,
    #[serde(default)]
    pub exclude: Option<String>,
    pub replace: String,
    /// Apply only when the rewritten target resolves to an existing file.
    #[serde(default)]
    pub is_file: bool,
    /// Apply only when the rewritten target resolves to an existing directory.
    #[serde(default)]
    pub is_dir: bool,
    /// A strict rule that fails its file/dir check aborts the rule list.
    #[serde(default)]
    pub strict: bool,
    /// Stop evaluating further rules after this one matches.
    #[serde(default)]
    pub last: bool,
    /// 0 rewrites internally; 301/302/307 answer with a redirect.
    #[serde(default)]
    pub redirect: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_paths_docroot")]
    pub docroot: PathBuf,
    /// Private document tree behind /api-docs and /extras.
    #[serde(default = "default_paths_server_docroot")]
    pub server_docroot: PathBuf,
    #[serde(default = "default_paths_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_paths_temp_dir")]
    pub temp_dir: PathBuf,
    /// Roots a worker-issued X-SendFile path must live under.
    #[serde(default)]
    pub sendfile_allow: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            docroot: default_paths_docroot(),
            server_docroot: default_paths_server_docroot(),
            log_dir: default_paths_log_dir(),
            temp_dir: default_paths_temp_dir(),
            sendfile_allow: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AccessLogConfig {
    #[serde(default = "default_access_log_enabled")]
    pub enabled: bool,
    /// Lines buffered before the writer flushes.
    #[serde(default = "default_access_log_buffer_lines")]
    pub buffer_lines: usize,
    /// URL prefixes excluded from access logging.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: default_access_log_enabled(),
            buffer_lines: default_access_log_buffer_lines(),
            exclude: Vec::new(),
        }
    }
}
