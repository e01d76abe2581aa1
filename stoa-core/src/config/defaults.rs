use std::path::PathBuf;

pub(super) fn default_server_address() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn default_server_port() -> u16 {
    8080
}

pub(super) fn default_server_max_clients() -> usize {
    64
}

pub(super) fn default_server_queue_backlog() -> u32 {
    128
}

pub(super) fn default_server_keep_alive_timeout() -> u64 {
    15
}

pub(super) fn default_server_keep_alive_max_requests() -> u32 {
    100
}

pub(super) fn default_server_index_files() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

pub(super) fn default_handler_pipeline() -> Vec<String> {
    ["auth", "admin", "private", "rewrite", "dynamic", "static", "directory"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub(super) fn default_fastcgi_command() -> String {
    "php-cgi -b {bind}".to_string()
}

pub(super) fn default_fastcgi_min_processes() -> usize {
    1
}

pub(super) fn default_fastcgi_max_processes() -> usize {
    8
}

pub(super) fn default_fastcgi_max_requests() -> u64 {
    500
}

pub(super) fn default_fastcgi_cull_time_limit() -> u64 {
    5
}

pub(super) fn default_fastcgi_max_clients() -> usize {
    16
}

pub(super) fn default_fastcgi_extensions() -> Vec<String> {
    vec!["php".to_string()]
}

pub(super) fn default_fastcgi_binds() -> Vec<String> {
    (0..default_fastcgi_max_processes())
        .map(|i| format!("127.0.0.1:{}", 9000 + i))
        .collect()
}

pub(super) fn default_fastcgi_chunk_flush_threshold() -> u32 {
    1
}

pub(super) fn default_auth_admin_realm() -> String {
    "server admin".to_string()
}

pub(super) fn default_admin_status_enabled() -> bool {
    true
}

pub(super) fn default_admin_info_enabled() -> bool {
    true
}

pub(super) fn default_paths_docroot() -> PathBuf {
    PathBuf::from("/srv/www")
}

pub(super) fn default_paths_server_docroot() -> PathBuf {
    PathBuf::from("/usr/share/stoa")
}

pub(super) fn default_paths_log_dir() -> PathBuf {
    PathBuf::from("/var/log/stoa")
}

pub(super) fn default_paths_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/stoa")
}

pub(super) fn default_access_log_enabled() -> bool {
    true
}

pub(super) fn default_access_log_buffer_lines() -> usize {
    64
}
