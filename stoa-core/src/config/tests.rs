use super::*;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fs, path::PathBuf};

fn unique_tmp_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("stoa-config-test-{}", nanos));
    dir
}

#[test]
fn load_config_supports_include_and_env() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");

    let include = dir.join("include.yaml");
    let base = dir.join("base.yaml");

    fs::write(
        &include,
        r#"
server:
  port: 18080
  max_clients: 8
"#,
    )
    .expect("write include");

    fs::write(
        &base,
        r#"
paths:
  docroot: "${STOA_TEST_DOCROOT}"
include:
  - include.yaml
"#,
    )
    .expect("write base");

    std::env::set_var("STOA_TEST_DOCROOT", "/tmp/stoa-www");
    let loaded = load_config(&base).expect("load config");
    std::env::remove_var("STOA_TEST_DOCROOT");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(loaded.server.port, 18080);
    assert_eq!(loaded.server.max_clients, 8);
    assert_eq!(loaded.paths.docroot, PathBuf::from("/tmp/stoa-www"));
    // Untouched fields keep their defaults.
    assert_eq!(loaded.server.keep_alive_max_requests, 100);
}

#[test]
fn load_config_rejects_unknown_keys() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("typo.yaml");
    fs::write(
        &cfg,
        r#"
server:
  maximum_clients: 32
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("server.maximum_clients"),
        "unexpected error: {err}"
    );
}

#[test]
fn load_config_rejects_zero_port() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("port.yaml");
    fs::write(
        &cfg,
        r#"
server:
  port: 0
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("server.port must not be 0"),
        "unexpected error: {err}"
    );
}

#[test]
fn load_config_rejects_short_bind_list() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("binds.yaml");
    fs::write(
        &cfg,
        r#"
fastcgi:
  max_processes: 4
  binds: ["127.0.0.1:9000"]
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("fastcgi.binds"),
        "unexpected error: {err}"
    );
}

#[test]
fn load_config_rejects_tls_passphrase() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("tls.yaml");
    fs::write(
        &cfg,
        r#"
tls:
  enabled: true
  cert_path: /tmp/cert.pem
  key_path: /tmp/key.pem
  passphrase: hunter2
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("tls.passphrase"),
        "unexpected error: {err}"
    );
}

#[test]
fn load_config_rejects_unknown_handler() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("handlers.yaml");
    fs::write(
        &cfg,
        r#"
handlers: [static, teleport]
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("unknown handler step: teleport"),
        "unexpected error: {err}"
    );
}

#[test]
fn load_config_rejects_bad_rewrite_redirect() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(&dir).expect("mkdir");
    let cfg = dir.join("rewrite.yaml");
    fs::write(
        &cfg,
        r#"
rewrite:
  - match: "^/a$"
    replace: "/b"
    redirect: 500
"#,
    )
    .expect("write");
    let err = load_config(&cfg).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(
        err.to_string().contains("redirect must be 0, 301, 302 or 307"),
        "unexpected error: {err}"
    );
}
