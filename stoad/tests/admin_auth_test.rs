use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stoa_core::auth::md5_hex;
use stoad::handlers::HandlerRegistry;
use stoad::pool::WorkerPool;
use stoad::server::ServerStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

fn tempdir(prefix: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{}", std::process::id(), nanos));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(docroot: &std::path::Path) -> stoa_core::config::Config {
    let yaml = format!(
        r#"
server:
  port: 18082
auth:
  admin:
    user: admin
    password: hunter2
paths:
  docroot: "{}"
access_log:
  enabled: false
"#,
        docroot.display()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn start_client(config: stoa_core::config::Config) -> DuplexStream {
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);
    let config = Arc::new(config);
    let registry = Arc::new(HandlerRegistry::from_config(&config).unwrap());
    let pool = Arc::new(Mutex::new(WorkerPool::new(config.fastcgi.clone())));
    let stats = Arc::new(ServerStats::new());
    tokio::spawn(async move {
        let _ = stoad::client::handle_connection(
            server_io,
            1,
            "192.0.2.2:50000".parse().unwrap(),
            false,
            config,
            pool,
            stats,
            registry,
        )
        .await;
    });
    client_io
}

struct TestResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn read_response(stream: &mut DuplexStream) -> TestResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "eof before header end");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut lines = head.lines();
    let status: u16 = lines
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut body = buf[head_end + 4..].to_vec();
    let length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while body.len() < length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "eof before body end");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(length);
    TestResponse {
        status,
        headers,
        body,
    }
}

fn challenge_param(challenge: &str, key: &str) -> String {
    let needle = format!("{}=\"", key);
    let start = challenge.find(&needle).expect("challenge param") + needle.len();
    let end = challenge[start..].find('"').expect("closing quote") + start;
    challenge[start..end].to_string()
}

fn digest_response(
    user: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(format!("{}:{}:{}", user, realm, password).as_bytes());
    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
    md5_hex(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2).as_bytes())
}

#[tokio::test]
async fn server_status_challenges_then_accepts_digest() {
    let docroot = tempdir("stoa-admin-auth");
    let mut client = start_client(test_config(&docroot));

    // 1. Unauthenticated request draws the challenge on a kept-open
    //    connection.
    client
        .write_all(b"GET /server-status HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let challenge_response = read_response(&mut client).await;
    assert_eq!(challenge_response.status, 401);
    assert_eq!(
        challenge_response.headers.get("connection").unwrap(),
        "keep-alive"
    );
    let challenge = challenge_response
        .headers
        .get("www-authenticate")
        .expect("challenge header")
        .clone();
    assert!(challenge.starts_with("Digest realm=\"server admin\""));
    assert!(challenge.contains("qop=\"auth\""));
    assert_eq!(
        challenge_param(&challenge, "opaque"),
        md5_hex(b"server admin"),
        "opaque is md5 of the realm"
    );

    // 2. Retry on the same connection with valid credentials.
    let nonce = challenge_param(&challenge, "nonce");
    let opaque = challenge_param(&challenge, "opaque");
    let response = digest_response(
        "admin",
        "server admin",
        "hunter2",
        "GET",
        "/server-status",
        &nonce,
        "00000001",
        "f00dcafe",
    );
    let authorization = format!(
        "Digest username=\"admin\", realm=\"server admin\", nonce=\"{}\", uri=\"/server-status\", \
         qop=auth, nc=00000001, cnonce=\"f00dcafe\", response=\"{}\", opaque=\"{}\"",
        nonce, response, opaque
    );
    let request = format!(
        "GET /server-status HTTP/1.1\r\nHost: example.test\r\nAuthorization: {}\r\n\r\n",
        authorization
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let page = read_response(&mut client).await;

    assert_eq!(page.status, 200);
    let html = String::from_utf8_lossy(&page.body);
    assert!(html.contains("Server status"), "body was: {html}");
    assert!(html.contains(env!("CARGO_PKG_VERSION")));
    assert!(html.contains("FastCGI scoreboard"));
    std::fs::remove_dir_all(&docroot).ok();
}

#[tokio::test]
async fn wrong_password_draws_fresh_challenge() {
    let docroot = tempdir("stoa-admin-badpass");
    let mut client = start_client(test_config(&docroot));

    client
        .write_all(b"GET /server-status HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut client).await;
    assert_eq!(first.status, 401);
    let challenge = first.headers.get("www-authenticate").unwrap().clone();
    let nonce = challenge_param(&challenge, "nonce");

    let response = digest_response(
        "admin",
        "server admin",
        "wrong",
        "GET",
        "/server-status",
        &nonce,
        "00000001",
        "f00dcafe",
    );
    let request = format!(
        "GET /server-status HTTP/1.1\r\nHost: example.test\r\nAuthorization: Digest \
         username=\"admin\", realm=\"server admin\", nonce=\"{}\", uri=\"/server-status\", \
         qop=auth, nc=00000001, cnonce=\"f00dcafe\", response=\"{}\"\r\n\r\n",
        nonce, response
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let second = read_response(&mut client).await;
    assert_eq!(second.status, 401);
    assert!(second.headers.contains_key("www-authenticate"));
    std::fs::remove_dir_all(&docroot).ok();
}

#[tokio::test]
async fn server_info_requires_auth_and_renders() {
    let docroot = tempdir("stoa-admin-info");
    let mut client = start_client(test_config(&docroot));

    client
        .write_all(b"GET /server-info HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let challenge_response = read_response(&mut client).await;
    assert_eq!(challenge_response.status, 401);
    let challenge = challenge_response
        .headers
        .get("www-authenticate")
        .unwrap()
        .clone();
    let nonce = challenge_param(&challenge, "nonce");

    let response = digest_response(
        "admin",
        "server admin",
        "hunter2",
        "GET",
        "/server-info",
        &nonce,
        "00000001",
        "0badc0de",
    );
    let request = format!(
        "GET /server-info HTTP/1.1\r\nHost: example.test\r\nAuthorization: Digest \
         username=\"admin\", realm=\"server admin\", nonce=\"{}\", uri=\"/server-info\", \
         qop=auth, nc=00000001, cnonce=\"0badc0de\", response=\"{}\"\r\n\r\n",
        nonce, response
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let page = read_response(&mut client).await;
    assert_eq!(page.status, 200);
    let html = String::from_utf8_lossy(&page.body);
    assert!(html.contains("Server information"), "body was: {html}");
    assert!(html.contains("Handler pipeline"));
    std::fs::remove_dir_all(&docroot).ok();
}
