use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stoad::fastcgi::codec::{
    self, Record, FCGI_END_REQUEST, FCGI_REQUEST_COMPLETE, FCGI_STDERR, FCGI_STDIN, FCGI_STDOUT,
};
use stoad::handlers::HandlerRegistry;
use stoad::pool::{LaunchedWorker, WorkerLauncher, WorkerPool};
use stoad::server::ServerStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// The worker processes live inside this test, so launching is a no-op.
struct LocalLauncher;

impl WorkerLauncher for LocalLauncher {
    fn launch(&self, _command: &str, _bind: &str) -> anyhow::Result<LaunchedWorker> {
        Ok(LaunchedWorker {
            child: None,
            pid: Some(31337),
        })
    }
}

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

fn test_config(docroot: &std::path::Path, worker_bind: &str) -> stoa_core::config::Config {
    let yaml = format!(
        r#"
server:
  port: 18081
fastcgi:
  command: "test-worker {{bind}}"
  min_processes: 1
  max_processes: 1
  extensions: [php]
  binds: ["{}"]
paths:
  docroot: "{}"
access_log:
  enabled: false
"#,
        worker_bind,
        docroot.display()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

const BIG_FLUSH: usize = 100 * 1024;

fn big_payload() -> Vec<u8> {
    (0..2 * BIG_FLUSH).map(|i| (i % 251) as u8).collect()
}

/// Minimal scripted FastCGI responder: reads one request, answers by
/// SCRIPT_NAME, repeats per connection.
async fn run_fake_worker(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(handle_worker_conn(stream));
    }
}

async fn handle_worker_conn(mut stream: TcpStream) {
    let mut record = Record::new();
    let mut params_buf = Vec::new();
    let mut request_id = 1u16;
    loop {
        if codec::read_record_into(&mut stream, &mut record).await.is_err() {
            return;
        }
        match record.header.record_type {
            codec::FCGI_PARAMS => {
                request_id = record.header.request_id;
                params_buf.extend_from_slice(&record.content);
            }
            FCGI_STDIN if record.content.is_empty() => break,
            _ => {}
        }
    }
    let params = codec::decode_params(&params_buf).unwrap_or_default();
    let script = params
        .get("SCRIPT_NAME")
        .map(String::as_str)
        .unwrap_or("");

    match script {
        "/__worker_pid" => {
            let head = b"Status: 200 OK\r\nX-Worker-Pid: 4242\r\n\r\n";
            codec::write_stream(&mut stream, FCGI_STDOUT, request_id, head)
                .await
                .unwrap();
        }
        "/hello.php" => {
            let head = b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nhi";
            codec::write_stream(&mut stream, FCGI_STDOUT, request_id, head)
                .await
                .unwrap();
        }
        "/big.php" => {
            let payload = big_payload();
            let head = b"Status: 200 OK\r\nContent-Type: application/octet-stream\r\n\r\n";
            codec::write_record(&mut stream, FCGI_STDOUT, request_id, head)
                .await
                .unwrap();
            // Two distinct output flushes.
            for flush in payload.chunks(BIG_FLUSH) {
                for part in flush.chunks(codec::MAX_RECORD_CONTENT) {
                    codec::write_record(&mut stream, FCGI_STDOUT, request_id, part)
                        .await
                        .unwrap();
                }
            }
            codec::write_record(&mut stream, FCGI_STDOUT, request_id, &[])
                .await
                .unwrap();
        }
        "/warn.php" => {
            codec::write_record(&mut stream, FCGI_STDERR, request_id, b"deprecation warning\n")
                .await
                .unwrap();
            let head = b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nstill fine";
            codec::write_stream(&mut stream, FCGI_STDOUT, request_id, head)
                .await
                .unwrap();
        }
        "/missing.php" => {
            let head = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nno such script";
            codec::write_stream(&mut stream, FCGI_STDOUT, request_id, head)
                .await
                .unwrap();
        }
        "/empty.php" => {}
        other => panic!("fake worker got unexpected script: {other}"),
    }

    let end = [0, 0, 0, 0, FCGI_REQUEST_COMPLETE, 0, 0, 0];
    codec::write_record(&mut stream, FCGI_END_REQUEST, request_id, &end)
        .await
        .unwrap();
}

async fn start_stack(scripts: &[&str]) -> DuplexStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bind = listener.local_addr().unwrap().to_string();
    tokio::spawn(run_fake_worker(listener));

    let docroot = tempdir("stoa-fcgi");
    for script in scripts {
        std::fs::write(docroot.join(script), b"<?php ?>").unwrap();
    }
    let config = test_config(&docroot, &bind);

    let (server_io, client_io) = tokio::io::duplex(1024 * 1024);
    let config = Arc::new(config);
    let registry = Arc::new(HandlerRegistry::from_config(&config).unwrap());
    let pool = Arc::new(Mutex::new(WorkerPool::with_launcher(
        config.fastcgi.clone(),
        Box::new(LocalLauncher),
    )));
    let stats = Arc::new(ServerStats::new());
    tokio::spawn(async move {
        let _ = stoad::client::handle_connection(
            server_io,
            1,
            "192.0.2.7:40000".parse().unwrap(),
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
        let mut chunk = [0u8; 8192];
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
    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        while body.len() < length {
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "eof before body end");
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
    } else if headers
        .get("transfer-encoding")
        .map(|v| v.contains("chunked"))
        .unwrap_or(false)
    {
        loop {
            if ends_with_terminator(&body) {
                break;
            }
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "eof before chunk terminator");
            body.extend_from_slice(&chunk[..n]);
        }
        body = dechunk(&body);
    }

    TestResponse {
        status,
        headers,
        body,
    }
}

fn ends_with_terminator(buf: &[u8]) -> bool {
    buf.ends_with(b"0\r\n\r\n")
}

fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end]).unwrap(), 16)
            .unwrap();
        data = &data[line_end + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&data[..size]);
        assert_eq!(&data[size..size + 2], b"\r\n");
        data = &data[size + 2..];
    }
}

#[tokio::test]
async fn dynamic_dispatch_buffers_small_response() {
    let mut client = start_stack(&["hello.php"]).await;
    client
        .write_all(b"GET /hello.php?x=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(response.headers.get("content-length").unwrap(), "2");
    assert_eq!(response.body, b"hi");
}

#[tokio::test]
async fn large_worker_output_switches_to_chunked() {
    let mut client = start_stack(&["big.php"]).await;
    client
        .write_all(b"POST /big.php HTTP/1.1\r\nHost: example.test\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert_eq!(response.status, 200);
    assert_eq!(
        response.headers.get("transfer-encoding").unwrap(),
        "chunked"
    );
    assert!(!response.headers.contains_key("content-length"));
    assert_eq!(response.body, big_payload());
}

#[tokio::test]
async fn worker_stderr_is_tolerated_and_response_buffered() {
    let mut client = start_stack(&["warn.php"]).await;
    client
        .write_all(b"GET /warn.php HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-length").unwrap(), "10");
    assert_eq!(response.body, b"still fine");
}

#[tokio::test]
async fn worker_error_status_is_forwarded() {
    let mut client = start_stack(&["missing.php"]).await;
    client
        .write_all(b"GET /missing.php HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert_eq!(response.status, 404);
    assert_eq!(response.body, b"no such script");
}

#[tokio::test]
async fn empty_worker_response_synthesizes_diagnostics() {
    let mut client = start_stack(&["empty.php"]).await;
    client
        .write_all(b"GET /empty.php HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert_eq!(response.status, 502);
    let body = String::from_utf8_lossy(&response.body);
    assert!(body.contains("app status 0"), "body was: {body}");
    assert!(body.contains("protocol status 0"), "body was: {body}");
}

#[tokio::test]
async fn request_body_reaches_worker_as_stdin() {
    // hello.php ignores its stdin, but the exchange must still complete
    // when a body is streamed.
    let mut client = start_stack(&["hello.php"]).await;
    client
        .write_all(
            b"POST /hello.php HTTP/1.1\r\nHost: example.test\r\nContent-Length: 7\r\n\r\npayload",
        )
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hi");
}
