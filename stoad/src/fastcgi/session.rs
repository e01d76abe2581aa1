use super::codec::{
    self, EndRequest, Record, FCGI_END_REQUEST, FCGI_RESPONDER, FCGI_STDERR, FCGI_STDOUT,
    MAX_RECORD_CONTENT,
};
use crate::http::headers::HeaderMap;
use crate::http::parser::{find_header_boundary, parse_backend_headers};
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBody, SERVER_SIGNATURE};
use crate::pool::WorkerPool;
use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::io::Read as _;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use stoa_core::config::Config;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAX_BACKEND_HEAD_BYTES: usize = 64 * 1024;
const MAX_BACKEND_STDERR_BYTES: usize = 1024 * 1024;

/// How a finished read loop wants the response delivered.
enum SessionOutcome {
    /// Fully buffered; worker connection already drained.
    Buffered(Response),
    /// Streaming; the relay owns the worker socket until the client is done.
    Relay(Response),
}

/// One FastCGI request/response exchange with a pool worker.
pub struct FcgiSession {
    worker_id: usize,
    /// Taken by the relay when the response streams.
    stream: Option<TcpStream>,
    request_id: u16,
    record: Record,
    ended: bool,
    /// Forced by stderr output so the full error is captured before
    /// reporting.
    blocking: bool,
    flush_count: u32,
}

impl FcgiSession {
    /// Run a dynamic request against the worker pool. Always produces a
    /// response; worker-level failures map to 408/502 per the error policy.
    pub async fn run(
        pool: &Arc<Mutex<WorkerPool>>,
        config: &Config,
        request: &Request,
        client_id: usize,
        peer: SocketAddr,
        secure: bool,
    ) -> Response {
        let (worker_id, stream) = {
            let mut pool_guard = pool.lock().await;
            match pool_guard.connect(client_id, None).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(client = client_id, error = %e, "worker connect failed");
                    return connect_error_response(&e);
                }
            }
        };

        let mut session = FcgiSession {
            worker_id,
            stream: Some(stream),
            request_id: 1,
            record: Record::new(),
            ended: false,
            blocking: false,
            flush_count: 0,
        };

        match session.exchange(config, request, peer, secure).await {
            Ok(SessionOutcome::Buffered(response)) => {
                pool.lock().await.release(worker_id);
                response
            }
            Ok(SessionOutcome::Relay(response)) => response,
            Err(e) => {
                warn!(client = client_id, worker = worker_id, error = %e, "fastcgi session failed");
                pool.lock().await.release(worker_id);
                Response::error_page(502, "The worker process returned an invalid response.")
            }
        }
    }

    async fn exchange(
        &mut self,
        config: &Config,
        request: &Request,
        peer: SocketAddr,
        secure: bool,
    ) -> Result<SessionOutcome> {
        self.send_request(config, request, peer, secure).await?;
        self.read_response(config).await
    }

    /// Emit BEGIN_REQUEST, the PARAMS stream, and the STDIN stream.
    async fn send_request(
        &mut self,
        config: &Config,
        request: &Request,
        peer: SocketAddr,
        secure: bool,
    ) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("session stream already taken"))?;
        codec::write_begin_request(stream, self.request_id, FCGI_RESPONDER, 0).await?;

        let params = build_params(config, request, peer, secure)?;
        for chunk in params.chunks(MAX_RECORD_CONTENT) {
            codec::write_record(stream, codec::FCGI_PARAMS, self.request_id, chunk).await?;
        }
        codec::write_record(stream, codec::FCGI_PARAMS, self.request_id, &[]).await?;

        for chunk in request.body.chunks(MAX_RECORD_CONTENT) {
            codec::write_record(stream, codec::FCGI_STDIN, self.request_id, chunk).await?;
        }
        codec::write_record(stream, codec::FCGI_STDIN, self.request_id, &[]).await?;
        Ok(())
    }

    /// Read worker records until the response mode is decided or the
    /// request ends.
    async fn read_response(&mut self, config: &Config) -> Result<SessionOutcome> {
        let mut head_buf = BytesMut::new();
        let mut headers_done = false;
        let mut status: u16 = 200;
        let mut backend_headers = HeaderMap::new();
        let mut body = BytesMut::new();
        let mut stderr_bytes = 0usize;
        let mut end: Option<EndRequest> = None;

        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow!("session stream already taken"))?;
            codec::read_record_into(stream, &mut self.record).await?;
            let rid = self.record.header.request_id;
            if rid != self.request_id && rid != 0 {
                return Err(anyhow!("unexpected request id in worker response: {}", rid));
            }
            match self.record.header.record_type {
                FCGI_STDOUT => {
                    if self.record.content.is_empty() {
                        continue;
                    }
                    if !headers_done {
                        if head_buf.len() + self.record.content.len() > MAX_BACKEND_HEAD_BYTES {
                            return Err(anyhow!("worker response headers too large"));
                        }
                        head_buf.extend_from_slice(&self.record.content);
                        if let Some((pos, sep_len)) = find_header_boundary(&head_buf) {
                            let (parsed_status, parsed_headers) =
                                parse_backend_headers(&head_buf[..pos])
                                    .map_err(|e| anyhow!("worker header parse: {e}"))?;
                            status = parsed_status;
                            backend_headers = parsed_headers;
                            headers_done = true;

                            let leftover = &head_buf[pos + sep_len..];
                            if !leftover.is_empty() {
                                body.extend_from_slice(leftover);
                                self.flush_count = 1;
                            }

                            if let Some(directive) = backend_headers.get("x-sendfile") {
                                let directive = directive.to_string();
                                return self
                                    .finish_sendfile(config, status, backend_headers, &directive)
                                    .await;
                            }
                            if backend_announces_chunked(&backend_headers) && !self.blocking {
                                return Ok(self.into_relay(
                                    status,
                                    backend_headers,
                                    body,
                                    true,
                                ));
                            }
                        }
                    } else {
                        body.extend_from_slice(&self.record.content);
                        self.flush_count += 1;
                    }

                    if headers_done
                        && !self.blocking
                        && (body.len() >= MAX_RECORD_CONTENT
                            || self.flush_count > config.fastcgi.chunk_flush_threshold)
                    {
                        return Ok(self.into_relay(status, backend_headers, body, false));
                    }
                }
                FCGI_STDERR => {
                    if !self.record.content.is_empty() && stderr_bytes < MAX_BACKEND_STDERR_BYTES {
                        stderr_bytes += self.record.content.len();
                        let line = String::from_utf8_lossy(&self.record.content);
                        warn!(worker = self.worker_id, stderr = %line.trim_end(), "worker stderr");
                        self.blocking = true;
                    }
                }
                FCGI_END_REQUEST => {
                    end = Some(EndRequest::decode(&self.record.content)?);
                    self.ended = true;
                    break;
                }
                other => {
                    debug!(worker = self.worker_id, record_type = other, "skipping record");
                }
            }
        }

        // Worker closed the request with nothing usable: report the
        // END_REQUEST status codes. Statuses that legitimately carry no
        // body (no-body set, redirects) pass through.
        let empty_body_expected = matches!(status, 100 | 101 | 204 | 205 | 304) || status >= 300;
        if !headers_done || (body.is_empty() && !empty_body_expected) {
            let end = end.unwrap_or(EndRequest {
                app_status: 0,
                protocol_status: 0,
            });
            return Ok(SessionOutcome::Buffered(Response::error_page(
                502,
                &format!(
                    "The worker finished without producing a response \
                     (app status {}, protocol status {}).",
                    end.app_status, end.protocol_status
                ),
            )));
        }

        let mut response = Response::new(status);
        copy_backend_headers(&mut response, &backend_headers);
        response.body = ResponseBody::Buffer(body);
        if status >= 500 {
            // Error bodies are reported whole, decoded for the log reader.
            response.chunked = false;
            decompress_error_body(&mut response);
        }
        Ok(SessionOutcome::Buffered(response))
    }

    /// Hand the socket over to a relay; the client drains it one unit at a
    /// time.
    fn into_relay(
        &mut self,
        status: u16,
        backend_headers: HeaderMap,
        pending: BytesMut,
        passthrough: bool,
    ) -> SessionOutcome {
        let mut response = Response::new(status);
        copy_backend_headers(&mut response, &backend_headers);
        response.chunked = true;
        response.body = ResponseBody::WorkerRelay(Box::new(WorkerRelay {
            worker_id: self.worker_id,
            stream: self.stream.take(),
            record: Record::new(),
            request_id: self.request_id,
            pending,
            passthrough,
            ended: false,
        }));
        SessionOutcome::Relay(response)
    }

    /// X-SendFile: drop the worker body and stream a whitelisted file
    /// instead.
    async fn finish_sendfile(
        &mut self,
        config: &Config,
        status: u16,
        backend_headers: HeaderMap,
        directive: &str,
    ) -> Result<SessionOutcome> {
        self.drain_to_end().await?;

        let (path, encoded) = parse_sendfile_directive(directive);
        if !sendfile_allowed(config, Path::new(path)) {
            warn!(path = path, "X-SendFile path outside the allow list");
            return Ok(SessionOutcome::Buffered(Response::error_page(
                404,
                "The requested resource could not be served.",
            )));
        }

        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = path, error = %e, "X-SendFile open failed");
                return Ok(SessionOutcome::Buffered(Response::error_page(
                    404,
                    "The requested resource could not be served.",
                )));
            }
        };
        let meta = file.metadata().await?;

        let mut response = Response::new(status);
        copy_backend_headers(&mut response, &backend_headers);
        response.headers.remove("x-sendfile");
        if !encoded {
            response.headers.remove("content-encoding");
        }
        if !response.headers.contains("content-type") {
            let ext = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            response
                .headers
                .insert("Content-Type", stoa_core::mime::content_type_for(ext));
        }
        if let Ok(modified) = meta.modified() {
            response.headers.insert(
                "Last-Modified",
                crate::http::parser::format_http_date(modified),
            );
        }
        response.body = ResponseBody::File {
            file,
            remaining: meta.len(),
        };
        Ok(SessionOutcome::Buffered(response))
    }

    /// Consume and discard records until END_REQUEST.
    async fn drain_to_end(&mut self) -> Result<()> {
        while !self.ended {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow!("session stream already taken"))?;
            codec::read_record_into(stream, &mut self.record).await?;
            if self.record.header.record_type == FCGI_END_REQUEST {
                self.ended = true;
            }
        }
        Ok(())
    }
}

/// Streaming tail of a worker response, pulled by the client's outbound
/// pass one unit at a time.
pub struct WorkerRelay {
    pub worker_id: usize,
    stream: Option<TcpStream>,
    record: Record,
    request_id: u16,
    pending: BytesMut,
    /// Worker output is already chunked-framed; forward it untouched.
    pub passthrough: bool,
    ended: bool,
}

impl WorkerRelay {
    /// The next pre-framed outbound unit, or `None` when the worker stream
    /// is done. For server-framed relays the caller appends the final
    /// `0\r\n\r\n` itself.
    pub async fn next_unit(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            let data = self.pending.split();
            return Ok(Some(self.frame(&data)));
        }
        if self.ended {
            return Ok(None);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("relay stream already taken"))?;
        loop {
            codec::read_record_into(stream, &mut self.record).await?;
            let rid = self.record.header.request_id;
            if rid != self.request_id && rid != 0 {
                return Err(anyhow!("unexpected request id in worker response: {}", rid));
            }
            match self.record.header.record_type {
                FCGI_STDOUT => {
                    if self.record.content.is_empty() {
                        continue;
                    }
                    let content = self.record.content.clone();
                    return Ok(Some(self.frame(&content)));
                }
                FCGI_STDERR => {
                    if !self.record.content.is_empty() {
                        let line = String::from_utf8_lossy(&self.record.content);
                        warn!(worker = self.worker_id, stderr = %line.trim_end(), "worker stderr");
                    }
                }
                FCGI_END_REQUEST => {
                    self.ended = true;
                    return Ok(None);
                }
                other => {
                    debug!(worker = self.worker_id, record_type = other, "skipping record");
                }
            }
        }
    }

    fn frame(&self, data: &[u8]) -> Bytes {
        if self.passthrough {
            Bytes::copy_from_slice(data)
        } else {
            chunk_frame(data)
        }
    }

    /// Consume the remaining worker output without forwarding it, then free
    /// the worker's client slot. `aborted` marks a client that went away
    /// mid-response for the status page.
    pub async fn drain(mut self, pool: Arc<Mutex<WorkerPool>>, aborted: bool) {
        if let Some(mut stream) = self.stream.take() {
            while !self.ended {
                match codec::read_record_into(&mut stream, &mut self.record).await {
                    Ok(()) => {
                        if self.record.header.record_type == FCGI_END_REQUEST {
                            self.ended = true;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        let mut pool_guard = pool.lock().await;
        pool_guard.release(self.worker_id);
        if aborted {
            pool_guard.note_aborted();
        }
    }
}

/// HTTP/1.1 chunked-transfer framing for one unit.
pub fn chunk_frame(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// The terminating frame of a server-generated chunked body.
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

fn connect_error_response(err: &anyhow::Error) -> Response {
    let timed_out = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::TimedOut)
            .unwrap_or(false)
    });
    if timed_out {
        Response::error_page(408, "The worker did not accept the connection in time.")
    } else {
        Response::error_page(502, "No worker process is available for this request.")
    }
}

fn backend_announces_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Copy worker headers onto the response, dropping the ones the server
/// recomputes or owns.
fn copy_backend_headers(response: &mut Response, backend: &HeaderMap) {
    for (name, value) in backend.iter() {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
        {
            continue;
        }
        response.headers.insert(name, value);
    }
}

/// `X-SendFile: /path/to/file` with an optional `; encoded` option that
/// preserves Content-Encoding.
fn parse_sendfile_directive(directive: &str) -> (&str, bool) {
    match directive.split_once(';') {
        Some((path, options)) => {
            let encoded = options
                .split(';')
                .any(|opt| opt.trim().eq_ignore_ascii_case("encoded"));
            (path.trim(), encoded)
        }
        None => (directive.trim(), false),
    }
}

fn sendfile_allowed(config: &Config, path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    config
        .paths
        .sendfile_allow
        .iter()
        .any(|root| path.starts_with(root))
}

/// Decode a compressed worker error body so the client sees the text.
fn decompress_error_body(response: &mut Response) {
    let encoding = match response.headers.get("content-encoding") {
        Some(e) => e.to_ascii_lowercase(),
        None => return,
    };
    let ResponseBody::Buffer(buf) = &response.body else {
        return;
    };
    let mut decoded = Vec::new();
    let ok = match encoding.as_str() {
        "gzip" => flate2::read::GzDecoder::new(&buf[..])
            .read_to_end(&mut decoded)
            .is_ok(),
        "deflate" => flate2::read::ZlibDecoder::new(&buf[..])
            .read_to_end(&mut decoded)
            .is_ok(),
        _ => false,
    };
    if ok {
        response.body = ResponseBody::Buffer(BytesMut::from(&decoded[..]));
        response.headers.remove("content-encoding");
    }
}

/// Headers never forwarded to workers as HTTP_*.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut out = HashSet::new();
    if let Some(value) = headers.get("connection") {
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                out.insert(token.to_ascii_lowercase());
            }
        }
    }
    out
}

/// Assemble the CGI parameter block for one request.
fn build_params(
    config: &Config,
    request: &Request,
    peer: SocketAddr,
    secure: bool,
) -> Result<BytesMut> {
    let mut params = BytesMut::new();
    let docroot = request
        .docroot
        .as_deref()
        .unwrap_or(&config.paths.docroot);
    let script_filename = docroot.join(request.path.trim_start_matches('/'));

    codec::encode_param(&mut params, b"SERVER_SOFTWARE", SERVER_SIGNATURE.as_bytes())?;
    codec::encode_param(&mut params, b"GATEWAY_INTERFACE", b"CGI/1.1")?;
    codec::encode_param(
        &mut params,
        b"REQUEST_METHOD",
        request.method.as_str().as_bytes(),
    )?;
    codec::encode_param(&mut params, b"SCRIPT_NAME", request.path.as_bytes())?;
    codec::encode_param(
        &mut params,
        b"SCRIPT_FILENAME",
        script_filename.to_string_lossy().as_bytes(),
    )?;
    codec::encode_param(&mut params, b"PATH_INFO", b"")?;
    codec::encode_param(&mut params, b"QUERY_STRING", request.query.as_bytes())?;
    codec::encode_param(&mut params, b"REQUEST_URI", request.target().as_bytes())?;
    codec::encode_param(
        &mut params,
        b"DOCUMENT_ROOT",
        docroot.to_string_lossy().as_bytes(),
    )?;
    codec::encode_param(
        &mut params,
        b"SERVER_PROTOCOL",
        request.protocol.as_bytes(),
    )?;

    // SERVER_NAME and SERVER_PORT come from the client-facing Host header.
    let (server_name, server_port) = match request.host() {
        Some(host) => match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                (name.to_string(), port.to_string())
            }
            _ => (host.to_string(), config.server.port.to_string()),
        },
        None => (
            config.server.address.clone(),
            config.server.port.to_string(),
        ),
    };
    codec::encode_param(&mut params, b"SERVER_NAME", server_name.as_bytes())?;
    codec::encode_param(&mut params, b"SERVER_PORT", server_port.as_bytes())?;

    codec::encode_param(
        &mut params,
        b"REMOTE_ADDR",
        peer.ip().to_string().as_bytes(),
    )?;
    codec::encode_param(
        &mut params,
        b"REMOTE_PORT",
        peer.port().to_string().as_bytes(),
    )?;
    if secure {
        codec::encode_param(&mut params, b"HTTPS", b"on")?;
    }
    if let Some(user) = request.username.as_deref() {
        codec::encode_param(&mut params, b"REMOTE_USER", user.as_bytes())?;
        codec::encode_param(&mut params, b"AUTH_TYPE", b"Digest")?;
    }

    if let Some(ct) = request.headers.get("content-type") {
        codec::encode_param(&mut params, b"CONTENT_TYPE", ct.as_bytes())?;
    }
    codec::encode_param(
        &mut params,
        b"CONTENT_LENGTH",
        request.body.len().to_string().as_bytes(),
    )?;

    // HTTP_* headers, excluding hop-by-hop and already-mapped ones.
    let connection_named = connection_tokens(&request.headers);
    for (name, value) in request.headers.iter() {
        if name == "content-type" || name == "content-length" {
            continue;
        }
        if is_hop_by_hop_header(name) || connection_named.contains(name) {
            continue;
        }
        let mut env_name = Vec::with_capacity(5 + name.len());
        env_name.extend_from_slice(b"HTTP_");
        for &b in name.as_bytes() {
            let out = match b {
                b'-' => b'_',
                b'a'..=b'z' => b - 32,
                _ => b,
            };
            env_name.push(out);
        }
        codec::encode_param(&mut params, &env_name, value.as_bytes())?;
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Method;

    #[test]
    fn chunk_frames_carry_hex_length() {
        let frame = chunk_frame(b"hello");
        assert_eq!(&frame[..], b"5\r\nhello\r\n");
        let frame = chunk_frame(&[0u8; 16]);
        assert!(frame.starts_with(b"10\r\n"));
    }

    #[test]
    fn sendfile_directive_options() {
        assert_eq!(parse_sendfile_directive("/srv/files/a.gz"), ("/srv/files/a.gz", false));
        assert_eq!(
            parse_sendfile_directive("/srv/files/a.gz; encoded"),
            ("/srv/files/a.gz", true)
        );
        assert_eq!(
            parse_sendfile_directive(" /srv/x ; other ; ENCODED "),
            ("/srv/x", true)
        );
    }

    #[test]
    fn sendfile_allow_list_is_enforced() {
        let mut config = Config::default();
        config.paths.sendfile_allow = vec!["/srv/files".into()];
        assert!(sendfile_allowed(&config, Path::new("/srv/files/a.bin")));
        assert!(!sendfile_allowed(&config, Path::new("/etc/passwd")));
        assert!(!sendfile_allowed(&config, Path::new("/srv/files/../../etc/passwd")));
        assert!(!sendfile_allowed(&config, Path::new("relative/path")));
    }

    #[test]
    fn params_include_cgi_basics_and_http_headers() {
        let config = Config::default();
        let mut request = Request::new(
            Method::Get,
            "/hello.php".to_string(),
            "x=1".to_string(),
            "HTTP/1.1".to_string(),
        );
        request.headers.append_parsed("host", "example.com:8080");
        request.headers.append_parsed("user-agent", "test/1");
        request.headers.append_parsed("connection", "keep-alive");

        let peer: SocketAddr = "192.0.2.9:5555".parse().unwrap();
        let params = build_params(&config, &request, peer, false).unwrap();
        let map = codec::decode_params(&params).unwrap();

        assert_eq!(map.get("REQUEST_METHOD").map(String::as_str), Some("GET"));
        assert_eq!(map.get("SCRIPT_NAME").map(String::as_str), Some("/hello.php"));
        assert_eq!(map.get("QUERY_STRING").map(String::as_str), Some("x=1"));
        assert_eq!(map.get("SERVER_NAME").map(String::as_str), Some("example.com"));
        assert_eq!(map.get("SERVER_PORT").map(String::as_str), Some("8080"));
        assert_eq!(map.get("REMOTE_ADDR").map(String::as_str), Some("192.0.2.9"));
        assert_eq!(map.get("HTTP_USER_AGENT").map(String::as_str), Some("test/1"));
        assert_eq!(map.get("CONTENT_LENGTH").map(String::as_str), Some("0"));
        assert!(!map.contains_key("HTTP_CONNECTION"), "hop-by-hop excluded");
    }

    #[test]
    fn https_and_user_params_when_present() {
        let config = Config::default();
        let mut request = Request::new(
            Method::Post,
            "/submit.php".to_string(),
            String::new(),
            "HTTP/1.1".to_string(),
        );
        request.username = Some("admin".to_string());
        request.body = Bytes::from_static(b"a=1");
        let peer: SocketAddr = "198.51.100.2:40000".parse().unwrap();
        let params = build_params(&config, &request, peer, true).unwrap();
        let map = codec::decode_params(&params).unwrap();
        assert_eq!(map.get("HTTPS").map(String::as_str), Some("on"));
        assert_eq!(map.get("REMOTE_USER").map(String::as_str), Some("admin"));
        assert_eq!(map.get("CONTENT_LENGTH").map(String::as_str), Some("3"));
    }
}
