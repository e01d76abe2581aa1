use crate::fastcgi::session::CHUNKED_TERMINATOR;
use crate::handlers::{self, HandlerRegistry};
use crate::http::parser::{self, Dechunk, ParseError};
use crate::http::{Method, Request, Response, ResponseBody};
use crate::pool::WorkerPool;
use crate::server::ServerStats;
use anyhow::Result;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use stoa_core::config::Config;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// One bounded read per scheduling step.
const INPUT_BUFFER: usize = 8192;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const FILE_CHUNK: usize = 64 * 1024;

/// Drive one client connection through its keep-alive request loop.
#[allow(clippy::too_many_arguments)]
pub async fn handle_connection<S>(
    mut stream: S,
    client_id: usize,
    peer: SocketAddr,
    secure: bool,
    config: Arc<Config>,
    pool: Arc<Mutex<WorkerPool>>,
    stats: Arc<ServerStats>,
    registry: Arc<HandlerRegistry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(INPUT_BUFFER);
    let mut served: u32 = 0;
    let idle_limit = Duration::from_secs(config.server.keep_alive_timeout.max(1));

    loop {
        // Collect the request head.
        let (head_len, sep_len) = loop {
            if let Some((pos, sep)) = parser::find_header_boundary(&buf) {
                break (pos, sep);
            }
            if buf.len() > MAX_HEAD_BYTES {
                send_simple_error(&mut stream, 431, "The request headers are too large.").await?;
                return Ok(());
            }
            buf.reserve(INPUT_BUFFER);
            let read = timeout(idle_limit, stream.read_buf(&mut buf)).await;
            match read {
                Ok(Ok(0)) => return Ok(()), // peer closed
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if buf.is_empty() {
                        // Idle keep-alive expiry; nothing in flight.
                        return Ok(());
                    }
                    send_simple_error(&mut stream, 408, "The request was not received in time.")
                        .await?;
                    return Ok(());
                }
            }
        };

        stats.add_bytes_in((head_len + sep_len) as u64);
        let head = buf.split_to(head_len + sep_len);
        let mut request = match parser::parse_request_head(&head[..head_len]) {
            Ok(request) => request,
            Err(ParseError::UnsupportedMethod) => {
                send_simple_error(&mut stream, 501, "This method is not supported.").await?;
                return Ok(());
            }
            Err(_) => {
                send_simple_error(&mut stream, 400, "The request could not be parsed.").await?;
                return Ok(());
            }
        };

        // Request body. Content-Length wins over chunked when both appear;
        // chunked bodies are buffered whole and decoded before dispatch.
        if request.method == Method::Post {
            if let Some(declared) = request.content_length() {
                if declared > MAX_BODY_BYTES as u64 {
                    send_simple_error(&mut stream, 413, "The request body is too large.").await?;
                    return Ok(());
                }
                while (buf.len() as u64) < declared {
                    buf.reserve(INPUT_BUFFER);
                    match stream.read_buf(&mut buf).await {
                        Ok(0) => return Ok(()), // disconnect mid-body
                        Ok(_) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                stats.add_bytes_in(declared);
                request.body = buf.split_to(declared as usize).freeze();
            } else if request.is_chunked() {
                loop {
                    match parser::dechunk(&buf) {
                        Dechunk::Complete(body, consumed) => {
                            stats.add_bytes_in(consumed as u64);
                            buf.advance(consumed);
                            request.body = body;
                            break;
                        }
                        Dechunk::Incomplete => {
                            if buf.len() > MAX_BODY_BYTES {
                                send_simple_error(
                                    &mut stream,
                                    413,
                                    "The request body is too large.",
                                )
                                .await?;
                                return Ok(());
                            }
                            buf.reserve(INPUT_BUFFER);
                            match stream.read_buf(&mut buf).await {
                                Ok(0) => return Ok(()),
                                Ok(_) => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                        Dechunk::Invalid => {
                            send_simple_error(
                                &mut stream,
                                400,
                                "The chunked request body is malformed.",
                            )
                            .await?;
                            return Ok(());
                        }
                    }
                }
            } else {
                send_simple_error(&mut stream, 411, "POST requires a length.").await?;
                return Ok(());
            }
        }

        served += 1;
        stats.request_served();

        let mut response = handlers::dispatch(
            &registry, &config, &pool, &stats, client_id, peer, secure, &mut request,
        )
        .await;

        let keep_alive = request.allows_keep_alive()
            && served < config.server.keep_alive_max_requests;
        response.verify(keep_alive);

        let head_only = request.method == Method::Head;
        let sent = send_response(&mut stream, &mut response, head_only, &pool, &stats).await;
        log_request(&config, &request, &response, peer);
        sent?;

        if response.close {
            debug!(client = client_id, "closing connection");
            return Ok(());
        }
    }
}

/// Transmit one verified response: header block, then the body as bounded
/// outbound units.
async fn send_response<S>(
    stream: &mut S,
    response: &mut Response,
    head_only: bool,
    pool: &Arc<Mutex<WorkerPool>>,
    stats: &Arc<ServerStats>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = response.emit_head(SystemTime::now());
    stream.write_all(&head).await?;

    let body = std::mem::replace(&mut response.body, ResponseBody::Empty);
    if head_only {
        if let ResponseBody::WorkerRelay(relay) = body {
            tokio::spawn(relay.drain(Arc::clone(pool), false));
        }
        stream.flush().await?;
        stats.add_bytes_out(head.len() as u64);
        return Ok(());
    }

    match body {
        ResponseBody::Empty => {}
        ResponseBody::Buffer(data) => {
            stream.write_all(&data).await?;
            response.bytes_sent += data.len() as u64;
        }
        ResponseBody::File {
            mut file,
            mut remaining,
        } => {
            let mut chunk = vec![0u8; FILE_CHUNK];
            while remaining > 0 {
                let want = remaining.min(FILE_CHUNK as u64) as usize;
                let n = file.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break; // file truncated underneath us
                }
                stream.write_all(&chunk[..n]).await?;
                response.bytes_sent += n as u64;
                remaining -= n as u64;
            }
        }
        ResponseBody::WorkerRelay(mut relay) => loop {
            match relay.next_unit().await {
                Ok(Some(unit)) => {
                    if let Err(e) = stream.write_all(&unit).await {
                        // The peer went away mid-stream; the worker output
                        // still has to be drained off its socket.
                        tokio::spawn(relay.drain(Arc::clone(pool), true));
                        return Err(e.into());
                    }
                    response.bytes_sent += unit.len() as u64;
                }
                Ok(None) => {
                    if !relay.passthrough {
                        stream.write_all(CHUNKED_TERMINATOR).await?;
                        response.bytes_sent += CHUNKED_TERMINATOR.len() as u64;
                    }
                    pool.lock().await.release(relay.worker_id);
                    break;
                }
                Err(e) => {
                    pool.lock().await.release(relay.worker_id);
                    return Err(e);
                }
            }
        },
    }

    stream.flush().await?;
    stats.add_bytes_out(head.len() as u64 + response.bytes_sent);
    Ok(())
}

/// Errors answered before a request ever reaches the pipeline.
async fn send_simple_error<S>(stream: &mut S, status: u16, detail: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = Response::error_page(status, detail);
    response.verify(false);
    let head = response.emit_head(SystemTime::now());
    stream.write_all(&head).await?;
    if let ResponseBody::Buffer(data) = &response.body {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

fn log_request(config: &Config, request: &Request, response: &Response, peer: SocketAddr) {
    if !config.access_log.enabled {
        return;
    }
    if config
        .access_log
        .exclude
        .iter()
        .any(|prefix| request.path.starts_with(prefix))
    {
        return;
    }
    // Log what the client actually sent, not the rewritten target.
    let request_line = match &request.rewrite {
        Some(rewrite) => format!(
            "{} {} {}",
            request.method.as_str(),
            rewrite.original_url,
            request.protocol
        ),
        None => request.request_line(),
    };
    stoa_core::observability::log_access(
        &peer.ip().to_string(),
        request.username.as_deref().unwrap_or("-"),
        &request_line,
        response.status,
        response.bytes_sent,
        request.headers.get("referer").unwrap_or("-"),
        request.headers.get("user-agent").unwrap_or("-"),
    );
}
