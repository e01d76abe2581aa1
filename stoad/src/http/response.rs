use super::headers::HeaderMap;
use super::parser::format_http_date;
use bytes::BytesMut;
use std::fmt;
use std::time::SystemTime;

pub const SERVER_SIGNATURE: &str = concat!("stoa/", env!("CARGO_PKG_VERSION"));

/// Status codes whose responses never carry a body.
const NO_BODY_STATUSES: &[u16] = &[100, 101, 204, 205, 304];

/// Well-known headers are emitted first, in this order; the rest follow in
/// insertion order.
const WELL_KNOWN_ORDER: &[&str] = &[
    "date",
    "server",
    "cache-control",
    "expires",
    "pragma",
    "location",
    "content-encoding",
    "transfer-encoding",
    "content-type",
    "content-length",
    "last-modified",
    "connection",
    "keep-alive",
];

const ERROR_PAGE_TEMPLATE: &str = "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n<h1>{status} {reason}</h1>\n<p>{detail}</p>\n<hr>\n<address>{signature}</address>\n</body>\n</html>\n";

/// A response body is a buffer, a file stream, or a live worker relay,
/// never more than one of these.
pub enum ResponseBody {
    Empty,
    Buffer(BytesMut),
    File {
        file: tokio::fs::File,
        remaining: u64,
    },
    WorkerRelay(Box<crate::fastcgi::session::WorkerRelay>),
}

impl ResponseBody {
    pub fn declared_len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Buffer(buf) => Some(buf.len() as u64),
            Self::File { remaining, .. } => Some(*remaining),
            Self::WorkerRelay(_) => None,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Buffer(buf) => write!(f, "Buffer({} bytes)", buf.len()),
            Self::File { remaining, .. } => write!(f, "File({} bytes left)", remaining),
            Self::WorkerRelay(_) => write!(f, "WorkerRelay"),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Server-generated chunked transfer to the client.
    pub chunked: bool,
    /// Connection must close after this response.
    pub close: bool,
    pub bytes_sent: u64,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            chunked: false,
            close: false,
            bytes_sent: 0,
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl AsRef<[u8]>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert("Content-Type", content_type);
        response.body = ResponseBody::Buffer(BytesMut::from(body.as_ref()));
        response
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let mut response = Self::error_page(status, &format!("The document has moved to {location}."));
        response.headers.insert("Location", location);
        response
    }

    /// Standard HTML error/notice page for the status.
    pub fn error_page(status: u16, detail: &str) -> Self {
        let reason = status_reason(status);
        let body = stoa_core::template::substitute(
            ERROR_PAGE_TEMPLATE,
            &[
                ("status", status.to_string()),
                ("reason", reason.to_string()),
                ("detail", detail.to_string()),
                ("signature", SERVER_SIGNATURE.to_string()),
            ],
        );
        Self::with_body(status, "text/html; charset=utf-8", body)
    }

    /// Final compliance pass before any byte goes out: body elision for
    /// no-body statuses, framing headers, connection persistence.
    pub fn verify(&mut self, keep_alive_allowed: bool) {
        if NO_BODY_STATUSES.contains(&self.status) {
            self.body = ResponseBody::Empty;
            self.chunked = false;
            self.headers.remove("content-length");
            self.headers.remove("transfer-encoding");
        } else if self.chunked {
            self.headers.remove("content-length");
            self.headers.insert("Transfer-Encoding", "chunked");
        } else {
            self.headers.remove("transfer-encoding");
            if let Some(len) = self.body.declared_len() {
                self.headers.insert("Content-Length", len.to_string());
            }
        }

        self.close = !keep_alive_allowed || self.status > 401;
        let connection = if self.close { "close" } else { "keep-alive" };
        self.headers.insert("Connection", connection);
    }

    /// Serialize the status line and ordered header block.
    pub fn emit_head(&mut self, now: SystemTime) -> Vec<u8> {
        if !self.headers.contains("date") {
            self.headers.insert("Date", format_http_date(now));
        }
        if !self.headers.contains("server") {
            self.headers.insert("Server", SERVER_SIGNATURE);
        }

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, status_reason(self.status)).as_bytes(),
        );

        let mut emitted: Vec<&str> = Vec::with_capacity(self.headers.len());
        for known in WELL_KNOWN_ORDER {
            for (name, value) in self.headers.iter() {
                if name.eq_ignore_ascii_case(known) {
                    out.extend_from_slice(name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(value.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    emitted.push(name);
                }
            }
        }
        for (name, value) in self.headers.iter() {
            if emitted.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
