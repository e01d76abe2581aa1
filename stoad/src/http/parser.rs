use super::headers::HeaderMap;
use super::request::{Method, Request};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed request line or header block.
    BadRequest,
    /// Method token is not GET/HEAD/POST.
    UnsupportedMethod,
    /// POST without a length the server can frame.
    LengthRequired,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest => write!(f, "malformed request"),
            Self::UnsupportedMethod => write!(f, "unsupported method"),
            Self::LengthRequired => write!(f, "length required"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Find the end of the header block. Returns `(start_of_body, separator_len)`
/// counted from the start of the buffer.
pub fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// Parse a complete request head (request line + headers, no body).
pub fn parse_request_head(head: &[u8]) -> Result<Request, ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::BadRequest)?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

    let request_line = lines.next().ok_or(ParseError::BadRequest)?;
    let mut parts = request_line.split_whitespace();
    let method_token = parts.next().ok_or(ParseError::BadRequest)?;
    let target = parts.next().ok_or(ParseError::BadRequest)?;
    let protocol = parts.next().ok_or(ParseError::BadRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::BadRequest);
    }
    if !protocol.starts_with("HTTP/") {
        return Err(ParseError::BadRequest);
    }
    let method = Method::from_token(method_token).ok_or(ParseError::UnsupportedMethod)?;

    if !target.starts_with('/') {
        return Err(ParseError::BadRequest);
    }
    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q.to_string()),
        None => (target, String::new()),
    };
    let path = percent_decode(raw_path);
    if path.contains('\0') {
        return Err(ParseError::BadRequest);
    }

    let mut request = Request::new(method, path, query, protocol.to_string());

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold continuation
            request.headers.extend_last(line.trim());
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::BadRequest)?;
        let name = name.trim();
        if name.is_empty() || !is_header_token(name) {
            return Err(ParseError::BadRequest);
        }
        request
            .headers
            .append_parsed(&name.to_ascii_lowercase(), value.trim());
    }

    Ok(request)
}

fn is_header_token(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                    | b'_' | b'`' | b'|' | b'~'
            )
    })
}

/// Lenient percent-decoding; invalid escapes pass through literally.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| hex_val(*b)),
                bytes.get(i + 2).and_then(|b| hex_val(*b)),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Result of scanning a buffered chunked body.
#[derive(Debug)]
pub enum Dechunk {
    /// Complete body with the number of input bytes consumed.
    Complete(Bytes, usize),
    /// Terminator not reached yet.
    Incomplete,
    Invalid,
}

/// Decode a fully buffered `Transfer-Encoding: chunked` body.
///
/// Chunk extensions are ignored; trailers are consumed and dropped.
pub fn dechunk(buf: &[u8]) -> Dechunk {
    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        let Some(line_end) = find_crlf(&buf[pos..]) else {
            return Dechunk::Incomplete;
        };
        let size_line = &buf[pos..pos + line_end];
        let size_text = match std::str::from_utf8(size_line) {
            Ok(t) => t,
            Err(_) => return Dechunk::Invalid,
        };
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            return Dechunk::Invalid;
        };
        pos += line_end + 2;

        if size == 0 {
            // Trailer section: consume lines until the empty one.
            loop {
                let Some(trailer_end) = find_crlf(&buf[pos..]) else {
                    return Dechunk::Incomplete;
                };
                pos += trailer_end + 2;
                if trailer_end == 0 {
                    return Dechunk::Complete(Bytes::from(out), pos);
                }
            }
        }

        if buf.len() < pos + size + 2 {
            return Dechunk::Incomplete;
        }
        out.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Dechunk::Invalid;
        }
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn format_http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format(HTTP_DATE_FORMAT).to_string()
}

pub fn parse_http_date(s: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), HTTP_DATE_FORMAT).ok()?;
    let dt = Utc.from_utc_datetime(&naive);
    Some(dt.into())
}

/// Parse the header block a worker emitted on its stdout stream.
///
/// Accepts either a CGI `Status:` pseudo-header or a full `HTTP/1.x` status
/// line; all other header names keep their spelling.
pub fn parse_backend_headers(data: &[u8]) -> Result<(u16, HeaderMap), ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::BadRequest)?;
    let mut status: u16 = 200;
    let mut headers = HeaderMap::new();

    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n')).peekable();
    if let Some(first) = lines.peek() {
        if first.starts_with("HTTP/") {
            let mut parts = first.split_whitespace();
            let _protocol = parts.next();
            status = parts
                .next()
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or(ParseError::BadRequest)?;
            lines.next();
        }
    }

    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::BadRequest);
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split_whitespace().next() {
                status = code.parse::<u16>().map_err(|_| ParseError::BadRequest)?;
            }
        } else {
            headers.append_parsed(name, value);
        }
    }
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let head = b"GET /hello.php?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n";
        let req = parse_request_head(head).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/hello.php");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.headers.get("host"), Some("example.com"));
    }

    #[test]
    fn header_names_are_lowercased() {
        let head = b"GET / HTTP/1.1\r\nX-Custom-Header: v\r\n";
        let req = parse_request_head(head).unwrap();
        assert_eq!(req.headers.iter().next().unwrap().0, "x-custom-header");
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert_eq!(
            parse_request_head(b"NOT A REQUEST\r\n").unwrap_err(),
            ParseError::BadRequest
        );
        assert_eq!(
            parse_request_head(b"BREW /pot HTTP/1.1\r\n").unwrap_err(),
            ParseError::UnsupportedMethod
        );
        assert_eq!(
            parse_request_head(b"GET relative HTTP/1.1\r\n").unwrap_err(),
            ParseError::BadRequest
        );
    }

    #[test]
    fn percent_decodes_path() {
        let head = b"GET /with%20space.html HTTP/1.1\r\n";
        let req = parse_request_head(head).unwrap();
        assert_eq!(req.path, "/with space.html");
    }

    #[test]
    fn obs_fold_continuation() {
        let head = b"GET / HTTP/1.1\r\nX-Long: part one\r\n  part two\r\n";
        let req = parse_request_head(head).unwrap();
        assert_eq!(req.headers.get("x-long"), Some("part one part two"));
    }

    #[test]
    fn boundary_detection() {
        assert_eq!(find_header_boundary(b"GET / HTTP/1.1\r\n\r\nBODY"), Some((16, 4)));
        assert!(find_header_boundary(b"GET / HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn dechunk_roundtrip() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        match dechunk(body) {
            Dechunk::Complete(data, consumed) => {
                assert_eq!(&data[..], b"Wikipedia");
                assert_eq!(consumed, body.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn dechunk_incomplete_and_invalid() {
        assert!(matches!(dechunk(b"4\r\nWik"), Dechunk::Incomplete));
        assert!(matches!(dechunk(b"zz\r\n"), Dechunk::Invalid));
    }

    #[test]
    fn dechunk_ignores_extensions() {
        let body = b"4;name=val\r\nWiki\r\n0\r\n\r\n";
        match dechunk(body) {
            Dechunk::Complete(data, _) => assert_eq!(&data[..], b"Wiki"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn http_date_roundtrip() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784111777);
        let s = format_http_date(t);
        assert_eq!(s, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&s), Some(t));
    }

    #[test]
    fn backend_status_pseudo_header() {
        let (status, headers) =
            parse_backend_headers(b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n")
                .unwrap();
        assert_eq!(status, 404);
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.get("status").is_none());
    }

    #[test]
    fn backend_full_status_line() {
        let (status, headers) =
            parse_backend_headers(b"HTTP/1.1 302 Found\r\nLocation: /next\r\n").unwrap();
        assert_eq!(status, 302);
        assert_eq!(headers.get("location"), Some("/next"));
    }
}
