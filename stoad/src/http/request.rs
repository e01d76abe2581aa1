use super::headers::HeaderMap;
use bytes::Bytes;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
        }
    }
}

/// Disk file the request resolved to, filled in by the static/dynamic
/// handlers.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub disk_path: PathBuf,
    pub extension: String,
    pub content_type: &'static str,
}

/// Rewrite provenance kept for logging and redirect answers.
#[derive(Debug, Clone)]
pub struct RewriteInfo {
    pub original_url: String,
    pub redirect_status: u16,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Percent-decoded path component.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub protocol: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub file: Option<FileInfo>,
    /// Set by the private handler to remap resolution off the public tree.
    pub docroot: Option<PathBuf>,
    pub rewrite: Option<RewriteInfo>,
    /// Authenticated username, set by the auth handler.
    pub username: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: String, query: String, protocol: String) -> Self {
        Self {
            method,
            path,
            query,
            protocol,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            file: None,
            docroot: None,
            rewrite: None,
            username: None,
        }
    }

    /// `path?query` as sent to workers and used in redirects.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// The raw request line for the access log.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method.as_str(), self.target(), self.protocol)
    }

    /// File extension of the path, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let last_segment = self.path.rsplit('/').next()?;
        let (_, ext) = last_segment.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Whether the client allows connection reuse.
    pub fn allows_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) => {
                let v = v.to_ascii_lowercase();
                if v.split(',').any(|t| t.trim() == "close") {
                    return false;
                }
                if v.split(',').any(|t| t.trim() == "keep-alive") {
                    return true;
                }
                self.protocol == "HTTP/1.1"
            }
            None => self.protocol == "HTTP/1.1",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(path: &str, query: &str) -> Request {
        Request::new(
            Method::Get,
            path.to_string(),
            query.to_string(),
            "HTTP/1.1".to_string(),
        )
    }

    #[test]
    fn target_includes_query() {
        assert_eq!(req("/a", "").target(), "/a");
        assert_eq!(req("/a", "x=1").target(), "/a?x=1");
    }

    #[test]
    fn extension_of_last_segment_only() {
        assert_eq!(req("/hello.php", "").extension(), Some("php"));
        assert_eq!(req("/a.b/c", "").extension(), None);
        assert_eq!(req("/docs", "").extension(), None);
        assert_eq!(req("/trailing.", "").extension(), None);
    }

    #[test]
    fn keep_alive_defaults_by_protocol() {
        let mut r = req("/", "");
        assert!(r.allows_keep_alive());
        r.protocol = "HTTP/1.0".to_string();
        assert!(!r.allows_keep_alive());
        r.headers.insert("connection", "keep-alive");
        assert!(r.allows_keep_alive());
        r.headers.insert("connection", "close");
        assert!(!r.allows_keep_alive());
    }
}
