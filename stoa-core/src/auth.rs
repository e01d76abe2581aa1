use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest as _, Md5};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// HTTP Digest (RFC 7616, MD5, qop=auth) challenge and verification for one
/// protection realm.
#[derive(Debug, Clone)]
pub struct DigestAuthenticator {
    realm: String,
    opaque: String,
    users: HashMap<String, String>,
    nonces: NonceStore,
}

#[derive(Debug, Clone)]
struct NonceStore {
    ttl: Duration,
    max_entries: usize,
    inner: Arc<Mutex<HashMap<String, NonceState>>>,
}

#[derive(Debug, Clone)]
struct NonceState {
    created: Instant,
    last_nc: u32,
}

impl DigestAuthenticator {
    pub fn new<I>(realm: &str, users: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            realm: realm.to_string(),
            opaque: md5_hex(realm.as_bytes()),
            users: users.into_iter().collect(),
            nonces: NonceStore::new(Duration::from_secs(300)),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Build the `WWW-Authenticate` value for a 401 challenge.
    pub fn challenge(&self) -> String {
        let nonce = self.nonces.issue_nonce();
        format!(
            "Digest realm=\"{}\",qop=\"auth\",nonce=\"{}\",opaque=\"{}\"",
            escape_quoted_header_value(&self.realm),
            nonce,
            self.opaque
        )
    }

    /// Verify an `Authorization` header value; returns the authenticated
    /// username on success.
    pub fn verify(&self, header_value: &str, method: &str, uri: &str) -> Option<String> {
        let payload = strip_auth_scheme(header_value, "Digest")?;
        let params = parse_digest(payload);

        let username = params.get("username").map(String::as_str).unwrap_or("");
        let realm = params.get("realm").map(String::as_str).unwrap_or("");
        let nonce = params.get("nonce").map(String::as_str).unwrap_or("");
        let digest_uri = params.get("uri").map(String::as_str).unwrap_or("");
        let response = params.get("response").map(String::as_str).unwrap_or("");
        let qop = params.get("qop").map(String::as_str);
        let nc = params.get("nc").map(String::as_str).unwrap_or("");
        let cnonce = params.get("cnonce").map(String::as_str).unwrap_or("");

        if realm != self.realm {
            return None;
        }
        if digest_uri.is_empty() || digest_uri != uri {
            return None;
        }
        // Challenges are issued with qop="auth"; nc/cnonce are required so
        // nonce-count progression can reject replays.
        if !matches!(qop, Some(q) if q.eq_ignore_ascii_case("auth")) {
            return None;
        }
        if cnonce.is_empty() {
            return None;
        }
        let parsed_nc = self.nonces.parse_nc(nonce, nc)?;

        let password = self.users.get(username)?;
        let ha1 = md5_hex(format!("{}:{}:{}", username, self.realm, password).as_bytes());
        let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
        let expected = md5_hex(
            format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, "auth", ha2).as_bytes(),
        );

        if constant_time_eq_hex_lower(expected.as_str(), response) {
            if !self.nonces.mark_nc_used(nonce, parsed_nc) {
                return None;
            }
            return Some(username.to_string());
        }
        None
    }
}

impl NonceStore {
    const DEFAULT_MAX_ENTRIES: usize = 65_536;

    fn new(ttl: Duration) -> Self {
        Self::with_max_entries(ttl, Self::DEFAULT_MAX_ENTRIES)
    }

    fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn issue_nonce(&self) -> String {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        let nonce = BASE64.encode(buf);

        let mut guard = self.inner.lock().expect("nonce mutex");
        Self::cleanup_expired_locked(&mut guard, self.ttl);
        while guard.len() >= self.max_entries {
            let Some(oldest_key) = guard
                .iter()
                .min_by_key(|(_, state)| state.created)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            guard.remove(&oldest_key);
        }
        guard.insert(
            nonce.clone(),
            NonceState {
                created: Instant::now(),
                last_nc: 0,
            },
        );
        nonce
    }

    fn parse_nc(&self, nonce: &str, nc_hex: &str) -> Option<u32> {
        let mut guard = self.inner.lock().expect("nonce mutex");
        Self::cleanup_expired_locked(&mut guard, self.ttl);

        let state = guard.get(nonce)?;
        if nc_hex.len() != 8 {
            return None;
        }
        let Ok(nc) = u32::from_str_radix(nc_hex, 16) else {
            return None;
        };
        if nc == 0 || nc <= state.last_nc {
            return None;
        }
        Some(nc)
    }

    fn mark_nc_used(&self, nonce: &str, nc: u32) -> bool {
        let mut guard = self.inner.lock().expect("nonce mutex");
        Self::cleanup_expired_locked(&mut guard, self.ttl);

        let Some(state) = guard.get_mut(nonce) else {
            return false;
        };
        if nc == 0 || nc <= state.last_nc {
            return false;
        }
        state.last_nc = nc;
        true
    }

    fn cleanup_expired_locked(guard: &mut HashMap<String, NonceState>, ttl: Duration) {
        let now = Instant::now();
        guard.retain(|_, state| now.duration_since(state.created) < ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("nonce mutex").len()
    }
}

fn strip_auth_scheme<'a>(header_value: &'a str, scheme: &str) -> Option<&'a str> {
    // RFC 9110: auth scheme names are case-insensitive.
    let value = header_value.trim_start();
    if value.len() <= scheme.len() {
        return None;
    }
    if !value[..scheme.len()].eq_ignore_ascii_case(scheme) {
        return None;
    }
    let rest = &value[scheme.len()..];
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_whitespace() => {}
        _ => return None,
    }
    Some(rest.trim_start_matches(|c: char| c.is_ascii_whitespace()))
}

fn parse_digest(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_quotes {
            current.push(ch);
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_quotes = true;
                current.push(ch);
            }
            ',' => {
                insert_digest_param(&mut out, current.as_str());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    insert_digest_param(&mut out, current.as_str());
    out
}

fn insert_digest_param(out: &mut HashMap<String, String>, raw: &str) {
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    let Some((key, value)) = raw.split_once('=') else {
        return;
    };
    let key = key.trim();
    if key.is_empty() {
        return;
    }
    let value = value.trim();
    let value = if value.starts_with('"') {
        unquote_http_quoted_string(value)
    } else {
        value.to_string()
    };
    out.insert(key.to_ascii_lowercase(), value);
}

fn unquote_http_quoted_string(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix('"') {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix('"') {
        s = rest;
    }
    let mut out = String::with_capacity(s.len());
    let mut escape = false;
    for ch in s.chars() {
        if escape {
            out.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        out.push(ch);
    }
    out
}

pub fn md5_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    hex_lower(digest.as_slice())
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

fn constant_time_eq_hex_lower(expected_lower: &str, actual: &str) -> bool {
    let a = expected_lower.as_bytes();
    let b = actual.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&expected, &byte) in a.iter().zip(b.iter()) {
        let lower = if byte.is_ascii_uppercase() {
            byte + 32
        } else {
            byte
        };
        diff |= expected ^ lower;
    }
    diff == 0
}

fn escape_quoted_header_value(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\r' | '\n' => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}
