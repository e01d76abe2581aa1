/// Parser guardrails. Excess input is truncated rather than failing the
/// connection.
pub const MAX_HEADERS: usize = 100;
pub const MAX_HEADER_NAME: usize = 256;
pub const MAX_HEADER_VALUE: usize = 8190;

/// Header names where a duplicate replaces the earlier value instead of
/// combining into a comma list.
const LAST_WINS: &[&str] = &["connection", "keep-alive"];

/// Ordered header mapping with case-insensitive lookup.
///
/// Insertion order is preserved; request parsing lower-cases names while
/// response building keeps them as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a header, replacing any existing value in place.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Add a header with request-parse semantics: size limits enforced by
    /// truncation, duplicates combined into a comma list except for the
    /// last-wins set.
    pub fn append_parsed(&mut self, name: &str, value: &str) {
        let name = truncate(name, MAX_HEADER_NAME);
        let value = truncate(value, MAX_HEADER_VALUE);
        if LAST_WINS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            self.insert(name, value);
            return;
        }
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            let mut combined = String::with_capacity(entry.1.len() + 2 + value.len());
            combined.push_str(&entry.1);
            combined.push_str(", ");
            combined.push_str(value);
            entry.1 = truncate(&combined, MAX_HEADER_VALUE).to_string();
            return;
        }
        if self.entries.len() >= MAX_HEADERS {
            return;
        }
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Append continuation text to the most recent header (obs-fold).
    pub fn extend_last(&mut self, extra: &str) {
        if let Some((_, value)) = self.entries.last_mut() {
            if value.len() < MAX_HEADER_VALUE {
                let mut combined = String::with_capacity(value.len() + 1 + extra.len());
                combined.push_str(value);
                combined.push(' ');
                combined.push_str(extra);
                *value = truncate(&combined, MAX_HEADER_VALUE).to_string();
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.insert("Content-Type", "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn duplicates_combine_into_comma_list() {
        let mut h = HeaderMap::new();
        h.append_parsed("accept", "text/html");
        h.append_parsed("accept", "application/json");
        assert_eq!(h.get("accept"), Some("text/html, application/json"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn connection_is_last_wins() {
        let mut h = HeaderMap::new();
        h.append_parsed("connection", "keep-alive");
        h.append_parsed("connection", "close");
        assert_eq!(h.get("connection"), Some("close"));
    }

    #[test]
    fn header_count_is_capped() {
        let mut h = HeaderMap::new();
        for i in 0..(MAX_HEADERS + 20) {
            h.append_parsed(&format!("x-h{}", i), "v");
        }
        assert_eq!(h.len(), MAX_HEADERS);
    }

    #[test]
    fn oversize_value_is_truncated() {
        let mut h = HeaderMap::new();
        let long = "x".repeat(MAX_HEADER_VALUE + 100);
        h.append_parsed("x-long", &long);
        assert_eq!(h.get("x-long").map(|v| v.len()), Some(MAX_HEADER_VALUE));
    }

    #[test]
    fn obs_fold_appends_to_previous_header() {
        let mut h = HeaderMap::new();
        h.append_parsed("x-multi", "first");
        h.extend_last("second");
        assert_eq!(h.get("x-multi"), Some("first second"));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut h = HeaderMap::new();
        h.insert("B", "2");
        h.insert("A", "1");
        h.insert("C", "3");
        let names: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }
}
