/// Substitute `{key}` tokens in a page template.
///
/// Unknown tokens are left untouched so a literal brace in a page body does
/// not have to be escaped.
pub fn substitute(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let key = &template[i + 1..i + 1 + end];
                if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                    out.push_str(value);
                    i += end + 2;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_tokens() {
        let vars = [("version", "0.4.2".to_string()), ("clients", "3".to_string())];
        let out = substitute("stoa {version} serving {clients} clients", &vars);
        assert_eq!(out, "stoa 0.4.2 serving 3 clients");
    }

    #[test]
    fn leaves_unknown_tokens_alone() {
        let out = substitute("body { color: red; } {version}", &[("version", "1".to_string())]);
        assert_eq!(out, "body { color: red; } 1");
    }

    #[test]
    fn handles_token_at_end() {
        let out = substitute("sig: {signature}", &[("signature", "stoa/0.4.2".to_string())]);
        assert_eq!(out, "sig: stoa/0.4.2");
    }
}
