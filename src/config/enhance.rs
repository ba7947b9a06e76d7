//! Pre-parse text transforms and list normalisation for the config file.

/// Expand `${VAR}`, `${VAR:-default}` and `$VAR` references.
/// Undefined variables expand to the empty string; a lone `$` is kept.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let expr: String = chars.by_ref().take_while(|&c| c != '}').collect();
            let value = match expr.split_once(":-") {
                Some((name, fallback)) => std::env::var(name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| fallback.to_string()),
                None => std::env::var(&expr).unwrap_or_default(),
            };
            out.push_str(&value);
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if !(next.is_ascii_alphanumeric() || next == '_') {
                break;
            }
            name.push(next);
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

/// Split a free-form list: commas (ASCII or full-width), tabs, quotes
/// and newlines all separate entries. Empty entries are dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| matches!(c, ',' | '，' | '\t' | '"' | '\'' | '\r' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical protocol name: lowercase, with `shadowsocks`/`socks` aliases folded.
pub fn normalize_protocol_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "shadowsocks" => "ss".to_string(),
        "socks" => "socks5".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_braced_and_default() {
        std::env::set_var("EG_TEST_ENHANCE_HOST", "relay.example");
        std::env::remove_var("EG_TEST_ENHANCE_MISSING");
        assert_eq!(
            expand_env_vars("a: ${EG_TEST_ENHANCE_HOST}:443"),
            "a: relay.example:443"
        );
        assert_eq!(
            expand_env_vars("b: ${EG_TEST_ENHANCE_MISSING:-fallback}"),
            "b: fallback"
        );
        assert_eq!(expand_env_vars("c: ${EG_TEST_ENHANCE_MISSING}x"), "c: x");
    }

    #[test]
    fn expand_bare_var_and_lone_dollar() {
        std::env::set_var("EG_TEST_ENHANCE_BARE", "v");
        assert_eq!(expand_env_vars("$EG_TEST_ENHANCE_BARE/x"), "v/x");
        assert_eq!(expand_env_vars("cost: $ 5"), "cost: $ 5");
    }

    #[test]
    fn split_list_separators() {
        assert_eq!(
            split_list("a.com, b.com\n\"c.com\"\td.com，e.com"),
            vec!["a.com", "b.com", "c.com", "d.com", "e.com"]
        );
        assert!(split_list(" , ,\n").is_empty());
    }

    #[test]
    fn protocol_aliases() {
        assert_eq!(normalize_protocol_name("Shadowsocks"), "ss");
        assert_eq!(normalize_protocol_name("SOCKS"), "socks5");
        assert_eq!(normalize_protocol_name(" vless "), "vless");
    }
}
