//! Cookie-header parsing.

use crate::types::Cookie;

/// Parse a `name=value; name=value` cookie string.
///
/// Pairs are split on `;`, each pair on the first `=`. Whitespace around
/// names and values is trimmed, pairs without an `=` or with an empty name
/// are discarded. The caller scopes the surviving cookies to the capture's
/// target URL.
pub fn parse_cookie_header(raw: &str) -> Vec<Cookie> {
    raw.split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie {
                name: name.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}
