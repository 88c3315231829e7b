//! URI parsing and RFC 3986 percent-encoding.

use crate::error::{AgentError, AgentResult};

/// The pieces of a single-origin URI this client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub https: bool,
    pub host: String,
    pub port: u16,
    /// Path prefix, e.g. `/v1`. Empty string if none.
    pub base_path: String,
}

impl Origin {
    pub fn parse(uri: &str) -> AgentResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| AgentError::Protocol(format!("missing scheme in URI: {uri}")))?;

        let https = match scheme {
            "https" => true,
            "http" => false,
            other => {
                return Err(AgentError::Protocol(format!(
                    "unsupported URI scheme: {other}"
                )))
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse()
                    .map_err(|_| AgentError::Protocol(format!("invalid port in URI: {uri}")))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if https { 443 } else { 80 }),
        };

        let base_path = path.trim_end_matches('/').to_string();

        Ok(Self {
            https,
            host,
            port,
            base_path,
        })
    }
}

/// RFC 3986 unreserved characters: `A-Z a-z 0-9 - _ . ~`.
fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

/// Percent-encodes a string per RFC 3986, with a space encoding to `%20`
/// (not `+`). When `preserve_slash` is set, `/` passes through unescaped —
/// callers encoding a full path component-by-component want this; callers
/// encoding a single segment (e.g. a query value) do not.
pub fn encode_uri(input: &str, preserve_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());

    for &byte in input.as_bytes() {
        if is_unreserved(byte) || (preserve_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_default_port() {
        let origin = Origin::parse("https://api.example.com/v1").unwrap();
        assert_eq!(origin.host, "api.example.com");
        assert_eq!(origin.port, 443);
        assert!(origin.https);
        assert_eq!(origin.base_path, "/v1");
    }

    #[test]
    fn test_parse_http_explicit_port() {
        let origin = Origin::parse("http://localhost:8080").unwrap();
        assert_eq!(origin.host, "localhost");
        assert_eq!(origin.port, 8080);
        assert!(!origin.https);
        assert_eq!(origin.base_path, "");
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(Origin::parse("ftp://example.com").is_err());
    }

    #[test]
    fn test_encode_space_becomes_percent_20() {
        assert_eq!(encode_uri("a b", false), "a%20b");
    }

    #[test]
    fn test_encode_preserves_slash_when_requested() {
        assert_eq!(encode_uri("a/b c", true), "a/b%20c");
        assert_eq!(encode_uri("a/b c", false), "a%2Fb%20c");
    }

    #[test]
    fn test_encode_unreserved_untouched() {
        assert_eq!(encode_uri("abc-._~123", false), "abc-._~123");
    }
}
