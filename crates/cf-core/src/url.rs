//! URL parsing utilities for the hot path
//!
//! These functions avoid allocations and work directly on string slices.
//! [`Origin`] is the one owned type; it is built once per document.

use crate::hash::hash_token_bytes;

// =============================================================================
// Scheme
// =============================================================================

/// Get the position after "://" (or after ":" for data/about/blob URLs).
#[inline]
pub fn get_scheme_end(url: &str) -> Option<usize> {
    let bytes = url.as_bytes();
    let colon_pos = bytes.iter().position(|&b| b == b':')?;
    if colon_pos == 0 || !bytes[..colon_pos].iter().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')) {
        return None;
    }

    if bytes.len() > colon_pos + 2 && bytes[colon_pos + 1] == b'/' && bytes[colon_pos + 2] == b'/' {
        return Some(colon_pos + 3);
    }
    Some(colon_pos + 1)
}

/// Scheme without the trailing ':', as written in the URL.
#[inline]
pub fn extract_scheme(url: &str) -> Option<&str> {
    let colon = url.find(':')?;
    get_scheme_end(url)?;
    Some(&url[..colon])
}

/// http or https, case-insensitive.
#[inline]
pub fn is_http_or_https(url: &str) -> bool {
    matches!(extract_scheme(url), Some(s) if s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

// =============================================================================
// Host
// =============================================================================

/// Start and end of the host in a URL. Userinfo and port are excluded.
#[inline]
pub fn get_host_position(url: &str) -> Option<(usize, usize)> {
    let scheme_end = get_scheme_end(url)?;
    if !url[..scheme_end].ends_with("//") {
        return None;
    }
    let bytes = url.as_bytes();

    let authority_end = bytes[scheme_end..]
        .iter()
        .position(|&b| matches!(b, b'/' | b'?' | b'#'))
        .map_or(bytes.len(), |p| scheme_end + p);

    let host_start = bytes[scheme_end..authority_end]
        .iter()
        .rposition(|&b| b == b'@')
        .map_or(scheme_end, |p| scheme_end + p + 1);

    // IPv6 literal keeps its colons.
    if bytes.get(host_start) == Some(&b'[') {
        let close = bytes[host_start..authority_end].iter().position(|&b| b == b']')?;
        return Some((host_start, host_start + close + 1));
    }

    let host_end = bytes[host_start..authority_end]
        .iter()
        .position(|&b| b == b':')
        .map_or(authority_end, |p| host_start + p);

    Some((host_start, host_end))
}

/// Host slice of a URL.
#[inline]
pub fn extract_host(url: &str) -> Option<&str> {
    let (start, end) = get_host_position(url)?;
    Some(&url[start..end])
}

fn extract_port(url: &str) -> Option<u16> {
    let (_, host_end) = get_host_position(url)?;
    let rest = url[host_end..].strip_prefix(':')?;
    let end = rest.find(|c: char| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

// =============================================================================
// Query
// =============================================================================

/// Query string without '?' and without the fragment.
#[inline]
pub fn extract_query(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let q = without_fragment.find('?')?;
    Some(&without_fragment[q + 1..])
}

// =============================================================================
// Origin
// =============================================================================

/// Scheme, host and port of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Origin {
    /// Parse an origin or a full URL. Returns `None` for opaque origins
    /// ("null", data:, about:blank, ...).
    pub fn parse(s: &str) -> Option<Self> {
        let scheme = extract_scheme(s)?.to_ascii_lowercase();
        let host = extract_host(s)?;
        if host.is_empty() {
            return None;
        }
        let port = extract_port(s).or_else(|| default_port(&scheme));
        Some(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Same scheme, host and port as the given URL.
    pub fn is_same_origin_with(&self, url: &str) -> bool {
        Origin::parse(url).is_some_and(|other| other == *self)
    }

    /// `scheme://host[:port]`, omitting default ports.
    pub fn serialize(&self) -> String {
        match self.port {
            Some(port) if Some(port) != default_port(&self.scheme) => {
                format!("{}://{}:{}", self.scheme, self.host, port)
            }
            _ => format!("{}://{}", self.scheme, self.host),
        }
    }
}

// =============================================================================
// URL Tokenization
// =============================================================================

const MIN_TOKEN_LEN: usize = 3;
const MAX_TOKENS: usize = 64;

/// Hash the lowercased alphanumeric runs of a URL (scheme excluded).
pub fn tokenize_url(url: &str) -> Vec<u32> {
    let mut tokens = Vec::with_capacity(16);
    let bytes = url.as_bytes();
    let start = get_scheme_end(url).unwrap_or(0);

    let mut buf = [0u8; 64];
    let mut token_start = None;

    for i in start..=bytes.len() {
        let is_alnum = i < bytes.len() && bytes[i].is_ascii_alphanumeric();
        if is_alnum {
            token_start.get_or_insert(i);
            continue;
        }
        if let Some(ts) = token_start.take() {
            let token = &bytes[ts..i];
            if token.len() >= MIN_TOKEN_LEN && tokens.len() < MAX_TOKENS {
                tokens.push(hash_lowercased(token, &mut buf));
            }
        }
    }

    tokens
}

/// Token hash of `token` lowercased, using `buf` when it fits.
pub fn hash_lowercased(token: &[u8], buf: &mut [u8; 64]) -> u32 {
    if token.len() <= buf.len() {
        for (dst, src) in buf.iter_mut().zip(token) {
            *dst = src.to_ascii_lowercase();
        }
        hash_token_bytes(&buf[..token.len()])
    } else {
        hash_token_bytes(&token.to_ascii_lowercase())
    }
}

// =============================================================================
// Boundary Check
// =============================================================================

/// ABP `^` separator: anything but a letter, digit, or one of `_-.%`.
#[inline]
pub fn is_boundary_char(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b'%'))
}

/// Position is at a separator or at the end of the string.
#[inline]
pub fn is_at_boundary(s: &str, pos: usize) -> bool {
    match s.as_bytes().get(pos) {
        None => true,
        Some(&c) => is_boundary_char(c),
    }
}
