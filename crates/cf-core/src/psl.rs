//! Registrable domain (eTLD+1) extraction
//!
//! Party classification and attribution both compare registrable domains.
//! Lookups use the embedded public suffix list. Hosts under a suffix the
//! list does not know fall back to a heuristic covering the common
//! two-part suffixes.
//!
//! ```
//! use cf_core::psl::registrable_domain;
//!
//! assert_eq!(registrable_domain("sub.example.com"), "example.com");
//! assert_eq!(registrable_domain("sub.example.co.uk"), "example.co.uk");
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

use publicsuffix::{List, Psl};

// =============================================================================
// LRU Cache
// =============================================================================

/// Small fixed-size cache for registrable domain lookups.
struct LruCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let value = self.entries.get(key)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
        Some(value)
    }

    fn insert(&mut self, key: String, value: String) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }
}

// =============================================================================
// Suffix List
// =============================================================================

/// Public suffix list shipped with the crate.
const PUBLIC_SUFFIX_LIST: &str = include_str!("../data/public_suffix_list.dat");

static SUFFIX_LIST: OnceLock<Option<List>> = OnceLock::new();
static CACHE: OnceLock<Mutex<LruCache>> = OnceLock::new();

fn suffix_list() -> Option<&'static List> {
    SUFFIX_LIST
        .get_or_init(|| match PUBLIC_SUFFIX_LIST.parse::<List>() {
            Ok(list) => Some(list),
            Err(e) => {
                log::warn!("public suffix list failed to parse, using heuristic: {}", e);
                None
            }
        })
        .as_ref()
}

/// Registrable domain from the suffix list. A host that is itself a public
/// suffix maps to itself.
fn lookup(list: &List, host: &str) -> Option<String> {
    if let Some(domain) = list.domain(host.as_bytes()) {
        return std::str::from_utf8(domain.as_bytes()).ok().map(str::to_string);
    }
    match list.suffix(host.as_bytes()) {
        Some(suffix) if suffix.as_bytes().len() == host.len() => Some(host.to_string()),
        _ => None,
    }
}

// =============================================================================
// Registrable Domain
// =============================================================================

/// Common two-part suffixes for hosts the suffix list has no rule for.
const COMMON_TWO_PART_TLDS: &[&str] = &[
    "co.uk", "co.jp", "co.nz", "co.za", "co.in", "co.kr",
    "com.au", "com.br", "com.cn", "com.mx", "com.tw", "com.hk",
    "net.au", "net.nz",
    "org.uk", "org.au",
    "gov.uk", "gov.au",
    "ac.uk", "ac.jp",
    "ne.jp", "or.jp",
];

/// Registrable domain of a host. IP addresses and single labels map to
/// themselves.
pub fn registrable_domain(host: &str) -> String {
    let host = normalize_host(host);
    if host.is_empty() || is_ip_address(&host) {
        return host;
    }

    let cache = CACHE.get_or_init(|| Mutex::new(LruCache::new(4096)));
    if let Ok(mut cache) = cache.lock() {
        if let Some(hit) = cache.get(&host) {
            return hit;
        }
    }

    let result = compute_registrable_domain(&host);

    if let Ok(mut cache) = cache.lock() {
        cache.insert(host, result.clone());
    }
    result
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn compute_registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 1 {
        return host.to_string();
    }

    if let Some(domain) = suffix_list().and_then(|list| lookup(list, host)) {
        return domain;
    }

    fallback_registrable_domain(&labels)
}

fn fallback_registrable_domain(labels: &[&str]) -> String {
    let n = labels.len();
    if n <= 2 {
        return labels.join(".");
    }

    let last_two = format!("{}.{}", labels[n - 2], labels[n - 1]);
    if COMMON_TWO_PART_TLDS.contains(&last_two.as_str()) {
        return labels[n - 3..].join(".");
    }

    labels[n - 2..].join(".")
}

fn is_ip_address(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<std::net::IpAddr>().is_ok()
}

/// Same registrable domain, or the same host when there is none.
pub fn same_domain_or_host(a: &str, b: &str) -> bool {
    let a = normalize_host(a);
    let b = normalize_host(b);
    if a == b {
        return true;
    }
    if is_ip_address(&a) || is_ip_address(&b) {
        return false;
    }
    registrable_domain(&a) == registrable_domain(&b)
}

/// `host` equals `domain` or is a subdomain of it on a label boundary.
pub fn is_subdomain_of(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() || host.len() < domain.len() {
        return false;
    }
    let split = host.len() - domain.len();
    if !host.is_char_boundary(split) || !host[split..].eq_ignore_ascii_case(domain) {
        return false;
    }
    split == 0 || host.as_bytes()[split - 1] == b'.'
}

/// Get the parent domain (strip leftmost label).
pub fn get_parent_domain(host: &str) -> Option<&str> {
    match host.find('.') {
        Some(idx) if idx < host.len() - 1 => Some(&host[idx + 1..]),
        _ => None,
    }
}

/// Iterator over a host and its parents, down to the registrable domain.
pub struct HostSuffixIter<'a> {
    current: Option<&'a str>,
    min_len: usize,
}

impl<'a> Iterator for HostSuffixIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.current?;
        self.current = get_parent_domain(result).filter(|parent| parent.len() >= self.min_len);
        Some(result)
    }
}

/// Walk host suffixes from most specific to least specific.
pub fn walk_host_suffixes(host: &str) -> HostSuffixIter<'_> {
    let host = host.trim_end_matches('.');
    let min_len = if host.is_empty() { 0 } else { registrable_domain(host).len() };
    HostSuffixIter {
        current: if host.is_empty() { None } else { Some(host) },
        min_len,
    }
}
