//! Per-rule predicates
//!
//! Pattern bodies are compiled once into a small op program; `*` becomes
//! [`PatternOp::SkipAny`], `^` becomes [`PatternOp::Boundary`] and runs of
//! other characters become literals. Matching backtracks over the literal
//! occurrences so `^` and `|` anchors are honored exactly; failed states are
//! remembered, which keeps the work linear in the URL per op.

use crate::hash::hash_token;
use crate::psl::{is_subdomain_of, same_domain_or_host};
use crate::types::{AnchorType, Party, Rule};
use crate::url::{get_host_position, is_boundary_char, Origin};

// =============================================================================
// Pattern
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PatternOp {
    /// Literal, lowercased unless the rule is case sensitive
    Lit(Box<[u8]>),
    /// `^`: a separator character or the end of the URL
    Boundary,
    /// `*`
    SkipAny,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPattern {
    ops: Vec<PatternOp>,
    anchor_start: bool,
    anchor_end: bool,
    host_anchor: bool,
    /// Host prefix stripped from `ops`, matched against the URL host.
    host: Option<String>,
    case_sensitive: bool,
}

impl CompiledPattern {
    pub fn compile(rule: &Rule) -> Self {
        let host_anchor = rule.anchor_type.contains(AnchorType::HOST);
        let mut body = rule.pattern.as_str();
        let mut host = None;

        if host_anchor {
            if let Some(h) = rule.host.as_deref() {
                if body.len() >= h.len() && body.is_char_boundary(h.len()) && body[..h.len()].eq_ignore_ascii_case(h) {
                    body = &body[h.len()..];
                    host = Some(h.to_ascii_lowercase());
                }
            }
        }

        Self {
            ops: compile_ops(body, rule.is_case_sensitive),
            anchor_start: rule.anchor_type.contains(AnchorType::START),
            anchor_end: rule.anchor_type.contains(AnchorType::END),
            host_anchor,
            host,
            case_sensitive: rule.is_case_sensitive,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        let text = url.as_bytes();
        let mut memo = FailureMemo::new(self.ops.len(), text.len());

        if self.host_anchor {
            let Some((host_start, host_end)) = get_host_position(url) else {
                return false;
            };
            if let Some(host) = &self.host {
                return is_subdomain_of(&url[host_start..host_end], host)
                    && self.run(&self.ops, text, host_end, true, &mut memo);
            }
            // Any label start inside the host.
            return (host_start..host_end)
                .filter(|&i| i == host_start || text[i - 1] == b'.')
                .any(|i| self.run(&self.ops, text, i, true, &mut memo));
        }

        self.run(&self.ops, text, 0, self.anchor_start, &mut memo)
    }

    fn run(&self, ops: &[PatternOp], text: &[u8], pos: usize, anchored: bool, memo: &mut FailureMemo) -> bool {
        let Some((op, rest)) = ops.split_first() else {
            return !self.anchor_end || !anchored || pos == text.len();
        };
        if memo.has_failed(ops.len(), pos, anchored) {
            return false;
        }

        let found = match op {
            PatternOp::SkipAny => self.run(rest, text, pos, false, memo),
            PatternOp::Lit(lit) if anchored => {
                self.literal_at(lit, text, pos) && self.run(rest, text, pos + lit.len(), true, memo)
            }
            PatternOp::Boundary if anchored => match text.get(pos) {
                None if pos == text.len() => self.run(rest, text, pos, true, memo),
                Some(&b) => is_boundary_char(b) && self.run(rest, text, pos + 1, true, memo),
                None => false,
            },
            // Unanchored: try each start in turn. A start that already failed
            // unanchored means every later start failed too.
            _ => {
                let mut end = pos;
                let mut found = false;
                while end <= text.len() {
                    if end > pos && memo.has_failed(ops.len(), end, false) {
                        break;
                    }
                    if self.run(ops, text, end, true, memo) {
                        found = true;
                        break;
                    }
                    end += 1;
                }
                if !found {
                    for i in pos..end.min(text.len() + 1) {
                        memo.mark_failed(ops.len(), i, false);
                    }
                }
                found
            }
        };

        if !found {
            memo.mark_failed(ops.len(), pos, anchored);
        }
        found
    }

    fn literal_at(&self, lit: &[u8], text: &[u8], pos: usize) -> bool {
        match text.get(pos..pos + lit.len()) {
            Some(window) if self.case_sensitive => window == lit,
            Some(window) => window.iter().zip(lit).all(|(a, b)| a.to_ascii_lowercase() == *b),
            None => false,
        }
    }
}

/// `(remaining ops, position, anchored)` states known not to match.
/// Without it, patterns such as `a*a*a*b` backtrack exponentially.
struct FailureMemo {
    failed: Vec<bool>,
    width: usize,
    ops: usize,
}

impl FailureMemo {
    fn new(ops: usize, text_len: usize) -> Self {
        Self {
            failed: Vec::new(),
            width: text_len + 1,
            ops,
        }
    }

    fn slot(&self, remaining: usize, pos: usize, anchored: bool) -> usize {
        (remaining * 2 + usize::from(anchored)) * self.width + pos
    }

    fn has_failed(&self, remaining: usize, pos: usize, anchored: bool) -> bool {
        self.failed
            .get(self.slot(remaining, pos, anchored))
            .copied()
            .unwrap_or(false)
    }

    fn mark_failed(&mut self, remaining: usize, pos: usize, anchored: bool) {
        if pos >= self.width {
            return;
        }
        if self.failed.is_empty() {
            // Allocated on the first failure; matches that succeed outright skip it.
            self.failed = vec![false; (self.ops + 1) * 2 * self.width];
        }
        let slot = self.slot(remaining, pos, anchored);
        self.failed[slot] = true;
    }
}

fn compile_ops(body: &str, case_sensitive: bool) -> Vec<PatternOp> {
    let mut ops = Vec::new();
    let mut literal = Vec::new();

    let flush = |literal: &mut Vec<u8>, ops: &mut Vec<PatternOp>| {
        if !literal.is_empty() {
            ops.push(PatternOp::Lit(std::mem::take(literal).into_boxed_slice()));
        }
    };

    for &b in body.as_bytes() {
        match b {
            b'*' => {
                flush(&mut literal, &mut ops);
                if ops.last() != Some(&PatternOp::SkipAny) {
                    ops.push(PatternOp::SkipAny);
                }
            }
            b'^' => {
                flush(&mut literal, &mut ops);
                ops.push(PatternOp::Boundary);
            }
            _ if case_sensitive => literal.push(b),
            _ => literal.push(b.to_ascii_lowercase()),
        }
    }
    flush(&mut literal, &mut ops);
    ops
}

// =============================================================================
// Token Selection
// =============================================================================

/// Pick the longest alphanumeric run of the pattern that is guaranteed to
/// be a whole URL token, so the rule can be found through the token table.
pub(crate) fn select_token(rule: &Rule) -> Option<u32> {
    let bytes = rule.pattern.as_bytes();
    let anchored_start = rule.anchor_type.intersects(AnchorType::START | AnchorType::HOST);
    let anchored_end = rule.anchor_type.contains(AnchorType::END);

    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_alphanumeric() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
            i += 1;
        }
        let end = i;

        let left_ok = match start.checked_sub(1).map(|p| bytes[p]) {
            None => anchored_start,
            Some(b'*') => false,
            Some(_) => true,
        };
        let right_ok = match bytes.get(end) {
            None => anchored_end,
            Some(b'*') => false,
            // Scheme runs are not part of the URL token stream.
            Some(b':') => false,
            Some(_) => true,
        };

        if left_ok && right_ok && end - start >= 3 && best.map_or(true, |(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    }

    let (start, end) = best?;
    Some(hash_token(&rule.pattern[start..end].to_ascii_lowercase()))
}

// =============================================================================
// Party
// =============================================================================

/// Relationship between a request URL and the document that issued it.
#[derive(Debug, Clone, Copy)]
pub struct PartyMatcher {
    first_party: bool,
    same_origin: bool,
}

impl PartyMatcher {
    /// Opaque document origins make every request third party.
    pub fn new(url: &str, document_origin: Option<&str>) -> Self {
        let origin = document_origin.and_then(Origin::parse);
        let request_host = crate::url::extract_host(url).unwrap_or("");

        let first_party = origin
            .as_ref()
            .is_some_and(|o| !request_host.is_empty() && same_domain_or_host(&o.host, request_host));
        let same_origin = origin.as_ref().is_some_and(|o| o.is_same_origin_with(url));

        Self {
            first_party,
            same_origin,
        }
    }

    pub fn is_first_party(&self) -> bool {
        self.first_party
    }

    pub fn is_same_origin(&self) -> bool {
        self.same_origin
    }

    pub fn matches(&self, party: Party) -> bool {
        match party {
            Party::All => true,
            Party::First => self.first_party,
            Party::Third => !self.first_party,
            Party::StrictFirst => self.same_origin,
            Party::StrictThird => !self.same_origin,
            Party::FirstAndStrictThird => self.first_party && !self.same_origin,
        }
    }
}

// =============================================================================
// Domains
// =============================================================================

/// `domain=` constraints against the document host. The most specific
/// listed domain decides when both lists match.
pub(crate) fn domains_match(rule: &Rule, document_host: Option<&str>) -> bool {
    if rule.included_domains.is_empty() && rule.excluded_domains.is_empty() {
        return true;
    }
    let Some(host) = document_host else {
        return rule.included_domains.is_empty();
    };

    let longest = |domains: &[String]| {
        domains
            .iter()
            .filter(|d| is_subdomain_of(host, d))
            .map(|d| d.len())
            .max()
    };

    let included = longest(&rule.included_domains);
    let excluded = longest(&rule.excluded_domains);

    if !rule.included_domains.is_empty() && included.is_none() {
        return false;
    }
    match (included, excluded) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(inc), Some(exc)) => inc > exc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;

    fn rule(pattern: &str, anchor_type: AnchorType, host: Option<&str>) -> Rule {
        Rule {
            pattern: pattern.to_string(),
            anchor_type,
            host: host.map(str::to_string),
            resource_types: ResourceType::ALL,
            ..Rule::default()
        }
    }

    fn matches(r: &Rule, url: &str) -> bool {
        CompiledPattern::compile(r).matches(url)
    }

    #[test]
    fn plain_substring() {
        let r = rule("/ads/", AnchorType::empty(), None);
        assert!(matches(&r, "https://example.com/ads/banner.png"));
        assert!(matches(&r, "https://example.com/ADS/banner.png"));
        assert!(!matches(&r, "https://example.com/adsx/banner.png"));
    }

    #[test]
    fn host_anchor_with_separator() {
        let r = rule("ads.example.com^", AnchorType::HOST, Some("ads.example.com"));
        assert!(matches(&r, "https://ads.example.com/x"));
        assert!(matches(&r, "https://cdn.ads.example.com/x"));
        assert!(matches(&r, "https://ads.example.com"));
        assert!(matches(&r, "https://ads.example.com:8080/"));
        assert!(!matches(&r, "https://badads.example.com/x"));
        assert!(!matches(&r, "https://example.com/ads.example.com/"));
    }

    #[test]
    fn host_anchor_without_host_tries_label_starts() {
        let r = rule("ads*.net/", AnchorType::HOST, None);
        assert!(matches(&r, "https://x.ads-cdn.net/p"));
        assert!(!matches(&r, "https://xads-cdn.net/p"));
    }

    #[test]
    fn start_and_end_anchors() {
        let start = rule("https://track.", AnchorType::START, None);
        assert!(matches(&start, "https://track.example/"));
        assert!(!matches(&start, "http://x/?u=https://track.example/"));

        let end = rule(".gif", AnchorType::END, None);
        assert!(matches(&end, "https://a.com/p.gif"));
        assert!(!matches(&end, "https://a.com/p.gif?x=1"));
    }

    #[test]
    fn separator_backtracks_over_earlier_occurrences() {
        let r = rule("track^id", AnchorType::empty(), None);
        assert!(matches(&r, "https://a.com/tracker/track/id"));
        assert!(!matches(&r, "https://a.com/trackid"));
    }

    #[test]
    fn wildcards() {
        let r = rule("/banner/*/img^", AnchorType::empty(), None);
        assert!(matches(&r, "https://a.com/banner/300x250/img?x"));
        assert!(!matches(&r, "https://a.com/banner/img"));

        let empty = rule("", AnchorType::empty(), None);
        assert!(matches(&empty, "https://anything/"));
    }

    #[test]
    fn repeated_wildcards_match_in_bounded_time() {
        let r = rule("a*a*a*a*a*a*a*a*b", AnchorType::empty(), None);
        let url = format!("https://x.test/{}", "a".repeat(2000));

        let start = std::time::Instant::now();
        assert!(!matches(&r, &url));
        assert!(matches(&r, &format!("{url}b")));
        assert!(start.elapsed() < std::time::Duration::from_secs(2));

        let bounded = rule("a*a*a*a^", AnchorType::END, None);
        assert!(!matches(&bounded, &format!("{url}x")));
        assert!(matches(&bounded, &format!("{url}/")));
    }

    #[test]
    fn case_sensitive_literals() {
        let mut r = rule("/Ads/", AnchorType::empty(), None);
        r.is_case_sensitive = true;
        assert!(matches(&r, "https://a.com/Ads/x"));
        assert!(!matches(&r, "https://a.com/ads/x"));
    }

    #[test]
    fn token_selection_avoids_partial_runs() {
        let r = rule("/analytics.js", AnchorType::empty(), None);
        assert_eq!(select_token(&r), Some(hash_token("analytics")));

        // Both runs touch the unanchored pattern edges.
        let r = rule("banner", AnchorType::empty(), None);
        assert_eq!(select_token(&r), None);

        let r = rule("ad*server/", AnchorType::empty(), None);
        assert_eq!(select_token(&r), None);

        let r = rule("https://track", AnchorType::START, None);
        assert_eq!(select_token(&r), None);
    }

    #[test]
    fn party_classification() {
        let same = PartyMatcher::new("https://example.com/x.js", Some("https://example.com"));
        assert!(same.matches(Party::First));
        assert!(same.matches(Party::StrictFirst));
        assert!(!same.matches(Party::FirstAndStrictThird));

        let sibling = PartyMatcher::new("https://cdn.example.com/x.js", Some("https://www.example.com"));
        assert!(sibling.matches(Party::First));
        assert!(sibling.matches(Party::StrictThird));
        assert!(sibling.matches(Party::FirstAndStrictThird));

        let third = PartyMatcher::new("https://tracker.net/p", Some("https://example.com"));
        assert!(third.matches(Party::Third));
        assert!(!third.matches(Party::First));

        let opaque = PartyMatcher::new("https://example.com/p", None);
        assert!(opaque.matches(Party::Third));
        assert!(opaque.matches(Party::StrictThird));
    }

    #[test]
    fn domain_constraints() {
        let mut r = rule("x", AnchorType::empty(), None);
        r.included_domains = vec!["example.com".to_string()];
        r.excluded_domains = vec!["shop.example.com".to_string()];
        assert!(domains_match(&r, Some("www.example.com")));
        assert!(!domains_match(&r, Some("shop.example.com")));
        assert!(!domains_match(&r, Some("other.org")));
        assert!(!domains_match(&r, None));

        let mut only_excluded = rule("x", AnchorType::empty(), None);
        only_excluded.excluded_domains = vec!["example.com".to_string()];
        assert!(domains_match(&only_excluded, None));
        assert!(!domains_match(&only_excluded, Some("a.example.com")));
        assert!(domains_match(&only_excluded, Some("example.org")));
    }
}
