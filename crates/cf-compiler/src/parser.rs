use std::net::IpAddr;

use cf_core::rule_store::SourceMetadata;
use cf_core::types::{ActivationType, AnchorType, Decision, Modifier, Party, ResourceType, Rule};

/// A rule as it comes out of the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub rule: Rule,
    /// `$badfilter`: cancels the identical rule instead of adding one.
    pub is_badfilter: bool,
}

/// Line counts collected while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub rules: usize,
    pub comments: usize,
    pub cosmetic: usize,
    pub unsupported: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedList {
    pub metadata: SourceMetadata,
    pub rules: Vec<ParsedRule>,
    pub stats: ParseStats,
}

pub fn parse_filter_list(text: &str) -> ParsedList {
    let mut list = ParsedList::default();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        list.stats.lines += 1;

        if is_comment_line(line) {
            parse_header_line(line, &mut list.metadata);
            list.stats.comments += 1;
            continue;
        }

        if is_cosmetic_line(line) {
            list.stats.cosmetic += 1;
            continue;
        }

        match parse_rule_line(line) {
            Some(parsed) => {
                list.stats.rules += 1;
                list.rules.push(parsed);
            }
            None => {
                log::debug!("unsupported rule: {line}");
                list.stats.unsupported += 1;
            }
        }
    }

    list
}

/// Parse one network rule. `None` for anything this compiler cannot express.
pub fn parse_rule_line(line: &str) -> Option<ParsedRule> {
    if let Some(host) = parse_hosts_file_domain(line) {
        return Some(ParsedRule {
            rule: Rule {
                pattern: format!("{host}^"),
                host: Some(host),
                anchor_type: AnchorType::HOST,
                resource_types: ResourceType::ALL,
                original_rule_text: line.to_string(),
                ..Rule::default()
            },
            is_badfilter: false,
        });
    }

    let (decision, body) = match line.strip_prefix("@@") {
        Some(rest) => (Decision::Pass, rest),
        None => (Decision::Modify, line),
    };

    let (pattern_part, options_text) = split_rule_options(body);
    let options = match options_text {
        Some(text) => parse_options(text, decision)?,
        None => ParsedOptions::default(),
    };

    let pattern = parse_pattern(pattern_part.trim())?;
    if pattern.pattern.is_empty() && options_text.is_none() {
        // Would match every request.
        return None;
    }

    let decision = if options.important && decision == Decision::Modify {
        Decision::ModifyImportant
    } else {
        decision
    };

    Some(ParsedRule {
        rule: Rule {
            decision,
            modifier: options.modifier,
            modifier_values: options.modifier_values,
            pattern: pattern.pattern,
            anchor_type: pattern.anchor_type,
            is_case_sensitive: options.match_case,
            host: pattern.host,
            party: options.party,
            resource_types: options.resource_types,
            activation_types: options.activation_types,
            included_domains: options.included_domains,
            excluded_domains: options.excluded_domains,
            ad_domains_and_query_triggers: options.ad_attribution,
            original_rule_text: line.to_string(),
        },
        is_badfilter: options.badfilter,
    })
}

// =============================================================================
// Header
// =============================================================================

fn parse_header_line(line: &str, metadata: &mut SourceMetadata) {
    let Some(body) = line.strip_prefix('!') else {
        return;
    };
    let Some((key, value)) = body.split_once(':') else {
        return;
    };
    let value = value.trim();
    match key.trim().to_ascii_lowercase().as_str() {
        "title" => metadata.title = value.to_string(),
        "homepage" => metadata.homepage = value.to_string(),
        "licence" | "license" => metadata.license = value.to_string(),
        "version" => metadata.version = value.to_string(),
        "expires" => metadata.expires_hours = parse_expires(value),
        _ => {}
    }
}

/// `4 days (update frequency)` → 96.
fn parse_expires(value: &str) -> Option<u32> {
    let mut parts = value.split_whitespace();
    let amount: u32 = parts.next()?.parse().ok()?;
    match parts.next().map(|u| u.to_ascii_lowercase()) {
        Some(unit) if unit.starts_with("day") => amount.checked_mul(24),
        Some(unit) if unit.starts_with("hour") => Some(amount),
        None => amount.checked_mul(24),
        _ => None,
    }
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
struct ParsedOptions {
    important: bool,
    match_case: bool,
    badfilter: bool,
    party: Party,
    resource_types: ResourceType,
    activation_types: ActivationType,
    modifier: Modifier,
    modifier_values: Vec<String>,
    included_domains: Vec<String>,
    excluded_domains: Vec<String>,
    ad_attribution: Vec<String>,
}

impl Default for ParsedOptions {
    fn default() -> Self {
        Self {
            important: false,
            match_case: false,
            badfilter: false,
            party: Party::All,
            resource_types: ResourceType::ALL,
            activation_types: ActivationType::empty(),
            modifier: Modifier::NoModifier,
            modifier_values: Vec::new(),
            included_domains: Vec::new(),
            excluded_domains: Vec::new(),
            ad_attribution: Vec::new(),
        }
    }
}

/// Options start at the last `$`.
fn split_rule_options(line: &str) -> (&str, Option<&str>) {
    match line.rfind('$') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    }
}

fn parse_options(text: &str, decision: Decision) -> Option<ParsedOptions> {
    let mut options = ParsedOptions::default();
    let mut type_include = ResourceType::empty();
    let mut type_exclude = ResourceType::empty();
    let mut document = false;
    let mut first_party: Option<bool> = None;
    let mut strict_first: Option<bool> = None;

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let (name, value) = match raw.split_once('=') {
            Some((name, value)) => (name.to_ascii_lowercase(), Some(value)),
            None => (raw.to_ascii_lowercase(), None),
        };

        if let Some(value) = value {
            match name.as_str() {
                "domain" | "from" => {
                    parse_domain_option(&value.to_ascii_lowercase(), &mut options)?;
                }
                "redirect" | "redirect-rule" => {
                    set_modifier(&mut options, Modifier::Redirect, value)?;
                }
                "csp" => set_modifier(&mut options, Modifier::Csp, value)?,
                "ad-query-trigger" => {
                    set_modifier(&mut options, Modifier::AdQueryTrigger, value)?;
                }
                "ad-attribution-tracker" => {
                    let (domain, trigger) = value.split_once('|')?;
                    let domain = normalize_domain(domain)?;
                    if trigger.is_empty() {
                        return None;
                    }
                    options.ad_attribution.push(format!("{domain}|{trigger}"));
                }
                _ => return None,
            }
            continue;
        }

        let (negated, name) = match name.strip_prefix('~') {
            Some(rest) => (true, rest.to_string()),
            None => (false, name),
        };

        match name.as_str() {
            "important" if !negated => options.important = true,
            "match-case" | "match_case" if !negated => options.match_case = true,
            "badfilter" if !negated => options.badfilter = true,
            "third-party" | "thirdparty" | "3p" => first_party = Some(negated),
            "first-party" | "firstparty" | "1p" => first_party = Some(!negated),
            "strict3p" | "strict-third-party" => strict_first = Some(negated),
            "strict1p" | "strict-first-party" => strict_first = Some(!negated),
            "document" | "doc" if !negated => document = true,
            "elemhide" | "ehide" if !negated => options.activation_types |= ActivationType::ELEMENT_HIDE,
            "generichide" | "ghide" if !negated => options.activation_types |= ActivationType::GENERIC_HIDE,
            "genericblock" if !negated => options.activation_types |= ActivationType::GENERIC_BLOCK,
            "attribute-ads" if !negated => options.activation_types |= ActivationType::ATTRIBUTE_ADS,
            // A pass without a value cancels every value of the modifier.
            "redirect" | "redirect-rule" if !negated && decision == Decision::Pass => {
                set_modifier(&mut options, Modifier::Redirect, "")?;
            }
            "csp" if !negated && decision == Decision::Pass => {
                set_modifier(&mut options, Modifier::Csp, "")?;
            }
            other => {
                let mask = resource_type_mask(other)?;
                if negated {
                    type_exclude |= mask;
                } else {
                    type_include |= mask;
                }
            }
        }
    }

    options.party = finalize_party(first_party, strict_first)?;

    if document {
        // Query trigger rules are matched against the navigation itself.
        if decision == Decision::Pass && options.modifier != Modifier::AdQueryTrigger {
            options.activation_types |= ActivationType::WHOLE_DOCUMENT;
        } else {
            type_include |= ResourceType::DOCUMENT;
        }
    }

    options.resource_types = finalize_mask(type_include, type_exclude)?;
    Some(options)
}

fn set_modifier(options: &mut ParsedOptions, modifier: Modifier, value: &str) -> Option<()> {
    if options.modifier != Modifier::NoModifier {
        return None;
    }
    options.modifier = modifier;
    options.modifier_values = match modifier {
        Modifier::AdQueryTrigger => value
            .split('|')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
        _ if value.is_empty() => Vec::new(),
        _ => vec![value.to_string()],
    };
    if modifier == Modifier::AdQueryTrigger && options.modifier_values.is_empty() {
        return None;
    }
    Some(())
}

fn parse_domain_option(value: &str, options: &mut ParsedOptions) -> Option<()> {
    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match raw.strip_prefix('~') {
            Some(domain) => options.excluded_domains.push(normalize_domain(domain)?),
            None => options.included_domains.push(normalize_domain(raw)?),
        }
    }
    Some(())
}

fn finalize_party(first_party: Option<bool>, strict_first: Option<bool>) -> Option<Party> {
    match (first_party, strict_first) {
        (None, None) => Some(Party::All),
        (Some(true), None) => Some(Party::First),
        (Some(false), None) => Some(Party::Third),
        (None, Some(true)) | (Some(true), Some(true)) => Some(Party::StrictFirst),
        (None, Some(false)) => Some(Party::StrictThird),
        (Some(true), Some(false)) => Some(Party::FirstAndStrictThird),
        (Some(false), Some(false)) => Some(Party::Third),
        // Third party and same origin at once.
        (Some(false), Some(true)) => None,
    }
}

/// Resource types after inclusions and `~` exclusions. Document requests
/// are only matched when named explicitly.
fn finalize_mask(include: ResourceType, exclude: ResourceType) -> Option<ResourceType> {
    let mask = if include.is_empty() {
        ResourceType::ALL - exclude
    } else {
        include - exclude
    };
    if mask.is_empty() {
        return None;
    }
    Some(mask)
}

fn resource_type_mask(name: &str) -> Option<ResourceType> {
    match name {
        "script" => Some(ResourceType::SCRIPT),
        "image" => Some(ResourceType::IMAGE),
        "stylesheet" | "css" => Some(ResourceType::STYLESHEET),
        "object" => Some(ResourceType::OBJECT),
        "subdocument" | "frame" => Some(ResourceType::SUBDOCUMENT),
        "xmlhttprequest" | "xhr" => Some(ResourceType::XMLHTTPREQUEST),
        "media" => Some(ResourceType::MEDIA),
        "font" => Some(ResourceType::FONT),
        "ping" | "beacon" => Some(ResourceType::PING),
        "websocket" => Some(ResourceType::WEBSOCKET),
        "webrtc" => Some(ResourceType::WEBRTC),
        "other" => Some(ResourceType::OTHER),
        _ => None,
    }
}

// =============================================================================
// Lines and Patterns
// =============================================================================

fn is_comment_line(line: &str) -> bool {
    line.starts_with('!') || line.starts_with('[') || (line.starts_with('#') && !line.starts_with("##"))
}

fn is_cosmetic_line(line: &str) -> bool {
    ["##", "#@#", "#?#", "#$#", "#@?#"].iter().any(|marker| line.contains(marker))
}

fn parse_hosts_file_domain(line: &str) -> Option<String> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    let second = parts.next()?;

    if first.parse::<IpAddr>().is_ok() {
        return normalize_domain(second).filter(|d| d != "localhost");
    }

    None
}

fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return None;
    }

    Some(trimmed.to_ascii_lowercase())
}

struct ParsedPattern {
    pattern: String,
    anchor_type: AnchorType,
    host: Option<String>,
}

fn parse_pattern(text: &str) -> Option<ParsedPattern> {
    // Regular expression rules are not supported.
    if text.len() > 2 && text.starts_with('/') && text.ends_with('/') {
        return None;
    }
    if text.contains(char::is_whitespace) {
        return None;
    }

    let mut anchor_type = AnchorType::empty();
    let mut rest = text;

    if let Some(r) = rest.strip_prefix("||") {
        anchor_type |= AnchorType::HOST;
        rest = r;
    } else if let Some(r) = rest.strip_prefix('|') {
        anchor_type |= AnchorType::START;
        rest = r;
    }
    if let Some(r) = rest.strip_suffix('|') {
        anchor_type |= AnchorType::END;
        rest = r;
    }

    if anchor_type.is_empty() {
        rest = rest.trim_matches('*');
    }
    if rest.contains('|') {
        return None;
    }

    let host = if anchor_type.contains(AnchorType::HOST) {
        extract_pattern_host(rest)
    } else {
        None
    };

    Some(ParsedPattern {
        pattern: rest.to_string(),
        anchor_type,
        host,
    })
}

/// Leading host of a `||` pattern when it is followed by a separator.
fn extract_pattern_host(pattern: &str) -> Option<String> {
    let end = pattern
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'))
        .unwrap_or(pattern.len());

    match pattern[end..].chars().next() {
        None | Some('^') | Some('/') | Some(':') => normalize_domain(&pattern[..end]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Rule {
        parse_rule_line(line).expect("rule should parse").rule
    }

    #[test]
    fn host_anchored_block() {
        let rule = parse("||ads.example.com^");
        assert_eq!(rule.decision, Decision::Modify);
        assert_eq!(rule.anchor_type, AnchorType::HOST);
        assert_eq!(rule.host.as_deref(), Some("ads.example.com"));
        assert_eq!(rule.pattern, "ads.example.com^");
        assert_eq!(rule.resource_types, ResourceType::ALL);
        assert_eq!(rule.original_rule_text, "||ads.example.com^");
    }

    #[test]
    fn exception_with_options() {
        let rule = parse("@@||cdn.example^$script,image,domain=site.test|~shop.site.test,3p");
        assert_eq!(rule.decision, Decision::Pass);
        assert_eq!(rule.resource_types, ResourceType::SCRIPT | ResourceType::IMAGE);
        assert_eq!(rule.included_domains, vec!["site.test"]);
        assert_eq!(rule.excluded_domains, vec!["shop.site.test"]);
        assert_eq!(rule.party, Party::Third);
    }

    #[test]
    fn important_and_match_case() {
        let rule = parse("/Banner/*.gif$important,match-case");
        assert_eq!(rule.decision, Decision::ModifyImportant);
        assert!(rule.is_case_sensitive);
        assert_eq!(rule.anchor_type, AnchorType::empty());
    }

    #[test]
    fn negated_types_and_party() {
        let rule = parse("||t.example^$~image,~third-party");
        assert!(!rule.resource_types.contains(ResourceType::IMAGE));
        assert!(rule.resource_types.contains(ResourceType::SCRIPT));
        assert_eq!(rule.party, Party::First);

        assert_eq!(parse("x.js$1p,strict3p").party, Party::FirstAndStrictThird);
        assert_eq!(parse("x.js$strict1p").party, Party::StrictFirst);
        assert!(parse_rule_line("x.js$3p,strict1p").is_none());
        assert!(parse_rule_line("x.js$image,~image").is_none());
    }

    #[test]
    fn document_options_depend_on_decision() {
        let pass = parse("@@||site.test^$document");
        assert_eq!(pass.activation_types, ActivationType::WHOLE_DOCUMENT);

        let block = parse("||phish.test^$document");
        assert_eq!(block.resource_types, ResourceType::DOCUMENT);
        assert!(block.activation_types.is_empty());
    }

    #[test]
    fn activation_options() {
        let rule = parse("@@||site.test^$elemhide,generichide,genericblock,attribute-ads");
        assert_eq!(
            rule.activation_types,
            ActivationType::ELEMENT_HIDE
                | ActivationType::GENERIC_HIDE
                | ActivationType::GENERIC_BLOCK
                | ActivationType::ATTRIBUTE_ADS
        );
    }

    #[test]
    fn ad_attribution_options() {
        let trigger = parse("@@||click.adnet.test^$document,ad-query-trigger=gclid|msclkid");
        assert_eq!(trigger.modifier, Modifier::AdQueryTrigger);
        assert_eq!(trigger.modifier_values, vec!["gclid", "msclkid"]);
        assert!(trigger.activation_types.is_empty());
        assert_eq!(trigger.resource_types, ResourceType::DOCUMENT);

        let tracker = parse("@@||tracker.test^$ad-attribution-tracker=Example|abc");
        assert_eq!(tracker.ad_domains_and_query_triggers, vec!["example|abc"]);
        assert!(parse_rule_line("@@||tracker.test^$ad-attribution-tracker=example").is_none());
    }

    #[test]
    fn modifiers() {
        let redirect = parse("||ads.test/x.js$script,redirect=noop.js");
        assert_eq!(redirect.modifier, Modifier::Redirect);
        assert_eq!(redirect.modifier_values, vec!["noop.js"]);

        let full_pass = parse("@@||site.test^$csp");
        assert_eq!(full_pass.modifier, Modifier::Csp);
        assert!(full_pass.modifier_values.is_empty());

        assert!(parse_rule_line("||a.test^$csp").is_none());
        assert!(parse_rule_line("||a.test^$redirect=a,csp=b").is_none());
    }

    #[test]
    fn anchors_and_wildcards() {
        let start = parse("|https://track.");
        assert_eq!(start.anchor_type, AnchorType::START);
        assert_eq!(start.pattern, "https://track.");

        let end = parse(".gif|");
        assert_eq!(end.anchor_type, AnchorType::END);

        assert_eq!(parse("*/ads/*").pattern, "/ads/");
        assert_eq!(parse("||ads*.net/").host, None);
    }

    #[test]
    fn unsupported_lines() {
        assert!(parse_rule_line("/ads[0-9]+/").is_none());
        assert!(parse_rule_line("||a.test^$unknown-option").is_none());
        assert!(parse_rule_line("*").is_none());
    }

    #[test]
    fn hosts_file_lines() {
        let rule = parse("0.0.0.0 tracker.example");
        assert_eq!(rule.host.as_deref(), Some("tracker.example"));
        assert_eq!(rule.anchor_type, AnchorType::HOST);
        assert!(parse_rule_line("127.0.0.1 localhost").is_none());
    }

    #[test]
    fn list_header_and_stats() {
        let text = "[Adblock Plus 2.0]\n! Title: Test List\n! Homepage: https://lists.test/\n! Expires: 4 days (update frequency)\n! Licence: MIT\n! Version: 202401\n\n||ads.test^\nexample.com##.ad\n@@||ok.test^$badfilter\n/re[gx]/\n";
        let list = parse_filter_list(text);

        assert_eq!(list.metadata.title, "Test List");
        assert_eq!(list.metadata.homepage, "https://lists.test/");
        assert_eq!(list.metadata.expires_hours, Some(96));
        assert_eq!(list.metadata.license, "MIT");
        assert_eq!(list.metadata.version, "202401");

        assert_eq!(
            list.stats,
            ParseStats {
                lines: 10,
                rules: 2,
                comments: 6,
                cosmetic: 1,
                unsupported: 1,
            }
        );
        assert!(list.rules[1].is_badfilter);
    }
}
