//! Rules index
//!
//! A [`RulesIndex`] covers every active source of one [`RuleGroup`]. Rules
//! are reachable through three lookup tables: the `||host` hash of the
//! rule, a URL token picked from its pattern, or a fallback list that is
//! scanned for every request. Document-level rules live in their own list
//! and are only consulted by [`RulesIndex::activations_for_frame`].
//!
//! An index is immutable. Rebuilding produces a new value that the owner
//! swaps in whole.

mod format;
mod matcher;

pub use format::INDEX_FORMAT_VERSION;
pub use matcher::PartyMatcher;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::hash::{buffer_checksum, hash_domain};
use crate::layout::FormatError;
use crate::priority::compare_rules;
use crate::psl::get_parent_domain;
use crate::rule_store::RuleSource;
use crate::types::{ActivationType, AnchorType, Decision, Request, Rule, RuleGroup};
use crate::url::{extract_host, tokenize_url, Origin};

use format::{Bucket, EntryRecord, SourceRecord};
use matcher::{domains_match, select_token, CompiledPattern};

/// Errors loading a persisted index.
pub type IndexError = FormatError;

/// A source as seen by the index: the manager's id and the loaded rules.
#[derive(Debug, Clone)]
pub struct IndexedSource {
    pub id: u32,
    pub source: Arc<RuleSource>,
}

impl IndexedSource {
    pub fn new(id: u32, source: Arc<RuleSource>) -> Self {
        Self { id, source }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Reference to one rule of one source, with provenance.
#[derive(Clone)]
pub struct RuleRef {
    source_id: u32,
    rule_index: u32,
    source: Arc<RuleSource>,
}

impl RuleRef {
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn rule_index(&self) -> u32 {
        self.rule_index
    }

    pub fn rule(&self) -> &Rule {
        &self.source.rules()[self.rule_index as usize]
    }

    pub fn source_title(&self) -> &str {
        &self.source.metadata().title
    }
}

impl fmt::Debug for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRef")
            .field("source_id", &self.source_id)
            .field("rule_index", &self.rule_index)
            .field("text", &self.rule().original_rule_text)
            .finish()
    }
}

impl PartialEq for RuleRef {
    fn eq(&self, other: &Self) -> bool {
        self.source_id == other.source_id && self.rule_index == other.rule_index
    }
}

/// Outcome of [`RulesIndex::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    /// Winning rule; `None` for the implicit pass.
    pub rule: Option<RuleRef>,
}

impl Verdict {
    /// Nothing matched.
    pub fn implicit_pass() -> Self {
        Self {
            decision: Decision::Pass,
            rule: None,
        }
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.decision.is_modify()
    }
}

/// Per-request knobs supplied by the caller.
#[derive(Default)]
pub struct MatchOptions<'a> {
    /// Ignore blocking rules without `domain=`; set by a `genericblock` pass.
    pub disable_generic_rules: bool,
    /// Called with `(url, "domain|trigger")` for ad-attribution passes.
    /// Without it those rules never match.
    pub ad_attribution: Option<&'a mut dyn FnMut(&str, &str) -> bool>,
}

/// Result for one activation type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationResult {
    pub rule: Option<RuleRef>,
    /// The rule was inherited from an ancestor frame.
    pub from_parent: bool,
}

impl ActivationResult {
    pub fn decision(&self) -> Option<Decision> {
        self.rule.as_ref().map(|r| r.rule().decision)
    }

    pub fn is_pass(&self) -> bool {
        self.decision() == Some(Decision::Pass)
    }
}

/// Activation results of a frame, one slot per [`ActivationType`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationResults {
    by_type: [ActivationResult; ActivationType::COUNT],
}

impl ActivationResults {
    /// `activation_type` must be a single flag; mixed sets return an empty result.
    pub fn get(&self, activation_type: ActivationType) -> &ActivationResult {
        static EMPTY: ActivationResult = ActivationResult {
            rule: None,
            from_parent: false,
        };
        activation_type.slot().map_or(&EMPTY, |slot| &self.by_type[slot])
    }

    pub fn is_pass(&self, activation_type: ActivationType) -> bool {
        self.get(activation_type).is_pass()
    }

    /// Whole-document exemption.
    pub fn is_document_exempt(&self) -> bool {
        self.is_pass(ActivationType::WHOLE_DOCUMENT)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActivationType, &ActivationResult)> {
        ActivationType::EACH.iter().copied().zip(self.by_type.iter())
    }
}

// =============================================================================
// Index
// =============================================================================

struct Entry {
    source: u32,
    rule: u32,
    bucket: Bucket,
    pattern: CompiledPattern,
}

/// Lookup structures over the sources of one rule group.
pub struct RulesIndex {
    group: RuleGroup,
    sources: Vec<IndexedSource>,
    entries: Vec<Entry>,
    by_host: HashMap<u64, Vec<u32>>,
    by_token: HashMap<u32, Vec<u32>>,
    fallback: Vec<u32>,
    activations: Vec<u32>,
    checksum: String,
}

impl fmt::Debug for RulesIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RulesIndex")
            .field("group", &self.group)
            .field("sources", &self.sources.len())
            .field("rules", &self.entries.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl RulesIndex {
    /// Index every rule of `sources`. Source order is the tie-break order.
    pub fn build(group: RuleGroup, sources: Vec<IndexedSource>) -> Self {
        let mut records = Vec::new();
        for (position, indexed) in sources.iter().enumerate() {
            for (rule_index, rule) in indexed.source.rules().iter().enumerate() {
                records.push(EntryRecord {
                    source: position as u32,
                    rule: rule_index as u32,
                    bucket: choose_bucket(rule),
                });
            }
        }

        let index = Self::assemble(group, sources, &records);
        log::debug!(
            "built {} index: {} rules from {} sources, {} host keys, {} token keys, {} fallback",
            group,
            index.entries.len(),
            index.sources.len(),
            index.by_host.len(),
            index.by_token.len(),
            index.fallback.len()
        );
        index
    }

    /// Reload a persisted index. `sources` must be the same sources, in the
    /// same order, with the same checksums as when it was built.
    pub fn load(data: &[u8], group: RuleGroup, sources: Vec<IndexedSource>) -> Result<Self, IndexError> {
        let (stored_group, stored_sources, records) = format::decode(data)?;
        if stored_group != group {
            return Err(FormatError::InvalidSection(format!(
                "index belongs to {stored_group}, expected {group}"
            )));
        }

        if stored_sources.len() != sources.len() {
            let missing = stored_sources
                .iter()
                .find(|s| !sources.iter().any(|c| c.id == s.id))
                .map_or(0, |s| s.id);
            return Err(FormatError::SourceMismatch {
                source_id: missing,
                stored: format!("{} sources", stored_sources.len()),
                current: format!("{} sources", sources.len()),
            });
        }
        for (stored, current) in stored_sources.iter().zip(&sources) {
            if stored.id != current.id || stored.checksum != current.source.checksum() {
                return Err(FormatError::SourceMismatch {
                    source_id: current.id,
                    stored: stored.checksum.clone(),
                    current: current.source.checksum().to_string(),
                });
            }
        }

        for (index, record) in records.iter().enumerate() {
            let exists = sources
                .get(record.source as usize)
                .is_some_and(|s| (record.rule as usize) < s.source.len());
            if !exists {
                return Err(FormatError::InvalidRecord {
                    index,
                    reason: "rule reference out of range".to_string(),
                });
            }
        }

        Ok(Self::assemble(group, sources, &records))
    }

    fn assemble(group: RuleGroup, sources: Vec<IndexedSource>, records: &[EntryRecord]) -> Self {
        let mut index = Self {
            group,
            sources,
            entries: Vec::with_capacity(records.len()),
            by_host: HashMap::new(),
            by_token: HashMap::new(),
            fallback: Vec::new(),
            activations: Vec::new(),
            checksum: String::new(),
        };

        for record in records {
            let rule = &index.sources[record.source as usize].source.rules()[record.rule as usize];
            let id = index.entries.len() as u32;
            match record.bucket {
                Bucket::Fallback => index.fallback.push(id),
                Bucket::Host(key) => index.by_host.entry(key).or_default().push(id),
                Bucket::Token(key) => index.by_token.entry(key).or_default().push(id),
                Bucket::Activation => index.activations.push(id),
            }
            index.entries.push(Entry {
                source: record.source,
                rule: record.rule,
                bucket: record.bucket,
                pattern: CompiledPattern::compile(rule),
            });
        }

        index.checksum = buffer_checksum(&index.serialize());
        index
    }

    /// Persistable form, independent of the rule sources' own bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let sources: Vec<SourceRecord> = self
            .sources
            .iter()
            .map(|s| SourceRecord {
                id: s.id,
                checksum: s.source.checksum().to_string(),
            })
            .collect();
        let records: Vec<EntryRecord> = self
            .entries
            .iter()
            .map(|e| EntryRecord {
                source: e.source,
                rule: e.rule,
                bucket: e.bucket,
            })
            .collect();
        format::encode(self.group, &sources, &records)
    }

    /// Identity of this index; changes whenever any source changes.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn group(&self) -> RuleGroup {
        self.group
    }

    pub fn sources(&self) -> &[IndexedSource] {
        &self.sources
    }

    /// Number of indexed rules, activations included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn rule_of(&self, entry: &Entry) -> &Rule {
        &self.sources[entry.source as usize].source.rules()[entry.rule as usize]
    }

    fn rule_ref(&self, entry: &Entry) -> RuleRef {
        let indexed = &self.sources[entry.source as usize];
        RuleRef {
            source_id: indexed.id,
            rule_index: entry.rule,
            source: Arc::clone(&indexed.source),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Decision for a request with default options.
    pub fn evaluate(&self, request: &Request<'_>) -> Verdict {
        self.evaluate_with(request, MatchOptions::default())
    }

    /// Highest priority matching rule, or the implicit pass.
    pub fn evaluate_with(&self, request: &Request<'_>, mut options: MatchOptions<'_>) -> Verdict {
        let party = PartyMatcher::new(request.url, request.document_origin);
        let document_host = request.document_origin.and_then(Origin::parse).map(|o| o.host);

        let mut best: Option<&Entry> = None;
        for id in self.candidates(request.url) {
            let entry = &self.entries[id as usize];
            let rule = self.rule_of(entry);

            if !rule.resource_types.intersects(request.resource_type) {
                continue;
            }
            if options.disable_generic_rules && rule.is_generic() && rule.decision.is_modify() {
                continue;
            }
            if !party.matches(rule.party) || !domains_match(rule, document_host.as_deref()) {
                continue;
            }
            if !entry.pattern.matches(request.url) {
                continue;
            }
            if !rule.ad_domains_and_query_triggers.is_empty() {
                let Some(check) = options.ad_attribution.as_mut() else {
                    continue;
                };
                if !rule
                    .ad_domains_and_query_triggers
                    .iter()
                    .any(|pair| check(request.url, pair))
                {
                    continue;
                }
            }

            let wins = best.map_or(true, |b| compare_rules(rule, self.rule_of(b)) == Ordering::Greater);
            if wins {
                best = Some(entry);
            }
        }

        match best {
            Some(entry) => Verdict {
                decision: self.rule_of(entry).decision,
                rule: Some(self.rule_ref(entry)),
            },
            None => Verdict::implicit_pass(),
        }
    }

    /// Entry ids worth checking for `url`, ascending and deduplicated.
    fn candidates(&self, url: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self.fallback.clone();

        if let Some(host) = extract_host(url) {
            let mut current = Some(host);
            while let Some(suffix) = current {
                if let Some(list) = self.by_host.get(&hash_domain(suffix).to_u64()) {
                    ids.extend_from_slice(list);
                }
                current = get_parent_domain(suffix);
            }
        }

        if !self.by_token.is_empty() {
            for token in tokenize_url(url) {
                if let Some(list) = self.by_token.get(&token) {
                    ids.extend_from_slice(list);
                }
            }
        }

        ids.sort_unstable();
        ids.dedup();
        ids
    }

    // =========================================================================
    // Activations
    // =========================================================================

    /// Document-level results for a frame showing `frame_url`.
    ///
    /// `document_origin` is the origin of the embedding document (the
    /// frame's own origin for a main frame). Types without a rule of their
    /// own inherit a pass from `parent`.
    pub fn activations_for_frame(
        &self,
        frame_url: &str,
        document_origin: Option<&str>,
        parent: Option<&ActivationResults>,
    ) -> ActivationResults {
        let party = PartyMatcher::new(frame_url, document_origin);
        let document_host = document_origin.and_then(Origin::parse).map(|o| o.host);

        let mut best: [Option<&Entry>; ActivationType::COUNT] = Default::default();
        for &id in &self.activations {
            let entry = &self.entries[id as usize];
            let rule = self.rule_of(entry);

            if !party.matches(rule.party)
                || !domains_match(rule, document_host.as_deref())
                || !entry.pattern.matches(frame_url)
            {
                continue;
            }

            for (slot, activation_type) in ActivationType::EACH.iter().enumerate() {
                if !rule.activation_types.contains(*activation_type) {
                    continue;
                }
                let wins = best[slot].map_or(true, |b| compare_rules(rule, self.rule_of(b)) == Ordering::Greater);
                if wins {
                    best[slot] = Some(entry);
                }
            }
        }

        let mut results = ActivationResults::default();
        for (slot, found) in best.iter().enumerate() {
            results.by_type[slot] = match found {
                Some(entry) => ActivationResult {
                    rule: Some(self.rule_ref(entry)),
                    from_parent: false,
                },
                None => match parent.map(|p| &p.by_type[slot]) {
                    Some(inherited) if inherited.is_pass() => ActivationResult {
                        rule: inherited.rule.clone(),
                        from_parent: true,
                    },
                    _ => ActivationResult::default(),
                },
            };
        }
        results
    }
}

/// Lookup table for a rule.
fn choose_bucket(rule: &Rule) -> Bucket {
    if rule.is_activation() {
        return Bucket::Activation;
    }
    if rule.anchor_type.contains(AnchorType::HOST) {
        if let Some(host) = &rule.host {
            return Bucket::Host(hash_domain(host).to_u64());
        }
    }
    match select_token(rule) {
        Some(token) => Bucket::Token(token),
        None => Bucket::Fallback,
    }
}
