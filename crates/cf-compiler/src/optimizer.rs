use std::collections::HashSet;

use cf_core::types::Rule;

use crate::parser::ParsedRule;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub before: usize,
    pub after: usize,
    pub deduped: usize,
    pub badfilter_rules: usize,
    pub badfiltered_rules: usize,
}

/// Drop `$badfilter` rules together with the rules they cancel, then drop
/// duplicates. The first occurrence of a rule keeps its position.
pub fn optimize_rules(rules: &mut Vec<ParsedRule>) -> OptimizeStats {
    let before = rules.len();

    let badfilter_keys: HashSet<Rule> = rules
        .iter()
        .filter(|parsed| parsed.is_badfilter)
        .map(|parsed| rule_key(&parsed.rule))
        .collect();
    let badfilter_rules = rules.iter().filter(|parsed| parsed.is_badfilter).count();

    let mut badfiltered_rules = 0usize;
    rules.retain(|parsed| {
        if parsed.is_badfilter {
            return false;
        }
        if !badfilter_keys.is_empty() && badfilter_keys.contains(&rule_key(&parsed.rule)) {
            badfiltered_rules += 1;
            return false;
        }
        true
    });

    let mut seen: HashSet<Rule> = HashSet::new();
    let mut deduped = 0usize;
    rules.retain(|parsed| {
        if seen.insert(rule_key(&parsed.rule)) {
            true
        } else {
            deduped += 1;
            false
        }
    });

    OptimizeStats {
        before,
        after: rules.len(),
        deduped,
        badfilter_rules,
        badfiltered_rules,
    }
}

/// Everything that affects matching; the source text does not.
fn rule_key(rule: &Rule) -> Rule {
    Rule {
        original_rule_text: String::new(),
        ..rule.clone()
    }
}
