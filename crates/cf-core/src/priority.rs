//! Rule priority model
//!
//! When several rules match the same request the one with the highest
//! [`Priority`] wins. Equal priorities fall back to pattern specificity:
//! the longer pattern wins, equal lengths compare lexicographically and the
//! smaller string wins.

use std::cmp::Ordering;

use crate::types::{Decision, Modifier, Rule};

/// Derived rule priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Modify = 0,
    Pass = 1,
    PassAdAttribution = 2,
    /// Pass with a modifier but no modifier value (e.g. `@@$csp`)
    PassAll = 3,
    ModifyImportant = 4,
}

impl Priority {
    pub const MAX: Priority = Priority::ModifyImportant;
}

/// Pass rule that cancels every value of its modifier.
#[inline]
pub fn is_full_modifier_pass_rule(rule: &Rule) -> bool {
    rule.decision == Decision::Pass
        && rule.modifier != Modifier::NoModifier
        && rule.modifier_values.is_empty()
}

pub fn rule_priority(rule: &Rule) -> Priority {
    match rule.decision {
        Decision::Modify => Priority::Modify,
        Decision::ModifyImportant => Priority::ModifyImportant,
        Decision::Pass => {
            if !rule.ad_domains_and_query_triggers.is_empty() {
                Priority::PassAdAttribution
            } else if is_full_modifier_pass_rule(rule) {
                Priority::PassAll
            } else {
                Priority::Pass
            }
        }
    }
}

/// Size-first string comparison. `Greater` means `lhs` is the more specific.
pub fn size_prioritized_compare(lhs: &str, rhs: &str) -> Ordering {
    match lhs.len().cmp(&rhs.len()) {
        Ordering::Equal => rhs.cmp(lhs),
        other => other,
    }
}

/// Total order over rules. `Greater` means `lhs` outranks `rhs`.
pub fn compare_rules(lhs: &Rule, rhs: &Rule) -> Ordering {
    rule_priority(lhs)
        .cmp(&rule_priority(rhs))
        .then_with(|| size_prioritized_compare(&lhs.pattern, &rhs.pattern))
}
