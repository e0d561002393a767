//! Rule source builder
//!
//! Turns parsed filter list text into the binary rule source consumed by
//! the engine.

use cf_core::rule_store::{RuleSource, SourceMetadata};
use cf_core::types::Rule;

use crate::optimizer::{optimize_rules, OptimizeStats};
use crate::parser::{parse_filter_list, ParseStats, ParsedRule};

/// Output of one compilation.
#[derive(Debug, Clone)]
pub struct CompiledSource {
    pub bytes: Vec<u8>,
    pub metadata: SourceMetadata,
    pub parse: ParseStats,
    pub optimize: OptimizeStats,
}

impl CompiledSource {
    pub fn rule_count(&self) -> usize {
        self.optimize.after
    }
}

/// Build a rule source from already optimized rules.
pub fn build_rule_source(metadata: &SourceMetadata, rules: &[ParsedRule]) -> Vec<u8> {
    let rules: Vec<Rule> = rules.iter().map(|parsed| parsed.rule.clone()).collect();
    RuleSource::encode(metadata, &rules)
}

/// Parse, optimize and encode filter list text.
pub fn compile_filter_list(text: &str) -> CompiledSource {
    let mut list = parse_filter_list(text);
    let optimize = optimize_rules(&mut list.rules);
    let bytes = build_rule_source(&list.metadata, &list.rules);

    log::debug!(
        "compiled '{}': {} rules ({} duplicates, {} badfiltered, {} unsupported)",
        list.metadata.title,
        optimize.after,
        optimize.deduped,
        optimize.badfiltered_rules,
        list.stats.unsupported
    );

    CompiledSource {
        bytes,
        metadata: list.metadata,
        parse: list.stats,
        optimize,
    }
}
