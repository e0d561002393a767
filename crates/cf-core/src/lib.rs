//! Content filter core library
//!
//! This crate provides the rule model and the matching engine shared by the
//! compiler, the engine and the command line tools.
//!
//! # Architecture
//!
//! Filter lists are compiled into rule sources (`CFRS` containers). A rules
//! index is built over all active sources of one rule group and answers two
//! questions: which decision applies to a request, and which document-level
//! activations apply to a frame. Indices can be persisted (`CFIX`
//! containers) and are only reused while every source checksum still
//! matches.
//!
//! # Modules
//!
//! - `types`: rule groups, decisions, rules and requests
//! - `priority`: total order used to resolve conflicting matches
//! - `hash`: Murmur3 and CRC32
//! - `psl`: registrable domain extraction
//! - `url`: allocation-free URL helpers
//! - `layout`: shared binary container layout
//! - `rule_store`: compiled rule sources
//! - `index`: rules index, matching and activations

pub mod hash;
pub mod index;
pub mod layout;
pub mod priority;
pub mod psl;
pub mod rule_store;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use index::{
    ActivationResult, ActivationResults, IndexError, IndexedSource, MatchOptions, PartyMatcher, RuleRef, RulesIndex,
    Verdict, INDEX_FORMAT_VERSION,
};
pub use layout::FormatError;
pub use priority::{compare_rules, rule_priority, Priority};
pub use psl::registrable_domain;
pub use rule_store::{RuleSource, SourceMetadata, StoreError, RULES_FORMAT_VERSION};
pub use types::{
    ActivationType, AnchorType, Decision, FrameId, Modifier, Party, Request, ResourceType, Rule, RuleGroup,
};
