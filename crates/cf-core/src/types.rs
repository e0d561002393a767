//! Core type definitions for the content filter
//!
//! These types map directly to the rule-source binary format and are
//! shared by the index, the compiler and the engine.

// =============================================================================
// Rule Groups
// =============================================================================

/// Partition of filtering. Every group has its own sources, index and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RuleGroup {
    TrackingRules = 0,
    AdBlockingRules = 1,
}

impl RuleGroup {
    /// All groups, in evaluation order.
    pub const ALL: [RuleGroup; 2] = [RuleGroup::TrackingRules, RuleGroup::AdBlockingRules];

    /// Dense index usable for `[T; 2]` per-group storage.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrackingRules => "tracking",
            Self::AdBlockingRules => "ad-blocking",
        }
    }

    /// Parse the name produced by [`RuleGroup::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tracking" | "tracking-rules" => Some(Self::TrackingRules),
            "ad-blocking" | "adblocking" | "ad-blocking-rules" => Some(Self::AdBlockingRules),
            _ => None,
        }
    }
}

impl TryFrom<u8> for RuleGroup {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TrackingRules),
            1 => Ok(Self::AdBlockingRules),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RuleGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Outcome carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Decision {
    /// Block or otherwise alter the request
    Modify = 0,
    /// Exception (@@...) - allows the request
    Pass = 1,
    /// $important - wins over every exception
    ModifyImportant = 2,
}

impl Default for Decision {
    fn default() -> Self {
        Self::Modify
    }
}

impl Decision {
    /// True for both blocking decisions.
    #[inline]
    pub fn is_modify(self) -> bool {
        matches!(self, Self::Modify | Self::ModifyImportant)
    }
}

impl TryFrom<u8> for Decision {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Modify),
            1 => Ok(Self::Pass),
            2 => Ok(Self::ModifyImportant),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Party
// =============================================================================

/// Relationship a rule requires between the request and the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Party {
    #[default]
    All = 0,
    /// Same registrable domain
    First = 1,
    Third = 2,
    /// Same origin
    StrictFirst = 3,
    StrictThird = 4,
    /// Same registrable domain but a different origin
    FirstAndStrictThird = 5,
}

impl TryFrom<u8> for Party {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::First),
            2 => Ok(Self::Third),
            3 => Ok(Self::StrictFirst),
            4 => Ok(Self::StrictThird),
            5 => Ok(Self::FirstAndStrictThird),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Modifiers
// =============================================================================

/// Extra behavior attached to a rule beyond pass/block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Modifier {
    #[default]
    NoModifier = 0,
    /// $redirect=<resource>
    Redirect = 1,
    /// $csp=<policy>
    Csp = 2,
    /// $ad-query-trigger=<a|b>
    AdQueryTrigger = 3,
}

impl TryFrom<u8> for Modifier {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoModifier),
            1 => Ok(Self::Redirect),
            2 => Ok(Self::Csp),
            3 => Ok(Self::AdQueryTrigger),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Anchors
// =============================================================================

bitflags::bitflags! {
    /// Pattern anchoring.
    #[derive(Default)]
    pub struct AnchorType: u8 {
        /// |pattern
        const START = 1 << 0;
        /// pattern|
        const END = 1 << 1;
        /// ||pattern
        const HOST = 1 << 2;
    }
}

// =============================================================================
// Resource Types
// =============================================================================

bitflags::bitflags! {
    /// Resource type bit mask.
    #[derive(Default)]
    pub struct ResourceType: u32 {
        const STYLESHEET = 1 << 0;
        const IMAGE = 1 << 1;
        const OBJECT = 1 << 2;
        const SCRIPT = 1 << 3;
        const XMLHTTPREQUEST = 1 << 4;
        const SUBDOCUMENT = 1 << 5;  // iframe/frame
        const FONT = 1 << 6;
        const MEDIA = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const WEBRTC = 1 << 9;       // ICE server
        const PING = 1 << 10;
        const OTHER = 1 << 11;
        /// Main document. Only matched by rules that name it explicitly.
        const DOCUMENT = 1 << 12;

        /// Every sub-resource type
        const ALL = (1 << 12) - 1;
    }
}

impl ResourceType {
    /// Parse from a browser resource type string.
    pub fn from_name(s: &str) -> Self {
        match s {
            "main_frame" | "document" => Self::DOCUMENT,
            "sub_frame" | "subdocument" => Self::SUBDOCUMENT,
            "stylesheet" => Self::STYLESHEET,
            "script" => Self::SCRIPT,
            "image" => Self::IMAGE,
            "font" => Self::FONT,
            "object" => Self::OBJECT,
            "xmlhttprequest" | "xhr" => Self::XMLHTTPREQUEST,
            "ping" | "beacon" => Self::PING,
            "media" => Self::MEDIA,
            "websocket" => Self::WEBSOCKET,
            "webrtc" => Self::WEBRTC,
            _ => Self::OTHER,
        }
    }
}

// =============================================================================
// Activation Types
// =============================================================================

bitflags::bitflags! {
    /// Document-level effects of a rule.
    #[derive(Default)]
    pub struct ActivationType: u8 {
        /// $document
        const WHOLE_DOCUMENT = 1 << 0;
        /// $elemhide
        const ELEMENT_HIDE = 1 << 1;
        /// $generichide
        const GENERIC_HIDE = 1 << 2;
        /// $genericblock
        const GENERIC_BLOCK = 1 << 3;
        /// $attribute-ads
        const ATTRIBUTE_ADS = 1 << 4;
    }
}

impl ActivationType {
    /// Number of distinct activation types.
    pub const COUNT: usize = 5;

    /// Each single activation type in a fixed order.
    pub const EACH: [ActivationType; Self::COUNT] = [
        Self::WHOLE_DOCUMENT,
        Self::ELEMENT_HIDE,
        Self::GENERIC_HIDE,
        Self::GENERIC_BLOCK,
        Self::ATTRIBUTE_ADS,
    ];

    /// Position of a single activation type in [`ActivationType::EACH`].
    pub fn slot(self) -> Option<usize> {
        Self::EACH.iter().position(|t| *t == self)
    }

    pub fn name(self) -> &'static str {
        match self {
            t if t == Self::WHOLE_DOCUMENT => "document",
            t if t == Self::ELEMENT_HIDE => "elemhide",
            t if t == Self::GENERIC_HIDE => "generichide",
            t if t == Self::GENERIC_BLOCK => "genericblock",
            t if t == Self::ATTRIBUTE_ADS => "attribute-ads",
            _ => "mixed",
        }
    }
}

// =============================================================================
// Rule
// =============================================================================

/// One compiled request filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Rule {
    pub decision: Decision,
    pub modifier: Modifier,
    /// Redirect resource, CSP policy or ad query triggers, depending on `modifier`.
    pub modifier_values: Vec<String>,
    /// Pattern body with anchors stripped; `*` and `^` kept.
    pub pattern: String,
    pub anchor_type: AnchorType,
    pub is_case_sensitive: bool,
    /// Host part of a `||host^...` pattern, lowercased.
    pub host: Option<String>,
    pub party: Party,
    pub resource_types: ResourceType,
    pub activation_types: ActivationType,
    pub included_domains: Vec<String>,
    pub excluded_domains: Vec<String>,
    /// `domain|trigger` pairs for ad-attribution passes.
    pub ad_domains_and_query_triggers: Vec<String>,
    pub original_rule_text: String,
}

impl Rule {
    /// Rules without included domains apply everywhere.
    #[inline]
    pub fn is_generic(&self) -> bool {
        self.included_domains.is_empty()
    }

    /// Document-level rule.
    #[inline]
    pub fn is_activation(&self) -> bool {
        !self.activation_types.is_empty()
    }
}

// =============================================================================
// Request
// =============================================================================

/// Frame identity supplied by the host.
pub type FrameId = i64;

/// Request being classified.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// Full request URL
    pub url: &'a str,
    /// Origin of the initiating document; `None` for opaque origins
    pub document_origin: Option<&'a str>,
    pub resource_type: ResourceType,
    pub frame: FrameId,
    pub is_user_gesture: bool,
}

impl<'a> Request<'a> {
    pub fn new(url: &'a str, document_origin: Option<&'a str>, resource_type: ResourceType) -> Self {
        Self {
            url,
            document_origin,
            resource_type,
            frame: 0,
            is_user_gesture: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_round_trips_through_u8() {
        for decision in [Decision::Modify, Decision::Pass, Decision::ModifyImportant] {
            assert_eq!(Decision::try_from(decision as u8), Ok(decision));
        }
        assert!(Decision::try_from(7).is_err());
    }

    #[test]
    fn rules_default_to_blocking() {
        assert_eq!(Decision::default(), Decision::Modify);
        assert!(Rule::default().decision.is_modify());
    }

    #[test]
    fn default_resource_mask_excludes_document() {
        assert!(!ResourceType::ALL.contains(ResourceType::DOCUMENT));
        assert!(ResourceType::ALL.contains(ResourceType::WEBRTC));
    }

    #[test]
    fn activation_slots_are_dense() {
        for (i, t) in ActivationType::EACH.iter().enumerate() {
            assert_eq!(t.slot(), Some(i));
        }
        assert_eq!((ActivationType::ELEMENT_HIDE | ActivationType::GENERIC_HIDE).slot(), None);
    }

    #[test]
    fn group_names_parse_back() {
        for group in RuleGroup::ALL {
            assert_eq!(RuleGroup::from_name(group.as_str()), Some(group));
        }
    }
}
