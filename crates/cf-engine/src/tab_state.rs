//! Per-tab blocking state
//!
//! A tab keeps two copies of what it reports: the committed copy describes
//! the document on screen, the pending copy collects data for the main
//! frame navigation in progress. A commit replaces the committed copy; a
//! navigation that never commits throws the pending copy away.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use cf_core::{ActivationResults, ActivationType, Decision, FrameId, RuleGroup, RuleRef};

use crate::attribution::AdAttribution;
use crate::config::TimingConfig;

/// Host-supplied tab identity.
pub type TabId = u64;

/// The rule behind a block or an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleData {
    pub source_id: u32,
    pub decision: Decision,
    pub rule_text: String,
}

impl From<&RuleRef> for RuleData {
    fn from(rule: &RuleRef) -> Self {
        Self {
            source_id: rule.source_id(),
            decision: rule.rule().decision,
            rule_text: rule.rule().original_rule_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedTrackerInfo {
    pub blocked_count: usize,
    pub blocked_urls: BTreeMap<String, usize>,
}

/// Blocked requests of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabBlockedUrls {
    pub total_count: usize,
    /// Requests not attributed to a known tracker.
    pub blocked_urls: BTreeMap<String, usize>,
    /// Requests grouped by known tracker domain.
    pub blocked_trackers: BTreeMap<String, BlockedTrackerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabActivationState {
    pub from_parent: bool,
    pub rule: Option<RuleData>,
}

/// Main frame activations as reported for a tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabActivations {
    pub document_exception: bool,
    by_type: [TabActivationState; ActivationType::COUNT],
}

impl TabActivations {
    pub fn get(&self, activation_type: ActivationType) -> Option<&TabActivationState> {
        activation_type.slot().map(|slot| &self.by_type[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActivationType, &TabActivationState)> {
        ActivationType::EACH.iter().copied().zip(self.by_type.iter())
    }
}

impl From<&ActivationResults> for TabActivations {
    fn from(results: &ActivationResults) -> Self {
        let mut activations = TabActivations {
            document_exception: results.is_document_exempt(),
            ..TabActivations::default()
        };
        for (slot, (_, result)) in results.iter().enumerate() {
            activations.by_type[slot] = TabActivationState {
                from_parent: result.from_parent,
                rule: result.rule.as_ref().map(RuleData::from),
            };
        }
        activations
    }
}

/// What started a main frame navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationCause {
    /// Browser UI or a link followed with a user gesture.
    User,
    /// Script or redirect without a user gesture. Treated as a hop of the
    /// navigation already in progress.
    Automatic,
}

/// Everything that is replaced on commit.
#[derive(Debug, Clone, Default)]
struct DocumentState {
    blocked: [TabBlockedUrls; 2],
    activations: [TabActivations; 2],
    attribution_enabled: bool,
    allowed_attribution_trackers: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct TabState {
    has_ongoing_navigation: bool,
    committed: DocumentState,
    pending: DocumentState,
    did_set_activations: [bool; 2],
    blocked_frames: [HashMap<FrameId, RuleData>; 2],
    frame_activations: HashMap<FrameId, [Option<ActivationResults>; 2]>,
    attribution: AdAttribution,
}

impl TabState {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            has_ongoing_navigation: false,
            committed: DocumentState::default(),
            pending: DocumentState::default(),
            did_set_activations: [false; 2],
            blocked_frames: Default::default(),
            frame_activations: HashMap::new(),
            attribution: AdAttribution::new(timing.attribution_expiry(), timing.off_site_timeout()),
        }
    }

    /// State for a tab opened from this one on `url`. Attribution carries
    /// over when `url` is on the landing site.
    pub fn open_from(&self, url: &str, timing: &TimingConfig, now: Instant) -> (Self, bool) {
        let mut tab = Self::new(timing);
        tab.committed.attribution_enabled = self.committed.attribution_enabled;
        match self.attribution.inherit_for(url, now) {
            Some(attribution) => {
                tab.attribution = attribution;
                (tab, true)
            }
            None => (tab, false),
        }
    }

    pub fn has_ongoing_navigation(&self) -> bool {
        self.has_ongoing_navigation
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Returns true when attribution state changed.
    pub fn start_navigation(&mut self, url: &str, cause: NavigationCause, now: Instant) -> bool {
        self.has_ongoing_navigation = true;
        if cause == NavigationCause::Automatic {
            return self.attribution.check_query_triggers(url, now);
        }

        self.pending = DocumentState::default();
        self.did_set_activations = [false; 2];
        self.attribution.clear_query_triggers();
        false
    }

    pub fn redirect_navigation(&mut self, url: &str, now: Instant) -> bool {
        self.attribution.check_query_triggers(url, now)
    }

    /// Groups whose activations were not logged during this navigation.
    pub fn missing_activations(&self) -> impl Iterator<Item = RuleGroup> + '_ {
        RuleGroup::ALL
            .into_iter()
            .filter(|group| !self.did_set_activations[group.index()])
    }

    /// End of a main frame navigation. Returns true when attribution state
    /// changed.
    pub fn finish_navigation(&mut self, url: &str, committed: bool, now: Instant) -> bool {
        self.has_ongoing_navigation = false;
        if !committed {
            self.pending = DocumentState::default();
            return false;
        }

        let changed = self.attribution.on_main_frame_commit(url, now);
        self.committed = std::mem::take(&mut self.pending);
        self.did_set_activations = [false; 2];
        self.drop_trackers_without_attribution();
        changed
    }

    /// Reset attribution if its window is over.
    pub fn expire_attribution(&mut self, now: Instant) -> bool {
        let changed = self.attribution.expire_if_due(now);
        self.drop_trackers_without_attribution();
        changed
    }

    // =========================================================================
    // Blocking
    // =========================================================================

    pub fn on_url_blocked(&mut self, group: RuleGroup, url: &str) {
        let blocked = &mut self.current_mut().blocked[group.index()];
        blocked.total_count += 1;
        *blocked.blocked_urls.entry(url.to_string()).or_default() += 1;
    }

    pub fn on_tracker_blocked(&mut self, group: RuleGroup, domain: &str, url: &str) {
        let blocked = &mut self.current_mut().blocked[group.index()];
        blocked.total_count += 1;
        let tracker = blocked.blocked_trackers.entry(domain.to_string()).or_default();
        tracker.blocked_count += 1;
        *tracker.blocked_urls.entry(url.to_string()).or_default() += 1;
    }

    pub fn blocked_urls(&self, group: RuleGroup) -> &TabBlockedUrls {
        &self.committed.blocked[group.index()]
    }

    pub fn set_frame_block_state(&mut self, group: RuleGroup, frame: FrameId, rule: RuleData) {
        self.blocked_frames[group.index()].insert(frame, rule);
    }

    pub fn reset_frame_block_state(&mut self, group: RuleGroup, frame: FrameId) {
        self.blocked_frames[group.index()].remove(&frame);
    }

    /// Rule that blocked the document of `frame`, per group.
    pub fn was_frame_blocked(&self, frame: FrameId) -> [Option<&RuleData>; 2] {
        [
            self.blocked_frames[0].get(&frame),
            self.blocked_frames[1].get(&frame),
        ]
    }

    pub fn frame_deleted(&mut self, frame: FrameId) {
        for frames in &mut self.blocked_frames {
            frames.remove(&frame);
        }
        self.frame_activations.remove(&frame);
    }

    // =========================================================================
    // Activations
    // =========================================================================

    pub fn set_frame_activations(&mut self, group: RuleGroup, frame: FrameId, results: ActivationResults) {
        self.frame_activations.entry(frame).or_default()[group.index()] = Some(results);
    }

    pub fn frame_activations(&self, group: RuleGroup, frame: FrameId) -> Option<&ActivationResults> {
        self.frame_activations.get(&frame)?[group.index()].as_ref()
    }

    /// Main frame activations for the navigation in progress. Outside of a
    /// navigation (preloads and the like) they are ignored.
    pub fn log_activations(&mut self, group: RuleGroup, activations: TabActivations) {
        if self.has_ongoing_navigation {
            self.did_set_activations[group.index()] = true;
            self.pending.activations[group.index()] = activations;
        }
    }

    pub fn activations(&self, group: RuleGroup) -> &TabActivations {
        &self.committed.activations[group.index()]
    }

    // =========================================================================
    // Attribution
    // =========================================================================

    /// An `attribute-ads` pass on the incoming document lets the next ad
    /// click be attributed.
    pub fn arm_ad_attribution(&mut self) {
        if self.has_ongoing_navigation {
            self.pending.attribution_enabled = true;
        }
    }

    pub fn is_ad_attribution_enabled(&self) -> bool {
        self.committed.attribution_enabled
    }

    /// An ad-query-trigger rule matched the navigation to `ad_url`.
    pub fn set_ad_query_triggers(&mut self, ad_url: &str, triggers: Vec<String>, now: Instant) {
        if !self.committed.attribution_enabled || !self.has_ongoing_navigation {
            return;
        }
        self.attribution.record_click(ad_url, triggers, now);
        self.allowed_trackers_clear();
        // Only the first matching trigger rule counts.
        self.committed.attribution_enabled = false;
    }

    pub fn does_ad_attribution_match(&mut self, tracker_url: &str, ad_domain_and_query_trigger: &str) -> bool {
        if !self.attribution.matches(ad_domain_and_query_trigger) {
            return false;
        }
        self.current_mut()
            .allowed_attribution_trackers
            .insert(tracker_url.to_string());
        true
    }

    pub fn allowed_attribution_trackers(&self) -> &BTreeSet<String> {
        &self.committed.allowed_attribution_trackers
    }

    pub fn attribution(&self) -> &AdAttribution {
        &self.attribution
    }

    pub fn is_on_ad_landing_site(&self) -> bool {
        self.attribution.is_on_landing_site()
    }

    pub fn current_ad_landing_domain(&self) -> &str {
        self.attribution.landing_domain()
    }

    // =========================================================================

    fn current_mut(&mut self) -> &mut DocumentState {
        if self.has_ongoing_navigation {
            &mut self.pending
        } else {
            &mut self.committed
        }
    }

    fn allowed_trackers_clear(&mut self) {
        self.committed.allowed_attribution_trackers.clear();
        self.pending.allowed_attribution_trackers.clear();
    }

    fn drop_trackers_without_attribution(&mut self) {
        if self.attribution.landing_domain().is_empty() {
            self.allowed_trackers_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tab() -> TabState {
        TabState::new(&TimingConfig::default())
    }

    #[test]
    fn blocks_outside_navigation_go_to_committed_state() {
        let mut tab = tab();
        tab.on_url_blocked(RuleGroup::AdBlockingRules, "https://ads.test/a.js");
        tab.on_url_blocked(RuleGroup::AdBlockingRules, "https://ads.test/a.js");

        let blocked = tab.blocked_urls(RuleGroup::AdBlockingRules);
        assert_eq!(blocked.total_count, 2);
        assert_eq!(blocked.blocked_urls["https://ads.test/a.js"], 2);
        assert_eq!(tab.blocked_urls(RuleGroup::TrackingRules).total_count, 0);
    }

    #[test]
    fn committed_navigation_replaces_reported_state() {
        let now = Instant::now();
        let mut tab = tab();
        tab.on_url_blocked(RuleGroup::TrackingRules, "https://old.test/t.js");

        tab.start_navigation("https://site.test/", NavigationCause::User, now);
        tab.on_tracker_blocked(RuleGroup::TrackingRules, "tracker.test", "https://cdn.tracker.test/p.gif");
        assert_eq!(tab.blocked_urls(RuleGroup::TrackingRules).total_count, 1);

        tab.finish_navigation("https://site.test/", true, now);
        let blocked = tab.blocked_urls(RuleGroup::TrackingRules);
        assert_eq!(blocked.total_count, 1);
        assert!(blocked.blocked_urls.is_empty());
        assert_eq!(blocked.blocked_trackers["tracker.test"].blocked_count, 1);
    }

    #[test]
    fn failed_navigation_is_discarded() {
        let now = Instant::now();
        let mut tab = tab();
        tab.on_url_blocked(RuleGroup::AdBlockingRules, "https://ads.test/shown.js");

        tab.start_navigation("https://site.test/", NavigationCause::User, now);
        tab.on_url_blocked(RuleGroup::AdBlockingRules, "https://ads.test/never.js");
        tab.finish_navigation("https://site.test/", false, now);

        let blocked = tab.blocked_urls(RuleGroup::AdBlockingRules);
        assert_eq!(blocked.total_count, 1);
        assert!(blocked.blocked_urls.contains_key("https://ads.test/shown.js"));
        assert!(!blocked.blocked_urls.contains_key("https://ads.test/never.js"));
        assert!(!tab.has_ongoing_navigation());
    }

    #[test]
    fn activations_only_logged_during_navigation() {
        let now = Instant::now();
        let mut tab = tab();
        let exempt = TabActivations {
            document_exception: true,
            ..TabActivations::default()
        };

        tab.log_activations(RuleGroup::AdBlockingRules, exempt.clone());
        assert!(!tab.activations(RuleGroup::AdBlockingRules).document_exception);

        tab.start_navigation("https://site.test/", NavigationCause::User, now);
        tab.log_activations(RuleGroup::AdBlockingRules, exempt);
        assert_eq!(tab.missing_activations().collect::<Vec<_>>(), vec![RuleGroup::TrackingRules]);
        tab.finish_navigation("https://site.test/", true, now);

        assert!(tab.activations(RuleGroup::AdBlockingRules).document_exception);
        assert!(!tab.activations(RuleGroup::TrackingRules).document_exception);
    }

    #[test]
    fn frame_blocks_are_tracked_per_group() {
        let mut tab = tab();
        let rule = RuleData {
            source_id: 4,
            decision: Decision::Modify,
            rule_text: "||phish.test^$document".into(),
        };
        tab.set_frame_block_state(RuleGroup::AdBlockingRules, 1, rule.clone());

        assert_eq!(tab.was_frame_blocked(1), [None, Some(&rule)]);
        tab.reset_frame_block_state(RuleGroup::AdBlockingRules, 1);
        assert_eq!(tab.was_frame_blocked(1), [None, None]);

        tab.set_frame_block_state(RuleGroup::TrackingRules, 2, rule);
        tab.frame_deleted(2);
        assert_eq!(tab.was_frame_blocked(2), [None, None]);
    }

    /// Ad shown on page N, clicked, landing on page N+1.
    fn click_through(tab: &mut TabState, ad_url: &str, now: Instant) {
        tab.start_navigation("https://news.test/", NavigationCause::User, now);
        tab.arm_ad_attribution();
        tab.finish_navigation("https://news.test/", true, now);
        assert!(tab.is_ad_attribution_enabled());

        tab.start_navigation(ad_url, NavigationCause::User, now);
        tab.set_ad_query_triggers(ad_url, vec!["abc".into()], now);
        assert!(tab.redirect_navigation("https://x.example/?promo=abc", now));
        tab.finish_navigation("https://x.example/?promo=abc", true, now);
    }

    #[test]
    fn ad_click_attributes_landing_site() {
        let now = Instant::now();
        let mut tab = tab();
        click_through(&mut tab, "https://sub.example/click", now);

        assert!(tab.is_on_ad_landing_site());
        assert_eq!(tab.current_ad_landing_domain(), "x.example");
        assert!(tab.does_ad_attribution_match("https://pixel.test/p", "example|abc"));
        assert!(!tab.does_ad_attribution_match("https://pixel.test/q", "other.com|abc"));
        assert!(tab.allowed_attribution_trackers().contains("https://pixel.test/p"));
        assert_eq!(tab.allowed_attribution_trackers().len(), 1);
    }

    #[test]
    fn click_domain_must_match_tracker_domain() {
        let now = Instant::now();
        let mut tab = tab();
        click_through(&mut tab, "https://other.com/click", now);
        assert!(tab.is_on_ad_landing_site());
        assert!(!tab.does_ad_attribution_match("https://pixel.test/p", "example|abc"));
    }

    #[test]
    fn triggers_need_an_armed_document() {
        let now = Instant::now();
        let mut tab = tab();
        tab.start_navigation("https://sub.example/click", NavigationCause::User, now);
        tab.set_ad_query_triggers("https://sub.example/click", vec!["abc".into()], now);
        tab.redirect_navigation("https://x.example/?promo=abc", now);
        tab.finish_navigation("https://x.example/?promo=abc", true, now);

        assert_eq!(tab.attribution().click_domain(), "");
        assert_eq!(tab.current_ad_landing_domain(), "");
    }

    #[test]
    fn arming_outside_navigation_is_ignored() {
        let now = Instant::now();
        let mut tab = tab();
        tab.arm_ad_attribution();
        tab.start_navigation("https://a.test/", NavigationCause::User, now);
        tab.finish_navigation("https://a.test/", true, now);
        assert!(!tab.is_ad_attribution_enabled());
    }

    #[test]
    fn expiry_clears_allowed_trackers() {
        let now = Instant::now();
        let mut tab = tab();
        click_through(&mut tab, "https://sub.example/click", now);
        tab.does_ad_attribution_match("https://pixel.test/p", "example|abc");

        assert!(tab.expire_attribution(now + Duration::from_secs(8 * 24 * 3600)));
        assert!(tab.allowed_attribution_trackers().is_empty());
        assert!(!tab.is_on_ad_landing_site());
    }

    #[test]
    fn opened_tabs_inherit_attribution() {
        let now = Instant::now();
        let mut tab = tab();
        click_through(&mut tab, "https://sub.example/click", now);

        let (opened, inherited) = tab.open_from("https://x.example/item", &TimingConfig::default(), now);
        assert!(inherited);
        assert!(opened.is_on_ad_landing_site());

        let (other, inherited) = tab.open_from("https://elsewhere.test/", &TimingConfig::default(), now);
        assert!(!inherited);
        assert!(!other.is_on_ad_landing_site());
    }
}
