//! Content filter facade
//!
//! [`ContentFilter`] ties the rule manager, per-tab state, notification
//! coalescing and the stats store together. It is driven by the host from a
//! single thread: requests, navigation events and a periodic [`tick`]
//! carrying the current time.
//!
//! [`tick`]: ContentFilter::tick

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use cf_core::psl::walk_host_suffixes;
use cf_core::url::{extract_host, is_http_or_https, Origin};
use cf_core::{
    ActivationResults, ActivationType, Decision, FrameId, MatchOptions, Modifier, Request, ResourceType, RuleGroup,
    RulesIndex, Verdict,
};
use tokio::runtime::Handle;

use crate::config::{ExceptionsList, SourceConfig, SourceSettings, TimingConfig};
use crate::error::EngineError;
use crate::manager::RuleManager;
use crate::stats::StatsStore;
use crate::subscribers::{SubscriberRegistry, SubscriptionId};
use crate::tab_state::{NavigationCause, RuleData, TabActivations, TabBlockedUrls, TabId, TabState};
use crate::throttle::{NotificationBurst, NotificationThrottle};

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEvent {
    NewBlockedUrls { group: RuleGroup, tabs: Vec<TabId> },
    NewAttributionTrackerAllowed { tabs: Vec<TabId> },
    AllowAttributionChanged { tab: TabId },
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Allow,
    Block { group: RuleGroup, rule: Option<RuleData> },
}

impl RequestOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Request classification.
pub trait RequestEvaluator {
    fn on_before_request(&mut self, tab: TabId, request: &Request<'_>, now: Instant) -> RequestOutcome;

    /// Whether a page may use the given ICE servers. `parent_origin` is the
    /// origin of the embedding document for subframes.
    fn is_webrtc_blocked(&self, document_url: &str, parent_origin: Option<&str>, ice_servers: &[&str]) -> bool;
}

/// Source and exception configuration.
pub trait SourceManagement {
    fn add_source(&mut self, group: RuleGroup, source: SourceConfig) -> Result<(), EngineError>;
    fn remove_source(&mut self, group: RuleGroup, id: u32) -> Result<SourceConfig, EngineError>;
    fn set_source_enabled(&mut self, group: RuleGroup, id: u32, enabled: bool) -> Result<(), EngineError>;
    fn set_group_enabled(&mut self, group: RuleGroup, enabled: bool) -> Result<(), EngineError>;
    fn set_source_settings(&mut self, group: RuleGroup, id: u32, settings: SourceSettings) -> Result<(), EngineError>;
    fn reset_preset_sources(&mut self, group: RuleGroup) -> Result<(), EngineError>;
    fn set_exception_list(
        &mut self,
        group: RuleGroup,
        list: ExceptionsList,
        domains: Vec<String>,
    ) -> Result<(), EngineError>;
    fn is_exempt_of_filtering(&self, group: RuleGroup, origin: &str) -> bool;
}

/// Read access to per-tab reports.
pub trait TabStateAccess {
    fn tab_state(&self, tab: TabId) -> Option<&TabState>;

    fn blocked_urls(&self, tab: TabId, group: RuleGroup) -> Option<&TabBlockedUrls> {
        self.tab_state(tab).map(|state| state.blocked_urls(group))
    }

    fn tab_activations(&self, tab: TabId, group: RuleGroup) -> Option<&TabActivations> {
        self.tab_state(tab).map(|state| state.activations(group))
    }

    fn was_frame_blocked(&self, tab: TabId, frame: FrameId) -> [Option<&RuleData>; 2] {
        self.tab_state(tab).map_or([None, None], |state| state.was_frame_blocked(frame))
    }

    fn is_document_blocked(&self, tab: TabId, frame: FrameId) -> bool {
        self.was_frame_blocked(tab, frame).iter().any(Option::is_some)
    }
}

// =============================================================================
// Filter
// =============================================================================

pub struct ContentFilter {
    manager: RuleManager,
    tabs: HashMap<TabId, TabState>,
    throttle: NotificationThrottle<TabId>,
    known_trackers: [HashSet<String>; 2],
    stats: Option<StatsStore>,
    events: SubscriberRegistry<FilterEvent>,
}

impl ContentFilter {
    pub fn new(manager: RuleManager, stats: Option<StatsStore>) -> Self {
        let window = manager.config().timing.notification_window();
        Self {
            manager,
            tabs: HashMap::new(),
            throttle: NotificationThrottle::new(window),
            known_trackers: Default::default(),
            stats,
            events: SubscriberRegistry::new(),
        }
    }

    /// Load the config at `path`, open the stats database in its data
    /// directory and start building indices.
    pub fn open(path: impl Into<PathBuf>, runtime: Handle) -> Result<Self, EngineError> {
        let mut manager = RuleManager::open(path, runtime)?;
        let stats = match manager.config().stats_path() {
            Some(path) => Some(StatsStore::open(path)?),
            None => None,
        };
        manager.start();
        Ok(Self::new(manager, stats))
    }

    pub fn manager(&self) -> &RuleManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut RuleManager {
        &mut self.manager
    }

    pub fn stats(&self) -> Option<&StatsStore> {
        self.stats.as_ref()
    }

    pub fn events(&self) -> &SubscriberRegistry<FilterEvent> {
        &self.events
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FilterEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Fold the legacy counters named in the config into the stats store.
    pub async fn migrate_legacy_stats(&self) -> Result<bool, EngineError> {
        let (Some(stats), Some(path)) = (&self.stats, &self.manager.config().legacy_stats) else {
            return Ok(false);
        };
        Ok(stats.migrate_legacy(path).await?)
    }

    /// Domains that blocked requests are grouped under in tab reports.
    pub fn set_known_trackers<I, S>(&mut self, group: RuleGroup, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_trackers[group.index()] = domains
            .into_iter()
            .map(|d| d.into().to_ascii_lowercase())
            .collect();
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Main frame navigation started.
    pub fn did_start_navigation(&mut self, tab: TabId, url: &str, cause: NavigationCause, now: Instant) {
        let timing = self.timing();
        if tab_entry(&mut self.tabs, &timing, tab).start_navigation(url, cause, now) {
            self.attribution_changed(tab);
        }
    }

    pub fn did_redirect_navigation(&mut self, tab: TabId, url: &str, now: Instant) {
        let timing = self.timing();
        if tab_entry(&mut self.tabs, &timing, tab).redirect_navigation(url, now) {
            self.attribution_changed(tab);
        }
    }

    /// A frame committed a document. `parent` is `None` for the main frame;
    /// subframes pass the parent frame and its origin.
    pub fn did_commit_frame(
        &mut self,
        tab: TabId,
        frame: FrameId,
        url: &str,
        parent: Option<FrameId>,
        parent_origin: Option<&str>,
    ) {
        let own_origin = Origin::parse(url).map(|o| o.serialize());
        let document_origin = match parent {
            Some(_) => parent_origin.map(str::to_string),
            None => own_origin,
        };

        let timing = self.timing();
        let state = tab_entry(&mut self.tabs, &timing, tab);
        for group in RuleGroup::ALL {
            let Some(index) = self.manager.index(group) else {
                continue;
            };
            if !is_origin_wanted(&self.manager, group, document_origin.as_deref()) {
                continue;
            }
            let inherited = parent.and_then(|p| state.frame_activations(group, p)).cloned();
            let results = index.activations_for_frame(url, document_origin.as_deref(), inherited.as_ref());
            if parent.is_none() {
                report_tab_activations(state, group, &results);
            }
            state.set_frame_activations(group, frame, results);
        }
    }

    /// Main frame navigation ended, committed or not.
    pub fn did_finish_navigation(&mut self, tab: TabId, url: &str, committed: bool, now: Instant) {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return;
        };

        if committed {
            let origin = Origin::parse(url).map(|o| o.serialize());
            let missing: Vec<RuleGroup> = state.missing_activations().collect();
            for group in missing {
                let Some(index) = self.manager.index(group) else {
                    continue;
                };
                if is_origin_wanted(&self.manager, group, origin.as_deref()) {
                    let results = index.activations_for_frame(url, origin.as_deref(), None);
                    report_tab_activations(state, group, &results);
                }
            }
        }

        if state.finish_navigation(url, committed, now) {
            self.attribution_changed(tab);
        }
    }

    /// `new_tab` was opened from `source` on `url`.
    pub fn did_open_requested_url(&mut self, source: TabId, new_tab: TabId, url: &str, now: Instant) {
        let timing = self.timing();
        let (state, inherited) = match self.tabs.get(&source) {
            Some(opener) => opener.open_from(url, &timing, now),
            None => (TabState::new(&timing), false),
        };
        self.tabs.insert(new_tab, state);
        if inherited {
            self.attribution_changed(new_tab);
        }
    }

    pub fn frame_deleted(&mut self, tab: TabId, frame: FrameId) {
        if let Some(state) = self.tabs.get_mut(&tab) {
            state.frame_deleted(frame);
        }
    }

    pub fn tab_closed(&mut self, tab: TabId) {
        self.tabs.remove(&tab);
        self.throttle.forget(&tab);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Expire attributions and deliver a due notification burst.
    pub fn tick(&mut self, now: Instant) -> Option<NotificationBurst<TabId>> {
        let expired: Vec<TabId> = self
            .tabs
            .iter_mut()
            .filter_map(|(id, state)| state.expire_attribution(now).then_some(*id))
            .collect();
        for tab in expired {
            self.attribution_changed(tab);
        }
        self.poll_notifications(now)
    }

    pub fn poll_notifications(&mut self, now: Instant) -> Option<NotificationBurst<TabId>> {
        let burst = self.throttle.poll(now)?;
        for group in RuleGroup::ALL {
            let tabs = burst.blocked_in(group);
            if !tabs.is_empty() {
                self.events.emit(&FilterEvent::NewBlockedUrls {
                    group,
                    tabs: tabs.iter().copied().collect(),
                });
            }
        }
        if !burst.new_attribution_trackers.is_empty() {
            self.events.emit(&FilterEvent::NewAttributionTrackerAllowed {
                tabs: burst.new_attribution_trackers.iter().copied().collect(),
            });
        }
        Some(burst)
    }

    /// Earliest time [`ContentFilter::tick`] has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let expiries = self.tabs.values().filter_map(|state| state.attribution().expires_at());
        self.throttle.deadline().into_iter().chain(expiries).min()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn evaluate_document(
        &mut self,
        tab: TabId,
        group: RuleGroup,
        index: &RulesIndex,
        request: &Request<'_>,
        now: Instant,
    ) -> Option<Verdict> {
        let allow_blocking = self.manager.config().settings.allow_blocking_documents;
        let timing = self.timing();
        let state = tab_entry(&mut self.tabs, &timing, tab);

        let verdict = index.evaluate(request);
        if let Some(rule) = &verdict.rule {
            let matched = rule.rule();
            if matched.decision == Decision::Pass && matched.modifier == Modifier::AdQueryTrigger {
                state.set_ad_query_triggers(request.url, matched.modifier_values.clone(), now);
            }
        }

        match &verdict.rule {
            Some(rule) if verdict.is_blocked() && allow_blocking => {
                state.set_frame_block_state(group, request.frame, RuleData::from(rule));
                Some(verdict)
            }
            _ => {
                state.reset_frame_block_state(group, request.frame);
                None
            }
        }
    }

    fn evaluate_subresource(
        &mut self,
        tab: TabId,
        group: RuleGroup,
        index: &RulesIndex,
        request: &Request<'_>,
        now: Instant,
    ) -> Option<Verdict> {
        let timing = self.timing();
        let state = tab_entry(&mut self.tabs, &timing, tab);

        let (exempt, generic_block) = state
            .frame_activations(group, request.frame)
            .map_or((false, false), |activations| {
                (
                    activations.is_document_exempt(),
                    activations.is_pass(ActivationType::GENERIC_BLOCK),
                )
            });
        if exempt {
            return None;
        }

        let mut tracker_allowed = false;
        let mut check_attribution = |url: &str, pair: &str| {
            let matched = state.does_ad_attribution_match(url, pair);
            tracker_allowed |= matched;
            matched
        };
        let verdict = index.evaluate_with(
            request,
            MatchOptions {
                disable_generic_rules: generic_block,
                ad_attribution: Some(&mut check_attribution),
            },
        );

        if tracker_allowed {
            self.throttle.note_attribution_tracker(tab, now);
        }
        verdict.is_blocked().then_some(verdict)
    }

    fn record_block(&mut self, tab: TabId, group: RuleGroup, request: &Request<'_>, now: Instant) {
        let timing = self.timing();
        let state = tab_entry(&mut self.tabs, &timing, tab);

        let host = extract_host(request.url).unwrap_or("").to_ascii_lowercase();
        let trackers = &self.known_trackers[group.index()];
        match walk_host_suffixes(&host).find(|suffix| trackers.contains(*suffix)) {
            Some(tracker) => state.on_tracker_blocked(group, tracker, request.url),
            None => state.on_url_blocked(group, request.url),
        }

        if !self.manager.config().off_the_record {
            if let Some(stats) = &self.stats {
                let origin_host = request
                    .document_origin
                    .and_then(Origin::parse)
                    .map(|o| o.host)
                    .unwrap_or_default();
                stats.add_entry(request.url, &origin_host, SystemTime::now(), group);
            }
        }

        self.throttle.note_blocked(group, tab, now);
    }

    fn attribution_changed(&self, tab: TabId) {
        self.events.emit(&FilterEvent::AllowAttributionChanged { tab });
    }

    fn timing(&self) -> TimingConfig {
        self.manager.config().timing
    }
}

impl RequestEvaluator for ContentFilter {
    fn on_before_request(&mut self, tab: TabId, request: &Request<'_>, now: Instant) -> RequestOutcome {
        for group in RuleGroup::ALL {
            if !self.manager.is_group_enabled(group)
                || !is_origin_wanted(&self.manager, group, request.document_origin)
            {
                continue;
            }

            if request.resource_type == ResourceType::PING
                && group == RuleGroup::AdBlockingRules
                && self.manager.config().settings.block_pings
            {
                self.record_block(tab, group, request, now);
                return RequestOutcome::Block { group, rule: None };
            }

            let Some(index) = self.manager.index(group) else {
                continue;
            };
            let blocked = if request.resource_type.contains(ResourceType::DOCUMENT) {
                self.evaluate_document(tab, group, &index, request, now)
            } else {
                self.evaluate_subresource(tab, group, &index, request, now)
            };

            if let Some(verdict) = blocked {
                self.record_block(tab, group, request, now);
                log::debug!("{} blocked {} for tab {}", group, request.url, tab);
                return RequestOutcome::Block {
                    group,
                    rule: verdict.rule.as_ref().map(RuleData::from),
                };
            }
        }
        RequestOutcome::Allow
    }

    fn is_webrtc_blocked(&self, document_url: &str, parent_origin: Option<&str>, ice_servers: &[&str]) -> bool {
        if ice_servers.is_empty() || !is_http_or_https(document_url) {
            return false;
        }
        let Some(document_origin) = parent_origin
            .map(str::to_string)
            .or_else(|| Origin::parse(document_url).map(|o| o.serialize()))
        else {
            return false;
        };

        for group in RuleGroup::ALL {
            let Some(index) = self.manager.index(group) else {
                continue;
            };
            if !is_origin_wanted(&self.manager, group, Some(&document_origin)) {
                continue;
            }

            let activations = index.activations_for_frame(document_url, Some(&document_origin), None);
            if activations.is_document_exempt() {
                continue;
            }
            let generic_block = activations.is_pass(ActivationType::GENERIC_BLOCK);

            let blocked = ice_servers.iter().any(|server| {
                let url = ice_server_url(server);
                let request = Request::new(&url, Some(&document_origin), ResourceType::WEBRTC);
                index
                    .evaluate_with(
                        &request,
                        MatchOptions {
                            disable_generic_rules: generic_block,
                            ad_attribution: None,
                        },
                    )
                    .is_blocked()
            });
            if blocked {
                return true;
            }
        }
        false
    }
}

impl SourceManagement for ContentFilter {
    fn add_source(&mut self, group: RuleGroup, source: SourceConfig) -> Result<(), EngineError> {
        self.manager.add_source(group, source)
    }

    fn remove_source(&mut self, group: RuleGroup, id: u32) -> Result<SourceConfig, EngineError> {
        self.manager.remove_source(group, id)
    }

    fn set_source_enabled(&mut self, group: RuleGroup, id: u32, enabled: bool) -> Result<(), EngineError> {
        self.manager.set_source_enabled(group, id, enabled)
    }

    fn set_group_enabled(&mut self, group: RuleGroup, enabled: bool) -> Result<(), EngineError> {
        self.manager.set_group_enabled(group, enabled)
    }

    fn set_source_settings(&mut self, group: RuleGroup, id: u32, settings: SourceSettings) -> Result<(), EngineError> {
        self.manager.set_source_settings(group, id, settings)
    }

    fn reset_preset_sources(&mut self, group: RuleGroup) -> Result<(), EngineError> {
        self.manager.reset_preset_sources(group)
    }

    fn set_exception_list(
        &mut self,
        group: RuleGroup,
        list: ExceptionsList,
        domains: Vec<String>,
    ) -> Result<(), EngineError> {
        self.manager.set_exception_list(group, list, domains)
    }

    fn is_exempt_of_filtering(&self, group: RuleGroup, origin: &str) -> bool {
        self.manager.is_exempt_of_filtering(group, origin)
    }
}

impl TabStateAccess for ContentFilter {
    fn tab_state(&self, tab: TabId) -> Option<&TabState> {
        self.tabs.get(&tab)
    }
}

fn tab_entry<'a>(tabs: &'a mut HashMap<TabId, TabState>, timing: &TimingConfig, tab: TabId) -> &'a mut TabState {
    tabs.entry(tab).or_insert_with(|| TabState::new(timing))
}

/// Extension origins and exempt sites are not filtered.
fn is_origin_wanted(manager: &RuleManager, group: RuleGroup, origin: Option<&str>) -> bool {
    match origin {
        Some(origin) if origin.starts_with("chrome-extension://") => false,
        Some(origin) => !manager.is_exempt_of_filtering(group, origin),
        None => true,
    }
}

/// `stun:host:port` has no authority; give it one so host rules apply.
fn ice_server_url(server: &str) -> Cow<'_, str> {
    match server.split_once(':') {
        Some((scheme, rest)) if !rest.starts_with("//") => Cow::Owned(format!("{scheme}://{rest}")),
        _ => Cow::Borrowed(server),
    }
}

fn report_tab_activations(state: &mut TabState, group: RuleGroup, results: &ActivationResults) {
    if results.is_pass(ActivationType::ATTRIBUTE_ADS) {
        state.arm_ad_attribution();
    }
    state.log_activations(group, TabActivations::from(results));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const MAIN: FrameId = 1;

    const ADS: &str = "! Title: Test ads
||ads.example^
/banner/*
||sponsor.test^$domain=news.test
||pixel.test^
@@||pixel.test^$ad-attribution-tracker=example|abc
@@||news.test^$attribute-ads
@@||sub.example^$document,ad-query-trigger=abc
@@||trusted.test^$document
@@||portal.test^$genericblock
||phish.test^$document
||stun.tracker.test^$webrtc
";

    async fn filter_with(configure: impl FnOnce(&mut EngineConfig)) -> (tempfile::TempDir, ContentFilter) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ads.txt"), ADS).unwrap();

        let mut config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let settings = SourceSettings {
            allow_attribution_tracker_rules: true,
        };
        config.ad_blocking.sources = vec![SourceConfig::new(1, "ads.txt").with_settings(settings)];
        configure(&mut config);

        let stats = StatsStore::open(config.stats_path().unwrap()).unwrap();
        let mut manager = RuleManager::new(config, Handle::current());
        manager.start();
        for group in RuleGroup::ALL {
            manager.wait_for_rebuild(group).await;
        }
        (dir, ContentFilter::new(manager, Some(stats)))
    }

    fn request<'a>(url: &'a str, origin: &'a str, resource_type: ResourceType) -> Request<'a> {
        Request {
            frame: MAIN,
            ..Request::new(url, Some(origin), resource_type)
        }
    }

    fn navigate(filter: &mut ContentFilter, tab: TabId, url: &str, now: Instant) {
        filter.did_start_navigation(tab, url, NavigationCause::User, now);
        let document = Request {
            frame: MAIN,
            ..Request::new(url, None, ResourceType::DOCUMENT)
        };
        filter.on_before_request(tab, &document, now);
        filter.did_commit_frame(tab, MAIN, url, None, None);
        filter.did_finish_navigation(tab, url, true, now);
    }

    fn record_events(filter: &ContentFilter) -> Arc<Mutex<Vec<FilterEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        filter.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn blocked_requests_are_logged_on_the_tab() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        navigate(&mut filter, 1, "https://site.org/", now);

        let outcome = filter.on_before_request(1, &request("https://ads.example/a.js", "https://site.org", ResourceType::SCRIPT), now);
        let RequestOutcome::Block { group, rule } = outcome else {
            panic!("expected a block, got {outcome:?}");
        };
        assert_eq!(group, RuleGroup::AdBlockingRules);
        assert_eq!(rule.unwrap().rule_text, "||ads.example^");

        let allowed = filter.on_before_request(1, &request("https://cdn.site.org/app.js", "https://site.org", ResourceType::SCRIPT), now);
        assert_eq!(allowed, RequestOutcome::Allow);

        let blocked = filter.blocked_urls(1, RuleGroup::AdBlockingRules).unwrap();
        assert_eq!(blocked.total_count, 1);
        assert_eq!(blocked.blocked_urls["https://ads.example/a.js"], 1);
    }

    #[tokio::test]
    async fn known_trackers_group_blocked_urls() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        filter.set_known_trackers(RuleGroup::AdBlockingRules, ["ads.example"]);
        let now = Instant::now();
        navigate(&mut filter, 1, "https://site.org/", now);

        filter.on_before_request(1, &request("https://cdn.ads.example/1.js", "https://site.org", ResourceType::SCRIPT), now);
        filter.on_before_request(1, &request("https://ads.example/2.js", "https://site.org", ResourceType::SCRIPT), now);

        let blocked = filter.blocked_urls(1, RuleGroup::AdBlockingRules).unwrap();
        assert_eq!(blocked.total_count, 2);
        assert!(blocked.blocked_urls.is_empty());
        assert_eq!(blocked.blocked_trackers["ads.example"].blocked_count, 2);
    }

    #[tokio::test]
    async fn exempt_sites_are_not_filtered() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        filter
            .set_exception_list(RuleGroup::AdBlockingRules, ExceptionsList::ExemptList, vec!["site.org".into()])
            .unwrap();
        let now = Instant::now();

        let outcome = filter.on_before_request(1, &request("https://ads.example/a.js", "https://www.site.org", ResourceType::SCRIPT), now);
        assert_eq!(outcome, RequestOutcome::Allow);
        let extension = filter.on_before_request(1, &request("https://ads.example/a.js", "chrome-extension://abc", ResourceType::SCRIPT), now);
        assert_eq!(extension, RequestOutcome::Allow);
    }

    #[tokio::test]
    async fn document_exemption_covers_the_frame_and_its_children() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        navigate(&mut filter, 1, "https://trusted.test/", now);
        filter.did_commit_frame(1, 2, "https://embed.other/", Some(MAIN), Some("https://trusted.test"));

        let in_main = request("https://ads.example/a.js", "https://trusted.test", ResourceType::SCRIPT);
        assert_eq!(filter.on_before_request(1, &in_main, now), RequestOutcome::Allow);
        let in_child = Request { frame: 2, ..request("https://ads.example/a.js", "https://embed.other", ResourceType::SCRIPT) };
        assert_eq!(filter.on_before_request(1, &in_child, now), RequestOutcome::Allow);
        let elsewhere = Request { frame: 3, ..in_main };
        assert!(filter.on_before_request(1, &elsewhere, now).is_blocked());

        let activations = filter.tab_activations(1, RuleGroup::AdBlockingRules).unwrap();
        assert!(activations.document_exception);
    }

    #[tokio::test]
    async fn genericblock_skips_generic_rules_only() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        navigate(&mut filter, 1, "https://portal.test/", now);

        let generic = request("https://cdn.other/banner/1.png", "https://portal.test", ResourceType::IMAGE);
        assert_eq!(filter.on_before_request(1, &generic, now), RequestOutcome::Allow);

        navigate(&mut filter, 2, "https://news.test/", now);
        let specific = request("https://sponsor.test/s.js", "https://news.test", ResourceType::SCRIPT);
        assert!(filter.on_before_request(2, &specific, now).is_blocked());
        let generic = request("https://cdn.other/banner/1.png", "https://news.test", ResourceType::IMAGE);
        assert!(filter.on_before_request(2, &generic, now).is_blocked());
    }

    #[tokio::test]
    async fn failed_navigation_leaves_committed_state_alone() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        navigate(&mut filter, 1, "https://site.org/", now);
        filter.on_before_request(1, &request("https://ads.example/shown.js", "https://site.org", ResourceType::SCRIPT), now);

        filter.did_start_navigation(1, "https://broken.test/", NavigationCause::User, now);
        filter.on_before_request(1, &request("https://ads.example/lost.js", "https://broken.test", ResourceType::SCRIPT), now);
        filter.did_finish_navigation(1, "https://broken.test/", false, now);

        let blocked = filter.blocked_urls(1, RuleGroup::AdBlockingRules).unwrap();
        assert_eq!(blocked.total_count, 1);
        assert!(blocked.blocked_urls.contains_key("https://ads.example/shown.js"));
        assert!(!blocked.blocked_urls.contains_key("https://ads.example/lost.js"));
    }

    #[tokio::test]
    async fn notifications_are_coalesced_per_window() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let events = record_events(&filter);
        let start = Instant::now();

        for i in 0..5u64 {
            let now = start + Duration::from_millis(i * 50);
            let url = format!("https://ads.example/{i}.js");
            filter.on_before_request(1, &request(&url, "https://site.org", ResourceType::SCRIPT), now);
            assert!(filter.tick(now).is_none());
        }
        assert_eq!(filter.next_wakeup(), Some(start + Duration::from_secs(1)));
        assert!(filter.tick(start + Duration::from_secs(1)).is_some());
        assert_eq!(
            *events.lock().unwrap(),
            vec![FilterEvent::NewBlockedUrls { group: RuleGroup::AdBlockingRules, tabs: vec![1] }]
        );

        for i in 0..3u32 {
            let now = start + Duration::from_secs(2) + Duration::from_millis(1_500) * i;
            filter.on_before_request(2, &request("https://ads.example/x.js", "https://site.org", ResourceType::SCRIPT), now);
            assert!(filter.tick(now + Duration::from_secs(1)).is_some());
        }
        assert_eq!(events.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn ad_click_allows_attribution_tracker_on_landing_site() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let events = record_events(&filter);
        let now = Instant::now();

        navigate(&mut filter, 1, "https://news.test/", now);
        assert!(filter.tab_state(1).unwrap().is_ad_attribution_enabled());

        navigate(&mut filter, 2, "https://x.example/", now);

        filter.did_start_navigation(1, "https://sub.example/click?id=7", NavigationCause::User, now);
        let click = Request { frame: MAIN, ..Request::new("https://sub.example/click?id=7", None, ResourceType::DOCUMENT) };
        assert_eq!(filter.on_before_request(1, &click, now), RequestOutcome::Allow);
        filter.did_redirect_navigation(1, "https://x.example/?promo=abc", now);
        filter.did_commit_frame(1, MAIN, "https://x.example/?promo=abc", None, None);
        filter.did_finish_navigation(1, "https://x.example/?promo=abc", true, now);

        let state = filter.tab_state(1).unwrap();
        assert!(state.is_on_ad_landing_site());
        assert_eq!(state.current_ad_landing_domain(), "x.example");

        let pixel = request("https://pixel.test/p.gif", "https://x.example", ResourceType::IMAGE);
        assert_eq!(filter.on_before_request(1, &pixel, now), RequestOutcome::Allow);
        assert!(filter.on_before_request(2, &pixel, now).is_blocked());
        assert!(filter
            .tab_state(1)
            .unwrap()
            .allowed_attribution_trackers()
            .contains("https://pixel.test/p.gif"));

        filter.tick(now + Duration::from_secs(1));
        let events = events.lock().unwrap();
        assert!(events.contains(&FilterEvent::AllowAttributionChanged { tab: 1 }));
        assert!(events.contains(&FilterEvent::NewAttributionTrackerAllowed { tabs: vec![1] }));
        assert!(events.contains(&FilterEvent::NewBlockedUrls { group: RuleGroup::AdBlockingRules, tabs: vec![2] }));
    }

    #[tokio::test]
    async fn opened_tab_keeps_attribution_on_landing_site() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        navigate(&mut filter, 1, "https://news.test/", now);
        filter.did_start_navigation(1, "https://sub.example/click", NavigationCause::User, now);
        let click = Request { frame: MAIN, ..Request::new("https://sub.example/click", None, ResourceType::DOCUMENT) };
        filter.on_before_request(1, &click, now);
        filter.did_redirect_navigation(1, "https://x.example/?abc", now);
        filter.did_commit_frame(1, MAIN, "https://x.example/?abc", None, None);
        filter.did_finish_navigation(1, "https://x.example/?abc", true, now);

        filter.did_open_requested_url(1, 5, "https://shop.x.example/cart", now);
        assert!(filter.tab_state(5).unwrap().is_on_ad_landing_site());

        filter.tab_closed(1);
        assert!(filter.tab_state(1).is_none());
    }

    #[tokio::test]
    async fn documents_are_blocked_only_when_allowed() {
        let (_dir, mut filter) = filter_with(|_| {}).await;
        let now = Instant::now();
        let phish = Request { frame: MAIN, ..Request::new("https://phish.test/login", None, ResourceType::DOCUMENT) };

        assert_eq!(filter.on_before_request(1, &phish, now), RequestOutcome::Allow);
        assert!(!filter.is_document_blocked(1, MAIN));

        let (_dir, mut filter) = filter_with(|config| config.settings.allow_blocking_documents = true).await;
        assert!(filter.on_before_request(1, &phish, now).is_blocked());
        assert!(filter.is_document_blocked(1, MAIN));
        let [tracking, ads] = filter.was_frame_blocked(1, MAIN);
        assert!(tracking.is_none());
        assert_eq!(ads.unwrap().rule_text, "||phish.test^$document");
    }

    #[tokio::test]
    async fn pings_are_blocked_when_enabled() {
        let ping = request("https://collector.test/ping", "https://site.org", ResourceType::PING);
        let now = Instant::now();

        let (_dir, mut filter) = filter_with(|_| {}).await;
        assert_eq!(filter.on_before_request(1, &ping, now), RequestOutcome::Allow);

        let (_dir, mut filter) = filter_with(|config| config.settings.block_pings = true).await;
        assert_eq!(
            filter.on_before_request(1, &ping, now),
            RequestOutcome::Block { group: RuleGroup::AdBlockingRules, rule: None }
        );
    }

    #[tokio::test]
    async fn webrtc_ice_servers_are_checked() {
        let (_dir, filter) = filter_with(|_| {}).await;
        let servers = ["stun:stun.tracker.test:3478", "stun:stun.l.example:19302"];

        assert!(filter.is_webrtc_blocked("https://site.org/call", None, &servers));
        assert!(!filter.is_webrtc_blocked("https://site.org/call", None, &servers[1..]));
        assert!(!filter.is_webrtc_blocked("https://trusted.test/", None, &servers));
        assert!(!filter.is_webrtc_blocked("file:///tmp/page.html", None, &servers));
        assert!(!filter.is_webrtc_blocked("https://site.org/call", None, &[]));
    }

    #[test]
    fn ice_servers_get_an_authority() {
        assert_eq!(ice_server_url("stun:stun.example:3478"), "stun://stun.example:3478");
        assert_eq!(ice_server_url("turn://relay.example"), "turn://relay.example");
    }

    async fn total_blocked(filter: &ContentFilter) -> i64 {
        let stats = filter.stats().unwrap();
        let now = SystemTime::now();
        let report = stats.get_stats(now - Duration::from_secs(60), now + Duration::from_secs(60)).await;
        report.total_ads_blocked() + report.total_trackers_blocked()
    }

    #[tokio::test]
    async fn stats_are_recorded_unless_off_the_record() {
        let ad = request("https://ads.example/a.js", "https://site.org", ResourceType::SCRIPT);
        let now = Instant::now();

        let (_dir, mut filter) = filter_with(|_| {}).await;
        filter.on_before_request(1, &ad, now);
        filter.on_before_request(1, &ad, now);
        assert_eq!(total_blocked(&filter).await, 2);
        let report = filter
            .stats()
            .unwrap()
            .get_stats(SystemTime::UNIX_EPOCH, SystemTime::now() + Duration::from_secs(60))
            .await;
        assert_eq!(report.websites[0].host, "site.org");

        let (_dir, mut filter) = filter_with(|config| config.off_the_record = true).await;
        assert!(filter.on_before_request(1, &ad, now).is_blocked());
        assert_eq!(total_blocked(&filter).await, 0);
        assert_eq!(filter.blocked_urls(1, RuleGroup::AdBlockingRules).unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn open_reads_config_and_migrates_legacy_stats() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.json");
        std::fs::write(&legacy, r#"{"blocked_domains_counters": [{"trk.net": 3}, {}]}"#).unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            legacy_stats: Some(legacy.clone()),
            ..EngineConfig::default()
        };
        let config_path = dir.path().join("filter.json");
        config.save(&config_path).unwrap();

        let filter = ContentFilter::open(&config_path, Handle::current()).unwrap();
        assert!(filter.migrate_legacy_stats().await.unwrap());
        assert!(!Path::new(&legacy).exists());

        let report = filter
            .stats()
            .unwrap()
            .get_stats(SystemTime::UNIX_EPOCH, SystemTime::now() + Duration::from_secs(60))
            .await;
        assert_eq!(report.total_trackers_blocked(), 3);
    }
}
