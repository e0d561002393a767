//! Ad-click attribution
//!
//! Clicking an ad whose URL matched an `ad-query-trigger` rule records the
//! click domain and the candidate query triggers. The next navigation (or
//! one of its redirects) whose query contains a trigger turns the tab
//! attributed: the landing site's registrable domain is remembered and
//! trackers named by `ad-attribution-tracker` rules for the click domain are
//! let through while the tab stays on that site.
//!
//! Attribution ends 7 days after the click, or on the first main frame
//! commit off the landing site more than 30 minutes after the previous
//! attributed navigation.

use std::time::{Duration, Instant};

use cf_core::psl::{is_subdomain_of, registrable_domain};
use cf_core::url::{extract_host, extract_query, is_http_or_https};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionState {
    Idle,
    /// Query triggers are known, waiting for the landing page.
    Armed,
    Attributed,
}

#[derive(Debug, Clone)]
pub struct AdAttribution {
    expiry: Duration,
    off_site_timeout: Duration,
    click_domain: String,
    click_time: Option<Instant>,
    query_triggers: Vec<String>,
    trigger: String,
    landing_domain: String,
    last_attributed_navigation: Option<Instant>,
    on_landing_site: bool,
}

impl AdAttribution {
    pub fn new(expiry: Duration, off_site_timeout: Duration) -> Self {
        Self {
            expiry,
            off_site_timeout,
            click_domain: String::new(),
            click_time: None,
            query_triggers: Vec::new(),
            trigger: String::new(),
            landing_domain: String::new(),
            last_attributed_navigation: None,
            on_landing_site: false,
        }
    }

    pub fn state(&self) -> AttributionState {
        if !self.landing_domain.is_empty() {
            AttributionState::Attributed
        } else if !self.query_triggers.is_empty() {
            AttributionState::Armed
        } else {
            AttributionState::Idle
        }
    }

    pub fn click_domain(&self) -> &str {
        &self.click_domain
    }

    pub fn click_time(&self) -> Option<Instant> {
        self.click_time
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn landing_domain(&self) -> &str {
        &self.landing_domain
    }

    pub fn is_on_landing_site(&self) -> bool {
        self.on_landing_site
    }

    /// Start over from an ad click. Any earlier attribution is dropped.
    pub fn record_click(&mut self, ad_url: &str, triggers: Vec<String>, now: Instant) {
        self.reset();
        self.click_time = Some(now);
        self.click_domain = extract_host(ad_url).unwrap_or_default().to_ascii_lowercase();
        self.query_triggers = triggers;
    }

    /// Forget pending triggers; a fresh navigation never inherits them.
    pub fn clear_query_triggers(&mut self) {
        self.query_triggers.clear();
    }

    /// Look for a pending trigger in the query of `url`. Returns true when
    /// the tab became attributed.
    pub fn check_query_triggers(&mut self, url: &str, now: Instant) -> bool {
        if !is_http_or_https(url) {
            return false;
        }
        let Some(host) = extract_host(url).filter(|h| !h.is_empty()) else {
            return false;
        };

        // A leading '&' lets triggers written as "&name=" match the first
        // parameter too.
        let query = format!("&{}", extract_query(url).unwrap_or_default());
        let Some(trigger) = self.query_triggers.iter().find(|t| query.contains(t.as_str())) else {
            return false;
        };

        let landing = registrable_domain(host);
        if landing.is_empty() {
            return false;
        }
        self.trigger = trigger.clone();
        self.landing_domain = landing;
        self.last_attributed_navigation = Some(now);
        true
    }

    /// Main frame commit of `url`. Returns true when the observable state
    /// changed.
    pub fn on_main_frame_commit(&mut self, url: &str, now: Instant) -> bool {
        if self.landing_domain.is_empty() {
            return false;
        }

        let domain = extract_host(url).map(registrable_domain).unwrap_or_default();
        if domain == self.landing_domain {
            self.last_attributed_navigation = Some(now);
            return self.set_on_landing_site(true);
        }

        let recent = self
            .last_attributed_navigation
            .is_some_and(|last| last + self.off_site_timeout > now);
        if recent {
            self.last_attributed_navigation = Some(now);
            self.set_on_landing_site(false)
        } else {
            self.reset()
        }
    }

    /// Reset when the attribution window is over.
    pub fn expire_if_due(&mut self, now: Instant) -> bool {
        match self.expires_at() {
            Some(at) if now >= at => self.reset(),
            _ => false,
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        if self.landing_domain.is_empty() {
            return None;
        }
        self.click_time.map(|click| click + self.expiry)
    }

    /// Whether a `domain|trigger` pair of an attribution tracker rule
    /// applies. `domain` must be the click domain or one of its parents.
    pub fn matches(&self, ad_domain_and_query_trigger: &str) -> bool {
        if self.landing_domain.is_empty() || !self.on_landing_site {
            return false;
        }
        let Some((domain, trigger)) = ad_domain_and_query_trigger.split_once('|') else {
            return false;
        };
        if trigger != self.trigger {
            return false;
        }
        !self.click_domain.is_empty() && is_subdomain_of(&self.click_domain, domain)
    }

    /// Attribution handed to a tab opened from this one on `url`, when it
    /// points at the landing site.
    pub fn inherit_for(&self, url: &str, now: Instant) -> Option<AdAttribution> {
        if self.landing_domain.is_empty() {
            return None;
        }
        let domain = extract_host(url).map(registrable_domain)?;
        if domain != self.landing_domain {
            return None;
        }
        Some(AdAttribution {
            query_triggers: Vec::new(),
            on_landing_site: true,
            last_attributed_navigation: Some(now),
            ..self.clone()
        })
    }

    /// Back to idle. Returns true if anything was set.
    pub fn reset(&mut self) -> bool {
        let was_set = !self.landing_domain.is_empty() || self.on_landing_site;
        self.click_time = None;
        self.click_domain.clear();
        self.trigger.clear();
        self.landing_domain.clear();
        self.last_attributed_navigation = None;
        self.on_landing_site = false;
        was_set
    }

    fn set_on_landing_site(&mut self, on_landing_site: bool) -> bool {
        let changed = self.on_landing_site != on_landing_site;
        self.on_landing_site = on_landing_site;
        changed
    }
}
