//! Notification coalescing
//!
//! Blocked-request and attribution notifications are batched per window.
//! The first event of a quiet period arms a deadline one window later; every
//! event until then joins the same burst. Time is passed in by the caller,
//! which polls [`NotificationThrottle::poll`] at or after
//! [`NotificationThrottle::deadline`].

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use cf_core::RuleGroup;

/// One batch of notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationBurst<K: Ord> {
    /// Tabs with new blocked requests, per group.
    pub new_blocks: [BTreeSet<K>; 2],
    /// Tabs where an attribution tracker was allowed.
    pub new_attribution_trackers: BTreeSet<K>,
}

impl<K: Ord> Default for NotificationBurst<K> {
    fn default() -> Self {
        Self {
            new_blocks: [BTreeSet::new(), BTreeSet::new()],
            new_attribution_trackers: BTreeSet::new(),
        }
    }
}

impl<K: Ord> NotificationBurst<K> {
    pub fn is_empty(&self) -> bool {
        self.new_blocks.iter().all(BTreeSet::is_empty) && self.new_attribution_trackers.is_empty()
    }

    pub fn blocked_in(&self, group: RuleGroup) -> &BTreeSet<K> {
        &self.new_blocks[group.index()]
    }
}

#[derive(Debug)]
pub struct NotificationThrottle<K: Ord> {
    window: Duration,
    deadline: Option<Instant>,
    pending: NotificationBurst<K>,
}

impl<K: Ord + Clone> NotificationThrottle<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: NotificationBurst::default(),
        }
    }

    pub fn note_blocked(&mut self, group: RuleGroup, key: K, now: Instant) {
        self.pending.new_blocks[group.index()].insert(key);
        self.arm(now);
    }

    pub fn note_attribution_tracker(&mut self, key: K, now: Instant) {
        self.pending.new_attribution_trackers.insert(key);
        self.arm(now);
    }

    /// When the pending burst is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the pending burst once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<NotificationBurst<K>> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let burst = std::mem::take(&mut self.pending);
                (!burst.is_empty()).then_some(burst)
            }
            _ => None,
        }
    }

    /// Drop a key from the pending burst, e.g. when its tab closes.
    pub fn forget(&mut self, key: &K) {
        for tabs in &mut self.pending.new_blocks {
            tabs.remove(key);
        }
        self.pending.new_attribution_trackers.remove(key);
    }

    fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }
}
