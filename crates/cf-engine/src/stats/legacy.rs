//! Counters kept before the stats database existed
//!
//! The old state file stored, per rule group, a map of blocked domain to
//! count and a map of website to count. They are folded into one entry per
//! host carrying both counts.

use std::collections::BTreeMap;
use std::path::Path;

use cf_core::RuleGroup;
use serde::Deserialize;

use super::db::from_micros;
use super::{EntryType, StatsData, StatsEntry};

type GroupCounters = [BTreeMap<String, i64>; 2];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacyCounters {
    /// Indexed by rule group.
    pub blocked_domains_counters: GroupCounters,
    pub blocked_for_origin_counters: GroupCounters,
    /// Microseconds since the Unix epoch.
    pub blocked_reporting_start: Option<i64>,
}

impl LegacyCounters {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Stats to import, or `None` when there is nothing to migrate.
    pub fn to_stats_data(&self) -> Option<StatsData> {
        let mut data = StatsData::default();
        add_counter_group(&mut data, &self.blocked_domains_counters, EntryType::TrackerAndAds);
        add_counter_group(&mut data, &self.blocked_for_origin_counters, EntryType::Website);

        if data.total_ads_blocked() == 0 && data.total_trackers_blocked() == 0 {
            return None;
        }
        data.reporting_start = self.blocked_reporting_start.map(from_micros);
        Some(data)
    }
}

fn add_counter_group(data: &mut StatsData, counters: &GroupCounters, kind: EntryType) {
    let trackers = &counters[RuleGroup::TrackingRules.index()];
    let ads = &counters[RuleGroup::AdBlockingRules.index()];

    for (domain, &tracker_count) in trackers {
        let ad_count = ads.get(domain).copied().unwrap_or(0);
        data.add_entry(StatsEntry::new(domain, ad_count, tracker_count), kind);
    }
    for (domain, &ad_count) in ads {
        if !trackers.contains_key(domain) {
            data.add_entry(StatsEntry::new(domain, ad_count, 0), kind);
        }
    }
}
