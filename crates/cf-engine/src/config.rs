//! Engine configuration
//!
//! One JSON document holds everything the manager persists: per-group
//! sources, deleted presets and exception lists, the filtering settings and the timing knobs
//! of the tab layer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_core::hash::murmur3_32;
use cf_core::RuleGroup;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const DEFAULT_NOTIFICATION_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_ATTRIBUTION_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_OFF_SITE_TIMEOUT_SECS: u64 = 30 * 60;

/// Which exception list decides what gets filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionsList {
    /// Only sites on the list are filtered.
    ProcessList,
    /// Sites on the list are not filtered.
    #[default]
    ExemptList,
}

/// How a source is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Keep `$ad-attribution-tracker` rules. Dropped at load time otherwise.
    pub allow_attribution_tracker_rules: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: u32,
    /// Filter list text or compiled rule source. Relative paths resolve
    /// against the data directory.
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Set for sources that come from [`PRESET_SOURCES`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_id: Option<String>,
    #[serde(default = "default_true")]
    pub removable: bool,
    #[serde(default)]
    pub settings: SourceSettings,
}

impl SourceConfig {
    pub fn new(id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            enabled: true,
            preset_id: None,
            removable: true,
            settings: SourceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SourceSettings) -> Self {
        self.settings = settings;
        self
    }
}

// =============================================================================
// Presets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetKind {
    Tracking,
    Ads,
    Partners,
    Regional,
    CookieNotices,
    Annoyances,
    Other,
}

/// A well-known list offered to every profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSource {
    pub id: &'static str,
    pub kind: PresetKind,
    /// Relative to the data directory. Empty for a retired preset, which is
    /// taken out of every config whether enabled or not.
    pub path: &'static str,
    pub settings: SourceSettings,
    pub removable: bool,
}

pub const EASYPRIVACY_PRESET_ID: &str = "18d85f61-147a-4aa6-aa6d-607f5ef79eef";
pub const EASYLIST_PRESET_ID: &str = "8bef4dce-11b7-4452-8055-80eae7939dfb";
pub const PARTNERS_PRESET_ID: &str = "9c67efc8-09e5-4e70-b525-fb8c147fb2c2";

pub static PRESET_SOURCES: &[PresetSource] = &[
    PresetSource::new(EASYPRIVACY_PRESET_ID, PresetKind::Tracking, "presets/easyprivacy.txt").built_in(),
    PresetSource::new(EASYLIST_PRESET_ID, PresetKind::Ads, "presets/easylist.txt").built_in(),
    PresetSource::new("3b9a77ec-f9cc-4626-ace3-bd2e2d679d4c", PresetKind::Ads, "presets/abp-filters-anti-cv.txt")
        .built_in(),
    PresetSource::new("bbf1b5e9-5adf-4b83-abaf-88adc681dcdf", PresetKind::Ads, "presets/antiadblockfilters.txt")
        .built_in(),
    PresetSource::new(PARTNERS_PRESET_ID, PresetKind::Partners, "presets/partners.txt")
        .with_attribution_trackers()
        .built_in(),
    PresetSource::new("439f5af1-9c74-4606-9b9e-b46863ac611c", PresetKind::Regional, "presets/easylistchina.txt"),
    PresetSource::new("acf379b6-2c46-4802-88c9-6dd46bedfb32", PresetKind::Regional, "presets/easylistdutch.txt"),
    PresetSource::new("933d897d-cb29-4282-a4f9-2451d83d1885", PresetKind::Regional, "presets/easylistgermany.txt"),
    PresetSource::new("364fff45-270d-4a62-a449-982856057678", PresetKind::Regional, "presets/easylistitaly.txt"),
    PresetSource::new("ef6d3c42-e166-4901-9b03-58f124fbebf3", PresetKind::Regional, "presets/easylistpolish.txt"),
    PresetSource::new("3eae7230-473c-4ccd-a15f-f08e4bb86f71", PresetKind::Regional, "presets/easylistspanish.txt"),
    PresetSource::new("9be6251e-631e-4177-abec-d5dbef6be4f7", PresetKind::Regional, "presets/liste_fr.txt"),
    PresetSource::new("a3d2a41d-6659-4465-9819-ba8317185118", PresetKind::Regional, "presets/advblock.txt"),
    PresetSource::new("9c486dda-1589-4886-a40c-1be6484eb43d", PresetKind::Other, "presets/yoyo-serverlist.txt"),
    PresetSource::new("c1e5bcb8-edf6-4a71-b61b-ca96a87f30e3", PresetKind::CookieNotices, ""),
    PresetSource::new("78610306-e2ab-4147-9a10-fb6072e6675e", PresetKind::CookieNotices, "presets/fanboy-cookiemonster.txt"),
    PresetSource::new("269f589f-0a17-4158-a961-ee5252120dad", PresetKind::Annoyances, "presets/fanboy-annoyance.txt"),
];

impl PresetSource {
    const fn new(id: &'static str, kind: PresetKind, path: &'static str) -> Self {
        Self {
            id,
            kind,
            path,
            settings: SourceSettings {
                allow_attribution_tracker_rules: false,
            },
            removable: true,
        }
    }

    const fn built_in(mut self) -> Self {
        self.removable = false;
        self
    }

    const fn with_attribution_trackers(mut self) -> Self {
        self.settings.allow_attribution_tracker_rules = true;
        self
    }

    pub fn find(id: &str) -> Option<&'static PresetSource> {
        PRESET_SOURCES.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    pub fn group(&self) -> RuleGroup {
        match self.kind {
            PresetKind::Tracking => RuleGroup::TrackingRules,
            _ => RuleGroup::AdBlockingRules,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.path.is_empty()
    }

    /// Derived from the path, so a user adding the same file by hand gets
    /// the same id.
    pub fn source_id(&self) -> u32 {
        murmur3_32(self.path.as_bytes(), 0)
    }

    /// A disabled source for this preset.
    pub fn to_source(&self) -> SourceConfig {
        SourceConfig {
            id: self.source_id(),
            path: PathBuf::from(self.path),
            enabled: false,
            preset_id: Some(self.id.to_string()),
            removable: self.removable,
            settings: self.settings,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionsConfig {
    pub active: ExceptionsList,
    pub process_list: Vec<String>,
    pub exempt_list: Vec<String>,
    /// Serialized origins that are never filtered, such as extension pages.
    pub exempt_origins: Vec<String>,
}

impl ExceptionsConfig {
    pub fn list(&self, list: ExceptionsList) -> &[String] {
        match list {
            ExceptionsList::ProcessList => &self.process_list,
            ExceptionsList::ExemptList => &self.exempt_list,
        }
    }

    pub fn list_mut(&mut self, list: ExceptionsList) -> &mut Vec<String> {
        match list {
            ExceptionsList::ProcessList => &mut self.process_list,
            ExceptionsList::ExemptList => &mut self.exempt_list,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub enabled: bool,
    pub sources: Vec<SourceConfig>,
    pub exceptions: ExceptionsConfig,
    /// Ids of presets the user removed.
    pub deleted_presets: BTreeSet<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: Vec::new(),
            exceptions: ExceptionsConfig::default(),
            deleted_presets: BTreeSet::new(),
        }
    }
}

impl GroupConfig {
    /// Reconcile the sources of `group` with [`PRESET_SOURCES`]. Returns
    /// true when anything changed.
    ///
    /// Missing presets are added disabled unless the user deleted them.
    /// With `restore_deleted` the deleted set is cleared first. Built-in
    /// presets are always added back.
    pub fn sync_presets(&mut self, group: RuleGroup, restore_deleted: bool) -> bool {
        let before = self.clone();
        if restore_deleted {
            self.deleted_presets.clear();
        }

        let mut known: BTreeMap<String, u32> = self
            .sources
            .iter()
            .filter_map(|s| s.preset_id.clone().map(|preset_id| (preset_id, s.id)))
            .collect();

        for preset in PRESET_SOURCES.iter().filter(|p| p.group() == group) {
            if preset.is_retired() {
                if let Some(id) = known.remove(preset.id) {
                    self.sources.retain(|s| s.id != id);
                }
                continue;
            }

            let id = preset.source_id();
            if let Some(source) = self.sources.iter_mut().find(|s| s.id == id) {
                // Same file added by hand stays a plain source.
                if source.preset_id.is_some() {
                    source.preset_id = Some(preset.id.to_string());
                    known.remove(preset.id);
                }
                continue;
            }

            let mut source = preset.to_source();
            if let Some(old) = known.remove(preset.id) {
                // The preset moved to another file.
                if let Some(position) = self.sources.iter().position(|s| s.id == old) {
                    source.enabled = self.sources.remove(position).enabled;
                }
                self.sources.push(source);
            } else if !preset.removable || !self.deleted_presets.contains(preset.id) {
                self.sources.push(source);
            }
        }

        // Presets no longer offered are kept only while enabled.
        for id in known.into_values() {
            let Some(position) = self.sources.iter().position(|s| s.id == id) else {
                continue;
            };
            if self.sources[position].enabled {
                self.sources[position].preset_id = None;
            } else {
                self.sources.remove(position);
            }
        }

        *self != before
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Block main frame documents matched by `$document` rules.
    pub allow_blocking_documents: bool,
    /// Block every `ping` request of the ad-blocking group.
    pub block_pings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub notification_window_ms: u64,
    pub attribution_expiry_secs: u64,
    pub off_site_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            notification_window_ms: DEFAULT_NOTIFICATION_WINDOW_MS,
            attribution_expiry_secs: DEFAULT_ATTRIBUTION_EXPIRY_SECS,
            off_site_timeout_secs: DEFAULT_OFF_SITE_TIMEOUT_SECS,
        }
    }
}

impl TimingConfig {
    pub fn notification_window(&self) -> Duration {
        Duration::from_millis(self.notification_window_ms)
    }

    pub fn attribution_expiry(&self) -> Duration {
        Duration::from_secs(self.attribution_expiry_secs)
    }

    pub fn off_site_timeout(&self) -> Duration {
        Duration::from_secs(self.off_site_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where indices and the stats database live. Empty disables both.
    pub data_dir: PathBuf,
    pub tracking: GroupConfig,
    pub ad_blocking: GroupConfig,
    pub settings: FilterSettings,
    pub timing: TimingConfig,
    /// Private profile: tab state is kept, stats are not written.
    pub off_the_record: bool,
    /// JSON file with counters from before the stats database existed.
    pub legacy_stats: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            tracking: GroupConfig::default(),
            ad_blocking: GroupConfig::default(),
            settings: FilterSettings::default(),
            timing: TimingConfig::default(),
            off_the_record: false,
            legacy_stats: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(EngineError::read(path, e)),
        };
        Self::from_json(&text).map_err(|source| EngineError::Config {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write the config as pretty JSON, replacing `path` in one step.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let text = self.to_json().map_err(|source| EngineError::Config {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::write(parent, e))?;
        }

        // Write next to the target and rename over it, so a failed write
        // never leaves a truncated config behind.
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, text).map_err(|e| EngineError::write(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            EngineError::write(path, e)
        })
    }

    pub fn group(&self, group: RuleGroup) -> &GroupConfig {
        match group {
            RuleGroup::TrackingRules => &self.tracking,
            RuleGroup::AdBlockingRules => &self.ad_blocking,
        }
    }

    pub fn group_mut(&mut self, group: RuleGroup) -> &mut GroupConfig {
        match group {
            RuleGroup::TrackingRules => &mut self.tracking,
            RuleGroup::AdBlockingRules => &mut self.ad_blocking,
        }
    }

    pub fn source_path(&self, source: &SourceConfig) -> PathBuf {
        if source.path.is_relative() && !self.data_dir.as_os_str().is_empty() {
            self.data_dir.join(&source.path)
        } else {
            source.path.clone()
        }
    }

    /// `<data_dir>/<group>.cfix`
    pub fn index_path(&self, group: RuleGroup) -> Option<PathBuf> {
        self.data_dir()
            .map(|dir| dir.join(format!("{}.cfix", group.as_str())))
    }

    pub fn stats_path(&self) -> Option<PathBuf> {
        self.data_dir().map(|dir| dir.join("stats.db"))
    }

    fn data_dir(&self) -> Option<&Path> {
        Some(self.data_dir.as_path()).filter(|dir| !dir.as_os_str().is_empty())
    }
}

fn default_true() -> bool {
    true
}
