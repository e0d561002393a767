//! Rule manager
//!
//! Owns the configured sources and exception lists of both rule groups and
//! the index currently serving each group. Any change to a group's sources
//! schedules a rebuild on the blocking pool. The finished index is published
//! into an [`IndexSlot`] with a single swap, so readers holding the previous
//! `Arc<RulesIndex>` keep using it until they ask again.
//!
//! A source that cannot be read or decoded is left out of the index and
//! reported through [`ManagerEvent::SourceUnloaded`]; the other sources of
//! the group still load.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use cf_compiler::compile_filter_list;
use cf_core::psl::is_subdomain_of;
use cf_core::url::Origin;
use cf_core::{rule_store, IndexedSource, Rule, RuleGroup, RuleSource, RulesIndex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, ExceptionsList, PresetSource, SourceConfig, SourceSettings};
use crate::error::EngineError;
use crate::subscribers::{SubscriberRegistry, SubscriptionId};

/// Notifications raised by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    GroupStateChanged { group: RuleGroup, enabled: bool },
    SourcesChanged { group: RuleGroup },
    ExceptionListChanged { group: RuleGroup, list: ExceptionsList },
    IndexBuilt { group: RuleGroup, checksum: String, sources: Vec<u32> },
    SourceUnloaded { group: RuleGroup, source_id: u32, reason: String },
}

// =============================================================================
// Index slot
// =============================================================================

#[derive(Default)]
struct SlotState {
    index: Option<Arc<RulesIndex>>,
    generation: u64,
}

/// Shared reference to the index serving one group.
#[derive(Clone, Default)]
pub struct IndexSlot {
    state: Arc<RwLock<SlotState>>,
}

impl IndexSlot {
    pub fn current(&self) -> Option<Arc<RulesIndex>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).index.clone()
    }

    /// Swap in `index` unless something newer was published already.
    pub fn publish(&self, generation: u64, index: Arc<RulesIndex>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if generation < state.generation {
            return false;
        }
        state.generation = generation;
        state.index = Some(index);
        true
    }

    /// Drop the index. Builds older than `generation` can no longer publish.
    pub fn clear(&self, generation: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.generation = state.generation.max(generation);
        state.index = None;
    }
}

// =============================================================================
// Background rebuilds
// =============================================================================

/// What a rebuild did.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildOutcome {
    pub group: RuleGroup,
    /// Checksum of the built index; empty when the build was cancelled.
    pub checksum: String,
    pub loaded: Vec<u32>,
    pub unloaded: Vec<u32>,
    pub published: bool,
    pub reused_persisted: bool,
}

/// Handle to an in-flight rebuild. Dropping it cancels the build.
pub struct RebuildTask {
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<RebuildOutcome>>,
}

impl RebuildTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub async fn join(mut self) -> Result<RebuildOutcome, EngineError> {
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| EngineError::Background(e.to_string())),
            None => Err(EngineError::Background("rebuild already joined".to_string())),
        }
    }
}

impl Drop for RebuildTask {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct RebuildJob {
    group: RuleGroup,
    generation: u64,
    sources: Vec<(u32, PathBuf, SourceSettings)>,
    index_path: Option<PathBuf>,
    slot: IndexSlot,
    events: Arc<SubscriberRegistry<ManagerEvent>>,
    cancelled: Arc<AtomicBool>,
}

impl RebuildJob {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn run(self) -> RebuildOutcome {
        let mut outcome = RebuildOutcome {
            group: self.group,
            checksum: String::new(),
            loaded: Vec::new(),
            unloaded: Vec::new(),
            published: false,
            reused_persisted: false,
        };

        let mut indexed = Vec::with_capacity(self.sources.len());
        for (id, path, settings) in &self.sources {
            if self.is_cancelled() {
                log::debug!("{} rebuild cancelled while loading sources", self.group);
                return outcome;
            }
            match load_source(*id, path, *settings) {
                Ok(source) => {
                    outcome.loaded.push(*id);
                    indexed.push(IndexedSource::new(*id, Arc::new(source)));
                }
                Err(e) => {
                    log::warn!("{} source {} unloaded: {}", self.group, id, e);
                    outcome.unloaded.push(*id);
                    self.events.emit(&ManagerEvent::SourceUnloaded {
                        group: self.group,
                        source_id: *id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let index = match self.load_persisted(&indexed) {
            Some(index) => {
                outcome.reused_persisted = true;
                index
            }
            None => {
                let index = RulesIndex::build(self.group, indexed);
                self.persist(&index);
                index
            }
        };

        if self.is_cancelled() {
            log::debug!("{} rebuild cancelled before publishing", self.group);
            return outcome;
        }

        outcome.checksum = index.checksum().to_string();
        outcome.published = self.slot.publish(self.generation, Arc::new(index));
        if outcome.published {
            log::info!(
                "{} index ready: {} sources, checksum {}",
                self.group,
                outcome.loaded.len(),
                outcome.checksum
            );
            self.events.emit(&ManagerEvent::IndexBuilt {
                group: self.group,
                checksum: outcome.checksum.clone(),
                sources: outcome.loaded.clone(),
            });
        }
        outcome
    }

    fn load_persisted(&self, sources: &[IndexedSource]) -> Option<RulesIndex> {
        let path = self.index_path.as_ref()?;
        let data = std::fs::read(path).ok()?;
        match RulesIndex::load(&data, self.group, sources.to_vec()) {
            Ok(index) => Some(index),
            Err(e) => {
                log::debug!("discarding persisted {} index: {}", self.group, e);
                None
            }
        }
    }

    fn persist(&self, index: &RulesIndex) {
        let Some(path) = &self.index_path else {
            return;
        };
        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(path, index.serialize()));
        if let Err(e) = result {
            log::warn!("failed to persist {} index to {}: {}", self.group, path.display(), e);
        }
    }
}

/// Read a source file. Compiled sources are loaded as-is; anything else is
/// taken to be filter list text and compiled first.
fn load_source(id: u32, path: &Path, settings: SourceSettings) -> Result<RuleSource, EngineError> {
    let data = std::fs::read(path).map_err(|e| EngineError::read(path, e))?;
    let compiled;
    let bytes = if data.starts_with(&rule_store::MAGIC) {
        &data
    } else {
        compiled = compile_filter_list(&String::from_utf8_lossy(&data));
        &compiled.bytes
    };
    let source = RuleSource::load(bytes).map_err(|source| EngineError::Source { id, source })?;

    let is_attribution_tracker = |rule: &Rule| !rule.ad_domains_and_query_triggers.is_empty();
    if settings.allow_attribution_tracker_rules || !source.rules().iter().any(is_attribution_tracker) {
        return Ok(source);
    }
    let rules = source
        .rules()
        .iter()
        .filter(|rule| rule.ad_domains_and_query_triggers.is_empty())
        .cloned()
        .collect();
    Ok(RuleSource::from_rules(source.metadata().clone(), rules))
}

// =============================================================================
// Manager
// =============================================================================

pub struct RuleManager {
    config: EngineConfig,
    config_path: Option<PathBuf>,
    runtime: Handle,
    slots: [IndexSlot; 2],
    generations: [u64; 2],
    rebuilds: [Option<RebuildTask>; 2],
    events: Arc<SubscriberRegistry<ManagerEvent>>,
}

impl RuleManager {
    /// Manager over an in-memory config. Changes are not persisted.
    pub fn new(config: EngineConfig, runtime: Handle) -> Self {
        Self {
            config,
            config_path: None,
            runtime,
            slots: Default::default(),
            generations: [0; 2],
            rebuilds: [None, None],
            events: Arc::new(SubscriberRegistry::new()),
        }
    }

    /// Manager backed by a config file, written back after every change.
    pub fn open(path: impl Into<PathBuf>, runtime: Handle) -> Result<Self, EngineError> {
        let path = path.into();
        let config = EngineConfig::load(&path)?;
        let mut manager = Self::new(config, runtime);
        manager.config_path = Some(path);
        Ok(manager)
    }

    /// Build the index of every enabled group.
    pub fn start(&mut self) {
        for group in RuleGroup::ALL {
            if self.config.group(group).enabled {
                self.schedule_rebuild(group);
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &SubscriberRegistry<ManagerEvent> {
        &self.events
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Index serving `group`; `None` while disabled or before the first build.
    pub fn index(&self, group: RuleGroup) -> Option<Arc<RulesIndex>> {
        if !self.is_group_enabled(group) {
            return None;
        }
        self.slots[group.index()].current()
    }

    pub fn index_slot(&self, group: RuleGroup) -> IndexSlot {
        self.slots[group.index()].clone()
    }

    pub fn index_checksum(&self, group: RuleGroup) -> Option<String> {
        self.index(group).map(|index| index.checksum().to_string())
    }

    // =========================================================================
    // Groups and sources
    // =========================================================================

    pub fn is_group_enabled(&self, group: RuleGroup) -> bool {
        self.config.group(group).enabled
    }

    pub fn set_group_enabled(&mut self, group: RuleGroup, enabled: bool) -> Result<(), EngineError> {
        if self.config.group(group).enabled == enabled {
            return Ok(());
        }
        let mut next = self.config.clone();
        next.group_mut(group).enabled = enabled;
        self.commit(next)?;

        if enabled {
            self.schedule_rebuild(group);
        } else {
            self.rebuilds[group.index()] = None;
            self.generations[group.index()] += 1;
            self.slots[group.index()].clear(self.generations[group.index()]);
        }
        log::info!("{} rules {}", group, if enabled { "enabled" } else { "disabled" });
        self.events.emit(&ManagerEvent::GroupStateChanged { group, enabled });
        Ok(())
    }

    pub fn sources(&self, group: RuleGroup) -> &[SourceConfig] {
        &self.config.group(group).sources
    }

    pub fn source(&self, group: RuleGroup, id: u32) -> Option<&SourceConfig> {
        self.sources(group).iter().find(|s| s.id == id)
    }

    pub fn add_source(&mut self, group: RuleGroup, source: SourceConfig) -> Result<(), EngineError> {
        let id = source.id;
        if self.source(group, id).is_some() {
            return Err(EngineError::DuplicateSource { group, id });
        }
        let mut next = self.config.clone();
        next.group_mut(group).sources.push(source);
        self.commit(next)?;
        self.sources_changed(group);
        Ok(())
    }

    /// Remove a source. An in-flight rebuild that still includes it is
    /// cancelled. Removing a preset remembers it as deleted so preset
    /// updates do not bring it back.
    pub fn remove_source(&mut self, group: RuleGroup, id: u32) -> Result<SourceConfig, EngineError> {
        let mut next = self.config.clone();
        let config = next.group_mut(group);
        let position = config
            .sources
            .iter()
            .position(|s| s.id == id)
            .ok_or(EngineError::UnknownSource { group, id })?;
        if !config.sources[position].removable {
            return Err(EngineError::NotRemovable { group, id });
        }
        let removed = config.sources.remove(position);
        if let Some(preset_id) = &removed.preset_id {
            config.deleted_presets.insert(preset_id.clone());
        }
        self.commit(next)?;
        self.sources_changed(group);
        Ok(removed)
    }

    pub fn set_source_enabled(&mut self, group: RuleGroup, id: u32, enabled: bool) -> Result<(), EngineError> {
        let mut next = self.config.clone();
        let source = next
            .group_mut(group)
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::UnknownSource { group, id })?;
        if source.enabled == enabled {
            return Ok(());
        }
        source.enabled = enabled;
        self.commit(next)?;
        self.sources_changed(group);
        Ok(())
    }

    /// Change how a source is loaded. Only allowed while the source is
    /// disabled, and never for presets that cannot be removed.
    pub fn set_source_settings(
        &mut self,
        group: RuleGroup,
        id: u32,
        settings: SourceSettings,
    ) -> Result<(), EngineError> {
        let mut next = self.config.clone();
        let source = next
            .group_mut(group)
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::UnknownSource { group, id })?;
        if source.enabled {
            return Err(EngineError::SourceInUse { group, id });
        }
        if !source.removable {
            return Err(EngineError::NotRemovable { group, id });
        }
        if source.settings == settings {
            return Ok(());
        }
        source.settings = settings;
        self.commit(next)?;
        self.events.emit(&ManagerEvent::SourcesChanged { group });
        Ok(())
    }

    fn sources_changed(&mut self, group: RuleGroup) {
        self.events.emit(&ManagerEvent::SourcesChanged { group });
        if self.is_group_enabled(group) {
            self.schedule_rebuild(group);
        }
    }

    // =========================================================================
    // Presets
    // =========================================================================

    /// Presets the user removed from `group`.
    pub fn deleted_presets(&self, group: RuleGroup) -> &BTreeSet<String> {
        &self.config.group(group).deleted_presets
    }

    /// Bring the preset sources of `group` up to date with
    /// [`PRESET_SOURCES`](crate::config::PRESET_SOURCES). New presets are
    /// added disabled, moved presets keep their state and retired ones are
    /// dropped. Deleted presets stay deleted.
    pub fn update_preset_sources(&mut self, group: RuleGroup) -> Result<(), EngineError> {
        self.sync_presets(group, false)
    }

    /// Like [`update_preset_sources`](Self::update_preset_sources), but
    /// deleted presets are restored too.
    pub fn reset_preset_sources(&mut self, group: RuleGroup) -> Result<(), EngineError> {
        self.sync_presets(group, true)
    }

    fn sync_presets(&mut self, group: RuleGroup, restore_deleted: bool) -> Result<(), EngineError> {
        let mut next = self.config.clone();
        if !next.group_mut(group).sync_presets(group, restore_deleted) {
            return Ok(());
        }
        self.commit(next)?;
        log::info!("{} preset sources updated", group);
        self.sources_changed(group);
        Ok(())
    }

    /// Whether the source of a known preset is enabled.
    pub fn is_preset_enabled(&self, preset_id: &str) -> bool {
        let Some(preset) = PresetSource::find(preset_id) else {
            return false;
        };
        self.source(preset.group(), preset.source_id())
            .is_some_and(|s| s.enabled && s.preset_id.as_deref() == Some(preset_id))
    }

    pub fn preset_id_for_source(&self, group: RuleGroup, id: u32) -> Option<&str> {
        self.source(group, id).and_then(|s| s.preset_id.as_deref())
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn exception_list(&self, group: RuleGroup, list: ExceptionsList) -> &[String] {
        self.config.group(group).exceptions.list(list)
    }

    pub fn active_exception_list(&self, group: RuleGroup) -> ExceptionsList {
        self.config.group(group).exceptions.active
    }

    /// Replace the domains of `list`.
    pub fn set_exception_list(
        &mut self,
        group: RuleGroup,
        list: ExceptionsList,
        domains: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort();
        domains.dedup();
        let mut next = self.config.clone();
        *next.group_mut(group).exceptions.list_mut(list) = domains;
        self.commit(next)?;
        self.exceptions_changed(group, list);
        Ok(())
    }

    pub fn add_exception(&mut self, group: RuleGroup, list: ExceptionsList, domain: &str) -> Result<(), EngineError> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() || self.exception_list(group, list).contains(&domain) {
            return Ok(());
        }
        let mut next = self.config.clone();
        let domains = next.group_mut(group).exceptions.list_mut(list);
        domains.push(domain);
        domains.sort();
        self.commit(next)?;
        self.exceptions_changed(group, list);
        Ok(())
    }

    pub fn remove_exception(&mut self, group: RuleGroup, list: ExceptionsList, domain: &str) -> Result<(), EngineError> {
        let domain = domain.to_ascii_lowercase();
        if !self.exception_list(group, list).contains(&domain) {
            return Ok(());
        }
        let mut next = self.config.clone();
        next.group_mut(group).exceptions.list_mut(list).retain(|d| *d != domain);
        self.commit(next)?;
        self.exceptions_changed(group, list);
        Ok(())
    }

    pub fn set_active_exception_list(&mut self, group: RuleGroup, list: ExceptionsList) -> Result<(), EngineError> {
        if self.config.group(group).exceptions.active == list {
            return Ok(());
        }
        let mut next = self.config.clone();
        next.group_mut(group).exceptions.active = list;
        self.commit(next)?;
        self.exceptions_changed(group, list);
        Ok(())
    }

    /// Origins, such as extension origins, that are never filtered.
    pub fn set_exempt_origins(&mut self, group: RuleGroup, origins: Vec<String>) -> Result<(), EngineError> {
        let mut next = self.config.clone();
        next.group_mut(group).exceptions.exempt_origins = origins;
        self.commit(next)?;
        let active = self.active_exception_list(group);
        self.exceptions_changed(group, active);
        Ok(())
    }

    fn exceptions_changed(&self, group: RuleGroup, list: ExceptionsList) {
        self.events.emit(&ManagerEvent::ExceptionListChanged { group, list });
    }

    /// Whether requests from documents of `origin` bypass `group` entirely.
    ///
    /// With the exempt list active, listed domains and their subdomains are
    /// exempt. With the process list active only listed sites get filtered.
    pub fn is_exempt_of_filtering(&self, group: RuleGroup, origin: &str) -> bool {
        let exceptions = &self.config.group(group).exceptions;
        if exceptions.exempt_origins.iter().any(|o| o == origin) {
            return true;
        }
        let Some(host) = Origin::parse(origin).map(|o| o.host) else {
            return false;
        };
        let listed = exceptions
            .list(exceptions.active)
            .iter()
            .any(|domain| is_subdomain_of(&host, domain));
        match exceptions.active {
            ExceptionsList::ExemptList => listed,
            ExceptionsList::ProcessList => !listed,
        }
    }

    // =========================================================================
    // Rebuilds
    // =========================================================================

    /// Start rebuilding `group`, cancelling any rebuild already running.
    pub fn schedule_rebuild(&mut self, group: RuleGroup) {
        let slot = group.index();
        if let Some(previous) = self.rebuilds[slot].take() {
            previous.cancel();
        }
        self.generations[slot] += 1;

        let sources = self
            .config
            .group(group)
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id, self.config.source_path(s), s.settings))
            .collect();
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = RebuildJob {
            group,
            generation: self.generations[slot],
            sources,
            index_path: self.config.index_path(group),
            slot: self.slots[slot].clone(),
            events: Arc::clone(&self.events),
            cancelled: Arc::clone(&cancelled),
        };

        log::debug!("scheduling {} rebuild #{}", group, job.generation);
        let handle = self.runtime.spawn_blocking(move || job.run());
        self.rebuilds[slot] = Some(RebuildTask {
            cancelled,
            handle: Some(handle),
        });
    }

    /// Wait for the pending rebuild of `group`, if any.
    pub async fn wait_for_rebuild(&mut self, group: RuleGroup) -> Option<Result<RebuildOutcome, EngineError>> {
        let task = self.rebuilds[group.index()].take()?;
        Some(task.join().await)
    }

    pub fn is_rebuilding(&self, group: RuleGroup) -> bool {
        self.rebuilds[group.index()]
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Write `next` and make it the live config. A failed write leaves the
    /// live config as it was.
    fn commit(&mut self, next: EngineConfig) -> Result<(), EngineError> {
        if let Some(path) = &self.config_path {
            next.save(path)?;
        }
        self.config = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EASYLIST_PRESET_ID, PARTNERS_PRESET_ID};
    use cf_core::{Request, ResourceType};
    use std::sync::Mutex;

    const ADS: &str = "! Title: Ads\n||ads.example^\n";
    const TRACKERS: &str = "! Title: Trackers\n||tracker.test^$third-party\n";

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn config_in(dir: &Path) -> EngineConfig {
        EngineConfig {
            data_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    fn blocks(manager: &RuleManager, group: RuleGroup, url: &str) -> bool {
        let index = manager.index(group).expect("index published");
        index
            .evaluate(&Request::new(url, Some("https://site.org"), ResourceType::SCRIPT))
            .is_blocked()
    }

    #[tokio::test]
    async fn rebuild_publishes_an_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ads.txt", ADS);
        let mut manager = RuleManager::new(config_in(dir.path()), Handle::current());
        let (_, mut events) = manager.events().subscribe_channel();

        manager
            .add_source(RuleGroup::AdBlockingRules, SourceConfig::new(1, "ads.txt"))
            .unwrap();
        let outcome = manager.wait_for_rebuild(RuleGroup::AdBlockingRules).await.unwrap().unwrap();

        assert!(outcome.published);
        assert_eq!(outcome.loaded, vec![1]);
        assert!(blocks(&manager, RuleGroup::AdBlockingRules, "https://ads.example/a.js"));
        assert!(!blocks(&manager, RuleGroup::AdBlockingRules, "https://cdn.example/a.js"));
        assert_eq!(
            manager.index_checksum(RuleGroup::AdBlockingRules),
            Some(outcome.checksum.clone())
        );

        assert_eq!(
            events.recv().await,
            Some(ManagerEvent::SourcesChanged { group: RuleGroup::AdBlockingRules })
        );
        assert!(matches!(events.recv().await, Some(ManagerEvent::IndexBuilt { sources, .. }) if sources == vec![1]));
    }

    #[tokio::test]
    async fn broken_source_does_not_block_the_others() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "trackers.txt", TRACKERS);
        let mut corrupt = rule_store::MAGIC.to_vec();
        corrupt.extend_from_slice(&[0xff; 40]);
        std::fs::write(dir.path().join("broken.cfrs"), corrupt).unwrap();

        let mut config = config_in(dir.path());
        config.tracking.sources = vec![
            SourceConfig::new(1, "broken.cfrs"),
            SourceConfig::new(2, "trackers.txt"),
            SourceConfig::new(3, "missing.txt"),
        ];
        let mut manager = RuleManager::new(config, Handle::current());
        let unloaded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&unloaded);
        manager.subscribe(move |event| {
            if let ManagerEvent::SourceUnloaded { source_id, .. } = event {
                seen.lock().unwrap().push(*source_id);
            }
        });

        manager.start();
        let outcome = manager.wait_for_rebuild(RuleGroup::TrackingRules).await.unwrap().unwrap();

        assert_eq!(outcome.loaded, vec![2]);
        assert_eq!(outcome.unloaded, vec![1, 3]);
        assert_eq!(*unloaded.lock().unwrap(), vec![1, 3]);
        assert!(blocks(&manager, RuleGroup::TrackingRules, "https://tracker.test/p.gif"));
    }

    #[tokio::test]
    async fn persisted_index_is_reused_until_a_source_changes() {
        let dir = tempfile::tempdir().unwrap();
        let list = write(dir.path(), "ads.txt", ADS);
        let mut config = config_in(dir.path());
        config.ad_blocking.sources = vec![SourceConfig::new(1, "ads.txt")];

        let mut first = RuleManager::new(config.clone(), Handle::current());
        first.start();
        let built = first.wait_for_rebuild(RuleGroup::AdBlockingRules).await.unwrap().unwrap();
        assert!(!built.reused_persisted);
        assert!(dir.path().join("ad-blocking.cfix").exists());

        let mut second = RuleManager::new(config.clone(), Handle::current());
        second.start();
        let reused = second.wait_for_rebuild(RuleGroup::AdBlockingRules).await.unwrap().unwrap();
        assert!(reused.reused_persisted);
        assert_eq!(reused.checksum, built.checksum);

        std::fs::write(&list, format!("{ADS}||more-ads.example^\n")).unwrap();
        let mut third = RuleManager::new(config, Handle::current());
        third.start();
        let rebuilt = third.wait_for_rebuild(RuleGroup::AdBlockingRules).await.unwrap().unwrap();
        assert!(!rebuilt.reused_persisted);
        assert_ne!(rebuilt.checksum, built.checksum);
        assert!(blocks(&third, RuleGroup::AdBlockingRules, "https://more-ads.example/x.js"));
    }

    #[tokio::test]
    async fn newer_rebuild_wins_over_cancelled_one() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ads.txt", ADS);
        write(dir.path(), "trackers.txt", TRACKERS);
        let mut manager = RuleManager::new(config_in(dir.path()), Handle::current());

        manager
            .add_source(RuleGroup::AdBlockingRules, SourceConfig::new(1, "ads.txt"))
            .unwrap();
        manager
            .add_source(RuleGroup::AdBlockingRules, SourceConfig::new(2, "trackers.txt"))
            .unwrap();
        manager.remove_source(RuleGroup::AdBlockingRules, 1).unwrap();

        let outcome = manager.wait_for_rebuild(RuleGroup::AdBlockingRules).await.unwrap().unwrap();
        assert_eq!(outcome.loaded, vec![2]);
        let index = manager.index(RuleGroup::AdBlockingRules).unwrap();
        let ids: Vec<u32> = index.sources().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn stale_generation_cannot_publish() {
        let slot = IndexSlot::default();
        let empty = || Arc::new(RulesIndex::build(RuleGroup::TrackingRules, Vec::new()));

        assert!(slot.publish(2, empty()));
        assert!(!slot.publish(1, empty()));
        slot.clear(3);
        assert!(slot.current().is_none());
        assert!(!slot.publish(2, empty()));
        assert!(slot.publish(3, empty()));
    }

    #[tokio::test]
    async fn disabling_a_group_detaches_its_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ads.txt", ADS);
        let mut config = config_in(dir.path());
        config.ad_blocking.sources = vec![SourceConfig::new(1, "ads.txt")];
        let mut manager = RuleManager::new(config, Handle::current());
        manager.start();
        manager.wait_for_rebuild(RuleGroup::AdBlockingRules).await;

        manager.set_group_enabled(RuleGroup::AdBlockingRules, false).unwrap();
        assert!(manager.index(RuleGroup::AdBlockingRules).is_none());
        assert_eq!(manager.sources(RuleGroup::AdBlockingRules).len(), 1);

        manager.set_group_enabled(RuleGroup::AdBlockingRules, true).unwrap();
        manager.wait_for_rebuild(RuleGroup::AdBlockingRules).await;
        assert!(blocks(&manager, RuleGroup::AdBlockingRules, "https://ads.example/a.js"));
    }

    #[tokio::test]
    async fn source_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = RuleManager::new(config_in(dir.path()), Handle::current());
        manager
            .add_source(RuleGroup::TrackingRules, SourceConfig::new(4, "a.txt"))
            .unwrap();
        assert!(matches!(
            manager.add_source(RuleGroup::TrackingRules, SourceConfig::new(4, "b.txt")),
            Err(EngineError::DuplicateSource { id: 4, .. })
        ));
        assert!(matches!(
            manager.remove_source(RuleGroup::TrackingRules, 9),
            Err(EngineError::UnknownSource { id: 9, .. })
        ));
        assert!(matches!(
            manager.set_source_enabled(RuleGroup::AdBlockingRules, 4, false),
            Err(EngineError::UnknownSource { .. })
        ));
    }

    #[test]
    fn exempt_list_and_process_list() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut manager = RuleManager::new(EngineConfig::default(), runtime.handle().clone());
        let group = RuleGroup::AdBlockingRules;

        manager
            .set_exception_list(group, ExceptionsList::ExemptList, vec!["News.Example ".into()])
            .unwrap();
        assert_eq!(manager.exception_list(group, ExceptionsList::ExemptList), ["news.example"]);
        assert!(manager.is_exempt_of_filtering(group, "https://news.example"));
        assert!(manager.is_exempt_of_filtering(group, "https://www.news.example"));
        assert!(!manager.is_exempt_of_filtering(group, "https://other.example"));
        assert!(!manager.is_exempt_of_filtering(RuleGroup::TrackingRules, "https://news.example"));

        manager
            .add_exception(group, ExceptionsList::ProcessList, "shop.test")
            .unwrap();
        manager
            .set_active_exception_list(group, ExceptionsList::ProcessList)
            .unwrap();
        assert!(!manager.is_exempt_of_filtering(group, "https://shop.test"));
        assert!(manager.is_exempt_of_filtering(group, "https://news.example"));

        manager
            .set_exempt_origins(group, vec!["chrome-extension://abcdef".into()])
            .unwrap();
        assert!(manager.is_exempt_of_filtering(group, "chrome-extension://abcdef"));
    }

    #[tokio::test]
    async fn changes_are_written_back_to_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.json");
        let mut manager = RuleManager::open(&path, Handle::current()).unwrap();

        manager
            .add_source(RuleGroup::TrackingRules, SourceConfig::new(7, "/lists/easyprivacy.txt"))
            .unwrap();
        manager
            .add_exception(RuleGroup::TrackingRules, ExceptionsList::ExemptList, "bank.test")
            .unwrap();
        manager.wait_for_rebuild(RuleGroup::TrackingRules).await;

        let saved = EngineConfig::load(&path).unwrap();
        assert_eq!(saved.tracking.sources, vec![SourceConfig::new(7, "/lists/easyprivacy.txt")]);
        assert_eq!(saved.tracking.exceptions.exempt_list, vec!["bank.test".to_string()]);
    }

    #[tokio::test]
    async fn failed_config_write_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ads.txt", ADS);
        let blocker = write(dir.path(), "not-a-dir", "");
        let group = RuleGroup::AdBlockingRules;

        let mut config = config_in(dir.path());
        config.ad_blocking.sources = vec![SourceConfig::new(1, "ads.txt")];
        let mut manager = RuleManager::new(config, Handle::current());
        manager.config_path = Some(blocker.join("filter.json"));
        manager.start();
        manager.wait_for_rebuild(group).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        manager.subscribe(move |event| seen.lock().unwrap().push(event.clone()));
        let before = manager.config().clone();

        assert!(matches!(manager.remove_source(group, 1), Err(EngineError::Write { .. })));
        assert!(manager.add_source(group, SourceConfig::new(2, "more.txt")).is_err());
        assert!(manager.set_source_enabled(group, 1, false).is_err());
        assert!(manager.set_group_enabled(group, false).is_err());
        assert!(manager.add_exception(group, ExceptionsList::ExemptList, "bank.test").is_err());
        assert!(manager.set_active_exception_list(group, ExceptionsList::ProcessList).is_err());

        assert_eq!(manager.config(), &before);
        assert!(manager.wait_for_rebuild(group).await.is_none());
        assert!(blocks(&manager, group, "https://ads.example/a.js"));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(&blocker).unwrap(), b"");
    }

    #[tokio::test]
    async fn preset_sources_can_be_deleted_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.json");
        let group = RuleGroup::AdBlockingRules;
        let german = PresetSource::find("933d897d-cb29-4282-a4f9-2451d83d1885").unwrap();
        let easylist = PresetSource::find(EASYLIST_PRESET_ID).unwrap();
        let mut manager = RuleManager::open(&path, Handle::current()).unwrap();

        manager.update_preset_sources(group).unwrap();
        assert_eq!(manager.preset_id_for_source(group, german.source_id()), Some(german.id));
        assert!(!manager.is_preset_enabled(german.id));

        manager.set_source_enabled(group, easylist.source_id(), true).unwrap();
        assert!(manager.is_preset_enabled(EASYLIST_PRESET_ID));
        assert!(!manager.is_preset_enabled("not-a-preset"));
        assert!(matches!(
            manager.remove_source(group, easylist.source_id()),
            Err(EngineError::NotRemovable { .. })
        ));

        manager.remove_source(group, german.source_id()).unwrap();
        assert!(manager.deleted_presets(group).contains(german.id));
        manager.update_preset_sources(group).unwrap();
        assert!(manager.source(group, german.source_id()).is_none());

        let saved = EngineConfig::load(&path).unwrap();
        assert!(saved.ad_blocking.deleted_presets.contains(german.id));

        manager.reset_preset_sources(group).unwrap();
        assert!(manager.deleted_presets(group).is_empty());
        assert_eq!(manager.preset_id_for_source(group, german.source_id()), Some(german.id));
        assert!(manager.is_preset_enabled(EASYLIST_PRESET_ID));
        manager.wait_for_rebuild(group).await;
    }

    #[tokio::test]
    async fn source_settings_apply_to_disabled_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "partners.txt",
            "||pixel.test^\n@@||pixel.test^$ad-attribution-tracker=example|abc\n",
        );
        let group = RuleGroup::AdBlockingRules;
        let mut manager = RuleManager::new(config_in(dir.path()), Handle::current());

        manager.add_source(group, SourceConfig::new(1, "partners.txt")).unwrap();
        manager.wait_for_rebuild(group).await;
        assert_eq!(manager.index(group).unwrap().len(), 1);

        let settings = SourceSettings {
            allow_attribution_tracker_rules: true,
        };
        assert!(matches!(
            manager.set_source_settings(group, 1, settings),
            Err(EngineError::SourceInUse { id: 1, .. })
        ));

        manager.set_source_enabled(group, 1, false).unwrap();
        manager.set_source_settings(group, 1, settings).unwrap();
        manager.set_source_enabled(group, 1, true).unwrap();
        manager.wait_for_rebuild(group).await;
        assert_eq!(manager.index(group).unwrap().len(), 2);
        assert_eq!(manager.source(group, 1).unwrap().settings, settings);

        manager.update_preset_sources(group).unwrap();
        let partners = PresetSource::find(PARTNERS_PRESET_ID).unwrap();
        assert!(matches!(
            manager.set_source_settings(group, partners.source_id(), SourceSettings::default()),
            Err(EngineError::NotRemovable { .. })
        ));
        manager.wait_for_rebuild(group).await;
    }
}
