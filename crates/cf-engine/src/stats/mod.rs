//! Blocking statistics
//!
//! [`StatsStore`] owns a [`StatsDatabase`] on a dedicated thread. Writes are
//! posted and forgotten; reads return a future. Storage failures never reach
//! callers: a failed store drops writes and reports empty stats.

pub mod db;
pub mod legacy;

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::SystemTime;

use cf_core::url::extract_host;
use cf_core::RuleGroup;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

pub use db::{InitStatus, StatsDatabase};
pub use legacy::LegacyCounters;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database schema version {0} is newer than supported")]
    NewerSchema(i32),
}

/// Aggregated counts for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsEntry {
    pub host: String,
    pub ad_count: i64,
    pub tracker_count: i64,
}

impl StatsEntry {
    pub fn new(host: impl Into<String>, ad_count: i64, tracker_count: i64) -> Self {
        Self {
            host: host.into(),
            ad_count,
            tracker_count,
        }
    }

    pub fn total(&self) -> i64 {
        self.ad_count + self.tracker_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Keyed by the blocked host.
    TrackerAndAds,
    /// Keyed by the website the block happened on.
    Website,
}

/// Report for one time range.
///
/// Counts are kept per host only; per-URL counts are not stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsData {
    pub trackers: Vec<StatsEntry>,
    pub websites: Vec<StatsEntry>,
    pub reporting_start: Option<SystemTime>,
}

impl StatsData {
    pub fn add_entry(&mut self, entry: StatsEntry, kind: EntryType) {
        match kind {
            EntryType::TrackerAndAds => self.trackers.push(entry),
            EntryType::Website => self.websites.push(entry),
        }
    }

    pub fn total_ads_blocked(&self) -> i64 {
        self.trackers.iter().map(|e| e.ad_count).sum()
    }

    pub fn total_trackers_blocked(&self) -> i64 {
        self.trackers.iter().map(|e| e.tracker_count).sum()
    }
}

enum Command {
    Add {
        host: String,
        origin_host: String,
        time: SystemTime,
        group: RuleGroup,
    },
    Clear {
        begin: SystemTime,
        end: SystemTime,
        done: oneshot::Sender<()>,
    },
    Import {
        data: StatsData,
        done: oneshot::Sender<()>,
    },
    Get {
        begin: SystemTime,
        end: SystemTime,
        reply: oneshot::Sender<Option<StatsData>>,
    },
    Status {
        reply: oneshot::Sender<InitStatus>,
    },
}

/// Handle to the stats thread. Dropping it lets the thread drain and exit.
pub struct StatsStore {
    tx: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl StatsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StatsError> {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let thread = std::thread::Builder::new()
            .name("cf-stats".to_string())
            .spawn(move || {
                let mut db = StatsDatabase::new(path);
                while let Some(command) = rx.blocking_recv() {
                    handle_command(&mut db, command);
                }
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Record one blocked request. URLs without a host are ignored.
    pub fn add_entry(&self, url: &str, origin_host: &str, time: SystemTime, group: RuleGroup) {
        let Some(host) = extract_host(url).filter(|h| !h.is_empty()) else {
            return;
        };
        self.post(Command::Add {
            host: host.to_ascii_lowercase(),
            origin_host: origin_host.to_string(),
            time,
            group,
        });
    }

    pub async fn clear(&self, begin: SystemTime, end: SystemTime) {
        let (done, wait) = oneshot::channel();
        self.post(Command::Clear { begin, end, done });
        let _ = wait.await;
    }

    pub async fn import(&self, data: StatsData) {
        let (done, wait) = oneshot::channel();
        self.post(Command::Import { data, done });
        let _ = wait.await;
    }

    /// Stats for `[begin, end]`. Empty when the store has failed.
    pub async fn get_stats(&self, begin: SystemTime, end: SystemTime) -> StatsData {
        let (reply, response) = oneshot::channel();
        self.post(Command::Get { begin, end, reply });
        response.await.ok().flatten().unwrap_or_default()
    }

    pub async fn status(&self) -> InitStatus {
        let (reply, response) = oneshot::channel();
        self.post(Command::Status { reply });
        response.await.unwrap_or(InitStatus::Failed)
    }

    /// Import counters from a legacy state file, once. The file is renamed
    /// afterwards so later starts skip it.
    pub async fn migrate_legacy(&self, path: &Path) -> Result<bool, StatsError> {
        let counters = match LegacyCounters::read(path) {
            Ok(counters) => counters,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let migrated = match counters.to_stats_data() {
            Some(data) => {
                log::info!(
                    "migrating legacy stats: {} ads, {} trackers",
                    data.total_ads_blocked(),
                    data.total_trackers_blocked()
                );
                self.import(data).await;
                true
            }
            None => false,
        };
        std::fs::rename(path, path.with_extension("migrated"))?;
        Ok(migrated)
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_err() {
            log::warn!("stats thread is gone, dropping command");
        }
    }
}

impl Drop for StatsStore {
    fn drop(&mut self) {
        // Closing the channel ends the loop once queued writes are done.
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.tx, closed));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn handle_command(db: &mut StatsDatabase, command: Command) {
    match command {
        Command::Add {
            host,
            origin_host,
            time,
            group,
        } => db.add_entry(&host, &origin_host, time, group),
        Command::Clear { begin, end, done } => {
            db.clear(begin, end);
            let _ = done.send(());
        }
        Command::Import { data, done } => {
            db.import(&data);
            let _ = done.send(());
        }
        Command::Get { begin, end, reply } => {
            let _ = reply.send(db.get_stats(begin, end));
        }
        Command::Status { reply } => {
            let _ = reply.send(db.status());
        }
    }
}
