//! SQLite storage for blocking stats
//!
//! One append-only table of `(host_name, origin_host, time, type)` rows.
//! Times are microseconds since the Unix epoch and `type` is the rule
//! group. The `meta` table keeps `reporting_start`.
//!
//! Initialization is lazy. A corrupt file gets one recovery attempt: the
//! readable rows are salvaged, the file is moved aside and a fresh database
//! is filled with what was saved. If that fails too the database stays
//! closed for the rest of the process and every call becomes a no-op.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cf_core::RuleGroup;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{EntryType, StatsData, StatsEntry, StatsError};

const SCHEMA_VERSION: i32 = 1;
const REPORTING_START_KEY: &str = "reporting_start";

const STATS_BY_HOST_SQL: &str = "SELECT host_name, COUNT(*) AS total, \
     SUM(CASE WHEN type = 1 THEN 1 ELSE 0 END) AS ad_count, \
     SUM(CASE WHEN type = 0 THEN 1 ELSE 0 END) AS tracker_count \
     FROM adblock_stats WHERE time >= ?1 AND time <= ?2 AND host_name != '' \
     GROUP BY host_name ORDER BY total DESC, host_name ASC";

const STATS_BY_ORIGIN_SQL: &str = "SELECT origin_host, COUNT(*) AS total, \
     SUM(CASE WHEN type = 1 THEN 1 ELSE 0 END) AS ad_count, \
     SUM(CASE WHEN type = 0 THEN 1 ELSE 0 END) AS tracker_count \
     FROM adblock_stats WHERE time >= ?1 AND time <= ?2 AND origin_host != '' \
     GROUP BY origin_host ORDER BY total DESC, origin_host ASC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Pending,
    Ready,
    Failed,
}

struct StoredRow {
    host_name: String,
    origin_host: String,
    time: i64,
    kind: i64,
}

pub struct StatsDatabase {
    path: PathBuf,
    conn: Option<Connection>,
    status: InitStatus,
    recovery_attempted: bool,
}

impl StatsDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            status: InitStatus::Pending,
            recovery_attempted: false,
        }
    }

    pub fn status(&self) -> InitStatus {
        self.status
    }

    pub fn add_entry(&mut self, host: &str, origin_host: &str, time: SystemTime, group: RuleGroup) {
        self.run("add entry", |conn| {
            insert_row(conn, host, origin_host, to_micros(time), group)
        });
    }

    /// Delete rows in `[begin, end]`. An emptied table restarts reporting.
    pub fn clear(&mut self, begin: SystemTime, end: SystemTime) {
        self.run("clear", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM adblock_stats WHERE time >= ?1 AND time <= ?2",
                params![to_micros(begin), to_micros(end)],
            )?;
            let any_left = tx
                .query_row("SELECT 1 FROM adblock_stats LIMIT 1", [], |_| Ok(()))
                .optional()?
                .is_some();
            if !any_left {
                set_reporting_start(&tx, to_micros(SystemTime::now()))?;
            }
            tx.commit()
        });
    }

    /// Insert aggregated counters as individual rows at their reporting start.
    pub fn import(&mut self, data: &StatsData) {
        let time = data.reporting_start.map_or_else(|| to_micros(SystemTime::now()), to_micros);
        self.run("import", |conn| {
            let tx = conn.transaction()?;
            for entry in &data.trackers {
                insert_counts(&tx, &entry.host, "", time, entry)?;
            }
            for entry in &data.websites {
                insert_counts(&tx, "", &entry.host, time, entry)?;
            }
            set_reporting_start(&tx, time)?;
            tx.commit()
        });
    }

    /// Aggregated stats in `[begin, end]`; `None` when the database is unusable.
    pub fn get_stats(&mut self, begin: SystemTime, end: SystemTime) -> Option<StatsData> {
        self.run("get stats", |conn| {
            let mut data = StatsData::default();
            let (from, to) = (to_micros(begin), to_micros(end));
            for (sql, kind) in [
                (STATS_BY_HOST_SQL, EntryType::TrackerAndAds),
                (STATS_BY_ORIGIN_SQL, EntryType::Website),
            ] {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt.query_map(params![from, to], |row| {
                    Ok(StatsEntry {
                        host: row.get(0)?,
                        ad_count: row.get(2)?,
                        tracker_count: row.get(3)?,
                    })
                })?;
                for entry in rows {
                    data.add_entry(entry?, kind);
                }
            }
            data.reporting_start = reporting_start(conn)?.map(from_micros);
            Ok(data)
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run `op` against an initialized database, recovering from corruption
    /// once.
    fn run<T>(&mut self, what: &str, op: impl Fn(&mut Connection) -> rusqlite::Result<T>) -> Option<T> {
        let conn = self.connection()?;
        match op(conn) {
            Ok(value) => Some(value),
            Err(e) if is_corruption(&e) => {
                log::warn!("stats database corrupt during {what}: {e}");
                if !self.recover() {
                    return None;
                }
                let conn = self.conn.as_mut()?;
                match op(conn) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        self.fail(&format!("{what} after recovery: {e}"));
                        None
                    }
                }
            }
            Err(e) => {
                log::warn!("stats {what} failed: {e}");
                None
            }
        }
    }

    fn connection(&mut self) -> Option<&mut Connection> {
        match self.status {
            InitStatus::Failed => return None,
            InitStatus::Ready => return self.conn.as_mut(),
            InitStatus::Pending => {}
        }

        match open_database(&self.path) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.status = InitStatus::Ready;
            }
            Err(StatsError::Sqlite(e)) if is_corruption(&e) => {
                log::warn!("stats database {} is corrupt: {e}", self.path.display());
                if !self.recover() {
                    return None;
                }
            }
            Err(e) => {
                self.fail(&format!("cannot open {}: {e}", self.path.display()));
                return None;
            }
        }
        self.conn.as_mut()
    }

    /// Salvage what can be read, move the file aside and start over.
    fn recover(&mut self) -> bool {
        if self.recovery_attempted {
            self.fail("corrupt again after recovery");
            return false;
        }
        self.recovery_attempted = true;
        self.conn = None;

        let salvaged = salvage_rows(&self.path);
        let reporting = salvage_reporting_start(&self.path);
        let aside = self.path.with_extension("corrupt");
        if let Err(e) = std::fs::rename(&self.path, &aside) {
            if let Err(e2) = std::fs::remove_file(&self.path) {
                self.fail(&format!("cannot move corrupt database aside: {e}, {e2}"));
                return false;
            }
        }

        let result = open_database(&self.path).and_then(|mut conn| {
            let tx = conn.transaction()?;
            for row in &salvaged {
                tx.execute(
                    "INSERT INTO adblock_stats (host_name, origin_host, time, type) VALUES (?1, ?2, ?3, ?4)",
                    params![row.host_name, row.origin_host, row.time, row.kind],
                )?;
            }
            if let Some(start) = reporting {
                set_reporting_start(&tx, start)?;
            }
            tx.commit()?;
            Ok(conn)
        });

        match result {
            Ok(conn) => {
                log::warn!(
                    "recovered stats database {} with {} rows",
                    self.path.display(),
                    salvaged.len()
                );
                self.conn = Some(conn);
                self.status = InitStatus::Ready;
                true
            }
            Err(e) => {
                self.fail(&format!("recovery failed: {e}"));
                false
            }
        }
    }

    fn fail(&mut self, reason: &str) {
        log::error!("stats database {} disabled: {reason}", self.path.display());
        self.conn = None;
        self.status = InitStatus::Failed;
    }
}

fn open_database(path: &Path) -> Result<Connection, StatsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    init_tables(&mut conn)?;
    Ok(conn)
}

fn init_tables(conn: &mut Connection) -> Result<(), StatsError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StatsError::NewerSchema(version));
    }

    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS adblock_stats (
             host_name VARCHAR NOT NULL,
             origin_host VARCHAR NOT NULL,
             time INTEGER NOT NULL,
             type INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS adblock_stats_host_index ON adblock_stats (host_name);
         CREATE INDEX IF NOT EXISTS adblock_stats_origin_index ON adblock_stats (origin_host);
         CREATE TABLE IF NOT EXISTS meta (
             key TEXT PRIMARY KEY NOT NULL,
             value TEXT NOT NULL
         );",
    )?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    if reporting_start(&tx)?.is_none() {
        set_reporting_start(&tx, to_micros(SystemTime::now()))?;
    }
    tx.commit()?;
    Ok(())
}

fn insert_row(conn: &Connection, host: &str, origin_host: &str, time: i64, group: RuleGroup) -> rusqlite::Result<()> {
    conn.prepare_cached("INSERT INTO adblock_stats (host_name, origin_host, time, type) VALUES (?1, ?2, ?3, ?4)")?
        .execute(params![host, origin_host, time, group.index() as i64])?;
    Ok(())
}

fn insert_counts(conn: &Connection, host: &str, origin_host: &str, time: i64, entry: &StatsEntry) -> rusqlite::Result<()> {
    for _ in 0..entry.ad_count {
        insert_row(conn, host, origin_host, time, RuleGroup::AdBlockingRules)?;
    }
    for _ in 0..entry.tracker_count {
        insert_row(conn, host, origin_host, time, RuleGroup::TrackingRules)?;
    }
    Ok(())
}

fn reporting_start(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [REPORTING_START_KEY], |row| row.get(0))
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

fn set_reporting_start(conn: &Connection, micros: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![REPORTING_START_KEY, micros.to_string()],
    )?;
    Ok(())
}

/// Rows readable from a damaged file, stopping at the first bad page.
fn salvage_rows(path: &Path) -> Vec<StoredRow> {
    let mut rows = Vec::new();
    let Ok(conn) = Connection::open(path) else {
        return rows;
    };
    let Ok(mut stmt) = conn.prepare("SELECT host_name, origin_host, time, type FROM adblock_stats") else {
        return rows;
    };
    let Ok(mut cursor) = stmt.query([]) else {
        return rows;
    };
    while let Ok(Some(row)) = cursor.next() {
        match read_stored_row(row) {
            Ok(stored) => rows.push(stored),
            Err(_) => break,
        }
    }
    rows
}

fn read_stored_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        host_name: row.get(0)?,
        origin_host: row.get(1)?,
        time: row.get(2)?,
        kind: row.get(3)?,
    })
}

fn salvage_reporting_start(path: &Path) -> Option<i64> {
    let conn = Connection::open(path).ok()?;
    reporting_start(&conn).ok().flatten()
}

fn is_corruption(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

pub(crate) fn to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

pub(crate) fn from_micros(micros: i64) -> SystemTime {
    if micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn aggregates_by_host_and_origin() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StatsDatabase::new(dir.path().join("stats.db"));
        let t0 = at(1_700_000_000);

        for _ in 0..3 {
            db.add_entry("ads.net", "a.com", t0, RuleGroup::AdBlockingRules);
        }
        db.add_entry("trk.net", "a.com", t0, RuleGroup::TrackingRules);
        db.add_entry("ads.net", "b.com", t0, RuleGroup::AdBlockingRules);
        db.add_entry("ads.net", "b.com", t0, RuleGroup::AdBlockingRules);

        let stats = db
            .get_stats(t0 - Duration::from_secs(1), t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(db.status(), InitStatus::Ready);

        assert_eq!(stats.total_ads_blocked(), 5);
        assert_eq!(stats.total_trackers_blocked(), 1);
        assert_eq!(
            stats.websites,
            vec![
                StatsEntry::new("a.com", 3, 1),
                StatsEntry::new("b.com", 2, 0),
            ]
        );
        assert_eq!(
            stats.trackers,
            vec![StatsEntry::new("ads.net", 5, 0), StatsEntry::new("trk.net", 0, 1)]
        );
        assert!(stats.reporting_start.is_some());
    }

    #[test]
    fn range_excludes_other_times() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StatsDatabase::new(dir.path().join("stats.db"));
        db.add_entry("ads.net", "a.com", at(100), RuleGroup::AdBlockingRules);
        db.add_entry("ads.net", "a.com", at(200), RuleGroup::AdBlockingRules);

        let stats = db.get_stats(at(150), at(250)).unwrap();
        assert_eq!(stats.total_ads_blocked(), 1);
    }

    #[test]
    fn clearing_everything_restarts_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StatsDatabase::new(dir.path().join("stats.db"));
        db.import(&StatsData {
            trackers: vec![StatsEntry::new("ads.net", 1, 0)],
            websites: Vec::new(),
            reporting_start: Some(at(10)),
        });
        assert_eq!(db.get_stats(at(0), at(20)).unwrap().reporting_start, Some(at(10)));

        db.add_entry("trk.net", "a.com", at(50), RuleGroup::TrackingRules);
        db.clear(at(0), at(20));
        let kept = db.get_stats(at(0), at(100)).unwrap();
        assert_eq!(kept.total_trackers_blocked(), 1);
        assert_eq!(kept.reporting_start, Some(at(10)));

        db.clear(at(0), at(100));
        let emptied = db.get_stats(at(0), at(100)).unwrap();
        assert!(emptied.trackers.is_empty());
        assert!(emptied.reporting_start.unwrap() > at(100));
    }

    #[test]
    fn import_writes_rows_at_reporting_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = StatsDatabase::new(dir.path().join("stats.db"));
        db.import(&StatsData {
            trackers: vec![StatsEntry::new("ads.net", 2, 1)],
            websites: vec![StatsEntry::new("a.com", 2, 1)],
            reporting_start: Some(at(1_000)),
        });

        let stats = db.get_stats(at(1_000), at(1_000)).unwrap();
        assert_eq!(stats.trackers, vec![StatsEntry::new("ads.net", 2, 1)]);
        assert_eq!(stats.websites, vec![StatsEntry::new("a.com", 2, 1)]);
    }

    #[test]
    fn garbage_file_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();

        let mut db = StatsDatabase::new(&path);
        db.add_entry("ads.net", "a.com", at(5), RuleGroup::AdBlockingRules);
        assert_eq!(db.status(), InitStatus::Ready);
        assert_eq!(db.get_stats(at(0), at(10)).unwrap().total_ads_blocked(), 1);
        assert!(path.with_extension("corrupt").exists());
    }

    #[test]
    fn unopenable_database_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be cannot be opened.
        let path = dir.path().join("stats.db");
        std::fs::create_dir(&path).unwrap();

        let mut db = StatsDatabase::new(&path);
        db.add_entry("ads.net", "a.com", at(5), RuleGroup::AdBlockingRules);
        assert_eq!(db.status(), InitStatus::Failed);
        assert!(db.get_stats(at(0), at(10)).is_none());
    }

    #[test]
    fn micros_round_trip() {
        let t = at(1_700_000_000) + Duration::from_micros(42);
        assert_eq!(from_micros(to_micros(t)), t);
        assert_eq!(to_micros(UNIX_EPOCH), 0);
    }
}
