use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, SubsecRound as _, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::domain::{DomainError, State, validate_page, validate_page_size};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS mutation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        old_value TEXT NOT NULL,
        new_value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mutation_log_order
    ON mutation_log(timestamp DESC, id DESC);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum AuditLogError {
    Domain(DomainError),
    Io(io::Error),
    Sqlite(rusqlite::Error),
    SerdeJson(serde_json::Error),
    InvalidTimestamp { id: i64, value: String },
    Poisoned,
}

impl AuditLogError {
    /// Everything except rejected arguments means the durable medium misbehaved.
    pub fn is_storage_failure(&self) -> bool {
        !matches!(self, Self::Domain(_))
    }
}

impl std::fmt::Display for AuditLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::InvalidTimestamp { id, value } => {
                write!(f, "invalid timestamp in record {id}: {value:?}")
            }
            Self::Poisoned => write!(f, "audit log connection lock poisoned"),
        }
    }
}

impl std::error::Error for AuditLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::InvalidTimestamp { .. } | Self::Poisoned => None,
        }
    }
}

impl From<DomainError> for AuditLogError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<io::Error> for AuditLogError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for AuditLogError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for AuditLogError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub previous_state: State,
    pub resulting_state: State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    pub records: Vec<MutationRecord>,
    pub total: u64,
}

/// Fixed-width RFC 3339 so that lexical order in SQLite matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct Writer {
    db: Connection,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only mutation history backed by SQLite.
///
/// Appends go through a dedicated writer connection; pagination uses a second
/// connection so readers never queue behind an in-flight insert (WAL mode).
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<Writer>,
    reader: Mutex<Connection>,
}

impl AuditLog {
    /// Opens (creating if needed) the database at `path`. Safe to call on every start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let db = open_connection(path)?;
        db.execute_batch(SCHEMA)?;
        let last_timestamp = load_last_timestamp(&db)?;
        let reader = open_connection(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Writer { db, last_timestamp }),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably records one transition. Returns only after the insert committed.
    pub fn append(
        &self,
        previous_state: &State,
        resulting_state: &State,
    ) -> Result<MutationRecord, AuditLogError> {
        let old_value = serde_json::to_string(previous_state)?;
        let new_value = serde_json::to_string(resulting_state)?;

        let mut guard = self.writer.lock().map_err(|_| AuditLogError::Poisoned)?;
        let writer = &mut *guard;

        // Wall clock may step backwards; stored timestamps must not.
        let now = Utc::now().trunc_subsecs(6);
        let timestamp = match writer.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };

        writer.db.execute(
            "INSERT INTO mutation_log (timestamp, old_value, new_value) VALUES (?1, ?2, ?3)",
            params![format_timestamp(timestamp), old_value, new_value],
        )?;
        let id = writer.db.last_insert_rowid();
        writer.last_timestamp = Some(timestamp);

        Ok(MutationRecord {
            id,
            timestamp,
            previous_state: previous_state.clone(),
            resulting_state: resulting_state.clone(),
        })
    }

    /// Most recent first. `page` is 1-indexed.
    pub fn page(&self, page: i64, limit: i64) -> Result<LogPage, AuditLogError> {
        validate_page(page)?;
        validate_page_size(limit)?;
        let offset = (page - 1).saturating_mul(limit);

        let mut reader = self.reader.lock().map_err(|_| AuditLogError::Poisoned)?;
        // Count and slice share one read snapshot.
        let tx = reader.transaction()?;
        let total: i64 = tx.query_row("SELECT COUNT(*) FROM mutation_log", [], |row| row.get(0))?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT id, timestamp, old_value, new_value
                 FROM mutation_log
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![limit, offset], RawRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;

        let records = rows
            .into_iter()
            .map(RawRecord::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LogPage {
            records,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    pub fn count(&self) -> Result<u64, AuditLogError> {
        let reader = self.reader.lock().map_err(|_| AuditLogError::Poisoned)?;
        let total: i64 =
            reader.query_row("SELECT COUNT(*) FROM mutation_log", [], |row| row.get(0))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    #[cfg(test)]
    pub(crate) fn all_records(&self) -> Result<Vec<MutationRecord>, AuditLogError> {
        let reader = self.reader.lock().map_err(|_| AuditLogError::Poisoned)?;
        let mut stmt = reader.prepare(
            "SELECT id, timestamp, old_value, new_value FROM mutation_log ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::decode).collect()
    }

    /// Makes every subsequent append fail as if the disk rejected the write.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self) {
        let writer = self.writer.lock().unwrap();
        writer.db.execute_batch("PRAGMA query_only = ON;").unwrap();
    }
}

fn open_connection(path: &Path) -> Result<Connection, AuditLogError> {
    let db = Connection::open(path)?;
    db.busy_timeout(BUSY_TIMEOUT)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
    Ok(db)
}

fn load_last_timestamp(db: &Connection) -> Result<Option<DateTime<Utc>>, AuditLogError> {
    let row: Option<(i64, String)> = db
        .query_row(
            "SELECT id, timestamp FROM mutation_log ORDER BY timestamp DESC, id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(id, value)| parse_timestamp(id, value)).transpose()
}

fn parse_timestamp(id: i64, value: String) -> Result<DateTime<Utc>, AuditLogError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| AuditLogError::InvalidTimestamp { id, value })
}

struct RawRecord {
    id: i64,
    timestamp: String,
    old_value: String,
    new_value: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            old_value: row.get(2)?,
            new_value: row.get(3)?,
        })
    }

    fn decode(self) -> Result<MutationRecord, AuditLogError> {
        Ok(MutationRecord {
            id: self.id,
            timestamp: parse_timestamp(self.id, self.timestamp)?,
            previous_state: serde_json::from_str(&self.old_value)?,
            resulting_state: serde_json::from_str(&self.new_value)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn state(counter: i64, message: &str) -> State {
        State {
            counter,
            message: message.to_string(),
        }
    }

    fn append_chain(log: &AuditLog, n: i64) -> Vec<MutationRecord> {
        let mut prev = State::default();
        let mut out = Vec::new();
        for i in 1..=n {
            let next = state(i, "x");
            out.push(log.append(&prev, &next).unwrap());
            prev = next;
        }
        out
    }

    #[test]
    fn open_creates_database_and_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/logs.db");

        let log = AuditLog::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(log.path(), path.as_path());
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn append_assigns_increasing_ids_and_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();

        let records = append_chain(&log, 5);

        for pair in records.windows(2) {
            assert_eq!(pair[1].id, pair[0].id + 1);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
        assert_eq!(log.count().unwrap(), 5);
    }

    #[test]
    fn appended_record_matches_stored_row() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();

        let record = log.append(&state(0, "initial"), &state(7, "hi")).unwrap();

        assert_eq!(log.all_records().unwrap(), vec![record]);
    }

    #[test]
    fn reopen_is_idempotent_and_keeps_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs.db");

        let log = AuditLog::open(&path).unwrap();
        let before = append_chain(&log, 3);
        drop(log);

        let _first = AuditLog::open(&path).unwrap();
        let log = AuditLog::open(&path).unwrap();

        assert_eq!(log.all_records().unwrap(), before);

        let next = log.append(&state(3, "x"), &state(4, "x")).unwrap();
        assert_eq!(next.id, before[2].id + 1);
        assert!(next.timestamp >= before[2].timestamp);
    }

    #[test]
    fn pages_are_most_recent_first() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();
        append_chain(&log, 15);

        let first = log.page(1, 10).unwrap();
        assert_eq!(first.total, 15);
        let ids: Vec<i64> = first.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, (6..=15).rev().collect::<Vec<_>>());

        let second = log.page(2, 10).unwrap();
        assert_eq!(second.total, 15);
        let ids: Vec<i64> = second.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=5).rev().collect::<Vec<_>>());

        let past_end = log.page(3, 10).unwrap();
        assert!(past_end.records.is_empty());
        assert_eq!(past_end.total, 15);
    }

    #[test]
    fn identical_timestamps_break_ties_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();
        {
            let writer = log.writer.lock().unwrap();
            for i in 1..=3 {
                writer
                    .db
                    .execute(
                        "INSERT INTO mutation_log (timestamp, old_value, new_value) VALUES (?1, ?2, ?3)",
                        params![
                            "2026-01-01T00:00:00.000000Z",
                            serde_json::to_string(&state(i - 1, "x")).unwrap(),
                            serde_json::to_string(&state(i, "x")).unwrap()
                        ],
                    )
                    .unwrap();
            }
        }

        let page = log.page(1, 10).unwrap();
        let ids: Vec<i64> = page.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn page_rejects_out_of_range_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();

        for (page, limit) in [(0, 10), (-1, 10), (1, 0), (1, 101)] {
            let err = log.page(page, limit).unwrap_err();
            assert!(matches!(err, AuditLogError::Domain(_)), "{page}/{limit}");
            assert!(!err.is_storage_failure());
        }
        assert!(log.page(1, 100).is_ok());
    }

    #[test]
    fn huge_page_number_returns_empty_slice() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();
        append_chain(&log, 2);

        let page = log.page(i64::MAX, 100).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total, 2);
    }

    #[test]
    fn failed_write_surfaces_storage_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();
        log.fail_writes();

        let err = log.append(&State::default(), &state(1, "x")).unwrap_err();

        assert!(err.is_storage_failure());
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn corrupt_row_is_reported_not_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join("logs.db")).unwrap();
        {
            let writer = log.writer.lock().unwrap();
            writer
                .db
                .execute(
                    "INSERT INTO mutation_log (timestamp, old_value, new_value) VALUES (?1, ?2, ?3)",
                    params!["not-a-time", "{}", "{}"],
                )
                .unwrap();
        }

        let err = log.page(1, 10).unwrap_err();
        assert!(err.is_storage_failure());
    }
}
