use chrono::{DateTime, SecondsFormat, Utc};
use fsc_core::{CacheEntry, Experiment, ExperimentFlag, Job, JobStatus, ModelError};
use rusqlite::{params, Connection, OptionalExtension, Params};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const STATUS_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("status store lock poisoned")]
    Poisoned,
    #[error("invalid stored experiment: {0}")]
    Model(#[from] ModelError),
}

/// Who asked for a write. Automatic polls may not touch terminal entries;
/// operator actions (cancel, explicit refresh) may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Poll,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted {
        status: JobStatus,
    },
    Changed {
        previous: JobStatus,
        current: JobStatus,
    },
    /// Same observation as stored; only `cached_at` moved.
    Unchanged,
    /// Terminal entry kept as is; nothing written.
    RetainedTerminal,
}

impl UpsertOutcome {
    pub fn wrote_change(&self) -> bool {
        matches!(
            self,
            UpsertOutcome::Inserted { .. } | UpsertOutcome::Changed { .. }
        )
    }

    pub fn status_changed(&self) -> bool {
        matches!(self, UpsertOutcome::Changed { previous, current } if previous != current)
    }

    pub fn became_terminal(&self) -> bool {
        match self {
            UpsertOutcome::Inserted { status } => status.is_terminal(),
            UpsertOutcome::Changed { previous, current } => {
                !previous.is_terminal() && current.is_terminal()
            }
            UpsertOutcome::Unchanged | UpsertOutcome::RetainedTerminal => false,
        }
    }
}

/// Retention rule applied on every upsert: terminal entries are only
/// overwritten by operator actions, never by automatic polling.
pub fn may_overwrite(entry: &CacheEntry, origin: UpdateOrigin) -> bool {
    !entry.terminal || origin == UpdateOrigin::Operator
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub terminal: usize,
    pub jobs: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    pub oldest_cached_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl CacheStats {
    pub fn active(&self) -> usize {
        self.total - self.terminal
    }
}

/// One reconciliation run as written to `sync_log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub seen: usize,
    pub updated: usize,
    pub corrected: usize,
    pub error_count: usize,
    pub first_error: Option<String>,
}

pub struct StatusStore {
    conn: Mutex<Connection>,
}

impl StatusStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        schema_version(&conn)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .lock()?
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    /// Writes one experiment and its jobs in a single transaction, subject to
    /// [`may_overwrite`].
    pub fn upsert(
        &self,
        experiment: &Experiment,
        origin: UpdateOrigin,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing = load_entry(&tx, experiment.name())?;

        let outcome = match existing {
            Some(entry) if !may_overwrite(&entry, origin) => UpsertOutcome::RetainedTerminal,
            Some(entry) if entry.experiment.same_observation(experiment) => {
                tx.execute(
                    "UPDATE experiments SET cached_at = ?2 WHERE name = ?1",
                    params![experiment.name(), format_timestamp(now)],
                )?;
                UpsertOutcome::Unchanged
            }
            Some(entry) => {
                let terminal_at = entry.terminal_at.filter(|_| entry.terminal).unwrap_or(now);
                write_experiment(&tx, experiment, now, terminal_at)?;
                UpsertOutcome::Changed {
                    previous: entry.experiment.status(),
                    current: experiment.status(),
                }
            }
            None => {
                write_experiment(&tx, experiment, now, now)?;
                UpsertOutcome::Inserted {
                    status: experiment.status(),
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get(&self, name: &str) -> Result<CacheEntry, StorageError> {
        self.find(name)?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    pub fn find(&self, name: &str) -> Result<Option<CacheEntry>, StorageError> {
        let conn = self.lock()?;
        load_entry(&conn, name)
    }

    /// Entries with the given aggregate status, most recent activity first.
    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<CacheEntry>, StorageError> {
        let conn = self.lock()?;
        load_entries(
            &conn,
            "
            SELECT name FROM experiments
            WHERE status = ?1
            ORDER BY updated_at DESC, name ASC
            ",
            [status.as_str()],
        )
    }

    pub fn list_all(&self) -> Result<Vec<CacheEntry>, StorageError> {
        let conn = self.lock()?;
        load_entries(
            &conn,
            "SELECT name FROM experiments ORDER BY updated_at DESC, name ASC",
            [],
        )
    }

    /// Names of non-terminal entries, most recent activity first.
    pub fn active_names(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "
            SELECT name FROM experiments
            WHERE terminal = 0
            ORDER BY updated_at DESC, name ASC
            ",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Removes one entry. Only explicit cache commands call this.
    pub fn evict(&self, name: &str) -> Result<bool, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobs WHERE experiment_name = ?1", [name])?;
        let removed = tx.execute("DELETE FROM experiments WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobs", [])?;
        let removed = tx.execute("DELETE FROM experiments", [])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats, StorageError> {
        let conn = self.lock()?;
        let mut stats = CacheStats::default();

        let mut statement = conn.prepare(
            "
            SELECT status, COUNT(*), SUM(terminal)
            FROM experiments
            GROUP BY status
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (status, count, terminal) = row?;
            let count = count as usize;
            *stats.by_status.entry(parse_status(&status)?).or_default() += count;
            stats.total += count;
            stats.terminal += terminal as usize;
        }

        stats.jobs = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get::<_, i64>(0))?
            as usize;
        stats.oldest_cached_at = conn
            .query_row("SELECT MIN(cached_at) FROM experiments", [], |row| {
                row.get::<_, Option<String>>(0)
            })?
            .map(parse_timestamp)
            .transpose()?;
        stats.last_sync_at = conn
            .query_row("SELECT MAX(finished_at) FROM sync_log", [], |row| {
                row.get::<_, Option<String>>(0)
            })?
            .map(parse_timestamp)
            .transpose()?;
        Ok(stats)
    }

    pub fn record_sync(&self, record: &SyncRecord) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO sync_log (
                scope,
                started_at,
                finished_at,
                seen,
                updated,
                corrected,
                error_count,
                first_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                record.scope,
                format_timestamp(record.started_at),
                format_timestamp(record.finished_at),
                record.seen as i64,
                record.updated as i64,
                record.corrected as i64,
                record.error_count as i64,
                record.first_error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_syncs(&self, limit: usize) -> Result<Vec<SyncRecord>, StorageError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "
            SELECT scope, started_at, finished_at, seen, updated, corrected, error_count, first_error
            FROM sync_log
            ORDER BY id DESC
            LIMIT ?1
            ",
        )?;
        let rows = statement.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (scope, started_at, finished_at, seen, updated, corrected, error_count, first_error) =
                row?;
            records.push(SyncRecord {
                scope,
                started_at: parse_timestamp(started_at)?,
                finished_at: parse_timestamp(finished_at)?,
                seen: seen as usize,
                updated: updated as usize,
                corrected: corrected as usize,
                error_count: error_count as usize,
                first_error,
            });
        }
        Ok(records)
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let mut current = schema_version(conn)?;
    if current > STATUS_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: STATUS_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_status_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        current = 1;
    }

    if current < 2 {
        let sql = include_str!("../migrations/0002_sync_log.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
    }

    Ok(())
}

fn write_experiment(
    conn: &Connection,
    experiment: &Experiment,
    now: DateTime<Utc>,
    terminal_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    let flags_json = serde_json::to_string(&experiment.flags)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let terminal = experiment.is_terminal();

    conn.execute(
        "
        INSERT INTO experiments (
            name,
            status,
            cluster,
            flags_json,
            job_count,
            service,
            workspace,
            job_url,
            size,
            description,
            submitted_at,
            updated_at,
            cached_at,
            terminal,
            terminal_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(name) DO UPDATE SET
            status=excluded.status,
            cluster=excluded.cluster,
            flags_json=excluded.flags_json,
            job_count=excluded.job_count,
            service=excluded.service,
            workspace=excluded.workspace,
            job_url=excluded.job_url,
            size=excluded.size,
            description=excluded.description,
            submitted_at=excluded.submitted_at,
            updated_at=excluded.updated_at,
            cached_at=excluded.cached_at,
            terminal=excluded.terminal,
            terminal_at=excluded.terminal_at
        ",
        params![
            experiment.name(),
            experiment.status().as_str(),
            experiment.cluster,
            flags_json,
            i64::from(experiment.job_count),
            experiment.service,
            experiment.workspace,
            experiment.job_url,
            experiment.size,
            experiment.description,
            experiment.submitted_at.map(format_timestamp),
            format_timestamp(experiment.updated_at),
            format_timestamp(now),
            terminal,
            terminal.then(|| format_timestamp(terminal_at)),
        ],
    )?;

    conn.execute(
        "DELETE FROM jobs WHERE experiment_name = ?1",
        [experiment.name()],
    )?;
    let mut insert = conn.prepare(
        "
        INSERT INTO jobs (
            experiment_name,
            job_index,
            name,
            status,
            started_at,
            duration,
            log_url
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
    )?;
    for job in experiment.jobs() {
        insert.execute(params![
            experiment.name(),
            i64::from(job.index),
            job.name,
            job.status.as_str(),
            job.started_at.map(format_timestamp),
            job.duration,
            job.log_url,
        ])?;
    }
    Ok(())
}

struct ExperimentRow {
    name: String,
    cluster: Option<String>,
    flags_json: String,
    job_count: i64,
    service: Option<String>,
    workspace: Option<String>,
    job_url: Option<String>,
    size: Option<String>,
    description: Option<String>,
    submitted_at: Option<String>,
    updated_at: String,
    cached_at: String,
    terminal: bool,
    terminal_at: Option<String>,
}

impl ExperimentRow {
    fn into_entry(self, jobs: Vec<Job>) -> Result<CacheEntry, StorageError> {
        let flags: BTreeSet<ExperimentFlag> = serde_json::from_str(&self.flags_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let mut experiment = Experiment::new(self.name, jobs, parse_timestamp(self.updated_at)?)?;
        experiment.cluster = self.cluster;
        experiment.flags = flags;
        experiment.job_count = u32::try_from(self.job_count)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        experiment.service = self.service;
        experiment.workspace = self.workspace;
        experiment.job_url = self.job_url;
        experiment.size = self.size;
        experiment.description = self.description;
        experiment.submitted_at = self.submitted_at.map(parse_timestamp).transpose()?;

        Ok(CacheEntry {
            experiment,
            cached_at: parse_timestamp(self.cached_at)?,
            terminal: self.terminal,
            terminal_at: self.terminal_at.map(parse_timestamp).transpose()?,
        })
    }
}

fn load_entry(conn: &Connection, name: &str) -> Result<Option<CacheEntry>, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT name, cluster, flags_json, job_count, service, workspace, job_url, size,
                   description, submitted_at, updated_at, cached_at, terminal, terminal_at
            FROM experiments
            WHERE name = ?1
            ",
            [name],
            |row| {
                Ok(ExperimentRow {
                    name: row.get(0)?,
                    cluster: row.get(1)?,
                    flags_json: row.get(2)?,
                    job_count: row.get(3)?,
                    service: row.get(4)?,
                    workspace: row.get(5)?,
                    job_url: row.get(6)?,
                    size: row.get(7)?,
                    description: row.get(8)?,
                    submitted_at: row.get(9)?,
                    updated_at: row.get(10)?,
                    cached_at: row.get(11)?,
                    terminal: row.get(12)?,
                    terminal_at: row.get(13)?,
                })
            },
        )
        .optional()?;

    match row {
        Some(row) => {
            let jobs = load_jobs(conn, name)?;
            Ok(Some(row.into_entry(jobs)?))
        }
        None => Ok(None),
    }
}

/// Runs a `SELECT name ...` query and loads every matching entry while the
/// caller holds the connection, so the list is one consistent snapshot.
fn load_entries<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<CacheEntry>, StorageError> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params, |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        if let Some(entry) = load_entry(conn, &name)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn load_jobs(conn: &Connection, experiment_name: &str) -> Result<Vec<Job>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT job_index, name, status, started_at, duration, log_url
        FROM jobs
        WHERE experiment_name = ?1
        ORDER BY job_index ASC
        ",
    )?;
    let rows = statement.query_map([experiment_name], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut jobs = Vec::new();
    for row in rows {
        let (index, name, status, started_at, duration, log_url) = row?;
        let index =
            u32::try_from(index).map_err(|err| StorageError::Serialization(err.to_string()))?;
        let mut job = Job::new(index, name, parse_status(&status)?);
        job.started_at = started_at.map(parse_timestamp).transpose()?;
        job.duration = duration;
        job.log_url = log_url;
        jobs.push(job);
    }
    Ok(jobs)
}

fn parse_status(value: &str) -> Result<JobStatus, StorageError> {
    value.parse::<JobStatus>().map_err(StorageError::Serialization)
}

// Fixed precision keeps lexical order equal to chronological order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
