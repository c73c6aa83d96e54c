//! SQLite-backed broker and delayed store.
//!
//! A single database file is shared by the daemon, its workers and the
//! scheduler, each running as its own OS process. WAL journaling plus a busy
//! timeout lets them write concurrently; every claim is a single statement or
//! a single transaction so no job is ever handed out twice.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{
    AssignedJob, Broker, CoreError, CoreErrorKind, CoreResult, DelayedStore, Grab, GrabMode,
    JobEnvelope, JobHandle, JobId, JobOutcome,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        function TEXT NOT NULL,
        priority INTEGER NOT NULL,
        payload TEXT NOT NULL,
        background INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued', 'running', 'done')),
        worker_pid INTEGER,
        result TEXT,
        created_at INTEGER NOT NULL,
        finished_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(function, status, priority DESC, seq)",
    "CREATE TABLE IF NOT EXISTS delayed_jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        function TEXT NOT NULL,
        background INTEGER NOT NULL,
        due_at INTEGER NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_delayed_due ON delayed_jobs(due_at, seq)",
    "CREATE TABLE IF NOT EXISTS failed_delayed_jobs (
        id TEXT NOT NULL,
        function TEXT NOT NULL,
        background INTEGER NOT NULL,
        due_at INTEGER NOT NULL,
        payload TEXT NOT NULL,
        reason TEXT NOT NULL,
        failed_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workers (
        function TEXT NOT NULL,
        pid INTEGER NOT NULL,
        registered_at INTEGER NOT NULL,
        PRIMARY KEY (function, pid)
    )",
];

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long an unread foreground result is kept
const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(300);

/// Broker and delayed store over one SQLite database
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    poll_interval: Duration,
    result_ttl: Duration,
}

impl SqliteBackend {
    /// Connects to a `sqlite:` URL, creating the database if missing
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unparsable URL and `Transport` if the
    /// database cannot be opened or initialized.
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url).map_err(|e| {
            CoreError::from(CoreErrorKind::Configuration {
                reason: format!("invalid database url '{url}': {e}"),
            })
        })?;
        Self::connect_with(options).await
    }

    /// Opens a database file by path
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the database cannot be opened or initialized.
    pub async fn open(path: &Path) -> CoreResult<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> CoreResult<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            result_ttl: DEFAULT_RESULT_TTL,
        };
        backend.init_schema().await?;
        debug!("SQLite backend ready");
        Ok(backend)
    }

    /// Sets how often blocking waits re-check the database
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long a finished foreground job waits for its submitter.
    ///
    /// Results nobody read within this time are purged.
    #[must_use]
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    async fn purge_expired_results(&self) -> CoreResult<u64> {
        let ttl = chrono::Duration::from_std(self.result_ttl).unwrap_or(chrono::Duration::MAX);
        let horizon = Utc::now().checked_sub_signed(ttl).map_or(i64::MIN, millis);
        let purged = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND finished_at < ?")
            .bind(horizon)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            debug!(purged, "Expired job results purged");
        }
        Ok(purged)
    }

    async fn init_schema(&self) -> CoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn try_claim(&self, function: &str, worker: u32) -> CoreResult<Option<AssignedJob>> {
        let row = sqlx::query(
            "UPDATE jobs SET status = 'running', worker_pid = ?
             WHERE seq = (
                 SELECT seq FROM jobs
                 WHERE function = ? AND status = 'queued'
                 ORDER BY priority DESC, seq ASC
                 LIMIT 1
             )
             RETURNING id, payload",
        )
        .bind(i64::from(worker))
        .bind(function)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> CoreResult<AssignedJob> {
            let id: String = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            Ok(AssignedJob {
                handle: JobHandle {
                    id: JobId::from(id),
                    function: function.to_string(),
                },
                payload,
            })
        })
        .transpose()
    }

    async fn take_result(&self, handle: &JobHandle) -> CoreResult<Option<JobOutcome>> {
        let row = sqlx::query(
            "DELETE FROM jobs WHERE id = ? AND status = 'done' RETURNING result",
        )
        .bind(handle.id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.try_get("result")?;
        let result = raw
            .map(|text| serde_json::from_str::<Value>(&text))
            .transpose()
            .map_err(|e| CoreError::malformed(format!("stored result: {e}")))?
            .filter(|value| !value.is_null());
        Ok(Some(JobOutcome { result }))
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl Broker for SqliteBackend {
    async fn submit(
        &self,
        function: &str,
        envelope: &JobEnvelope,
        background: bool,
    ) -> CoreResult<JobHandle> {
        let payload = envelope.encode()?;
        sqlx::query(
            "INSERT INTO jobs (id, function, priority, payload, background, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(envelope.id.as_str())
        .bind(function)
        .bind(envelope.priority.rank())
        .bind(payload)
        .bind(background)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %envelope.id, function, "Job queued");
        Ok(JobHandle {
            id: envelope.id.clone(),
            function: function.to_string(),
        })
    }

    async fn register(&self, function: &str, worker: u32) -> CoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO workers (function, pid, registered_at) VALUES (?, ?, ?)",
        )
        .bind(function)
        .bind(i64::from(worker))
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister(&self, function: &str, worker: u32) -> CoreResult<()> {
        sqlx::query("DELETE FROM workers WHERE function = ? AND pid = ?")
            .bind(function)
            .bind(i64::from(worker))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn grab(&self, function: &str, worker: u32, mode: GrabMode) -> CoreResult<Grab> {
        loop {
            if let Some(job) = self.try_claim(function, worker).await? {
                debug!(job_id = %job.handle.id, worker, "Job claimed");
                return Ok(Grab::Job(job));
            }
            match mode {
                GrabMode::NonBlocking => return Ok(Grab::NoJob),
                GrabMode::Blocking => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn complete(&self, handle: &JobHandle, result: Option<&Value>) -> CoreResult<()> {
        let encoded = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::malformed(format!("job result: {e}")))?;

        self.purge_expired_results().await?;

        // Background jobs have no reader for their result.
        sqlx::query("DELETE FROM jobs WHERE id = ? AND background = 1")
            .bind(handle.id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE jobs SET status = 'done', result = ?, finished_at = ? WHERE id = ?")
            .bind(encoded)
            .bind(millis(Utc::now()))
            .bind(handle.id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn wait_result(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> CoreResult<Option<JobOutcome>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.take_result(handle).await? {
                return Ok(Some(outcome));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn registered_workers(&self, function: &str) -> CoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workers WHERE function = ?")
            .bind(function)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn queued(&self, function: &str) -> CoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE function = ? AND status = 'queued'",
        )
        .bind(function)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl DelayedStore for SqliteBackend {
    async fn schedule(
        &self,
        function: &str,
        envelope: &JobEnvelope,
        background: bool,
    ) -> CoreResult<JobId> {
        let due_at = envelope.due_at.ok_or_else(|| {
            CoreError::from(CoreErrorKind::InvalidArgument {
                reason: format!("job {} has no due time", envelope.id),
            })
        })?;

        sqlx::query(
            "INSERT INTO delayed_jobs (id, function, background, due_at, payload)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(envelope.id.as_str())
        .bind(function)
        .bind(background)
        .bind(millis(due_at))
        .bind(envelope.encode()?)
        .execute(&self.pool)
        .await?;

        info!(job_id = %envelope.id, %due_at, "Job scheduled");
        Ok(envelope.id.clone())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> CoreResult<Option<JobEnvelope>> {
        loop {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                "DELETE FROM delayed_jobs
                 WHERE seq = (
                     SELECT seq FROM delayed_jobs
                     WHERE due_at <= ?
                     ORDER BY due_at ASC, seq ASC
                     LIMIT 1
                 )
                 RETURNING id, function, background, due_at, payload",
            )
            .bind(millis(now))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(None);
            };
            let record = DelayedRecord {
                id: row.try_get("id")?,
                function: row.try_get("function")?,
                background: row.try_get("background")?,
                due_at: row.try_get("due_at")?,
                payload: row.try_get("payload")?,
            };

            let envelope = match JobEnvelope::decode(&record.payload) {
                Ok(envelope) => envelope.into_immediate(),
                Err(e) => {
                    record.set_aside(&mut tx, &e.to_string(), now).await?;
                    tx.commit().await?;
                    continue;
                }
            };

            let inserted = sqlx::query(
                "INSERT INTO jobs (id, function, priority, payload, background, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(envelope.id.as_str())
            .bind(&record.function)
            .bind(envelope.priority.rank())
            .bind(envelope.encode()?)
            .bind(record.background)
            .bind(millis(now))
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await?;
                    return Ok(Some(envelope));
                }
                // A duplicate id can never be inserted.
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    record.set_aside(&mut tx, &e.to_string(), now).await?;
                    tx.commit().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn pending(&self) -> CoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delayed_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn contains(&self, id: &JobId) -> CoreResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delayed_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

/// A row claimed from `delayed_jobs`
struct DelayedRecord {
    id: String,
    function: String,
    background: bool,
    due_at: i64,
    payload: String,
}

impl DelayedRecord {
    /// Moves a record that can never be promoted into `failed_delayed_jobs`
    async fn set_aside(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO failed_delayed_jobs (id, function, background, due_at, payload, reason, failed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.function)
        .bind(self.background)
        .bind(self.due_at)
        .bind(&self.payload)
        .bind(reason)
        .bind(millis(now))
        .execute(&mut **tx)
        .await?;
        error!(job_id = %self.id, function = %self.function, reason, "Delayed job cannot be promoted, set aside");
        Ok(())
    }
}

impl SqliteBackend {
    /// Number of delayed jobs set aside because they could not be promoted
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the database cannot be queried.
    pub async fn failed_delayed(&self) -> CoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_delayed_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Due time of the earliest scheduled job, if any
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the database cannot be queried.
    pub async fn next_due(&self) -> CoreResult<Option<DateTime<Utc>>> {
        let due: Option<i64> = sqlx::query_scalar("SELECT MIN(due_at) FROM delayed_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(due.and_then(from_millis))
    }
}
