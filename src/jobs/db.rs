use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use genforge_common::{
    FailureReport, HealingAttempt, JobId, JobRecord, JobRequest, JobStatus, PhaseRecord,
    Signature, StrategyKind,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Each `call` holds the mutex for
/// its whole closure, so read-check-write sequences inside one call are atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

/// One stored healing attempt with the failure it belonged to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub signature: Signature,
    #[serde(flatten)]
    pub attempt: HealingAttempt,
    pub recorded_at: DateTime<Utc>,
}

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                current_step TEXT NOT NULL DEFAULT '',
                phases TEXT NOT NULL DEFAULT '[]',
                stream_updates TEXT NOT NULL DEFAULT '[]',
                estimated_completion_at TEXT,
                error_message TEXT,
                output_data TEXT,
                session_id TEXT,
                platform TEXT,
                request TEXT NOT NULL DEFAULT 'null',
                expected_phases TEXT NOT NULL DEFAULT '[]',
                recovery_pending INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS healing_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                signature TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '',
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS failure_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                report TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id);
            CREATE INDEX IF NOT EXISTS idx_healing_attempts_job ON healing_attempts(job_id);
            CREATE INDEX IF NOT EXISTS idx_failure_reports_job ON failure_reports(job_id);
            ",
        )?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, id: &JobId, request: &JobRequest) -> Result<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            status: JobStatus::Queued,
            progress: 0,
            current_step: "queued".to_string(),
            phases: Vec::new(),
            stream_updates: vec!["queued".to_string()],
            estimated_completion_at: None,
            error_message: None,
            output_data: None,
            session_id: request.session_id.clone(),
            platform: request.platform.clone(),
            request: request.request.clone(),
            expected_phases: request.phases.clone().unwrap_or_default(),
            recovery_pending: false,
            created_at: now,
            updated_at: now,
        };

        self.conn.execute(
            "INSERT INTO jobs (id, status, progress, current_step, phases, stream_updates,
                estimated_completion_at, error_message, output_data, session_id, platform,
                request, expected_phases, recovery_pending, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id.as_str(),
                record.status.as_str(),
                record.progress,
                record.current_step,
                serde_json::to_string(&record.phases)?,
                serde_json::to_string(&record.stream_updates)?,
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
                record.session_id,
                record.platform,
                serde_json::to_string(&record.request)?,
                serde_json::to_string(&record.expected_phases)?,
                false,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(record)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.as_str()],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY rowid DESC LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], JobRow::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_record()?);
        }
        Ok(jobs)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY rowid",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], JobRow::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_record()?);
        }
        Ok(jobs)
    }

    fn load(&self, id: &JobId) -> Result<JobRecord> {
        self.get_job(id)?
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    /// Persist every mutable column. Guarded on the status read by the caller so
    /// a record can never be written past a state it was not loaded in.
    fn save(&self, record: &mut JobRecord, loaded_status: JobStatus) -> Result<()> {
        record.updated_at = Utc::now();
        let changed = self.conn.execute(
            "UPDATE jobs SET status = ?1, progress = ?2, current_step = ?3, phases = ?4,
                stream_updates = ?5, estimated_completion_at = ?6, error_message = ?7,
                output_data = ?8, expected_phases = ?9, recovery_pending = ?10, updated_at = ?11
             WHERE id = ?12 AND status = ?13",
            params![
                record.status.as_str(),
                record.progress,
                record.current_step,
                serde_json::to_string(&record.phases)?,
                serde_json::to_string(&record.stream_updates)?,
                record.estimated_completion_at.map(|t| t.to_rfc3339()),
                record.error_message,
                record
                    .output_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&record.expected_phases)?,
                record.recovery_pending,
                record.updated_at.to_rfc3339(),
                record.id.as_str(),
                loaded_status.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    /// Load, check the predicate, mutate, save.
    fn mutate<F>(
        &self,
        id: &JobId,
        action: &'static str,
        allowed: fn(&JobRecord) -> bool,
        f: F,
    ) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self.load(id)?;
        if !allowed(&record) {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: record.status,
                action,
            });
        }
        let loaded_status = record.status;
        f(&mut record);
        self.save(&mut record, loaded_status)?;
        Ok(record)
    }

    /// queued → processing. Fixes the expected phase list for the rest of the run.
    pub fn start_processing(
        &self,
        id: &JobId,
        expected_phases: Vec<String>,
        estimated_completion_at: Option<DateTime<Utc>>,
    ) -> Result<JobRecord> {
        self.mutate(
            id,
            "start processing",
            |r| r.status == JobStatus::Queued,
            |r| {
                r.status = JobStatus::Processing;
                r.expected_phases = expected_phases;
                r.estimated_completion_at = estimated_completion_at;
                r.current_step = "starting".to_string();
                r.stream_updates.push("processing".to_string());
            },
        )
    }

    pub fn begin_phase(&self, id: &JobId, phase: &str) -> Result<JobRecord> {
        let phase = phase.to_string();
        self.mutate(id, "begin a phase", is_processing, move |r| {
            r.stream_updates.push(format!("phase {} started", phase));
            r.current_step = phase;
        })
    }

    /// Append a completed phase. Progress never moves backwards.
    pub fn record_phase(&self, id: &JobId, phase: PhaseRecord, progress: u8) -> Result<JobRecord> {
        let mut record = self.load(id)?;
        if !is_processing(&record) {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: record.status,
                action: "record a phase",
            });
        }
        if !record.expected_phases.is_empty() && record.phases.len() >= record.expected_phases.len()
        {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: record.status,
                action: "record more phases than expected",
            });
        }
        let loaded_status = record.status;
        record
            .stream_updates
            .push(format!("phase {} completed", phase.name));
        record.current_step = phase.name.clone();
        record.phases.push(phase);
        record.progress = record.progress.max(progress.min(100));
        self.save(&mut record, loaded_status)?;
        Ok(record)
    }

    pub fn append_stream_update(&self, id: &JobId, update: &str) -> Result<JobRecord> {
        let update = update.to_string();
        self.mutate(
            id,
            "append a stream update",
            |r| !r.is_settled(),
            move |r| r.stream_updates.push(update),
        )
    }

    /// processing → completed.
    pub fn complete(&self, id: &JobId, output: serde_json::Value) -> Result<JobRecord> {
        self.mutate(id, "complete", is_processing, move |r| {
            r.status = JobStatus::Completed;
            r.progress = 100;
            r.current_step = "completed".to_string();
            r.error_message = None;
            r.output_data = Some(output);
            r.recovery_pending = false;
            r.stream_updates.push("completed".to_string());
        })
    }

    /// Mark a live job failed. With `recovery_pending` the record stays open
    /// for exactly one resolution by the healing engine.
    pub fn fail(&self, id: &JobId, message: &str, recovery_pending: bool) -> Result<JobRecord> {
        let message = message.to_string();
        self.mutate(
            id,
            "fail",
            |r| matches!(r.status, JobStatus::Queued | JobStatus::Processing),
            move |r| {
                r.status = JobStatus::Failed;
                r.stream_updates.push(format!("failed: {}", message));
                r.error_message = Some(message);
                r.output_data = None;
                r.recovery_pending = recovery_pending;
            },
        )
    }

    /// Resolve a pending failure as healed: failed → processing, so the rest
    /// of the run is cancellable and reapable like any live job.
    pub fn mark_recovered(&self, id: &JobId, note: &str) -> Result<JobRecord> {
        let note = note.to_string();
        self.mutate(
            id,
            "mark recovered",
            |r| r.status == JobStatus::Failed && r.recovery_pending,
            move |r| {
                r.status = JobStatus::Processing;
                r.error_message = None;
                r.recovery_pending = false;
                r.stream_updates.push(note);
            },
        )
    }

    /// Settle a pending failure without recovering it.
    pub fn settle_failure(&self, id: &JobId, message: &str) -> Result<JobRecord> {
        let message = message.to_string();
        self.mutate(
            id,
            "settle a failure",
            |r| r.status == JobStatus::Failed && r.recovery_pending,
            move |r| {
                r.stream_updates.push(format!("recovery abandoned: {}", message));
                r.error_message = Some(message);
                r.recovery_pending = false;
            },
        )
    }

    pub fn cancel(&self, id: &JobId) -> Result<JobRecord> {
        self.mutate(
            id,
            "cancel",
            |r| matches!(r.status, JobStatus::Queued | JobStatus::Processing),
            |r| {
                r.status = JobStatus::Cancelled;
                r.current_step = "cancelled".to_string();
                r.stream_updates.push("cancelled".to_string());
            },
        )
    }

    /// Force-fail processing jobs that have not been written since `cutoff`.
    pub fn reap_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let mut reaped = Vec::new();
        for record in self.jobs_with_status(JobStatus::Processing)? {
            if record.updated_at >= cutoff {
                continue;
            }
            let idle = (Utc::now() - record.updated_at).num_seconds().max(0);
            let message = format!("job stalled: no progress for {}s", idle);
            reaped.push(self.fail(&record.id, &message, false)?);
        }
        Ok(reaped)
    }

    // ── Healing history ───────────────────────────────────────────────

    pub fn insert_healing_attempt(
        &self,
        job_id: &JobId,
        signature: &Signature,
        attempt: &HealingAttempt,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO healing_attempts (job_id, signature, attempt_number, strategy, outcome, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job_id.as_str(),
                signature.as_str(),
                attempt.attempt_number,
                attempt.strategy.as_str(),
                attempt.outcome.as_str(),
                attempt.detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn healing_attempts(&self, job_id: &JobId) -> Result<Vec<AttemptRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT signature, attempt_number, strategy, outcome, detail, recorded_at
             FROM healing_attempts WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut attempts = Vec::new();
        for row in rows {
            let (signature, attempt_number, strategy, outcome, detail, recorded_at) = row?;
            attempts.push(AttemptRecord {
                signature: Signature::from_hex(signature),
                attempt: HealingAttempt {
                    attempt_number,
                    strategy: StrategyKind::from_str(&strategy).map_err(|message| {
                        StoreError::Corrupt {
                            column: "strategy",
                            message,
                        }
                    })?,
                    outcome: outcome.parse().map_err(|message| StoreError::Corrupt {
                        column: "outcome",
                        message,
                    })?,
                    detail,
                },
                recorded_at: parse_timestamp("recorded_at", &recorded_at)?,
            });
        }
        Ok(attempts)
    }

    pub fn insert_failure_report(&self, report: &FailureReport) -> Result<()> {
        self.conn.execute(
            "INSERT INTO failure_reports (job_id, report, created_at) VALUES (?1, ?2, ?3)",
            params![
                report.job_id.as_str(),
                serde_json::to_string(report)?,
                report.generated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_failure_report(&self, job_id: &JobId) -> Result<Option<FailureReport>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT report FROM failure_reports WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                params![job_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }
}

fn is_processing(record: &JobRecord) -> bool {
    record.status == JobStatus::Processing
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column,
            message: e.to_string(),
        })
}

// ── Internal row helpers ──────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, status, progress, current_step, phases, stream_updates, \
    estimated_completion_at, error_message, output_data, session_id, platform, request, \
    expected_phases, recovery_pending, created_at, updated_at";

/// Intermediate row struct for reading jobs before decoding JSON columns.
struct JobRow {
    id: String,
    status: String,
    progress: i64,
    current_step: String,
    phases: String,
    stream_updates: String,
    estimated_completion_at: Option<String>,
    error_message: Option<String>,
    output_data: Option<String>,
    session_id: Option<String>,
    platform: Option<String>,
    request: String,
    expected_phases: String,
    recovery_pending: bool,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            progress: row.get(2)?,
            current_step: row.get(3)?,
            phases: row.get(4)?,
            stream_updates: row.get(5)?,
            estimated_completion_at: row.get(6)?,
            error_message: row.get(7)?,
            output_data: row.get(8)?,
            session_id: row.get(9)?,
            platform: row.get(10)?,
            request: row.get(11)?,
            expected_phases: row.get(12)?,
            recovery_pending: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let status = JobStatus::from_str(&self.status).map_err(|message| StoreError::Corrupt {
            column: "status",
            message,
        })?;
        Ok(JobRecord {
            id: JobId::from(self.id),
            status,
            progress: self.progress.clamp(0, 100) as u8,
            current_step: self.current_step,
            phases: serde_json::from_str(&self.phases)?,
            stream_updates: serde_json::from_str(&self.stream_updates)?,
            estimated_completion_at: self
                .estimated_completion_at
                .as_deref()
                .map(|t| parse_timestamp("estimated_completion_at", t))
                .transpose()?,
            error_message: self.error_message,
            output_data: self
                .output_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            session_id: self.session_id,
            platform: self.platform,
            request: serde_json::from_str(&self.request)?,
            expected_phases: serde_json::from_str(&self.expected_phases)?,
            recovery_pending: self.recovery_pending,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
