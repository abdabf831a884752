//! Typed error hierarchy for genforge.
//!
//! One enum per subsystem seam:
//! - `StoreError` for the job record store
//! - `JobError` for pipeline runs, classified the way the healing engine consumes them
//! - `HealingError` for the healing engine's own faults
//! - `ObserverError` for reliable status observers
//! - `QualityError` for gate evaluation that could not produce a report

use genforge_common::{JobId, JobStatus, QualityReport, Signature};
use thiserror::Error;

/// Errors from the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    /// The write targeted a record whose state forbids it.
    #[error("Job {id} is {status}; refusing to {action}")]
    Conflict {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt column {column}: {message}")]
    Corrupt { column: &'static str, message: String },

    #[error("Database I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task failed: {0}")]
    TaskFailed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt {
            column: "json",
            message: err.to_string(),
        }
    }
}

/// Failure classes of a job run.
#[derive(Debug, Error)]
pub enum JobError {
    /// A phase executor failed. Fatal to the run and handed to the healing engine.
    #[error("Phase '{phase}' failed: {message}")]
    Execution { phase: String, message: String },

    /// The quality gate rejected the output.
    #[error("{}", .report.summary())]
    Validation { report: Box<QualityReport> },

    /// Every repair strategy failed; a human has to step in.
    #[error("Recovery exhausted for signature {signature} after {attempts} attempts")]
    ExhaustedRecovery { signature: Signature, attempts: usize },

    #[error("Job {0} was cancelled")]
    Cancelled(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Whether this failure is eligible for healing.
    pub fn is_healable(&self) -> bool {
        matches!(self, JobError::Execution { .. } | JobError::Validation { .. })
    }

    /// A write refused because the job was cancelled underneath the run.
    pub fn or_cancelled(self) -> Self {
        match self {
            JobError::Store(StoreError::Conflict {
                id,
                status: JobStatus::Cancelled,
                ..
            }) => JobError::Cancelled(id),
            other => other,
        }
    }
}

/// Errors raised by the healing engine itself.
#[derive(Debug, Error)]
pub enum HealingError {
    #[error("Failed to write checkpoint {checkpoint_id}: {source}")]
    CheckpointFailed {
        checkpoint_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Restoring the checkpoint failed. Never retried.
    #[error("Rollback to checkpoint {checkpoint_id} failed: {source}")]
    RollbackFailed {
        checkpoint_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Knowledge base error: {0}")]
    Knowledge(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced to observer callbacks.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ObserverError {
    /// Polling kept failing past the retry budget. Not a job failure.
    #[error("Transport error after {consecutive_failures} consecutive failures: {message}")]
    Transport {
        consecutive_failures: u32,
        message: String,
    },

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Job was cancelled")]
    JobCancelled,

    #[error("Job {0} not found")]
    NotFound(JobId),
}

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("Unknown platform '{0}'")]
    UnknownPlatform(String),

    #[error("Invalid platform pattern for {platform}: {source}")]
    Pattern {
        platform: String,
        #[source]
        source: regex::Error,
    },
}
