use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque job identifier, assigned once at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One completed phase, appended to [`JobRecord::phases`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub name: String,
    pub duration_ms: u64,
    pub result: serde_json::Value,
}

/// Durable state of one generation job.
///
/// `recovery_pending` marks a `failed` record whose healing episode is still
/// open. Such a record is terminal but not yet *settled*; see [`JobRecord::is_settled`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub phases: Vec<PhaseRecord>,
    pub stream_updates: Vec<String>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub request: serde_json::Value,
    #[serde(default)]
    pub expected_phases: Vec<String>,
    #[serde(default)]
    pub recovery_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal with no healing episode left open. Settled records never change again.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && !self.recovery_pending
    }

    /// Channel topics this job publishes on: its own id, plus the session id if any.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec![self.id.to_string()];
        if let Some(ref session) = self.session_id {
            topics.push(session.clone());
        }
        topics
    }
}

/// `round(100 * completed / expected)`, clamped to 100. An empty plan counts as done.
pub fn progress_for(completed: usize, expected: usize) -> u8 {
    if expected == 0 {
        return 100;
    }
    let pct = (100.0 * completed as f64 / expected as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Payload accepted by the enqueue operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Opaque request body handed to phase executors as `request`.
    #[serde(default)]
    pub request: serde_json::Value,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Overrides the configured phase list for this job.
    #[serde(default)]
    pub phases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: JobId,
}
