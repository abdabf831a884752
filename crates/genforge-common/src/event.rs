use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobRecord};

/// Known `event_type` values carried on the progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Payload is the full [`JobRecord`] after a transition.
    StatusUpdate,
    /// Artifacts changed; payload lists the touched paths.
    CodeUpdate,
    PhaseFailed,
    HealingStarted,
    HealingAttempt,
    HealingAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUpdate => "status-update",
            Self::CodeUpdate => "code-update",
            Self::PhaseFailed => "phase-failed",
            Self::HealingStarted => "healing-started",
            Self::HealingAttempt => "healing-attempt",
            Self::HealingAlert => "healing-alert",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status-update" => Ok(Self::StatusUpdate),
            "code-update" => Ok(Self::CodeUpdate),
            "phase-failed" => Ok(Self::PhaseFailed),
            "healing-started" => Ok(Self::HealingStarted),
            "healing-attempt" => Ok(Self::HealingAttempt),
            "healing-alert" => Ok(Self::HealingAlert),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

/// Wire envelope for every progress channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn status_update(record: &JobRecord) -> Self {
        let payload = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        Self::new(EventKind::StatusUpdate, payload)
    }

    pub fn code_update(job_id: &JobId, phase: &str, paths: &[String]) -> Self {
        Self::new(
            EventKind::CodeUpdate,
            serde_json::json!({ "job_id": job_id, "phase": phase, "paths": paths }),
        )
    }

    pub fn phase_failed(job_id: &JobId, phase: &str, error: &str) -> Self {
        Self::new(
            EventKind::PhaseFailed,
            serde_json::json!({ "job_id": job_id, "phase": phase, "error": error }),
        )
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.event_type.parse().ok()
    }

    /// The job this event concerns, read from `id` (status updates) or `job_id`.
    pub fn job_id(&self) -> Option<JobId> {
        self.payload
            .get("job_id")
            .or_else(|| self.payload.get("id"))
            .and_then(|v| v.as_str())
            .map(JobId::from)
    }

    /// Decode the job record carried by a `status-update`.
    pub fn job_record(&self) -> Option<JobRecord> {
        if self.kind() != Some(EventKind::StatusUpdate) {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_strings_are_kebab_case() {
        assert_eq!(EventKind::StatusUpdate.as_str(), "status-update");
        assert_eq!(
            serde_json::to_string(&EventKind::HealingAlert).unwrap(),
            "\"healing-alert\""
        );
        assert_eq!("code-update".parse::<EventKind>().unwrap(), EventKind::CodeUpdate);
        assert!("progress".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_code_update_carries_job_id() {
        let id = JobId::from("job-7");
        let event = ProgressEvent::code_update(&id, "generate", &["src/main.tsx".to_string()]);
        assert_eq!(event.event_type, "code-update");
        assert_eq!(event.job_id(), Some(id));
        assert!(event.job_record().is_none());

        let json = serde_json::to_value(&event).unwrap();
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(json["payload"]["paths"][0], "src/main.tsx");
    }
}
