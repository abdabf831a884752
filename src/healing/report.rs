//! Failure reports and the sinks that deliver them.

use std::sync::Arc;

use chrono::Utc;
use genforge_common::{
    AttemptOutcome, EventKind, FailureKind, FailureReport, HealingAttempt, JobId, ProgressEvent,
    Signature,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::Failure;
use crate::channel::ProgressChannel;

pub fn build_report(
    failure: &Failure,
    attempts: &[HealingAttempt],
    tool_root_cause: Option<String>,
    checkpoint_id: &str,
    rollback_completed: bool,
) -> FailureReport {
    FailureReport {
        job_id: failure.job.id.clone(),
        signature: failure.signature.clone(),
        failure_kind: failure.kind,
        error: failure.message.clone(),
        attempts: attempts.to_vec(),
        root_cause: tool_root_cause.unwrap_or_else(|| hypothesize(failure)),
        recommended_steps: recommended_steps(failure, attempts, checkpoint_id),
        checkpoint_id: checkpoint_id.to_string(),
        rollback_completed,
        generated_at: Utc::now(),
    }
}

/// Best guess at a root cause when no repair tool offered one.
fn hypothesize(failure: &Failure) -> String {
    if let Some(ref report) = failure.report {
        let categories: Vec<&str> = report.categories().iter().map(|c| c.as_str()).collect();
        return format!(
            "Generated output failed quality checks ({}) with score {}",
            categories.join(", "),
            report.quality_score
        );
    }

    let message = failure.message.to_lowercase();
    let phase = failure.phase.as_deref().unwrap_or("unknown");
    let cause = if message.contains("timeout") || message.contains("timed out") {
        "an upstream service timed out"
    } else if message.contains("rate limit") || message.contains("429") {
        "the upstream service is rate limiting requests"
    } else if message.contains("syntax") || message.contains("parse") {
        "generated code does not parse"
    } else if message.contains("not found") || message.contains("missing") {
        "a referenced file or module is missing"
    } else if message.contains("permission") || message.contains("denied") {
        "the executor lacks permission for a resource"
    } else {
        "the phase executor returned an unclassified error"
    };
    format!("Phase '{}' failed: {}", phase, cause)
}

fn recommended_steps(
    failure: &Failure,
    attempts: &[HealingAttempt],
    checkpoint_id: &str,
) -> Vec<String> {
    let mut steps = Vec::new();

    match failure.kind {
        FailureKind::Validation => {
            if let Some(ref report) = failure.report {
                if !report.required_missing.is_empty() {
                    steps.push(format!(
                        "Add the missing required files: {}",
                        report.required_missing.join(", ")
                    ));
                }
                for fix in report.issues.iter().filter_map(|i| i.suggested_fix.as_ref()) {
                    if !steps.contains(fix) {
                        steps.push(fix.clone());
                    }
                }
            }
        }
        FailureKind::Execution => {
            if let Some(ref phase) = failure.phase {
                steps.push(format!("Re-run phase '{}' manually and inspect its output", phase));
            }
            steps.push("Check the phase executor logs for the original error".to_string());
        }
    }

    let failed: Vec<String> = attempts
        .iter()
        .filter(|a| a.outcome == AttemptOutcome::Failed)
        .map(|a| format!("{}: {}", a.strategy, a.detail))
        .collect();
    if !failed.is_empty() {
        steps.push(format!("Review failed repair attempts ({})", failed.join("; ")));
    }
    steps.push(format!(
        "Artifacts were restored from checkpoint {}; resubmit the job once fixed",
        checkpoint_id
    ));
    steps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Every strategy failed.
    High,
    /// The engine itself failed.
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAlert {
    pub severity: AlertSeverity,
    pub job_id: JobId,
    #[serde(default)]
    pub session_id: Option<String>,
    pub signature: Signature,
    pub message: String,
    #[serde(default)]
    pub report: Option<FailureReport>,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, alert: &HealingAlert);
}

/// Logs alerts at error level.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, alert: &HealingAlert) {
        error!(
            severity = ?alert.severity,
            job_id = %alert.job_id,
            signature = %alert.signature,
            root_cause = alert.report.as_ref().map(|r| r.root_cause.as_str()).unwrap_or(""),
            "{}",
            alert.message
        );
    }
}

/// Publishes alerts as `healing-alert` events on the job's topics.
pub struct ChannelSink {
    channel: Arc<ProgressChannel>,
}

impl ChannelSink {
    pub fn new(channel: Arc<ProgressChannel>) -> Self {
        Self { channel }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, alert: &HealingAlert) {
        let payload = serde_json::to_value(alert).unwrap_or(serde_json::Value::Null);
        let event = ProgressEvent::new(EventKind::HealingAlert, payload);
        self.channel.publish(alert.job_id.as_str(), event.clone());
        if let Some(ref session) = alert.session_id {
            self.channel.publish(session, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::test_support::sample_failure;
    use genforge_common::StrategyKind;

    fn failed(n: u32, strategy: StrategyKind) -> HealingAttempt {
        HealingAttempt {
            attempt_number: n,
            strategy,
            outcome: AttemptOutcome::Failed,
            detail: "no change".into(),
        }
    }

    #[test]
    fn test_report_falls_back_to_hypothesis() {
        let failure = sample_failure(FailureKind::Execution, "request timed out after 30s");
        let attempts = vec![failed(1, StrategyKind::PatternMatch)];
        let report = build_report(&failure, &attempts, None, "cp-1", true);
        assert!(report.root_cause.contains("timed out"));
        assert!(report.rollback_completed);
        assert_eq!(report.attempts.len(), 1);
        assert!(report.recommended_steps.iter().any(|s| s.contains("cp-1")));
        assert!(report
            .recommended_steps
            .iter()
            .any(|s| s.contains("pattern_match: no change")));
    }

    #[test]
    fn test_report_prefers_tool_root_cause() {
        let failure = sample_failure(FailureKind::Execution, "boom");
        let report = build_report(&failure, &[], Some("bad import".into()), "cp", true);
        assert_eq!(report.root_cause, "bad import");
    }

    #[tokio::test]
    async fn test_channel_sink_publishes_alert() {
        let channel = Arc::new(ProgressChannel::default());
        let mut rx = channel.subscribe("job-x");
        let sink = ChannelSink::new(channel.clone());
        sink.notify(&HealingAlert {
            severity: AlertSeverity::Critical,
            job_id: JobId::from("job-x"),
            session_id: None,
            signature: Signature::from_hex("ff"),
            message: "rollback failed".into(),
            report: None,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), Some(EventKind::HealingAlert));
        assert_eq!(event.payload["severity"], "critical");
        assert_eq!(event.job_id(), Some(JobId::from("job-x")));
    }
}
