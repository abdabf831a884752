//! The repair collaborator the strategies drive.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use genforge_common::{
    Artifact, ArtifactSet, FailureKind, JobId, KnowledgeEntry, QualityReport, Signature,
    StrategyKind,
};
use serde::{Deserialize, Serialize};

use crate::process;

/// Everything a repair tool is told about one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub job_id: JobId,
    pub strategy: StrategyKind,
    pub attempt_number: u32,
    pub failure_kind: FailureKind,
    pub signature: Signature,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_report: Option<QualityReport>,
    /// Set for pattern matches: the repair that worked last time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_fix: Option<KnowledgeEntry>,
    pub artifacts: ArtifactSet,
    #[serde(default)]
    pub request: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepairResult {
    pub fixed: bool,
    #[serde(default)]
    pub detail: String,
    /// Artifacts to upsert into the job's set when `fixed`.
    #[serde(default)]
    pub patched_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub root_cause: Option<String>,
}

impl RepairResult {
    pub fn not_fixed(detail: impl Into<String>) -> Self {
        Self {
            fixed: false,
            detail: detail.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait RepairToolkit: Send + Sync {
    /// `Err` means the tool itself broke. The engine records it as a failed attempt.
    async fn repair(&self, request: &RepairRequest) -> Result<RepairResult>;
}

/// Runs a configured command per attempt: request JSON on stdin, `RepairResult` JSON on stdout.
pub struct CommandRepairToolkit {
    command: String,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

impl CommandRepairToolkit {
    pub fn new(command: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            command: command.into(),
            cwd,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl RepairToolkit for CommandRepairToolkit {
    async fn repair(&self, request: &RepairRequest) -> Result<RepairResult> {
        process::run_json(&self.command, request, &self.cwd, self.timeout).await
    }
}

/// Used when no repair command is configured: every attempt fails cleanly.
pub struct UnconfiguredToolkit;

#[async_trait]
impl RepairToolkit for UnconfiguredToolkit {
    async fn repair(&self, request: &RepairRequest) -> Result<RepairResult> {
        Ok(RepairResult::not_fixed(format!(
            "no repair command configured for {}",
            request.strategy
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RepairRequest {
        RepairRequest {
            job_id: JobId::from("j"),
            strategy: StrategyKind::ModelAnalysis,
            attempt_number: 2,
            failure_kind: FailureKind::Execution,
            signature: Signature::from_hex("0011223344556677"),
            error: "generate failed".into(),
            phase: Some("generate".into()),
            quality_report: None,
            known_fix: None,
            artifacts: ArtifactSet::new(),
            request: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_command_toolkit_reads_request() {
        let dir = tempfile::tempdir().unwrap();
        let toolkit = CommandRepairToolkit::new(
            r#"grep -q '"strategy":"model_analysis"' && echo '{"fixed":true,"detail":"patched","patched_artifacts":[{"path":"a.js","content":"x"}]}'"#,
            dir.path().to_path_buf(),
        );
        let result = toolkit.repair(&request()).await.unwrap();
        assert!(result.fixed);
        assert_eq!(result.patched_artifacts[0].path, "a.js");
        assert!(result.root_cause.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_toolkit_never_fixes() {
        let result = UnconfiguredToolkit.repair(&request()).await.unwrap();
        assert!(!result.fixed);
        assert!(result.detail.contains("model_analysis"));
    }
}
