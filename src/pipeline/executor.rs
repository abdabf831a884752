//! Phase executor contract and the command-backed adapter.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use genforge_common::{Artifact, ArtifactSet, JobId, PhaseRecord};
use serde::{Deserialize, Serialize};

use crate::process;

/// Input handed to a phase executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseContext {
    pub job_id: JobId,
    pub phase: String,
    pub phase_index: usize,
    pub total_phases: usize,
    pub platform: String,
    pub request: serde_json::Value,
    /// Results of every phase that already ran, in order.
    pub prior: Vec<PhaseRecord>,
    pub artifacts: ArtifactSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutput>;
}

/// Runs a configured command once per phase with the context as JSON on stdin.
pub struct CommandPhaseExecutor {
    command: String,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

impl CommandPhaseExecutor {
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
impl PhaseExecutor for CommandPhaseExecutor {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutput> {
        process::run_json(&self.command, ctx, &self.cwd, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(phase: &str) -> PhaseContext {
        PhaseContext {
            job_id: JobId::from("j"),
            phase: phase.to_string(),
            phase_index: 0,
            total_phases: 1,
            platform: "react".into(),
            request: json!({"prompt": "x"}),
            prior: vec![],
            artifacts: ArtifactSet::new(),
        }
    }

    #[tokio::test]
    async fn test_command_executor_parses_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandPhaseExecutor::new(
            r#"grep -q '"phase":"plan"' && echo '{"result":{"steps":3},"artifacts":[{"path":"README.md","content":"hi"}]}'"#,
            dir.path().to_path_buf(),
        );
        let out = exec.execute(&ctx("plan")).await.unwrap();
        assert_eq!(out.result["steps"], 3);
        assert_eq!(out.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_command_executor_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandPhaseExecutor::new("exit 1", dir.path().to_path_buf());
        assert!(exec.execute(&ctx("plan")).await.is_err());
    }

    #[tokio::test]
    async fn test_command_executor_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandPhaseExecutor::new("sleep 5", dir.path().to_path_buf())
            .with_timeout(Duration::from_millis(200));
        let err = exec.execute(&ctx("plan")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
