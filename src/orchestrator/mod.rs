//! Job orchestration: one tokio task per job driving the pipeline, the
//! quality gate and the healing hand-off.
//!
//! The orchestrator is the only writer of a job while it runs. A phase
//! failure marks the record `failed` with `recovery_pending` set and hands the
//! failure to the healing engine. A healed job goes back to `processing` and
//! resumes from the failed phase; otherwise the failure is settled. A gate
//! rejection is healed once and the healed artifacts are gated again.

pub mod reaper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use genforge_common::{ArtifactSet, JobId, JobRecord, JobRequest, ProgressEvent, QualityReport};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::ProgressChannel;
use crate::config::GenforgeConfig;
use crate::errors::{JobError, StoreError};
use crate::healing::checkpoint::FileCheckpoints;
use crate::healing::knowledge::KnowledgeBase;
use crate::healing::toolkit::{CommandRepairToolkit, RepairToolkit, UnconfiguredToolkit};
use crate::healing::{Failure, HealingEngine, HealingOutcome};
use crate::jobs::JobStore;
use crate::pipeline::{CommandPhaseExecutor, PhaseExecutor, PhasePipeline};
use crate::quality::{QualityCheck, QualityGate};

/// Phase name used when the quality gate itself cannot run.
pub const GATE_PHASE: &str = "quality-gate";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_phases: Vec<String>,
    pub default_platform: String,
    pub phase_estimate: Duration,
    /// Resumes allowed per run after a healed phase failure. Zero settles phase failures without healing.
    pub max_resumes: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_phases: ["plan", "generate", "validate", "refine"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_platform: "react".to_string(),
            phase_estimate: Duration::from_secs(60),
            max_resumes: 1,
        }
    }
}

/// How a failure hand-off ended.
enum Recovery {
    Healed {
        record: JobRecord,
        artifacts: ArtifactSet,
    },
    Settled(JobRecord),
}

pub struct Orchestrator {
    store: JobStore,
    channel: Arc<ProgressChannel>,
    pipeline: PhasePipeline,
    gate: Arc<dyn QualityCheck>,
    healing: Arc<HealingEngine>,
    settings: OrchestratorSettings,
    running: Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        channel: Arc<ProgressChannel>,
        executor: Arc<dyn PhaseExecutor>,
        gate: Arc<dyn QualityCheck>,
        healing: Arc<HealingEngine>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pipeline: PhasePipeline::new(store.clone(), channel.clone(), executor),
            store,
            channel,
            gate,
            healing,
            settings,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire the command adapters, file checkpoints and persisted knowledge from config.
    pub fn from_config(
        config: &GenforgeConfig,
        store: JobStore,
        channel: Arc<ProgressChannel>,
    ) -> Result<Arc<Self>> {
        let executor_cmd = config.executor_cmd().context(
            "No phase executor configured. Set [pipeline] executor_cmd or GENFORGE_EXECUTOR_CMD",
        )?;
        let mut executor = CommandPhaseExecutor::new(executor_cmd, config.project_dir.clone());
        if let Some(timeout) = config.command_timeout() {
            executor = executor.with_timeout(timeout);
        }
        let executor: Arc<dyn PhaseExecutor> = Arc::new(executor);

        let toolkit: Arc<dyn RepairToolkit> = match config.repair_cmd() {
            Some(cmd) => {
                let mut toolkit = CommandRepairToolkit::new(cmd, config.project_dir.clone());
                if let Some(timeout) = config.command_timeout() {
                    toolkit = toolkit.with_timeout(timeout);
                }
                Arc::new(toolkit)
            }
            None => {
                warn!("No repair command configured; healing strategies will report not fixed");
                Arc::new(UnconfiguredToolkit)
            }
        };

        let knowledge = Arc::new(
            KnowledgeBase::load(&config.knowledge_file())
                .context("Failed to load healing knowledge base")?,
        );
        let healing = Arc::new(HealingEngine::new(
            config.healing_settings(),
            store.clone(),
            channel.clone(),
            knowledge,
            Arc::new(FileCheckpoints::new(config.checkpoint_dir())),
            toolkit,
        ));
        let gate = Arc::new(
            QualityGate::new(config.toml.quality.min_score)
                .context("Failed to build quality gate")?,
        );

        let pipeline = &config.toml.pipeline;
        let settings = OrchestratorSettings {
            default_phases: pipeline.phases.clone(),
            default_platform: pipeline.default_platform.clone(),
            phase_estimate: Duration::from_secs(pipeline.phase_estimate_secs),
            max_resumes: pipeline.max_resumes,
        };

        Ok(Arc::new(Self::new(
            store, channel, executor, gate, healing, settings,
        )))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn channel(&self) -> &Arc<ProgressChannel> {
        &self.channel
    }

    pub fn healing(&self) -> &Arc<HealingEngine> {
        &self.healing
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Enqueue a job and spawn its run.
    #[instrument(skip_all)]
    pub async fn submit(self: &Arc<Self>, mut request: JobRequest) -> Result<JobRecord, JobError> {
        if request.platform.is_none() {
            request.platform = Some(self.settings.default_platform.clone());
        }
        if request.phases.as_ref().is_none_or(|p| p.is_empty()) {
            request.phases = Some(self.settings.default_phases.clone());
        }

        let record = self.store.enqueue(request).await?;
        self.channel.publish_status(&record);
        info!(job_id = %record.id, phases = record.expected_phases.len(), "job queued");

        // Held across spawn + insert so the task cannot remove itself before it is tracked.
        let mut running = self.running.lock().await;
        let this = Arc::clone(self);
        let job = record.clone();
        let handle = tokio::spawn(async move {
            let id = job.id.clone();
            this.drive(job).await;
            this.running.lock().await.remove(&id);
        });
        running.insert(record.id.clone(), handle);

        Ok(record)
    }

    async fn drive(&self, job: JobRecord) {
        let id = job.id.clone();
        match self.run_job(job).await {
            Ok(record) => info!(
                job_id = %id,
                status = %record.status,
                progress = record.progress,
                "job finished"
            ),
            Err(JobError::Cancelled(_)) => info!(job_id = %id, "job cancelled; stopping"),
            // Reaped underneath us.
            Err(JobError::Store(StoreError::Conflict { status, action, .. })) => {
                info!(job_id = %id, %status, action, "job left the run; stopping")
            }
            Err(e) => error!(job_id = %id, error = %e, "job run failed"),
        }
    }

    /// Run one job to a settled state.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn run_job(&self, job: JobRecord) -> Result<JobRecord, JobError> {
        self.run(job).await.map_err(JobError::or_cancelled)
    }

    async fn run(&self, job: JobRecord) -> Result<JobRecord, JobError> {
        let platform = job
            .platform
            .clone()
            .unwrap_or_else(|| self.settings.default_platform.clone());
        let phases = if job.expected_phases.is_empty() {
            self.settings.default_phases.clone()
        } else {
            job.expected_phases.clone()
        };
        let eta = self
            .settings
            .phase_estimate
            .checked_mul(phases.len() as u32)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        let mut record = self.store.start_processing(&job.id, phases, eta).await?;
        self.channel.publish_status(&record);
        info!(phases = record.expected_phases.len(), %platform, "job processing");

        let mut artifacts = ArtifactSet::new();
        let mut resumes = 0u32;
        loop {
            let from = record.phases.len();
            match self
                .pipeline
                .run_phases(&record, from, &platform, &mut artifacts)
                .await
            {
                Ok(done) => {
                    record = done;
                    break;
                }
                Err(err @ JobError::Execution { .. }) => {
                    let may_heal = resumes < self.settings.max_resumes;
                    match self.recover(&record.id, err, &artifacts, may_heal).await? {
                        Recovery::Healed {
                            record: healed,
                            artifacts: patched,
                        } => {
                            resumes += 1;
                            info!(resume = resumes, from = healed.phases.len(), "resuming after healing");
                            record = healed;
                            artifacts = patched;
                        }
                        Recovery::Settled(settled) => return Ok(settled),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.finish(record, &platform, artifacts).await
    }

    /// Gate the finished artifact set and complete, heal, or settle.
    async fn finish(
        &self,
        record: JobRecord,
        platform: &str,
        mut artifacts: ArtifactSet,
    ) -> Result<JobRecord, JobError> {
        let mut gate_healed = false;
        loop {
            let err = match self.gate.evaluate(platform, &artifacts) {
                Ok(report) if report.passed => {
                    return self.complete(&record.id, &artifacts, &report).await;
                }
                Ok(report) => {
                    info!(score = report.quality_score, "quality gate rejected output");
                    JobError::Validation {
                        report: Box::new(report),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "quality gate could not run");
                    JobError::Execution {
                        phase: GATE_PHASE.to_string(),
                        message: e.to_string(),
                    }
                }
            };

            match self.recover(&record.id, err, &artifacts, !gate_healed).await? {
                Recovery::Healed {
                    artifacts: patched, ..
                } => {
                    gate_healed = true;
                    artifacts = patched;
                }
                Recovery::Settled(settled) => return Ok(settled),
            }
        }
    }

    async fn complete(
        &self,
        id: &JobId,
        artifacts: &ArtifactSet,
        report: &QualityReport,
    ) -> Result<JobRecord, JobError> {
        let output = json!({
            "artifacts": artifacts,
            "qualityReport": report,
        });
        let record = self.store.complete(id, output).await?;
        self.channel.publish_status(&record);
        info!(job_id = %id, score = report.quality_score, artifacts = artifacts.len(), "job completed");
        Ok(record)
    }

    /// Mark the job failed and hand the failure to the healing engine.
    ///
    /// Without `may_heal` the failure is settled immediately.
    async fn recover(
        &self,
        id: &JobId,
        err: JobError,
        artifacts: &ArtifactSet,
        may_heal: bool,
    ) -> Result<Recovery, JobError> {
        if !err.is_healable() {
            return Err(err);
        }
        let message = err.to_string();

        if !may_heal {
            return self.settle(id, &message).await.map(Recovery::Settled);
        }

        let failed = self.store.fail(id, &message, true).await?;
        self.channel.publish_status(&failed);

        let failure = match err {
            JobError::Execution { phase, .. } => {
                self.channel
                    .publish_for(&failed, ProgressEvent::phase_failed(id, &phase, &message));
                Failure::execution(failed, Some(phase), message.clone(), artifacts.clone())
            }
            JobError::Validation { report } => {
                Failure::validation(failed, *report, artifacts.clone())
            }
            other => return Err(other),
        };

        match self.healing.heal(&failure).await {
            HealingOutcome::Healed {
                strategy,
                artifacts,
                attempts,
            } => {
                let record = self
                    .store
                    .mark_recovered(
                        id,
                        &format!("healed by {} after {} attempt(s)", strategy, attempts.len()),
                    )
                    .await?;
                self.channel.publish_status(&record);
                Ok(Recovery::Healed { record, artifacts })
            }
            HealingOutcome::Exhausted { report, .. } => {
                let exhausted = JobError::ExhaustedRecovery {
                    signature: report.signature,
                    attempts: report.attempts.len(),
                };
                warn!(job_id = %id, error = %exhausted, "needs manual intervention");
                let record = self
                    .store
                    .settle_failure(id, &format!("{}; {}", message, exhausted))
                    .await?;
                self.channel.publish_status(&record);
                Ok(Recovery::Settled(record))
            }
            HealingOutcome::Faulted { error } => {
                let record = self
                    .store
                    .settle_failure(id, &format!("{}; recovery aborted: {}", message, error))
                    .await?;
                self.channel.publish_status(&record);
                Ok(Recovery::Settled(record))
            }
            HealingOutcome::Skipped { phase } => {
                let record = self
                    .store
                    .settle_failure(
                        id,
                        &format!("{}; recovery already attempted ({:?})", message, phase),
                    )
                    .await?;
                self.channel.publish_status(&record);
                Ok(Recovery::Settled(record))
            }
        }
    }

    async fn settle(&self, id: &JobId, message: &str) -> Result<JobRecord, JobError> {
        let record = self.store.fail(id, message, false).await?;
        self.channel.publish_status(&record);
        warn!(job_id = %id, error = message, "job failed");
        Ok(record)
    }

    /// Cancel a queued or processing job and abort its task. A job resumed
    /// after healing is processing again and cancels the same way.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let record = self.store.cancel(id).await?;
        if let Some(handle) = self.running.lock().await.remove(id) {
            handle.abort();
        }
        self.channel.publish_status(&record);
        info!(job_id = %id, "job cancelled");
        Ok(record)
    }

    /// Force-fail processing jobs idle for longer than `stale_after`.
    pub async fn reap_once(&self, stale_after: Duration) -> Result<Vec<JobRecord>, JobError> {
        let Some(cutoff) = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Ok(Vec::new());
        };
        let reaped = self.store.reap_stale(cutoff).await?;
        if reaped.is_empty() {
            return Ok(reaped);
        }
        let mut running = self.running.lock().await;
        for record in &reaped {
            if let Some(handle) = running.remove(&record.id) {
                handle.abort();
            }
            self.channel.publish_status(record);
            warn!(
                job_id = %record.id,
                error = record.error_message.as_deref().unwrap_or(""),
                "reaped stale job"
            );
        }
        Ok(reaped)
    }

    /// Drop channel topics nobody listens to and healing episodes of settled jobs.
    pub async fn release_idle(&self) {
        let topics = self.channel.prune();
        let episodes = self.healing.evict_settled().await;
        if topics + episodes > 0 {
            debug!(topics, episodes, "released idle state");
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Abort every running job task and stop background tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut running = self.running.lock().await;
        let count = running.len();
        for (_, handle) in running.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(aborted = count, "orchestrator shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QualityError;
    use crate::healing::HealingSettings;
    use crate::healing::checkpoint::{CheckpointStore, MemoryCheckpoints};
    use crate::healing::signature::signature_for;
    use crate::healing::test_support::RecordingToolkit;
    use crate::pipeline::test_support::ScriptedExecutor;
    use crate::quality::PASS_THRESHOLD;
    use genforge_common::{
        Artifact, AttemptOutcome, EventKind, JobStatus, StrategyKind,
    };

    const INDEX_HTML: &str = r#"<div id="root"></div><script type="module" src="/src/main.tsx"></script>"#;

    fn complete_react() -> Vec<Artifact> {
        vec![
            Artifact::new("package.json", "{}"),
            Artifact::new("index.html", INDEX_HTML),
            Artifact::new("src/main.tsx", "import App from './App'"),
            Artifact::new("src/App.tsx", "export default function App() {}"),
            Artifact::new("vite.config.ts", ""),
            Artifact::new("tsconfig.json", "{}"),
            Artifact::new("src/index.css", ""),
            Artifact::new("README.md", ""),
        ]
    }

    fn six_phases() -> Vec<String> {
        (1..=6).map(|i| format!("phase-{}", i)).collect()
    }

    /// Gate that always fails to run.
    struct BrokenGate;

    impl QualityCheck for BrokenGate {
        fn evaluate(
            &self,
            platform: &str,
            _artifacts: &ArtifactSet,
        ) -> std::result::Result<QualityReport, QualityError> {
            Err(QualityError::UnknownPlatform(platform.to_string()))
        }
    }

    struct Harness {
        orch: Arc<Orchestrator>,
        store: JobStore,
        channel: Arc<ProgressChannel>,
        executor: Arc<ScriptedExecutor>,
        toolkit: Arc<RecordingToolkit>,
    }

    fn harness_with(
        executor: ScriptedExecutor,
        toolkit: RecordingToolkit,
        gate: Arc<dyn QualityCheck>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Harness {
        let store = JobStore::in_memory().unwrap();
        let channel = Arc::new(ProgressChannel::default());
        let executor = Arc::new(executor);
        let toolkit = Arc::new(toolkit);
        let healing = Arc::new(HealingEngine::new(
            HealingSettings::default(),
            store.clone(),
            channel.clone(),
            Arc::new(KnowledgeBase::in_memory()),
            checkpoints,
            toolkit.clone(),
        ));
        let settings = OrchestratorSettings {
            default_phases: six_phases(),
            ..OrchestratorSettings::default()
        };
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            channel.clone(),
            executor.clone(),
            gate,
            healing,
            settings,
        ));
        Harness {
            orch,
            store,
            channel,
            executor,
            toolkit,
        }
    }

    fn harness(executor: ScriptedExecutor, toolkit: RecordingToolkit) -> Harness {
        harness_with(
            executor,
            toolkit,
            Arc::new(QualityGate::new(PASS_THRESHOLD).unwrap()),
            Arc::new(MemoryCheckpoints::default()),
        )
    }

    async fn run(h: &Harness) -> JobRecord {
        let job = h.store.enqueue(JobRequest::default()).await.unwrap();
        h.orch.run_job(job).await.unwrap()
    }

    fn phase3_signature() -> genforge_common::Signature {
        let err = JobError::Execution {
            phase: "phase-3".into(),
            message: "executor crashed in phase-3".into(),
        };
        signature_for(&err.to_string())
    }

    #[tokio::test]
    async fn test_six_phases_complete_and_pass_gate() {
        let h = harness(
            ScriptedExecutor::default().producing("phase-2", complete_react()),
            RecordingToolkit::fixing(&[]),
        );
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.phases.len(), 6);
        assert!(record.error_message.is_none());
        let output = record.output_data.unwrap();
        assert_eq!(output["qualityReport"]["passed"], true);
        assert!(record.estimated_completion_at.is_some());
        assert!(h.toolkit.calls().is_empty());
    }

    #[tokio::test]
    async fn test_phase_failure_healed_by_pattern_match_then_completes() {
        let h = harness(
            ScriptedExecutor::default()
                .producing("phase-1", complete_react())
                .failing("phase-3", 1),
            RecordingToolkit::fixing(&[StrategyKind::PatternMatch]),
        );
        for _ in 0..3 {
            h.orch
                .healing()
                .knowledge()
                .record_success(&phase3_signature(), StrategyKind::ContextFix);
        }
        let job = h.store.enqueue(JobRequest::default()).await.unwrap();
        let mut rx = h.channel.subscribe(job.id.as_str());

        let record = h.orch.run_job(job).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.phases.len(), 6);
        assert_eq!(record.progress, 100);
        assert!(!record.recovery_pending);
        // phase-3 ran twice, the rest once
        assert_eq!(h.executor.calls().iter().filter(|p| *p == "phase-3").count(), 2);
        assert_eq!(h.executor.calls().len(), 7);

        let attempts = h.store.healing_attempts(&record.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt.strategy, StrategyKind::PatternMatch);
        assert_eq!(attempts[0].attempt.outcome, AttemptOutcome::Success);

        let mut saw_failed_pending = false;
        let mut saw_phase_failed = false;
        while let Ok(event) = rx.try_recv() {
            match event.kind() {
                Some(EventKind::PhaseFailed) => saw_phase_failed = true,
                Some(EventKind::StatusUpdate) => {
                    let r = event.job_record().unwrap();
                    if r.status == JobStatus::Failed {
                        assert!(r.recovery_pending, "failure settled before healing finished");
                        saw_failed_pending = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_failed_pending);
        assert!(saw_phase_failed);
    }

    #[tokio::test]
    async fn test_all_strategies_fail_settles_with_report() {
        let h = harness(
            ScriptedExecutor::default()
                .producing("phase-1", complete_react())
                .failing("phase-3", 1),
            RecordingToolkit::fixing(&[]),
        );
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.recovery_pending);
        assert_eq!(record.phases.len(), 2);
        let message = record.error_message.unwrap();
        assert!(message.contains("Recovery exhausted for signature"), "{}", message);
        assert!(message.ends_with("after 4 attempts"), "{}", message);

        let attempts = h.store.healing_attempts(&record.id).await.unwrap();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| a.attempt.outcome == AttemptOutcome::Failed));

        let report = h.store.latest_failure_report(&record.id).await.unwrap().unwrap();
        assert!(report.rollback_completed);
        assert_eq!(report.attempts.len(), 4);

        // Settled records refuse further writes.
        assert!(h.store.complete(&record.id, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_second_phase_failure_after_resume_is_terminal() {
        let h = harness(
            ScriptedExecutor::default()
                .failing("phase-3", 1)
                .failing("phase-5", 1),
            RecordingToolkit::fixing(&StrategyKind::ORDER),
        );
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.recovery_pending);
        assert_eq!(record.phases.len(), 4);
        assert!(record.error_message.unwrap().contains("phase-5"));
        // Only the first failure was healed.
        assert_eq!(h.toolkit.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_rejection_healed_with_patched_artifacts() {
        let h = harness(
            ScriptedExecutor::default(),
            RecordingToolkit::fixing(&[StrategyKind::ModelAnalysis]).with_patch(complete_react()),
        );
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Completed);
        let output = record.output_data.unwrap();
        assert_eq!(output["qualityReport"]["passed"], true);
        let calls = h.toolkit.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].quality_report.is_some());
    }

    #[tokio::test]
    async fn test_gate_rejection_not_healed_settles() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.recovery_pending);
        assert!(record.error_message.unwrap().contains("quality gate failed"));
        // Pattern match has no knowledge to offer, so only three strategies reach the toolkit.
        assert_eq!(h.toolkit.calls().len(), 3);
        assert_eq!(h.store.healing_attempts(&record.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_gate_error_is_handled_as_execution_failure() {
        let h = harness_with(
            ScriptedExecutor::default(),
            RecordingToolkit::fixing(&[]),
            Arc::new(BrokenGate),
            Arc::new(MemoryCheckpoints::default()),
        );
        let record = run(&h).await;

        assert_eq!(record.status, JobStatus::Failed);
        let calls = h.toolkit.calls();
        assert!(!calls.is_empty());
        assert_eq!(calls[0].phase.as_deref(), Some(GATE_PHASE));
    }

    #[tokio::test]
    async fn test_zero_resumes_settles_phase_failure_without_healing() {
        let mut h = harness(
            ScriptedExecutor::default().failing("phase-1", 1),
            RecordingToolkit::fixing(&StrategyKind::ORDER),
        );
        let orch = Arc::get_mut(&mut h.orch).unwrap();
        orch.settings.max_resumes = 0;

        let record = run(&h).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.recovery_pending);
        assert!(h.toolkit.calls().is_empty());
    }

    #[tokio::test]
    async fn test_submit_fills_defaults_and_runs_in_background() {
        let h = harness(
            ScriptedExecutor::default().producing("phase-1", complete_react()),
            RecordingToolkit::fixing(&[]),
        );
        let queued = h.orch.submit(JobRequest::default()).await.unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.expected_phases, six_phases());
        assert_eq!(queued.platform.as_deref(), Some("react"));

        let mut record = queued.clone();
        for _ in 0..200 {
            record = h.store.fetch(&queued.id).await.unwrap();
            if record.is_settled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let job = h.store.enqueue(JobRequest::default()).await.unwrap();

        let cancelled = h.orch.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // A cancelled job never starts.
        let err = h.orch.run_job(job.clone()).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled(ref id) if *id == job.id));
        assert!(h.executor.calls().is_empty());

        // Cancelling twice conflicts.
        assert!(h.orch.cancel(&job.id).await.is_err());
    }

    /// Submit a job whose phase-2 fails once and is healed, then wait until
    /// the resumed run is blocked inside the hanging phase-3.
    async fn resumed_and_hanging(h: &Harness) -> JobRecord {
        let queued = h.orch.submit(JobRequest::default()).await.unwrap();
        for _ in 0..200 {
            let record = h.store.fetch(&queued.id).await.unwrap();
            if record.current_step == "phase-3" {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached phase-3");
    }

    fn heal_then_hang() -> Harness {
        harness(
            ScriptedExecutor::default()
                .failing("phase-2", 1)
                .hanging("phase-3"),
            RecordingToolkit::fixing(&[StrategyKind::ModelAnalysis]),
        )
    }

    #[tokio::test]
    async fn test_resumed_job_is_processing_and_cancellable() {
        let h = heal_then_hang();
        let record = resumed_and_hanging(&h).await;

        assert_eq!(record.status, JobStatus::Processing);
        assert!(!record.recovery_pending);
        assert!(record.error_message.is_none());
        assert!(record.stream_updates.iter().any(|u| u.starts_with("healed by")));
        assert_eq!(h.orch.running_count().await, 1);

        let cancelled = h.orch.cancel(&record.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(h.orch.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_resumed_job_that_stalls_is_reaped() {
        let h = heal_then_hang();
        let record = resumed_and_hanging(&h).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaped = h.orch.reap_once(Duration::from_millis(1)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, record.id);
        assert!(reaped[0].is_settled());
        assert_eq!(h.orch.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_missing_job_is_not_found() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let err = h.orch.cancel(&JobId::from("nope")).await.unwrap_err();
        assert!(matches!(err, JobError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_reap_once_fails_idle_processing_jobs() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let job = h.store.enqueue(JobRequest::default()).await.unwrap();
        h.store
            .start_processing(&job.id, six_phases(), None)
            .await
            .unwrap();

        // Nothing is idle for an hour yet.
        assert!(h.orch.reap_once(Duration::from_secs(3600)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = h.orch.reap_once(Duration::from_millis(1)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, JobStatus::Failed);
        assert!(reaped[0].error_message.as_deref().unwrap().starts_with("job stalled"));
    }

    #[tokio::test]
    async fn test_reaper_sweeps_and_stops_on_shutdown() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let job = h.store.enqueue(JobRequest::default()).await.unwrap();
        h.store
            .start_processing(&job.id, six_phases(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(h.channel.subscribe("abandoned-session"));
        assert_eq!(h.channel.topic_count(), 1);

        let handle = reaper::spawn_reaper(
            h.orch.clone(),
            Duration::from_millis(5),
            h.orch.shutdown_token(),
        );
        let mut record = job.clone();
        for _ in 0..100 {
            record = h.store.fetch(&job.id).await.unwrap();
            if record.status == JobStatus::Failed && h.channel.topic_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.recovery_pending);
        assert_eq!(h.channel.topic_count(), 0);

        h.orch.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_jobs() {
        let h = harness(ScriptedExecutor::default(), RecordingToolkit::fixing(&[]));
        let token = h.orch.shutdown_token();
        h.orch.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(h.orch.running_count().await, 0);
    }
}
