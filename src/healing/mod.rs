//! Autonomous healing engine.
//!
//! One episode per `(job, signature)`: `new → analyzing → success | exhausted`,
//! or `faulted` when the engine itself breaks. The episode map is the status
//! lock; a second call for an episode that is already analyzing or resolved
//! returns without doing anything.
//!
//! Inside an episode the engine checkpoints the artifacts, then walks
//! `StrategyKind::ORDER` one strategy at a time up to the attempt cap,
//! stopping at the first fix. When every strategy fails the checkpoint is
//! restored, a failure report is built, and the notification sinks fire.

pub mod checkpoint;
pub mod knowledge;
pub mod report;
pub mod signature;
pub mod strategy;
pub mod toolkit;

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use genforge_common::{
    ArtifactSet, AttemptOutcome, EventKind, FailureKind, FailureReport, HealingAttempt,
    HealingPhase, JobId, JobRecord, ProgressEvent, QualityReport, Signature, StrategyKind,
};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::channel::ProgressChannel;
use crate::config::{DEFAULT_CONFIDENCE_THRESHOLD, MAX_STRATEGIES};
use crate::errors::{HealingError, StoreError};
use crate::jobs::JobStore;
use checkpoint::CheckpointStore;
use knowledge::KnowledgeBase;
use report::{AlertSeverity, ChannelSink, HealingAlert, NotificationSink, TracingSink};
use strategy::{Attempt, StrategyContext};
use toolkit::RepairToolkit;

#[derive(Debug, Clone, Copy)]
pub struct HealingSettings {
    pub max_attempts: u32,
    pub confidence_threshold: f64,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            max_attempts: MAX_STRATEGIES,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// A failure handed over by the pipeline.
#[derive(Debug, Clone)]
pub struct Failure {
    /// Snapshot of the job at hand-off time.
    pub job: JobRecord,
    pub kind: FailureKind,
    pub message: String,
    pub signature: Signature,
    pub phase: Option<String>,
    pub report: Option<QualityReport>,
    pub artifacts: ArtifactSet,
}

impl Failure {
    pub fn execution(job: JobRecord, phase: Option<String>, message: String, artifacts: ArtifactSet) -> Self {
        Self {
            signature: signature::signature_for(&message),
            job,
            kind: FailureKind::Execution,
            message,
            phase,
            report: None,
            artifacts,
        }
    }

    pub fn validation(job: JobRecord, report: QualityReport, artifacts: ArtifactSet) -> Self {
        Self {
            signature: signature::quality_signature(&report),
            message: report.summary(),
            job,
            kind: FailureKind::Validation,
            phase: None,
            report: Some(report),
            artifacts,
        }
    }
}

#[derive(Debug)]
pub enum HealingOutcome {
    Healed {
        strategy: StrategyKind,
        artifacts: ArtifactSet,
        attempts: Vec<HealingAttempt>,
    },
    Exhausted {
        report: FailureReport,
        restored: ArtifactSet,
    },
    /// The engine failed. Already alerted; never retried.
    Faulted { error: String },
    /// Another call owns or already resolved this episode.
    Skipped { phase: HealingPhase },
}

pub struct HealingEngine {
    settings: HealingSettings,
    store: JobStore,
    channel: Arc<ProgressChannel>,
    knowledge: Arc<KnowledgeBase>,
    checkpoints: Arc<dyn CheckpointStore>,
    toolkit: Arc<dyn RepairToolkit>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    episodes: DashMap<(JobId, Signature), HealingPhase>,
}

impl HealingEngine {
    pub fn new(
        settings: HealingSettings,
        store: JobStore,
        channel: Arc<ProgressChannel>,
        knowledge: Arc<KnowledgeBase>,
        checkpoints: Arc<dyn CheckpointStore>,
        toolkit: Arc<dyn RepairToolkit>,
    ) -> Self {
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![
            Arc::new(TracingSink),
            Arc::new(ChannelSink::new(channel.clone())),
        ];
        Self {
            settings,
            store,
            channel,
            knowledge,
            checkpoints,
            toolkit,
            sinks,
            episodes: DashMap::new(),
        }
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn episode_phase(&self, job_id: &JobId, signature: &Signature) -> HealingPhase {
        self.episodes
            .get(&(job_id.clone(), signature.clone()))
            .map(|p| *p)
            .unwrap_or(HealingPhase::New)
    }

    /// Forget resolved episodes whose job is settled or gone. Returns how many were dropped.
    pub async fn evict_settled(&self) -> usize {
        let resolved: Vec<(JobId, Signature)> = self
            .episodes
            .iter()
            .filter(|episode| episode.value().is_final())
            .map(|episode| episode.key().clone())
            .collect();

        let mut evicted = 0;
        for key in resolved {
            let settled = match self.store.fetch(&key.0).await {
                Ok(record) => record.is_settled(),
                Err(StoreError::NotFound { .. }) => true,
                Err(e) => {
                    warn!(job_id = %key.0, error = %e, "episode sweep could not read job");
                    false
                }
            };
            if settled && self.episodes.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    #[instrument(skip_all, fields(job_id = %failure.job.id, signature = %failure.signature))]
    pub async fn heal(&self, failure: &Failure) -> HealingOutcome {
        let key = (failure.job.id.clone(), failure.signature.clone());
        match self.episodes.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let phase = *existing.get();
                info!(?phase, "healing episode already claimed");
                return HealingOutcome::Skipped { phase };
            }
            Entry::Vacant(slot) => {
                slot.insert(HealingPhase::Analyzing);
            }
        }

        info!(kind = ?failure.kind, error = %failure.message, "healing started");
        self.publish(
            failure,
            EventKind::HealingStarted,
            json!({
                "job_id": failure.job.id,
                "signature": failure.signature,
                "failure_kind": failure.kind,
                "phase": failure.phase,
                "error": failure.message,
            }),
        );

        let checkpoint = match self.checkpoints.create(&failure.job.id, &failure.artifacts).await {
            Ok(c) => c,
            Err(source) => {
                return self.fault(
                    failure,
                    key,
                    HealingError::CheckpointFailed {
                        checkpoint_id: format!("{}-pending", failure.job.id),
                        source,
                    },
                );
            }
        };

        let cap = self.settings.max_attempts.min(MAX_STRATEGIES) as usize;
        let mut attempts: Vec<HealingAttempt> = Vec::new();
        let mut tool_root_cause = None;

        for (i, strategy) in StrategyKind::ORDER.iter().take(cap).enumerate() {
            let ctx = StrategyContext {
                failure,
                checkpoint: &checkpoint,
                attempt_number: i as u32 + 1,
                knowledge: &self.knowledge,
                confidence_threshold: self.settings.confidence_threshold,
                toolkit: self.toolkit.as_ref(),
                checkpoints: self.checkpoints.as_ref(),
            };

            let result = match strategy.attempt(&ctx).await {
                Ok(result) => result,
                Err(e) => return self.fault(failure, key, e),
            };
            if result.root_cause.is_some() {
                tool_root_cause = result.root_cause.clone();
            }

            let attempt = HealingAttempt {
                attempt_number: ctx.attempt_number,
                strategy: *strategy,
                outcome: if result.fixed {
                    AttemptOutcome::Success
                } else {
                    AttemptOutcome::Failed
                },
                detail: result.detail.clone(),
            };
            self.record_attempt(failure, &attempt).await;
            attempts.push(attempt);

            if result.fixed {
                let entry = self.knowledge.record_success(&failure.signature, *strategy);
                self.knowledge.persist_or_warn();
                self.episodes.insert(key, HealingPhase::Success);
                info!(
                    strategy = %strategy,
                    attempts = attempts.len(),
                    confidence = entry.confidence,
                    "healing succeeded"
                );

                let mut artifacts = failure.artifacts.clone();
                artifacts.extend(result.patched_artifacts);
                return HealingOutcome::Healed {
                    strategy: *strategy,
                    artifacts,
                    attempts,
                };
            }
        }

        let restored = match self.checkpoints.restore(&checkpoint).await {
            Ok(restored) => restored,
            Err(source) => {
                return self.fault(
                    failure,
                    key,
                    HealingError::RollbackFailed {
                        checkpoint_id: checkpoint.id.clone(),
                        source,
                    },
                );
            }
        };

        let report = report::build_report(failure, &attempts, tool_root_cause, &checkpoint.id, true);
        if let Err(e) = self.store.record_failure_report(&report).await {
            warn!(error = %e, "failed to store failure report");
        }
        self.episodes.insert(key, HealingPhase::Exhausted);
        warn!(attempts = attempts.len(), checkpoint = %checkpoint.id, "healing exhausted");

        self.notify(&HealingAlert {
            severity: AlertSeverity::High,
            job_id: failure.job.id.clone(),
            session_id: failure.job.session_id.clone(),
            signature: failure.signature.clone(),
            message: format!(
                "Healing exhausted after {} attempts; manual intervention required",
                attempts.len()
            ),
            report: Some(report.clone()),
        });

        HealingOutcome::Exhausted { report, restored }
    }

    fn fault(
        &self,
        failure: &Failure,
        key: (JobId, Signature),
        err: HealingError,
    ) -> HealingOutcome {
        self.episodes.insert(key, HealingPhase::Faulted);
        error!(error = %err, "healing engine fault");
        self.notify(&HealingAlert {
            severity: AlertSeverity::Critical,
            job_id: failure.job.id.clone(),
            session_id: failure.job.session_id.clone(),
            signature: failure.signature.clone(),
            message: err.to_string(),
            report: None,
        });
        HealingOutcome::Faulted {
            error: err.to_string(),
        }
    }

    async fn record_attempt(&self, failure: &Failure, attempt: &HealingAttempt) {
        if let Err(e) = self
            .store
            .record_healing_attempt(&failure.job.id, &failure.signature, attempt)
            .await
        {
            warn!(error = %e, attempt = attempt.attempt_number, "failed to store healing attempt");
        }
        self.publish(
            failure,
            EventKind::HealingAttempt,
            json!({
                "job_id": failure.job.id,
                "signature": failure.signature,
                "attempt": attempt,
            }),
        );
    }

    fn publish(&self, failure: &Failure, kind: EventKind, payload: serde_json::Value) {
        self.channel
            .publish_for(&failure.job, ProgressEvent::new(kind, payload));
    }

    fn notify(&self, alert: &HealingAlert) {
        for sink in &self.sinks {
            sink.notify(alert);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::checkpoint::MemoryCheckpoints;
    use super::test_support::*;
    use super::*;
    use genforge_common::{Artifact, JobRequest};

    struct Harness {
        engine: HealingEngine,
        store: JobStore,
        channel: Arc<ProgressChannel>,
        knowledge: Arc<KnowledgeBase>,
    }

    fn harness(
        toolkit: Arc<dyn RepairToolkit>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: HealingSettings,
    ) -> Harness {
        let store = JobStore::in_memory().unwrap();
        let channel = Arc::new(ProgressChannel::default());
        let knowledge = Arc::new(KnowledgeBase::in_memory());
        let engine = HealingEngine::new(
            settings,
            store.clone(),
            channel.clone(),
            knowledge.clone(),
            checkpoints,
            toolkit,
        );
        Harness {
            engine,
            store,
            channel,
            knowledge,
        }
    }

    async fn stored_failure(store: &JobStore, message: &str) -> Failure {
        let job = store.enqueue(JobRequest::default()).await.unwrap();
        failure_for(job, FailureKind::Execution, message)
    }

    #[tokio::test]
    async fn test_pattern_match_heals_on_first_attempt() {
        let toolkit = Arc::new(
            RecordingToolkit::fixing(&[StrategyKind::PatternMatch])
                .with_patch(vec![Artifact::new("src/fixed.ts", "ok")]),
        );
        let h = harness(toolkit.clone(), Arc::new(MemoryCheckpoints::default()), HealingSettings::default());
        let failure = stored_failure(&h.store, "module not found: ./utils").await;
        for _ in 0..3 {
            h.knowledge.record_success(&failure.signature, StrategyKind::ModelAnalysis);
        }

        match h.engine.heal(&failure).await {
            HealingOutcome::Healed {
                strategy,
                artifacts,
                attempts,
            } => {
                assert_eq!(strategy, StrategyKind::PatternMatch);
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
                assert!(artifacts.contains("src/fixed.ts"));
                assert!(artifacts.contains("index.html"));
            }
            other => panic!("expected Healed, got {:?}", other),
        }

        assert_eq!(
            h.engine.episode_phase(&failure.job.id, &failure.signature),
            HealingPhase::Success
        );
        assert_eq!(h.knowledge.get(&failure.signature).unwrap().successes, 4);
        let stored = h.store.healing_attempts(&failure.job.id).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_all_strategies_fail_exhausts_with_rollback() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[]));
        let h = harness(toolkit.clone(), Arc::new(MemoryCheckpoints::default()), HealingSettings::default());
        let failure = stored_failure(&h.store, "syntax error in App.tsx").await;
        let mut rx = h.channel.subscribe(failure.job.id.as_str());

        let outcome = h.engine.heal(&failure).await;
        let HealingOutcome::Exhausted { report, restored } = outcome else {
            panic!("expected Exhausted, got {:?}", outcome);
        };
        assert_eq!(report.attempts.len(), 4);
        assert!(report.rollback_completed);
        assert!(report.root_cause.contains("does not parse"));
        assert_eq!(restored, failure.artifacts);

        let strategies: Vec<StrategyKind> = report.attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, StrategyKind::ORDER.to_vec());
        // Pattern match had no knowledge, so the toolkit saw three calls.
        assert_eq!(toolkit.calls().len(), 3);

        let stored = h.store.latest_failure_report(&failure.job.id).await.unwrap();
        assert_eq!(stored.unwrap().signature, failure.signature);
        assert_eq!(h.store.healing_attempts(&failure.job.id).await.unwrap().len(), 4);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind().unwrap());
        }
        assert_eq!(kinds.first(), Some(&EventKind::HealingStarted));
        assert_eq!(kinds.last(), Some(&EventKind::HealingAlert));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::HealingAttempt).count(), 4);
        assert!(h.knowledge.is_empty());
    }

    #[tokio::test]
    async fn test_attempt_cap_is_respected() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[StrategyKind::RollbackAndHeal]));
        let settings = HealingSettings {
            max_attempts: 2,
            ..Default::default()
        };
        let h = harness(toolkit, Arc::new(MemoryCheckpoints::default()), settings);
        let failure = stored_failure(&h.store, "boom").await;

        let HealingOutcome::Exhausted { report, .. } = h.engine.heal(&failure).await else {
            panic!("expected Exhausted");
        };
        assert_eq!(report.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_second_invocation_is_a_no_op() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[]));
        let h = harness(toolkit.clone(), Arc::new(MemoryCheckpoints::default()), HealingSettings::default());
        let failure = stored_failure(&h.store, "boom").await;

        h.engine.episodes.insert(
            (failure.job.id.clone(), failure.signature.clone()),
            HealingPhase::Analyzing,
        );
        let outcome = h.engine.heal(&failure).await;
        assert!(matches!(
            outcome,
            HealingOutcome::Skipped {
                phase: HealingPhase::Analyzing
            }
        ));
        assert!(toolkit.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_episode_is_never_retried() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[]));
        let h = harness(toolkit.clone(), Arc::new(MemoryCheckpoints::default()), HealingSettings::default());
        let failure = stored_failure(&h.store, "boom").await;

        assert!(matches!(h.engine.heal(&failure).await, HealingOutcome::Exhausted { .. }));
        let calls = toolkit.calls().len();
        assert!(matches!(
            h.engine.heal(&failure).await,
            HealingOutcome::Skipped {
                phase: HealingPhase::Exhausted
            }
        ));
        assert_eq!(toolkit.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_evict_settled_keeps_open_episodes() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[]));
        let h = harness(toolkit, Arc::new(MemoryCheckpoints::default()), HealingSettings::default());

        let settled = stored_failure(&h.store, "boom").await;
        assert!(matches!(h.engine.heal(&settled).await, HealingOutcome::Exhausted { .. }));
        h.store.cancel(&settled.job.id).await.unwrap();

        let live = stored_failure(&h.store, "other boom").await;
        assert!(matches!(h.engine.heal(&live).await, HealingOutcome::Exhausted { .. }));

        let running = stored_failure(&h.store, "still running").await;
        h.engine.episodes.insert(
            (running.job.id.clone(), running.signature.clone()),
            HealingPhase::Analyzing,
        );
        h.store.cancel(&running.job.id).await.unwrap();

        assert_eq!(h.engine.evict_settled().await, 1);
        assert_eq!(
            h.engine.episode_phase(&settled.job.id, &settled.signature),
            HealingPhase::New
        );
        assert_eq!(
            h.engine.episode_phase(&live.job.id, &live.signature),
            HealingPhase::Exhausted
        );
        assert_eq!(
            h.engine.episode_phase(&running.job.id, &running.signature),
            HealingPhase::Analyzing
        );
    }

    #[tokio::test]
    async fn test_rollback_failure_raises_critical_alert() {
        let toolkit = Arc::new(RecordingToolkit::fixing(&[]));
        let h = harness(toolkit, Arc::new(UnrestorableCheckpoints), HealingSettings::default());
        let failure = stored_failure(&h.store, "boom").await;
        let mut rx = h.channel.subscribe(failure.job.id.as_str());

        let outcome = h.engine.heal(&failure).await;
        assert!(matches!(outcome, HealingOutcome::Faulted { .. }));
        assert_eq!(
            h.engine.episode_phase(&failure.job.id, &failure.signature),
            HealingPhase::Faulted
        );

        let mut alert = None;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == Some(EventKind::HealingAlert) {
                alert = Some(event);
            }
        }
        let alert = alert.expect("critical alert published");
        assert_eq!(alert.payload["severity"], "critical");
        assert!(h.store.latest_failure_report(&failure.job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_toolkit_errors_count_as_failed_attempts() {
        let toolkit = Arc::new(RecordingToolkit::broken());
        let h = harness(toolkit, Arc::new(MemoryCheckpoints::default()), HealingSettings::default());
        let failure = stored_failure(&h.store, "boom").await;

        let HealingOutcome::Exhausted { report, .. } = h.engine.heal(&failure).await else {
            panic!("expected Exhausted");
        };
        assert_eq!(report.attempts.len(), 4);
        assert!(report.attempts[1].detail.contains("toolkit crashed"));
    }
}
