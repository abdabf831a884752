//! Sequential phase pipeline for one job.
//!
//! Phases run strictly in order. Each success is appended to the job's phase
//! history with a recomputed progress; the first error stops the run and is
//! returned as [`JobError::Execution`] for the caller to hand to healing.

pub mod executor;

use std::sync::Arc;
use std::time::Instant;

use genforge_common::{ArtifactSet, JobRecord, PhaseRecord, ProgressEvent, progress_for};
use tracing::{debug, info, warn};

use crate::channel::ProgressChannel;
use crate::errors::JobError;
use crate::jobs::JobStore;
pub use executor::{CommandPhaseExecutor, PhaseContext, PhaseExecutor, PhaseOutput};

pub struct PhasePipeline {
    store: JobStore,
    channel: Arc<ProgressChannel>,
    executor: Arc<dyn PhaseExecutor>,
}

impl PhasePipeline {
    pub fn new(store: JobStore, channel: Arc<ProgressChannel>, executor: Arc<dyn PhaseExecutor>) -> Self {
        Self {
            store,
            channel,
            executor,
        }
    }

    /// Run `record.expected_phases[from..]`, accumulating into `artifacts`.
    ///
    /// Returns the record after the last phase was written.
    pub async fn run_phases(
        &self,
        record: &JobRecord,
        from: usize,
        platform: &str,
        artifacts: &mut ArtifactSet,
    ) -> Result<JobRecord, JobError> {
        let expected = record.expected_phases.clone();
        let total = expected.len();
        let mut current = record.clone();

        for (index, phase) in expected.iter().enumerate().skip(from) {
            current = self.store.begin_phase(&record.id, phase).await?;
            self.channel.publish_status(&current);
            debug!(job_id = %record.id, phase, index, total, "phase started");

            let ctx = PhaseContext {
                job_id: record.id.clone(),
                phase: phase.clone(),
                phase_index: index,
                total_phases: total,
                platform: platform.to_string(),
                request: record.request.clone(),
                prior: current.phases.clone(),
                artifacts: artifacts.clone(),
            };

            let started = Instant::now();
            let output = match self.executor.execute(&ctx).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(job_id = %record.id, phase, error = %format!("{:#}", e), "phase failed");
                    return Err(JobError::Execution {
                        phase: phase.clone(),
                        message: format!("{:#}", e),
                    });
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let paths: Vec<String> = output.artifacts.iter().map(|a| a.path.clone()).collect();
            artifacts.extend(output.artifacts);

            let completed = current.phases.len() + 1;
            current = self
                .store
                .record_phase(
                    &record.id,
                    PhaseRecord {
                        name: phase.clone(),
                        duration_ms,
                        result: output.result,
                    },
                    progress_for(completed, total),
                )
                .await?;
            self.channel.publish_status(&current);
            if !paths.is_empty() {
                self.channel
                    .publish_for(&current, ProgressEvent::code_update(&record.id, phase, &paths));
            }
            info!(
                job_id = %record.id,
                phase,
                duration_ms,
                progress = current.progress,
                "phase completed"
            );
        }

        Ok(current)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedExecutor;
    use super::*;
    use genforge_common::{Artifact, EventKind, JobRequest, JobStatus};

    fn phases(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("phase-{}", i)).collect()
    }

    async fn processing_job(store: &JobStore, n: usize) -> JobRecord {
        let job = store.enqueue(JobRequest::default()).await.unwrap();
        store.start_processing(&job.id, phases(n), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_all_phases_succeed_in_order() {
        let store = JobStore::in_memory().unwrap();
        let channel = Arc::new(ProgressChannel::default());
        let executor = Arc::new(
            ScriptedExecutor::default()
                .producing("phase-2", vec![Artifact::new("src/App.tsx", "app")]),
        );
        let pipeline = PhasePipeline::new(store.clone(), channel.clone(), executor.clone());
        let job = processing_job(&store, 6).await;
        let mut rx = channel.subscribe(job.id.as_str());

        let mut artifacts = ArtifactSet::new();
        let record = pipeline.run_phases(&job, 0, "react", &mut artifacts).await.unwrap();

        assert_eq!(record.progress, 100);
        assert_eq!(record.phases.len(), 6);
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(executor.calls(), phases(6));
        assert_eq!(record.phases[3].result["prior"], 3);
        assert!(artifacts.contains("src/App.tsx"));

        let mut last_progress = 0;
        let mut code_updates = 0;
        while let Ok(event) = rx.try_recv() {
            match event.kind() {
                Some(EventKind::StatusUpdate) => {
                    let r = event.job_record().unwrap();
                    assert!(r.progress >= last_progress, "progress went backwards");
                    last_progress = r.progress;
                }
                Some(EventKind::CodeUpdate) => code_updates += 1,
                _ => {}
            }
        }
        assert_eq!(last_progress, 100);
        assert_eq!(code_updates, 1);
    }

    #[tokio::test]
    async fn test_failure_stops_at_failed_phase() {
        let store = JobStore::in_memory().unwrap();
        let channel = Arc::new(ProgressChannel::default());
        let executor = Arc::new(ScriptedExecutor::default().failing("phase-3", 1));
        let pipeline = PhasePipeline::new(store.clone(), channel, executor.clone());
        let job = processing_job(&store, 6).await;

        let mut artifacts = ArtifactSet::new();
        let err = pipeline
            .run_phases(&job, 0, "react", &mut artifacts)
            .await
            .unwrap_err();
        match err {
            JobError::Execution { phase, message } => {
                assert_eq!(phase, "phase-3");
                assert!(message.contains("executor crashed"));
            }
            other => panic!("expected Execution, got {:?}", other),
        }
        assert_eq!(executor.calls().len(), 3);

        let stored = store.fetch(&job.id).await.unwrap();
        assert_eq!(stored.phases.len(), 2);
        assert_eq!(stored.progress, 33);
        assert_eq!(stored.current_step, "phase-3");
    }

    #[tokio::test]
    async fn test_resume_skips_completed_phases() {
        let store = JobStore::in_memory().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        let pipeline = PhasePipeline::new(store.clone(), Arc::new(ProgressChannel::default()), executor.clone());
        let job = processing_job(&store, 3).await;

        let mut artifacts = ArtifactSet::new();
        let record = pipeline.run_phases(&job, 2, "react", &mut artifacts).await.unwrap();
        assert_eq!(executor.calls(), vec!["phase-3"]);
        assert_eq!(record.progress, 33);
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_pipeline() {
        let store = JobStore::in_memory().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        let pipeline = PhasePipeline::new(store.clone(), Arc::new(ProgressChannel::default()), executor.clone());
        let job = processing_job(&store, 3).await;
        store.cancel(&job.id).await.unwrap();

        let mut artifacts = ArtifactSet::new();
        let err = pipeline
            .run_phases(&job, 0, "react", &mut artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Store(_)));
        assert!(executor.calls().is_empty());
    }
}
