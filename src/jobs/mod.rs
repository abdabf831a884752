//! Durable job record store.
//!
//! `JobStore` is the async facade the rest of the crate talks to. Every
//! write goes through a state guard in [`db::JobDb`], so a settled record
//! can never be modified again.

pub mod db;

use std::path::Path;

use chrono::{DateTime, Utc};
use genforge_common::{
    FailureReport, HealingAttempt, JobId, JobRecord, JobRequest, PhaseRecord, Signature,
};

use crate::errors::StoreError;
pub use db::{AttemptRecord, DbHandle, JobDb};

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct JobStore {
    db: DbHandle,
}

impl JobStore {
    pub fn new(db: JobDb) -> Self {
        Self {
            db: DbHandle::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(JobDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(JobDb::new_in_memory()?))
    }

    pub async fn enqueue(&self, request: JobRequest) -> Result<JobRecord> {
        let id = JobId::new();
        self.db.call(move |db| db.insert_job(&id, &request)).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let id = id.clone();
        self.db.call(move |db| db.get_job(&id)).await
    }

    /// Like `get`, but a missing job is an error.
    pub async fn fetch(&self, id: &JobId) -> Result<JobRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<JobRecord>> {
        self.db.call(move |db| db.list_jobs(limit)).await
    }

    pub async fn start_processing(
        &self,
        id: &JobId,
        expected_phases: Vec<String>,
        estimated_completion_at: Option<DateTime<Utc>>,
    ) -> Result<JobRecord> {
        let id = id.clone();
        self.db
            .call(move |db| db.start_processing(&id, expected_phases, estimated_completion_at))
            .await
    }

    pub async fn begin_phase(&self, id: &JobId, phase: &str) -> Result<JobRecord> {
        let (id, phase) = (id.clone(), phase.to_string());
        self.db.call(move |db| db.begin_phase(&id, &phase)).await
    }

    pub async fn record_phase(
        &self,
        id: &JobId,
        phase: PhaseRecord,
        progress: u8,
    ) -> Result<JobRecord> {
        let id = id.clone();
        self.db
            .call(move |db| db.record_phase(&id, phase, progress))
            .await
    }

    pub async fn append_stream_update(&self, id: &JobId, update: &str) -> Result<JobRecord> {
        let (id, update) = (id.clone(), update.to_string());
        self.db
            .call(move |db| db.append_stream_update(&id, &update))
            .await
    }

    pub async fn complete(&self, id: &JobId, output: serde_json::Value) -> Result<JobRecord> {
        let id = id.clone();
        self.db.call(move |db| db.complete(&id, output)).await
    }

    pub async fn fail(&self, id: &JobId, message: &str, recovery_pending: bool) -> Result<JobRecord> {
        let (id, message) = (id.clone(), message.to_string());
        self.db
            .call(move |db| db.fail(&id, &message, recovery_pending))
            .await
    }

    pub async fn mark_recovered(&self, id: &JobId, note: &str) -> Result<JobRecord> {
        let (id, note) = (id.clone(), note.to_string());
        self.db
            .call(move |db| db.mark_recovered(&id, &note))
            .await
    }

    pub async fn settle_failure(&self, id: &JobId, message: &str) -> Result<JobRecord> {
        let (id, message) = (id.clone(), message.to_string());
        self.db
            .call(move |db| db.settle_failure(&id, &message))
            .await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord> {
        let id = id.clone();
        self.db.call(move |db| db.cancel(&id)).await
    }

    pub async fn reap_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        self.db.call(move |db| db.reap_stale(cutoff)).await
    }

    pub async fn record_healing_attempt(
        &self,
        job_id: &JobId,
        signature: &Signature,
        attempt: &HealingAttempt,
    ) -> Result<()> {
        let (job_id, signature, attempt) = (job_id.clone(), signature.clone(), attempt.clone());
        self.db
            .call(move |db| db.insert_healing_attempt(&job_id, &signature, &attempt))
            .await
    }

    pub async fn healing_attempts(&self, job_id: &JobId) -> Result<Vec<AttemptRecord>> {
        let job_id = job_id.clone();
        self.db.call(move |db| db.healing_attempts(&job_id)).await
    }

    pub async fn record_failure_report(&self, report: &FailureReport) -> Result<()> {
        let report = report.clone();
        self.db
            .call(move |db| db.insert_failure_report(&report))
            .await
    }

    pub async fn latest_failure_report(&self, job_id: &JobId) -> Result<Option<FailureReport>> {
        let job_id = job_id.clone();
        self.db
            .call(move |db| db.latest_failure_report(&job_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genforge_common::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_lifecycle_through_handle() {
        let store = JobStore::in_memory().unwrap();
        let job = store
            .enqueue(JobRequest {
                request: json!({"prompt": "landing page"}),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .start_processing(&job.id, vec!["plan".into(), "generate".into()], None)
            .await
            .unwrap();
        store.begin_phase(&job.id, "plan").await.unwrap();
        let r = store
            .record_phase(
                &job.id,
                PhaseRecord {
                    name: "plan".into(),
                    duration_ms: 12,
                    result: json!("ok"),
                },
                50,
            )
            .await
            .unwrap();
        assert_eq!(r.progress, 50);
        assert_eq!(
            r.stream_updates,
            vec!["queued", "processing", "phase plan started", "phase plan completed"]
        );

        let cancelled = store.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(store.fetch(&job.id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let store = JobStore::in_memory().unwrap();
        let err = store.fetch(&JobId::from("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.db");
        let id = {
            let store = JobStore::open(&path).unwrap();
            store.enqueue(JobRequest::default()).await.unwrap().id
        };
        let reopened = JobStore::open(&path).unwrap();
        assert!(reopened.get(&id).await.unwrap().is_some());
    }
}
