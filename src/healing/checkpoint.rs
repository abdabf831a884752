//! Rollback checkpoints of a job's artifact set.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use genforge_common::{ArtifactSet, JobId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub artifacts: ArtifactSet,
}

impl Checkpoint {
    pub fn new(job_id: &JobId, artifacts: &ArtifactSet) -> Self {
        Self {
            id: format!("{}-{}", job_id, Uuid::new_v4().simple()),
            job_id: job_id.clone(),
            created_at: Utc::now(),
            artifacts: artifacts.clone(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn create(&self, job_id: &JobId, artifacts: &ArtifactSet) -> Result<Checkpoint>;

    /// Read a checkpoint back. The returned set replaces the job's current artifacts.
    async fn restore(&self, checkpoint: &Checkpoint) -> Result<ArtifactSet>;
}

/// Checkpoints as JSON files, one per checkpoint id.
pub struct FileCheckpoints {
    dir: PathBuf,
}

impl FileCheckpoints {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoints {
    async fn create(&self, job_id: &JobId, artifacts: &ArtifactSet) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(job_id, artifacts);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        let path = self.path_for(&checkpoint.id);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        Ok(checkpoint)
    }

    async fn restore(&self, checkpoint: &Checkpoint) -> Result<ArtifactSet> {
        let path = self.path_for(&checkpoint.id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let stored: Checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;
        if stored.job_id != checkpoint.job_id {
            bail!(
                "Checkpoint {} belongs to job {}, not {}",
                stored.id,
                stored.job_id,
                checkpoint.job_id
            );
        }
        Ok(stored.artifacts)
    }
}

/// Checkpoints kept in memory for the life of the process.
#[derive(Default)]
pub struct MemoryCheckpoints {
    checkpoints: DashMap<String, Checkpoint>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn create(&self, job_id: &JobId, artifacts: &ArtifactSet) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(job_id, artifacts);
        self.checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn restore(&self, checkpoint: &Checkpoint) -> Result<ArtifactSet> {
        self.checkpoints
            .get(&checkpoint.id)
            .map(|c| c.artifacts.clone())
            .with_context(|| format!("Unknown checkpoint {}", checkpoint.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genforge_common::Artifact;

    fn artifacts() -> ArtifactSet {
        vec![Artifact::new("index.html", "<html></html>")]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_file_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpoints::new(dir.path().join("checkpoints"));
        let job = JobId::from("job-1");
        let checkpoint = store.create(&job, &artifacts()).await.unwrap();
        assert!(checkpoint.id.starts_with("job-1-"));
        assert!(dir
            .path()
            .join("checkpoints")
            .join(format!("{}.json", checkpoint.id))
            .exists());

        let restored = store.restore(&checkpoint).await.unwrap();
        assert_eq!(restored, artifacts());
    }

    #[tokio::test]
    async fn test_checkpoints_of_one_job_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpoints::new(dir.path().to_path_buf());
        let job = JobId::from("job-1");
        let first = store.create(&job, &artifacts()).await.unwrap();
        let mut changed = artifacts();
        changed.upsert(genforge_common::Artifact::new("index.html", "<html>v2</html>"));
        let second = store.create(&job, &changed).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(store.restore(&first).await.unwrap(), artifacts());
        assert_eq!(store.restore(&second).await.unwrap(), changed);
    }

    #[tokio::test]
    async fn test_file_restore_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpoints::new(dir.path().to_path_buf());
        let checkpoint = Checkpoint::new(&JobId::from("j"), &artifacts());
        assert!(store.restore(&checkpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_checkpoints() {
        let store = MemoryCheckpoints::default();
        let checkpoint = store.create(&JobId::from("j"), &artifacts()).await.unwrap();
        assert_eq!(store.restore(&checkpoint).await.unwrap().len(), 1);
    }
}
