//! Shared domain types for genforge.
//!
//! Everything here crosses a process boundary: job records served over HTTP,
//! progress events pushed over the channel, quality reports and healing
//! records stored next to jobs.

pub mod artifact;
pub mod event;
pub mod healing;
pub mod job;
pub mod quality;

pub use artifact::{Artifact, ArtifactKind, ArtifactSet};
pub use event::{EventKind, ProgressEvent};
pub use healing::{
    AttemptOutcome, FailureKind, FailureReport, HealingAttempt, HealingPhase, KnowledgeEntry,
    Signature, StrategyKind,
};
pub use job::{EnqueueResponse, JobId, JobRecord, JobRequest, JobStatus, PhaseRecord, progress_for};
pub use quality::{IssueCategory, IssueSeverity, QualityIssue, QualityReport};
