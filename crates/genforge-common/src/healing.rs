use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Stable identifier of a failure, derived from its message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repair strategies in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PatternMatch,
    ModelAnalysis,
    ContextFix,
    RollbackAndHeal,
}

impl StrategyKind {
    pub const ORDER: [StrategyKind; 4] = [
        StrategyKind::PatternMatch,
        StrategyKind::ModelAnalysis,
        StrategyKind::ContextFix,
        StrategyKind::RollbackAndHeal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternMatch => "pattern_match",
            Self::ModelAnalysis => "model_analysis",
            Self::ContextFix => "context_fix",
            Self::RollbackAndHeal => "rollback_and_heal",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern_match" => Ok(Self::PatternMatch),
            "model_analysis" => Ok(Self::ModelAnalysis),
            "context_fix" => Ok(Self::ContextFix),
            "rollback_and_heal" => Ok(Self::RollbackAndHeal),
            _ => Err(format!("Invalid strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid attempt outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingAttempt {
    pub attempt_number: u32,
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A phase executor raised an error.
    Execution,
    /// The quality gate rejected the output.
    Validation,
}

/// Lifecycle of one healing episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingPhase {
    New,
    Analyzing,
    Success,
    Exhausted,
    /// The engine itself failed, for example a rollback that could not be restored.
    Faulted,
}

impl HealingPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Success | Self::Exhausted | Self::Faulted)
    }
}

/// Previously successful repair for a signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntry {
    pub signature: Signature,
    pub strategy: StrategyKind,
    pub confidence: f64,
    pub successes: u32,
    pub last_success_at: DateTime<Utc>,
}

/// Structured report emitted when every strategy failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    pub job_id: JobId,
    pub signature: Signature,
    pub failure_kind: FailureKind,
    pub error: String,
    pub attempts: Vec<HealingAttempt>,
    pub root_cause: String,
    pub recommended_steps: Vec<String>,
    pub checkpoint_id: String,
    pub rollback_completed: bool,
    pub generated_at: DateTime<Utc>,
}
