//! The four repair strategies.
//!
//! Strategies are the `StrategyKind` variants themselves; [`Attempt`] gives
//! each one the same capability so the engine can walk `StrategyKind::ORDER`.

use async_trait::async_trait;
use genforge_common::StrategyKind;

use super::Failure;
use super::checkpoint::{Checkpoint, CheckpointStore};
use super::knowledge::KnowledgeBase;
use super::toolkit::{RepairRequest, RepairResult, RepairToolkit};
use crate::errors::HealingError;

/// What one attempt gets to work with.
pub struct StrategyContext<'a> {
    pub failure: &'a Failure,
    pub checkpoint: &'a Checkpoint,
    pub attempt_number: u32,
    pub knowledge: &'a KnowledgeBase,
    pub confidence_threshold: f64,
    pub toolkit: &'a dyn RepairToolkit,
    pub checkpoints: &'a dyn CheckpointStore,
}

impl StrategyContext<'_> {
    fn request(&self, strategy: StrategyKind) -> RepairRequest {
        RepairRequest {
            job_id: self.failure.job.id.clone(),
            strategy,
            attempt_number: self.attempt_number,
            failure_kind: self.failure.kind,
            signature: self.failure.signature.clone(),
            error: self.failure.message.clone(),
            phase: self.failure.phase.clone(),
            quality_report: self.failure.report.clone(),
            known_fix: None,
            artifacts: self.failure.artifacts.clone(),
            request: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait Attempt {
    /// `Ok` with `fixed == false` is an ordinary failed attempt. `Err` is an
    /// engine fault and ends the episode.
    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<RepairResult, HealingError>;
}

#[async_trait]
impl Attempt for StrategyKind {
    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<RepairResult, HealingError> {
        let mut request = ctx.request(*self);

        match self {
            StrategyKind::PatternMatch => {
                let Some(entry) = ctx
                    .knowledge
                    .confident(&ctx.failure.signature, ctx.confidence_threshold)
                else {
                    return Ok(RepairResult::not_fixed(format!(
                        "no known fix for {} at confidence >= {:.2}",
                        ctx.failure.signature, ctx.confidence_threshold
                    )));
                };
                request.known_fix = Some(entry);
            }
            StrategyKind::ModelAnalysis => {}
            StrategyKind::ContextFix => {
                request.request = ctx.failure.job.request.clone();
            }
            StrategyKind::RollbackAndHeal => {
                request.artifacts = ctx
                    .checkpoints
                    .restore(ctx.checkpoint)
                    .await
                    .map_err(|source| HealingError::RollbackFailed {
                        checkpoint_id: ctx.checkpoint.id.clone(),
                        source,
                    })?;
                request.request = ctx.failure.job.request.clone();
            }
        }

        Ok(match ctx.toolkit.repair(&request).await {
            Ok(result) => result,
            Err(e) => RepairResult::not_fixed(format!("repair tool error: {:#}", e)),
        })
    }
}
