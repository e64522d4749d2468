//! Bounded retry loop around human review.
//!
//! Each iteration runs the stages, hands the artifact to the reviewer and
//! records how it ended. Rejection feeds the next attempt through the
//! [`IterationContext`]; approval or the iteration ceiling ends the run.
//! A reviewer that goes away ends it too, even mid-stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use memeloop_common::{IterationContext, IterationOutcome, IterationRecord, MemeSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::stages::StageRunner;
use super::{Artifact, Reviewer};
use crate::errors::{ApprovalError, RunError};
use crate::session::ApprovalOutcome;
use crate::store::{RunRecord, RunStatus, RunStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Approved,
    MaxIterationsExceeded,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Approved => "approved",
            FinalStatus::MaxIterationsExceeded => "max_iterations_exceeded",
        }
    }
}

impl From<FinalStatus> for RunStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Approved => RunStatus::Approved,
            FinalStatus::MaxIterationsExceeded => RunStatus::MaxIterationsExceeded,
        }
    }
}

/// A run that produced an artifact, approved or not.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub run_id: Uuid,
    pub status: FinalStatus,
    pub artifact: Artifact,
    pub context: IterationContext,
}

/// A run that ended without a final artifact.
#[derive(Debug, Error)]
#[error("Run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    #[source]
    pub error: RunError,
    pub context: IterationContext,
}

pub struct IterationController {
    stages: StageRunner,
    max_iterations: u32,
    store: Arc<dyn RunStore>,
}

impl IterationController {
    /// A ceiling of zero is raised to one; every run makes at least one attempt.
    pub fn new(stages: StageRunner, max_iterations: u32, store: Arc<dyn RunStore>) -> Self {
        Self {
            stages,
            max_iterations: max_iterations.max(1),
            store,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn run(
        &self,
        prompt: &str,
        reviewer: &dyn Reviewer,
    ) -> Result<FinalResult, RunFailure> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut context = IterationContext::new(prompt);
        tracing::info!(%run_id, max_iterations = self.max_iterations, "run started");

        let mut iteration = 1;
        loop {
            tracing::info!(%run_id, iteration, "iteration started");
            let staged = tokio::select! {
                biased;
                gone = reviewer.closed() => Err(gone),
                staged = self.stages.run(prompt, &context, reviewer) => Ok(staged),
            };
            let artifact = match staged {
                Ok(Ok(artifact)) => artifact,
                Err(gone) => {
                    tracing::warn!(%run_id, iteration, error = %gone, "reviewer left during stages; run aborted");
                    context.push(record(iteration, None, None, None, IterationOutcome::Errored));
                    return Err(self.abort(run_id, gone, context, started_at).await);
                }
                Ok(Err(failure)) => {
                    tracing::error!(
                        %run_id,
                        iteration,
                        stage = failure.error.stage(),
                        error = %failure.error,
                        "stage failed"
                    );
                    context.push(record(
                        iteration,
                        failure.partial_spec,
                        None,
                        None,
                        IterationOutcome::Errored,
                    ));
                    self.persist(run_id, RunStatus::Failed, &context, started_at)
                        .await;
                    return Err(RunFailure {
                        run_id,
                        error: RunError::Stage(failure.error),
                        context,
                    });
                }
            };

            let reviewed = tokio::select! {
                biased;
                gone = reviewer.closed() => Err(gone),
                reviewed = reviewer.review(iteration, &artifact) => reviewed,
            };
            let feedback = match reviewed {
                Ok(ApprovalOutcome::Approved) => {
                    context.push(record(
                        iteration,
                        Some(artifact.spec.clone()),
                        Some(artifact.url.clone()),
                        None,
                        IterationOutcome::Approved,
                    ));
                    tracing::info!(%run_id, iteration, url = %artifact.url, "artifact approved");
                    return Ok(self
                        .finish(run_id, FinalStatus::Approved, artifact, context, started_at)
                        .await);
                }
                Ok(ApprovalOutcome::Rejected { feedback }) => feedback,
                Ok(ApprovalOutcome::TimedOut) => String::new(),
                Err(e) => {
                    tracing::warn!(%run_id, iteration, error = %e, "run aborted while awaiting approval");
                    context.push(record(
                        iteration,
                        Some(artifact.spec),
                        Some(artifact.url),
                        None,
                        IterationOutcome::Errored,
                    ));
                    return Err(self.abort(run_id, e, context, started_at).await);
                }
            };

            tracing::info!(%run_id, iteration, feedback = %feedback, "artifact rejected");
            context.push(record(
                iteration,
                Some(artifact.spec.clone()),
                Some(artifact.url.clone()),
                Some(feedback),
                IterationOutcome::Rejected,
            ));

            if iteration >= self.max_iterations {
                tracing::info!(%run_id, iterations = context.len(), "iteration ceiling reached");
                return Ok(self
                    .finish(
                        run_id,
                        FinalStatus::MaxIterationsExceeded,
                        artifact,
                        context,
                        started_at,
                    )
                    .await);
            }
            reviewer.notify(&format!(
                "Iteration {} rejected, generating a new meme...",
                iteration
            ));
            iteration += 1;
        }
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: FinalStatus,
        artifact: Artifact,
        context: IterationContext,
        started_at: DateTime<Utc>,
    ) -> FinalResult {
        self.persist(run_id, status.into(), &context, started_at)
            .await;
        FinalResult {
            run_id,
            status,
            artifact,
            context,
        }
    }

    async fn abort(
        &self,
        run_id: Uuid,
        error: ApprovalError,
        context: IterationContext,
        started_at: DateTime<Utc>,
    ) -> RunFailure {
        self.persist(run_id, RunStatus::Aborted, &context, started_at)
            .await;
        RunFailure {
            run_id,
            error: RunError::Aborted(error),
            context,
        }
    }

    async fn persist(
        &self,
        run_id: Uuid,
        status: RunStatus,
        context: &IterationContext,
        started_at: DateTime<Utc>,
    ) {
        let record = RunRecord {
            run_id,
            status,
            context: context.clone(),
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.store.save(&record).await {
            tracing::warn!(%run_id, error = %e, "failed to save run record");
        }
    }
}

fn record(
    iteration: u32,
    produced_spec: Option<MemeSpec>,
    artifact_reference: Option<String>,
    human_feedback: Option<String>,
    outcome: IterationOutcome,
) -> IterationRecord {
    IterationRecord {
        iteration,
        produced_spec,
        artifact_reference,
        human_feedback,
        outcome,
        recorded_at: Utc::now(),
    }
}
