//! Meme pipeline: stage sequencing and the bounded approval loop.
//!
//! ## Components
//!
//! - [`stages`]: collaborator traits and the [`StageRunner`] that chains them
//! - [`controller`]: [`IterationController`], the retry loop around human review
//! - [`reviewer`]: [`Reviewer`] implementations (WebSocket channel, terminal)

pub mod controller;
pub mod reviewer;
pub mod stages;

use async_trait::async_trait;
use memeloop_common::MemeSpec;
use serde::{Deserialize, Serialize};

use crate::errors::ApprovalError;
use crate::session::ApprovalOutcome;

pub use controller::{FinalResult, FinalStatus, IterationController, RunFailure};
pub use reviewer::{ChannelReviewer, TerminalReviewer};
pub use stages::{ContentMiner, ImageRenderer, SpecWriter, StageFailure, StageRunner};

/// A rendered candidate awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Where the rendered image lives; doubles as the artifact reference.
    pub url: String,
    pub spec: MemeSpec,
}

/// The human at the other end of a run.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Best-effort progress line. Delivery failures are swallowed.
    fn notify(&self, message: &str);

    /// Suspend until the reviewer decides on `artifact`.
    async fn review(
        &self,
        iteration: u32,
        artifact: &Artifact,
    ) -> Result<ApprovalOutcome, ApprovalError>;

    /// Resolves once the reviewer is gone for good. The run stops at that
    /// point, whatever stage it is in. Never resolves by default.
    async fn closed(&self) -> ApprovalError {
        std::future::pending().await
    }
}
