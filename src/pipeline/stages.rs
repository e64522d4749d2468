//! The three content-producing stages and their sequencing.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use memeloop_common::{IterationContext, MemeSpec};

use super::{Artifact, Reviewer};
use crate::errors::StageError;

/// Gathers raw discussion material for a topic.
#[async_trait]
pub trait ContentMiner: Send + Sync {
    async fn mine(&self, prompt: &str, ctx: &IterationContext) -> Result<String>;
}

/// Turns mined material and prior feedback into a meme specification.
#[async_trait]
pub trait SpecWriter: Send + Sync {
    async fn write_spec(&self, prompt: &str, mined: &str, ctx: &IterationContext)
    -> Result<MemeSpec>;
}

/// Renders a specification into an image and returns its URL.
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    async fn render(&self, spec: &MemeSpec) -> Result<String>;
}

/// A stage error plus whatever the run produced before it.
#[derive(Debug)]
pub struct StageFailure {
    pub error: StageError,
    pub partial_spec: Option<MemeSpec>,
}

impl From<StageError> for StageFailure {
    fn from(error: StageError) -> Self {
        Self {
            error,
            partial_spec: None,
        }
    }
}

/// Runs mining → specification → rendering for one iteration.
#[derive(Clone)]
pub struct StageRunner {
    miner: Arc<dyn ContentMiner>,
    writer: Arc<dyn SpecWriter>,
    renderer: Arc<dyn ImageRenderer>,
}

impl StageRunner {
    pub fn new(
        miner: Arc<dyn ContentMiner>,
        writer: Arc<dyn SpecWriter>,
        renderer: Arc<dyn ImageRenderer>,
    ) -> Self {
        Self {
            miner,
            writer,
            renderer,
        }
    }

    pub async fn run(
        &self,
        prompt: &str,
        ctx: &IterationContext,
        reviewer: &dyn Reviewer,
    ) -> Result<Artifact, StageFailure> {
        reviewer.notify("Exploring Reddit for trends...");
        let mined = self
            .miner
            .mine(prompt, ctx)
            .await
            .map_err(StageError::Mining)?;
        tracing::debug!(bytes = mined.len(), "content mined");

        reviewer.notify("Generating meme specifications");
        let spec = self
            .writer
            .write_spec(prompt, &mined, ctx)
            .await
            .map_err(StageError::Specification)?;
        tracing::debug!(template = %spec.template_name, id = spec.meme_template_id, "meme spec ready");
        reviewer.notify("Planning meme specifications...");

        reviewer.notify("Generating meme image");
        match self.renderer.render(&spec).await {
            Ok(url) => Ok(Artifact { url, spec }),
            Err(e) => Err(StageFailure {
                error: StageError::Render(e),
                partial_spec: Some(spec),
            }),
        }
    }
}
