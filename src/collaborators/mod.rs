//! Concrete HTTP clients behind the pipeline stage traits.

pub mod imgflip;
pub mod llm;
pub mod reddit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::pipeline::StageRunner;

pub use imgflip::ImgflipRenderer;
pub use llm::ChatSpecWriter;
pub use reddit::RedditMiner;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire the Reddit, chat-completion and Imgflip clients into a stage runner.
pub fn build_stage_runner(config: &AppConfig) -> Result<StageRunner> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    Ok(StageRunner::new(
        Arc::new(RedditMiner::new(client.clone(), &config.reddit)),
        Arc::new(ChatSpecWriter::new(client.clone(), &config.llm)),
        Arc::new(ImgflipRenderer::new(client, &config.imgflip)),
    ))
}
