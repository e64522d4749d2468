//! Terminal pipeline run: `memeloop generate <topic>`.

use anyhow::{Result, bail};
use console::style;

use memeloop::collaborators;
use memeloop::config::AppConfig;
use memeloop::pipeline::{FinalStatus, IterationController, TerminalReviewer};
use memeloop::store;

pub async fn cmd_generate(
    mut config: AppConfig,
    topic: &str,
    max_iterations: Option<u32>,
) -> Result<()> {
    if let Some(max) = max_iterations {
        config.pipeline.max_iterations = max;
    }
    config.validate()?;

    let topic = topic.trim();
    if topic.is_empty() {
        bail!("Topic must not be empty");
    }

    let stages = collaborators::build_stage_runner(&config)?;
    let controller = IterationController::new(
        stages,
        config.pipeline.max_iterations,
        store::from_config(&config.history),
    );

    println!(
        "{} {} (up to {} iterations)",
        style("Generating a meme about").bold(),
        style(topic).cyan(),
        controller.max_iterations()
    );

    let reviewer = TerminalReviewer::new();
    match controller.run(topic, &reviewer).await {
        Ok(result) => {
            println!();
            match result.status {
                FinalStatus::Approved => println!(
                    "{} after {} iteration(s)",
                    style("Approved").green().bold(),
                    result.context.len()
                ),
                FinalStatus::MaxIterationsExceeded => println!(
                    "{} after {} iterations; keeping the last attempt",
                    style("No approval").yellow().bold(),
                    result.context.len()
                ),
            }
            println!("  {}", result.artifact.url);
            println!("  {} {}", style("run id:").dim(), result.run_id);
            Ok(())
        }
        Err(failure) => {
            eprintln!(
                "{} {}",
                style("Run failed:").red().bold(),
                failure.error
            );
            Err(failure.into())
        }
    }
}
