use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use memeloop::config::AppConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "memeloop")]
#[command(version, about = "Human-in-the-loop meme generator")]
pub struct Cli {
    /// Log memeloop internals at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a config file. Defaults to ./memeloop.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP + WebSocket server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },
    /// Generate a meme in the terminal, approving each attempt interactively
    Generate {
        /// Topic to build the meme around
        #[arg(required = true)]
        topic: Vec<String>,

        /// Override the configured iteration ceiling
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
    /// Check the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    memeloop::logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve { port, host } => cmd::cmd_serve(config, port, host).await?,
        Commands::Generate {
            topic,
            max_iterations,
        } => cmd::cmd_generate(config, &topic.join(" "), max_iterations).await?,
        Commands::Config { command } => cmd::cmd_config(&config, cli.config.as_deref(), command)?,
    }

    Ok(())
}
