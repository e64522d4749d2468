//! Configuration view and validation commands: `memeloop config`.

use std::path::Path;

use anyhow::Result;

use memeloop::config::{AppConfig, DEFAULT_CONFIG_FILE};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &AppConfig,
    explicit_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let source = match explicit_path {
        Some(path) => path.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
        None => "built-in defaults".to_string(),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# memeloop configuration");
            println!("# source: {} (with environment overrides)", source);
            println!();
            print!("{}", config.masked().to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            // Loading already validated; reaching here means the config is usable.
            println!("Configuration is valid ({})", source);
            if config.imgflip.username.is_none() || config.imgflip.password.is_none() {
                println!("  warning: IMGFLIP_USERNAME / IMGFLIP_PASSWORD not set; rendering will fail");
            }
            if config.llm.api_key().is_none() {
                println!("  warning: {} not set", config.llm.api_key_env);
            }
        }
    }
    Ok(())
}
