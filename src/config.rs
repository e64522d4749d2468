//! Layered configuration for memeloop.
//!
//! Values are resolved in order: built-in defaults, then `memeloop.toml`
//! (or the file passed with `--config`), then environment variables (a
//! `.env` file is loaded first), then CLI flags applied by the commands.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! cors_origins = ["http://localhost:5173"]
//!
//! [pipeline]
//! max_iterations = 5
//! approval_timeout_secs = 600
//!
//! [llm]
//! api_base = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! api_key_env = "LLM_API_KEY"
//!
//! [reddit]
//! threads_per_topic = 2
//!
//! [history]
//! dir = ".memeloop/runs"
//! memory_capacity = 500
//!
//! [logging]
//! json = false
//! filter = "memeloop=info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "memeloop.toml";

const MASK: &str = "********";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub imgflip: ImgflipConfig,
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed browser origins. Empty means any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:8000".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How long a run waits for a reviewer decision before treating the
    /// attempt as rejected.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_approval_timeout_secs() -> u64 {
    600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.9
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgflipConfig {
    #[serde(default = "default_imgflip_url")]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_imgflip_url() -> String {
    "https://api.imgflip.com/caption_image".to_string()
}

impl Default for ImgflipConfig {
    fn default() -> Self {
        Self {
            api_url: default_imgflip_url(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedditConfig {
    #[serde(default = "default_reddit_base")]
    pub base_url: String,
    #[serde(default = "default_threads_per_topic")]
    pub threads_per_topic: usize,
    /// Upper bound on search queries derived from one prompt.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_reddit_base() -> String {
    "https://www.reddit.com".to_string()
}

fn default_threads_per_topic() -> usize {
    2
}

fn default_max_queries() -> usize {
    5
}

fn default_user_agent() -> String {
    format!("memeloop/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            base_url: default_reddit_base(),
            threads_per_topic: default_threads_per_topic(),
            max_queries: default_max_queries(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Directory for JSON run records. Unset keeps history in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Most runs kept by the in-memory store; the oldest are evicted first.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

fn default_memory_capacity() -> usize {
    crate::store::DEFAULT_MEMORY_CAPACITY
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            memory_capacity: default_memory_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "memeloop=info,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_filter(),
        }
    }
}

impl AppConfig {
    /// Load the effective configuration.
    ///
    /// An explicit `path` must exist. Without one, `memeloop.toml` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse memeloop.toml")
    }

    /// Overlay environment variables resolved through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MEMELOOP_PORT") {
            self.server.port = parse_env("MEMELOOP_PORT", &port)?;
        }
        if let Some(max) = lookup("MEMELOOP_MAX_ITERATIONS") {
            self.pipeline.max_iterations = parse_env("MEMELOOP_MAX_ITERATIONS", &max)?;
        }
        if let Some(secs) = lookup("MEMELOOP_APPROVAL_TIMEOUT_SECS") {
            self.pipeline.approval_timeout_secs =
                parse_env("MEMELOOP_APPROVAL_TIMEOUT_SECS", &secs)?;
        }
        if let Some(frontend) = lookup("FRONTEND_URL").filter(|v| !v.trim().is_empty()) {
            let frontend = frontend.trim().to_string();
            self.server.cors_origins.retain(|o| o != &frontend);
            self.server.cors_origins.insert(0, frontend);
        }
        if let Some(user) = lookup("IMGFLIP_USERNAME") {
            self.imgflip.username = Some(user);
        }
        if let Some(pass) = lookup("IMGFLIP_PASSWORD") {
            self.imgflip.password = Some(pass);
        }
        if let Some(base) = lookup("LLM_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(dir) = lookup("MEMELOOP_HISTORY_DIR") {
            self.history.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_iterations == 0 {
            return Err(invalid("pipeline.max_iterations", "must be at least 1"));
        }
        if self.pipeline.approval_timeout_secs == 0 {
            return Err(invalid("pipeline.approval_timeout_secs", "must be at least 1"));
        }
        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "must not be empty"));
        }
        if self.reddit.max_queries == 0 {
            return Err(invalid("reddit.max_queries", "must be at least 1"));
        }
        if self.history.memory_capacity == 0 {
            return Err(invalid("history.memory_capacity", "must be at least 1"));
        }
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.approval_timeout_secs)
    }

    /// Copy with credentials replaced, safe to print.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.imgflip.password.is_some() {
            copy.imgflip.password = Some(MASK.to_string());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("'{}' is not a valid number", value)))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}
