//! Run history persistence.
//!
//! Every finished run is written under its run id. Writes are best-effort:
//! the controller logs a failed save and carries on.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memeloop_common::IterationContext;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::HistoryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Approved,
    MaxIterationsExceeded,
    /// The reviewer's channel went away mid-run.
    Aborted,
    /// A content stage failed.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Approved => write!(f, "approved"),
            RunStatus::MaxIterationsExceeded => write!(f, "max_iterations_exceeded"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub context: IterationContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, record: &RunRecord) -> Result<()>;
    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>>;
}

/// Process-lifetime store. The default.
///
/// Holds at most `capacity` runs; saving a new run past that evicts the
/// oldest one.
pub struct InMemoryRunStore {
    capacity: usize,
    runs: RwLock<MemoryRuns>,
}

#[derive(Default)]
struct MemoryRuns {
    records: HashMap<Uuid, RunRecord>,
    /// Insertion order, oldest first.
    order: VecDeque<Uuid>,
}

pub const DEFAULT_MEMORY_CAPACITY: usize = 500;

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: RwLock::new(MemoryRuns::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.records.len()
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs
            .records
            .insert(record.run_id, record.clone())
            .is_none()
        {
            runs.order.push_back(record.run_id);
        }
        while runs.order.len() > self.capacity {
            if let Some(oldest) = runs.order.pop_front() {
                runs.records.remove(&oldest);
                tracing::debug!(run_id = %oldest, "evicted run record from memory");
            }
        }
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.records.get(&run_id).cloned())
    }
}

/// One pretty-printed `{run_id}.json` per run.
pub struct JsonRunStore {
    dir: PathBuf,
}

impl JsonRunStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create history dir {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(record).context("Failed to serialize run record")?;
        let path = self.path_for(record.run_id);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let path = self.path_for(run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }
}

/// Pick the store the history section asks for.
pub fn from_config(config: &HistoryConfig) -> Arc<dyn RunStore> {
    match &config.dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "persisting run history as JSON");
            Arc::new(JsonRunStore::new(dir))
        }
        None => Arc::new(InMemoryRunStore::with_capacity(config.memory_capacity)),
    }
}
