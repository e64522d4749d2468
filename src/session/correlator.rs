//! Command-id → waiter correlation for suspended approvals.
//!
//! Every approval request gets a fresh command id. The pipeline task parks on a
//! [`Waiter`] while the WebSocket task delivers decisions through
//! [`Correlator::submit_decision`]. Each waiter is backed by a
//! `tokio::sync::oneshot` channel, so it resolves at most once; entries are
//! removed from the table under the same lock that resolves them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use memeloop_common::Decision;
use tokio::sync::oneshot;

use crate::errors::CorrelatorError;

/// What a waiter is woken with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided(Decision),
    /// The reviewer's channel went away; nobody is left to answer.
    ChannelClosed,
}

/// Result of delivering a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The decision woke a pending waiter.
    Resolved,
    /// Unknown, already resolved, expired, or owned by another client.
    Unknown,
}

/// Read-only view of an outstanding approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub command_id: String,
    pub client_id: String,
    pub artifact_reference: String,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    client_id: String,
    artifact_reference: String,
    created_at: DateTime<Utc>,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<String, PendingEntry>,
    /// client_id → command_id of its single outstanding approval
    by_client: HashMap<String, String>,
}

impl CorrelatorState {
    fn take(&mut self, command_id: &str) -> Option<PendingEntry> {
        let entry = self.pending.remove(command_id)?;
        if self.by_client.get(&entry.client_id).map(String::as_str) == Some(command_id) {
            self.by_client.remove(&entry.client_id);
        }
        Some(entry)
    }
}

/// Process-wide table of pending approvals.
#[derive(Default)]
pub struct Correlator {
    state: Mutex<CorrelatorState>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        // Map operations cannot leave the table half-updated; keep serving.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending approval and return the handle to suspend on.
    ///
    /// Dropping the returned [`Waiter`] unregisters it, so a cancelled run
    /// never leaves an orphaned entry behind.
    pub fn register_waiter(
        self: &Arc<Self>,
        command_id: &str,
        client_id: &str,
        artifact_reference: &str,
    ) -> Result<Waiter, CorrelatorError> {
        let mut state = self.lock();
        if state.pending.contains_key(command_id) {
            return Err(CorrelatorError::DuplicateCommand {
                command_id: command_id.to_string(),
            });
        }
        if let Some(existing) = state.by_client.get(client_id) {
            return Err(CorrelatorError::ApprovalAlreadyPending {
                client_id: client_id.to_string(),
                command_id: existing.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            command_id.to_string(),
            PendingEntry {
                client_id: client_id.to_string(),
                artifact_reference: artifact_reference.to_string(),
                created_at: Utc::now(),
                tx,
            },
        );
        state
            .by_client
            .insert(client_id.to_string(), command_id.to_string());
        drop(state);

        tracing::debug!(command_id, client_id, "registered approval waiter");
        Ok(Waiter {
            command_id: command_id.to_string(),
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Deliver a reviewer decision.
    ///
    /// Never fails: decisions are user-triggered, so anything that does not
    /// match a pending approval owned by `origin_client_id` is logged and
    /// dropped.
    pub fn submit_decision(
        &self,
        origin_client_id: &str,
        command_id: &str,
        decision: Decision,
    ) -> SubmitOutcome {
        let entry = {
            let mut state = self.lock();
            let owner = state.pending.get(command_id).map(|e| e.client_id.clone());
            match owner {
                Some(owner) if owner == origin_client_id => state.take(command_id),
                Some(owner) => {
                    tracing::warn!(
                        command_id,
                        origin_client_id,
                        %owner,
                        "ignoring decision from a client that does not own the approval"
                    );
                    return SubmitOutcome::Unknown;
                }
                None => None,
            }
        };

        let Some(entry) = entry else {
            tracing::warn!(command_id, origin_client_id, "ignoring unknown or stale decision");
            return SubmitOutcome::Unknown;
        };

        let approved = decision.approved;
        if entry.tx.send(Resolution::Decided(decision)).is_err() {
            // The waiting run was dropped between lookup and delivery.
            tracing::warn!(command_id, "approval waiter vanished before the decision landed");
            return SubmitOutcome::Unknown;
        }
        tracing::info!(command_id, client_id = origin_client_id, approved, "approval resolved");
        SubmitOutcome::Resolved
    }

    /// Unregister a waiter. Returns `false` if it was already resolved or removed.
    pub fn cancel(&self, command_id: &str) -> bool {
        let removed = self.lock().take(command_id).is_some();
        if removed {
            tracing::debug!(command_id, "approval waiter cancelled");
        }
        removed
    }

    /// Wake the client's outstanding waiter, if any, with `ChannelClosed`.
    pub fn fail_client(&self, client_id: &str) -> bool {
        let entry = {
            let mut state = self.lock();
            let command_id = state.by_client.get(client_id).cloned();
            command_id.and_then(|id| state.take(&id).map(|e| (id, e)))
        };
        match entry {
            Some((command_id, entry)) => {
                tracing::info!(command_id, client_id, "failing pending approval: channel closed");
                let _ = entry.tx.send(Resolution::ChannelClosed);
                true
            }
            None => false,
        }
    }

    /// Outstanding approval for a client.
    pub fn pending_for(&self, client_id: &str) -> Option<PendingApproval> {
        let state = self.lock();
        let command_id = state.by_client.get(client_id)?;
        state.pending.get(command_id).map(|e| PendingApproval {
            command_id: command_id.clone(),
            client_id: e.client_id.clone(),
            artifact_reference: e.artifact_reference.clone(),
            created_at: e.created_at,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Single-slot handle a suspended approval waits on.
pub struct Waiter {
    command_id: String,
    rx: oneshot::Receiver<Resolution>,
    correlator: Arc<Correlator>,
}

impl Waiter {
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Wait for the resolution. A dropped sender means the entry was torn
    /// down without a decision, which is reported as `ChannelClosed`.
    pub async fn recv(&mut self) -> Resolution {
        (&mut self.rx).await.unwrap_or(Resolution::ChannelClosed)
    }

    /// Take a resolution that has already been delivered, without waiting.
    pub fn try_take(&mut self) -> Option<Resolution> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.correlator.cancel(&self.command_id);
    }
}
