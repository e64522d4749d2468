//! The suspension primitive: push an approval request, park until answered.

use std::sync::Arc;
use std::time::Duration;

use memeloop_common::ServerMessage;
use uuid::Uuid;

use super::correlator::{Correlator, Resolution};
use super::registry::ChannelRegistry;
use crate::errors::ApprovalError;
use crate::pipeline::Artifact;

/// Terminal, non-fatal result of one approval cycle.
///
/// Channel loss is reported as `Err(ApprovalError::ChannelClosed)` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected { feedback: String },
    /// No decision before the deadline.
    TimedOut,
}

pub struct ApprovalGateway {
    registry: Arc<ChannelRegistry>,
    correlator: Arc<Correlator>,
}

impl ApprovalGateway {
    pub fn new(registry: Arc<ChannelRegistry>, correlator: Arc<Correlator>) -> Self {
        Self {
            registry,
            correlator,
        }
    }

    /// Ask the reviewer behind `client_id` to approve `artifact`.
    ///
    /// The request is bound to `session_id`, the session the run claimed.
    /// If that session has closed, even when the client has since
    /// reconnected, the result is `ChannelClosed`.
    ///
    /// The waiter is registered before the request goes out, so a decision
    /// can never arrive for a command id the correlator has not seen yet.
    pub async fn request_approval(
        &self,
        client_id: &str,
        session_id: Uuid,
        artifact: &Artifact,
        iteration: u32,
        timeout: Duration,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        if !self.registry.is_current(client_id, session_id) {
            tracing::info!(client_id, %session_id, "session gone before approval request");
            return Err(ApprovalError::ChannelClosed {
                client_id: client_id.to_string(),
            });
        }

        let command_id = Uuid::new_v4().to_string();
        let mut waiter = self
            .correlator
            .register_waiter(&command_id, client_id, &artifact.url)?;

        let request = ServerMessage::ApprovalRequest {
            artifact_reference: artifact.url.clone(),
            command_id: command_id.clone(),
            iteration,
            meme_spec: Some(artifact.spec.clone()),
        };
        if let Err(e) = self.registry.send_to_session(client_id, session_id, request) {
            tracing::warn!(client_id, %command_id, error = %e, "could not deliver approval request");
            return Err(ApprovalError::ChannelClosed {
                client_id: client_id.to_string(),
            });
        }
        tracing::info!(
            client_id,
            %command_id,
            iteration,
            timeout_secs = timeout.as_secs(),
            "awaiting reviewer decision"
        );

        let resolution = match tokio::time::timeout(timeout, waiter.recv()).await {
            Ok(resolution) => resolution,
            Err(_) => {
                if self.correlator.cancel(&command_id) {
                    tracing::info!(client_id, %command_id, "approval timed out");
                    return Ok(ApprovalOutcome::TimedOut);
                }
                // A decision won the race against the deadline; honor it.
                match waiter.try_take() {
                    Some(resolution) => resolution,
                    None => return Ok(ApprovalOutcome::TimedOut),
                }
            }
        };

        match resolution {
            Resolution::Decided(decision) if decision.approved => Ok(ApprovalOutcome::Approved),
            Resolution::Decided(decision) => Ok(ApprovalOutcome::Rejected {
                feedback: decision.feedback,
            }),
            Resolution::ChannelClosed => Err(ApprovalError::ChannelClosed {
                client_id: client_id.to_string(),
            }),
        }
    }
}
