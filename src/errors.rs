//! Typed error hierarchy for memeloop.
//!
//! - `SessionError`: channel registry failures (handshake, delivery, run claims)
//! - `CorrelatorError`: approval waiter registration conflicts
//! - `ApprovalError`: a suspended approval that can no longer be answered
//! - `StageError`: content collaborator failures, one variant per stage
//! - `RunError`: why a run ended without a final artifact
//! - `ConfigError`: invalid configuration values

use thiserror::Error;

/// Errors from the channel registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Client {client_id} already has an open session")]
    DuplicateSession { client_id: String },

    #[error("No open session for client {client_id}")]
    NoSuchSession { client_id: String },

    #[error("Client {client_id} already has a run in progress")]
    RunInProgress { client_id: String },
}

/// Errors from registering an approval waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    #[error("Client {client_id} already has approval {command_id} pending")]
    ApprovalAlreadyPending {
        client_id: String,
        command_id: String,
    },

    #[error("Command id {command_id} is already registered")]
    DuplicateCommand { command_id: String },
}

/// Errors that end an approval wait without a decision.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Channel for client {client_id} closed before a decision arrived")]
    ChannelClosed { client_id: String },

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
}

/// Failure of one of the content-producing stages.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Content mining failed: {0}")]
    Mining(#[source] anyhow::Error),

    #[error("Meme specification failed: {0}")]
    Specification(#[source] anyhow::Error),

    #[error("Image rendering failed: {0}")]
    Render(#[source] anyhow::Error),
}

impl StageError {
    /// Short stage name used in logs and HTTP error bodies.
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Mining(_) => "mining",
            StageError::Specification(_) => "specification",
            StageError::Render(_) => "render",
        }
    }
}

/// Fatal reasons a run stopped.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Run aborted: {0}")]
    Aborted(#[source] ApprovalError),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}
