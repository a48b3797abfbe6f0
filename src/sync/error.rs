//! Sync errors surfaced to consumers.

use crate::merge::engine::MergeError;
use crate::model::state::{FieldGroup, MatchId, Timestamp};
use crate::transport::TransportError;

/// Errors reported through `on_error` or returned by consumer calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Push connection failed; retried with backoff.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame or payload could not be used; dropped, connection kept.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Update older than the stored field-group. Logged only.
    #[error("Stale update for {group:?}: stored {stored}, incoming {incoming}")]
    StaleUpdate {
        /// Rejecting group.
        group: FieldGroup,
        /// Stored stamp.
        stored: Timestamp,
        /// Rejected timestamp.
        incoming: Timestamp,
    },

    /// Privileged write refused.
    #[error("Not authorized: {0}")]
    Auth(String),

    /// Reconnect attempts exhausted; persists until a manual reconnect.
    #[error("Gave up after {attempts} reconnect attempts")]
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
    },

    /// No subscription exists for the match.
    #[error("Not subscribed to match {0}")]
    NotSubscribed(MatchId),

    /// Client has been shut down.
    #[error("Client shut down")]
    Shutdown,
}

impl From<MergeError> for SyncError {
    fn from(e: MergeError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

impl SyncError {
    /// Whether the error concerns the push connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::ExhaustedRetries { .. })
    }
}
