//! Push Transports
//!
//! A transport turns one channel subscription into a stream of
//! [`TransportEvent`]s. Opening resolves only once the server has
//! acknowledged the subscription; after that every failure is reported as
//! `Error` followed by `Closed { normal: false }`. Transports never retry;
//! that is the reconnection controller's job.

pub mod event_stream;
pub mod frame;
pub mod loopback;
pub mod websocket;

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::state::MatchId;
use crate::model::update::InboundMessage;

pub use event_stream::{EventStreamDecoder, EventStreamTransport, SseEvent};
pub use frame::{ClientFrame, Frame};
pub use loopback::{LoopbackServer, LoopbackTransport};
pub use websocket::WebSocketTransport;

/// Events buffered per connection before the reader applies backpressure.
pub const EVENT_BUFFER: usize = 256;

/// Grace period for a closing connection to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Logical stream name, `match.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Channel of a match.
    pub fn for_match(match_id: MatchId) -> Self {
        Self(format!("match.{}", match_id))
    }

    /// Wire name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Match id, for `match.<id>` channels.
    pub fn match_id(&self) -> Option<MatchId> {
        self.0.strip_prefix("match.")?.parse().ok()
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the server.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Connected, but the protocol handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Server refused the channel.
    #[error("Subscription to {channel} rejected: {reason}")]
    SubscriptionRejected {
        /// Channel key.
        channel: String,
        /// Server reason.
        reason: String,
    },

    /// No subscription acknowledgement in time.
    #[error("No subscription acknowledgement within {0:?}")]
    OpenTimeout(Duration),

    /// Connection broke.
    #[error("I/O error: {0}")]
    Io(String),

    /// HTTP endpoint answered with a non-success status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Transport cannot be used in this environment.
    #[error("Transport unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether backoff retries can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Unsupported(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Io(e.to_string())
        }
    }
}

/// Event delivered by an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Match update.
    Message(InboundMessage),
    /// Reply to [`TransportHandle::ping`].
    Pong {
        /// Echoed nonce.
        nonce: Option<u64>,
    },
    /// Server keep-alive.
    Heartbeat,
    /// Frame that could not be decoded. The connection stays up.
    Malformed(String),
    /// Connection failure; `Closed` follows.
    Error(TransportError),
    /// Connection ended.
    Closed {
        /// Clean close requested by either side.
        normal: bool,
    },
}

/// Command sent from the handle to the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    /// Send a ping.
    Ping {
        /// Nonce echoed by the pong.
        nonce: u64,
    },
    /// Leave the channel and close.
    Close,
}

/// An open, acknowledged connection.
///
/// Dropping the handle aborts the connection task.
#[derive(Debug)]
pub struct TransportHandle {
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Sender<TransportCommand>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// Wrap the channels of a connection task.
    pub fn new(
        events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Sender<TransportCommand>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { events, commands, task }
    }

    /// Next event. A vanished connection task reads as an abnormal close.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { normal: false })
    }

    /// Request a pong. Dropped silently when the command queue is full.
    pub fn ping(&self, nonce: u64) -> Result<(), TransportError> {
        match self.commands.try_send(TransportCommand::Ping { nonce }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Io("connection task gone".to_string()))
            }
        }
    }

    /// Close cleanly, giving the connection task a moment to unsubscribe.
    pub fn close(mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        if self.commands.try_send(TransportCommand::Close).is_err() {
            task.abort();
            return;
        }
        tokio::spawn(async move {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!("connection task did not close in time, aborting");
                task.abort();
            }
        });
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A push transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Connect and subscribe. Resolves once the server acknowledges.
    async fn open(&self, channel: &ChannelKey) -> Result<TransportHandle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key() {
        let key = ChannelKey::for_match(42);
        assert_eq!(key.as_str(), "match.42");
        assert_eq!(key.match_id(), Some(42));
        assert_eq!(key.to_string(), "match.42");
    }

    #[test]
    fn test_unsupported_is_not_retryable() {
        assert!(!TransportError::Unsupported("no sockets".into()).is_retryable());
        assert!(TransportError::Io("reset".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_vanished_task_reads_as_abnormal_close() {
        let (event_tx, event_rx) = mpsc::channel(1);
        let (command_tx, _command_rx) = mpsc::channel(1);
        let mut handle = TransportHandle::new(event_rx, command_tx, None);
        drop(event_tx);
        assert_eq!(handle.next_event().await, TransportEvent::Closed { normal: false });
    }

    #[tokio::test]
    async fn test_ping_after_task_exit_fails() {
        let (_event_tx, event_rx) = mpsc::channel(1);
        let (command_tx, command_rx) = mpsc::channel(1);
        let handle = TransportHandle::new(event_rx, command_tx, None);
        assert!(handle.ping(1).is_ok());
        drop(command_rx);
        assert!(handle.ping(2).is_err());
    }
}
