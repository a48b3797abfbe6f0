//! Loopback Transport
//!
//! In-process push server. A [`LoopbackServer`] hands out
//! [`LoopbackTransport`]s whose connections it can feed, drop or starve of
//! pongs, which makes every reconnect path reachable without a network.

use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::update::InboundMessage;
use crate::transport::frame::{decode_socket_frame, Frame};
use crate::transport::{
    ChannelKey, Transport, TransportCommand, TransportError, TransportEvent, TransportHandle,
    EVENT_BUFFER,
};

struct Connection {
    channel: ChannelKey,
    events: mpsc::Sender<TransportEvent>,
}

struct ServerState {
    connections: Vec<Connection>,
    refuse_opens: u32,
    unsupported: bool,
    auto_pong: bool,
    open_count: usize,
}

/// In-process push server.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer {
    /// Server that accepts every subscription and answers pings.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                connections: Vec::new(),
                refuse_opens: 0,
                unsupported: false,
                auto_pong: true,
                open_count: 0,
            })),
        }
    }

    /// Transport connecting to this server.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport { server: self.clone() }
    }

    /// Deliver a message to every connection on `channel`. Returns the number reached.
    pub fn push(&self, channel: &ChannelKey, message: InboundMessage) -> usize {
        self.broadcast(channel, TransportEvent::Message(message))
    }

    /// Deliver raw socket text, decoded the way the socket transport decodes it.
    pub fn push_text(&self, channel: &ChannelKey, text: &str) -> usize {
        let event = match decode_socket_frame(text) {
            Ok(Frame::Update(message)) => TransportEvent::Message(message),
            Ok(Frame::Pong { nonce }) => TransportEvent::Pong { nonce },
            Ok(Frame::Heartbeat) => TransportEvent::Heartbeat,
            Ok(_) => return 0,
            Err(e) => TransportEvent::Malformed(e),
        };
        self.broadcast(channel, event)
    }

    /// Break every connection on `channel` abnormally.
    pub fn drop_connections(&self, channel: &ChannelKey) -> usize {
        self.disconnect(channel, false)
    }

    /// Close every connection on `channel` with a normal close frame.
    pub fn close_connections(&self, channel: &ChannelKey) -> usize {
        self.disconnect(channel, true)
    }

    /// Refuse the next `n` opens.
    pub fn refuse_opens(&self, n: u32) {
        self.state.lock().refuse_opens = n;
    }

    /// Report every open as unsupported.
    pub fn set_unsupported(&self, unsupported: bool) {
        self.state.lock().unsupported = unsupported;
    }

    /// Whether pings are answered.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.lock().auto_pong = enabled;
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Live connections on `channel`.
    pub fn connection_count(&self, channel: &ChannelKey) -> usize {
        let mut state = self.state.lock();
        state.connections.retain(|c| !c.events.is_closed());
        state.connections.iter().filter(|c| &c.channel == channel).count()
    }

    fn broadcast(&self, channel: &ChannelKey, event: TransportEvent) -> usize {
        let mut state = self.state.lock();
        state.connections.retain(|c| !c.events.is_closed());
        state
            .connections
            .iter()
            .filter(|c| &c.channel == channel)
            .filter(|c| c.events.try_send(event.clone()).is_ok())
            .count()
    }

    fn disconnect(&self, channel: &ChannelKey, normal: bool) -> usize {
        let mut state = self.state.lock();
        let (dropped, kept): (Vec<_>, Vec<_>) =
            state.connections.drain(..).partition(|c| &c.channel == channel);
        state.connections = kept;
        drop(state);

        for connection in &dropped {
            if !normal {
                let error = TransportError::Io("connection reset by loopback".to_string());
                let _ = connection.events.try_send(TransportEvent::Error(error));
            }
            let _ = connection.events.try_send(TransportEvent::Closed { normal });
        }
        dropped.len()
    }
}

/// Transport opening connections on a [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackTransport {
    server: LoopbackServer,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn open(&self, channel: &ChannelKey) -> Result<TransportHandle, TransportError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (command_tx, mut command_rx) = mpsc::channel::<TransportCommand>(16);
        {
            let mut state = self.server.state.lock();
            if state.unsupported {
                return Err(TransportError::Unsupported("loopback disabled".to_string()));
            }
            if state.refuse_opens > 0 {
                state.refuse_opens -= 1;
                return Err(TransportError::Connect("loopback refused".to_string()));
            }
            state.open_count += 1;
            state.connections.push(Connection { channel: channel.clone(), events: event_tx.clone() });
        }
        debug!(%channel, "loopback subscribed");

        let server = self.server.clone();
        let task = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    TransportCommand::Ping { nonce } => {
                        let auto_pong = server.state.lock().auto_pong;
                        if auto_pong {
                            let _ = event_tx.try_send(TransportEvent::Pong { nonce: Some(nonce) });
                        }
                    }
                    TransportCommand::Close => break,
                }
            }
        });
        Ok(TransportHandle::new(event_rx, command_tx, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::update::Topic;
    use serde_json::json;

    fn message(ts: u64) -> InboundMessage {
        InboundMessage {
            topic: Topic::ScoreDelta,
            payload: json!({ "team1": 1 }),
            server_timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_push_reaches_channel_only() {
        let server = LoopbackServer::new();
        let transport = server.transport();
        let a = ChannelKey::for_match(1);
        let b = ChannelKey::for_match(2);
        let mut handle_a = transport.open(&a).await.unwrap();
        let _handle_b = transport.open(&b).await.unwrap();

        assert_eq!(server.push(&a, message(5)), 1);
        assert_eq!(handle_a.next_event().await, TransportEvent::Message(message(5)));
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn test_refused_then_accepted() {
        let server = LoopbackServer::new();
        server.refuse_opens(1);
        let key = ChannelKey::for_match(1);
        assert!(matches!(
            server.transport().open(&key).await,
            Err(TransportError::Connect(_))
        ));
        assert!(server.transport().open(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_sends_error_then_abnormal_close() {
        let server = LoopbackServer::new();
        let key = ChannelKey::for_match(3);
        let mut handle = server.transport().open(&key).await.unwrap();

        assert_eq!(server.drop_connections(&key), 1);
        assert!(matches!(handle.next_event().await, TransportEvent::Error(_)));
        assert_eq!(handle.next_event().await, TransportEvent::Closed { normal: false });
        assert_eq!(server.connection_count(&key), 0);
    }

    #[tokio::test]
    async fn test_ping_pong_toggle() {
        let server = LoopbackServer::new();
        let key = ChannelKey::for_match(4);
        let mut handle = server.transport().open(&key).await.unwrap();

        handle.ping(11).unwrap();
        assert_eq!(handle.next_event().await, TransportEvent::Pong { nonce: Some(11) });

        server.set_auto_pong(false);
        handle.ping(12).unwrap();
        assert_eq!(server.push(&key, message(1)), 1);
        assert_eq!(handle.next_event().await, TransportEvent::Message(message(1)));
    }

    #[tokio::test]
    async fn test_dropped_handle_prunes_connection() {
        let server = LoopbackServer::new();
        let key = ChannelKey::for_match(5);
        let handle = server.transport().open(&key).await.unwrap();
        assert_eq!(server.connection_count(&key), 1);
        drop(handle);
        assert_eq!(server.connection_count(&key), 0);
    }
}
