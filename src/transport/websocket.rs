//! WebSocket Transport
//!
//! Type-multiplexed socket: one connection per channel, JSON text frames
//! routed by their `type` key.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, Sink};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn, instrument};

use crate::transport::frame::{decode_socket_frame, ClientFrame, Frame};
use crate::transport::{
    ChannelKey, Transport, TransportCommand, TransportError, TransportEvent, TransportHandle,
    EVENT_BUFFER,
};

/// Socket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Transport connecting to `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Url(e) => TransportError::Unsupported(e.to_string()),
            tungstenite::Error::Http(response) => {
                TransportError::Status(response.status().as_u16())
            }
            tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
            other => TransportError::Handshake(other.to_string()),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn open(&self, channel: &ChannelKey) -> Result<TransportHandle, TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| match e {
            tungstenite::Error::Io(e) => TransportError::Connect(e.to_string()),
            other => TransportError::from(other),
        })?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = ClientFrame::Subscribe { channel: channel.to_string() };
        write.send(Message::Text(subscribe.to_json())).await?;
        await_ack(channel, &mut read).await?;
        info!(%channel, "socket subscribed");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(16);
        let task = tokio::spawn(pump(channel.clone(), write, read, event_tx, command_rx));
        Ok(TransportHandle::new(event_rx, command_tx, Some(task)))
    }
}

/// Read until the server acknowledges or rejects the subscription.
async fn await_ack<R>(channel: &ChannelKey, read: &mut R) -> Result<(), TransportError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match decode_socket_frame(&text) {
                Ok(Frame::SubscriptionSucceeded { .. }) => return Ok(()),
                Ok(Frame::SubscriptionError { reason }) => {
                    return Err(TransportError::SubscriptionRejected {
                        channel: channel.to_string(),
                        reason,
                    });
                }
                Ok(other) => debug!(?other, "frame before subscription ack"),
                Err(e) => debug!("undecodable frame before subscription ack: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "closed before subscription ack".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::from(e)),
        }
    }
}

/// Connection task: forwards frames as events and commands as frames.
async fn pump<W, R>(
    channel: ChannelKey,
    mut write: W,
    mut read: R,
    events: mpsc::Sender<TransportEvent>,
    mut commands: mpsc::Receiver<TransportCommand>,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let closed = loop {
        tokio::select! {
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => match decode_socket_frame(&text) {
                        Ok(Frame::Update(message)) => TransportEvent::Message(message),
                        Ok(Frame::Pong { nonce }) => TransportEvent::Pong { nonce },
                        Ok(Frame::Heartbeat) => TransportEvent::Heartbeat,
                        Ok(Frame::SubscriptionError { reason }) => {
                            let _ = events.send(TransportEvent::Error(
                                TransportError::SubscriptionRejected {
                                    channel: channel.to_string(),
                                    reason,
                                },
                            )).await;
                            break TransportEvent::Closed { normal: false };
                        }
                        Ok(Frame::SubscriptionSucceeded { .. }) | Ok(Frame::Ignored { .. }) => {
                            continue;
                        }
                        Err(e) => TransportEvent::Malformed(e),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        TransportEvent::Malformed("unexpected binary frame".to_string())
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let normal = frame.map(|f| f.code == CloseCode::Normal).unwrap_or(false);
                        debug!(%channel, normal, "server closed connection");
                        break TransportEvent::Closed { normal };
                    }
                    None => break TransportEvent::Closed { normal: false },
                    Some(Err(e)) => {
                        warn!(%channel, "socket error: {}", e);
                        let _ = events.send(TransportEvent::Error(TransportError::from(e))).await;
                        break TransportEvent::Closed { normal: false };
                    }
                    Some(Ok(_)) => continue,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(TransportCommand::Ping { nonce }) => {
                        let ping = ClientFrame::Ping { timestamp: nonce };
                        if let Err(e) = write.send(Message::Text(ping.to_json())).await {
                            let _ = events.send(TransportEvent::Error(TransportError::from(e))).await;
                            break TransportEvent::Closed { normal: false };
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        let leave = ClientFrame::Unsubscribe { channel: channel.to_string() };
                        let _ = write.send(Message::Text(leave.to_json())).await;
                        let _ = write.send(Message::Close(None)).await;
                        debug!(%channel, "socket closed by client");
                        return;
                    }
                }
            }
        }
    };
    let _ = events.send(closed).await;
}
