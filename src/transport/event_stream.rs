//! Event-Stream Transport
//!
//! Server-sent events over a streaming HTTP body. The stream is one-way, so
//! pings go out as separate POSTs and their pongs come back on the stream.

use std::time::Duration;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, instrument};

use crate::transport::frame::{decode_stream_event, Frame};
use crate::transport::{
    ChannelKey, Transport, TransportCommand, TransportError, TransportEvent, TransportHandle,
    EVENT_BUFFER,
};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// `id:` field, if any.
    pub id: Option<String>,
}

/// Longest line the decoder buffers.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Largest event (joined `data:` lines) the decoder assembles.
pub const MAX_EVENT_BYTES: usize = 4 << 20;

/// Incremental `text/event-stream` parser.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere. An oversized line
/// or event is reported once and dropped up to the next blank line; the
/// decoder then resumes with the following event.
#[derive(Debug)]
pub struct EventStreamDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a terminator.
    scanned: usize,
    /// Discarding the remainder of an oversized line.
    skipping_line: bool,
    /// Discarding the current event.
    overflowed: bool,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    id: Option<String>,
    max_line: usize,
    max_event: usize,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::with_limits(MAX_LINE_BYTES, MAX_EVENT_BYTES)
    }
}

impl EventStreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder with custom size caps.
    pub fn with_limits(max_line: usize, max_event: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            skipping_line: false,
            overflowed: false,
            event: None,
            data: Vec::new(),
            data_len: 0,
            id: None,
            max_line,
            max_event,
        }
    }

    /// Feed a chunk, returning every event it completes and every cap it
    /// exceeded, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SseEvent, String>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        loop {
            let Some(pos) = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
                .map(|p| p + self.scanned)
            else {
                self.scanned = self.buf.len();
                break;
            };
            let terminator = self.buf[pos];
            // A trailing CR may be the first half of CRLF.
            if terminator == b'\r' && pos + 1 == self.buf.len() {
                self.scanned = pos;
                break;
            }
            let mut next = pos + 1;
            if terminator == b'\r' && self.buf.get(next) == Some(&b'\n') {
                next += 1;
            }
            let (line_start, line_len) = (start, pos - start);
            start = next;
            self.scanned = next;
            if std::mem::take(&mut self.skipping_line) {
                continue;
            }
            if line_len > self.max_line {
                out.push(Err(self.overflow("line", self.max_line)));
                continue;
            }
            let line = String::from_utf8_lossy(&self.buf[line_start..pos]).into_owned();
            if let Some(decoded) = self.process_line(&line) {
                out.push(decoded);
            }
        }
        self.buf.drain(..start);
        self.scanned -= start;

        if self.scanned > self.max_line {
            self.buf.clear();
            self.scanned = 0;
            if !self.skipping_line {
                self.skipping_line = true;
                out.push(Err(self.overflow("line", self.max_line)));
            }
        }
        out
    }

    fn overflow(&mut self, what: &str, cap: usize) -> String {
        self.overflowed = true;
        self.data.clear();
        self.data_len = 0;
        format!("event-stream {} exceeds {} bytes", what, cap)
    }

    fn process_line(&mut self, line: &str) -> Option<Result<SseEvent, String>> {
        if line.is_empty() {
            if std::mem::take(&mut self.overflowed) || self.data.is_empty() {
                self.event = None;
                self.data.clear();
                self.data_len = 0;
                return None;
            }
            let event = SseEvent {
                event: self.event.take(),
                data: self.data.join("\n"),
                id: self.id.clone(),
            };
            self.data.clear();
            self.data_len = 0;
            return Some(Ok(event));
        }
        if line.starts_with(':') || self.overflowed {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.max_event {
                    return Some(Err(self.overflow("event", self.max_event)));
                }
                self.data.push(value.to_string());
            }
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Event-stream transport over reqwest.
#[derive(Debug, Clone)]
pub struct EventStreamTransport {
    http: reqwest::Client,
    push_url: String,
}

impl EventStreamTransport {
    /// Transport for the push server at `push_url` (`http://` or `https://`).
    pub fn new(http: reqwest::Client, push_url: impl Into<String>) -> Self {
        Self { http, push_url: push_url.into().trim_end_matches('/').to_string() }
    }

    fn stream_url(&self) -> String {
        format!("{}/stream", self.push_url)
    }

    fn ping_url(&self) -> String {
        format!("{}/ping", self.push_url)
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    #[instrument(skip(self), fields(url = %self.push_url))]
    async fn open(&self, channel: &ChannelKey) -> Result<TransportHandle, TransportError> {
        let response = self
            .http
            .get(self.stream_url())
            .query(&[("channel", channel.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let mut body = response.bytes_stream().boxed();
        let mut decoder = EventStreamDecoder::new();
        let pending = await_ack(channel, &mut body, &mut decoder).await?;
        info!(%channel, "event stream subscribed");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(16);
        let pinger = Pinger {
            http: self.http.clone(),
            url: self.ping_url(),
            channel: channel.clone(),
        };
        let task = tokio::spawn(pump(channel.clone(), body, decoder, pending, pinger, event_tx, command_rx));
        Ok(TransportHandle::new(event_rx, command_tx, Some(task)))
    }
}

/// Read until acknowledged; returns events that arrived in the same chunk after the ack.
async fn await_ack<S, B>(
    channel: &ChannelKey,
    body: &mut S,
    decoder: &mut EventStreamDecoder,
) -> Result<Vec<Result<SseEvent, String>>, TransportError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        let chunk = match body.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(TransportError::from(e)),
            None => {
                return Err(TransportError::Handshake(
                    "stream ended before subscription ack".to_string(),
                ));
            }
        };
        let mut events = decoder.push(chunk.as_ref()).into_iter();
        while let Some(decoded) = events.next() {
            let event = match decoded {
                Ok(event) => event,
                Err(e) => {
                    debug!("dropped event before subscription ack: {}", e);
                    continue;
                }
            };
            match decode_stream_event(event.event.as_deref(), &event.data) {
                Ok(Frame::SubscriptionSucceeded { .. }) => return Ok(events.collect()),
                Ok(Frame::SubscriptionError { reason }) => {
                    return Err(TransportError::SubscriptionRejected {
                        channel: channel.to_string(),
                        reason,
                    });
                }
                Ok(other) => debug!(?other, "event before subscription ack"),
                Err(e) => debug!("undecodable event before subscription ack: {}", e),
            }
        }
    }
}

/// Sends pings out of band.
struct Pinger {
    http: reqwest::Client,
    url: String,
    channel: ChannelKey,
}

impl Pinger {
    fn send(&self, nonce: u64) {
        let request = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(5))
            .json(&json!({ "channel": self.channel.as_str(), "timestamp": nonce }));
        let channel = self.channel.clone();
        // A lost ping surfaces as a missed pong.
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(%channel, status = %response.status(), "ping rejected");
                }
                Ok(_) => {}
                Err(e) => warn!(%channel, "ping failed: {}", e),
            }
        });
    }
}

fn to_events(decoded: Vec<Result<SseEvent, String>>) -> Vec<TransportEvent> {
    decoded
        .into_iter()
        .filter_map(|d| match d {
            Ok(event) => to_event(&event),
            Err(e) => Some(TransportEvent::Malformed(e)),
        })
        .collect()
}

fn to_event(event: &SseEvent) -> Option<TransportEvent> {
    match decode_stream_event(event.event.as_deref(), &event.data) {
        Ok(Frame::Update(message)) => Some(TransportEvent::Message(message)),
        Ok(Frame::Pong { nonce }) => Some(TransportEvent::Pong { nonce }),
        Ok(Frame::Heartbeat) => Some(TransportEvent::Heartbeat),
        Ok(Frame::SubscriptionError { reason }) => Some(TransportEvent::Malformed(format!(
            "subscription error after ack: {}",
            reason
        ))),
        Ok(Frame::SubscriptionSucceeded { .. }) | Ok(Frame::Ignored { .. }) => None,
        Err(e) => Some(TransportEvent::Malformed(e)),
    }
}

async fn pump<S, B>(
    channel: ChannelKey,
    mut body: S,
    mut decoder: EventStreamDecoder,
    pending: Vec<Result<SseEvent, String>>,
    pinger: Pinger,
    events: mpsc::Sender<TransportEvent>,
    mut commands: mpsc::Receiver<TransportCommand>,
) where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    for event in to_events(pending) {
        if events.send(event).await.is_err() {
            return;
        }
    }

    let closed = loop {
        tokio::select! {
            chunk = body.next() => {
                match chunk {
                    Some(Ok(chunk)) => {
                        for event in to_events(decoder.push(chunk.as_ref())) {
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%channel, "event stream error: {}", e);
                        let _ = events.send(TransportEvent::Error(TransportError::from(e))).await;
                        break TransportEvent::Closed { normal: false };
                    }
                    None => {
                        debug!(%channel, "event stream ended");
                        break TransportEvent::Closed { normal: false };
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(TransportCommand::Ping { nonce }) => pinger.send(nonce),
                    Some(TransportCommand::Close) | None => {
                        debug!(%channel, "event stream closed by client");
                        return;
                    }
                }
            }
        }
    };
    let _ = events.send(closed).await;
}

// =============================================================================
// TESTS
// =============================================================================
