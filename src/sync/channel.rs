//! Channel Driver
//!
//! One task per subscribed channel runs the connection lifecycle: open,
//! heartbeat, forward events into the merge engine, back off on abnormal
//! closure, and hand over to the fallback poller once retries run out.
//! The task reaches the client through a [`ChannelLink`]; every call through
//! the link re-checks the channel generation, so a task outliving its
//! subscription can never touch state again.

use std::sync::{Arc, Weak};
use std::time::Duration;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn, instrument};

use crate::config::ReconnectPolicy;
use crate::merge::delta::{MatchDelta, Origin};
use crate::merge::engine::Incoming;
use crate::model::state::MatchId;
use crate::sync::client::Shared;
use crate::sync::error::SyncError;
use crate::sync::heartbeat::HeartbeatMonitor;
use crate::sync::reconnect::{Backoff, ConnectionState, ReconnectController};
use crate::transport::{ChannelKey, Transport, TransportError, TransportEvent, TransportHandle};

// =============================================================================
// CONNECTION RECORD
// =============================================================================

/// Consumer-facing connection status of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Push channel is open.
    pub connected: bool,
    /// Last error, cleared when the channel opens.
    #[serde(skip)]
    pub error: Option<SyncError>,
    /// Retries since the last successful open.
    pub reconnect_attempts: u32,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Last measured ping round trip.
    pub latency: Option<Duration>,
    /// Fallback poller is running.
    pub polling: bool,
}

/// Connection bookkeeping of one channel.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Channel key.
    pub channel: ChannelKey,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Retries since the last successful open.
    pub attempts: u32,
    /// Last ping.
    pub last_ping_sent_at: Option<Instant>,
    /// Last pong.
    pub last_pong_received_at: Option<Instant>,
    /// Last measured round trip.
    pub latency: Option<Duration>,
    /// Last error.
    pub last_error: Option<SyncError>,
}

impl ConnectionRecord {
    /// Idle record.
    pub fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            state: ConnectionState::Idle,
            attempts: 0,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            latency: None,
            last_error: None,
        }
    }
}

/// Command from the consumer API to a channel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelCommand {
    /// Reset the counter and reopen now.
    Reconnect,
}

/// Client-side state of one subscribed channel.
#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub(crate) generation: u64,
    pub(crate) record: ConnectionRecord,
    pub(crate) commands: Option<mpsc::UnboundedSender<ChannelCommand>>,
    pub(crate) driver: Option<JoinHandle<()>>,
    pub(crate) poller: Option<JoinHandle<()>>,
    pub(crate) mirror: Option<JoinHandle<()>>,
    /// Changes held back by the batch window.
    pub(crate) pending: Option<MatchDelta>,
    pub(crate) flush: Option<JoinHandle<()>>,
}

impl ChannelEntry {
    pub(crate) fn new(channel: ChannelKey, generation: u64) -> Self {
        Self {
            generation,
            record: ConnectionRecord::new(channel),
            commands: None,
            driver: None,
            poller: None,
            mirror: None,
            pending: None,
            flush: None,
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.record.state == ConnectionState::Open,
            error: self.record.last_error.clone(),
            reconnect_attempts: self.record.attempts,
            state: self.record.state,
            latency: self.record.latency,
            polling: self.poller.is_some(),
        }
    }

    pub(crate) fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }

    /// Stop every task. A driver holding an open connection sees its
    /// command queue close and leaves the channel cleanly; anything else,
    /// including an open still in flight, is aborted.
    pub(crate) fn close(&mut self) {
        let graceful =
            self.commands.take().is_some() && self.record.state == ConnectionState::Open;
        if let Some(driver) = self.driver.take() {
            if !graceful {
                driver.abort();
            }
        }
        self.pending = None;
        let tasks = [self.poller.take(), self.mirror.take(), self.flush.take()];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for ChannelEntry {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// LINK
// =============================================================================

/// Generation-checked access from a task to its channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelLink {
    shared: Weak<Shared>,
    match_id: MatchId,
    generation: u64,
}

impl ChannelLink {
    pub(crate) fn new(shared: Weak<Shared>, match_id: MatchId, generation: u64) -> Self {
        Self { shared, match_id, generation }
    }

    fn with<R>(&self, f: impl FnOnce(&Arc<Shared>, MatchId, u64) -> R) -> Option<R> {
        let shared = self.shared.upgrade()?;
        Some(f(&shared, self.match_id, self.generation))
    }

    /// Update the record and tell subscribers.
    fn transition(&self, f: impl FnOnce(&mut ChannelEntry)) -> bool {
        self.with(|shared, id, generation| shared.transition(id, generation, f))
            .unwrap_or(false)
    }

    fn connecting(&self) -> bool {
        self.transition(|entry| entry.record.state = ConnectionState::Connecting)
    }

    fn opened(&self) -> bool {
        self.transition(|entry| {
            entry.stop_poller();
            entry.record.state = ConnectionState::Open;
            entry.record.attempts = 0;
            entry.record.last_error = None;
        })
    }

    fn reconnecting(&self, attempt: u32) -> bool {
        self.transition(|entry| {
            entry.record.state = ConnectionState::Reconnecting;
            entry.record.attempts = attempt;
        })
    }

    fn closed(&self) -> bool {
        self.transition(|entry| entry.record.state = ConnectionState::Closed)
    }

    /// Terminal failure: report and fall back to polling.
    fn failed(&self, error: SyncError) -> bool {
        self.with(|shared, id, generation| {
            shared.report_error(id, generation, error.clone())
                && shared.transition(id, generation, |entry| {
                    entry.record.state = ConnectionState::Failed;
                    entry.record.last_error = Some(error);
                })
                && shared.start_poller(id, generation)
        })
        .unwrap_or(false)
    }

    fn record(&self, f: impl FnOnce(&mut ConnectionRecord)) -> bool {
        self.with(|shared, id, generation| shared.update_record(id, generation, f))
            .unwrap_or(false)
    }

    /// Report a non-fatal error to subscribers.
    pub(crate) fn error(&self, error: SyncError) -> bool {
        self.with(|shared, id, generation| shared.report_error(id, generation, error))
            .unwrap_or(false)
    }

    pub(crate) fn ingest(&self, incoming: Incoming<'_>, origin: Origin) -> bool {
        self.with(|shared, id, generation| shared.ingest(id, generation, incoming, origin))
            .unwrap_or(false)
    }

    /// Deliver changes held back by the batch window.
    pub(crate) fn flush(&self) -> bool {
        self.with(|shared, id, generation| shared.flush(id, generation))
            .unwrap_or(false)
    }

    /// Whether the client is paused.
    pub(crate) fn paused(&self) -> bool {
        self.with(|shared, _, _| shared.is_paused()).unwrap_or(false)
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// How a connection ended.
enum Ended {
    /// Clean close: no retry.
    Normal,
    /// Broken or dead: back off.
    Abnormal,
    /// Manual reconnect requested.
    Reconnect,
    /// Channel gone.
    Stop,
}

/// Timing knobs of a driver.
#[derive(Debug, Clone)]
pub(crate) struct DriverConfig {
    pub(crate) policy: ReconnectPolicy,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) open_timeout: Duration,
}

/// Connection lifecycle of one channel.
#[instrument(skip_all, fields(channel = %channel, transport = transport.name()))]
pub(crate) async fn drive(
    link: ChannelLink,
    channel: ChannelKey,
    transport: Arc<dyn Transport>,
    config: DriverConfig,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    let mut controller = ReconnectController::new(config.policy.clone());

    loop {
        controller.connecting();
        if !link.connecting() {
            return;
        }

        let opened = tokio::select! {
            opened = timeout(config.open_timeout, transport.open(&channel)) => {
                opened.unwrap_or(Err(TransportError::OpenTimeout(config.open_timeout)))
            }
            command = commands.recv() => match command {
                Some(ChannelCommand::Reconnect) => {
                    debug!("open restarted by manual reconnect");
                    controller.manual_reconnect();
                    continue;
                }
                None => return,
            },
        };

        let error = match opened {
            Ok(handle) => {
                controller.on_open();
                if !link.opened() {
                    handle.close();
                    return;
                }
                info!("channel open");
                match run_open(&link, handle, config.heartbeat_interval, &mut commands).await {
                    Ended::Normal => {
                        controller.on_normal_close();
                        if !link.closed() {
                            return;
                        }
                        info!("channel closed by server");
                        match commands.recv().await {
                            Some(ChannelCommand::Reconnect) => {
                                controller.manual_reconnect();
                                continue;
                            }
                            None => return,
                        }
                    }
                    Ended::Reconnect => {
                        controller.manual_reconnect();
                        continue;
                    }
                    Ended::Stop => return,
                    Ended::Abnormal => None,
                }
            }
            Err(e) => {
                warn!("open failed: {}", e);
                Some(e)
            }
        };

        if let Some(e) = error {
            if !e.is_retryable() {
                controller.fail();
                if !link.failed(SyncError::Transport(e)) {
                    return;
                }
                if !await_manual(&mut controller, &mut commands).await {
                    return;
                }
                continue;
            }
            if !link.error(SyncError::Transport(e)) {
                return;
            }
        }

        match controller.on_abnormal_close() {
            Backoff::Retry { attempt, delay } => {
                if !link.reconnecting(attempt) {
                    return;
                }
                debug!(attempt, ?delay, "backing off");
                tokio::select! {
                    _ = sleep(delay) => {}
                    command = commands.recv() => match command {
                        Some(ChannelCommand::Reconnect) => controller.manual_reconnect(),
                        None => return,
                    },
                }
            }
            Backoff::Exhausted { attempts } => {
                if !link.failed(SyncError::ExhaustedRetries { attempts }) {
                    return;
                }
                if !await_manual(&mut controller, &mut commands).await {
                    return;
                }
            }
        }
    }
}

/// Park in FAILED until a manual reconnect. False when the channel is gone.
async fn await_manual(
    controller: &mut ReconnectController,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> bool {
    match commands.recv().await {
        Some(ChannelCommand::Reconnect) => {
            info!("manual reconnect");
            controller.manual_reconnect();
            true
        }
        None => false,
    }
}

/// Pump one open connection until it ends.
async fn run_open(
    link: &ChannelLink,
    mut handle: TransportHandle,
    interval: Duration,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> Ended {
    let mut monitor = HeartbeatMonitor::new(interval, Instant::now());

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let alive = match event {
                    TransportEvent::Message(message) => {
                        link.ingest(Incoming::Message(&message), Origin::Push)
                    }
                    TransportEvent::Pong { .. } => {
                        let now = Instant::now();
                        let latency = monitor.pong_received(now);
                        link.record(|record| {
                            record.last_pong_received_at = Some(now);
                            if latency.is_some() {
                                record.latency = latency;
                            }
                        })
                    }
                    TransportEvent::Heartbeat => {
                        monitor.keep_alive(Instant::now());
                        true
                    }
                    TransportEvent::Malformed(reason) => {
                        warn!("malformed frame: {}", reason);
                        link.error(SyncError::Protocol(reason))
                    }
                    TransportEvent::Error(e) => link.error(SyncError::Transport(e)),
                    TransportEvent::Closed { normal } => {
                        return if normal { Ended::Normal } else { Ended::Abnormal };
                    }
                };
                if !alive {
                    handle.close();
                    return Ended::Stop;
                }
            }
            _ = sleep_until(monitor.next_ping_at()) => {
                let now = Instant::now();
                let nonce = monitor.ping_sent(now);
                if handle.ping(nonce).is_err() {
                    return Ended::Abnormal;
                }
                if !link.record(|record| record.last_ping_sent_at = Some(now)) {
                    handle.close();
                    return Ended::Stop;
                }
            }
            _ = sleep_until(monitor.deadline()) => {
                warn!(?interval, "no pong within two heartbeat intervals");
                let error = TransportError::Io(format!("no pong within {:?}", interval * 2));
                // Dropping the handle tears the dead connection down.
                return if link.error(SyncError::Transport(error)) { Ended::Abnormal } else { Ended::Stop };
            }
            command = commands.recv() => {
                handle.close();
                return match command {
                    Some(ChannelCommand::Reconnect) => Ended::Reconnect,
                    None => Ended::Stop,
                };
            }
        }
    }
}
