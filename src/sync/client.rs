//! Consumer API
//!
//! [`LiveMatchClient`] ties the pieces together: the registry decides when a
//! channel exists, each channel gets a driver task (push), a poller task
//! while push is down, and a mirror listener; every input funnels through
//! one merge engine and out through the dispatcher.
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! - a per-match `gate` (reentrant) serializes merge-and-deliver against
//!   unsubscribe, so once `unsubscribe` returns no callback for that
//!   subscription runs. Callbacks may call back into the client on the same
//!   thread. A slow callback only holds up its own match.
//! - `core` guards the engine, registry and channel records. It is never
//!   held while a callback runs.
//!
//! A thread already inside a callback only takes another match's gate if
//! it is free. Two callbacks unsubscribing each other's matches therefore
//! cannot deadlock; the generation check still stops every later delivery.

use std::cell::Cell;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError, TransportKind};
use crate::merge::delta::{MatchDelta, Origin};
use crate::merge::engine::{Incoming, MergeEngine, MergeOutcome};
use crate::model::state::{MatchId, MatchState};
use crate::model::update::{Topic, Update};
use crate::sync::channel::{
    drive, ChannelCommand, ChannelEntry, ChannelLink, ConnectionRecord, ConnectionStatus,
    DriverConfig,
};
use crate::sync::dispatcher::{self, MatchCallbacks};
use crate::sync::error::SyncError;
use crate::sync::mirror::{CrossTabMirror, MirrorListener, MirrorStore};
use crate::sync::poller::{self, HttpSnapshotSource, SnapshotSource};
use crate::sync::registry::{SubscriberId, SubscriptionRegistry, TopicFilter};
use crate::sync::writer::{HttpUpdateWriter, UpdateWriter};
use crate::transport::{
    ChannelKey, EventStreamTransport, Transport, TransportError, WebSocketTransport,
};

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Debug, Default)]
struct Core {
    engine: MergeEngine,
    registry: SubscriptionRegistry,
    channels: HashMap<MatchId, ChannelEntry>,
    next_generation: u64,
    shut_down: bool,
}

impl Core {
    fn is_current(&self, match_id: MatchId, generation: u64) -> bool {
        !self.shut_down
            && self
                .channels
                .get(&match_id)
                .is_some_and(|entry| entry.generation == generation)
    }

    fn entry(&mut self, match_id: MatchId, generation: u64) -> Option<&mut ChannelEntry> {
        if self.shut_down {
            return None;
        }
        self.channels
            .get_mut(&match_id)
            .filter(|entry| entry.generation == generation)
    }
}

type Gate = Arc<ReentrantMutex<()>>;

thread_local! {
    /// Dispatch gates held by this thread.
    static HELD_GATES: Cell<usize> = const { Cell::new(0) };
}

/// A held dispatch gate.
struct GateHold<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> GateHold<'a> {
    fn nested() -> bool {
        HELD_GATES.with(|held| held.get() > 0)
    }

    /// Block for the gate, or only try it when `nested`.
    fn acquire(gate: &'a ReentrantMutex<()>, nested: bool) -> Option<Self> {
        let guard = if nested { gate.try_lock()? } else { gate.lock() };
        HELD_GATES.with(|held| held.set(held.get() + 1));
        Some(Self { _guard: guard })
    }
}

impl Drop for GateHold<'_> {
    fn drop(&mut self) {
        HELD_GATES.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

/// State reachable from every task of a client.
pub(crate) struct Shared {
    config: ClientConfig,
    gates: Mutex<HashMap<MatchId, Gate>>,
    core: Mutex<Core>,
    paused: AtomicBool,
    transport: Option<Arc<dyn Transport>>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    writer: Arc<dyn UpdateWriter>,
    mirror: Option<CrossTabMirror>,
}

impl Shared {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            policy: self.config.reconnect.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            open_timeout: self.config.open_timeout,
        }
    }

    fn is_current(&self, match_id: MatchId, generation: u64) -> bool {
        self.core.lock().is_current(match_id, generation)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Dispatch gate of a subscribed match.
    fn gate(&self, match_id: MatchId) -> Option<Gate> {
        self.gates.lock().get(&match_id).cloned()
    }

    /// Merge one input and deliver the result. False once the channel is gone.
    pub(crate) fn ingest(
        self: &Arc<Self>,
        match_id: MatchId,
        generation: u64,
        incoming: Incoming<'_>,
        origin: Origin,
    ) -> bool {
        let Some(gate) = self.gate(match_id) else {
            return false;
        };
        let _hold = GateHold::acquire(&gate, GateHold::nested());
        let mut core = self.core.lock();
        if !core.is_current(match_id, generation) {
            return false;
        }
        let channel = ChannelKey::for_match(match_id);

        match core.engine.apply(match_id, incoming, origin) {
            Ok(MergeOutcome::Applied(delta)) => {
                let deliveries = match self.config.batch_window {
                    Some(window) => {
                        self.hold_back(&mut core, match_id, generation, window, delta.clone());
                        Vec::new()
                    }
                    None => dispatcher::plan(&core.registry, &channel, &delta),
                };
                let state = core.engine.get(match_id).cloned();
                drop(core);

                if let Some(mirror) = &self.mirror {
                    mirror.publish(&delta);
                }
                if let Some(state) = state {
                    dispatcher::deliver(deliveries, &state, || self.is_current(match_id, generation));
                }
            }
            Ok(MergeOutcome::Stale { group, stored, incoming }) => {
                let error = SyncError::StaleUpdate { group, stored, incoming };
                debug!(match_id, ?origin, "{}", error);
            }
            Ok(MergeOutcome::Unchanged) | Ok(MergeOutcome::Duplicate) => {}
            Err(e) => {
                warn!(match_id, ?origin, "dropping input: {}", e);
                let tables = core.registry.tables(&channel);
                drop(core);
                dispatcher::notify_error(&tables, &SyncError::from(e));
            }
        }
        true
    }

    /// Queue a delta until the batch window closes.
    fn hold_back(
        self: &Arc<Self>,
        core: &mut Core,
        match_id: MatchId,
        generation: u64,
        window: Duration,
        delta: MatchDelta,
    ) {
        let Some(entry) = core.entry(match_id, generation) else {
            return;
        };
        match &mut entry.pending {
            Some(pending) => pending.absorb(delta),
            None => entry.pending = Some(delta),
        }
        if entry.flush.is_none() {
            let link = ChannelLink::new(Arc::downgrade(self), match_id, generation);
            entry.flush = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                link.flush();
            }));
        }
    }

    /// Deliver what the batch window held back.
    pub(crate) fn flush(&self, match_id: MatchId, generation: u64) -> bool {
        let Some(gate) = self.gate(match_id) else {
            return false;
        };
        let _hold = GateHold::acquire(&gate, GateHold::nested());
        let mut core = self.core.lock();
        let Some(entry) = core.entry(match_id, generation) else {
            return false;
        };
        // Runs inside the flush task; detach rather than abort it.
        entry.flush = None;
        let Some(delta) = entry.pending.take() else {
            return true;
        };
        let deliveries = dispatcher::plan(&core.registry, &ChannelKey::for_match(match_id), &delta);
        let state = core.engine.get(match_id).cloned();
        drop(core);

        debug!(match_id, changes = delta.changes.len(), "batched delivery");
        if let Some(state) = state {
            dispatcher::deliver(deliveries, &state, || self.is_current(match_id, generation));
        }
        true
    }

    /// Mutate a channel's entry and announce the new status.
    pub(crate) fn transition(
        &self,
        match_id: MatchId,
        generation: u64,
        f: impl FnOnce(&mut ChannelEntry),
    ) -> bool {
        let Some(gate) = self.gate(match_id) else {
            return false;
        };
        let _hold = GateHold::acquire(&gate, GateHold::nested());
        let mut core = self.core.lock();
        let Some(entry) = core.entry(match_id, generation) else {
            return false;
        };
        f(entry);
        let status = entry.status();
        let tables = core.registry.tables(&ChannelKey::for_match(match_id));
        drop(core);

        debug!(match_id, state = ?status.state, attempts = status.reconnect_attempts, "connection status");
        dispatcher::notify_connect(&tables, &status);
        true
    }

    /// Mutate a channel's record without announcing it.
    pub(crate) fn update_record(
        &self,
        match_id: MatchId,
        generation: u64,
        f: impl FnOnce(&mut ConnectionRecord),
    ) -> bool {
        let mut core = self.core.lock();
        match core.entry(match_id, generation) {
            Some(entry) => {
                f(&mut entry.record);
                true
            }
            None => false,
        }
    }

    pub(crate) fn report_error(&self, match_id: MatchId, generation: u64, error: SyncError) -> bool {
        let Some(gate) = self.gate(match_id) else {
            return false;
        };
        let _hold = GateHold::acquire(&gate, GateHold::nested());
        let mut core = self.core.lock();
        let Some(entry) = core.entry(match_id, generation) else {
            return false;
        };
        entry.record.last_error = Some(error.clone());
        let tables = core.registry.tables(&ChannelKey::for_match(match_id));
        drop(core);

        dispatcher::notify_error(&tables, &error);
        true
    }

    /// Start the fallback poller unless one is running.
    pub(crate) fn start_poller(self: &Arc<Self>, match_id: MatchId, generation: u64) -> bool {
        let mut core = self.core.lock();
        let Some(entry) = core.entry(match_id, generation) else {
            return false;
        };
        let Some(source) = &self.snapshots else {
            debug!(match_id, "no snapshot source, not polling");
            return true;
        };
        if entry.poller.is_none() {
            let link = ChannelLink::new(Arc::downgrade(self), match_id, generation);
            entry.poller = Some(spawn_poller(source.clone(), link, match_id, self.config.poll_interval));
            info!(match_id, interval = ?self.config.poll_interval, "fallback polling started");
        }
        true
    }
}

fn spawn_poller(
    source: Arc<dyn SnapshotSource>,
    link: ChannelLink,
    match_id: MatchId,
    interval: Duration,
) -> JoinHandle<()> {
    let pause_link = link.clone();
    let paused = move || pause_link.paused();
    tokio::spawn(poller::run(source, match_id, interval, paused, move |result| {
        let alive = match result {
            Ok(snapshot) => link.ingest(Incoming::Snapshot(&snapshot), Origin::Poll),
            Err(e) => {
                warn!(match_id, "poll failed: {}", e);
                link.error(e)
            }
        };
        if alive {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }))
}

async fn follow_mirror(link: ChannelLink, mut listener: MirrorListener) {
    while let Some(record) = listener.next().await {
        let alive = match record.to_update() {
            Ok(update) => link.ingest(
                Incoming::Update { update: &update, server_timestamp: record.timestamp },
                Origin::Mirror,
            ),
            Err(e) => link.error(SyncError::Protocol(format!(
                "undecodable {} mirror record: {}",
                record.topic, e
            ))),
        };
        if !alive {
            return;
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Live match-state sync client.
///
/// Cheap to clone; clones share subscriptions. All tasks stop when the last
/// clone is dropped or [`LiveMatchClient::shutdown`] is called.
#[derive(Clone)]
pub struct LiveMatchClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LiveMatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMatchClient")
            .field("transport", &self.shared.transport.as_ref().map(|t| t.name()))
            .field("polling", &self.shared.snapshots.is_some())
            .field("mirror", &self.shared.mirror)
            .finish()
    }
}

impl LiveMatchClient {
    /// Client with the transport, snapshot source and writer `config` names.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Builder for injecting transports, sources and a mirror store.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Subscribe to every topic of a match.
    ///
    /// The first subscriber of a match opens its channel. Must be called
    /// from within a Tokio runtime.
    pub fn subscribe(&self, match_id: MatchId, callbacks: MatchCallbacks) -> Result<SubscriberId, SyncError> {
        self.subscribe_topics(match_id, &Topic::ALL, callbacks)
    }

    /// Subscribe to selected topics of a match. Subscribing the same callback
    /// table again adds topics to its existing subscription.
    pub fn subscribe_topics(
        &self,
        match_id: MatchId,
        topics: &[Topic],
        callbacks: MatchCallbacks,
    ) -> Result<SubscriberId, SyncError> {
        let shared = &self.shared;
        let channel = ChannelKey::for_match(match_id);
        let mut core = shared.core.lock();
        if core.shut_down {
            return Err(SyncError::Shutdown);
        }

        let subscribed = core.registry.subscribe(&channel, topics, callbacks);
        if !subscribed.first {
            return Ok(subscribed.id);
        }

        core.engine.track(match_id);
        self.shared
            .gates
            .lock()
            .entry(match_id)
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())));
        core.next_generation += 1;
        let generation = core.next_generation;
        let link = ChannelLink::new(Arc::downgrade(shared), match_id, generation);
        let mut entry = ChannelEntry::new(channel.clone(), generation);

        match &shared.transport {
            Some(transport) => {
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                entry.commands = Some(commands_tx);
                entry.driver = Some(tokio::spawn(drive(
                    link.clone(),
                    channel.clone(),
                    transport.clone(),
                    shared.driver_config(),
                    commands_rx,
                )));
            }
            None => {
                if let Some(source) = &shared.snapshots {
                    entry.poller = Some(spawn_poller(
                        source.clone(),
                        link.clone(),
                        match_id,
                        shared.config.poll_interval,
                    ));
                }
            }
        }
        if let Some(mirror) = &shared.mirror {
            entry.mirror = Some(tokio::spawn(follow_mirror(link, mirror.listen(match_id))));
        }
        core.channels.insert(match_id, entry);

        info!(
            match_id,
            transport = shared.transport.as_ref().map(|t| t.name()).unwrap_or("none"),
            "channel subscribed"
        );
        Ok(subscribed.id)
    }

    /// Drop every subscription to a match and close its channel.
    pub fn unsubscribe(&self, match_id: MatchId) {
        self.release(match_id, |registry, channel| registry.unsubscribe(channel, &TopicFilter::All));
    }

    /// Remove topics from every subscriber of a match. Subscribers left
    /// without topics are dropped; the channel closes with the last one.
    pub fn unsubscribe_topics(&self, match_id: MatchId, topics: &[Topic]) {
        let filter = TopicFilter::Only(topics.to_vec());
        self.release(match_id, |registry, channel| registry.unsubscribe(channel, &filter));
    }

    /// Drop one subscriber.
    pub fn remove_subscriber(&self, match_id: MatchId, id: SubscriberId) {
        self.release(match_id, |registry, channel| registry.remove_subscriber(channel, id));
    }

    fn release(
        &self,
        match_id: MatchId,
        f: impl FnOnce(&mut SubscriptionRegistry, &ChannelKey) -> usize,
    ) {
        let Some(gate) = self.shared.gate(match_id) else {
            return;
        };
        let _hold = GateHold::acquire(&gate, GateHold::nested());
        let mut core = self.shared.core.lock();
        let channel = ChannelKey::for_match(match_id);
        if !core.registry.contains(&channel) {
            return;
        }
        let refs = f(&mut core.registry, &channel);
        if refs > 0 {
            debug!(match_id, refs, "subscription released");
            return;
        }
        if let Some(mut entry) = core.channels.remove(&match_id) {
            entry.close();
        }
        core.engine.forget(match_id);
        self.shared.gates.lock().remove(&match_id);
        info!(match_id, "channel unsubscribed");
    }

    /// Submit a privileged update. The payload is validated against its
    /// topic first; local state changes only when the update comes back
    /// through the push feed.
    pub async fn send_update(&self, match_id: MatchId, topic: Topic, data: Value) -> Result<(), SyncError> {
        if self.shared.core.lock().shut_down {
            return Err(SyncError::Shutdown);
        }
        Update::decode(topic, &data)
            .map_err(|e| SyncError::Protocol(format!("invalid {} payload: {}", topic, e)))?;
        let writer = self.shared.writer.clone();
        writer.send(match_id, topic, data).await
    }

    /// Reopen a match's channel now, resetting the retry counter. The only
    /// way out of the failed state.
    pub fn reconnect(&self, match_id: MatchId) -> Result<(), SyncError> {
        let core = self.shared.core.lock();
        if core.shut_down {
            return Err(SyncError::Shutdown);
        }
        let entry = core.channels.get(&match_id).ok_or(SyncError::NotSubscribed(match_id))?;
        match &entry.commands {
            Some(commands) => commands
                .send(ChannelCommand::Reconnect)
                .map_err(|_| SyncError::Shutdown),
            None => Err(TransportError::Unsupported("no push transport configured".to_string()).into()),
        }
    }

    /// Connection status of a subscribed match.
    pub fn connection_status(&self, match_id: MatchId) -> Option<ConnectionStatus> {
        self.shared.core.lock().channels.get(&match_id).map(ChannelEntry::status)
    }

    /// Full connection bookkeeping of a subscribed match.
    pub fn connection_record(&self, match_id: MatchId) -> Option<ConnectionRecord> {
        self.shared.core.lock().channels.get(&match_id).map(|entry| entry.record.clone())
    }

    /// Merged state of a subscribed match.
    pub fn match_state(&self, match_id: MatchId) -> Option<MatchState> {
        self.shared.core.lock().engine.get(match_id).cloned()
    }

    /// Subscribed matches.
    pub fn subscribed(&self) -> Vec<MatchId> {
        let mut ids: Vec<MatchId> = self.shared.core.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop fallback polling until [`LiveMatchClient::resume`], for a
    /// client that is not being looked at. Push channels stay open.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("polling paused");
        }
    }

    /// Resume fallback polling from the next tick.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("polling resumed");
        }
    }

    /// Whether polling is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    /// This client's mirror, if one is attached.
    pub fn mirror(&self) -> Option<&CrossTabMirror> {
        self.shared.mirror.as_ref()
    }

    /// Close every channel and refuse further calls.
    pub fn shutdown(&self) {
        let mut gates: Vec<(MatchId, Gate)> = self.shared.gates.lock().drain().collect();
        gates.sort_unstable_by_key(|(match_id, _)| *match_id);
        let nested = GateHold::nested();
        let _holds: Vec<_> = gates
            .iter()
            .map(|(_, gate)| GateHold::acquire(gate, nested))
            .collect();
        let mut core = self.shared.core.lock();
        if core.shut_down {
            return;
        }
        core.shut_down = true;
        for (_, mut entry) in core.channels.drain() {
            entry.close();
        }
        core.registry = SubscriptionRegistry::new();
        info!("client shut down");
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`LiveMatchClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    http: Option<reqwest::Client>,
    transport: Option<Arc<dyn Transport>>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    polling: bool,
    writer: Option<Arc<dyn UpdateWriter>>,
    mirror: Option<Arc<dyn MirrorStore>>,
}

impl ClientBuilder {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: None,
            transport: None,
            snapshots: None,
            polling: true,
            writer: None,
            mirror: None,
        }
    }

    /// HTTP client shared by the REST paths and the event-stream transport.
    pub fn http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Push transport, replacing the one the config selects.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Snapshot source for fallback polling.
    pub fn snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(source);
        self
    }

    /// Never poll.
    pub fn without_polling(mut self) -> Self {
        self.polling = false;
        self
    }

    /// Destination of privileged writes.
    pub fn writer(mut self, writer: Arc<dyn UpdateWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Converge with other clients sharing `store`.
    pub fn mirror(mut self, store: Arc<dyn MirrorStore>) -> Self {
        self.mirror = Some(store);
        self
    }

    /// Validate the config and assemble the client.
    pub fn build(self) -> Result<LiveMatchClient, ConfigError> {
        let config = self.config;
        if let Err(e) = config.validate() {
            // An injected transport needs no push URL.
            let injected = self.transport.is_some() && matches!(e, ConfigError::MissingPushUrl(_));
            if !injected {
                return Err(e);
            }
        }
        let http = self.http.unwrap_or_else(default_http);

        let transport = match self.transport {
            Some(transport) => Some(transport),
            None => match (config.transport, config.push_url.clone()) {
                (TransportKind::WebSocket, Some(url)) => {
                    Some(Arc::new(WebSocketTransport::new(url)) as Arc<dyn Transport>)
                }
                (TransportKind::EventStream, Some(url)) => {
                    Some(Arc::new(EventStreamTransport::new(http.clone(), url)) as Arc<dyn Transport>)
                }
                _ => None,
            },
        };
        let snapshots = if self.polling {
            Some(self.snapshots.unwrap_or_else(|| {
                Arc::new(HttpSnapshotSource::new(http.clone(), config.api_base.clone()))
            }))
        } else {
            None
        };
        let writer = self.writer.unwrap_or_else(|| {
            Arc::new(HttpUpdateWriter::new(
                http.clone(),
                config.api_base.clone(),
                config.auth_token.clone(),
            ))
        });
        let mirror = self.mirror.map(CrossTabMirror::new);

        Ok(LiveMatchClient {
            shared: Arc::new(Shared {
                config,
                gates: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                core: Mutex::new(Core::default()),
                transport,
                snapshots,
                writer,
                mirror,
            }),
        })
    }
}

fn default_http() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("live-match-sync/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use serde_json::json;
    use crate::config::ReconnectPolicy;
    use crate::model::state::{MapStatus, MatchStatus, TeamSide};
    use crate::model::update::{InboundMessage, MapSnapshot, MatchSnapshot, StatusChange};
    use crate::sync::mirror::SharedStorage;
    use crate::sync::reconnect::ConnectionState;
    use crate::transport::{LoopbackServer, LoopbackTransport, TransportHandle};

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Transport whose first open never completes.
    struct StalledOpen {
        inner: LoopbackTransport,
        opens: AtomicUsize,
        abandoned: Arc<AtomicBool>,
    }

    impl StalledOpen {
        fn new(inner: LoopbackTransport) -> Self {
            Self { inner, opens: AtomicUsize::new(0), abandoned: Arc::new(AtomicBool::new(false)) }
        }
    }

    #[async_trait]
    impl Transport for StalledOpen {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn open(&self, channel: &ChannelKey) -> Result<TransportHandle, TransportError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                let _flag = DropFlag(self.abandoned.clone());
                std::future::pending::<()>().await;
            }
            self.inner.open(channel).await
        }
    }

    #[derive(Default)]
    struct Recorder {
        scores: Mutex<Vec<(u32, u32)>>,
        updates: AtomicUsize,
        heroes: AtomicUsize,
        errors: Mutex<Vec<SyncError>>,
        states: Mutex<Vec<ConnectionState>>,
    }

    impl Recorder {
        fn callbacks(self: &Arc<Self>) -> MatchCallbacks {
            let scores = self.clone();
            let heroes = self.clone();
            let stats = self.clone();
            let maps = self.clone();
            let statuses = self.clone();
            let connects = self.clone();
            let errors = self.clone();
            MatchCallbacks::new()
                .on_score_update(move |_, state| {
                    scores.updates.fetch_add(1, Ordering::SeqCst);
                    if let Some(map) = state.current_map() {
                        scores.scores.lock().push((map.team1_score, map.team2_score));
                    }
                })
                .on_hero_update(move |_, _| {
                    heroes.updates.fetch_add(1, Ordering::SeqCst);
                    heroes.heroes.fetch_add(1, Ordering::SeqCst);
                })
                .on_stats_update(move |_, _| {
                    stats.updates.fetch_add(1, Ordering::SeqCst);
                })
                .on_map_update(move |_, _| {
                    maps.updates.fetch_add(1, Ordering::SeqCst);
                })
                .on_status_update(move |_, _| {
                    statuses.updates.fetch_add(1, Ordering::SeqCst);
                })
                .on_connect(move |status| connects.states.lock().push(status.state))
                .on_error(move |e| errors.errors.lock().push(e.clone()))
        }

        fn updates(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    struct FixedSnapshot {
        snapshot: MatchSnapshot,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource for FixedSnapshot {
        async fn fetch(&self, _match_id: MatchId) -> Result<MatchSnapshot, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<(MatchId, Topic, Value)>>,
        refuse: bool,
    }

    #[async_trait]
    impl UpdateWriter for RecordingWriter {
        async fn send(&self, match_id: MatchId, topic: Topic, data: Value) -> Result<(), SyncError> {
            if self.refuse {
                return Err(SyncError::Auth("token expired".into()));
            }
            self.sent.lock().push((match_id, topic, data));
            Ok(())
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            heartbeat_interval: Duration::from_secs(5),
            reconnect: ReconnectPolicy { max_attempts: 3, ..Default::default() },
            ..Default::default()
        }
    }

    fn loopback_client(server: &LoopbackServer) -> LiveMatchClient {
        LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .without_polling()
            .build()
            .unwrap()
    }

    fn msg(topic: Topic, payload: Value, ts: u64) -> InboundMessage {
        InboundMessage { topic, payload, server_timestamp: ts }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..5_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_connected(client: &LiveMatchClient, match_id: MatchId) {
        wait_until(|| client.connection_status(match_id).is_some_and(|s| s.connected)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_score_is_discarded() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        let recorder = Arc::new(Recorder::default());
        client.subscribe(42, recorder.callbacks()).unwrap();
        wait_connected(&client, 42).await;

        let channel = ChannelKey::for_match(42);
        server.push(&channel, msg(Topic::StatusChange, json!({ "map_number": 1, "map_status": "completed" }), 10));
        server.push(&channel, msg(Topic::ScoreDelta, json!({ "team1": 1, "team2": 0 }), 100));
        server.push(&channel, msg(Topic::ScoreDelta, json!({ "team1": 0, "team2": 0 }), 50));
        server.push(&channel, msg(Topic::StatusChange, json!({ "status": "live" }), 200));

        wait_until(|| client.match_state(42).is_some_and(|s| s.status == MatchStatus::Live)).await;
        let state = client.match_state(42).unwrap();
        let map = state.map(1).unwrap();
        assert_eq!((map.team1_score, map.team2_score), (1, 0));
        assert_eq!(map.winner, Some(TeamSide::Team1));
        assert_eq!((state.team1_score, state.team2_score), (1, 0));

        let seen = recorder.scores.lock().clone();
        let lead = seen.iter().position(|s| *s == (1, 0)).unwrap();
        assert!(seen[lead..].iter().all(|s| *s == (1, 0)));
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_to_polling() {
        let server = LoopbackServer::new();
        server.refuse_opens(10);
        let source = Arc::new(FixedSnapshot {
            snapshot: MatchSnapshot {
                id: 5,
                server_timestamp: Some(100),
                status: MatchStatus::Live,
                maps: vec![MapSnapshot {
                    map_number: 1,
                    team1_score: 2,
                    team2_score: 1,
                    status: MapStatus::Live,
                    ..Default::default()
                }],
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        });
        let client = LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .snapshot_source(source.clone())
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        client.subscribe(5, recorder.callbacks()).unwrap();

        wait_until(|| source.calls.load(Ordering::SeqCst) >= 2).await;
        let status = client.connection_status(5).unwrap();
        assert_eq!(status.state, ConnectionState::Failed);
        assert_eq!(status.error, Some(SyncError::ExhaustedRetries { attempts: 3 }));
        assert!(status.polling);
        assert!(!status.connected);
        assert_eq!(server.open_count(), 0);

        let first = recorder.updates();
        assert!(first > 0);
        wait_until(|| source.calls.load(Ordering::SeqCst) >= 5).await;
        assert_eq!(recorder.updates(), first);

        let errors = recorder.errors.lock().clone();
        assert!(errors.contains(&SyncError::ExhaustedRetries { attempts: 3 }));
        let states = recorder.states.lock().clone();
        assert!(states.contains(&ConnectionState::Reconnecting));
        assert_eq!(states.last(), Some(&ConnectionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_leaves_failed_and_stops_polling() {
        let server = LoopbackServer::new();
        server.refuse_opens(4);
        let source = Arc::new(FixedSnapshot {
            snapshot: MatchSnapshot { id: 6, server_timestamp: Some(1), ..Default::default() },
            calls: AtomicUsize::new(0),
        });
        let client = LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .snapshot_source(source)
            .build()
            .unwrap();
        client.subscribe(6, MatchCallbacks::new()).unwrap();

        wait_until(|| {
            client.connection_status(6).is_some_and(|s| s.state == ConnectionState::Failed)
        })
        .await;
        assert!(client.connection_status(6).unwrap().polling);

        client.reconnect(6).unwrap();
        wait_connected(&client, 6).await;
        let status = client.connection_status(6).unwrap();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.polling);
        assert_eq!(status.error, None);
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tabs_converge_through_mirror() {
        let server = LoopbackServer::new();
        let storage: Arc<dyn MirrorStore> = Arc::new(SharedStorage::new());
        let tab_a = LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .without_polling()
            .mirror(storage.clone())
            .build()
            .unwrap();
        let tab_b = LiveMatchClient::builder(ClientConfig {
            transport: TransportKind::None,
            push_url: None,
            ..test_config()
        })
        .without_polling()
        .mirror(storage.clone())
        .build()
        .unwrap();

        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        tab_a.subscribe(7, a.callbacks()).unwrap();
        tab_b.subscribe(7, b.callbacks()).unwrap();
        wait_connected(&tab_a, 7).await;

        let hero = json!({ "map_number": 1, "team": "team1", "player_id": 4, "hero": "Psylocke" });
        server.push(&ChannelKey::for_match(7), msg(Topic::HeroChange, hero, 120));

        wait_until(|| {
            tab_b
                .match_state(7)
                .and_then(|s| s.map(1).and_then(|m| m.player(TeamSide::Team1, 4).cloned()))
                .is_some_and(|p| p.hero.as_deref() == Some("Psylocke"))
        })
        .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(a.heroes.load(Ordering::SeqCst), 1);
        assert_eq!(b.heroes.load(Ordering::SeqCst), 1);

        let status = tab_b.connection_status(7).unwrap();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.connected);
        assert!(tab_b.reconnect(7).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery_and_closes_channel() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        let recorder = Arc::new(Recorder::default());
        client.subscribe(9, recorder.callbacks()).unwrap();
        wait_connected(&client, 9).await;
        let channel = ChannelKey::for_match(9);

        server.push(&channel, msg(Topic::StatusChange, json!({ "status": "live" }), 1));
        wait_until(|| recorder.updates() == 1).await;

        client.unsubscribe(9);
        assert!(client.match_state(9).is_none());
        assert!(client.connection_status(9).is_none());
        assert_eq!(client.reconnect(9), Err(SyncError::NotSubscribed(9)));

        server.push(&channel, msg(Topic::StatusChange, json!({ "status": "paused" }), 2));
        wait_until(|| server.connection_count(&channel) == 0).await;
        assert_eq!(recorder.updates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_from_callback_skips_remaining_deliveries() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        let later = Arc::new(AtomicUsize::new(0));

        let inner = client.clone();
        client
            .subscribe(3, MatchCallbacks::new().on_status_update(move |_, _| inner.unsubscribe(3)))
            .unwrap();
        let count = later.clone();
        client
            .subscribe(3, MatchCallbacks::new().on_status_update(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        wait_connected(&client, 3).await;

        server.push(&ChannelKey::for_match(3), msg(Topic::StatusChange, json!({ "status": "live" }), 1));
        wait_until(|| client.subscribed().is_empty()).await;
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_channel_is_refcounted() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        let first = client.subscribe(11, MatchCallbacks::new()).unwrap();
        let second = client.subscribe(11, MatchCallbacks::new()).unwrap();
        wait_connected(&client, 11).await;
        assert_eq!(server.open_count(), 1);

        client.remove_subscriber(11, first);
        assert_eq!(client.subscribed(), vec![11]);
        client.remove_subscriber(11, second);
        assert!(client.subscribed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pongs_trigger_reconnect() {
        let server = LoopbackServer::new();
        server.set_auto_pong(false);
        let client = loopback_client(&server);
        let recorder = Arc::new(Recorder::default());
        client.subscribe(12, recorder.callbacks()).unwrap();
        wait_connected(&client, 12).await;

        wait_until(|| server.open_count() >= 2).await;
        let errors = recorder.errors.lock().clone();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SyncError::Transport(TransportError::Io(reason)) if reason.contains("no pong"))));
        assert!(recorder.states.lock().contains(&ConnectionState::Reconnecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_record_latency() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        client.subscribe(13, MatchCallbacks::new()).unwrap();
        wait_connected(&client, 13).await;

        tokio::time::sleep(Duration::from_secs(12)).await;
        let status = client.connection_status(13).unwrap();
        assert!(status.connected);
        assert!(status.latency.is_some());
        assert_eq!(server.open_count(), 1);

        let record = client.connection_record(13).unwrap();
        assert_eq!(record.channel, ChannelKey::for_match(13));
        assert!(record.last_ping_sent_at.is_some());
        assert!(record.last_pong_received_at >= record.last_ping_sent_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_is_not_retried() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        client.subscribe(14, MatchCallbacks::new()).unwrap();
        wait_connected(&client, 14).await;

        server.close_connections(&ChannelKey::for_match(14));
        wait_until(|| {
            client.connection_status(14).is_some_and(|s| s.state == ConnectionState::Closed)
        })
        .await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.open_count(), 1);

        client.reconnect(14).unwrap();
        wait_connected(&client, 14).await;
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_transport_fails_without_retry() {
        let server = LoopbackServer::new();
        server.set_unsupported(true);
        let source = Arc::new(FixedSnapshot {
            snapshot: MatchSnapshot { id: 15, server_timestamp: Some(1), ..Default::default() },
            calls: AtomicUsize::new(0),
        });
        let client = LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .snapshot_source(source.clone())
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        client.subscribe(15, recorder.callbacks()).unwrap();

        wait_until(|| source.calls.load(Ordering::SeqCst) >= 1).await;
        let status = client.connection_status(15).unwrap();
        assert_eq!(status.state, ConnectionState::Failed);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(matches!(status.error, Some(SyncError::Transport(TransportError::Unsupported(_)))));
        assert!(!recorder.states.lock().contains(&ConnectionState::Reconnecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_keeps_connection() {
        let server = LoopbackServer::new();
        let client = loopback_client(&server);
        let recorder = Arc::new(Recorder::default());
        client.subscribe(16, recorder.callbacks()).unwrap();
        wait_connected(&client, 16).await;
        let channel = ChannelKey::for_match(16);

        server.push_text(&channel, "{not json");
        server.push(&channel, msg(Topic::HeroChange, json!({ "hero": 12 }), 5));
        server.push(&channel, msg(Topic::StatusChange, json!({ "status": "live" }), 6));
        wait_until(|| recorder.updates() == 1).await;

        let errors = recorder.errors.lock().clone();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, SyncError::Protocol(_))));
        assert!(client.connection_status(16).unwrap().connected);
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test]
    async fn test_send_update_validates_then_writes() {
        let writer = Arc::new(RecordingWriter::default());
        let client = LiveMatchClient::builder(test_config())
            .transport(Arc::new(LoopbackServer::new().transport()))
            .writer(writer.clone())
            .build()
            .unwrap();

        let bad = client.send_update(1, Topic::HeroChange, json!({ "hero": 12 })).await;
        assert!(matches!(bad, Err(SyncError::Protocol(_))));
        assert!(writer.sent.lock().is_empty());

        client
            .send_update(1, Topic::ScoreDelta, json!({ "team1": 3, "team2": 1 }))
            .await
            .unwrap();
        assert_eq!(writer.sent.lock().len(), 1);
        assert!(client.match_state(1).is_none());
    }

    #[tokio::test]
    async fn test_send_update_surfaces_auth_error() {
        let writer = Arc::new(RecordingWriter { refuse: true, ..Default::default() });
        let client = LiveMatchClient::builder(test_config())
            .transport(Arc::new(LoopbackServer::new().transport()))
            .writer(writer)
            .build()
            .unwrap();
        let result = client.send_update(1, Topic::StatusChange, json!({ "status": "paused" })).await;
        assert_eq!(result, Err(SyncError::Auth("token expired".into())));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_calls() {
        let client = loopback_client(&LoopbackServer::new());
        client.subscribe(1, MatchCallbacks::new()).unwrap();
        client.shutdown();
        assert!(client.subscribed().is_empty());
        assert_eq!(client.subscribe(2, MatchCallbacks::new()), Err(SyncError::Shutdown));
        assert_eq!(client.reconnect(1), Err(SyncError::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_abandons_open_in_flight() {
        let server = LoopbackServer::new();
        let transport = Arc::new(StalledOpen::new(server.transport()));
        let client = LiveMatchClient::builder(test_config())
            .transport(transport.clone())
            .without_polling()
            .build()
            .unwrap();
        client.subscribe(20, MatchCallbacks::new()).unwrap();
        wait_until(|| transport.opens.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.connection_status(20).unwrap().state, ConnectionState::Connecting);

        client.unsubscribe(20);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(transport.abandoned.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(server.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restarts_open_in_flight() {
        let server = LoopbackServer::new();
        let transport = Arc::new(StalledOpen::new(server.transport()));
        let client = LiveMatchClient::builder(test_config())
            .transport(transport.clone())
            .without_polling()
            .build()
            .unwrap();
        client.subscribe(21, MatchCallbacks::new()).unwrap();
        wait_until(|| transport.opens.load(Ordering::SeqCst) == 1).await;

        client.reconnect(21).unwrap();
        wait_connected(&client, 21).await;
        assert!(transport.abandoned.load(Ordering::SeqCst));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(client.connection_status(21).unwrap().reconnect_attempts, 0);
    }

    #[test]
    fn test_slow_callback_does_not_hold_other_matches() {
        let client = LiveMatchClient::builder(ClientConfig {
            transport: TransportKind::None,
            push_url: None,
            ..test_config()
        })
        .without_polling()
        .build()
        .unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let slow = MatchCallbacks::new().on_status_update(move |_, _| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
        });
        client.subscribe(1, slow).unwrap();
        let fast = Arc::new(Recorder::default());
        client.subscribe(2, fast.callbacks()).unwrap();

        let generation = |id: MatchId| client.shared.core.lock().channels[&id].generation;
        let (slow_generation, fast_generation) = (generation(1), generation(2));
        let live = Update::Status(StatusChange {
            status: Some(MatchStatus::Live),
            map_number: None,
            map_status: None,
        });

        let shared = client.shared.clone();
        let slow_update = live.clone();
        let blocked = std::thread::spawn(move || {
            let incoming = Incoming::Update { update: &slow_update, server_timestamp: 1 };
            shared.ingest(1, slow_generation, incoming, Origin::Push)
        });
        entered_rx.recv().unwrap();

        let incoming = Incoming::Update { update: &live, server_timestamp: 1 };
        assert!(client.shared.ingest(2, fast_generation, incoming, Origin::Push));
        assert_eq!(fast.updates(), 1);

        release_tx.send(()).unwrap();
        assert!(blocked.join().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_skips_polls_until_resume() {
        let source = Arc::new(FixedSnapshot {
            snapshot: MatchSnapshot { id: 30, server_timestamp: Some(1), ..Default::default() },
            calls: AtomicUsize::new(0),
        });
        let client = LiveMatchClient::builder(ClientConfig {
            transport: TransportKind::None,
            push_url: None,
            ..test_config()
        })
        .snapshot_source(source.clone())
        .build()
        .unwrap();
        client.subscribe(30, MatchCallbacks::new()).unwrap();
        wait_until(|| source.calls.load(Ordering::SeqCst) == 1).await;

        client.pause();
        assert!(client.is_paused());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(client.connection_status(30).unwrap().polling);

        client.resume();
        assert!(!client.is_paused());
        wait_until(|| source.calls.load(Ordering::SeqCst) >= 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_window_coalesces_rapid_updates() {
        let server = LoopbackServer::new();
        let client = LiveMatchClient::builder(ClientConfig {
            batch_window: Some(Duration::from_millis(50)),
            ..test_config()
        })
        .transport(Arc::new(server.transport()))
        .without_polling()
        .build()
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        client.subscribe(31, recorder.callbacks()).unwrap();
        wait_connected(&client, 31).await;

        let channel = ChannelKey::for_match(31);
        for (team1, ts) in [(1, 10), (2, 11), (3, 12)] {
            let score = json!({ "map_number": 1, "team1": team1, "team2": 0 });
            server.push(&channel, msg(Topic::ScoreDelta, score, ts));
        }
        wait_until(|| recorder.updates() > 0).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // One map callback for the created map, one score callback.
        assert_eq!(recorder.updates(), 2);
        assert_eq!(recorder.scores.lock().clone(), vec![(3, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_drops_pending_batch() {
        let server = LoopbackServer::new();
        let client = LiveMatchClient::builder(ClientConfig {
            batch_window: Some(Duration::from_millis(50)),
            ..test_config()
        })
        .transport(Arc::new(server.transport()))
        .without_polling()
        .build()
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        client.subscribe(32, recorder.callbacks()).unwrap();
        wait_connected(&client, 32).await;

        server.push(&ChannelKey::for_match(32), msg(Topic::StatusChange, json!({ "status": "live" }), 1));
        wait_until(|| client.match_state(32).is_some_and(|s| s.status == MatchStatus::Live)).await;
        client.unsubscribe(32);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.updates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tabs_converge_on_bare_structure() {
        let server = LoopbackServer::new();
        let storage: Arc<dyn MirrorStore> = Arc::new(SharedStorage::new());
        let tab_a = LiveMatchClient::builder(test_config())
            .transport(Arc::new(server.transport()))
            .without_polling()
            .mirror(storage.clone())
            .build()
            .unwrap();
        let tab_b = LiveMatchClient::builder(ClientConfig {
            transport: TransportKind::None,
            push_url: None,
            ..test_config()
        })
        .without_polling()
        .mirror(storage.clone())
        .build()
        .unwrap();
        tab_a.subscribe(7, MatchCallbacks::new()).unwrap();
        tab_b.subscribe(7, MatchCallbacks::new()).unwrap();
        wait_connected(&tab_a, 7).await;

        let outline = json!({
            "maps": [{ "map_number": 3 }],
            "roster": [{ "map_number": 2, "team": "team2", "player_id": 11 }],
        });
        server.push(&ChannelKey::for_match(7), msg(Topic::StructuralChange, outline, 40));

        wait_until(|| {
            tab_b.match_state(7).is_some_and(|s| {
                s.map(3).is_some()
                    && s.map(2).is_some_and(|m| m.player(TeamSide::Team2, 11).is_some())
            })
        })
        .await;
        assert_eq!(tab_a.match_state(7), tab_b.match_state(7));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ClientConfig { push_url: None, ..Default::default() };
        assert!(matches!(
            LiveMatchClient::new(config),
            Err(ConfigError::MissingPushUrl(TransportKind::WebSocket))
        ));
    }
}
