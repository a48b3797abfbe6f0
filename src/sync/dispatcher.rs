//! Update Dispatcher
//!
//! Callback tables and delivery. A merge delta is split by topic and each
//! slice goes to the matching handler of every subscriber registered for
//! that topic. Delivery happens outside every lock, and a panicking
//! callback is contained and logged.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::merge::delta::MatchDelta;
use crate::model::state::MatchState;
use crate::model::update::Topic;
use crate::sync::channel::ConnectionStatus;
use crate::sync::error::SyncError;
use crate::sync::registry::SubscriptionRegistry;
use crate::transport::ChannelKey;

/// Receives the slice of a delta for one topic and the merged match state.
pub type UpdateHandler = Arc<dyn Fn(&MatchDelta, &MatchState) + Send + Sync>;

/// Receives connection status changes.
pub type ConnectHandler = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Receives errors.
pub type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// One subscriber's callback table.
///
/// Clones share identity: registering a clone of an already registered
/// table merges into the existing subscription.
#[derive(Clone)]
pub struct MatchCallbacks {
    token: Arc<()>,
    on_score_update: Option<UpdateHandler>,
    on_hero_update: Option<UpdateHandler>,
    on_stats_update: Option<UpdateHandler>,
    on_map_update: Option<UpdateHandler>,
    on_status_update: Option<UpdateHandler>,
    on_connect: Option<ConnectHandler>,
    on_error: Option<ErrorHandler>,
}

impl Default for MatchCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MatchCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchCallbacks")
            .field("id", &Arc::as_ptr(&self.token))
            .field("topics", &self.handled_topics())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl MatchCallbacks {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            token: Arc::new(()),
            on_score_update: None,
            on_hero_update: None,
            on_stats_update: None,
            on_map_update: None,
            on_status_update: None,
            on_connect: None,
            on_error: None,
        }
    }

    /// Map and series score changes.
    pub fn on_score_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatchDelta, &MatchState) + Send + Sync + 'static,
    {
        self.on_score_update = Some(Arc::new(f));
        self
    }

    /// Hero and role changes.
    pub fn on_hero_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatchDelta, &MatchState) + Send + Sync + 'static,
    {
        self.on_hero_update = Some(Arc::new(f));
        self
    }

    /// Player statistic changes.
    pub fn on_stats_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatchDelta, &MatchState) + Send + Sync + 'static,
    {
        self.on_stats_update = Some(Arc::new(f));
        self
    }

    /// Map transitions and structural changes.
    pub fn on_map_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatchDelta, &MatchState) + Send + Sync + 'static,
    {
        self.on_map_update = Some(Arc::new(f));
        self
    }

    /// Match status changes.
    pub fn on_status_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatchDelta, &MatchState) + Send + Sync + 'static,
    {
        self.on_status_update = Some(Arc::new(f));
        self
    }

    /// Connection status changes.
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Transport and protocol errors.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Handler for a topic.
    pub fn handler(&self, topic: Topic) -> Option<&UpdateHandler> {
        match topic {
            Topic::ScoreDelta => self.on_score_update.as_ref(),
            Topic::HeroChange => self.on_hero_update.as_ref(),
            Topic::StatDelta => self.on_stats_update.as_ref(),
            Topic::MapTransition | Topic::StructuralChange => self.on_map_update.as_ref(),
            Topic::StatusChange => self.on_status_update.as_ref(),
        }
    }

    /// Topics this table has a handler for.
    pub fn handled_topics(&self) -> Vec<Topic> {
        Topic::ALL.into_iter().filter(|t| self.handler(*t).is_some()).collect()
    }

    /// Whether both are clones of one table.
    pub fn same_table(&self, other: &MatchCallbacks) -> bool {
        Arc::ptr_eq(&self.token, &other.token)
    }
}

/// One pending callback invocation.
pub(crate) struct Delivery {
    handler: UpdateHandler,
    delta: MatchDelta,
}

/// Resolve which handlers receive which slices of `delta`.
pub(crate) fn plan(
    registry: &SubscriptionRegistry,
    channel: &ChannelKey,
    delta: &MatchDelta,
) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    for topic in delta.topics() {
        let Some(slice) = delta.filter(topic) else {
            continue;
        };
        for callbacks in registry.listeners(channel, topic) {
            if let Some(handler) = callbacks.handler(topic) {
                deliveries.push(Delivery { handler: handler.clone(), delta: slice.clone() });
            }
        }
    }
    deliveries
}

/// Invoke planned handlers while `live` holds. Must be called with no lock held.
pub(crate) fn deliver<F>(deliveries: Vec<Delivery>, state: &MatchState, mut live: F)
where
    F: FnMut() -> bool,
{
    for delivery in deliveries {
        if !live() {
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| (delivery.handler)(&delivery.delta, state)));
        if result.is_err() {
            error!(match_id = state.id, "update callback panicked");
        }
    }
}

/// Deliver a status change to every table that wants it.
pub(crate) fn notify_connect(tables: &[MatchCallbacks], status: &ConnectionStatus) {
    for handler in tables.iter().filter_map(|t| t.on_connect.as_ref()) {
        if catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
            error!("connect callback panicked");
        }
    }
}

/// Deliver an error to every table that wants it.
pub(crate) fn notify_error(tables: &[MatchCallbacks], err: &SyncError) {
    for handler in tables.iter().filter_map(|t| t.on_error.as_ref()) {
        if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
            error!("error callback panicked");
        }
    }
}
