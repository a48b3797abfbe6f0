//! Sync Layer
//!
//! Connection lifecycle, subscriptions, fallback polling, cross-tab
//! mirroring and callback dispatch around the merge engine.

pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod mirror;
pub mod poller;
pub mod reconnect;
pub mod registry;
pub mod writer;

pub use channel::{ConnectionRecord, ConnectionStatus};
pub use client::{ClientBuilder, LiveMatchClient};
pub use dispatcher::{ConnectHandler, ErrorHandler, MatchCallbacks, UpdateHandler};
pub use error::SyncError;
pub use heartbeat::HeartbeatMonitor;
pub use mirror::{
    mirror_key, CrossTabMirror, MirrorListener, MirrorRecord, MirrorStore, SharedStorage,
    StorageEvent, TabId,
};
pub use poller::{HttpSnapshotSource, SnapshotSource};
pub use reconnect::{Backoff, ConnectionState, ReconnectController};
pub use registry::{SubscriberId, SubscriptionRegistry, TopicFilter};
pub use writer::{HttpUpdateWriter, UpdateWriter};
