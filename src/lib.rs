//! # Live Match Sync
//!
//! Client-side real-time match state for esports scoreboards: push updates
//! over a socket or event stream, merged into a local entity tree under
//! per-field-group server timestamps, with snapshot polling when push is
//! down and mirroring between client instances sharing a store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LIVE MATCH SYNC                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  model/          - Entity tree and wire messages             │
//! │  ├── state.rs    - Match, map and player state               │
//! │  └── update.rs   - Topics, typed updates, snapshots          │
//! │                                                              │
//! │  merge/          - Ordering and merging                      │
//! │  ├── engine.rs   - Timestamp guard, shallow merge, derive    │
//! │  └── delta.rs    - What a merge changed                      │
//! │                                                              │
//! │  transport/      - Push connections                          │
//! │  ├── websocket.rs    - Type-multiplexed socket               │
//! │  ├── event_stream.rs - Named-event HTTP stream               │
//! │  ├── loopback.rs     - In-process server                     │
//! │  └── frame.rs        - Frame decoding                        │
//! │                                                              │
//! │  sync/           - Lifecycle and consumer API                │
//! │  ├── client.rs   - Subscribe, send, reconnect, status        │
//! │  ├── channel.rs  - Per-channel driver task                   │
//! │  ├── reconnect.rs- Backoff state machine                     │
//! │  ├── heartbeat.rs- Ping/pong liveness                        │
//! │  ├── registry.rs - Refcounted subscriptions                  │
//! │  ├── poller.rs   - Snapshot polling fallback                 │
//! │  ├── mirror.rs   - Cross-tab mirror                          │
//! │  ├── dispatcher.rs - Callback routing                        │
//! │  └── writer.rs   - Privileged writes                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Every input, whatever its origin, passes the same guard: a field-group
//! only accepts writes whose server timestamp is at least the one it holds.
//! Replaying any interleaving of push, poll and mirror input therefore
//! converges on the same tree.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod merge;
pub mod model;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::{ClientConfig, ConfigError, ReconnectPolicy, TransportKind};
pub use merge::{MatchDelta, MergeEngine, MergeOutcome, Origin};
pub use model::{MatchId, MatchState, MatchStatus, Timestamp, Topic, Update};
pub use sync::{
    ConnectionState, ConnectionStatus, LiveMatchClient, MatchCallbacks, SubscriberId, SyncError,
};
pub use transport::{ChannelKey, Transport, TransportError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
