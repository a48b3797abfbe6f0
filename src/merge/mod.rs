//! State Merge
//!
//! Timestamp-guarded merging of push, poll and mirror input into the
//! client-side match tree.

pub mod delta;
pub mod engine;

pub use delta::{Change, MatchDelta, Origin};
pub use engine::{Incoming, MergeEngine, MergeError, MergeOutcome};
