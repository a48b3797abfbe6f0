//! Match Model
//!
//! Entity tree and update messages shared by the merge engine, the
//! transports and the consumer API.

pub mod state;
pub mod update;

pub use state::{
    FieldGroup, MapState, MapStatus, MatchId, MatchState, MatchStatus, PlayerCompositionEntry,
    PlayerId, PlayerStats, TeamSide, Timestamp,
};
pub use update::{
    HeroChange, InboundMessage, MapOutline, MapSnapshot, MapTransition, MatchSnapshot,
    PlayerSnapshot, RosterEntry, ScoreDelta, StatDelta, StatusChange, StructuralChange, Topic,
    Update,
};
