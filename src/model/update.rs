//! Update Messages
//!
//! Transport-independent inbound messages, the typed per-topic payloads they
//! decode into, and the full snapshot returned by the polling endpoint.

use std::fmt;
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::model::state::{MatchId, MapStatus, MatchStatus, PlayerId, TeamSide, Timestamp};

// =============================================================================
// TOPICS
// =============================================================================

/// Kind of change carried by a push message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Map score changed.
    ScoreDelta,
    /// Player hero/role changed.
    HeroChange,
    /// Player statistics changed.
    StatDelta,
    /// Map started, ended or became current.
    MapTransition,
    /// Match or map status changed.
    StatusChange,
    /// Maps or roster added.
    StructuralChange,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Topic; 6] = [
        Topic::ScoreDelta,
        Topic::HeroChange,
        Topic::StatDelta,
        Topic::MapTransition,
        Topic::StatusChange,
        Topic::StructuralChange,
    ];

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::ScoreDelta => "score-delta",
            Topic::HeroChange => "hero-change",
            Topic::StatDelta => "stat-delta",
            Topic::MapTransition => "map-transition",
            Topic::StatusChange => "status-change",
            Topic::StructuralChange => "structural-change",
        }
    }

    /// Resolve a wire event name, including legacy broadcaster names.
    pub fn from_event_name(name: &str) -> Option<Topic> {
        let topic = match name {
            "score-delta" | "score_delta" | "score-updated" | "score-update"
            | "round-ended" | "MatchObjectiveUpdate" => Topic::ScoreDelta,
            "hero-change" | "hero_change" | "hero.updated" | "hero-swap" => Topic::HeroChange,
            "stat-delta" | "stat_delta" | "player-stats-updated" | "player-stat-update"
            | "MatchKillEvent" => Topic::StatDelta,
            "map-transition" | "map_transition" | "match.map.transition" | "map-started"
            | "map-ended" | "map-update" | "MatchMapStarted" | "MatchMapEnded" => {
                Topic::MapTransition
            }
            "status-change" | "status_change" | "match.started" | "match-paused"
            | "match-resumed" | "tech-pause" | "MatchPaused" | "MatchResumed" => {
                Topic::StatusChange
            }
            "structural-change" | "structural_change" | "team-composition-changed" => {
                Topic::StructuralChange
            }
            _ => return None,
        };
        Some(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// INBOUND MESSAGE
// =============================================================================

/// Normalized push message, identical for every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Change kind.
    pub topic: Topic,
    /// Topic-specific body.
    pub payload: Value,
    /// Server timestamp (ms).
    pub server_timestamp: Timestamp,
}

impl InboundMessage {
    /// Build a message from a typed update.
    pub fn from_update(update: &Update, server_timestamp: Timestamp) -> Self {
        Self {
            topic: update.topic(),
            payload: update.to_payload(),
            server_timestamp,
        }
    }

    /// Decode the payload for its topic.
    pub fn decode(&self) -> Result<Update, serde_json::Error> {
        Update::decode(self.topic, &self.payload)
    }
}

// =============================================================================
// TYPED PAYLOADS
// =============================================================================

/// New team scores on a map. Absent `map_number` means the current map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDelta {
    /// Target map.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "map")]
    pub map_number: Option<u32>,
    /// Team 1 map score.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "team1_score")]
    pub team1: Option<u32>,
    /// Team 2 map score.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "team2_score")]
    pub team2: Option<u32>,
}

/// Hero pick for one player on one map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeroChange {
    /// Target map.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "map")]
    pub map_number: Option<u32>,
    /// Player's team.
    pub team: TeamSide,
    /// Player identifier.
    pub player_id: PlayerId,
    /// Hero name.
    pub hero: String,
    /// Role, if the server sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Absolute statistic values for one player on one map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatDelta {
    /// Target map.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "map")]
    pub map_number: Option<u32>,
    /// Player's team.
    pub team: TeamSide,
    /// Player identifier.
    pub player_id: PlayerId,
    /// Eliminations.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "kills")]
    pub eliminations: Option<u32>,
    /// Deaths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deaths: Option<u32>,
    /// Assists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assists: Option<u32>,
    /// Damage dealt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<u64>,
    /// Healing done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing: Option<u64>,
    /// Damage blocked.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "damageBlocked")]
    pub damage_blocked: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// A map started, ended or was selected as current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTransition {
    /// Map concerned.
    #[serde(alias = "map")]
    pub map_number: u32,
    /// Map name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_name: Option<String>,
    /// Game mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// New map status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MapStatus>,
    /// Whether this map becomes the current map.
    #[serde(default = "default_true")]
    pub make_current: bool,
}

/// Match and/or map status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// New match status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MatchStatus>,
    /// Map whose status changes.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "map")]
    pub map_number: Option<u32>,
    /// New map status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_status: Option<MapStatus>,
}

/// Map outline announced by a structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOutline {
    /// Map number.
    pub map_number: u32,
    /// Map name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_name: Option<String>,
    /// Game mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Roster identity of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Map the entry applies to; absent means every known map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_number: Option<u32>,
    /// Player's team.
    pub team: TeamSide,
    /// Player identifier.
    pub player_id: PlayerId,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// New maps and/or roster identities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralChange {
    /// Maps announced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maps: Vec<MapOutline>,
    /// Roster entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roster: Vec<RosterEntry>,
}

/// A decoded push payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Score delta.
    Score(ScoreDelta),
    /// Hero change.
    Hero(HeroChange),
    /// Stat delta.
    Stats(StatDelta),
    /// Map transition.
    MapTransition(MapTransition),
    /// Status change.
    Status(StatusChange),
    /// Structural change.
    Structure(StructuralChange),
}

impl Update {
    /// Decode a payload for the given topic.
    pub fn decode(topic: Topic, payload: &Value) -> Result<Self, serde_json::Error> {
        let update = match topic {
            Topic::ScoreDelta => Update::Score(ScoreDelta::deserialize(payload)?),
            Topic::HeroChange => Update::Hero(HeroChange::deserialize(payload)?),
            Topic::StatDelta => Update::Stats(StatDelta::deserialize(payload)?),
            Topic::MapTransition => Update::MapTransition(MapTransition::deserialize(payload)?),
            Topic::StatusChange => Update::Status(StatusChange::deserialize(payload)?),
            Topic::StructuralChange => Update::Structure(StructuralChange::deserialize(payload)?),
        };
        Ok(update)
    }

    /// Topic of this update.
    pub fn topic(&self) -> Topic {
        match self {
            Update::Score(_) => Topic::ScoreDelta,
            Update::Hero(_) => Topic::HeroChange,
            Update::Stats(_) => Topic::StatDelta,
            Update::MapTransition(_) => Topic::MapTransition,
            Update::Status(_) => Topic::StatusChange,
            Update::Structure(_) => Topic::StructuralChange,
        }
    }

    /// Encode back to a JSON payload.
    pub fn to_payload(&self) -> Value {
        let encoded = match self {
            Update::Score(u) => serde_json::to_value(u),
            Update::Hero(u) => serde_json::to_value(u),
            Update::Stats(u) => serde_json::to_value(u),
            Update::MapTransition(u) => serde_json::to_value(u),
            Update::Status(u) => serde_json::to_value(u),
            Update::Structure(u) => serde_json::to_value(u),
        };
        // Plain derived structs with string keys always encode.
        encoded.unwrap_or(Value::Null)
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Player row in a snapshot composition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player identifier.
    #[serde(alias = "id")]
    pub player_id: PlayerId,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Hero.
    #[serde(default)]
    pub hero: Option<String>,
    /// Role.
    #[serde(default)]
    pub role: Option<String>,
    /// Country code.
    #[serde(default)]
    pub country: Option<String>,
    /// Eliminations.
    #[serde(default)]
    pub eliminations: u32,
    /// Deaths.
    #[serde(default)]
    pub deaths: u32,
    /// Assists.
    #[serde(default)]
    pub assists: u32,
    /// Damage dealt.
    #[serde(default)]
    pub damage: u64,
    /// Healing done.
    #[serde(default)]
    pub healing: u64,
    /// Damage blocked.
    #[serde(default, alias = "damageBlocked")]
    pub damage_blocked: u64,
}

/// Map row in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSnapshot {
    /// Map number.
    pub map_number: u32,
    /// Map name.
    #[serde(default)]
    pub map_name: Option<String>,
    /// Game mode.
    #[serde(default)]
    pub mode: Option<String>,
    /// Team 1 map score.
    #[serde(default)]
    pub team1_score: u32,
    /// Team 2 map score.
    #[serde(default)]
    pub team2_score: u32,
    /// Map status.
    #[serde(default)]
    pub status: MapStatus,
    /// Pushed winner. Ignored; winners are derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<TeamSide>,
    /// Team 1 players.
    #[serde(default)]
    pub team1_composition: Vec<PlayerSnapshot>,
    /// Team 2 players.
    #[serde(default)]
    pub team2_composition: Vec<PlayerSnapshot>,
}

/// Full match state returned by the snapshot endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Match identifier.
    pub id: MatchId,
    /// Pushed series score. Ignored; recomputed from maps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team1_score: Option<u32>,
    /// Pushed series score. Ignored; recomputed from maps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team2_score: Option<u32>,
    /// Match status.
    #[serde(default)]
    pub status: MatchStatus,
    /// Current map index (0-based).
    #[serde(default)]
    pub current_map_index: usize,
    /// Server timestamp (ms).
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "serverTimestamp")]
    pub server_timestamp: Option<Timestamp>,
    /// Last server-side modification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Maps.
    #[serde(default)]
    pub maps: Vec<MapSnapshot>,
}

impl MatchSnapshot {
    /// Ordering timestamp: `server_timestamp`, else `updated_at` in ms.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.server_timestamp.or_else(|| {
            self.updated_at
                .and_then(|at| u64::try_from(at.timestamp_millis()).ok())
        })
    }

    /// Parse from the poll response body. Accepts `{ "data": {...} }` wrapping.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(body)?;
        match value {
            Value::Object(mut map) if map.contains_key("data") && !map.contains_key("id") => {
                let inner = map.remove("data").unwrap_or(Value::Null);
                Self::deserialize(inner)
            }
            other => Self::deserialize(other),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
