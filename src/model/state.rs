//! Match State Definitions
//!
//! The client-side view of a live match: series score, per-map state and
//! per-player hero/stat compositions. Every mutable field belongs to a
//! field-group carrying the server timestamp of its last accepted write.
//! Uses BTreeMap for deterministic iteration order.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

/// Match identifier.
pub type MatchId = u64;

/// Player identifier.
pub type PlayerId = u64;

/// Server-supplied timestamp (milliseconds). Authoritative for ordering.
pub type Timestamp = u64;

// =============================================================================
// ENUMS
// =============================================================================

/// One of the two competing teams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSide {
    /// First listed team.
    #[serde(alias = "team_1", alias = "1")]
    Team1,
    /// Second listed team.
    #[serde(alias = "team_2", alias = "2")]
    Team2,
}

impl TeamSide {
    /// The opposing side.
    pub fn opponent(self) -> Self {
        match self {
            TeamSide::Team1 => TeamSide::Team2,
            TeamSide::Team2 => TeamSide::Team1,
        }
    }
}

/// Overall match status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Scheduled, not started.
    #[default]
    #[serde(alias = "scheduled")]
    Upcoming,
    /// In progress.
    #[serde(alias = "ongoing")]
    Live,
    /// Paused (technical or tactical).
    Paused,
    /// Finished.
    #[serde(alias = "finished")]
    Completed,
    /// Cancelled.
    Cancelled,
}

/// Status of a single map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStatus {
    /// Not started yet.
    #[default]
    Upcoming,
    /// Being played.
    #[serde(alias = "ongoing", alias = "in_progress")]
    Live,
    /// Finished; counts toward the series score.
    #[serde(alias = "finished")]
    Completed,
}

/// Named subset of an entity's fields stamped together.
///
/// A field written by more than one topic is a group of its own, so
/// topics never reject each other's unrelated writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    /// Match status.
    MatchStatus,
    /// Current map pointer.
    CurrentMap,
    /// Map team scores.
    MapScore,
    /// Map name.
    MapName,
    /// Map game mode.
    MapMode,
    /// Map status.
    MapStatus,
    /// Player hero and role.
    Hero,
    /// Player statistic counters.
    Stats,
    /// Player name and country.
    Identity,
}

// =============================================================================
// PLAYER COMPOSITION
// =============================================================================

/// Per-map statistic counters of one player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerStats {
    /// Eliminations.
    pub eliminations: u32,
    /// Deaths.
    pub deaths: u32,
    /// Assists.
    pub assists: u32,
    /// Damage dealt.
    pub damage: u64,
    /// Healing done.
    pub healing: u64,
    /// Damage blocked.
    pub damage_blocked: u64,
}

impl PlayerStats {
    /// (eliminations + assists) / max(deaths, 1).
    pub fn kda(&self) -> f64 {
        let deaths = self.deaths.max(1) as f64;
        (self.eliminations as f64 + self.assists as f64) / deaths
    }
}

/// Field-group stamps of a player entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStamps {
    /// Hero group.
    pub hero: Timestamp,
    /// Stats group.
    pub stats: Timestamp,
    /// Identity group.
    pub identity: Timestamp,
}

/// One player's slot in a map composition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerCompositionEntry {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Display name.
    pub name: Option<String>,
    /// Hero played on this map. Never carried across maps.
    pub hero: Option<String>,
    /// Role (vanguard, duelist, strategist).
    pub role: Option<String>,
    /// Country code.
    pub country: Option<String>,
    /// Statistic counters.
    pub stats: PlayerStats,
    /// Derived kill/death/assist ratio.
    pub kda: f64,
    /// Last accepted server timestamp per field-group.
    pub last_updated: PlayerStamps,
}

impl PlayerCompositionEntry {
    /// Create an entry with default values.
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            name: None,
            hero: None,
            role: None,
            country: None,
            stats: PlayerStats::default(),
            kda: 0.0,
            last_updated: PlayerStamps::default(),
        }
    }

    /// Stamp of a player field-group.
    pub fn stamp(&self, group: FieldGroup) -> Timestamp {
        match group {
            FieldGroup::Hero => self.last_updated.hero,
            FieldGroup::Stats => self.last_updated.stats,
            FieldGroup::Identity => self.last_updated.identity,
            _ => 0,
        }
    }

    pub(crate) fn recompute_derived(&mut self) {
        self.kda = self.stats.kda();
    }
}

// =============================================================================
// MAP STATE
// =============================================================================

/// Field-group stamps of a map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStamps {
    /// Score group.
    pub score: Timestamp,
    /// Name group.
    pub name: Timestamp,
    /// Mode group.
    pub mode: Timestamp,
    /// Status group.
    pub status: Timestamp,
}

/// State of one map within a match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapState {
    /// Map number, unique within the match (1-based).
    pub map_number: u32,
    /// Map name.
    pub map_name: Option<String>,
    /// Game mode.
    pub mode: Option<String>,
    /// Team 1 score on this map.
    pub team1_score: u32,
    /// Team 2 score on this map.
    pub team2_score: u32,
    /// Map status.
    pub status: MapStatus,
    /// Derived winner (completed maps only).
    pub winner: Option<TeamSide>,
    /// Team 1 players on this map.
    pub team1_composition: BTreeMap<PlayerId, PlayerCompositionEntry>,
    /// Team 2 players on this map.
    pub team2_composition: BTreeMap<PlayerId, PlayerCompositionEntry>,
    /// Last accepted server timestamp per field-group.
    pub last_updated: MapStamps,
}

impl MapState {
    /// Create a map with default values.
    pub fn new(map_number: u32) -> Self {
        Self {
            map_number,
            map_name: None,
            mode: None,
            team1_score: 0,
            team2_score: 0,
            status: MapStatus::Upcoming,
            winner: None,
            team1_composition: BTreeMap::new(),
            team2_composition: BTreeMap::new(),
            last_updated: MapStamps::default(),
        }
    }

    /// Composition of one team.
    pub fn composition(&self, team: TeamSide) -> &BTreeMap<PlayerId, PlayerCompositionEntry> {
        match team {
            TeamSide::Team1 => &self.team1_composition,
            TeamSide::Team2 => &self.team2_composition,
        }
    }

    /// Mutable composition of one team.
    pub fn composition_mut(
        &mut self,
        team: TeamSide,
    ) -> &mut BTreeMap<PlayerId, PlayerCompositionEntry> {
        match team {
            TeamSide::Team1 => &mut self.team1_composition,
            TeamSide::Team2 => &mut self.team2_composition,
        }
    }

    /// Look up a player on this map.
    pub fn player(&self, team: TeamSide, player_id: PlayerId) -> Option<&PlayerCompositionEntry> {
        self.composition(team).get(&player_id)
    }

    /// Score of one team on this map.
    pub fn score(&self, team: TeamSide) -> u32 {
        match team {
            TeamSide::Team1 => self.team1_score,
            TeamSide::Team2 => self.team2_score,
        }
    }

    /// Stamp of a map field-group.
    pub fn stamp(&self, group: FieldGroup) -> Timestamp {
        match group {
            FieldGroup::MapScore => self.last_updated.score,
            FieldGroup::MapName => self.last_updated.name,
            FieldGroup::MapMode => self.last_updated.mode,
            FieldGroup::MapStatus => self.last_updated.status,
            _ => 0,
        }
    }

    /// Winner by the completed-map rule.
    pub fn derive_winner(&self) -> Option<TeamSide> {
        if self.status != MapStatus::Completed {
            return None;
        }
        match self.team1_score.cmp(&self.team2_score) {
            std::cmp::Ordering::Greater => Some(TeamSide::Team1),
            std::cmp::Ordering::Less => Some(TeamSide::Team2),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub(crate) fn recompute_derived(&mut self) {
        self.winner = self.derive_winner();
        for entry in self.team1_composition.values_mut() {
            entry.recompute_derived();
        }
        for entry in self.team2_composition.values_mut() {
            entry.recompute_derived();
        }
    }
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Field-group stamps of a match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStamps {
    /// Status group.
    pub status: Timestamp,
    /// Current map group.
    pub current_map: Timestamp,
}

/// Synchronized view of one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    /// Match identifier.
    pub id: MatchId,
    /// Maps won by team 1 (derived).
    pub team1_score: u32,
    /// Maps won by team 2 (derived).
    pub team2_score: u32,
    /// Match status.
    pub status: MatchStatus,
    /// Index of the current map (0-based).
    pub current_map_index: usize,
    /// Highest accepted server timestamp.
    pub last_updated: Timestamp,
    /// Maps keyed by map number.
    pub maps: BTreeMap<u32, MapState>,
    /// Last accepted server timestamp per match field-group.
    pub stamps: MatchStamps,
}

impl MatchState {
    /// Create an empty match view.
    pub fn new(id: MatchId) -> Self {
        Self {
            id,
            team1_score: 0,
            team2_score: 0,
            status: MatchStatus::Upcoming,
            current_map_index: 0,
            last_updated: 0,
            maps: BTreeMap::new(),
            stamps: MatchStamps::default(),
        }
    }

    /// Number of the current map (1-based).
    pub fn current_map_number(&self) -> u32 {
        u32::try_from(self.current_map_index).map_or(u32::MAX, |i| i.saturating_add(1))
    }

    /// The current map, if known.
    pub fn current_map(&self) -> Option<&MapState> {
        self.maps.get(&self.current_map_number())
    }

    /// Look up a map.
    pub fn map(&self, map_number: u32) -> Option<&MapState> {
        self.maps.get(&map_number)
    }

    /// Series score of one team.
    pub fn score(&self, team: TeamSide) -> u32 {
        match team {
            TeamSide::Team1 => self.team1_score,
            TeamSide::Team2 => self.team2_score,
        }
    }

    /// Stamp of a match field-group.
    pub fn stamp(&self, group: FieldGroup) -> Timestamp {
        match group {
            FieldGroup::MatchStatus => self.stamps.status,
            FieldGroup::CurrentMap => self.stamps.current_map,
            _ => 0,
        }
    }

    /// Recompute every derived field from base fields.
    ///
    /// Series score is the count of completed maps won; nothing pushed by
    /// the server for it is trusted.
    pub fn recompute_derived(&mut self) {
        let mut team1 = 0;
        let mut team2 = 0;
        for map in self.maps.values_mut() {
            map.recompute_derived();
            match map.winner {
                Some(TeamSide::Team1) => team1 += 1,
                Some(TeamSide::Team2) => team2 += 1,
                None => {}
            }
        }
        self.team1_score = team1;
        self.team2_score = team2;
    }
}

// =============================================================================
// TESTS
// =============================================================================
