//! Merge Deltas
//!
//! Normalized description of what an accepted merge changed. The dispatcher
//! routes each change by topic; the cross-tab mirror re-encodes each change
//! as the minimal update that reproduces it.

use serde::{Serialize, Deserialize};

use crate::model::state::{
    MapStatus, MatchId, MatchStatus, PlayerId, PlayerStats, TeamSide, Timestamp,
};
use crate::model::update::{
    HeroChange, MapOutline, MapTransition, RosterEntry, ScoreDelta, StatDelta, StatusChange,
    StructuralChange, Topic, Update,
};

/// Where an update came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Live push transport.
    Push,
    /// Fallback snapshot poll.
    Poll,
    /// Sibling tab through the mirror.
    Mirror,
}

/// One changed entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// Derived series score moved.
    MatchScore {
        /// Maps won by team 1.
        team1: u32,
        /// Maps won by team 2.
        team2: u32,
    },
    /// Map score or derived winner moved.
    MapScore {
        /// Map number.
        map_number: u32,
        /// Team 1 map score.
        team1: u32,
        /// Team 2 map score.
        team2: u32,
        /// Derived winner.
        winner: Option<TeamSide>,
    },
    /// Map created lazily.
    MapCreated {
        /// Map number.
        map_number: u32,
    },
    /// Map name or mode changed. Only the changed fields are set.
    MapMeta {
        /// Map number.
        map_number: u32,
        /// New map name.
        map_name: Option<String>,
        /// New game mode.
        mode: Option<String>,
    },
    /// Map status changed.
    MapStatus {
        /// Map number.
        map_number: u32,
        /// New status.
        status: MapStatus,
    },
    /// Current map pointer moved.
    CurrentMap {
        /// New index (0-based).
        index: usize,
    },
    /// Match status changed.
    MatchStatus {
        /// New status.
        status: MatchStatus,
    },
    /// Player entry created on a map.
    PlayerAdded {
        /// Map number.
        map_number: u32,
        /// Team.
        team: TeamSide,
        /// Player identifier.
        player_id: PlayerId,
    },
    /// Player hero or role changed.
    Hero {
        /// Map number.
        map_number: u32,
        /// Team.
        team: TeamSide,
        /// Player identifier.
        player_id: PlayerId,
        /// Hero.
        hero: Option<String>,
        /// Role.
        role: Option<String>,
    },
    /// Player statistics changed.
    Stats {
        /// Map number.
        map_number: u32,
        /// Team.
        team: TeamSide,
        /// Player identifier.
        player_id: PlayerId,
        /// All counters after the merge.
        stats: PlayerStats,
        /// Derived ratio after the merge.
        kda: f64,
    },
    /// Player identity changed.
    Identity {
        /// Map number.
        map_number: u32,
        /// Team.
        team: TeamSide,
        /// Player identifier.
        player_id: PlayerId,
        /// Display name.
        name: Option<String>,
        /// Country code.
        country: Option<String>,
    },
}

impl Change {
    /// Whether both describe the same entity and field-group, so the later
    /// one carries every value the earlier one did.
    fn supersedes(&self, earlier: &Change) -> bool {
        match (self, earlier) {
            (Change::MatchScore { .. }, Change::MatchScore { .. })
            | (Change::CurrentMap { .. }, Change::CurrentMap { .. })
            | (Change::MatchStatus { .. }, Change::MatchStatus { .. }) => true,
            (Change::MapScore { map_number: a, .. }, Change::MapScore { map_number: b, .. })
            | (Change::MapCreated { map_number: a }, Change::MapCreated { map_number: b })
            | (Change::MapStatus { map_number: a, .. }, Change::MapStatus { map_number: b, .. }) => {
                a == b
            }
            (
                Change::Hero { map_number: a, team: ta, player_id: pa, .. },
                Change::Hero { map_number: b, team: tb, player_id: pb, .. },
            )
            | (
                Change::Stats { map_number: a, team: ta, player_id: pa, .. },
                Change::Stats { map_number: b, team: tb, player_id: pb, .. },
            )
            | (
                Change::Identity { map_number: a, team: ta, player_id: pa, .. },
                Change::Identity { map_number: b, team: tb, player_id: pb, .. },
            )
            | (
                Change::PlayerAdded { map_number: a, team: ta, player_id: pa },
                Change::PlayerAdded { map_number: b, team: tb, player_id: pb },
            ) => (a, ta, pa) == (b, tb, pb),
            _ => false,
        }
    }

    /// Topic this change is dispatched under.
    pub fn topic(&self) -> Topic {
        match self {
            Change::MatchScore { .. } | Change::MapScore { .. } => Topic::ScoreDelta,
            Change::Hero { .. } => Topic::HeroChange,
            Change::Stats { .. } => Topic::StatDelta,
            Change::MapMeta { .. } | Change::MapStatus { .. } | Change::CurrentMap { .. } => {
                Topic::MapTransition
            }
            Change::MatchStatus { .. } => Topic::StatusChange,
            Change::MapCreated { .. } | Change::PlayerAdded { .. } | Change::Identity { .. } => {
                Topic::StructuralChange
            }
        }
    }

    /// Minimal update reproducing this change on another replica.
    ///
    /// Derived state has no update: replicas derive it. Lazily created
    /// entities become structural changes so replicas hold the same tree.
    pub fn to_update(&self) -> Option<Update> {
        let update = match self {
            Change::MatchScore { .. } => return None,
            Change::MapCreated { map_number } => Update::Structure(StructuralChange {
                maps: vec![MapOutline { map_number: *map_number, map_name: None, mode: None }],
                roster: Vec::new(),
            }),
            Change::PlayerAdded { map_number, team, player_id } => {
                Update::Structure(StructuralChange {
                    maps: Vec::new(),
                    roster: vec![RosterEntry {
                        map_number: Some(*map_number),
                        team: *team,
                        player_id: *player_id,
                        name: None,
                        country: None,
                    }],
                })
            }
            Change::MapScore { map_number, team1, team2, .. } => Update::Score(ScoreDelta {
                map_number: Some(*map_number),
                team1: Some(*team1),
                team2: Some(*team2),
            }),
            Change::MapMeta { map_number, map_name, mode } => {
                Update::MapTransition(MapTransition {
                    map_number: *map_number,
                    map_name: map_name.clone(),
                    mode: mode.clone(),
                    status: None,
                    make_current: false,
                })
            }
            Change::MapStatus { map_number, status } => Update::Status(StatusChange {
                status: None,
                map_number: Some(*map_number),
                map_status: Some(*status),
            }),
            Change::CurrentMap { index } => Update::MapTransition(MapTransition {
                map_number: *index as u32 + 1,
                map_name: None,
                mode: None,
                status: None,
                make_current: true,
            }),
            Change::MatchStatus { status } => Update::Status(StatusChange {
                status: Some(*status),
                map_number: None,
                map_status: None,
            }),
            Change::Hero { map_number, team, player_id, hero, role } => {
                // A cleared hero has no wire form.
                let hero = hero.clone()?;
                Update::Hero(HeroChange {
                    map_number: Some(*map_number),
                    team: *team,
                    player_id: *player_id,
                    hero,
                    role: role.clone(),
                })
            }
            Change::Stats { map_number, team, player_id, stats, .. } => Update::Stats(StatDelta {
                map_number: Some(*map_number),
                team: *team,
                player_id: *player_id,
                eliminations: Some(stats.eliminations),
                deaths: Some(stats.deaths),
                assists: Some(stats.assists),
                damage: Some(stats.damage),
                healing: Some(stats.healing),
                damage_blocked: Some(stats.damage_blocked),
            }),
            Change::Identity { map_number, team, player_id, name, country } => {
                Update::Structure(StructuralChange {
                    maps: vec![MapOutline { map_number: *map_number, map_name: None, mode: None }],
                    roster: vec![RosterEntry {
                        map_number: Some(*map_number),
                        team: *team,
                        player_id: *player_id,
                        name: name.clone(),
                        country: country.clone(),
                    }],
                })
            }
        };
        Some(update)
    }
}

/// Everything one accepted merge changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchDelta {
    /// Match concerned.
    pub match_id: MatchId,
    /// Server timestamp of the merged update.
    pub server_timestamp: Timestamp,
    /// Source of the update.
    pub origin: Origin,
    /// Changed entities, in application order.
    pub changes: Vec<Change>,
}

impl MatchDelta {
    /// Empty delta.
    pub fn new(match_id: MatchId, server_timestamp: Timestamp, origin: Origin) -> Self {
        Self { match_id, server_timestamp, origin, changes: Vec::new() }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Topics present in this delta.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.changes.iter().map(Change::topic).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Fold a later delta of the same match into this one. Later values
    /// replace earlier ones for the same entity; partial map metadata is
    /// combined field by field.
    pub fn absorb(&mut self, later: MatchDelta) {
        self.server_timestamp = self.server_timestamp.max(later.server_timestamp);
        self.origin = later.origin;
        for change in later.changes {
            if let Change::MapMeta { map_number, map_name, mode } = &change {
                let earlier = self.changes.iter_mut().find_map(|c| match c {
                    Change::MapMeta { map_number: n, map_name, mode } if *n == *map_number => {
                        Some((map_name, mode))
                    }
                    _ => None,
                });
                if let Some((earlier_name, earlier_mode)) = earlier {
                    if map_name.is_some() {
                        earlier_name.clone_from(map_name);
                    }
                    if mode.is_some() {
                        earlier_mode.clone_from(mode);
                    }
                    continue;
                }
            }
            self.changes.retain(|earlier| !change.supersedes(earlier));
            self.changes.push(change);
        }
    }

    /// Sub-delta holding only the changes of one topic.
    pub fn filter(&self, topic: Topic) -> Option<MatchDelta> {
        let changes: Vec<Change> = self
            .changes
            .iter()
            .filter(|c| c.topic() == topic)
            .cloned()
            .collect();
        if changes.is_empty() {
            return None;
        }
        Some(MatchDelta {
            match_id: self.match_id,
            server_timestamp: self.server_timestamp,
            origin: self.origin,
            changes,
        })
    }
}
