//! State Merge Engine
//!
//! Applies updates to the match entity tree under three rules:
//!
//! - **Ordering**: an update is accepted per field-group only if its server
//!   timestamp is >= the group's stored stamp. Older writes are discarded.
//! - **Shallow merge**: only fields present in the update are written, so
//!   updates to unrelated groups never clobber each other.
//! - **Derivation**: winners, series score and kda are recomputed after
//!   every accepted merge and never taken from a payload.
//!
//! The emitted [`MatchDelta`] is the diff between the tree before and after
//! the merge, so it lists exactly what changed.

use std::collections::{HashMap, VecDeque};
use sha2::{Sha256, Digest};
use thiserror::Error;
use tracing::{debug, trace};

use crate::merge::delta::{Change, MatchDelta, Origin};
use crate::model::state::{
    FieldGroup, MapState, MapStatus, MatchId, MatchState, PlayerCompositionEntry, PlayerId,
    TeamSide, Timestamp,
};
use crate::model::update::{
    HeroChange, InboundMessage, MapTransition, MatchSnapshot, RosterEntry, ScoreDelta, StatDelta,
    StatusChange, StructuralChange, Topic, Update,
};

/// Fingerprints remembered per match for duplicate suppression.
pub const RECENT_FINGERPRINTS: usize = 128;

/// Merge input.
#[derive(Debug, Clone, Copy)]
pub enum Incoming<'a> {
    /// Raw push message; decoded by topic.
    Message(&'a InboundMessage),
    /// Already-decoded update.
    Update {
        /// The update.
        update: &'a Update,
        /// Server timestamp.
        server_timestamp: Timestamp,
    },
    /// Full snapshot; topic-agnostic.
    Snapshot(&'a MatchSnapshot),
}

/// Merge result.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// At least one field changed.
    Applied(MatchDelta),
    /// Accepted but nothing changed.
    Unchanged,
    /// Every touched field-group holds a newer write.
    Stale {
        /// First rejecting group.
        group: FieldGroup,
        /// Stored stamp.
        stored: Timestamp,
        /// Rejected timestamp.
        incoming: Timestamp,
    },
    /// Same topic, timestamp and payload as a recent update.
    Duplicate,
}

impl MergeOutcome {
    /// Delta, if anything changed.
    pub fn delta(&self) -> Option<&MatchDelta> {
        match self {
            MergeOutcome::Applied(delta) => Some(delta),
            _ => None,
        }
    }
}

/// Input that cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Payload does not match its topic.
    #[error("malformed {topic} payload: {reason}")]
    Malformed {
        /// Topic of the message.
        topic: Topic,
        /// Decoder message.
        reason: String,
    },
    /// Snapshot without server timestamp.
    #[error("snapshot for match {0} carries no timestamp")]
    MissingTimestamp(MatchId),
    /// Snapshot for another match.
    #[error("snapshot for match {got} delivered to match {expected}")]
    SnapshotMismatch {
        /// Channel's match.
        expected: MatchId,
        /// Snapshot's match.
        got: MatchId,
    },
}

// =============================================================================
// ENGINE
// =============================================================================

/// Owns the entity trees of every tracked match.
#[derive(Debug, Default)]
pub struct MergeEngine {
    matches: HashMap<MatchId, MatchState>,
    recent: HashMap<MatchId, VecDeque<[u8; 32]>>,
}

impl MergeEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a match (idempotent).
    pub fn track(&mut self, match_id: MatchId) -> &MatchState {
        self.matches
            .entry(match_id)
            .or_insert_with(|| MatchState::new(match_id))
    }

    /// Stop tracking a match, dropping its state.
    pub fn forget(&mut self, match_id: MatchId) -> Option<MatchState> {
        self.recent.remove(&match_id);
        self.matches.remove(&match_id)
    }

    /// Current state of a match.
    pub fn get(&self, match_id: MatchId) -> Option<&MatchState> {
        self.matches.get(&match_id)
    }

    /// Whether a match is tracked.
    pub fn is_tracked(&self, match_id: MatchId) -> bool {
        self.matches.contains_key(&match_id)
    }

    /// Number of tracked matches.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Whether no match is tracked.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Single merge entry point for push, poll and mirror input.
    pub fn apply(
        &mut self,
        match_id: MatchId,
        incoming: Incoming<'_>,
        origin: Origin,
    ) -> Result<MergeOutcome, MergeError> {
        match incoming {
            Incoming::Message(msg) => {
                let update = msg.decode().map_err(|e| MergeError::Malformed {
                    topic: msg.topic,
                    reason: e.to_string(),
                })?;
                Ok(self.apply_update(match_id, &update, msg.server_timestamp, origin))
            }
            Incoming::Update { update, server_timestamp } => {
                Ok(self.apply_update(match_id, update, server_timestamp, origin))
            }
            Incoming::Snapshot(snapshot) => self.apply_snapshot(match_id, snapshot, origin),
        }
    }

    fn apply_update(
        &mut self,
        match_id: MatchId,
        update: &Update,
        ts: Timestamp,
        origin: Origin,
    ) -> MergeOutcome {
        let fingerprint = fingerprint(update, ts);
        let recent = self.recent.entry(match_id).or_default();
        if recent.contains(&fingerprint) {
            trace!(
                match_id,
                topic = %update.topic(),
                ts,
                fingerprint = %hex::encode(&fingerprint[..8]),
                "duplicate update ignored"
            );
            return MergeOutcome::Duplicate;
        }
        if recent.len() >= RECENT_FINGERPRINTS {
            recent.pop_front();
        }
        recent.push_back(fingerprint);

        let state = self
            .matches
            .entry(match_id)
            .or_insert_with(|| MatchState::new(match_id));
        merge_batch(state, std::slice::from_ref(update), ts, origin)
    }

    fn apply_snapshot(
        &mut self,
        match_id: MatchId,
        snapshot: &MatchSnapshot,
        origin: Origin,
    ) -> Result<MergeOutcome, MergeError> {
        if snapshot.id != match_id {
            return Err(MergeError::SnapshotMismatch { expected: match_id, got: snapshot.id });
        }
        let ts = snapshot
            .timestamp()
            .ok_or(MergeError::MissingTimestamp(match_id))?;
        let updates = decompose_snapshot(snapshot);

        let state = self
            .matches
            .entry(match_id)
            .or_insert_with(|| MatchState::new(match_id));
        Ok(merge_batch(state, &updates, ts, origin))
    }
}

// =============================================================================
// MERGE
// =============================================================================

fn fingerprint(update: &Update, ts: Timestamp) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(update.topic().as_str().as_bytes());
    hasher.update(ts.to_be_bytes());
    // serde_json maps are key-ordered, so the encoding is canonical.
    hasher.update(update.to_payload().to_string().as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn merge_batch(
    state: &mut MatchState,
    updates: &[Update],
    ts: Timestamp,
    origin: Origin,
) -> MergeOutcome {
    let before = state.clone();
    let mut applier = Applier { state, ts, accepted: 0, stale: None };
    for update in updates {
        applier.apply(update);
    }

    if applier.accepted == 0 {
        if let Some((group, stored)) = applier.stale {
            debug!(
                match_id = before.id,
                ?group,
                stored,
                incoming = ts,
                "stale update discarded"
            );
            return MergeOutcome::Stale { group, stored, incoming: ts };
        }
        return MergeOutcome::Unchanged;
    }

    let state = applier.state;
    state.recompute_derived();
    state.last_updated = state.last_updated.max(ts);

    let mut delta = MatchDelta::new(state.id, ts, origin);
    delta.changes = diff(&before, state);
    if delta.is_empty() {
        trace!(match_id = state.id, ts, "update changed nothing");
        MergeOutcome::Unchanged
    } else {
        debug!(match_id = state.id, ts, changes = delta.changes.len(), ?origin, "merge applied");
        MergeOutcome::Applied(delta)
    }
}

/// Writes one update's fields under the per-group timestamp guard.
struct Applier<'a> {
    state: &'a mut MatchState,
    ts: Timestamp,
    accepted: usize,
    stale: Option<(FieldGroup, Timestamp)>,
}

impl Applier<'_> {
    fn admit(&mut self, group: FieldGroup, stored: Timestamp) -> bool {
        if self.ts < stored {
            self.stale.get_or_insert((group, stored));
            false
        } else {
            self.accepted += 1;
            true
        }
    }

    /// Lazy entity creation with no timestamped field.
    fn touch(&mut self) {
        self.accepted += 1;
    }

    fn resolve_map(&self, map_number: Option<u32>) -> u32 {
        map_number.unwrap_or_else(|| self.state.current_map_number())
    }

    fn map_stamp(&self, map_number: u32, group: FieldGroup) -> Timestamp {
        self.state
            .maps
            .get(&map_number)
            .map(|m| m.stamp(group))
            .unwrap_or(0)
    }

    fn player_stamp(
        &self,
        map_number: u32,
        team: TeamSide,
        player_id: PlayerId,
        group: FieldGroup,
    ) -> Timestamp {
        self.state
            .maps
            .get(&map_number)
            .and_then(|m| m.player(team, player_id))
            .map(|p| p.stamp(group))
            .unwrap_or(0)
    }

    fn map(&mut self, map_number: u32) -> &mut MapState {
        self.state
            .maps
            .entry(map_number)
            .or_insert_with(|| MapState::new(map_number))
    }

    fn player(
        &mut self,
        map_number: u32,
        team: TeamSide,
        player_id: PlayerId,
    ) -> &mut PlayerCompositionEntry {
        self.map(map_number)
            .composition_mut(team)
            .entry(player_id)
            .or_insert_with(|| PlayerCompositionEntry::new(player_id))
    }

    fn apply(&mut self, update: &Update) {
        match update {
            Update::Score(u) => self.score(u),
            Update::Hero(u) => self.hero(u),
            Update::Stats(u) => self.stats(u),
            Update::MapTransition(u) => self.map_transition(u),
            Update::Status(u) => self.status(u),
            Update::Structure(u) => self.structure(u),
        }
    }

    fn score(&mut self, u: &ScoreDelta) {
        if u.team1.is_none() && u.team2.is_none() {
            return;
        }
        let n = self.resolve_map(u.map_number);
        if !self.admit(FieldGroup::MapScore, self.map_stamp(n, FieldGroup::MapScore)) {
            return;
        }
        let ts = self.ts;
        let map = self.map(n);
        if let Some(v) = u.team1 {
            map.team1_score = v;
        }
        if let Some(v) = u.team2 {
            map.team2_score = v;
        }
        map.last_updated.score = ts;
    }

    fn hero(&mut self, u: &HeroChange) {
        let n = self.resolve_map(u.map_number);
        let stored = self.player_stamp(n, u.team, u.player_id, FieldGroup::Hero);
        if !self.admit(FieldGroup::Hero, stored) {
            return;
        }
        let ts = self.ts;
        let player = self.player(n, u.team, u.player_id);
        player.hero = Some(u.hero.clone());
        if let Some(role) = &u.role {
            player.role = Some(role.clone());
        }
        player.last_updated.hero = ts;
    }

    fn stats(&mut self, u: &StatDelta) {
        let n = self.resolve_map(u.map_number);
        let stored = self.player_stamp(n, u.team, u.player_id, FieldGroup::Stats);
        if !self.admit(FieldGroup::Stats, stored) {
            return;
        }
        let ts = self.ts;
        let player = self.player(n, u.team, u.player_id);
        let stats = &mut player.stats;
        if let Some(v) = u.eliminations {
            stats.eliminations = v;
        }
        if let Some(v) = u.deaths {
            stats.deaths = v;
        }
        if let Some(v) = u.assists {
            stats.assists = v;
        }
        if let Some(v) = u.damage {
            stats.damage = v;
        }
        if let Some(v) = u.healing {
            stats.healing = v;
        }
        if let Some(v) = u.damage_blocked {
            stats.damage_blocked = v;
        }
        player.last_updated.stats = ts;
    }

    fn map_name(&mut self, n: u32, name: Option<&String>) {
        let Some(name) = name else { return };
        if !self.admit(FieldGroup::MapName, self.map_stamp(n, FieldGroup::MapName)) {
            return;
        }
        let ts = self.ts;
        let map = self.map(n);
        map.map_name = Some(name.clone());
        map.last_updated.name = ts;
    }

    fn map_mode(&mut self, n: u32, mode: Option<&String>) {
        let Some(mode) = mode else { return };
        if !self.admit(FieldGroup::MapMode, self.map_stamp(n, FieldGroup::MapMode)) {
            return;
        }
        let ts = self.ts;
        let map = self.map(n);
        map.mode = Some(mode.clone());
        map.last_updated.mode = ts;
    }

    fn map_status(&mut self, n: u32, status: Option<MapStatus>) {
        let Some(status) = status else { return };
        if !self.admit(FieldGroup::MapStatus, self.map_stamp(n, FieldGroup::MapStatus)) {
            return;
        }
        let ts = self.ts;
        let map = self.map(n);
        map.status = status;
        map.last_updated.status = ts;
    }

    fn map_transition(&mut self, u: &MapTransition) {
        if u.map_number == 0 {
            debug!(match_id = self.state.id, "map transition to map 0 ignored");
            return;
        }
        self.map_name(u.map_number, u.map_name.as_ref());
        self.map_mode(u.map_number, u.mode.as_ref());
        self.map_status(u.map_number, u.status);
        if u.make_current {
            let stored = self.state.stamp(FieldGroup::CurrentMap);
            if self.admit(FieldGroup::CurrentMap, stored) {
                self.map(u.map_number);
                self.state.current_map_index = (u.map_number - 1) as usize;
                self.state.stamps.current_map = self.ts;
            }
        }
    }

    fn status(&mut self, u: &StatusChange) {
        if let Some(status) = u.status {
            let stored = self.state.stamp(FieldGroup::MatchStatus);
            if self.admit(FieldGroup::MatchStatus, stored) {
                self.state.status = status;
                self.state.stamps.status = self.ts;
            }
        }
        if let Some(map_status) = u.map_status {
            let n = self.resolve_map(u.map_number);
            self.map_status(n, Some(map_status));
        }
    }

    fn structure(&mut self, u: &StructuralChange) {
        for outline in &u.maps {
            if outline.map_number == 0 {
                continue;
            }
            self.map(outline.map_number);
            self.touch();
            self.map_name(outline.map_number, outline.map_name.as_ref());
            self.map_mode(outline.map_number, outline.mode.as_ref());
        }
        for entry in &u.roster {
            let targets: Vec<u32> = match entry.map_number {
                Some(n) => vec![n],
                None if self.state.maps.is_empty() => vec![self.state.current_map_number()],
                None => self.state.maps.keys().copied().collect(),
            };
            for n in targets {
                self.identity(n, entry);
            }
        }
    }

    fn identity(&mut self, n: u32, entry: &RosterEntry) {
        if entry.name.is_none() && entry.country.is_none() {
            self.player(n, entry.team, entry.player_id);
            self.touch();
            return;
        }
        let stored = self.player_stamp(n, entry.team, entry.player_id, FieldGroup::Identity);
        if !self.admit(FieldGroup::Identity, stored) {
            return;
        }
        let ts = self.ts;
        let player = self.player(n, entry.team, entry.player_id);
        if let Some(name) = &entry.name {
            player.name = Some(name.clone());
        }
        if let Some(country) = &entry.country {
            player.country = Some(country.clone());
        }
        player.last_updated.identity = ts;
    }
}

/// Break a snapshot into per-group updates.
fn decompose_snapshot(snapshot: &MatchSnapshot) -> Vec<Update> {
    let mut updates = vec![Update::Status(StatusChange {
        status: Some(snapshot.status),
        map_number: None,
        map_status: None,
    })];

    for map in &snapshot.maps {
        if map.map_number == 0 {
            continue;
        }
        updates.push(Update::MapTransition(MapTransition {
            map_number: map.map_number,
            map_name: map.map_name.clone(),
            mode: map.mode.clone(),
            status: Some(map.status),
            make_current: false,
        }));
        updates.push(Update::Score(ScoreDelta {
            map_number: Some(map.map_number),
            team1: Some(map.team1_score),
            team2: Some(map.team2_score),
        }));

        let mut roster = Vec::new();
        let teams = [
            (TeamSide::Team1, &map.team1_composition),
            (TeamSide::Team2, &map.team2_composition),
        ];
        for (team, players) in teams {
            for p in players {
                roster.push(RosterEntry {
                    map_number: Some(map.map_number),
                    team,
                    player_id: p.player_id,
                    name: p.name.clone(),
                    country: p.country.clone(),
                });
                if let Some(hero) = &p.hero {
                    updates.push(Update::Hero(HeroChange {
                        map_number: Some(map.map_number),
                        team,
                        player_id: p.player_id,
                        hero: hero.clone(),
                        role: p.role.clone(),
                    }));
                }
                updates.push(Update::Stats(StatDelta {
                    map_number: Some(map.map_number),
                    team,
                    player_id: p.player_id,
                    eliminations: Some(p.eliminations),
                    deaths: Some(p.deaths),
                    assists: Some(p.assists),
                    damage: Some(p.damage),
                    healing: Some(p.healing),
                    damage_blocked: Some(p.damage_blocked),
                }));
            }
        }
        if !roster.is_empty() {
            updates.push(Update::Structure(StructuralChange { maps: Vec::new(), roster }));
        }
    }

    let current = u32::try_from(snapshot.current_map_index)
        .ok()
        .and_then(|index| index.checked_add(1));
    match current {
        Some(map_number) => updates.push(Update::MapTransition(MapTransition {
            map_number,
            map_name: None,
            mode: None,
            status: None,
            make_current: true,
        })),
        None => debug!(
            match_id = snapshot.id,
            index = snapshot.current_map_index,
            "snapshot current map index out of range, pointer skipped"
        ),
    }
    updates
}

// =============================================================================
// DIFF
// =============================================================================

/// Entity-level changes between two versions of the same match.
fn diff(before: &MatchState, after: &MatchState) -> Vec<Change> {
    let mut changes = Vec::new();

    if before.status != after.status {
        changes.push(Change::MatchStatus { status: after.status });
    }
    if before.current_map_index != after.current_map_index {
        changes.push(Change::CurrentMap { index: after.current_map_index });
    }

    for (n, map) in &after.maps {
        let baseline = match before.maps.get(n) {
            Some(old) => old.clone(),
            None => {
                changes.push(Change::MapCreated { map_number: *n });
                MapState::new(*n)
            }
        };
        let map_name = changed(&baseline.map_name, &map.map_name);
        let mode = changed(&baseline.mode, &map.mode);
        if map_name.is_some() || mode.is_some() {
            changes.push(Change::MapMeta { map_number: *n, map_name, mode });
        }
        if baseline.status != map.status {
            changes.push(Change::MapStatus { map_number: *n, status: map.status });
        }
        if (baseline.team1_score, baseline.team2_score, baseline.winner)
            != (map.team1_score, map.team2_score, map.winner)
        {
            changes.push(Change::MapScore {
                map_number: *n,
                team1: map.team1_score,
                team2: map.team2_score,
                winner: map.winner,
            });
        }
        for team in [TeamSide::Team1, TeamSide::Team2] {
            diff_composition(&baseline, map, team, &mut changes);
        }
    }

    if (before.team1_score, before.team2_score) != (after.team1_score, after.team2_score) {
        changes.push(Change::MatchScore { team1: after.team1_score, team2: after.team2_score });
    }
    changes
}

/// New value of an optional field, if it moved.
fn changed(before: &Option<String>, after: &Option<String>) -> Option<String> {
    if before == after {
        None
    } else {
        after.clone()
    }
}

fn diff_composition(before: &MapState, after: &MapState, team: TeamSide, out: &mut Vec<Change>) {
    let map_number = after.map_number;
    for (id, player) in after.composition(team) {
        let baseline = match before.player(team, *id) {
            Some(old) => old.clone(),
            None => {
                out.push(Change::PlayerAdded { map_number, team, player_id: *id });
                PlayerCompositionEntry::new(*id)
            }
        };
        if (&baseline.name, &baseline.country) != (&player.name, &player.country) {
            out.push(Change::Identity {
                map_number,
                team,
                player_id: *id,
                name: player.name.clone(),
                country: player.country.clone(),
            });
        }
        if (&baseline.hero, &baseline.role) != (&player.hero, &player.role) {
            out.push(Change::Hero {
                map_number,
                team,
                player_id: *id,
                hero: player.hero.clone(),
                role: player.role.clone(),
            });
        }
        if baseline.stats != player.stats {
            out.push(Change::Stats {
                map_number,
                team,
                player_id: *id,
                stats: player.stats,
                kda: player.kda,
            });
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
