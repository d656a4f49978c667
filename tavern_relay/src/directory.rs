// Room directory: the authoritative registry of rooms, members, and hosts.
//
// `RoomDirectory` is a plain in-memory structure driven exclusively from the
// server's single-threaded main loop — no internal locking. It maintains two
// maps that must stay consistent: room code → room record, and player →
// room code (the reverse index used for routing).
//
// Invariants:
// - A color appears at most once per room.
// - `host_id`, when set, names a current member — except for the brief window
//   between `create_room` and the creator's `add_member`, which the server
//   performs back-to-back within one event.
// - A room record is deleted the instant its membership empties.
//
// Host succession is deterministic: the oldest remaining member by join
// order. That keeps every observer's idea of "who is host now" convergent
// without any extra coordination.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

use tavern_protocol::types::{Color, PlayerId, RoomCode};

/// Failures surfaced by directory operations. All are ordinary return values
/// that the server translates into `ROOM_JOIN_FAILURE` responses; none are
/// fatal to the connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("room not found")]
    RoomNotFound,
    /// Retryable: regenerate the code and try again.
    #[error("duplicate room code: {0}")]
    DuplicateRoomId(RoomCode),
    #[error("invalid room code: {0:?}")]
    InvalidRoomId(String),
    #[error("color {0} is already taken in this room")]
    ColorConflict(Color),
    #[error("{0} is not in any room")]
    PlayerNotFound(PlayerId),
}

/// One room member: connection identity plus claimed color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub player_id: PlayerId,
    pub color: Color,
}

/// Read-only view of a room, for diagnostics and broadcast targeting.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub code: RoomCode,
    pub created_at_ms: u64,
    pub members: Vec<Member>,
    pub host_id: Option<PlayerId>,
}

struct RoomRecord {
    created_at_ms: u64,
    /// Join order; index 0 is the oldest member and the host successor.
    members: Vec<Member>,
    host_id: Option<PlayerId>,
}

/// In-memory room registry. See module docs for the consistency rules.
#[derive(Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomCode, RoomRecord>,
    room_of: HashMap<PlayerId, RoomCode>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with `creator` as host. A supplied code must satisfy
    /// the shape invariant (`InvalidRoomId`) and must not collide with a
    /// live room (`DuplicateRoomId`); without one a random code is drawn.
    /// The creator is not yet a member — the caller follows up with
    /// `add_member` immediately.
    pub fn create_room(
        &mut self,
        creator: PlayerId,
        override_code: Option<&str>,
    ) -> Result<RoomCode, DirectoryError> {
        let code = match override_code {
            Some(raw) => {
                RoomCode::parse(raw).ok_or_else(|| DirectoryError::InvalidRoomId(raw.to_owned()))?
            }
            None => RoomCode::generate(&mut rand::rng()),
        };
        if self.rooms.contains_key(&code) {
            return Err(DirectoryError::DuplicateRoomId(code));
        }
        self.rooms.insert(
            code.clone(),
            RoomRecord {
                created_at_ms: now_ms(),
                members: Vec::new(),
                host_id: Some(creator),
            },
        );
        Ok(code)
    }

    pub fn room_exists(&self, code: &RoomCode) -> bool {
        self.rooms.contains_key(code)
    }

    /// The room this player currently belongs to.
    pub fn lookup_room_of(&self, player: PlayerId) -> Result<RoomCode, DirectoryError> {
        self.room_of
            .get(&player)
            .cloned()
            .ok_or(DirectoryError::PlayerNotFound(player))
    }

    /// Append a member and index them. Fails on a missing room or a color
    /// already claimed there.
    pub fn add_member(&mut self, member: Member, code: &RoomCode) -> Result<(), DirectoryError> {
        let room = self.rooms.get_mut(code).ok_or(DirectoryError::RoomNotFound)?;
        if room.members.iter().any(|m| m.color == member.color) {
            return Err(DirectoryError::ColorConflict(member.color));
        }
        room.members.push(member);
        self.room_of.insert(member.player_id, code.clone());
        Ok(())
    }

    /// Remove a member, reassigning host to the oldest remaining member if
    /// the host left, and deleting the room once empty. Returns the room's
    /// host after removal (`None` when the room was deleted). The player →
    /// room index entry is cleared unconditionally.
    pub fn remove_member(
        &mut self,
        player: PlayerId,
        code: &RoomCode,
    ) -> Result<Option<PlayerId>, DirectoryError> {
        self.room_of.remove(&player);
        let room = self.rooms.get_mut(code).ok_or(DirectoryError::RoomNotFound)?;

        let new_host = if room.host_id == Some(player) {
            room.members
                .iter()
                .find(|m| m.player_id != player)
                .map(|m| m.player_id)
        } else {
            room.host_id
        };

        room.members.retain(|m| m.player_id != player);
        if room.members.is_empty() {
            self.rooms.remove(code);
            return Ok(None);
        }
        room.host_id = new_host;
        Ok(new_host)
    }

    pub fn get_room(&self, code: &RoomCode) -> Option<RoomSnapshot> {
        self.rooms.get(code).map(|room| RoomSnapshot {
            code: code.clone(),
            created_at_ms: room.created_at_ms,
            members: room.members.clone(),
            host_id: room.host_id,
        })
    }

    pub fn host_of(&self, code: &RoomCode) -> Option<PlayerId> {
        self.rooms.get(code).and_then(|room| room.host_id)
    }

    pub fn member_ids(&self, code: &RoomCode) -> Vec<PlayerId> {
        self.rooms
            .get(code)
            .map(|room| room.members.iter().map(|m| m.player_id).collect())
            .unwrap_or_default()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
