// Protocol messages for peer-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientEvent`: sent by peers to the relay.
// - `ServerEvent`: sent by the relay to peers (including envelopes the relay
//   forwards verbatim on behalf of another peer).
//
// Every message serializes to a `{"type": ..., "payload": ...}` envelope with
// SCREAMING_SNAKE type tags and camelCase payload fields. These external names
// are load-bearing: they are the interoperability surface, so renames here are
// protocol breaks.
//
// Game events are opaque `serde_json::Value`s — the relay routes the
// `messages`/`history` arrays without ever inspecting them. The peer crate
// serializes its reducer's event type into a `Value` before sending and
// deserializes after receiving, which keeps this crate independent of any
// particular game.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Color, PlayerId};

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    /// Create a room with a server-generated code; the requester becomes
    /// its sole member and host.
    #[serde(rename_all = "camelCase")]
    RequestHost { color: Color },
    /// Join an existing room. With `hostIfNeeded`, a missing room is
    /// recreated under the exact supplied code with the requester as host —
    /// the reconnection path after losing the relay connection.
    #[serde(rename_all = "camelCase")]
    RequestJoin {
        room_code: String,
        color: Color,
        #[serde(default)]
        host_if_needed: bool,
    },
    /// Requested events, forwarded verbatim to the sender's room host.
    #[serde(rename_all = "camelCase")]
    EmitToHost { messages: Vec<Value> },
    /// Accepted events, forwarded verbatim to every other room member.
    /// Only the room host may send this.
    #[serde(rename_all = "camelCase")]
    BroadcastRoom { messages: Vec<Value> },
    /// Late-join bootstrap: ask the host for the full accepted log.
    #[serde(rename_all = "camelCase")]
    BroadcastHistoryRequest { requester: PlayerId },
    /// Host's reply, routed point-to-point to `requester`.
    #[serde(rename_all = "camelCase")]
    BroadcastHistoryResponse {
        requester: PlayerId,
        history: Vec<Value>,
    },
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// Greeting on connection accept, carrying the peer's assigned identity.
    #[serde(rename_all = "camelCase")]
    Connected { player_id: PlayerId },
    /// A create or join request succeeded.
    #[serde(rename_all = "camelCase")]
    RoomJoinSuccess {
        is_host: bool,
        is_new_room: bool,
        room_code: String,
        color: Color,
    },
    /// A create or join request failed; retry is up to the peer.
    #[serde(rename_all = "camelCase")]
    RoomJoinFailure {
        room_code: String,
        failure_message: String,
        color: Color,
    },
    /// The directory reassigned the room's host.
    #[serde(rename_all = "camelCase")]
    NewHost { host_id: PlayerId },
    /// Forwarded from a room member to the host.
    #[serde(rename_all = "camelCase")]
    EmitToHost { messages: Vec<Value> },
    /// Forwarded from the host to the rest of the room.
    #[serde(rename_all = "camelCase")]
    BroadcastRoom { messages: Vec<Value> },
    /// Forwarded to the room host on behalf of a late joiner.
    #[serde(rename_all = "camelCase")]
    BroadcastHistoryRequest { requester: PlayerId },
    /// Forwarded point-to-point to the requesting peer.
    #[serde(rename_all = "camelCase")]
    BroadcastHistoryResponse {
        requester: PlayerId,
        history: Vec<Value>,
    },
    /// Fatal: delivered immediately before the relay force-closes the
    /// offending connection.
    #[serde(rename_all = "camelCase")]
    UnhandledError { message: String, extra: Value },
}
