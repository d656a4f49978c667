// tavern_protocol — wire protocol for room relay communication.
//
// This crate defines the message vocabulary, framing, and identity types
// shared by the relay server (`tavern_relay`) and peers (`tavern_peer`). It
// knows nothing about any particular game: state-changing events travel as
// opaque JSON values inside `messages`/`history` arrays.
//
// Module overview:
// - `types.rs`:   `PlayerId`, `Color`, and the shape-validated `RoomCode`.
// - `message.rs`: `ClientEvent` / `ServerEvent` tagged unions serialized as
//                 `{type, payload}` envelopes with fixed external names.
// - `framing.rs`: length-delimited framing over any `Read`/`Write`: 4-byte
//                 big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON on the wire.** Envelope type tags and camelCase payload fields
//   are the protocol's interoperability contract and are pinned by tests.
// - **Opaque event payloads.** The relay routes them; only peers interpret
//   them, through their reducer's own event type.
// - **No async runtime.** Framing targets blocking `std::io` streams; both
//   relay and peers are thread-per-reader over plain TCP.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_frame, write_frame};
pub use message::{ClientEvent, ServerEvent};
pub use types::{Color, PlayerId, RoomCode};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn framed_client_event_roundtrip() {
        let msg = ClientEvent::RequestJoin {
            room_code: "QRS-042".into(),
            color: Color::Orange,
            host_if_needed: true,
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &json).unwrap();

        let payload = read_frame(&mut Cursor::new(&wire)).unwrap();
        let back: ClientEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn framed_server_event_roundtrip() {
        let msg = ServerEvent::NewHost {
            host_id: PlayerId(12),
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &json).unwrap();

        let payload = read_frame(&mut Cursor::new(&wire)).unwrap();
        let back: ServerEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(back, msg);
    }
}
