// tavern_relay — room directory and message broker for Tavern sessions.
//
// The relay never simulates anything: it brokers room membership, tracks
// which member is host, and forwards opaque event envelopes between peers.
// All game semantics live on the peers (`tavern_peer`); the single source of
// ordering is whichever peer is currently host.
//
// Module overview:
// - `directory.rs`: the authoritative room registry — codes, join-ordered
//                   membership, deterministic host succession, eager room
//                   deletion. The core data structure `server.rs` drives.
// - `server.rs`:    TCP listener, reader threads (one per peer), and the
//                   single-threaded main event loop that routes the four
//                   message classes: peer management, emit-to-host,
//                   broadcast-to-room, and history request/response.
//
// Dependencies: `tavern_protocol` (shared message types and framing).
//
// The relay can run standalone (`main.rs`, the `relay` binary) or be
// embedded in a test or game process via `start_relay`.

pub mod directory;
pub mod server;

pub use server::start_relay;
