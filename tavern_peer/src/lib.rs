// tavern_peer — client-side building blocks for relay-brokered sessions.
//
// A peer is two cooperating layers:
// - `connection.rs`: the TCP transport and room-membership state machine
//                    (`Initial`/`Lobby`/`Joining`/`Room`/`Disconnected`),
//                    including reconnect-with-rejoin after transport loss.
// - `log.rs`:        the host-authoritative event log — a deterministic
//                    `Reducer` plus the accepted sequence that produced its
//                    state. Hosts decide, replicas follow.
// - `peer.rs`:       the glue. `Peer` routes proposals, broadcasts, and
//                    history bootstrap between the two layers so every room
//                    member converges on the same reducer state.
//
// Games plug in by implementing `Reducer` for their state type; everything
// else (framing, room lifecycle, host migration, history replay) is
// game-agnostic.

pub mod connection;
pub mod log;
pub mod peer;

pub use connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStatus};
pub use log::{Accepted, EventLog, Reducer};
pub use peer::{Peer, PeerUpdate};
