// Test-only game and peer wrapper for convergence integration tests.
//
// `TicTacToe` is a small deterministic reducer: a 3x3 board where pieces
// are placed on empty tiles and removed from occupied ones. It exists to
// give the integration tests a concrete game whose replicas can be compared
// tile by tile.
//
// `TestPeer` wraps the real `Peer` (from `tavern_peer`) with synchronous
// polling helpers (blocking loops around `Peer::poll()`). All networking,
// room lifecycle, and log logic uses the same code paths as a real game
// client — the only test-specific code is the waiting.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use tavern_peer::{Peer, PeerUpdate, Reducer};
use tavern_protocol::types::{Color, PlayerId};

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub const BOARD_SIZE: usize = 3;

/// Events the test game accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TttEvent {
    #[serde(rename_all = "camelCase")]
    PlacePiece { x: usize, y: usize, color: Color },
    #[serde(rename_all = "camelCase")]
    RemovePiece { x: usize, y: usize },
}

/// 3x3 board. Placement requires an empty tile, removal an occupied one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TicTacToe {
    tiles: [[Option<Color>; BOARD_SIZE]; BOARD_SIZE],
}

impl TicTacToe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tile(&self, x: usize, y: usize) -> Option<Color> {
        self.tiles[y][x]
    }

    pub fn piece_count(&self) -> usize {
        self.tiles
            .iter()
            .flatten()
            .filter(|tile| tile.is_some())
            .count()
    }
}

impl Reducer for TicTacToe {
    type Event = TttEvent;

    fn reduce(&mut self, event: &TttEvent) -> Result<(), String> {
        match *event {
            TttEvent::PlacePiece { x, y, color } => {
                if x >= BOARD_SIZE || y >= BOARD_SIZE {
                    return Err(format!("({x}, {y}) is off the board"));
                }
                if self.tiles[y][x].is_some() {
                    return Err(format!("({x}, {y}) is occupied"));
                }
                self.tiles[y][x] = Some(color);
                Ok(())
            }
            TttEvent::RemovePiece { x, y } => {
                if x >= BOARD_SIZE || y >= BOARD_SIZE {
                    return Err(format!("({x}, {y}) is off the board"));
                }
                if self.tiles[y][x].is_none() {
                    return Err(format!("({x}, {y}) is empty"));
                }
                self.tiles[y][x] = None;
                Ok(())
            }
        }
    }
}

/// A test client wrapping a real `Peer<TicTacToe>`.
pub struct TestPeer {
    pub peer: Peer<TicTacToe>,
}

impl TestPeer {
    /// Connect to a relay and land in the lobby.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut peer = Peer::new(&addr.to_string(), TicTacToe::new());
        peer.connect().expect("TestPeer::connect failed");
        Self { peer }
    }

    pub fn player_id(&self) -> PlayerId {
        self.peer.state().player_id.expect("no player id")
    }

    pub fn is_host(&self) -> bool {
        self.peer.state().is_host
    }

    pub fn board(&self) -> &TicTacToe {
        self.peer.log().state()
    }

    pub fn history_len(&self) -> usize {
        self.peer.log().len()
    }

    /// Request a fresh room and block until the relay confirms. Returns the
    /// assigned room code.
    pub fn create_room(&mut self, color: Color) -> String {
        self.peer.create_room(color).expect("create_room failed");
        let (is_host, is_new_room, code) = self.wait_for_join();
        assert!(is_host, "room creator should be host");
        assert!(is_new_room, "created room should be new");
        code
    }

    /// Request a join and block until it is confirmed. Returns
    /// (is_host, is_new_room, room_code).
    pub fn join_room(
        &mut self,
        code: &str,
        color: Color,
        host_if_needed: bool,
    ) -> (bool, bool, String) {
        self.peer
            .join_room(code, color, host_if_needed)
            .expect("join_room failed");
        self.wait_for_join()
    }

    /// Request a join and block until the relay refuses. Returns the
    /// failure message.
    pub fn join_room_expecting_failure(&mut self, code: &str, color: Color) -> String {
        self.peer
            .join_room(code, color, false)
            .expect("join_room failed");
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for join failure"
            );
            for update in self.peer.poll() {
                match update {
                    PeerUpdate::JoinFailed { message } => return message,
                    PeerUpdate::Joined { .. } => panic!("join unexpectedly succeeded"),
                    _ => {}
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn submit(&mut self, events: Vec<TttEvent>) {
        self.peer.submit(events).expect("submit failed");
    }

    /// Blocking poll until a Joined update arrives.
    pub fn wait_for_join(&mut self) -> (bool, bool, String) {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for join confirmation"
            );
            for update in self.peer.poll() {
                match update {
                    PeerUpdate::Joined {
                        is_host,
                        is_new_room,
                        room_code,
                        ..
                    } => return (is_host, is_new_room, room_code.to_string()),
                    PeerUpdate::JoinFailed { message } => {
                        panic!("join failed: {message}");
                    }
                    _ => {}
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until a host change is announced. Returns the new host
    /// and whether it is this peer.
    pub fn wait_for_host_change(&mut self) -> (PlayerId, bool) {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for host change"
            );
            for update in self.peer.poll() {
                if let PeerUpdate::HostChanged { host_id, is_host } = update {
                    return (host_id, is_host);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until the history bootstrap completes. Returns the
    /// number of replayed events.
    pub fn wait_for_history(&mut self) -> usize {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for history"
            );
            for update in self.peer.poll() {
                if let PeerUpdate::HistoryLoaded { count } = update {
                    return count;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until the local log holds at least `len` events.
    pub fn wait_for_log_len(&mut self, len: usize) {
        let start = Instant::now();
        loop {
            if self.peer.log().len() >= len {
                return;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for log length {len}, have {}",
                self.peer.log().len()
            );
            self.peer.poll();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drain without waiting for anything in particular.
    pub fn drain(&mut self) {
        self.peer.poll();
    }

    /// Close the transport. The room code stays remembered for `reconnect`.
    pub fn disconnect(&mut self) {
        self.peer.disconnect();
    }

    /// Re-dial the relay; with a remembered room this re-issues the join
    /// with `hostIfNeeded` and blocks until it resolves.
    pub fn reconnect(&mut self) -> (bool, bool, String) {
        self.peer.connect().expect("reconnect failed");
        self.wait_for_join()
    }
}
