// End-to-end integration tests for the relay pipeline.
//
// Each test starts a real relay, connects real `Peer` instances (via
// `TestPeer`), and verifies the full path:
// create → join → history bootstrap → submit → host validation →
// broadcast → identical boards on every replica.
//
// These tests exercise the same code paths as a live game client; the only
// test-specific code is the synchronous polling wrappers in `TestPeer` and
// the pump helpers below that drive several peers at once.

use std::thread;
use std::time::{Duration, Instant};

use convergence_tests::{TestPeer, TttEvent};
use tavern_peer::PeerUpdate;
use tavern_protocol::types::Color;
use tavern_relay::server::{RelayConfig, RelayHandle, start_relay};

const PUMP_TIMEOUT: Duration = Duration::from_secs(5);
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

fn start_test_relay() -> (RelayHandle, std::net::SocketAddr) {
    let (handle, addr) = start_relay(RelayConfig { port: 0 }).unwrap();
    (handle, addr)
}

/// Drive all peers until each log holds at least `len` events.
fn pump_until_log_len(peers: &mut [&mut TestPeer], len: usize) {
    let start = Instant::now();
    while peers.iter().any(|p| p.history_len() < len) {
        assert!(
            start.elapsed() < PUMP_TIMEOUT,
            "timed out pumping logs to length {len}"
        );
        for peer in peers.iter_mut() {
            peer.drain();
        }
        thread::sleep(PUMP_INTERVAL);
    }
}

/// Drive the host so it can answer the joiner's automatic history request;
/// returns the number of replayed events once the joiner's bootstrap lands.
fn pump_history(host: &mut TestPeer, joiner: &mut TestPeer) -> usize {
    let start = Instant::now();
    loop {
        assert!(
            start.elapsed() < PUMP_TIMEOUT,
            "timed out waiting for history bootstrap"
        );
        host.drain();
        for update in joiner.peer.poll() {
            if let PeerUpdate::HistoryLoaded { count } = update {
                return count;
            }
        }
        thread::sleep(PUMP_INTERVAL);
    }
}

fn place(x: usize, y: usize, color: Color) -> TttEvent {
    TttEvent::PlacePiece { x, y, color }
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Creating a room assigns a well-formed code and seats the creator as
/// host, all visible through the diagnostics snapshot.
#[test]
fn create_room_assigns_code_and_host() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);

    let code = host.create_room(Color::Blue);
    assert_eq!(code.len(), 7, "bad code {code:?}");
    assert_eq!(code.as_bytes()[3], b'-', "bad code {code:?}");
    assert!(host.is_host());

    let snapshot = handle.room_status(&code).expect("room should exist");
    assert_eq!(snapshot.members.len(), 1);
    assert_eq!(snapshot.host_id, Some(host.player_id()));
    assert_eq!(snapshot.members[0].color, Color::Blue);
    assert!(snapshot.created_at_ms > 0);

    handle.stop();
}

/// A joiner's move travels to the host, gets validated there, and comes
/// back as a broadcast: both boards end up identical.
#[test]
fn joiner_move_converges_on_both_boards() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);
    let mut joiner = TestPeer::connect(addr);

    let code = host.create_room(Color::Blue);
    let (is_host, is_new_room, joined_code) = joiner.join_room(&code, Color::Red, false);
    assert!(!is_host);
    assert!(!is_new_room);
    assert_eq!(joined_code, code);

    // Fresh room: the automatic bootstrap replays an empty history.
    assert_eq!(pump_history(&mut host, &mut joiner), 0);

    joiner.submit(vec![place(0, 0, Color::Red)]);
    pump_until_log_len(&mut [&mut host, &mut joiner], 1);

    assert_eq!(host.board().tile(0, 0), Some(Color::Red));
    assert_eq!(host.board(), joiner.board());
    // Every accepted event is stamped by the host that validated it.
    assert_eq!(
        joiner.peer.log().history()[0].accepted_by,
        host.player_id()
    );
    assert_eq!(host.peer.log().consistency_violations(), 0);
    assert_eq!(joiner.peer.log().consistency_violations(), 0);

    handle.stop();
}

/// The host's own moves take the same reducer path and reach the joiner as
/// broadcasts.
#[test]
fn host_move_reaches_joiner() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);
    let mut joiner = TestPeer::connect(addr);

    let code = host.create_room(Color::White);
    joiner.join_room(&code, Color::Orange, false);
    pump_history(&mut host, &mut joiner);

    host.submit(vec![place(2, 2, Color::White)]);
    // The host applied locally before the broadcast even left.
    assert_eq!(host.history_len(), 1);

    pump_until_log_len(&mut [&mut host, &mut joiner], 1);
    assert_eq!(joiner.board().tile(2, 2), Some(Color::White));
    assert_eq!(host.board(), joiner.board());

    handle.stop();
}

/// A peer that joins after moves were made bootstraps the full history and
/// converges without seeing any live broadcast.
#[test]
fn late_joiner_bootstraps_from_history() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);

    let code = host.create_room(Color::Blue);
    host.submit(vec![place(0, 0, Color::Blue), place(1, 1, Color::Blue)]);
    assert_eq!(host.history_len(), 2);

    let mut joiner = TestPeer::connect(addr);
    joiner.join_room(&code, Color::Red, false);
    assert_eq!(pump_history(&mut host, &mut joiner), 2);

    assert_eq!(joiner.board(), host.board());
    assert_eq!(joiner.board().piece_count(), 2);

    handle.stop();
}

/// The host silently drops proposals its reducer rejects; later valid
/// proposals still go through.
#[test]
fn invalid_move_dropped_by_host() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);
    let mut joiner = TestPeer::connect(addr);

    let code = host.create_room(Color::Blue);
    joiner.join_room(&code, Color::Red, false);
    pump_history(&mut host, &mut joiner);

    joiner.submit(vec![place(0, 0, Color::Red)]);
    pump_until_log_len(&mut [&mut host, &mut joiner], 1);

    // Occupied tile: rejected at the host, never broadcast.
    joiner.submit(vec![place(0, 0, Color::Red)]);
    // A subsequent valid move proves the rejection did not wedge anything.
    joiner.submit(vec![place(1, 0, Color::Red)]);
    pump_until_log_len(&mut [&mut host, &mut joiner], 2);

    assert_eq!(host.history_len(), 2);
    assert_eq!(joiner.history_len(), 2);
    assert_eq!(host.board().tile(0, 0), Some(Color::Red));
    assert_eq!(host.board(), joiner.board());
    assert_eq!(joiner.peer.log().consistency_violations(), 0);

    handle.stop();
}

/// When the host disconnects, the oldest remaining member is promoted,
/// everyone hears NEW_HOST, and the room keeps working under the new host.
#[test]
fn host_departure_promotes_oldest_member() {
    let (handle, addr) = start_test_relay();
    let mut a = TestPeer::connect(addr);
    let mut b = TestPeer::connect(addr);
    let mut c = TestPeer::connect(addr);

    let code = a.create_room(Color::Blue);
    b.join_room(&code, Color::Red, false);
    pump_history(&mut a, &mut b);
    c.join_room(&code, Color::White, false);
    pump_history(&mut a, &mut c);

    let b_id = b.player_id();
    a.disconnect();

    let (new_host_b, b_is_host) = b.wait_for_host_change();
    let (new_host_c, c_is_host) = c.wait_for_host_change();
    assert_eq!(new_host_b, b_id);
    assert_eq!(new_host_c, b_id);
    assert!(b_is_host);
    assert!(!c_is_host);

    let snapshot = handle.room_status(&code).expect("room should survive");
    assert_eq!(snapshot.host_id, Some(b_id));
    assert_eq!(snapshot.members.len(), 2);

    // The room still functions: C proposes, B (the new host) validates.
    c.submit(vec![place(2, 0, Color::White)]);
    pump_until_log_len(&mut [&mut b, &mut c], 1);
    assert_eq!(b.board(), c.board());
    assert_eq!(b.peer.log().history()[0].accepted_by, b_id);

    handle.stop();
}

/// A sole host that drops and reconnects recreates its vacated room under
/// the same code and resumes hosting, local log intact.
#[test]
fn reconnect_recreates_vacated_room() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);

    let code = host.create_room(Color::Orange);
    host.submit(vec![place(1, 1, Color::Orange)]);
    assert_eq!(host.history_len(), 1);

    host.disconnect();
    // Last member gone: the room is deleted, not parked.
    let start = Instant::now();
    while handle.room_status(&code).is_some() {
        assert!(
            start.elapsed() < PUMP_TIMEOUT,
            "vacated room was never deleted"
        );
        thread::sleep(PUMP_INTERVAL);
    }

    let (is_host, is_new_room, rejoined_code) = host.reconnect();
    assert!(is_host);
    assert!(is_new_room, "recreation should report a new room");
    assert_eq!(rejoined_code, code);

    // The host's log survived the blip; the room is fresh but the state is
    // not.
    assert_eq!(host.history_len(), 1);
    assert_eq!(host.board().tile(1, 1), Some(Color::Orange));

    let snapshot = handle.room_status(&code).expect("room should be back");
    assert_eq!(snapshot.host_id, Some(host.player_id()));

    handle.stop();
}

/// Malformed codes, unknown rooms, and color conflicts are all answered
/// with ROOM_JOIN_FAILURE; the connection stays usable.
#[test]
fn join_failures_leave_connection_usable() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::connect(addr);
    let mut joiner = TestPeer::connect(addr);

    let code = host.create_room(Color::Blue);

    let msg = joiner.join_room_expecting_failure("garbage", Color::Red);
    assert!(msg.contains("invalid room code"), "got: {msg}");

    let msg = joiner.join_room_expecting_failure("ZZZ-999", Color::Red);
    assert!(msg.contains("room not found"), "got: {msg}");

    let msg = joiner.join_room_expecting_failure(&code, Color::Blue);
    assert!(msg.contains("already taken"), "got: {msg}");

    // Same connection, corrected color: accepted.
    let (is_host, is_new_room, joined_code) = joiner.join_room(&code, Color::Red, false);
    assert!(!is_host);
    assert!(!is_new_room);
    assert_eq!(joined_code, code);

    handle.stop();
}

/// A member in a live room can hop to another room via a join; the
/// directory moves it atomically and the old room keeps its host.
#[test]
fn rejoining_moves_membership() {
    let (handle, addr) = start_test_relay();
    let mut a = TestPeer::connect(addr);
    let mut b = TestPeer::connect(addr);
    let mut c = TestPeer::connect(addr);

    let code_a = a.create_room(Color::Blue);
    let code_c = c.create_room(Color::White);
    assert_ne!(code_a, code_c);
    b.join_room(&code_a, Color::Red, false);
    pump_history(&mut a, &mut b);

    // B hops from A's room into C's.
    let (is_host, is_new_room, joined_code) = b.join_room(&code_c, Color::Red, false);
    assert!(!is_host);
    assert!(!is_new_room);
    assert_eq!(joined_code, code_c);

    let snapshot_a = handle.room_status(&code_a).expect("old room lives on");
    assert_eq!(snapshot_a.members.len(), 1);
    assert_eq!(snapshot_a.host_id, Some(a.player_id()));

    let snapshot_c = handle.room_status(&code_c).expect("target room exists");
    assert_eq!(snapshot_c.members.len(), 2);
    assert_eq!(snapshot_c.host_id, Some(c.player_id()));

    handle.stop();
}

/// A former host whose room survived (another member was promoted) rejoins
/// with `hostIfNeeded` and must land as a plain member, not recreate
/// anything.
#[test]
fn former_host_rejoins_surviving_room_as_member() {
    let (handle, addr) = start_test_relay();
    let mut a = TestPeer::connect(addr);
    let mut b = TestPeer::connect(addr);

    let code = a.create_room(Color::Blue);
    b.join_room(&code, Color::Red, false);
    pump_history(&mut a, &mut b);

    a.disconnect();
    let (new_host, b_is_host) = b.wait_for_host_change();
    assert_eq!(new_host, b.player_id());
    assert!(b_is_host);

    // The room is alive, so the remembered-room rejoin must not trigger the
    // recreation branch despite hostIfNeeded.
    let (is_host, is_new_room, rejoined_code) = a.reconnect();
    assert!(!is_host, "surviving room must keep its promoted host");
    assert!(!is_new_room);
    assert_eq!(rejoined_code, code);

    let snapshot = handle.room_status(&code).expect("room should survive");
    assert_eq!(snapshot.host_id, Some(b.player_id()));
    assert_eq!(snapshot.members.len(), 2);

    // The rejoined member is a working replica under the new host.
    assert_eq!(pump_history(&mut b, &mut a), 0);
    a.submit(vec![place(0, 2, Color::Blue)]);
    pump_until_log_len(&mut [&mut a, &mut b], 1);
    assert_eq!(a.board(), b.board());
    assert_eq!(a.peer.log().history()[0].accepted_by, b.player_id());

    handle.stop();
}
