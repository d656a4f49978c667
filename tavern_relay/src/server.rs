// TCP server and main event loop for the relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per peer): call `framing::read_frame()` in a
//   loop, deserialize `ClientEvent`, and send `InternalEvent::MessageFrom`.
//   On error/EOF they send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `RoomDirectory` and all peer write halves,
//   receives events from the channel, and dispatches them strictly serially.
//   Every directory mutation happens on this thread, which is what upholds
//   the single-host invariant.
//
// The main thread is the only writer to peer TCP streams. Reader threads
// only read. This avoids concurrent read/write on the same `TcpStream`.
//
// Error policy (two tiers):
// - Directory failures on create/join become `ROOM_JOIN_FAILURE` responses;
//   the connection stays up.
// - Routing violations (emitting from outside a room, broadcasting as a
//   non-host, addressing a peer outside the sender's room) and malformed
//   frames are fatal: the peer receives `UNHANDLED_ERROR` and is then
//   force-disconnected, which bounds the blast radius of a misbehaving peer.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use thiserror::Error;

use tavern_protocol::framing::{read_frame, write_frame};
use tavern_protocol::message::{ClientEvent, ServerEvent};
use tavern_protocol::types::{Color, PlayerId, RoomCode};

use crate::directory::{DirectoryError, Member, RoomDirectory, RoomSnapshot};

/// Attempts at drawing a fresh room code before giving up. Collisions are
/// already rare at one room; eight misses in a row means something is wrong.
const CODE_GENERATION_ATTEMPTS: u32 = 8;

/// Fatal addressing violations. Unlike `DirectoryError` these are not
/// answered with a failure message — the sender is cut off.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("{0} is not in any room")]
    SenderNotInRoom(PlayerId),
    #[error("{0} is not the host of room {1}")]
    SenderNotHost(PlayerId, RoomCode),
    #[error("room {0} has no live host")]
    HostUnavailable(RoomCode),
    #[error("{0} is not a member of room {1}")]
    TargetNotInRoom(PlayerId, RoomCode),
}

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        player_id: PlayerId,
        event: ClientEvent,
    },
    Malformed {
        player_id: PlayerId,
        detail: String,
    },
    Disconnected {
        player_id: PlayerId,
    },
    /// Out-of-band diagnostics: answer a room snapshot on `reply`.
    RoomStatus {
        code: String,
        reply: Sender<Option<RoomSnapshot>>,
    },
}

/// Configuration for starting a relay server.
pub struct RelayConfig {
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    tx: Sender<InternalEvent>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }

    /// Diagnostics-only room lookup by code. Answered by the main loop, so
    /// the snapshot is consistent with all routing it has performed. Returns
    /// `None` for malformed codes, unknown rooms, or a stopped relay.
    pub fn room_status(&self, code: &str) -> Option<RoomSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(InternalEvent::RoomStatus {
                code: code.to_owned(),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.recv_timeout(Duration::from_secs(5)).ok().flatten()
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping/querying it and the actual bound address (useful when port 0
/// lets the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));

    let (tx, rx) = mpsc::channel();

    // Non-blocking accept so the listener thread can observe shutdown.
    listener.set_nonblocking(true).ok();
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    let keep_running_main = keep_running.clone();
    let tx_main = tx.clone();
    let thread = thread::spawn(move || {
        run_relay(rx, tx_main, keep_running_main);
    });

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
            tx,
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is cleared.
fn run_relay(
    rx: Receiver<InternalEvent>,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    let mut relay = Relay::new();

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                relay.handle_event(event, &tx, &keep_running);
                // Drain whatever arrived while handling.
                while let Ok(event) = rx.try_recv() {
                    relay.handle_event(event, &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// A connected peer's write side. The raw handle exists so a forced
/// disconnect can shut the socket down and unblock the reader thread.
struct Connection {
    writer: BufWriter<TcpStream>,
    raw: TcpStream,
}

/// All state owned by the main loop: the room directory plus the roster of
/// live connections.
struct Relay {
    directory: RoomDirectory,
    peers: BTreeMap<PlayerId, Connection>,
    next_player_id: u64,
}

impl Relay {
    fn new() -> Self {
        Self {
            directory: RoomDirectory::new(),
            peers: BTreeMap::new(),
            next_player_id: 0,
        }
    }

    fn handle_event(
        &mut self,
        event: InternalEvent,
        tx: &Sender<InternalEvent>,
        keep_running: &Arc<AtomicBool>,
    ) {
        match event {
            InternalEvent::NewConnection { stream } => {
                self.handle_new_connection(stream, tx, keep_running);
            }
            InternalEvent::MessageFrom { player_id, event } => {
                self.handle_message(player_id, event);
            }
            InternalEvent::Malformed { player_id, detail } => {
                warn!("{player_id} | malformed frame: {detail}");
                self.fatal(player_id, "unparseable message", json!({ "detail": detail }));
            }
            InternalEvent::Disconnected { player_id } => {
                self.handle_disconnect(player_id);
            }
            InternalEvent::RoomStatus { code, reply } => {
                let snapshot = RoomCode::parse(&code)
                    .and_then(|code| self.directory.get_room(&code));
                let _ = reply.send(snapshot);
            }
        }
    }

    /// Register a fresh connection: assign an identity, greet it, and spawn
    /// its reader thread.
    fn handle_new_connection(
        &mut self,
        stream: TcpStream,
        tx: &Sender<InternalEvent>,
        keep_running: &Arc<AtomicBool>,
    ) {
        let Ok(raw) = stream.try_clone() else { return };
        let Ok(read_half) = stream.try_clone() else { return };

        let player_id = PlayerId(self.next_player_id);
        self.next_player_id += 1;

        self.peers.insert(
            player_id,
            Connection {
                writer: BufWriter::new(stream),
                raw,
            },
        );
        info!("{player_id} | connected");
        self.send_to(player_id, &ServerEvent::Connected { player_id });

        let tx_reader = tx.clone();
        let keep_running_reader = keep_running.clone();
        thread::spawn(move || {
            reader_loop(BufReader::new(read_half), player_id, tx_reader, keep_running_reader);
        });
    }

    /// Dispatch one client message. The match is exhaustive over the closed
    /// protocol vocabulary; there is no "unknown event" arm because parsing
    /// already rejected anything outside it.
    fn handle_message(&mut self, sender: PlayerId, event: ClientEvent) {
        match event {
            ClientEvent::RequestHost { color } => {
                info!("{sender} | REQUEST_HOST ({color})");
                self.handle_request_host(sender, color);
            }
            ClientEvent::RequestJoin {
                room_code,
                color,
                host_if_needed,
            } => {
                info!("{sender} | REQUEST_JOIN {room_code} ({color}, hostIfNeeded={host_if_needed})");
                self.handle_request_join(sender, room_code, color, host_if_needed);
            }
            ClientEvent::EmitToHost { messages } => {
                if let Err(e) = self.route_emit(sender, messages) {
                    self.fatal(sender, &e.to_string(), json!({ "event": "EMIT_TO_HOST" }));
                }
            }
            ClientEvent::BroadcastRoom { messages } => {
                if let Err(e) = self.route_broadcast(sender, messages) {
                    self.fatal(sender, &e.to_string(), json!({ "event": "BROADCAST_ROOM" }));
                }
            }
            ClientEvent::BroadcastHistoryRequest { requester } => {
                if let Err(e) = self.route_history_request(sender, requester) {
                    self.fatal(
                        sender,
                        &e.to_string(),
                        json!({ "event": "BROADCAST_HISTORY_REQUEST" }),
                    );
                }
            }
            ClientEvent::BroadcastHistoryResponse { requester, history } => {
                if let Err(e) = self.route_history_response(sender, requester, history) {
                    self.fatal(
                        sender,
                        &e.to_string(),
                        json!({ "event": "BROADCAST_HISTORY_RESPONSE" }),
                    );
                }
            }
        }
    }

    /// REQUEST_HOST: create a room under a fresh random code with the
    /// requester as sole member and host.
    fn handle_request_host(&mut self, sender: PlayerId, color: Color) {
        self.leave_current_room(sender);

        let mut created = None;
        for _ in 0..CODE_GENERATION_ATTEMPTS {
            match self.directory.create_room(sender, None) {
                Ok(code) => {
                    created = Some(code);
                    break;
                }
                // Collision with a live room; draw again.
                Err(DirectoryError::DuplicateRoomId(code)) => {
                    debug!("{sender} | generated code collided: {code}");
                }
                Err(e) => {
                    self.join_failure(sender, String::new(), &e, color);
                    return;
                }
            }
        }
        let Some(code) = created else {
            self.send_to(
                sender,
                &ServerEvent::RoomJoinFailure {
                    room_code: String::new(),
                    failure_message: "could not allocate a room code".into(),
                    color,
                },
            );
            return;
        };

        self.seat_creator(sender, code, color);
    }

    /// REQUEST_JOIN: join a live room, or — with `hostIfNeeded` — recreate a
    /// missing one under the exact supplied code. When two former members
    /// race to recreate the same vacated code, this loop's serial processing
    /// makes the first writer host; the second finds the room alive and
    /// joins as a plain member.
    fn handle_request_join(
        &mut self,
        sender: PlayerId,
        raw_code: String,
        color: Color,
        host_if_needed: bool,
    ) {
        // Shape check precedes any directory mutation: a malformed code must
        // not evict the sender from its current room.
        let Some(code) = RoomCode::parse(&raw_code) else {
            self.join_failure(
                sender,
                raw_code.clone(),
                &DirectoryError::InvalidRoomId(raw_code),
                color,
            );
            return;
        };

        self.leave_current_room(sender);

        if self.directory.room_exists(&code) {
            match self.directory.add_member(
                Member {
                    player_id: sender,
                    color,
                },
                &code,
            ) {
                Ok(()) => {
                    info!("{sender} | joined room {code}");
                    self.send_to(
                        sender,
                        &ServerEvent::RoomJoinSuccess {
                            is_host: false,
                            is_new_room: false,
                            room_code: code.to_string(),
                            color,
                        },
                    );
                }
                Err(e) => self.join_failure(sender, code.to_string(), &e, color),
            }
        } else if host_if_needed {
            match self.directory.create_room(sender, Some(code.as_str())) {
                Ok(code) => self.seat_creator(sender, code, color),
                Err(e) => self.join_failure(sender, code.to_string(), &e, color),
            }
        } else {
            self.join_failure(sender, code.to_string(), &DirectoryError::RoomNotFound, color);
        }
    }

    /// Seat the creator of a brand-new room and confirm. The first member
    /// of a fresh room cannot hit a color conflict; any other failure here
    /// means the room must not outlive its creator's request.
    fn seat_creator(&mut self, sender: PlayerId, code: RoomCode, color: Color) {
        if let Err(e) = self.directory.add_member(
            Member {
                player_id: sender,
                color,
            },
            &code,
        ) {
            let _ = self.directory.remove_member(sender, &code);
            self.join_failure(sender, code.to_string(), &e, color);
            return;
        }
        info!("{sender} | hosting new room {code}");
        self.send_to(
            sender,
            &ServerEvent::RoomJoinSuccess {
                is_host: true,
                is_new_room: true,
                room_code: code.to_string(),
                color,
            },
        );
    }

    fn join_failure(
        &mut self,
        sender: PlayerId,
        room_code: String,
        error: &DirectoryError,
        color: Color,
    ) {
        info!("{sender} | join failed for {room_code:?}: {error}");
        self.send_to(
            sender,
            &ServerEvent::RoomJoinFailure {
                room_code,
                failure_message: error.to_string(),
                color,
            },
        );
    }

    /// EMIT_TO_HOST: forward verbatim to the sender's current host.
    fn route_emit(
        &mut self,
        sender: PlayerId,
        messages: Vec<serde_json::Value>,
    ) -> Result<(), RoutingError> {
        let room = self
            .directory
            .lookup_room_of(sender)
            .map_err(|_| RoutingError::SenderNotInRoom(sender))?;
        let host = self
            .directory
            .host_of(&room)
            .ok_or_else(|| RoutingError::HostUnavailable(room.clone()))?;
        self.send_to(host, &ServerEvent::EmitToHost { messages });
        Ok(())
    }

    /// BROADCAST_ROOM: host-only fan-out to every other member.
    fn route_broadcast(
        &mut self,
        sender: PlayerId,
        messages: Vec<serde_json::Value>,
    ) -> Result<(), RoutingError> {
        let room = self
            .directory
            .lookup_room_of(sender)
            .map_err(|_| RoutingError::SenderNotInRoom(sender))?;
        let host = self
            .directory
            .host_of(&room)
            .ok_or_else(|| RoutingError::HostUnavailable(room.clone()))?;
        if host != sender {
            return Err(RoutingError::SenderNotHost(sender, room));
        }
        let event = ServerEvent::BroadcastRoom { messages };
        for member in self.directory.member_ids(&room) {
            if member != sender {
                self.send_to(member, &event);
            }
        }
        Ok(())
    }

    /// BROADCAST_HISTORY_REQUEST: forward to the host of the sender's room.
    fn route_history_request(
        &mut self,
        sender: PlayerId,
        requester: PlayerId,
    ) -> Result<(), RoutingError> {
        let room = self
            .directory
            .lookup_room_of(sender)
            .map_err(|_| RoutingError::SenderNotInRoom(sender))?;
        let host = self
            .directory
            .host_of(&room)
            .ok_or_else(|| RoutingError::HostUnavailable(room.clone()))?;
        self.send_to(host, &ServerEvent::BroadcastHistoryRequest { requester });
        Ok(())
    }

    /// BROADCAST_HISTORY_RESPONSE: point-to-point delivery to the requester,
    /// who must share a room with the sender.
    fn route_history_response(
        &mut self,
        sender: PlayerId,
        requester: PlayerId,
        history: Vec<serde_json::Value>,
    ) -> Result<(), RoutingError> {
        let room = self
            .directory
            .lookup_room_of(sender)
            .map_err(|_| RoutingError::SenderNotInRoom(sender))?;
        if !self.directory.member_ids(&room).contains(&requester) {
            return Err(RoutingError::TargetNotInRoom(requester, room));
        }
        self.send_to(
            requester,
            &ServerEvent::BroadcastHistoryResponse { requester, history },
        );
        Ok(())
    }

    /// Remove a peer from whatever room it is in, announcing a host change
    /// to the survivors when one happened. No-op for roomless peers.
    fn leave_current_room(&mut self, player: PlayerId) {
        let Ok(room) = self.directory.lookup_room_of(player) else {
            return;
        };
        let previous_host = self.directory.host_of(&room);
        match self.directory.remove_member(player, &room) {
            Ok(Some(new_host)) if Some(new_host) != previous_host => {
                info!("room {room} | new host: {new_host}");
                let event = ServerEvent::NewHost { host_id: new_host };
                for member in self.directory.member_ids(&room) {
                    self.send_to(member, &event);
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => info!("room {room} | emptied and deleted"),
            Err(e) => warn!("room {room} | removal of {player} failed: {e}"),
        }
    }

    fn handle_disconnect(&mut self, player: PlayerId) {
        if self.peers.remove(&player).is_some() {
            info!("{player} | disconnected");
        }
        self.leave_current_room(player);
    }

    /// Deliver `UNHANDLED_ERROR` and cut the connection. Also runs the
    /// normal departure cleanup so the room sees a host change right away
    /// instead of when the reader thread notices the dead socket.
    fn fatal(&mut self, player: PlayerId, message: &str, extra: serde_json::Value) {
        warn!("{player} | fatal: {message}");
        self.send_to(
            player,
            &ServerEvent::UnhandledError {
                message: message.to_owned(),
                extra,
            },
        );
        if let Some(conn) = self.peers.remove(&player) {
            let _ = conn.raw.shutdown(Shutdown::Both);
        }
        self.leave_current_room(player);
    }

    /// Send a message to one peer. Write errors are logged and otherwise
    /// ignored — the peer's reader thread will report the broken pipe.
    fn send_to(&mut self, player: PlayerId, event: &ServerEvent) {
        let Some(conn) = self.peers.get_mut(&player) else {
            debug!("{player} | dropping {event:?}: no live connection");
            return;
        };
        match serde_json::to_vec(event) {
            Ok(json) => {
                if let Err(e) = write_frame(&mut conn.writer, &json) {
                    debug!("{player} | write failed: {e}");
                }
            }
            Err(e) => warn!("{player} | serialize failed: {e}"),
        }
    }
}

/// Reader loop for a single peer. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    player_id: PlayerId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_frame(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientEvent>(&bytes) {
                Ok(event) => {
                    let _ = tx.send(InternalEvent::MessageFrom { player_id, event });
                }
                Err(e) => {
                    let _ = tx.send(InternalEvent::Malformed {
                        player_id,
                        detail: e.to_string(),
                    });
                    break;
                }
            },
            Err(_) => {
                // Read error or EOF.
                let _ = tx.send(InternalEvent::Disconnected { player_id });
                break;
            }
        }
    }
}
