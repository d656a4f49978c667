// Connection lifecycle state machine over a TCP transport.
//
// Tracks a peer's status (`Initial`/`Lobby`/`Joining`/`Room`/`Disconnected`)
// and drives room create/join requests into the relay. The transport follows
// the non-blocking client pattern: `connect()` performs the TCP dial and the
// `CONNECTED` greeting on the calling thread, then spawns a reader thread
// that pushes decoded `ServerEvent`s into an mpsc inbox; `poll()` drains the
// inbox without blocking, so the owning thread never waits on the network.
//
// State exposure is snapshot-plus-notification: `state()` returns the
// current `ConnectionState`, and `poll()` yields `ConnectionEvent`s for every
// transition, so a presentation layer can react without reaching into the
// machine.
//
// Fault tolerance lives entirely in the reconnection path: while in `Room`
// the machine remembers its room code and color, and a reconnect after
// transport loss re-issues the join with `hostIfNeeded=true` — re-entering
// the room if it survived, or recreating it under the same code as sole host
// if it died with us. On any transport loss the local host flag is forcibly
// cleared; the directory has already chosen a real host among the remaining
// members, and we are not it until a `NEW_HOST` says so.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use tavern_protocol::framing::{read_frame, write_frame};
use tavern_protocol::message::{ClientEvent, ServerEvent};
use tavern_protocol::types::{Color, PlayerId, RoomCode};

const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Where this peer stands with the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Constructed, never dialed.
    Initial,
    /// Connected, not in a room.
    Lobby,
    /// A create/join request is in flight. There is no timeout: if the
    /// relay never answers we stay here.
    Joining,
    /// Member of a room.
    Room,
    /// Transport lost or deliberately closed.
    Disconnected,
}

/// Snapshot of the machine, safe to hand to a presentation layer.
#[derive(Clone, Debug)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Relay-assigned identity for the current connection. Changes on every
    /// reconnect.
    pub player_id: Option<PlayerId>,
    pub is_host: bool,
    /// Remembered across disconnects; the key to rejoining.
    pub room_code: Option<RoomCode>,
    pub color: Option<Color>,
    pub failure_message: Option<String>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Initial,
            player_id: None,
            is_host: false,
            room_code: None,
            color: None,
            failure_message: None,
        }
    }
}

/// Transition notifications produced by `poll()`.
#[derive(Debug)]
pub enum ConnectionEvent {
    Joined {
        is_host: bool,
        is_new_room: bool,
        room_code: RoomCode,
        color: Color,
    },
    JoinFailed {
        message: String,
    },
    HostChanged {
        host_id: PlayerId,
        is_host: bool,
    },
    /// A relay-routed envelope (emit, broadcast, or history) for the event
    /// log layer to interpret.
    Relayed(ServerEvent),
    Lost {
        reason: String,
    },
}

enum Inbound {
    Event(ServerEvent),
    Closed(String),
}

/// TCP connection to the relay plus the lifecycle state machine.
pub struct Connection {
    addr: String,
    writer: Option<BufWriter<TcpStream>>,
    raw: Option<TcpStream>,
    inbox: Option<Receiver<Inbound>>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            writer: None,
            raw: None,
            inbox: None,
            state: ConnectionState::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Dial the relay. From `Initial` with no remembered room this lands in
    /// `Lobby`; with a remembered room (the reconnect case) it immediately
    /// re-issues the join with `hostIfNeeded=true` and lands in `Joining`.
    pub fn connect(&mut self) -> Result<(), String> {
        self.ensure_transport()?;

        match (self.state.room_code.clone(), self.state.color) {
            (Some(code), Some(color)) => {
                info!("reconnecting to remembered room {code}");
                self.send(&ClientEvent::RequestJoin {
                    room_code: code.to_string(),
                    color,
                    host_if_needed: true,
                })?;
                self.state.status = ConnectionStatus::Joining;
            }
            _ => {
                self.state.status = ConnectionStatus::Lobby;
            }
        }
        Ok(())
    }

    /// Ask the relay for a fresh room with us as host. Lobby only; a member
    /// that wants its own room leaves (or hops via a join) first.
    pub fn request_create_room(&mut self, color: Color) -> Result<(), String> {
        if self.state.status != ConnectionStatus::Lobby {
            return Err(format!(
                "cannot create a room while {:?}",
                self.state.status
            ));
        }
        self.send(&ClientEvent::RequestHost { color })?;
        self.state.status = ConnectionStatus::Joining;
        Ok(())
    }

    /// Join a room by code. Allowed from `Lobby`, from inside a room (hop),
    /// or from `Disconnected` (the transport is re-dialed first).
    pub fn request_join_room(
        &mut self,
        room_code: &str,
        color: Color,
        host_if_needed: bool,
    ) -> Result<(), String> {
        if self.state.status == ConnectionStatus::Disconnected {
            self.ensure_transport()?;
            self.state.status = ConnectionStatus::Lobby;
        }
        if !matches!(
            self.state.status,
            ConnectionStatus::Lobby | ConnectionStatus::Room
        ) {
            return Err(format!("cannot join a room while {:?}", self.state.status));
        }
        self.send(&ClientEvent::RequestJoin {
            room_code: room_code.to_owned(),
            color,
            host_if_needed,
        })?;
        self.state.status = ConnectionStatus::Joining;
        Ok(())
    }

    /// Close the transport deliberately. The room code stays remembered, so
    /// a later `connect()` attempts the rejoin.
    pub fn disconnect(&mut self) {
        if let Some(raw) = self.raw.take() {
            let _ = raw.shutdown(Shutdown::Both);
        }
        self.writer = None;
        self.inbox = None;
        self.state.status = ConnectionStatus::Disconnected;
        self.state.is_host = false;
    }

    /// Send one protocol message.
    pub fn send(&mut self, event: &ClientEvent) -> Result<(), String> {
        let writer = self.writer.as_mut().ok_or("not connected")?;
        let json = serde_json::to_vec(event).map_err(|e| e.to_string())?;
        write_frame(writer, &json).map_err(|e| e.to_string())
    }

    /// Drain the inbox, mutate state for management events, and return the
    /// resulting notifications. Relay-routed envelopes pass through as
    /// `ConnectionEvent::Relayed` for the event-log layer.
    pub fn poll(&mut self) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        loop {
            let inbound = match &self.inbox {
                Some(inbox) => match inbox.try_recv() {
                    Ok(inbound) => inbound,
                    Err(_) => break,
                },
                None => break,
            };
            match inbound {
                Inbound::Event(event) => {
                    if let Some(note) = self.handle_server_event(event) {
                        out.push(note);
                    }
                }
                Inbound::Closed(reason) => {
                    // Assume not host whenever the transport drops: the
                    // directory has already reassigned hosting among the
                    // survivors.
                    self.writer = None;
                    self.raw = None;
                    self.inbox = None;
                    self.state.status = ConnectionStatus::Disconnected;
                    self.state.is_host = false;
                    out.push(ConnectionEvent::Lost { reason });
                    break;
                }
            }
        }
        out
    }

    fn handle_server_event(&mut self, event: ServerEvent) -> Option<ConnectionEvent> {
        match event {
            ServerEvent::Connected { player_id } => {
                // The greeting is consumed during connect(); a repeat is a
                // relay bug but harmless.
                warn!("unexpected CONNECTED mid-stream for {player_id}");
                None
            }
            ServerEvent::RoomJoinSuccess {
                is_host,
                is_new_room,
                room_code,
                color,
            } => {
                let Some(code) = RoomCode::parse(&room_code) else {
                    error!("relay confirmed join with malformed code {room_code:?}");
                    return None;
                };
                info!("joined room {code} (host: {is_host}, new: {is_new_room})");
                self.state.status = ConnectionStatus::Room;
                self.state.is_host = is_host;
                self.state.room_code = Some(code.clone());
                self.state.color = Some(color);
                self.state.failure_message = None;
                Some(ConnectionEvent::Joined {
                    is_host,
                    is_new_room,
                    room_code: code,
                    color,
                })
            }
            ServerEvent::RoomJoinFailure {
                room_code,
                failure_message,
                ..
            } => {
                // Surfaced to the caller; no automatic retry.
                warn!("join of {room_code:?} failed: {failure_message}");
                self.state.status = ConnectionStatus::Lobby;
                self.state.failure_message = Some(failure_message.clone());
                Some(ConnectionEvent::JoinFailed {
                    message: failure_message,
                })
            }
            ServerEvent::NewHost { host_id } => {
                let is_host = self.state.player_id == Some(host_id);
                if is_host {
                    info!("becoming host");
                }
                self.state.is_host = is_host;
                Some(ConnectionEvent::HostChanged { host_id, is_host })
            }
            ServerEvent::UnhandledError { message, extra } => {
                // The relay closes our connection right after this; the
                // Closed notification follows.
                error!("relay error: {message} ({extra})");
                None
            }
            relayed @ (ServerEvent::EmitToHost { .. }
            | ServerEvent::BroadcastRoom { .. }
            | ServerEvent::BroadcastHistoryRequest { .. }
            | ServerEvent::BroadcastHistoryResponse { .. }) => {
                Some(ConnectionEvent::Relayed(relayed))
            }
        }
    }

    /// Dial the relay, consume the `CONNECTED` greeting, and start the
    /// reader thread. Does not decide the post-connect status.
    fn ensure_transport(&mut self) -> Result<(), String> {
        if !matches!(
            self.state.status,
            ConnectionStatus::Initial | ConnectionStatus::Disconnected
        ) {
            return Err(format!("already connected ({:?})", self.state.status));
        }

        let stream =
            TcpStream::connect(&self.addr).map_err(|e| format!("connect failed: {e}"))?;
        stream.set_read_timeout(Some(GREETING_TIMEOUT)).ok();

        let read_half = stream
            .try_clone()
            .map_err(|e| format!("clone failed: {e}"))?;
        let raw = stream
            .try_clone()
            .map_err(|e| format!("clone failed: {e}"))?;
        let mut reader = BufReader::new(read_half);

        let greeting = read_frame(&mut reader).map_err(|e| format!("greeting failed: {e}"))?;
        let greeting: ServerEvent =
            serde_json::from_slice(&greeting).map_err(|e| format!("greeting parse: {e}"))?;
        let ServerEvent::Connected { player_id } = greeting else {
            return Err(format!("expected CONNECTED greeting, got {greeting:?}"));
        };

        reader.get_ref().set_read_timeout(None).ok();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || reader_loop(reader, tx));

        self.writer = Some(BufWriter::new(stream));
        self.raw = Some(raw);
        self.inbox = Some(rx);
        self.state.player_id = Some(player_id);
        self.state.is_host = false;
        Ok(())
    }
}

/// Reader thread: decode framed server events into the inbox until the
/// stream dies.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Inbound>) {
    loop {
        match read_frame(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ServerEvent>(&bytes) {
                Ok(event) => {
                    if tx.send(Inbound::Event(event)).is_err() {
                        break; // Owner dropped the connection.
                    }
                }
                Err(e) => {
                    let _ = tx.send(Inbound::Closed(format!("malformed server frame: {e}")));
                    break;
                }
            },
            Err(e) => {
                let _ = tx.send(Inbound::Closed(format!("transport closed: {e}")));
                break;
            }
        }
    }
}
