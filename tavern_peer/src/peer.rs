// Glue between the connection state machine and the event log.
//
// A `Peer` owns one `Connection` and one `EventLog` and enforces the
// host-authoritative flow:
// - Submitting events as host runs them through the local reducer and
//   broadcasts the accepted batch; as non-host it emits the raw proposals to
//   the host. The host's own proposals take the same reducer path as
//   everyone else's.
// - Incoming `EMIT_TO_HOST` is only meaningful on the host, incoming
//   `BROADCAST_ROOM` only on non-hosts; envelopes that arrive on the wrong
//   side (stale frames around a host change) are logged and dropped.
// - On joining an existing room as non-host, the peer automatically
//   requests the host's history to bootstrap its empty log.
//
// Events cross the wire as opaque JSON values; this layer converts between
// the reducer's typed events and `serde_json::Value`, skipping (and
// logging) values that do not decode.

use log::{error, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use tavern_protocol::message::{ClientEvent, ServerEvent};
use tavern_protocol::types::{Color, PlayerId, RoomCode};

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::log::{Accepted, EventLog, Reducer};

/// Notifications produced by `Peer::poll`.
#[derive(Debug)]
pub enum PeerUpdate {
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
    /// Events were appended to the local log (host acceptance or replica
    /// application).
    Applied {
        count: usize,
    },
    /// The log was bootstrapped from the host's history.
    HistoryLoaded {
        count: usize,
    },
    Disconnected {
        reason: String,
    },
}

/// One participant: a relay connection plus the replicated event log.
pub struct Peer<R: Reducer> {
    connection: Connection,
    log: EventLog<R>,
}

impl<R: Reducer> Peer<R> {
    pub fn new(addr: &str, reducer: R) -> Self {
        Self {
            connection: Connection::new(addr),
            log: EventLog::new(reducer),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        self.connection.state()
    }

    pub fn log(&self) -> &EventLog<R> {
        &self.log
    }

    pub fn connect(&mut self) -> Result<(), String> {
        self.connection.connect()
    }

    pub fn create_room(&mut self, color: Color) -> Result<(), String> {
        self.connection.request_create_room(color)
    }

    pub fn join_room(
        &mut self,
        room_code: &str,
        color: Color,
        host_if_needed: bool,
    ) -> Result<(), String> {
        self.connection.request_join_room(room_code, color, host_if_needed)
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Propose events. As host they are validated and broadcast right here;
    /// as non-host they travel to the host and come back as a broadcast if
    /// accepted.
    pub fn submit(&mut self, events: Vec<R::Event>) -> Result<(), String> {
        let state = self.connection.state();
        if state.room_code.is_none() || state.player_id.is_none() {
            return Err("not in a room".to_owned());
        }
        if state.is_host {
            let host = state.player_id.ok_or("no player id")?;
            let batch = self.log.ingest_requests(events, host);
            if !batch.is_empty() {
                self.connection.send(&ClientEvent::BroadcastRoom {
                    messages: encode(&batch),
                })?;
            }
        } else {
            self.connection.send(&ClientEvent::EmitToHost {
                messages: encode(&events),
            })?;
        }
        Ok(())
    }

    /// Drain pending network activity, route relayed envelopes through the
    /// event log, and return what changed.
    pub fn poll(&mut self) -> Vec<PeerUpdate> {
        let mut out = Vec::new();
        for event in self.connection.poll() {
            match event {
                ConnectionEvent::Joined {
                    is_host,
                    is_new_room,
                    room_code,
                    color,
                } => {
                    if !is_host {
                        self.request_history();
                    }
                    out.push(PeerUpdate::Joined {
                        is_host,
                        is_new_room,
                        room_code,
                        color,
                    });
                }
                ConnectionEvent::JoinFailed { message } => {
                    out.push(PeerUpdate::JoinFailed { message });
                }
                ConnectionEvent::HostChanged { host_id, is_host } => {
                    out.push(PeerUpdate::HostChanged { host_id, is_host });
                }
                ConnectionEvent::Lost { reason } => {
                    out.push(PeerUpdate::Disconnected { reason });
                }
                ConnectionEvent::Relayed(relayed) => {
                    if let Some(update) = self.handle_relayed(relayed) {
                        out.push(update);
                    }
                }
            }
        }
        out
    }

    fn handle_relayed(&mut self, event: ServerEvent) -> Option<PeerUpdate> {
        match event {
            ServerEvent::EmitToHost { messages } => {
                if !self.connection.state().is_host {
                    warn!("dropping EMIT_TO_HOST received while not host");
                    return None;
                }
                let host = self.connection.state().player_id?;
                let events: Vec<R::Event> = decode(messages);
                let batch = self.log.ingest_requests(events, host);
                if batch.is_empty() {
                    return None;
                }
                let count = batch.len();
                let send = self.connection.send(&ClientEvent::BroadcastRoom {
                    messages: encode(&batch),
                });
                if let Err(e) = send {
                    error!("failed to broadcast accepted events: {e}");
                }
                Some(PeerUpdate::Applied { count })
            }
            ServerEvent::BroadcastRoom { messages } => {
                if self.connection.state().is_host {
                    warn!("dropping BROADCAST_ROOM received while host");
                    return None;
                }
                let batch: Vec<Accepted<R::Event>> = decode(messages);
                let count = self.log.apply_accepted(batch);
                Some(PeerUpdate::Applied { count })
            }
            ServerEvent::BroadcastHistoryRequest { requester } => {
                if !self.connection.state().is_host {
                    warn!("dropping history request received while not host");
                    return None;
                }
                let send = self.connection.send(&ClientEvent::BroadcastHistoryResponse {
                    requester,
                    history: encode(self.log.history()),
                });
                if let Err(e) = send {
                    error!("failed to answer history request from {requester}: {e}");
                }
                None
            }
            ServerEvent::BroadcastHistoryResponse { requester, history } => {
                if Some(requester) != self.connection.state().player_id {
                    warn!("dropping history response addressed to {requester}");
                    return None;
                }
                let batch: Vec<Accepted<R::Event>> = decode(history);
                match self.log.apply_history(batch) {
                    Some(count) => Some(PeerUpdate::HistoryLoaded { count }),
                    // A broadcast outran the response and seeded the log
                    // first. The guard already logged the refusal.
                    None => None,
                }
            }
            other => {
                warn!("unexpected envelope routed to log layer: {other:?}");
                None
            }
        }
    }

    fn request_history(&mut self) {
        let Some(requester) = self.connection.state().player_id else {
            error!("cannot request history without a player id");
            return;
        };
        if let Err(e) = self
            .connection
            .send(&ClientEvent::BroadcastHistoryRequest { requester })
        {
            error!("failed to request history: {e}");
        }
    }
}

/// Serialize typed items into opaque wire values. Serialization of plain
/// data types does not fail in practice; anything that does is logged and
/// skipped.
fn encode<T: Serialize>(items: &[T]) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| match serde_json::to_value(item) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("failed to serialize event: {e}");
                None
            }
        })
        .collect()
}

/// Decode opaque wire values into typed items, skipping (and logging) any
/// that do not fit the reducer's event type.
fn decode<T: DeserializeOwned>(values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("skipping undecodable event: {e}");
                None
            }
        })
        .collect()
}
