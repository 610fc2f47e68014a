use std::{collections::HashMap, sync::Weak, time::Duration};

use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use together_core::{Id, MemberId, ServerMessage};

use super::Room;

pub type ConnectionId = Id<Connection>;

/// What a session writer should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close the socket, the member's connection is gone
    Close { reason: String },
}

/// The live session of a member.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    sender: UnboundedSender<Outbound>,
    probe: Option<Probe>,
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    nonce: u64,
    sent_at: Instant,
}

/// Fan-out of session messages within a room, one connection per member.
///
/// Every message is queued on the recipient's channel while the room is
/// locked, so each recipient sees messages in the order the room produced them.
/// The actual socket writes happen in the session's own task.
#[derive(Debug, Default)]
pub struct Hub {
    connections: HashMap<MemberId, Connection>,
    next_nonce: u64,
}

impl Hub {
    /// Registers a connection for `member`, replacing and closing any older one.
    pub fn attach(&mut self, member: MemberId, sender: UnboundedSender<Outbound>) -> ConnectionId {
        let connection = Connection {
            id: ConnectionId::new(),
            sender,
            probe: None,
        };
        let id = connection.id;

        if let Some(previous) = self.connections.insert(member, connection) {
            let _ = previous.sender.send(Outbound::Close {
                reason: "Replaced by a newer session".to_string(),
            });
        }

        id
    }

    /// Removes the connection if it is still the member's current one.
    pub fn detach(&mut self, member: MemberId, connection: ConnectionId) -> bool {
        match self.connections.get(&member) {
            Some(c) if c.id == connection => {
                self.connections.remove(&member);
                true
            }
            _ => false,
        }
    }

    pub fn is_attached(&self, member: MemberId) -> bool {
        self.connections.contains_key(&member)
    }

    /// Unicasts a message. Returns false if the member has no connection.
    pub fn send(&self, member: MemberId, message: ServerMessage) -> bool {
        self.connections
            .get(&member)
            .map(|c| c.sender.send(Outbound::Message(message)).is_ok())
            .unwrap_or(false)
    }

    /// Delivers a message to every connection, except `exclude` if given.
    pub fn broadcast(&self, message: ServerMessage, exclude: Option<MemberId>) {
        for (member, connection) in &self.connections {
            if Some(*member) == exclude {
                continue;
            }

            let _ = connection.sender.send(Outbound::Message(message.clone()));
        }
    }

    /// Tells the session to close and forgets it.
    pub fn close(&mut self, member: MemberId, reason: &str) -> bool {
        match self.connections.remove(&member) {
            Some(connection) => {
                let _ = connection.sender.send(Outbound::Close {
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self, reason: &str) {
        for (_, connection) in self.connections.drain() {
            let _ = connection.sender.send(Outbound::Close {
                reason: reason.to_string(),
            });
        }
    }

    /// Runs a liveness round: connections with an unanswered probe older than
    /// `timeout` are closed and returned, the others get a fresh probe if they
    /// have none outstanding.
    pub fn probe(&mut self, now: Instant, timeout: Duration) -> Vec<MemberId> {
        let timed_out: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.probe
                    .is_some_and(|p| now.saturating_duration_since(p.sent_at) >= timeout)
            })
            .map(|(member, _)| *member)
            .collect();

        for member in &timed_out {
            self.close(*member, "Connection timed out");
        }

        for connection in self.connections.values_mut() {
            if connection.probe.is_some() {
                continue;
            }

            self.next_nonce += 1;
            let nonce = self.next_nonce;

            connection.probe = Some(Probe { nonce, sent_at: now });
            let _ = connection
                .sender
                .send(Outbound::Message(ServerMessage::Ping { nonce }));
        }

        timed_out
    }

    /// Settles an outstanding probe, returning the measured round trip.
    pub fn pong(&mut self, member: MemberId, nonce: u64, now: Instant) -> Option<Duration> {
        let connection = self.connections.get_mut(&member)?;

        match connection.probe {
            Some(probe) if probe.nonce == nonce => {
                connection.probe = None;
                Some(now.saturating_duration_since(probe.sent_at))
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Keeps a member attached to a room, detaching it when dropped.
pub struct ConnectionHandle {
    room: Weak<Room>,
    member: MemberId,
    connection: ConnectionId,
}

impl ConnectionHandle {
    pub(crate) fn new(room: Weak<Room>, member: MemberId, connection: ConnectionId) -> Self {
        Self {
            room,
            member,
            connection,
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(room) = self.room.upgrade() {
            room.detach(self.member, self.connection)
        }
    }
}
