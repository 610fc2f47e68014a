use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use together_core::{
    server_time, ActivityEntry, ClientMessage, Config, GuestPolicy, HostSuccession, MemberId,
    MemberInfo, Phase, PlaybackState, RoomCode, RoomSnapshot, ServerMessage,
};

use crate::{AssetStatus, ClipAsset, RoomError};

use super::{ConnectionHandle, Hub, Liveness, Member, Outbound, ReadyRound};

/// A watch-together room: its members, their connections, the clips they
/// shared, and the authoritative playback state.
pub struct Room {
    me: Weak<Room>,
    code: RoomCode,
    password_hash: String,
    created_at: DateTime<Utc>,
    pub(crate) config: Arc<Config>,
    pub(crate) state: Mutex<RoomState>,
    /// Ordered queue of session messages, consumed by the room's worker
    inbound: UnboundedSender<Inbound>,
}

pub(crate) struct RoomState {
    /// In join order, which is also seniority
    pub members: Vec<Member>,
    pub host: Option<MemberId>,
    pub hub: Hub,
    pub phase: Phase,
    pub playback: PlaybackState,
    pub round: Option<ReadyRound>,
    /// Sequence number of the most recently opened round
    pub round_seq: u64,
    pub clips: Vec<ClipAsset>,
    pub shared_pool: bool,
    pub activity: VecDeque<ActivityEntry>,
    pub last_activity: Instant,
    /// Set while the room waits for its host to come back
    pub frozen: bool,
    pub closed: bool,
}

struct Inbound {
    member: MemberId,
    message: ClientMessage,
}

impl Room {
    const ACTIVITY_LIMIT: usize = 50;

    /// Creates an empty room and starts its worker. The first member added
    /// becomes the host.
    pub fn new(code: RoomCode, password_hash: String, config: Arc<Config>) -> Arc<Self> {
        let now = Instant::now();
        let (sender, receiver) = mpsc::unbounded_channel();

        let room = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            code,
            password_hash,
            created_at: Utc::now(),
            config,
            inbound: sender,
            state: Mutex::new(RoomState {
                members: Vec::new(),
                host: None,
                hub: Hub::default(),
                phase: Phase::Idle,
                playback: PlaybackState::new(now),
                round: None,
                round_seq: 0,
                clips: Vec::new(),
                shared_pool: false,
                activity: VecDeque::new(),
                last_activity: now,
                frozen: false,
                closed: false,
            }),
        });

        tokio::spawn(run_worker(Arc::downgrade(&room), receiver));

        room
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn weak(&self) -> Weak<Room> {
        self.me.clone()
    }

    /// Adds a member. It stays disconnected until a session attaches.
    pub fn add_member(&self, handle: String) -> Result<Member, RoomError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.closed {
            return Err(RoomError::RoomClosed);
        }

        let member = Member::new(handle, now);

        if state.host.is_none() {
            state.host = Some(member.id);
        }

        state.members.push(member.clone());
        state.last_activity = now;
        state.log_activity(format!("{} joined", member.handle));
        state.broadcast_presence();

        info!("{} joined room {}", member.handle, self.code);

        Ok(member)
    }

    /// Resolves a member token to the member it belongs to.
    pub fn member_by_token(&self, token: &str) -> Result<MemberId, RoomError> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.token == token)
            .map(|m| m.id)
            .ok_or(RoomError::InvalidToken)
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.state.lock().member(member).is_some()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().member_infos()
    }

    pub fn host(&self) -> Option<MemberId> {
        self.state.lock().host
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// The snapshot a member would receive right now.
    pub fn snapshot(&self, member: MemberId) -> Result<RoomSnapshot, RoomError> {
        let state = self.state.lock();
        state.member(member).ok_or(RoomError::MemberNotFound)?;

        Ok(state.snapshot(&self.code, member, Instant::now()))
    }

    /// Attaches a session for `member`. The member is sent a snapshot as its
    /// first message, and is detached again when the handle drops.
    pub fn attach(
        &self,
        member: MemberId,
        sender: UnboundedSender<Outbound>,
    ) -> Result<ConnectionHandle, RoomError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.closed {
            return Err(RoomError::RoomClosed);
        }

        let entry = state.member_mut(member).ok_or(RoomError::MemberNotFound)?;
        entry.liveness = Liveness::Connected;
        let handle = entry.handle.clone();

        let connection = state.hub.attach(member, sender);
        let snapshot = state.snapshot(&self.code, member, now);
        state.hub.send(member, ServerMessage::Snapshot(snapshot));

        if state.frozen && state.host == Some(member) {
            state.frozen = false;
            state.log_activity(format!("{} is back", handle));
        }

        state.broadcast_presence();

        info!("{} connected to room {}", handle, self.code);

        Ok(ConnectionHandle::new(self.weak(), member, connection))
    }

    /// Called when a [ConnectionHandle] is dropped.
    pub(crate) fn detach(&self, member: MemberId, connection: super::ConnectionId) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if !state.hub.detach(member, connection) {
            return;
        }

        if let Some(entry) = state.member_mut(member) {
            entry.liveness = Liveness::Disconnected { since: now };
            info!("{} disconnected from room {}", entry.handle, self.code);
        }

        state.broadcast_presence();
        state.check_round();
    }

    /// Queues a session message for the room's worker.
    pub fn submit(&self, member: MemberId, message: ClientMessage) -> Result<(), RoomError> {
        self.inbound
            .send(Inbound { member, message })
            .map_err(|_| RoomError::RoomClosed)
    }

    /// Applies a session message from `member`. Failures are reported to the
    /// sender only.
    pub fn handle_message(&self, member: MemberId, message: ClientMessage) {
        if self.state.lock().closed {
            return;
        }

        self.touch();

        let result = match &message {
            // Sessions authenticate before their messages reach the room
            ClientMessage::Auth { .. } => Ok(()),
            ClientMessage::SelectClip { clip } => self.select_clip(member, *clip).map(|_| ()),
            ClientMessage::Ready { round } => self.report_ready(member, *round),
            ClientMessage::DownloadProgress {
                round, received, ..
            } => self.report_progress(member, *round, *received),
            ClientMessage::Play => self.play(member),
            ClientMessage::Pause => self.pause(member),
            ClientMessage::Seek { position } => self.seek(member, *position),
            ClientMessage::Speed { speed } => self.set_speed(member, *speed),
            ClientMessage::Kick { member: target } => self.kick(member, *target),
            ClientMessage::SetSharedPool { enabled } => self.set_shared_pool(member, *enabled),
            ClientMessage::RequestRandom => self.request_random(member).map(|_| ()),
            ClientMessage::ClipEnded { round } => self.clip_ended(member, *round),
            ClientMessage::ForceStart { round } => self.force_start(member, *round),
            ClientMessage::Ping { nonce } => {
                self.send(member, ServerMessage::Pong { nonce: *nonce });
                Ok(())
            }
            ClientMessage::Pong { nonce } => {
                self.record_pong(member, *nonce);
                Ok(())
            }
            ClientMessage::Leave => self.leave(member),
        };

        if let Err(error) = result {
            self.reject(member, message, error)
        }
    }

    fn reject(&self, member: MemberId, message: ClientMessage, error: RoomError) {
        match error {
            RoomError::StaleRound { given } if !message.is_host_only() => {
                debug!("Ignoring late report for round {} in {}", given, self.code)
            }
            RoomError::NotHost(_) if self.config.guest_requests == GuestPolicy::Forward => {
                self.forward_to_host(member, message)
            }
            error => {
                debug!("Rejected {:?} in {}: {}", message, self.code, error);
                self.send(member, ServerMessage::error(error.kind(), error.to_string()));
            }
        }
    }

    fn forward_to_host(&self, member: MemberId, request: ClientMessage) {
        let state = self.state.lock();

        let Some(host) = state.host else {
            return;
        };

        let handle = state.handle_of(member);
        state.hub.send(
            host,
            ServerMessage::GuestRequest {
                from: member,
                handle,
                request,
            },
        );
    }

    /// Unicasts a message to a member, if it is connected.
    pub fn send(&self, member: MemberId, message: ServerMessage) -> bool {
        self.state.lock().hub.send(member, message)
    }

    pub fn broadcast(&self, message: ServerMessage, exclude: Option<MemberId>) {
        self.state.lock().hub.broadcast(message, exclude)
    }

    fn record_pong(&self, member: MemberId, nonce: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(rtt) = state.hub.pong(member, nonce, now) {
            if let Some(entry) = state.member_mut(member) {
                entry.latency.record(rtt);
            }
        }
    }

    /// Refreshes the expiry deadline.
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        let last_activity = self.state.lock().last_activity;
        now.saturating_duration_since(last_activity) >= self.config.room_inactivity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Runs one liveness round: probes connections, marks unresponsive ones
    /// disconnected, evicts members gone longer than the reconnect grace, and
    /// hands the room to a new host if needed.
    pub fn check_liveness(&self, now: Instant) {
        let mut state = self.state.lock();

        if state.closed {
            return;
        }

        for member in state.hub.probe(now, self.config.probe_timeout) {
            if let Some(entry) = state.member_mut(member) {
                entry.liveness = Liveness::Disconnected { since: now };
                let text = format!("{} lost connection", entry.handle);

                info!("{} in room {}", text, self.code);
                state.log_activity(text);
            }
        }

        let gone: Vec<_> = state
            .members
            .iter()
            .filter(|m| {
                m.disconnected_for(now)
                    .is_some_and(|d| d >= self.config.reconnect_grace)
            })
            .map(|m| m.id)
            .collect();

        for member in gone {
            let is_host = state.host == Some(member);

            if is_host && self.config.host_succession == HostSuccession::Freeze {
                state.freeze(now);
                continue;
            }

            if let Some(removed) = state.remove_member(member) {
                info!("Evicted {} from room {}", removed.handle, self.code);
                state.log_activity(format!("{} left", removed.handle));
            }
        }

        state.ensure_host();
        state.check_round();

        if !state.hub.is_empty() {
            state.broadcast_presence();
        }
    }

    /// Closes every session and refuses further use. Returns the number of
    /// stored bytes belonging to the room.
    pub fn close(&self, reason: &str) -> u64 {
        let mut state = self.state.lock();

        state.closed = true;
        state.round = None;
        state.hub.broadcast(
            ServerMessage::RoomClosed {
                reason: reason.to_string(),
            },
            None,
        );
        state.hub.close_all(reason);

        state
            .clips
            .iter()
            .filter(|c| matches!(c.status, AssetStatus::Complete { .. }))
            .map(|c| c.size)
            .sum()
    }
}

impl RoomState {
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    pub fn handle_of(&self, id: MemberId) -> String {
        self.member(id)
            .map(|m| m.handle.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn member_infos(&self) -> Vec<MemberInfo> {
        self.members.iter().map(|m| m.info(self.host)).collect()
    }

    pub fn log_activity(&mut self, text: String) {
        let entry = ActivityEntry::now(text);

        self.activity.push_back(entry.clone());
        while self.activity.len() > Room::ACTIVITY_LIMIT {
            self.activity.pop_front();
        }

        self.hub.broadcast(ServerMessage::Activity { entry }, None);
    }

    pub fn broadcast_presence(&self) {
        self.hub.broadcast(
            ServerMessage::Presence {
                members: self.member_infos(),
            },
            None,
        )
    }

    /// Removes a member for good, closing its session. Does not pick a new
    /// host, see [RoomState::ensure_host].
    pub fn remove_member(&mut self, id: MemberId) -> Option<Member> {
        let index = self.members.iter().position(|m| m.id == id)?;
        let member = self.members.remove(index);

        self.hub.close(id, "Removed from the room");

        if let Some(round) = &mut self.round {
            round.forget(id);
        }

        if self.host == Some(id) {
            self.host = None;
        }

        Some(member)
    }

    /// Makes sure a remaining member holds the host role. The most senior
    /// connected member wins, then the most senior disconnected one.
    pub fn ensure_host(&mut self) {
        if self.host.is_some_and(|h| self.member(h).is_some()) {
            return;
        }

        let successor = self
            .members
            .iter()
            .find(|m| m.is_connected())
            .or_else(|| self.members.first())
            .map(|m| (m.id, m.handle.clone()));

        self.host = successor.as_ref().map(|(id, _)| *id);

        if let Some((host, handle)) = successor {
            info!("{} is now the host", handle);

            self.hub.broadcast(
                ServerMessage::HostChanged {
                    host,
                    handle: handle.clone(),
                },
                None,
            );
            self.log_activity(format!("{} is now the host", handle));
        }
    }

    /// Pauses playback until the host returns.
    pub fn freeze(&mut self, now: Instant) {
        if self.frozen {
            return;
        }

        self.frozen = true;

        if self.phase == Phase::Playing {
            self.playback.pause(now);
            self.phase = Phase::Paused;

            self.hub.broadcast(
                ServerMessage::Pause {
                    position: self.playback.position_at(now),
                    server_time: server_time(),
                    issued_by: "server".to_string(),
                },
                None,
            );
        }

        let handle = self.host.map(|h| self.handle_of(h)).unwrap_or_default();
        self.log_activity(format!("Waiting for {} to come back", handle));
    }

    pub fn snapshot(&self, code: &RoomCode, you: MemberId, now: Instant) -> RoomSnapshot {
        RoomSnapshot {
            code: code.clone(),
            you,
            host: self.host.unwrap_or(you),
            members: self.member_infos(),
            clips: self.clips.iter().filter_map(|c| c.info()).collect(),
            phase: self.phase,
            round: self.round.as_ref().map(|r| r.seq),
            clip: self.playback.clip(),
            position: self.playback.position_at(now),
            playing: self.playback.is_playing(),
            speed: self.playback.speed(),
            shared_pool: self.shared_pool,
            activity: self.activity.iter().cloned().collect(),
            server_time: server_time(),
        }
    }
}

async fn run_worker(room: Weak<Room>, mut inbound: UnboundedReceiver<Inbound>) {
    while let Some(Inbound { member, message }) = inbound.recv().await {
        let Some(room) = room.upgrade() else {
            break;
        };

        room.handle_message(member, message);
    }
}
