use std::collections::{HashMap, HashSet};

use log::{debug, info};
use rand::seq::SliceRandom;
use tokio::time::{sleep, Instant};
use together_core::{
    is_valid_speed, server_time, ClipId, MemberId, Phase, ServerMessage, StalledMember,
};

use crate::RoomError;

use super::{Room, RoomState};

/// Tracks which members have retrieved the clip of the current selection.
#[derive(Debug, Clone)]
pub struct ReadyRound {
    pub seq: u64,
    pub clip: ClipId,
    pub ready: HashSet<MemberId>,
    /// Bytes received so far, as reported by members still retrieving
    pub progress: HashMap<MemberId, u64>,
    pub opened_at: Instant,
}

impl ReadyRound {
    fn new(seq: u64, clip: ClipId, now: Instant) -> Self {
        Self {
            seq,
            clip,
            ready: HashSet::new(),
            progress: HashMap::new(),
            opened_at: now,
        }
    }

    pub fn forget(&mut self, member: MemberId) {
        self.ready.remove(&member);
        self.progress.remove(&member);
    }
}

impl Room {
    /// Makes `clip` the active clip and opens a ready-sync round for it,
    /// superseding any open round. Returns the new round's sequence number.
    pub fn select_clip(&self, member: MemberId, clip: ClipId) -> Result<u64, RoomError> {
        let mut state = self.state.lock();
        state.require_host(member, "change the clip")?;

        let issued_by = state.handle_of(member);
        let seq = state.open_round(clip, issued_by, Instant::now())?;

        drop(state);
        self.watch_round(seq);

        Ok(seq)
    }

    /// Marks `member` ready for the given round. Late reports for older
    /// rounds fail with [RoomError::StaleRound].
    pub fn report_ready(&self, member: MemberId, round: u64) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.current_round(round)?;

        let is_connected = state
            .member(member)
            .ok_or(RoomError::MemberNotFound)?
            .is_connected();

        if let Some(open) = &mut state.round {
            open.ready.insert(member);
            open.progress.remove(&member);
        }

        if is_connected {
            let (ready, total) = state.ready_counts();
            debug!("Round {} in {}: {}/{} ready", round, self.code(), ready, total);

            state
                .hub
                .broadcast(ServerMessage::ReadyProgress { round, ready, total }, None);
        }

        state.check_round();
        Ok(())
    }

    /// Records how far `member` got retrieving the clip of the round.
    pub fn report_progress(
        &self,
        member: MemberId,
        round: u64,
        received: u64,
    ) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.current_round(round)?;

        if let Some(open) = &mut state.round {
            open.progress.insert(member, received);
        }

        Ok(())
    }

    pub fn play(&self, member: MemberId) -> Result<(), RoomError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.require_host(member, "play")?;
        state.require_playback("play")?;

        state.playback.play(now);
        state.phase = Phase::Playing;

        let message = ServerMessage::Play {
            position: state.playback.position_at(now),
            speed: state.playback.speed(),
            server_time: server_time(),
            issued_by: state.handle_of(member),
        };
        state.hub.broadcast(message, None);

        Ok(())
    }

    pub fn pause(&self, member: MemberId) -> Result<(), RoomError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.require_host(member, "pause")?;
        state.require_playback("pause")?;

        state.playback.pause(now);
        state.phase = Phase::Paused;

        let message = ServerMessage::Pause {
            position: state.playback.position_at(now),
            server_time: server_time(),
            issued_by: state.handle_of(member),
        };
        state.hub.broadcast(message, None);

        Ok(())
    }

    pub fn seek(&self, member: MemberId, position: f64) -> Result<(), RoomError> {
        if !position.is_finite() {
            return Err(RoomError::InvalidPosition(position));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.require_host(member, "seek")?;
        state.require_playback("seek")?;

        state.playback.seek(position, now);

        let message = ServerMessage::Seek {
            position: state.playback.position_at(now),
            playing: state.playback.is_playing(),
            server_time: server_time(),
            issued_by: state.handle_of(member),
        };
        state.hub.broadcast(message, None);

        Ok(())
    }

    pub fn set_speed(&self, member: MemberId, speed: f64) -> Result<(), RoomError> {
        if !is_valid_speed(speed) {
            return Err(RoomError::InvalidSpeed(speed));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.require_host(member, "change the speed")?;
        state.require_playback("change the speed")?;

        state.playback.set_speed(speed, now);

        let message = ServerMessage::Speed {
            speed,
            position: state.playback.position_at(now),
            playing: state.playback.is_playing(),
            server_time: server_time(),
            issued_by: state.handle_of(member),
        };
        state.hub.broadcast(message, None);

        Ok(())
    }

    /// Removes `target` from the room and closes its session.
    pub fn kick(&self, requester: MemberId, target: MemberId) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.require_host(requester, "kick members")?;

        if requester == target {
            return Err(RoomError::KickSelf);
        }

        state.member(target).ok_or(RoomError::MemberNotFound)?;

        let kicked_by = state.handle_of(requester);
        state
            .hub
            .send(target, ServerMessage::Kick { kicked_by: kicked_by.clone() });

        if let Some(kicked) = state.remove_member(target) {
            info!("{} was kicked from {} by {}", kicked.handle, self.code(), kicked_by);
            state.log_activity(format!("{} was kicked by {}", kicked.handle, kicked_by));
        }

        state.broadcast_presence();
        state.check_round();

        Ok(())
    }

    /// Removes `member` immediately, without waiting for the reconnect grace.
    pub fn leave(&self, member: MemberId) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        let left = state.remove_member(member).ok_or(RoomError::MemberNotFound)?;

        info!("{} left room {}", left.handle, self.code());
        state.log_activity(format!("{} left", left.handle));

        state.ensure_host();
        state.broadcast_presence();
        state.check_round();

        Ok(())
    }

    pub fn set_shared_pool(&self, member: MemberId, enabled: bool) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.require_host(member, "change the shared pool")?;

        state.shared_pool = enabled;

        let changed_by = state.handle_of(member);
        state.hub.broadcast(
            ServerMessage::SharedPool {
                enabled,
                changed_by: changed_by.clone(),
            },
            None,
        );

        let verb = if enabled { "enabled" } else { "disabled" };
        state.log_activity(format!("{} {} the shared pool", changed_by, verb));

        Ok(())
    }

    /// Selects a random clip from the shared pool.
    pub fn request_random(&self, member: MemberId) -> Result<u64, RoomError> {
        let mut state = self.state.lock();
        state.require_host(member, "pick a random clip")?;

        let clip = state.pick_random()?;
        let issued_by = state.handle_of(member);
        let seq = state.open_round(clip, issued_by, Instant::now())?;

        drop(state);
        self.watch_round(seq);

        Ok(seq)
    }

    /// The host reached the end of the clip of `round`. With the shared pool
    /// enabled, the next clip is picked at random.
    pub fn clip_ended(&self, member: MemberId, round: u64) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.require_host(member, "end the clip")?;

        if round != state.round_seq {
            return Err(RoomError::StaleRound { given: round });
        }

        if !state.shared_pool {
            return Ok(());
        }

        let clip = state.pick_random()?;
        let seq = state.open_round(clip, "shared pool".to_string(), Instant::now())?;

        drop(state);
        self.watch_round(seq);

        Ok(())
    }

    /// Ends the open round even though some members are not ready yet.
    pub fn force_start(&self, member: MemberId, round: u64) -> Result<(), RoomError> {
        let mut state = self.state.lock();
        state.require_host(member, "force a start")?;
        state.current_round(round)?;

        info!("Round {} in {} was force started", round, self.code());
        state.complete_round();

        Ok(())
    }

    /// Starts the timer that tells the host about members stalling a round.
    fn watch_round(&self, seq: u64) {
        let Some(timeout) = self.config.ready_timeout else {
            return;
        };

        let room = self.weak();

        tokio::spawn(async move {
            sleep(timeout).await;

            if let Some(room) = room.upgrade() {
                room.notify_stalled(seq)
            }
        });
    }

    fn notify_stalled(&self, seq: u64) {
        let state = self.state.lock();

        let Some(round) = state.round.as_ref().filter(|r| r.seq == seq) else {
            return;
        };

        let waiting: Vec<_> = state
            .members
            .iter()
            .filter(|m| m.is_connected() && !round.ready.contains(&m.id))
            .map(|m| StalledMember {
                id: m.id,
                handle: m.handle.clone(),
                received: round.progress.get(&m.id).copied(),
            })
            .collect();

        if waiting.is_empty() {
            return;
        }

        if let Some(host) = state.host {
            info!(
                "Round {} in {} is waiting on {} member(s)",
                seq,
                self.code(),
                waiting.len()
            );

            state
                .hub
                .send(host, ServerMessage::Stalled { round: seq, waiting });
        }
    }
}

impl RoomState {
    fn require_host(&self, member: MemberId, action: &'static str) -> Result<(), RoomError> {
        self.member(member).ok_or(RoomError::MemberNotFound)?;

        if self.host != Some(member) {
            return Err(RoomError::NotHost(action));
        }

        Ok(())
    }

    fn require_playback(&self, action: &'static str) -> Result<(), RoomError> {
        if !self.phase.accepts_playback() {
            return Err(RoomError::IllegalState {
                action,
                phase: self.phase,
            });
        }

        Ok(())
    }

    /// Fails unless `round` is the open round.
    fn current_round(&self, round: u64) -> Result<&ReadyRound, RoomError> {
        self.round
            .as_ref()
            .filter(|r| r.seq == round)
            .ok_or(RoomError::StaleRound { given: round })
    }

    fn open_round(
        &mut self,
        clip: ClipId,
        issued_by: String,
        now: Instant,
    ) -> Result<u64, RoomError> {
        let info = self
            .clips
            .iter()
            .find(|c| c.id == clip)
            .and_then(|c| c.info())
            .ok_or(RoomError::ClipNotFound(clip))?;

        self.round_seq += 1;
        let seq = self.round_seq;

        self.round = Some(ReadyRound::new(seq, clip, now));
        self.phase = Phase::Preparing;
        self.playback.load(clip, now);

        info!("Opened round {} for {} ({})", seq, info.name, issued_by);

        self.hub.broadcast(
            ServerMessage::Prepare {
                round: seq,
                clip: info,
                issued_by,
            },
            None,
        );

        Ok(seq)
    }

    /// Connected members that are ready, and connected members overall.
    fn ready_counts(&self) -> (usize, usize) {
        let Some(round) = &self.round else {
            return (0, 0);
        };

        self.members
            .iter()
            .filter(|m| m.is_connected())
            .fold((0, 0), |(ready, total), m| {
                (ready + usize::from(round.ready.contains(&m.id)), total + 1)
            })
    }

    /// Completes the open round once every connected member is ready.
    pub fn check_round(&mut self) {
        if self.round.is_none() {
            return;
        }

        let (ready, total) = self.ready_counts();

        if total > 0 && ready == total {
            self.complete_round();
        }
    }

    fn complete_round(&mut self) {
        let Some(round) = self.round.take() else {
            return;
        };

        self.phase = Phase::Synced;

        info!("Round {} is ready", round.seq);

        self.hub.broadcast(
            ServerMessage::AllReady {
                round: round.seq,
                clip: round.clip,
            },
            None,
        );
    }

    /// A random complete clip, avoiding the current one when there is a choice.
    fn pick_random(&self) -> Result<ClipId, RoomError> {
        let candidates: Vec<_> = self
            .clips
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.id)
            .collect();

        let current = self.playback.clip();
        let fresh: Vec<_> = candidates
            .iter()
            .copied()
            .filter(|c| Some(*c) != current)
            .collect();

        let pool = if fresh.is_empty() { &candidates } else { &fresh };

        pool.choose(&mut rand::thread_rng())
            .copied()
            .ok_or(RoomError::EmptyPool)
    }
}
