mod coordinator;
mod hub;
mod member;
mod room;

use std::{net::IpAddr, sync::Arc};

use log::{info, warn};
use tokio::{
    task::{spawn_blocking, JoinHandle},
    time::Instant,
};
use together_core::{MemberId, RoomCode, RoomSnapshot};

use crate::{CollabContext, RoomError};

pub use coordinator::*;
pub use hub::*;
pub use member::*;
pub use room::*;

/// The room store: creates, finds, and expires rooms.
pub struct RoomManager {
    context: CollabContext,
}

/// What a creator or joiner gets back.
#[derive(Debug, Clone)]
pub struct Membership {
    pub room: RoomCode,
    pub member: MemberId,
    pub token: String,
    pub snapshot: RoomSnapshot,
}

/// The outcome of an expiry sweep.
pub struct SweepReport {
    pub removed: Vec<RoomCode>,
    /// File deletions, running in the background
    pub purges: Vec<JoinHandle<()>>,
}

impl RoomManager {
    pub fn new(context: &CollabContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Creates a room with the caller as its host and only member.
    pub async fn create_room(
        &self,
        password: String,
        handle: String,
    ) -> Result<Membership, RoomError> {
        if self.count() >= self.context.config.max_rooms {
            return Err(RoomError::CapacityExceeded);
        }

        let guard = self.context.guard.clone();
        let hash = spawn_blocking(move || guard.hash(&password))
            .await
            .map_err(|e| RoomError::Hash(e.to_string()))??;

        let room = {
            let _creating = self.context.creation.lock();

            if self.count() >= self.context.config.max_rooms {
                return Err(RoomError::CapacityExceeded);
            }

            let code = loop {
                let candidate = RoomCode::generate();

                if !self.context.rooms.contains_key(&candidate) {
                    break candidate;
                }
            };

            let room = Room::new(code.clone(), hash, self.context.config.clone());
            self.context.rooms.insert(code, room.clone());

            room
        };

        info!("Created room {}", room.code());

        let member = room.add_member(handle)?;
        let snapshot = room.snapshot(member.id)?;

        Ok(Membership {
            room: room.code().clone(),
            member: member.id,
            token: member.token,
            snapshot,
        })
    }

    /// Joins an existing room. Attempts are rate limited per address, and
    /// every attempt that passes the limiter counts, successful or not.
    pub async fn join_room(
        &self,
        code: &RoomCode,
        password: String,
        handle: String,
        ip: IpAddr,
    ) -> Result<Membership, RoomError> {
        if let Err(error) = self.context.limiter.check(ip, Instant::now()) {
            warn!("Join attempt from {} was rate limited", ip);
            return Err(error);
        }

        let room = self.room(code)?;

        let guard = self.context.guard.clone();
        let hash = room.password_hash().to_string();

        spawn_blocking(move || guard.verify(&password, &hash))
            .await
            .map_err(|e| RoomError::Hash(e.to_string()))??;

        let member = room.add_member(handle)?;
        let snapshot = room.snapshot(member.id)?;

        Ok(Membership {
            room: code.clone(),
            member: member.id,
            token: member.token,
            snapshot,
        })
    }

    pub fn room(&self, code: &RoomCode) -> Result<Arc<Room>, RoomError> {
        self.context
            .rooms
            .get(code)
            .map(|r| r.clone())
            .filter(|r| !r.is_closed())
            .ok_or_else(|| RoomError::RoomNotFound(code.clone()))
    }

    /// Resolves a member token within a room.
    pub fn authenticate(
        &self,
        code: &RoomCode,
        token: &str,
    ) -> Result<(Arc<Room>, MemberId), RoomError> {
        let room = self.room(code)?;
        let member = room.member_by_token(token)?;

        Ok((room, member))
    }

    /// Refreshes a room's expiry deadline.
    pub fn touch(&self, code: &RoomCode) -> Result<(), RoomError> {
        self.room(code)?.touch();
        Ok(())
    }

    /// Removes every room inactive past the inactivity window, closing its
    /// sessions. Their files are deleted in the background.
    pub fn sweep_expired(&self, now: Instant) -> SweepReport {
        let expired: Vec<_> = self
            .context
            .rooms
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        let mut report = SweepReport {
            removed: Vec::new(),
            purges: Vec::new(),
        };

        for code in expired {
            let Some((_, room)) = self
                .context
                .rooms
                .remove_if(&code, |_, room| room.is_expired(now))
            else {
                continue;
            };

            let stored = room.close("Room expired");
            info!("Room {} expired", code);

            let relay = self.context.relay.clone();
            report
                .purges
                .push(tokio::spawn(relay.purge_room(code.clone(), stored)));
            report.removed.push(code);
        }

        report
    }

    /// Runs a liveness round in every room.
    pub fn check_liveness(&self, now: Instant) {
        let rooms = self.list_all();

        for room in rooms {
            room.check_liveness(now);
        }
    }

    pub fn list_all(&self) -> Vec<Arc<Room>> {
        self.context.rooms.iter().map(|r| r.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.context.rooms.len()
    }
}
