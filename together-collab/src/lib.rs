mod auth;
mod errors;
mod relay;
mod rooms;
mod tasks;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use together_core::{Config, RoomCode};

pub use auth::*;
pub use errors::*;
pub use relay::*;
pub use rooms::*;
pub use tasks::*;

/// The together collab system: rooms, their members and playback, and the
/// clips they share.
pub struct Collab {
    context: CollabContext,

    pub rooms: RoomManager,
    pub relay: Relay,
}

/// A type passed to the components of the collab system, to share state.
#[derive(Clone)]
pub struct CollabContext {
    pub config: Arc<Config>,
    pub rooms: Arc<DashMap<RoomCode, Arc<Room>>>,
    pub guard: PasswordGuard,
    pub limiter: Arc<JoinLimiter>,
    pub relay: Relay,
    /// Serializes room creation, so the room limit holds
    creation: Arc<Mutex<()>>,
}

impl Collab {
    pub fn new(config: Config) -> Self {
        let relay = Relay::new(&config);

        let context = CollabContext {
            guard: PasswordGuard::new(config.password_cost),
            limiter: Arc::new(JoinLimiter::new(
                config.max_join_attempts,
                config.join_window,
            )),
            relay: relay.clone(),
            rooms: Default::default(),
            creation: Default::default(),
            config: Arc::new(config),
        };

        let room_manager = RoomManager::new(&context);

        Self {
            context,
            rooms: room_manager,
            relay,
        }
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Starts the expiry sweeper and the liveness prober. They stop when the
    /// returned handle is dropped.
    pub fn start_background(&self) -> BackgroundTasks {
        BackgroundTasks::spawn(&self.context)
    }
}
