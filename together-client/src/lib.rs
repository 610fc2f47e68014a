//! The client side of a together session: talks to a room over HTTP and a
//! session channel, stages clips locally, and keeps a local player in step
//! with the room.

mod agent;
mod api;
mod cache;
mod dialer;
mod errors;
mod player;
mod reconnect;

pub use agent::*;
pub use api::*;
pub use cache::*;
pub use dialer::*;
pub use errors::*;
pub use player::*;
pub use reconnect::*;
