//! Types shared by the together server and client: ids, configuration,
//! room codes, the session protocol, and the playback anchor math.

mod code;
mod config;
mod error;
mod playback;
mod protocol;
mod util;

pub use code::*;
pub use config::*;
pub use error::*;
pub use playback::*;
pub use protocol::*;
pub use util::*;
