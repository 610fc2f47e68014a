use std::io;

use thiserror::Error;
use together_core::{ClipId, ErrorKind, Phase, RoomCode};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} does not exist")]
    RoomNotFound(RoomCode),
    #[error("Room has been closed")]
    RoomClosed,
    #[error("Clip {0} does not exist")]
    ClipNotFound(ClipId),
    #[error("Member is not in this room")]
    MemberNotFound,
    #[error("Invalid session token")]
    InvalidToken,
    #[error("Wrong password")]
    WrongPassword,
    #[error("Only the host can {0}")]
    NotHost(&'static str),
    #[error("You cannot kick yourself")]
    KickSelf,
    #[error("Too many join attempts, try again later")]
    RateLimited,
    #[error("Clip is {size} bytes, the limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("Not enough storage left for {0} bytes")]
    StorageFull(u64),
    #[error("The server has reached its room limit")]
    CapacityExceeded,
    #[error("Round {given} is not the current round")]
    StaleRound { given: u64 },
    #[error("Cannot {action} while {phase:?}")]
    IllegalState { action: &'static str, phase: Phase },
    #[error("There are no clips in the shared pool")]
    EmptyPool,
    #[error("Speed {0} is out of range")]
    InvalidSpeed(f64),
    #[error("Position {0} is not a valid position")]
    InvalidPosition(f64),
    #[error("Upload is empty")]
    EmptyUpload,
    #[error("Upload sent more than the declared {0} bytes")]
    Overflow(u64),
    #[error("Upload ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("Range cannot be satisfied for a clip of {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    #[error("HashError: {0}")]
    Hash(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_)
            | Self::RoomClosed
            | Self::ClipNotFound(_)
            | Self::MemberNotFound => ErrorKind::NotFound,
            Self::InvalidToken | Self::WrongPassword | Self::NotHost(_) => ErrorKind::Forbidden,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::TooLarge { .. } | Self::StorageFull(_) => ErrorKind::TooLarge,
            Self::CapacityExceeded => ErrorKind::CapacityExceeded,
            Self::KickSelf
            | Self::StaleRound { .. }
            | Self::IllegalState { .. }
            | Self::EmptyPool
            | Self::RangeNotSatisfiable { .. } => ErrorKind::Conflict,
            Self::InvalidSpeed(_)
            | Self::InvalidPosition(_)
            | Self::EmptyUpload
            | Self::Overflow(_) => ErrorKind::Malformed,
            Self::Incomplete { .. } => ErrorKind::Transient,
            Self::Hash(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}
