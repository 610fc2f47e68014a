use serde::{Deserialize, Serialize};

/// The kinds of failure a requester can be told about.
///
/// Every layer maps its own errors onto one of these, so that the HTTP status,
/// the `error` session message, and client-side handling agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown room, clip, or member
    NotFound,
    /// Bad password, or a host-only action attempted by a guest
    Forbidden,
    /// Too many join attempts from one address
    RateLimited,
    /// Upload above the per-file ceiling or the storage quota
    TooLarge,
    /// Stale ready-sync round, or a command issued from an illegal state
    Conflict,
    /// A transfer interrupted by a disconnect
    Transient,
    /// A message or request that could not be understood
    Malformed,
    /// The configured room limit has been reached
    CapacityExceeded,
    /// Anything else, e.g. disk failures
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::TooLarge => "too_large",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Malformed => "malformed",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
