//! The session protocol, spoken as JSON text frames over the `/sessions/{code}`
//! channel. Every message carries a `type` tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ErrorKind, Id, Phase, RoomCode};

pub type MemberId = Id<MemberInfo>;
pub type ClipId = Id<ClipInfo>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Malformed
    }
}

/// Messages sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on a new session
    Auth { token: String },
    /// Make the given clip the active one, starting a ready-sync round
    SelectClip { clip: ClipId },
    /// The clip of this round is fully retrieved and verified
    Ready { round: u64 },
    DownloadProgress { round: u64, received: u64, total: u64 },
    Play,
    Pause,
    /// Seek to a position in seconds
    Seek { position: f64 },
    Speed { speed: f64 },
    Kick { member: MemberId },
    SetSharedPool { enabled: bool },
    /// Ask the server to pick a random clip from the shared pool
    RequestRandom,
    /// The active clip reached its end on the host
    ClipEnded { round: u64 },
    /// Start a round even though some members are still preparing
    ForceStart { round: u64 },
    Ping { nonce: u64 },
    /// Answer to a server liveness probe
    Pong { nonce: u64 },
    /// Leave the room for good
    Leave,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether only the host may issue this message.
    pub fn is_host_only(&self) -> bool {
        matches!(
            self,
            Self::SelectClip { .. }
                | Self::Play
                | Self::Pause
                | Self::Seek { .. }
                | Self::Speed { .. }
                | Self::Kick { .. }
                | Self::SetSharedPool { .. }
                | Self::RequestRandom
                | Self::ClipEnded { .. }
                | Self::ForceStart { .. }
        )
    }
}

/// Messages sent by the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The full room state, sent when a session attaches
    Snapshot(RoomSnapshot),
    /// A new clip was selected, retrieve it and report ready
    Prepare {
        round: u64,
        clip: ClipInfo,
        issued_by: String,
    },
    ReadyProgress { round: u64, ready: usize, total: usize },
    AllReady { round: u64, clip: ClipId },
    Play {
        position: f64,
        speed: f64,
        server_time: i64,
        issued_by: String,
    },
    Pause {
        position: f64,
        server_time: i64,
        issued_by: String,
    },
    Seek {
        position: f64,
        playing: bool,
        server_time: i64,
        issued_by: String,
    },
    Speed {
        speed: f64,
        position: f64,
        playing: bool,
        server_time: i64,
        issued_by: String,
    },
    VideoUploaded { clip: ClipInfo },
    Activity { entry: ActivityEntry },
    /// Connection state and latency of every member
    Presence { members: Vec<MemberInfo> },
    HostChanged { host: MemberId, handle: String },
    SharedPool { enabled: bool, changed_by: String },
    /// Sent to the host when a ready-sync round takes too long
    Stalled {
        round: u64,
        waiting: Vec<StalledMember>,
    },
    /// A guest's request, forwarded to the host
    GuestRequest {
        from: MemberId,
        handle: String,
        request: ClientMessage,
    },
    /// You were removed from the room
    Kick { kicked_by: String },
    /// Liveness probe, answer with `pong`
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    RoomClosed { reason: String },
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a member needs to catch up with a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub code: RoomCode,
    /// The member this snapshot was made for
    pub you: MemberId,
    pub host: MemberId,
    pub members: Vec<MemberInfo>,
    pub clips: Vec<ClipInfo>,
    pub phase: Phase,
    /// The open ready-sync round, if preparing
    pub round: Option<u64>,
    pub clip: Option<ClipId>,
    /// Reconstructed at the time the snapshot was taken
    pub position: f64,
    pub playing: bool,
    pub speed: f64,
    pub shared_pool: bool,
    pub activity: Vec<ActivityEntry>,
    pub server_time: i64,
}

impl RoomSnapshot {
    pub fn clip_info(&self, id: ClipId) -> Option<&ClipInfo> {
        self.clips.iter().find(|c| c.id == id)
    }

    pub fn is_host(&self) -> bool {
        self.you == self.host
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub handle: String,
    pub host: bool,
    pub connected: bool,
    /// Smoothed round-trip latency
    pub latency_ms: Option<u64>,
}

/// A clip available for download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipInfo {
    pub id: ClipId,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub contributed_by: MemberId,
    /// Hex encoded SHA-256 of the whole file
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalledMember {
    pub id: MemberId,
    pub handle: String,
    /// Bytes retrieved so far, if the member reported progress
    pub received: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub text: String,
}

impl ActivityEntry {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }
}

/// Header carrying the hex SHA-256 of a downloaded clip.
pub const CLIP_SHA256_HEADER: &str = "x-clip-sha256";
/// Header carrying the file name of an uploaded clip.
pub const CLIP_NAME_HEADER: &str = "x-clip-name";
/// Header carrying the total size of an uploaded clip, when the body is chunked.
pub const CLIP_SIZE_HEADER: &str = "x-clip-size";

/// Returned when creating or joining a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAccess {
    pub code: RoomCode,
    pub member_id: MemberId,
    /// Secret for sessions and clip transfers
    pub token: String,
    pub snapshot: RoomSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub asset_id: ClipId,
    pub clip: ClipInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub rooms: usize,
}

/// The body of every failed HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod test {
    use super::{ClientMessage, ServerMessage};
    use crate::{ClipId, ErrorKind};

    #[test]
    fn client_messages_use_snake_case_tags() {
        let message = ClientMessage::decode(r#"{"type":"select_clip","clip":7}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::SelectClip {
                clip: ClipId::from_value(7)
            }
        );

        assert_eq!(
            ClientMessage::decode(r#"{"type":"play"}"#).unwrap(),
            ClientMessage::Play
        );
        assert_eq!(ClientMessage::Pause.encode().unwrap(), r#"{"type":"pause"}"#);
    }

    #[test]
    fn garbage_is_malformed() {
        for text in [
            "not json",
            r#"{"type":"dance"}"#,
            r#"{"type":"seek"}"#,
            r#"{"type":"ready","round":"one"}"#,
        ] {
            let err = ClientMessage::decode(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Malformed);
        }
    }

    #[test]
    fn server_errors_carry_their_kind() {
        let text = ServerMessage::error(ErrorKind::Forbidden, "Only the host can do that")
            .encode()
            .unwrap();

        assert!(text.contains(r#""type":"error""#));
        assert!(text.contains(r#""kind":"forbidden""#));
    }

    #[test]
    fn host_only_messages() {
        assert!(ClientMessage::Play.is_host_only());
        assert!(ClientMessage::Seek { position: 1.0 }.is_host_only());
        assert!(!ClientMessage::Ready { round: 1 }.is_host_only());
        assert!(!ClientMessage::Pong { nonce: 1 }.is_host_only());
    }
}
