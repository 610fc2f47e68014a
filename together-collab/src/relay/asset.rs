use std::path::PathBuf;

use log::info;
use together_core::{ClipId, ClipInfo, MemberId, ServerMessage};

use crate::{rooms::Room, RoomError};

/// A clip file stored for a room.
#[derive(Debug, Clone)]
pub struct ClipAsset {
    pub id: ClipId,
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    pub content_type: String,
    pub contributed_by: MemberId,
    pub path: PathBuf,
    pub status: AssetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetStatus {
    Uploading,
    Complete { sha256: String },
    /// The upload ended early and its file was deleted
    Failed,
}

impl ClipAsset {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, AssetStatus::Complete { .. })
    }

    /// Public info, only for clips that can be downloaded.
    pub fn info(&self) -> Option<ClipInfo> {
        match &self.status {
            AssetStatus::Complete { sha256 } => Some(ClipInfo {
                id: self.id,
                name: self.name.clone(),
                size: self.size,
                content_type: self.content_type.clone(),
                contributed_by: self.contributed_by,
                sha256: sha256.clone(),
            }),
            _ => None,
        }
    }
}

impl Room {
    pub(crate) fn register_clip(&self, asset: ClipAsset) -> Result<(), RoomError> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(RoomError::RoomClosed);
        }

        state
            .member(asset.contributed_by)
            .ok_or(RoomError::MemberNotFound)?;

        state.clips.push(asset);
        Ok(())
    }

    /// Marks an upload as downloadable and announces it to the room.
    pub(crate) fn complete_clip(&self, clip: ClipId, sha256: String) -> Result<ClipInfo, RoomError> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(RoomError::RoomClosed);
        }

        let asset = state
            .clips
            .iter_mut()
            .find(|c| c.id == clip && c.status == AssetStatus::Uploading)
            .ok_or(RoomError::ClipNotFound(clip))?;

        asset.status = AssetStatus::Complete { sha256 };

        let info = asset.info().ok_or(RoomError::ClipNotFound(clip))?;

        if let Some(member) = state.member_mut(info.contributed_by) {
            member.contributed.push(clip);
        }

        let handle = state.handle_of(info.contributed_by);
        info!("{} uploaded {} to {}", handle, info.name, self.code());

        state
            .hub
            .broadcast(ServerMessage::VideoUploaded { clip: info.clone() }, None);
        state.log_activity(format!("{} uploaded {}", handle, info.name));
        state.last_activity = tokio::time::Instant::now();

        Ok(info)
    }

    pub(crate) fn fail_clip(&self, clip: ClipId) {
        let mut state = self.state.lock();

        if let Some(asset) = state.clips.iter_mut().find(|c| c.id == clip) {
            asset.status = AssetStatus::Failed;
        }
    }

    /// A clip that finished uploading.
    pub fn clip(&self, clip: ClipId) -> Result<ClipAsset, RoomError> {
        self.state
            .lock()
            .clips
            .iter()
            .find(|c| c.id == clip && c.is_complete())
            .cloned()
            .ok_or(RoomError::ClipNotFound(clip))
    }

    pub fn clips(&self) -> Vec<ClipInfo> {
        self.state
            .lock()
            .clips
            .iter()
            .filter_map(|c| c.info())
            .collect()
    }
}
