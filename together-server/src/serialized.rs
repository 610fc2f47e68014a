//! Conversions from collab types into the bodies exposed by endpoints

use serde::Serialize;
use together_collab::Membership;
use together_core::{ClipInfo, RoomAccess, UploadReceipt};

/// Helper trait to convert any type into a serialized version
pub trait ToSerialized<T>
where
    T: Serialize,
{
    fn to_serialized(&self) -> T;
}

impl ToSerialized<RoomAccess> for Membership {
    fn to_serialized(&self) -> RoomAccess {
        RoomAccess {
            code: self.room.clone(),
            member_id: self.member,
            token: self.token.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl ToSerialized<UploadReceipt> for ClipInfo {
    fn to_serialized(&self) -> UploadReceipt {
        UploadReceipt {
            asset_id: self.id,
            clip: self.clone(),
        }
    }
}
