use parking_lot::Mutex;

use crate::RoomError;

/// Bytes reserved for stored clips, across every room.
#[derive(Debug)]
pub struct StorageQuota {
    limit: Option<u64>,
    used: Mutex<u64>,
}

impl StorageQuota {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
        }
    }

    /// Reserves space for an upload before any of it is written.
    pub fn reserve(&self, bytes: u64) -> Result<(), RoomError> {
        let mut used = self.used.lock();

        if let Some(limit) = self.limit {
            if used.saturating_add(bytes) > limit {
                return Err(RoomError::StorageFull(bytes));
            }
        }

        *used += bytes;
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }
}

#[cfg(test)]
mod test {
    use super::StorageQuota;

    #[test]
    fn reservations_respect_the_limit() {
        let quota = StorageQuota::new(Some(100));

        quota.reserve(60).unwrap();
        assert!(quota.reserve(41).is_err());
        quota.reserve(40).unwrap();

        quota.release(60);
        assert_eq!(quota.used(), 40);
        quota.reserve(60).unwrap();
    }

    #[test]
    fn no_limit_means_no_refusals() {
        let quota = StorageQuota::new(None);
        quota.reserve(u64::MAX / 2).unwrap();
        quota.reserve(u64::MAX / 2).unwrap();
    }
}
