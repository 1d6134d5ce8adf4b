//! Byte-range locks held through `LockFile`.
//!
//! Locks are exclusive and owned by the handle that took them. Reads and
//! writes through any other handle that touch a locked range fail with
//! `STATUS_FILE_LOCK_CONFLICT`, as do overlapping lock requests.

use std::collections::HashMap;

use oxdokan_core::{DokanError, DokanResult, HandleId, NtStatus};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeLock {
    owner: HandleId,
    offset: u64,
    length: u64,
}

impl RangeLock {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn overlaps(&self, offset: u64, length: u64) -> bool {
        // Zero-length ranges never conflict.
        if self.length == 0 || length == 0 {
            return false;
        }
        self.offset < offset.saturating_add(length) && offset < self.end()
    }
}

/// Lock table keyed by file index.
#[derive(Debug, Default)]
pub struct RangeLocks {
    held: Mutex<HashMap<u64, Vec<RangeLock>>>,
}

impl RangeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, file: u64, owner: HandleId, offset: u64, length: u64) -> DokanResult<()> {
        let mut held = self.held.lock();
        let locks = held.entry(file).or_default();
        if locks.iter().any(|lock| lock.overlaps(offset, length)) {
            return Err(DokanError::Status(NtStatus::FILE_LOCK_CONFLICT));
        }
        locks.push(RangeLock { owner, offset, length });
        trace!(file, %owner, offset, length, "Range locked");
        Ok(())
    }

    /// Release exactly the range `owner` locked.
    pub fn unlock(&self, file: u64, owner: HandleId, offset: u64, length: u64) -> DokanResult<()> {
        let mut held = self.held.lock();
        let wanted = RangeLock { owner, offset, length };
        let Some(locks) = held.get_mut(&file) else {
            return Err(DokanError::Status(NtStatus::RANGE_NOT_LOCKED));
        };
        let Some(position) = locks.iter().position(|lock| *lock == wanted) else {
            return Err(DokanError::Status(NtStatus::RANGE_NOT_LOCKED));
        };
        locks.swap_remove(position);
        if locks.is_empty() {
            held.remove(&file);
        }
        Ok(())
    }

    /// Fail if another handle holds a lock over the range.
    pub fn check(&self, file: u64, owner: HandleId, offset: u64, length: u64) -> DokanResult<()> {
        let held = self.held.lock();
        let conflict = held.get(&file).is_some_and(|locks| {
            locks
                .iter()
                .any(|lock| lock.owner != owner && lock.overlaps(offset, length))
        });
        if conflict {
            Err(DokanError::Status(NtStatus::FILE_LOCK_CONFLICT))
        } else {
            Ok(())
        }
    }

    /// Drop every lock `owner` still holds on `file`; returns how many.
    pub fn release_owner(&self, file: u64, owner: HandleId) -> usize {
        let mut held = self.held.lock();
        let Some(locks) = held.get_mut(&file) else {
            return 0;
        };
        let before = locks.len();
        locks.retain(|lock| lock.owner != owner);
        let released = before - locks.len();
        if locks.is_empty() {
            held.remove(&file);
        }
        released
    }

    /// Forget a deleted file.
    pub fn forget(&self, file: u64) {
        self.held.lock().remove(&file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: HandleId = HandleId::NONE;

    fn handle(raw: u64) -> HandleId {
        HandleId::from_raw(raw)
    }

    #[test]
    fn test_overlapping_lock_conflicts() {
        let locks = RangeLocks::new();
        locks.lock(1, handle(1), 0, 100).unwrap();
        let err = locks.lock(1, handle(2), 50, 10).unwrap_err();
        assert_eq!(err.to_ntstatus(), NtStatus::FILE_LOCK_CONFLICT);
        // Adjacent ranges do not overlap.
        locks.lock(1, handle(2), 100, 10).unwrap();
        // Other files are independent.
        locks.lock(2, handle(2), 0, 100).unwrap();
    }

    #[test]
    fn test_check_ignores_own_locks() {
        let locks = RangeLocks::new();
        locks.lock(7, handle(1), 10, 10).unwrap();
        assert!(locks.check(7, handle(1), 0, 100).is_ok());
        assert!(locks.check(7, handle(2), 0, 10).is_ok());
        assert!(locks.check(7, handle(2), 15, 1).is_err());
        assert!(locks.check(7, A, 19, 5).is_err());
    }

    #[test]
    fn test_unlock_requires_exact_range() {
        let locks = RangeLocks::new();
        locks.lock(1, handle(1), 0, 10).unwrap();
        let err = locks.unlock(1, handle(1), 0, 5).unwrap_err();
        assert_eq!(err.to_ntstatus(), NtStatus::RANGE_NOT_LOCKED);
        assert!(locks.unlock(1, handle(2), 0, 10).is_err());
        locks.unlock(1, handle(1), 0, 10).unwrap();
        assert!(locks.check(1, handle(2), 0, 10).is_ok());
    }

    #[test]
    fn test_release_owner() {
        let locks = RangeLocks::new();
        locks.lock(3, handle(1), 0, 1).unwrap();
        locks.lock(3, handle(1), 5, 1).unwrap();
        locks.lock(3, handle(2), 10, 1).unwrap();
        assert_eq!(locks.release_owner(3, handle(1)), 2);
        assert_eq!(locks.release_owner(3, handle(1)), 0);
        assert!(locks.lock(3, handle(4), 0, 6).is_ok());
    }

    #[test]
    fn test_zero_length_never_conflicts() {
        let locks = RangeLocks::new();
        locks.lock(1, handle(1), 0, 0).unwrap();
        locks.lock(1, handle(2), 0, 0).unwrap();
        locks.lock(1, handle(2), 0, 10).unwrap();
    }
}
