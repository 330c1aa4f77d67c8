//! Dynamic frame group pool
//!
//! A fixed array of group records, all constructed up front, plus a bitmap
//! saying which of them are live. `alloc` hands out the next free slot
//! after the last one handed out, so a just-released slot is not the first
//! one reused.
//!
//! Writers (alloc/release) serialize on a mutex; lookups read an atomic
//! mirror of the bitmap and never block on it.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rtg_common::config::{MULTI_FRAME_ID, MULTI_FRAME_NUM};
use rtg_common::GroupId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

const POOL_SIZE: usize = MULTI_FRAME_NUM as usize;

#[derive(Debug, Default)]
struct PoolState {
    bitmap: u32,
    next: usize,
}

/// Pool of `MULTI_FRAME_NUM` dynamically allocated groups
pub struct GroupRegistry<T> {
    slots: [Arc<T>; POOL_SIZE],
    state: Mutex<PoolState>,
    active: AtomicU32,
}

impl<T> GroupRegistry<T> {
    /// Build every slot record with `make`
    pub fn new(mut make: impl FnMut(GroupId) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| Arc::new(make(GroupId(MULTI_FRAME_ID + i as u32)))),
            state: Mutex::new(PoolState::default()),
            active: AtomicU32::new(0),
        }
    }

    /// Claim a free slot
    pub fn alloc(&self) -> Result<GroupId> {
        let mut state = self.state.lock();

        for i in 0..POOL_SIZE {
            let idx = (state.next + i) % POOL_SIZE;
            if state.bitmap & (1 << idx) == 0 {
                state.bitmap |= 1 << idx;
                state.next = (idx + 1) % POOL_SIZE;
                self.active.store(state.bitmap, Ordering::Release);

                let id = GroupId(MULTI_FRAME_ID + idx as u32);
                debug!(group = %id, "frame group allocated");
                return Ok(id);
            }
        }

        Err(Error::NoFreeGroupSlots)
    }

    /// Reset the slot with `reset` and mark it free, as one step
    ///
    /// The reset runs while the pool lock is held, so a concurrent `alloc`
    /// can never hand out a slot that still carries the previous tenant's
    /// state.
    pub fn release<R>(&self, id: GroupId, reset: impl FnOnce(&T) -> R) -> Result<R> {
        let idx = id.pool_index().ok_or(Error::InvalidGroupId(id))?;
        let mut state = self.state.lock();

        if state.bitmap & (1 << idx) == 0 {
            return Err(Error::InvalidGroupId(id));
        }

        let out = reset(&self.slots[idx]);
        state.bitmap &= !(1 << idx);
        self.active.store(state.bitmap, Ordering::Release);
        debug!(group = %id, "frame group released");
        Ok(out)
    }

    /// The live group behind `id`, if allocated
    pub fn lookup_active(&self, id: GroupId) -> Option<&Arc<T>> {
        let idx = id.pool_index()?;
        (self.active.load(Ordering::Acquire) & (1 << idx) != 0).then(|| &self.slots[idx])
    }

    /// All live groups
    pub fn active(&self) -> impl Iterator<Item = &Arc<T>> {
        let bitmap = self.active.load(Ordering::Acquire);
        self.slots
            .iter()
            .enumerate()
            .filter(move |(i, _)| bitmap & (1 << i) != 0)
            .map(|(_, g)| g)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn capacity(&self) -> usize {
        POOL_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GroupRegistry<Mutex<u32>> {
        GroupRegistry::new(|_| Mutex::new(0))
    }

    #[test]
    fn test_capacity_exhaustion() {
        let reg = registry();
        for _ in 0..MULTI_FRAME_NUM {
            reg.alloc().unwrap();
        }
        assert!(matches!(reg.alloc(), Err(Error::NoFreeGroupSlots)));

        reg.release(GroupId(MULTI_FRAME_ID + 2), |_| ()).unwrap();
        assert_eq!(reg.alloc().unwrap(), GroupId(MULTI_FRAME_ID + 2));
    }

    #[test]
    fn test_rotating_offset() {
        let reg = registry();
        let first = reg.alloc().unwrap();
        reg.release(first, |_| ()).unwrap();

        let second = reg.alloc().unwrap();
        assert_ne!(first, second);
        assert_eq!(second, GroupId(first.0 + 1));
    }

    #[test]
    fn test_lookup_requires_allocation() {
        let reg = registry();
        assert!(reg.lookup_active(GroupId(MULTI_FRAME_ID)).is_none());

        let id = reg.alloc().unwrap();
        assert!(reg.lookup_active(id).is_some());
        assert!(reg.lookup_active(GroupId::DEFAULT).is_none());
        assert_eq!(reg.active().count(), 1);
    }

    #[test]
    fn test_release_resets_under_lock() {
        let reg = registry();
        let id = reg.alloc().unwrap();
        *reg.lookup_active(id).unwrap().lock() = 77;

        let old = reg
            .release(id, |slot| std::mem::take(&mut *slot.lock()))
            .unwrap();
        assert_eq!(old, 77);
        assert!(reg.lookup_active(id).is_none());
        assert_eq!(*reg.slots[0].lock(), 0);
    }

    #[test]
    fn test_double_release_rejected() {
        let reg = registry();
        let id = reg.alloc().unwrap();
        reg.release(id, |_| ()).unwrap();
        assert!(matches!(
            reg.release(id, |_| ()),
            Err(Error::InvalidGroupId(_))
        ));
        assert!(matches!(
            reg.release(GroupId::DEFAULT, |_| ()),
            Err(Error::InvalidGroupId(_))
        ));
    }
}
