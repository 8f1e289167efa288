//! Lock allocation for containers, pods and volumes.
//!
//! Every entity obtains a lock from a fixed-size pool when it is created and
//! gives it back when it is removed. Entities store only the small integer
//! index of their lock, so records can be persisted and reloaded without
//! holding on to the mutex itself.
//!
//! Lock order when several locks are held at once:
//!
//! 1. pod lock
//! 2. container locks, ascending by lock index
//! 3. volume locks, only while a mount count changes
//!
//! Acquiring in any other order risks an inversion deadlock.

use std::sync::Arc;

use corral_common::{CorralError, CorralResult};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Handle to one lock in the pool.
#[derive(Debug, Clone)]
pub struct LockHandle {
    index: u32,
    mutex: Arc<AsyncMutex<()>>,
}

impl LockHandle {
    /// Index of the lock inside the pool.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Acquire the lock, waiting if another operation holds it.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.mutex).lock_owned().await
    }

    /// Acquire the lock if it is free.
    #[must_use]
    pub fn try_lock(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.mutex).try_lock_owned().ok()
    }
}

#[derive(Debug)]
struct Pool {
    locks: Vec<Arc<AsyncMutex<()>>>,
    allocated: Vec<bool>,
}

/// Fixed-size pool of entity locks indexed by small integers.
#[derive(Debug)]
pub struct LockManager {
    pool: Mutex<Pool>,
}

impl LockManager {
    /// Create a pool with `num_locks` locks.
    #[must_use]
    pub fn new(num_locks: u32) -> Self {
        let size = num_locks as usize;
        Self {
            pool: Mutex::new(Pool {
                locks: (0..size).map(|_| Arc::new(AsyncMutex::new(()))).collect(),
                allocated: vec![false; size],
            }),
        }
    }

    /// Number of locks in the pool.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        u32::try_from(self.pool.lock().locks.len()).unwrap_or(u32::MAX)
    }

    /// Number of locks currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.pool.lock().allocated.iter().filter(|a| **a).count()
    }

    /// Allocate the lowest free lock.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::LocksExhausted`] when every lock is in use.
    pub fn allocate(&self) -> CorralResult<LockHandle> {
        let mut pool = self.pool.lock();
        let index = pool
            .allocated
            .iter()
            .position(|allocated| !allocated)
            .ok_or_else(|| CorralError::LocksExhausted {
                capacity: u32::try_from(pool.locks.len()).unwrap_or(u32::MAX),
            })?;
        pool.allocated[index] = true;
        tracing::trace!(index, "Allocated lock");
        Ok(LockHandle {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            mutex: Arc::clone(&pool.locks[index]),
        })
    }

    /// Mark a specific lock as allocated.
    ///
    /// Used when reloading persisted entities that already own an index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range or already taken.
    pub fn reserve(&self, index: u32) -> CorralResult<LockHandle> {
        let mut pool = self.pool.lock();
        let slot = index as usize;
        match pool.allocated.get(slot) {
            None => Err(CorralError::Config {
                message: format!(
                    "lock index {index} is outside the pool of {} locks",
                    pool.locks.len()
                ),
            }),
            Some(true) => Err(CorralError::Internal {
                message: format!("lock index {index} is already allocated"),
            }),
            Some(false) => {
                pool.allocated[slot] = true;
                Ok(LockHandle {
                    index,
                    mutex: Arc::clone(&pool.locks[slot]),
                })
            }
        }
    }

    /// Retrieve an allocated lock by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is not allocated.
    pub fn retrieve(&self, index: u32) -> CorralResult<LockHandle> {
        let pool = self.pool.lock();
        match pool.allocated.get(index as usize) {
            Some(true) => Ok(LockHandle {
                index,
                mutex: Arc::clone(&pool.locks[index as usize]),
            }),
            _ => Err(CorralError::not_found("lock", index)),
        }
    }

    /// Return a lock to the pool.
    pub fn free(&self, index: u32) {
        let mut pool = self.pool.lock();
        if let Some(slot) = pool.allocated.get_mut(index as usize) {
            *slot = false;
            tracing::trace!(index, "Freed lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_index() {
        let manager = LockManager::new(4);
        let a = manager.allocate().unwrap();
        let b = manager.allocate().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        manager.free(0);
        assert_eq!(manager.allocate().unwrap().index(), 0);
        assert_eq!(manager.allocated(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let manager = LockManager::new(1);
        manager.allocate().unwrap();
        assert!(matches!(
            manager.allocate(),
            Err(CorralError::LocksExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn reserve_rejects_taken_and_out_of_range() {
        let manager = LockManager::new(2);
        manager.reserve(1).unwrap();
        assert!(manager.reserve(1).is_err());
        assert!(manager.reserve(7).is_err());
        assert_eq!(manager.allocate().unwrap().index(), 0);
    }

    #[test]
    fn retrieve_requires_allocation() {
        let manager = LockManager::new(2);
        assert!(manager.retrieve(0).is_err());
        let handle = manager.allocate().unwrap();
        assert_eq!(manager.retrieve(handle.index()).unwrap().index(), 0);
    }

    #[tokio::test]
    async fn same_index_shares_the_mutex() {
        let manager = LockManager::new(2);
        let handle = manager.allocate().unwrap();
        let again = manager.retrieve(handle.index()).unwrap();

        let guard = handle.lock().await;
        assert!(again.try_lock().is_none());
        drop(guard);
        assert!(again.try_lock().is_some());
    }
}
