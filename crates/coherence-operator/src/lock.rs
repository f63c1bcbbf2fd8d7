//! Non-blocking per-resource locks, so a resource is never reconciled twice at the same time.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::store::ObjectKey;

#[derive(Clone, Debug, Default)]
pub struct ResourceLocks {
    held: Arc<Mutex<HashSet<ObjectKey>>>,
}

impl ResourceLocks {
    /// Takes the lock for `key`, or returns `None` right away if it is already held.
    pub fn try_lock(&self, key: &ObjectKey) -> Option<ResourceLockGuard> {
        if self.held().insert(key.clone()) {
            Some(ResourceLockGuard {
                locks: self.clone(),
                key: key.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, key: &ObjectKey) -> bool {
        self.held().contains(key)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<ObjectKey>> {
        // The set stays consistent even if a holder panicked, insert and remove are atomic.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct ResourceLockGuard {
    locks: ResourceLocks,
    key: ObjectKey,
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.key);
        tracing::trace!(resource = %self.key, "released reconcile lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_key_fails() {
        let locks = ResourceLocks::default();
        let key = ObjectKey::new("grid", "storage");

        let guard = locks.try_lock(&key);
        assert!(guard.is_some());
        assert!(locks.try_lock(&key).is_none());
        assert!(locks.try_lock(&ObjectKey::new("grid", "proxy")).is_some());

        drop(guard);
        assert!(!locks.is_locked(&key));
        assert!(locks.try_lock(&key).is_some());
    }

    #[test]
    fn clones_share_state() {
        let locks = ResourceLocks::default();
        let key = ObjectKey::new("grid", "storage");

        let _guard = locks.clone().try_lock(&key).unwrap();

        assert!(locks.is_locked(&key));
    }
}
