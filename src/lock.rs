//! Per-key lock manager
//!
//! Workers updating a shared row (a group that several units add members
//! to) serialize on a lock named after that row's key. The manager keeps at
//! most one lock per live key and forgets it once the last claimant has
//! released it, so the map only ever holds keys somebody is using.
//!
//! Managers are scoped per owner type through a [`LockRegistry`] constructed
//! by the caller.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::any::{type_name, TypeId};
use std::sync::Arc;
use tracing::trace;

/// Lock primitive handed out per key
pub type KeyLock = Arc<Mutex<()>>;

struct LockEntry {
    lock: KeyLock,

    /// Claims taken through `get_or_create_lock` and not yet released
    users: usize,
}

/// Hands out one lock per key
pub struct LockManager {
    owner: &'static str,
    locks: DashMap<String, LockEntry>,
}

impl LockManager {
    /// Create an empty manager; `owner` only appears in logs
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            locks: DashMap::new(),
        }
    }

    /// Return the live lock for `key`, registering one if none exists
    ///
    /// Every call takes a claim that must be given back with
    /// [`release_lock`](Self::release_lock).
    pub fn get_or_create_lock(&self, key: &str) -> KeyLock {
        let mut entry = self.locks.entry(key.to_string()).or_insert_with(|| LockEntry {
            lock: Arc::new(Mutex::new(())),
            users: 0,
        });
        entry.users += 1;
        Arc::clone(&entry.lock)
    }

    /// Give up one claim on `key`
    ///
    /// The entry is removed when no claim remains. Releasing an unknown key
    /// is a no-op.
    pub fn release_lock(&self, key: &str) {
        if let Entry::Occupied(mut entry) = self.locks.entry(key.to_string()) {
            let users = &mut entry.get_mut().users;
            *users = users.saturating_sub(1);
            if *users == 0 {
                entry.remove();
                trace!(owner = self.owner, key, "Released last claim on key lock");
            }
        }
    }

    /// Claim and acquire the lock for `key`
    ///
    /// The returned guard unlocks and releases the claim when dropped.
    pub fn lock(&self, key: &str) -> KeyLockGuard<'_> {
        let lock = self.get_or_create_lock(key);
        let guard = lock.lock_arc();
        KeyLockGuard {
            manager: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys with at least one claim
    pub fn live_keys(&self) -> usize {
        self.locks.len()
    }

    /// Claims currently held on `key`
    pub fn users(&self, key: &str) -> usize {
        self.locks.get(key).map(|e| e.users).unwrap_or(0)
    }

    /// Owner name used in logs
    pub fn owner(&self) -> &'static str {
        self.owner
    }
}

/// Exclusive access to one key, released on drop
pub struct KeyLockGuard<'a> {
    manager: &'a LockManager,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock before giving up the claim
        self.guard.take();
        self.manager.release_lock(&self.key);
    }
}

/// Lock managers keyed by owner type
#[derive(Default)]
pub struct LockRegistry {
    managers: DashMap<TypeId, Arc<LockManager>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager for owner type `O`, created on first use
    pub fn manager<O: 'static>(&self) -> Arc<LockManager> {
        let manager = self
            .managers
            .entry(TypeId::of::<O>())
            .or_insert_with(|| Arc::new(LockManager::new(type_name::<O>())));
        Arc::clone(&manager)
    }

    /// Number of managers created so far
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_get_returns_same_lock() {
        let manager = Arc::new(LockManager::new("test"));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.get_or_create_lock("k")
                })
            })
            .collect();

        let locks: Vec<KeyLock> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(Arc::ptr_eq(&locks[0], &locks[1]));
        assert_eq!(manager.users("k"), 2);
    }

    #[test]
    fn test_entry_removed_after_last_release() {
        let manager = LockManager::new("test");

        let first = manager.get_or_create_lock("k");
        let second = manager.get_or_create_lock("k");
        assert!(Arc::ptr_eq(&first, &second));

        manager.release_lock("k");
        assert_eq!(manager.live_keys(), 1);

        // A claimant still holding the lock keeps the same primitive alive
        let third = manager.get_or_create_lock("k");
        assert!(Arc::ptr_eq(&first, &third));

        manager.release_lock("k");
        manager.release_lock("k");
        assert_eq!(manager.live_keys(), 0);

        let fresh = manager.get_or_create_lock("k");
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let manager = LockManager::new("test");
        manager.release_lock("missing");
        assert_eq!(manager.live_keys(), 0);
    }

    #[test]
    fn test_guard_excludes_and_cleans_up() {
        let manager = Arc::new(LockManager::new("test"));
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let guard = manager.lock("group_1");
                        assert_eq!(guard.key(), "group_1");
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        thread::sleep(Duration::from_micros(50));
                        inside.store(false, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(entered.load(Ordering::SeqCst), 160);
        assert_eq!(manager.live_keys(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let manager = LockManager::new("test");
        let a = manager.lock("a");
        let b = manager.lock("b");
        assert_eq!(manager.live_keys(), 2);
        drop(a);
        drop(b);
        assert_eq!(manager.live_keys(), 0);
    }

    #[test]
    fn test_registry_scopes_by_owner() {
        struct GroupImporter;
        struct ReferenceResolver;

        let registry = LockRegistry::new();
        let a = registry.manager::<GroupImporter>();
        let b = registry.manager::<GroupImporter>();
        let c = registry.manager::<ReferenceResolver>();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(a.owner().ends_with("GroupImporter"));
    }
}
