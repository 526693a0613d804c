use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Default)]
struct RefCountedLock {
    /// Acquisition calls currently holding or waiting on this lock
    ref_count: AtomicUsize,
    /// Holding thread and its recursion depth
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl RefCountedLock {
    fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            let current = *owner;
            match current {
                None => {
                    *owner = Some((me, 1));
                    return;
                }
                Some((thread, depth)) if thread == me => {
                    *owner = Some((thread, depth + 1));
                    return;
                }
                Some(_) => self.released.wait(&mut owner),
            }
        }
    }

    fn is_held_by_current_thread(&self) -> bool {
        matches!(*self.owner.lock(), Some((thread, _)) if thread == thread::current().id())
    }

    /// Returns false when the current thread is not the holder
    fn release(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        let current = *owner;
        match current {
            Some((thread, depth)) if thread == me && depth > 1 => {
                *owner = Some((thread, depth - 1));
                true
            }
            Some((thread, _)) if thread == me => {
                *owner = None;
                self.released.notify_one();
                true
            }
            _ => false,
        }
    }
}

/// Identifiers locked by one call, in acquisition order
pub type HeldLocks = Vec<String>;

/// Mutual exclusion per entity identifier across concurrently running calls.
///
/// Entries are created on demand and dropped once no call holds or waits on them.
#[derive(Default)]
pub struct LockCoordinator {
    locks: Mutex<HashMap<String, Arc<RefCountedLock>>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every id is locked. Ids are taken in sorted order so that
    /// overlapping sets requested by different calls cannot deadlock.
    pub fn lock<S: AsRef<str>>(&self, held: &mut HeldLocks, ids: &[S]) {
        let mut sorted: Vec<&str> = ids.iter().map(|id| id.as_ref()).collect();
        sorted.sort_unstable();

        for id in sorted {
            let lock = {
                let mut locks = self.locks.lock();
                let entry = locks.entry(id.to_string()).or_default();
                entry.ref_count.fetch_add(1, Ordering::SeqCst);
                Arc::clone(entry)
            };

            lock.acquire();
            debug!("locked {}", id);
            held.push(id.to_string());
        }
    }

    /// Releases every lock in `held` and clears it. Never fails.
    pub fn release_all(&self, held: &mut HeldLocks) {
        for id in held.drain(..).rev() {
            self.release(&id);
        }
    }

    fn release(&self, id: &str) {
        let mut locks = self.locks.lock();
        let Some(lock) = locks.get(id).cloned() else {
            warn!("Cannot release lock for {}: no lock registered", id);
            return;
        };
        if !lock.is_held_by_current_thread() {
            warn!("Cannot release lock for {}: not held by the current thread", id);
            return;
        }

        if lock.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            locks.remove(id);
        }
        if lock.release() {
            debug!("released {}", id);
        }
    }

    /// Number of identifiers with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.locks.lock().contains_key(id)
    }

    /// Calls holding or waiting on the lock for `id`
    pub fn holders(&self, id: &str) -> usize {
        self.locks
            .lock()
            .get(id)
            .map_or(0, |lock| lock.ref_count.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_reentrant_lock_released_once_per_acquisition() {
        let coordinator = LockCoordinator::new();
        let mut held = HeldLocks::new();

        coordinator.lock(&mut held, &["b", "a"]);
        coordinator.lock(&mut held, &["a"]);
        assert_eq!(held, vec!["a", "b", "a"]);
        assert_eq!(coordinator.len(), 2);

        coordinator.release_all(&mut held);
        assert!(held.is_empty());
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_release_from_other_thread_is_ignored() {
        let coordinator = Arc::new(LockCoordinator::new());
        let mut held = HeldLocks::new();
        coordinator.lock(&mut held, &["g1"]);

        let other = Arc::clone(&coordinator);
        let mut stolen = held.clone();
        thread::spawn(move || other.release_all(&mut stolen))
            .join()
            .unwrap();

        assert!(coordinator.is_locked("g1"));
        coordinator.release_all(&mut held);
        assert!(!coordinator.is_locked("g1"));
    }

    #[test]
    fn test_second_thread_waits_for_holder() {
        let coordinator = Arc::new(LockCoordinator::new());
        let mut held = HeldLocks::new();
        coordinator.lock(&mut held, &["g1"]);

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let coordinator = Arc::clone(&coordinator);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let mut held = HeldLocks::new();
                coordinator.lock(&mut held, &["g1"]);
                acquired.store(true, Ordering::SeqCst);
                coordinator.release_all(&mut held);
            })
        };

        while coordinator.holders("g1") < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));

        coordinator.release_all(&mut held);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(coordinator.is_empty());
    }
}
