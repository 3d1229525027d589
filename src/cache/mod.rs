use lru::LruCache;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Something owning an OS-level handle that can be released on request and
/// reacquired later by its owner.
pub trait Closable: Send + Sync {
    /// Release the handle. Must be safe to call when already closed.
    fn close(&self);
}

/// Bounded pool of open file handles, evicting the least-recently-used
/// holder when the budget is reached.
///
/// Holders are only closed, never dropped: whatever data they already
/// loaded stays with them.
pub struct HandlePool<K: Hash + Eq> {
    budget: usize,
    open: Mutex<LruCache<K, Arc<dyn Closable>>>,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone + Debug> HandlePool<K> {
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            open: Mutex::new(LruCache::unbounded()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Lock the pool for an open operation. Opening a handle while holding
    /// the lease keeps the open count within budget.
    pub fn lease(&self) -> PoolLease<'_, K> {
        PoolLease {
            open: lock(&self.open),
            budget: self.budget,
            evictions: &self.evictions,
        }
    }

    /// Mark `key` as most recently used, if it holds an open handle.
    pub fn touch(&self, key: &K) {
        lock(&self.open).promote(key);
    }

    pub fn is_open(&self, key: &K) -> bool {
        lock(&self.open).contains(key)
    }

    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Close every registered handle.
    pub fn close_all(&self) {
        let mut open = lock(&self.open);
        while let Some((_, holder)) = open.pop_lru() {
            holder.close();
        }
    }
}

/// Exclusive access to the pool while a handle is being opened.
pub struct PoolLease<'a, K: Hash + Eq> {
    open: MutexGuard<'a, LruCache<K, Arc<dyn Closable>>>,
    budget: usize,
    evictions: &'a AtomicU64,
}

impl<K: Hash + Eq + Clone + Debug> PoolLease<'_, K> {
    /// Ensure `key` can hold a handle without exceeding the budget, closing
    /// least-recently-used holders as needed.
    pub fn make_room_for(&mut self, key: &K) {
        if self.open.contains(key) {
            self.open.promote(key);
            return;
        }
        while self.open.len() >= self.budget {
            let Some((victim_key, victim)) = self.open.pop_lru() else {
                break;
            };
            victim.close();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(?victim_key, "closed least-recently-used file handle");
        }
    }

    /// Record that `key` now holds an open handle.
    pub fn register(&mut self, key: K, holder: Arc<dyn Closable>) {
        self.open.push(key, holder);
    }
}

/// Lock a mutex, recovering the data if a holder panicked. Everything kept
/// behind these locks stays consistent between statements.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeHandle {
        open: AtomicBool,
    }

    impl Closable for FakeHandle {
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn open_one(pool: &HandlePool<u32>, key: u32) -> Arc<FakeHandle> {
        let handle = Arc::new(FakeHandle::default());
        let mut lease = pool.lease();
        lease.make_room_for(&key);
        handle.open.store(true, Ordering::SeqCst);
        lease.register(key, handle.clone());
        handle
    }

    #[test]
    fn test_budget_evicts_least_recently_used() {
        let pool = HandlePool::new(2);
        let a = open_one(&pool, 1);
        let b = open_one(&pool, 2);
        pool.touch(&1);
        let c = open_one(&pool, 3);

        assert_eq!(pool.open_count(), 2);
        assert!(a.open.load(Ordering::SeqCst));
        assert!(!b.open.load(Ordering::SeqCst));
        assert!(c.open.load(Ordering::SeqCst));
        assert_eq!(pool.evictions(), 1);
    }

    #[test]
    fn test_reregistering_does_not_evict() {
        let pool = HandlePool::new(1);
        let a = open_one(&pool, 7);
        let again = open_one(&pool, 7);
        assert!(a.open.load(Ordering::SeqCst));
        assert!(again.open.load(Ordering::SeqCst));
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.evictions(), 0);
    }

    #[test]
    fn test_close_all() {
        let pool = HandlePool::new(4);
        let handles: Vec<_> = (0..3).map(|k| open_one(&pool, k)).collect();
        pool.close_all();
        assert_eq!(pool.open_count(), 0);
        assert!(handles.iter().all(|h| !h.open.load(Ordering::SeqCst)));
    }
}
