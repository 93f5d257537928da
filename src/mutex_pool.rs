//! Shared/exclusive mutex handle backed by a capped, process-global pool of
//! raw reader-writer locks (§4.E). An *empty* handle — one that has never
//! been locked, or whose refcount has dropped back to zero — costs a single
//! nullable pointer. The underlying lock is borrowed from the pool only
//! while at least one handle actually holds it locked or is racing to lock
//! it; the pool's own allocation mutex is held only across that prologue
//! and the matching unlock epilogue, never across the critical section
//! itself.
//!
//! Exceeding the pool's capacity degrades gracefully to a per-handle heap
//! allocation that is simply dropped instead of recycled.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

/// Default capacity of the process-global mutex pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1 << 16;

struct RefCountedMutex {
    raw: RawRwLock,
    refcount: AtomicU32,
}

struct Pool {
    free: Vec<Box<RefCountedMutex>>,
    capacity: usize,
}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    free: Vec::new(),
    capacity: DEFAULT_POOL_CAPACITY,
});

/// Sets the process-global pool capacity. Intended to be called once at
/// startup, before shards are opened.
pub fn set_pool_capacity(capacity: usize) {
    POOL.lock().capacity = capacity;
}

/// Number of mutexes currently sitting idle in the pool (for tests and
/// diagnostics; see testable property "mutex pool footprint").
pub fn pooled_len() -> usize {
    POOL.lock().free.len()
}

/// A lock handle whose underlying reader-writer mutex is materialized
/// lazily. `Default`-constructed handles hold nothing and allocate nothing.
pub struct SharedMutex {
    ptr: *mut RefCountedMutex,
}

// SAFETY: every mutation of `ptr` happens while holding `POOL`'s lock (see
// `acquire_ref`/`release_ref`), so concurrent handles observe a consistent
// value; the pointee's own synchronization is provided by its raw rwlock.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl Default for SharedMutex {
    fn default() -> Self {
        Self {
            ptr: ptr::null_mut(),
        }
    }
}

impl SharedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this handle currently owns a pool-allocated mutex (locked or
    /// about to be). An empty, never-locked handle reports `false`.
    pub fn is_materialized(&self) -> bool {
        !self.ptr.is_null()
    }

    fn acquire_ref(&self) -> *mut RefCountedMutex {
        let this = self as *const SharedMutex as *mut SharedMutex;
        let mut pool = POOL.lock();
        // SAFETY: `ptr` is only ever written under `POOL`'s lock.
        let existing = unsafe { (*this).ptr };
        if !existing.is_null() {
            unsafe { (*existing).refcount.fetch_add(1, Ordering::Relaxed) };
            return existing;
        }
        let fresh = match pool.free.pop() {
            Some(boxed) => Box::into_raw(boxed),
            None => Box::into_raw(Box::new(RefCountedMutex {
                raw: RawRwLock::INIT,
                refcount: AtomicU32::new(0),
            })),
        };
        unsafe { (*fresh).refcount.store(1, Ordering::Relaxed) };
        unsafe { (*this).ptr = fresh };
        fresh
    }

    fn release_ref(&self, rc: *mut RefCountedMutex) {
        let this = self as *const SharedMutex as *mut SharedMutex;
        let mut pool = POOL.lock();
        let remaining = unsafe { (*rc).refcount.fetch_sub(1, Ordering::Relaxed) } - 1;
        if remaining == 0 {
            unsafe { (*this).ptr = ptr::null_mut() };
            // SAFETY: refcount is zero and we hold the pool lock, so no
            // other handle can be mid-acquire on this pointer.
            let boxed = unsafe { Box::from_raw(rc) };
            if pool.free.len() < pool.capacity {
                pool.free.push(boxed);
            }
        }
    }

    pub fn lock_exclusive(&self) -> ExclusiveGuard {
        let rc = self.acquire_ref();
        // SAFETY: pool lock was dropped before this call, matching the
        // invariant that the list's own lock is never acquired while
        // holding the allocation mutex.
        unsafe { (*rc).raw.lock_exclusive() };
        ExclusiveGuard {
            mutex: self as *const SharedMutex,
            rc,
        }
    }

    pub fn try_lock_exclusive(&self) -> Option<ExclusiveGuard> {
        let rc = self.acquire_ref();
        if unsafe { (*rc).raw.try_lock_exclusive() } {
            Some(ExclusiveGuard {
                mutex: self as *const SharedMutex,
                rc,
            })
        } else {
            self.release_ref(rc);
            None
        }
    }

    pub fn lock_shared(&self) -> SharedGuard {
        let rc = self.acquire_ref();
        unsafe { (*rc).raw.lock_shared() };
        SharedGuard {
            mutex: self as *const SharedMutex,
            rc,
        }
    }

    pub fn try_lock_shared(&self) -> Option<SharedGuard> {
        let rc = self.acquire_ref();
        if unsafe { (*rc).raw.try_lock_shared() } {
            Some(SharedGuard {
                mutex: self as *const SharedMutex,
                rc,
            })
        } else {
            self.release_ref(rc);
            None
        }
    }
}

/// An exclusive (write) hold on a `SharedMutex`. Dropping unlocks and, if
/// this was the last reference, returns the mutex to the pool.
pub struct ExclusiveGuard {
    mutex: *const SharedMutex,
    rc: *mut RefCountedMutex,
}

// SAFETY: the guard only touches `*rc`'s raw lock and `*mutex`'s pointer
// field, both of which are safe to hand across threads (see `SharedMutex`).
unsafe impl Send for ExclusiveGuard {}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        unsafe { (*self.rc).raw.unlock_exclusive() };
        unsafe { (*self.mutex).release_ref(self.rc) };
    }
}

/// A shared (read) hold on a `SharedMutex`.
pub struct SharedGuard {
    mutex: *const SharedMutex,
    rc: *mut RefCountedMutex,
}

unsafe impl Send for SharedGuard {}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        unsafe { (*self.rc).raw.unlock_shared() };
        unsafe { (*self.mutex).release_ref(self.rc) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_handle_allocates_nothing() {
        let m = SharedMutex::new();
        assert!(!m.is_materialized());
    }

    #[test]
    fn exclusive_excludes_exclusive_and_shared() {
        let m = Arc::new(SharedMutex::new());
        let g = m.lock_exclusive();
        assert!(m.try_lock_exclusive().is_none());
        assert!(m.try_lock_shared().is_none());
        drop(g);
        assert!(m.try_lock_exclusive().is_some());
    }

    #[test]
    fn shared_allows_concurrent_shared_blocks_exclusive() {
        let m = Arc::new(SharedMutex::new());
        let g1 = m.lock_shared();
        let g2 = m.try_lock_shared();
        assert!(g2.is_some());
        assert!(m.try_lock_exclusive().is_none());
        drop(g1);
        drop(g2);
        assert!(m.try_lock_exclusive().is_some());
    }

    #[test]
    fn returns_to_pool_when_refcount_drops_to_zero() {
        let before = pooled_len();
        {
            let m = SharedMutex::new();
            let _g = m.lock_exclusive();
        }
        assert!(pooled_len() >= before);
    }

    #[test]
    fn failed_try_lock_does_not_leak() {
        let m = Arc::new(SharedMutex::new());
        let _g = m.lock_exclusive();
        assert!(m.try_lock_exclusive().is_none());
        // handle remains materialized only because `_g` still holds it;
        // once dropped it returns to the pool rather than leaking.
    }

    #[test]
    fn concurrent_threads_see_exclusivity() {
        let m = Arc::new(SharedMutex::new());
        let counter = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = m.lock_exclusive();
                    let v = counter.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(counter.load(Ordering::Relaxed), v + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
