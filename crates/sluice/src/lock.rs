use std::sync::{Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Per-connection ownership lock.
///
/// Unlike a guard-based mutex this is a flag lock: acquisition and release
/// are decoupled, so a stage may return with the lock still held and a
/// different stage's worker releases it later (the handler stage hands held
/// connections to the write-back stage this way).
pub struct ConnLock {
    held: Mutex<bool>,
    cond: Condvar,
}

impl ConnLock {
    pub fn new() -> Self {
        Self { held: Mutex::new(false), cond: Condvar::new() }
    }

    /// Non-blocking acquisition; used by schedulers to skip contended
    /// connections.
    pub fn try_lock(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Blocking acquisition; used when unconditional ownership is required
    /// (connection disposal).
    pub fn lock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self.cond.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
    }

    pub fn unlock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        drop(held);
        self.cond.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide quiesce point. Pick scans hold the shared side; the recycle
/// stage takes the exclusive side so connections are only destroyed while no
/// scheduler can hand them out.
pub struct QuiesceLock {
    inner: RwLock<()>,
}

impl QuiesceLock {
    pub fn new() -> Self {
        Self { inner: RwLock::new(()) }
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for QuiesceLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = ConnLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
    }

    #[test]
    fn unlock_from_another_thread_wakes_blocked_locker() {
        let lock = Arc::new(ConnLock::new());
        assert!(lock.try_lock());

        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                lock.unlock();
            })
        };

        lock.lock();
        assert!(lock.is_held());
        releaser.join().expect("releaser panicked");
        lock.unlock();
    }
}
