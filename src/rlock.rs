//! Reentrant lock for hosts that wrap the single-threaded engine in a
//! multithreaded process. The engine itself never takes this lock.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct Owner {
    holder: Option<ThreadId>,
    count: usize,
}

/// A mutex the owning thread may acquire again without deadlocking.
pub struct ReentrantMutex {
    state: Mutex<Owner>,
    released: Condvar,
}

impl ReentrantMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Owner::default()),
            released: Condvar::new(),
        }
    }

    /// Blocks until the lock is held by the calling thread. Re-acquiring on
    /// the owning thread only increments the hold count.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match state.holder {
                None => {
                    state.holder = Some(me);
                    state.count = 1;
                    return;
                }
                Some(holder) if holder == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Releases one hold. The lock opens to other threads when the count
    /// reaches zero. Releasing from a non-owning thread is a no-op.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.holder != Some(me) {
            return;
        }
        state.count -= 1;
        if state.count == 0 {
            state.holder = None;
            drop(state);
            self.released.notify_one();
        }
    }

    /// Runs `f` while holding the lock.
    pub fn with<T>(&self, f: impl FnOnce() -> T) -> T {
        self.acquire();
        let result = f();
        self.release();
        result
    }

    pub fn is_held(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .holder
            .is_some()
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}
