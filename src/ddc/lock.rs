//! Per display serialization
//!
//! A display's bus can only carry one DDC/CI exchange at a time, interleaved
//! requests corrupt each other's replies. Every display handle gets one lock,
//! created on first use and kept for the lifetime of the registry.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, PoisonError, RwLock},
};

use super::resolver::DisplayHandle;

/// Binary semaphore guarding one display.
#[derive(Debug, Default)]
pub struct DisplayLock {
    busy: Mutex<bool>,
    released: Condvar,
}

impl DisplayLock {
    fn acquire(self: &Arc<Self>) -> DisplayToken {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while *busy {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *busy = true;
        DisplayToken {
            lock: Arc::clone(self),
        }
    }

    fn release(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_one();
    }
}

/// Exclusive access to one display, released on drop.
#[derive(Debug)]
#[must_use = "the display is released as soon as the token is dropped"]
pub struct DisplayToken {
    lock: Arc<DisplayLock>,
}

impl Drop for DisplayToken {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[derive(Debug, Default)]
pub struct DisplayLockRegistry {
    locks: RwLock<HashMap<DisplayHandle, Arc<DisplayLock>>>,
}

impl DisplayLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, display: DisplayHandle) -> Arc<DisplayLock> {
        if let Some(lock) = self
            .locks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&display)
        {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(display).or_default())
    }

    /// block until `display` is free and take it
    pub fn acquire(&self, display: DisplayHandle) -> DisplayToken {
        self.lock_for(display).acquire()
    }

    pub fn release(&self, token: DisplayToken) {
        drop(token)
    }

    /// number of displays that have been locked at least once
    #[cfg(test)]
    fn known_displays(&self) -> usize {
        self.locks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
