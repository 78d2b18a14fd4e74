//! Counting semaphore bounding how many batch windows are in flight to the bus,
//! and a turnstile putting their sends in window order.
//!
//! `Mutex + Condvar` from std. A poisoned lock only means a sender thread
//! panicked; the permit count itself stays consistent, so it is recovered.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

/// Held for the lifetime of one in-flight window; releases its permit on drop.
pub struct Permit<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is free, then take it.
    pub fn acquire(&self) -> Permit<'_> {
        let mut free = self.lock();
        while *free == 0 {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= 1;
        Permit(self)
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        *self.lock()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.0.lock() += 1;
        self.0.released.notify_one();
    }
}

/// Lets callers through one at a time in ascending id order.
///
/// Every id from 0 up must eventually take its turn, or later ids wait forever.
pub struct Turnstile {
    next: Mutex<usize>,
    turned: Condvar,
}

impl Turnstile {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(0),
            turned: Condvar::new(),
        }
    }

    /// Block until every id below `id` has passed, then pass.
    pub fn wait_turn(&self, id: usize) {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        while *next != id {
            next = self
                .turned
                .wait(next)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *next += 1;
        drop(next);
        self.turned.notify_all();
    }
}

impl Default for Turnstile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn permits_return_on_drop() {
        let sem = Semaphore::new(2);
        let first = sem.acquire();
        let _second = sem.acquire();
        assert_eq!(sem.available(), 0);
        drop(first);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn acquire_waits_for_release() {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.acquire();

        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || {
                let _permit = sem.acquire();
                "acquired"
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.join().unwrap(), "acquired");
    }

    #[test]
    fn every_turn_waits_for_zero() {
        let turns = Arc::new(Turnstile::new());
        let waiters: Vec<_> = (1..5)
            .rev()
            .map(|id| {
                let turns = turns.clone();
                std::thread::spawn(move || turns.wait_turn(id))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        assert!(waiters.iter().all(|w| !w.is_finished()));
        turns.wait_turn(0);
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn later_turn_waits_for_earlier() {
        let turns = Arc::new(Turnstile::new());
        let second = {
            let turns = turns.clone();
            std::thread::spawn(move || turns.wait_turn(1))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());
        turns.wait_turn(0);
        second.join().unwrap();
    }
}
