//! Admission control: a counting semaphore over resource units.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
struct Slots {
    max: Option<usize>,
    used: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounds the total resource cost of in-flight jobs.
///
/// Waiters are woken when units are released; wake-up order is unspecified.
#[derive(Debug, Clone)]
pub struct Admission {
    slots: Arc<Slots>,
}

impl Admission {
    /// `None` means unbounded.
    pub fn new(max: Option<usize>) -> Self {
        Self {
            slots: Arc::new(Slots {
                max,
                used: Mutex::new(0),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn max(&self) -> Option<usize> {
        self.slots.max
    }

    pub fn in_use(&self) -> usize {
        *self.slots.lock()
    }

    /// Whether `units` could ever be admitted.
    pub fn fits(&self, units: usize) -> bool {
        self.slots.max.is_none_or(|max| units <= max)
    }

    /// Block until `units` fit under the bound, then take them.
    ///
    /// Callers must check [`fits`](Self::fits) first; a request larger than the
    /// bound would wait forever.
    pub fn reserve(&self, units: usize) -> Reservation {
        let mut used = self.slots.lock();
        if let Some(max) = self.slots.max {
            while *used + units > max {
                debug!(used = *used, units, max, "Waiting for queue space");
                used = self
                    .slots
                    .freed
                    .wait(used)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        *used += units;
        Reservation {
            slots: Arc::clone(&self.slots),
            units,
        }
    }
}

/// Units held by one job; returned to the pool on drop.
#[derive(Debug)]
pub struct Reservation {
    slots: Arc<Slots>,
    units: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut used = self.slots.lock();
        *used = used.saturating_sub(self.units);
        drop(used);
        self.slots.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reserve_and_release() {
        let admission = Admission::new(Some(4));
        let a = admission.reserve(3);
        assert_eq!(admission.in_use(), 3);
        let b = admission.reserve(1);
        assert_eq!(admission.in_use(), 4);
        drop(a);
        assert_eq!(admission.in_use(), 1);
        drop(b);
        assert_eq!(admission.in_use(), 0);
    }

    #[test]
    fn test_unbounded() {
        let admission = Admission::new(None);
        let _held: Vec<_> = (0..100).map(|_| admission.reserve(10)).collect();
        assert_eq!(admission.in_use(), 1000);
        assert!(admission.fits(usize::MAX));
    }

    #[test]
    fn test_fits() {
        let admission = Admission::new(Some(2));
        assert!(admission.fits(2));
        assert!(!admission.fits(3));
    }

    #[test]
    fn test_reserve_blocks_until_release() {
        let admission = Admission::new(Some(1));
        let held = admission.reserve(1);
        let admitted = Arc::new(AtomicBool::new(false));

        let waiter = {
            let admission = admission.clone();
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let _r = admission.reserve(1);
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));

        drop(held);
        waiter.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        assert_eq!(admission.in_use(), 0);
    }
}
