use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub mod object_monitor;
pub mod registry;

/// Test-and-test-and-set spin lock guarding the wait set.
///
/// Critical sections under this lock are a handful of pointer updates and
/// contention is rare (the owner is almost always the only thread touching
/// the wait set), so a blocking lock would be wasted weight here.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        let mut spins = 0u32;
        loop {
            if !self.locked.load(Ordering::Relaxed)
                && self
                    .locked
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            spins += 1;
            if (spins & 0xFF) == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Lossy event counters in the perf-counter role. Updated with relaxed
/// increments; exposed for embedder telemetry and asserted on in tests.
#[derive(Default)]
pub struct MonitorStats {
    pub contended_enters: AtomicUsize,
    pub futile_wakeups: AtomicUsize,
    pub parks: AtomicUsize,
    pub notifications: AtomicUsize,
    pub inflations: AtomicUsize,
    pub deflations: AtomicUsize,
}

impl MonitorStats {
    pub const fn new() -> Self {
        Self {
            contended_enters: AtomicUsize::new(0),
            futile_wakeups: AtomicUsize::new(0),
            parks: AtomicUsize::new(0),
            notifications: AtomicUsize::new(0),
            inflations: AtomicUsize::new(0),
            deflations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_excludes() {
        struct Shared {
            lock: RawSpinLock,
            value: std::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: RawSpinLock::new(),
            value: std::cell::UnsafeCell::new(0),
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        shared.lock.acquire();
                        unsafe {
                            *shared.value.get() += 1;
                        }
                        shared.lock.release();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(unsafe { *shared.value.get() }, 40_000);
    }
}
