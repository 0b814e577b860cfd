//! Process-wide monitor bookkeeping: the weak-handle arena tying monitors
//! to their objects, the in-use and free monitor lists, inflation of
//! neutral headers and the background deflation scavenge.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    objectmodel::{header::HeaderWord, ObjectRef},
    runtime::{options::MonitorTunables, threads::Thread, VmThread},
    sync::{object_monitor::ObjectMonitor, MonitorStats},
    Runtime, ThreadOf,
};

/// One weak reference cell. The embedder's GC clears dead slots; a cleared
/// slot makes the owning monitor eligible for the uncontested deflation
/// path.
pub struct WeakSlot {
    value: AtomicUsize,
}

impl WeakSlot {
    fn new(obj: ObjectRef) -> Self {
        Self {
            value: AtomicUsize::new(obj.to_raw_address().as_ptr() as usize),
        }
    }

    pub fn peek(&self) -> Option<ObjectRef> {
        NonNull::new(self.value.load(Ordering::Acquire) as *mut u8)
            .map(|p| unsafe { ObjectRef::from_raw_address(p) })
    }

    /// GC hook: break the association with a dead object.
    pub fn clear(&self) {
        self.value.store(0, Ordering::Release);
    }

    fn set(&self, obj: ObjectRef) {
        self.value
            .store(obj.to_raw_address().as_ptr() as usize, Ordering::Release);
    }

    fn as_mut_ptr(&'static self) -> *mut WeakSlot {
        self as *const WeakSlot as *mut WeakSlot
    }
}

/// Arena of weak slots. Slots have stable addresses for the monitors that
/// point at them and are recycled through a free list, never deallocated.
pub struct WeakHandleStorage {
    slots: Mutex<Vec<&'static WeakSlot>>,
    free: Mutex<Vec<&'static WeakSlot>>,
}

impl WeakHandleStorage {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    fn allocate(&self, obj: ObjectRef) -> &'static WeakSlot {
        if let Some(slot) = self.free.lock().pop() {
            slot.set(obj);
            return slot;
        }
        let slot: &'static WeakSlot = Box::leak(Box::new(WeakSlot::new(obj)));
        self.slots.lock().push(slot);
        slot
    }

    fn release(&self, slot: &'static WeakSlot) {
        slot.clear();
        self.free.lock().push(slot);
    }

    /// Visit every live slot. The embedder's GC walks this to clear
    /// references to dead objects.
    pub fn for_each(&self, mut f: impl FnMut(&WeakSlot)) {
        for slot in self.slots.lock().iter() {
            f(slot);
        }
    }
}

impl Default for WeakHandleStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of all monitor storage for one runtime. Monitors are leaked boxes
/// (type-stable memory): a stale pointer read from an object header always
/// lands on a monitor, in the worst case a deflated one whose negative
/// contentions count sends the reader back to the header.
///
/// Reuse of free-listed monitors must be coordinated with the embedder's
/// scavenge cadence so that no thread still holds a monitor pointer from
/// before the deflation that freed it (the original brackets this with a
/// thread handshake).
pub struct MonitorRegistry<R: Runtime> {
    tunables: MonitorTunables,
    stats: MonitorStats,
    weak_storage: WeakHandleStorage,
    in_use: Mutex<Vec<&'static ObjectMonitor<R>>>,
    free: Mutex<Vec<&'static ObjectMonitor<R>>>,
}

impl<R: Runtime> MonitorRegistry<R> {
    pub fn new(tunables: MonitorTunables) -> Self {
        Self {
            tunables,
            stats: MonitorStats::new(),
            weak_storage: WeakHandleStorage::new(),
            in_use: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn tunables(&self) -> &MonitorTunables {
        &self.tunables
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn weak_storage(&self) -> &WeakHandleStorage {
        &self.weak_storage
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    fn allocate_monitor(&self) -> &'static ObjectMonitor<R> {
        if let Some(m) = self.free.lock().pop() {
            return m;
        }
        Box::leak(Box::new(ObjectMonitor::new()))
    }

    /// Resolve the monitor currently installed for `obj`, if any. The
    /// result may already be mid-deflation; `enter` reports that as RETRY.
    pub fn monitor_of(&self, obj: ObjectRef) -> Option<&'static ObjectMonitor<R>> {
        let mark = obj.mark();
        if mark.has_monitor() {
            Some(unsafe { &*mark.monitor::<R>() })
        } else {
            None
        }
    }

    /// Install a monitor for `obj`, inflating a neutral header if needed.
    /// Fast-path lock states (stack locks) are the embedder's to convert
    /// before calling in here.
    pub fn inflate(&self, current: VmThread, obj: ObjectRef) -> &'static ObjectMonitor<R> {
        loop {
            let mark = obj.mark();
            if mark.has_monitor() {
                return unsafe { &*mark.monitor::<R>() };
            }
            assert!(
                mark.is_neutral(),
                "inflation requires a neutral or monitor header"
            );

            let m = self.allocate_monitor();
            let slot = self.weak_storage.allocate(obj);
            m.prepare(mark, slot.as_mut_ptr());

            if obj.cas_set_mark(HeaderWord::encode_monitor(m), mark) == mark {
                self.in_use.lock().push(m);
                MonitorStats::bump(&self.stats.inflations);
                log::trace!(
                    target: "objsync::inflation",
                    "thread {} inflated object {:p} into monitor {:p}",
                    ThreadOf::<R>::id(current),
                    obj.to_raw_address(),
                    m
                );
                return m;
            }

            // Another thread installed a monitor first; recycle ours.
            self.weak_storage.release(slot);
            m.clear_object();
            self.free.lock().push(m);
        }
    }

    /// Acquire the monitor for `obj`, re-resolving through the header for
    /// as long as deflation races the acquisition.
    pub fn enter(&self, current: VmThread, obj: ObjectRef) -> &'static ObjectMonitor<R> {
        loop {
            let m = self.inflate(current, obj);
            if m.enter(current) {
                return m;
            }
        }
    }

    /// Release the monitor for `obj`. The header must still carry one: an
    /// owned monitor is busy and cannot have been deflated.
    pub fn exit(&self, current: VmThread, obj: ObjectRef) {
        let m = self
            .monitor_of(obj)
            .expect("exiting an object with no monitor installed");
        m.exit(current, true);
    }

    /// One scavenge pass: deflate every idle monitor, unlink it from the
    /// in-use list and recycle it. Returns the number deflated.
    pub fn deflate_idle_monitors(&self) -> usize {
        let mut deflated = 0;
        let mut in_use = self.in_use.lock();
        in_use.retain(|&m| {
            if m.deflate() {
                let slot = m.object_slot();
                if !slot.is_null() {
                    self.weak_storage.release(unsafe { &*slot });
                }
                m.clear_object();
                self.free.lock().push(m);
                deflated += 1;
                false
            } else {
                true
            }
        });
        if deflated > 0 {
            log::debug!(
                target: "objsync::deflation",
                "scavenge deflated {} monitor(s), {} in use",
                deflated,
                in_use.len()
            );
        }
        deflated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockObject, MockVM};
    use crate::sync::object_monitor::Owner;
    use std::sync::Arc;
    use std::time::Duration;

    // The MockVM registry is process-global and the harness runs tests in
    // parallel, so every test that scavenges or counts takes this lock.
    static SCAVENGE_LOCK: Mutex<()> = Mutex::new(());

    fn registry() -> &'static MonitorRegistry<MockVM> {
        let _ = env_logger::builder().is_test(true).try_init();
        MockVM::registry()
    }

    #[test]
    fn inflate_installs_monitor() {
        let _guard = SCAVENGE_LOCK.lock();
        let current = mock::attach_current_thread();
        let obj = MockObject::new(0x1234);

        assert!(registry().monitor_of(obj.object_ref()).is_none());
        let m = registry().inflate(current, obj.object_ref());
        assert!(obj.object_ref().mark().has_monitor());
        assert_eq!(m.header().hash(), 0x1234);
        assert_eq!(m.object_peek(), Some(obj.object_ref()));

        // Idempotent: a second inflate resolves to the same monitor.
        let m2 = registry().inflate(current, obj.object_ref());
        assert!(std::ptr::eq(m, m2));
    }

    #[test]
    fn deflate_restores_header_and_recycles() {
        let _guard = SCAVENGE_LOCK.lock();
        let current = mock::attach_current_thread();
        let obj = MockObject::new(0xfeed);

        let m = registry().enter(current, obj.object_ref());
        // Held monitors survive the scavenge.
        registry().deflate_idle_monitors();
        assert!(!m.is_being_async_deflated());
        assert!(obj.object_ref().mark().has_monitor());
        m.exit(current, true);

        // Idle now; the scavenge reclaims it and restores the header.
        assert!(registry().deflate_idle_monitors() >= 1);
        let mark = obj.object_ref().mark();
        assert!(mark.is_neutral());
        assert_eq!(mark.hash(), 0xfeed);
        assert!(m.is_being_async_deflated());
        assert_eq!(m.owner_raw(), Owner::Deflater);
    }

    #[test]
    fn enter_retries_after_deflation_race() {
        let _guard = SCAVENGE_LOCK.lock();
        let current = mock::attach_current_thread();
        let obj = MockObject::new(0xabc);

        let stale = registry().inflate(current, obj.object_ref());
        // Deflation commits while a thread still holds the stale pointer.
        assert!(stale.deflate());
        assert!(!stale.enter(current));
        assert!(obj.object_ref().mark().is_neutral());

        // The retry loop resolves a fresh monitor through the header.
        let m = registry().enter(current, obj.object_ref());
        assert!(m.is_owner(current));
        assert!(obj.object_ref().mark().has_monitor());
        m.exit(current, true);
    }

    #[test]
    fn dead_object_monitor_is_scavenged() {
        let _guard = SCAVENGE_LOCK.lock();
        let current = mock::attach_current_thread();
        let obj = MockObject::new(0x77);

        let m = registry().inflate(current, obj.object_ref());
        // Simulate GC clearing the weak reference.
        unsafe { &*m.object_slot() }.clear();
        assert!(m.object_peek().is_none());

        assert!(registry().deflate_idle_monitors() >= 1);
        assert!(m.is_being_async_deflated());
        // The dead object's header is left alone.
        assert!(obj.object_ref().mark().has_monitor());
    }

    #[test]
    fn mutual_exclusion_under_deflation_pressure() {
        const THREADS: usize = 4;
        const ITERS: usize = 300;

        struct Shared {
            obj: MockObject,
            value: std::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let _guard = SCAVENGE_LOCK.lock();
        let _ = mock::attach_current_thread();
        let shared = Arc::new(Shared {
            obj: MockObject::new(0x5a5a),
            value: std::cell::UnsafeCell::new(0),
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let me = mock::attach_current_thread();
                    for _ in 0..ITERS {
                        let m = registry().enter(me, shared.obj.object_ref());
                        unsafe {
                            *shared.value.get() += 1;
                        }
                        m.exit(me, true);
                    }
                })
            })
            .collect();

        // Scavenge aggressively while the workers hammer the same object.
        // A single contended object keeps recycled monitors bound to it, so
        // reuse cannot alias another object mid-race.
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let deflater = {
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    registry().deflate_idle_monitors();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        deflater.join().unwrap();

        assert_eq!(unsafe { *shared.value.get() }, THREADS * ITERS);
    }
}
