//! The contended core of per-object monitors.
//!
//! Threads acquire ownership by CAS-ing the owner word from `None` to their
//! identity. Contenders push themselves onto the `cxq` with CAS and then
//! spin or park; an exiting thread drains the `cxq` into the owner-private
//! `entry_list`, elects an heir presumptive and unparks it. Succession is
//! competitive: the exiting thread releases ownership and wakes a successor,
//! it never hands the lock over directly. Waiting threads live on the
//! circular `wait_set`; notify only transfers them to the contention queues,
//! the unpark happens at the notifier's exit.
//!
//! A thread appears on at most one of `cxq`, `entry_list`, `wait_set` at any
//! moment. Only the owner may detach the `cxq` or touch the `entry_list`
//! interior; the `cxq` tolerates multiple concurrent pushers.
//!
//! Idle monitors are reclaimed concurrently with acquirers by the two-step
//! deflation handshake: owner `None -> Deflater`, then `contentions
//! 0 -> i32::MIN`. A contender that raced the handshake either cancels it
//! (owner `Deflater -> self` plus a balancing contentions increment) or
//! observes the committed negative count, restores the object header and
//! retries against the header.

use std::{
    marker::PhantomData,
    sync::atomic::{
        fence, AtomicBool, AtomicI32, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering,
    },
};

use atomic::Atomic;

use crate::{
    objectmodel::{header::HeaderWord, ObjectRef},
    runtime::{options::MonitorTunables, threads::Thread, VmThread},
    sync::{registry::WeakSlot, MonitorStats, RawSpinLock},
    Runtime, ThreadOf,
};

const NO_OWNER: usize = 0;
/// Sentinel owner word marking an in-progress deflation handshake.
const DEFLATER_MARKER: usize = usize::MAX;
/// Sentinel for the `succ` and `responsible` identity hints.
pub const NO_TID: u64 = u64::MAX;

const MIN_RECHECK_INTERVAL_MS: u64 = 1;

/// Everything that may sit in the monitor owner word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Owner {
    None,
    Thread(u64),
    /// A fast-lock stack slot address. Produced by the embedder's
    /// lightweight locking during inflation, never by this crate; any such
    /// value keeps the monitor busy.
    StackLock(usize),
    Deflater,
}

impl Owner {
    pub fn encode(self) -> usize {
        match self {
            Owner::None => NO_OWNER,
            Owner::Deflater => DEFLATER_MARKER,
            Owner::Thread(id) => ((id as usize) << 1) | 1,
            Owner::StackLock(addr) => {
                debug_assert!(addr != NO_OWNER && (addr & 1) == 0);
                addr
            }
        }
    }

    pub fn decode(word: usize) -> Self {
        if word == NO_OWNER {
            Owner::None
        } else if word == DEFLATER_MARKER {
            Owner::Deflater
        } else if word & 1 != 0 {
            Owner::Thread((word >> 1) as u64)
        } else {
            Owner::StackLock(word)
        }
    }

    fn of<R: Runtime>(thread: VmThread) -> Self {
        Owner::Thread(ThreadOf::<R>::id(thread))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TryLockResult {
    Success,
    HasOwner,
    /// The owner word was free but the CAS lost to another thread.
    Interference,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MonitorError {
    /// `exit`, `wait` or `notify` issued by a thread that does not own the
    /// monitor.
    NotOwner,
    /// `wait` observed a pending interrupt.
    Interrupted,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum WaiterState {
    Run = 0,
    Cxq = 1,
    Enter = 2,
    Wait = 3,
}

unsafe impl bytemuck::NoUninit for WaiterState {}

/// Per-blocked-thread queue node. Stack-allocated by the blocked thread;
/// other threads reach it through the monitor lists but never own it.
pub struct ObjectWaiter {
    next: AtomicPtr<ObjectWaiter>,
    prev: AtomicPtr<ObjectWaiter>,
    thread: VmThread,
    notifier_tid: AtomicU64,
    saved_recursions: AtomicIsize,
    state: Atomic<WaiterState>,
    notified: AtomicBool,
    is_wait: bool,
}

impl ObjectWaiter {
    pub fn new(thread: VmThread) -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            prev: AtomicPtr::new(std::ptr::null_mut()),
            thread,
            notifier_tid: AtomicU64::new(NO_TID),
            saved_recursions: AtomicIsize::new(0),
            state: Atomic::new(WaiterState::Run),
            notified: AtomicBool::new(false),
            is_wait: false,
        }
    }

    fn new_wait(thread: VmThread) -> Self {
        Self {
            is_wait: true,
            state: Atomic::new(WaiterState::Wait),
            ..Self::new(thread)
        }
    }

    pub fn state(&self) -> WaiterState {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: WaiterState) {
        self.state.store(state, Ordering::Release);
    }

    pub fn was_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub fn notifier_tid(&self) -> u64 {
        self.notifier_tid.load(Ordering::Relaxed)
    }

    pub fn is_wait(&self) -> bool {
        self.is_wait
    }

    fn as_ptr(&self) -> *mut ObjectWaiter {
        self as *const ObjectWaiter as *mut ObjectWaiter
    }
}

/// One inflated monitor. Bound to an object by the registry at inflation
/// time and unbound again by a successful [`deflate`](Self::deflate).
pub struct ObjectMonitor<R: Runtime> {
    /// Displaced (neutral) mark word of the associated object, raw.
    header: AtomicUsize,
    /// Weak handle slot; the embedder's GC may clear it. Null while the
    /// monitor sits on the free list.
    object: AtomicPtr<WeakSlot>,
    owner: AtomicUsize,
    /// Identity of the previous owner, recorded on non-suspended exit for
    /// event reporting.
    previous_owner_tid: AtomicU64,
    recursions: AtomicIsize,
    entry_list: AtomicPtr<ObjectWaiter>,
    cxq: AtomicPtr<ObjectWaiter>,
    succ: AtomicU64,
    responsible: AtomicU64,
    spin_duration: AtomicI32,
    /// Positive: threads racing through enter/exit. `i32::MIN`-based
    /// negative: deflation has committed and the monitor is terminal.
    contentions: AtomicI32,
    wait_set: AtomicPtr<ObjectWaiter>,
    waiters: AtomicI32,
    wait_set_lock: RawSpinLock,
    marker: PhantomData<R>,
}

impl<R: Runtime> ObjectMonitor<R> {
    pub fn new() -> Self {
        Self {
            header: AtomicUsize::new(0),
            object: AtomicPtr::new(std::ptr::null_mut()),
            owner: AtomicUsize::new(NO_OWNER),
            previous_owner_tid: AtomicU64::new(NO_TID),
            recursions: AtomicIsize::new(0),
            entry_list: AtomicPtr::new(std::ptr::null_mut()),
            cxq: AtomicPtr::new(std::ptr::null_mut()),
            succ: AtomicU64::new(NO_TID),
            responsible: AtomicU64::new(NO_TID),
            spin_duration: AtomicI32::new(0),
            contentions: AtomicI32::new(0),
            wait_set: AtomicPtr::new(std::ptr::null_mut()),
            waiters: AtomicI32::new(0),
            wait_set_lock: RawSpinLock::new(),
            marker: PhantomData,
        }
    }

    fn tunables(&self) -> &'static MonitorTunables {
        R::registry().tunables()
    }

    fn stats(&self) -> &'static MonitorStats {
        R::registry().stats()
    }

    // ------------------------------------------------------------------
    // Field access

    pub fn header(&self) -> HeaderWord {
        HeaderWord::from_raw(self.header.load(Ordering::Relaxed))
    }

    pub(crate) fn object_slot(&self) -> *mut WeakSlot {
        self.object.load(Ordering::Acquire)
    }

    pub fn object_peek(&self) -> Option<ObjectRef> {
        let slot = self.object_slot();
        if slot.is_null() {
            None
        } else {
            unsafe { (*slot).peek() }
        }
    }

    pub fn owner_raw(&self) -> Owner {
        Owner::decode(self.owner.load(Ordering::Acquire))
    }

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub fn contentions(&self) -> i32 {
        self.contentions.load(Ordering::SeqCst)
    }

    pub fn waiters(&self) -> i32 {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn previous_owner_tid(&self) -> u64 {
        self.previous_owner_tid.load(Ordering::Relaxed)
    }

    pub fn spin_duration(&self) -> i32 {
        self.spin_duration.load(Ordering::Relaxed)
    }

    pub fn is_owner(&self, thread: VmThread) -> bool {
        self.owner_raw() == Owner::of::<R>(thread)
    }

    /// Conservative busy test used by the deflater's quick check. May report
    /// busy for a monitor that is already idle again; never the reverse.
    pub fn is_busy(&self) -> bool {
        let owner = self.owner_raw();
        self.contentions() > 0
            || self.waiters() != 0
            || !(owner == Owner::None || owner == Owner::Deflater)
            || !self.cxq.load(Ordering::Relaxed).is_null()
            || !self.entry_list.load(Ordering::Relaxed).is_null()
    }

    /// True once the second handshake step has committed; the monitor is
    /// terminal and every contender must retry against the object header.
    pub fn is_being_async_deflated(&self) -> bool {
        self.contentions() < 0
    }

    fn add_to_contentions(&self, value: i32) {
        self.contentions.fetch_add(value, Ordering::SeqCst);
    }

    /// Returns the witnessed previous owner; equal to `expected` iff the
    /// swap took place. The CAS carries acquire/release semantics in both
    /// directions, which is what makes critical-section writes of the
    /// previous owner visible to the next.
    fn try_set_owner_from(&self, expected: Owner, new: Owner) -> Owner {
        match self.owner.compare_exchange(
            expected.encode(),
            new.encode(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => expected,
            Err(actual) => Owner::decode(actual),
        }
    }

    fn clear_succ_if(&self, tid: u64) {
        if self.succ.load(Ordering::Relaxed) == tid {
            self.succ.store(NO_TID, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Enter

    /// Acquire the monitor, blocking as needed. Recursion aware.
    ///
    /// Returns `false` iff an asynchronous deflation committed mid-race; the
    /// caller must re-resolve the monitor through the object header and
    /// retry. On `true` the calling thread owns the monitor.
    pub fn enter(&self, current: VmThread) -> bool {
        let me = Owner::of::<R>(current);

        let cur = self.try_set_owner_from(Owner::None, me);
        if cur == Owner::None {
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }

        if cur == me {
            let r = self.recursions.load(Ordering::Relaxed);
            assert!(r != isize::MAX, "monitor recursion overflow");
            self.recursions.store(r + 1, Ordering::Relaxed);
            return true;
        }

        // Genuine contention. One optional spin round before the expensive
        // enqueue; a spin win stays invisible to the contention counters.
        if self.try_spin(current) {
            debug_assert!(self.is_owner(current));
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }

        self.add_to_contentions(1);
        if self.is_being_async_deflated() {
            // The increment lost the race to async deflation. Undo it,
            // restore the object header so we only retry once even if the
            // deflater is slow, and make the caller re-fetch the monitor.
            if let Some(object) = self.object_peek() {
                self.install_displaced_header(object);
            }
            self.add_to_contentions(-1);
            return false;
        }

        MonitorStats::bump(&self.stats().contended_enters);
        self.enter_slow(current);
        self.add_to_contentions(-1);

        debug_assert!(self.contentions() >= 0);
        debug_assert!(self.is_owner(current));
        debug_assert_eq!(self.recursions(), 0);
        true
    }

    /// One shot at the owner CAS. Not serializing on failure; callers
    /// compensate with their own fences.
    pub fn try_enter(&self, current: VmThread) -> TryLockResult {
        self.try_lock(current)
    }

    fn try_lock(&self, current: VmThread) -> TryLockResult {
        if self.owner_raw() != Owner::None {
            return TryLockResult::HasOwner;
        }
        if self.try_set_owner_from(Owner::None, Owner::of::<R>(current)) == Owner::None {
            debug_assert_eq!(self.recursions(), 0);
            TryLockResult::Success
        } else {
            // The word was free momentarily but the CAS lost the race.
            TryLockResult::Interference
        }
    }

    /// Cancel an in-progress deflation by taking ownership from the
    /// deflater. The caller has already pushed `contentions` positive, which
    /// bars the deflater from the second handshake step; the extra increment
    /// here balances the decrement the deflater issues when it notices the
    /// cancellation.
    fn try_cancel_deflation(&self, current: VmThread) -> bool {
        if self.try_set_owner_from(Owner::Deflater, Owner::of::<R>(current)) == Owner::Deflater {
            self.add_to_contentions(1);
            true
        } else {
            false
        }
    }

    /// Contended enter: enqueue on the `cxq` and park until the owner CAS
    /// succeeds. Runs with `contentions` already incremented, which keeps
    /// the deflater out; a deflation observed here is always cancellable.
    fn enter_slow(&self, current: VmThread) {
        let my_tid = ThreadOf::<R>::id(current);
        let tls = ThreadOf::<R>::tls(current);

        if self.try_lock(current) == TryLockResult::Success {
            return;
        }
        if self.try_cancel_deflation(current) {
            return;
        }
        if self.try_spin(current) {
            return;
        }

        // The spin failed. Enqueue and park.
        let node = ObjectWaiter::new(current);
        tls.park_event.reset();
        node.set_state(WaiterState::Cxq);

        // Push onto the front of the cxq. Once published the node stays
        // on-queue until this thread acquires the lock.
        let mut nxt;
        loop {
            nxt = self.cxq.load(Ordering::Relaxed);
            node.next.store(nxt, Ordering::Relaxed);
            if self
                .cxq
                .compare_exchange(nxt, node.as_ptr(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // Interference: the cxq head changed. Retry the lock while we
            // are at it; the node is not yet visible to anyone.
            if self.try_lock(current) == TryLockResult::Success {
                return;
            }
        }

        // If the queues were empty before the push this enter may be racing
        // a 1-0 exit, which admits stranding. Elect at most one enqueued
        // thread to poll the owner word with timed parks.
        if nxt.is_null() && self.entry_list.load(Ordering::Relaxed).is_null() {
            let _ = self.responsible.compare_exchange(
                NO_TID,
                my_tid,
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
        }

        let max_recheck = self.tunables().max_recheck_interval_ms;
        let mut recheck_interval = MIN_RECHECK_INTERVAL_MS;

        loop {
            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            debug_assert!(!self.is_owner(current));

            if self.responsible.load(Ordering::Relaxed) == my_tid {
                tls.park_event.park_timed(recheck_interval);
                recheck_interval = (recheck_interval * 8).min(max_recheck);
            } else {
                tls.park_event.park();
            }

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            if self.try_cancel_deflation(current) {
                break;
            }

            MonitorStats::bump(&self.stats().futile_wakeups);

            // Another adaptive round; a wakeup usually means the lock was
            // just released.
            if self.try_spin(current) {
                break;
            }

            self.clear_succ_if(my_tid);
            // After clearing succ the owner word must be re-polled before
            // the next park, or the wakeup that named us is lost.
            fence(Ordering::SeqCst);
        }

        // Egress: owner now. Unlink from whichever list holds the node.
        debug_assert!(self.is_owner(current));
        unsafe {
            self.unlink_after_acquire(&node);
        }
        self.clear_succ_if(my_tid);

        if self.responsible.load(Ordering::Relaxed) == my_tid {
            self.responsible.store(NO_TID, Ordering::Relaxed);
            // Dekker pivot: the subsequent exit's load of cxq|entry_list
            // must not float above this store, or threads that enqueued
            // before the clear are never seen.
            fence(Ordering::SeqCst);
        }
    }

    /// Restricted enter used on the wait-return path: the node is already on
    /// the `cxq` or `entry_list`, pushed there by a notifier.
    fn reenter_queued(&self, current: VmThread, node: &ObjectWaiter) {
        debug_assert!(node.is_wait());
        let my_tid = ThreadOf::<R>::id(current);
        let tls = ThreadOf::<R>::tls(current);

        loop {
            debug_assert!(matches!(
                node.state(),
                WaiterState::Enter | WaiterState::Cxq
            ));
            debug_assert!(!self.is_owner(current));

            if self.try_spin(current) {
                break;
            }

            tls.park_event.park();

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }

            MonitorStats::bump(&self.stats().futile_wakeups);
            self.clear_succ_if(my_tid);
            fence(Ordering::SeqCst);
        }

        debug_assert!(self.is_owner(current));
        unsafe {
            self.unlink_after_acquire(node);
        }
        self.clear_succ_if(my_tid);
        fence(Ordering::SeqCst);
    }

    /// Dequeue the freshly-acquired thread's node. Constant time on the
    /// `entry_list`; on the `cxq` a pop via CAS when at the head, otherwise a
    /// linear interior scan with plain stores.
    ///
    /// # Safety
    ///
    /// Caller must own the monitor and `node` must be on exactly one of its
    /// contention lists.
    unsafe fn unlink_after_acquire(&self, node: &ObjectWaiter) {
        if node.state() == WaiterState::Enter {
            let nxt = node.next.load(Ordering::Relaxed);
            let prv = node.prev.load(Ordering::Relaxed);
            if !nxt.is_null() {
                (*nxt).prev.store(prv, Ordering::Relaxed);
            }
            if !prv.is_null() {
                (*prv).next.store(nxt, Ordering::Relaxed);
            }
            if self.entry_list.load(Ordering::Relaxed) == node.as_ptr() {
                self.entry_list.store(nxt, Ordering::Relaxed);
            }
        } else {
            debug_assert_eq!(node.state(), WaiterState::Cxq);
            // The enqueue of self raced an exiting thread; the node is still
            // on the cxq. The head is volatile but the interior is stable
            // from the owner's perspective.
            let mut v = self.cxq.load(Ordering::Acquire);
            debug_assert!(!v.is_null());
            let popped = v == node.as_ptr()
                && self
                    .cxq
                    .compare_exchange(
                        v,
                        node.next.load(Ordering::Relaxed),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
            if !popped {
                // The head CAS can only fail because a recent arrival pushed
                // in front of us, so the node is now interior.
                if v == node.as_ptr() {
                    v = self.cxq.load(Ordering::Acquire);
                }
                let mut q: *mut ObjectWaiter = std::ptr::null_mut();
                let mut p = v;
                while !p.is_null() && p != node.as_ptr() {
                    debug_assert_eq!((*p).state(), WaiterState::Cxq);
                    q = p;
                    p = (*p).next.load(Ordering::Relaxed);
                }
                assert!(p == node.as_ptr(), "node not found on cxq");
                assert!(!q.is_null());
                (*q).next
                    .store(node.next.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }

        // List hygiene before the node leaves scope.
        node.next.store(std::ptr::null_mut(), Ordering::Relaxed);
        node.prev.store(std::ptr::null_mut(), Ordering::Relaxed);
        node.set_state(WaiterState::Run);
    }

    // ------------------------------------------------------------------
    // Exit

    /// Release the monitor. Recursion aware; pairs with [`enter`](Self::enter).
    ///
    /// `not_suspended` is false only when the embedder exits on behalf of a
    /// suspended owner; it suppresses the previous-owner event field.
    pub fn exit(&self, current: VmThread, not_suspended: bool) {
        let me = Owner::of::<R>(current);
        if self.owner_raw() != me {
            // Unbalanced locking. Callers convert this upstream; the monitor
            // itself only diagnoses.
            log::error!(
                target: "objsync::monitor",
                "thread {} exiting a monitor it does not own: {:?}",
                ThreadOf::<R>::id(current),
                self
            );
            debug_assert!(false, "non-balanced monitor enter/exit");
            return;
        }

        if self.recursions.load(Ordering::Relaxed) != 0 {
            self.recursions.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        // After clearing responsible the owner must fence before fetching
        // cxq|entry_list; the release store plus the SeqCst fence below
        // provide that.
        self.responsible.store(NO_TID, Ordering::Relaxed);

        if not_suspended {
            self.previous_owner_tid
                .store(ThreadOf::<R>::id(current), Ordering::Relaxed);
        }

        loop {
            debug_assert_eq!(self.owner_raw(), me);

            // Drop the lock. Release keeps critical-section accesses above
            // the store; the fence is the exit-side Dekker pivot separating
            // the owner clear from the successor check.
            self.owner.store(NO_OWNER, Ordering::Release);
            fence(Ordering::SeqCst);

            if (self.entry_list.load(Ordering::Relaxed).is_null()
                && self.cxq.load(Ordering::Relaxed).is_null())
                || self.succ.load(Ordering::Relaxed) != NO_TID
            {
                // Nobody to wake, or a successor is already running. This is
                // the 1-0 exit: it admits stranding against a racing
                // enqueue, repaired by the responsible thread's timed parks.
                return;
            }

            // A successor must be made ready, and only the owner may touch
            // the entry_list or drain the cxq. Reacquire; if that fails the
            // new owner inherits the succession duty.
            if self.try_set_owner_from(Owner::None, me) != Owner::None {
                return;
            }

            let w = self.entry_list.load(Ordering::Relaxed);
            if !w.is_null() {
                // The head may be this very thread: a waiter that exited
                // inside wait(), was notified, and now finds its own node.
                // The epilog tolerates that.
                debug_assert_eq!(unsafe { (*w).state() }, WaiterState::Enter);
                self.exit_epilog(w);
                return;
            }

            let mut w = self.cxq.load(Ordering::Acquire);
            if w.is_null() {
                continue;
            }

            // Detach the cxq, then fold it into the entry_list. The fold is
            // O(len) while holding the lock, so it must stay tight.
            loop {
                match self.cxq.compare_exchange(
                    w,
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(u) => w = u,
                }
            }
            debug_assert!(!w.is_null());
            debug_assert!(self.entry_list.load(Ordering::Relaxed).is_null());

            // Convert the LIFO chain into a doubly-linked entry_list. The
            // LIFO-derived order is kept as-is; queue discipline beyond set
            // membership is unspecified.
            self.entry_list.store(w, Ordering::Relaxed);
            let mut q: *mut ObjectWaiter = std::ptr::null_mut();
            let mut p = w;
            while !p.is_null() {
                unsafe {
                    debug_assert_eq!((*p).state(), WaiterState::Cxq);
                    (*p).set_state(WaiterState::Enter);
                    (*p).prev.store(q, Ordering::Relaxed);
                    q = p;
                    p = (*p).next.load(Ordering::Relaxed);
                }
            }

            // A spinner may have published itself as successor while we
            // drained; abdicate to it instead of waking anyone.
            if self.succ.load(Ordering::Relaxed) != NO_TID {
                continue;
            }

            let w = self.entry_list.load(Ordering::Relaxed);
            if !w.is_null() {
                self.exit_epilog(w);
                return;
            }
        }
    }

    /// Wake `wakee`: publish it as heir presumptive, drop the lock, unpark.
    fn exit_epilog(&self, wakee: *mut ObjectWaiter) {
        // Capture the thread and its park event now. Once the owner word is
        // cleared the wakee may acquire, exit and deallocate its node, so
        // the node must not be touched after the release store.
        let (wakee_thread, wakee_tid) = unsafe {
            let t = (*wakee).thread;
            (t, ThreadOf::<R>::id(t))
        };
        self.succ.store(wakee_tid, Ordering::Relaxed);
        let trigger = &ThreadOf::<R>::tls(wakee_thread).park_event;

        self.owner.store(NO_OWNER, Ordering::Release);
        fence(Ordering::SeqCst);

        trigger.unpark();
        MonitorStats::bump(&self.stats().parks);
    }

    /// Fully release the monitor regardless of recursion depth, returning
    /// the saved depth for a later [`relock`](Self::relock).
    pub fn complete_exit(&self, current: VmThread) -> isize {
        assert!(self.is_owner(current), "complete_exit requires ownership");
        let save = self.recursions.load(Ordering::Relaxed);
        self.recursions.store(0, Ordering::Relaxed);
        self.exit(current, true);
        debug_assert!(!self.is_owner(current));
        save
    }

    /// Reacquire after [`complete_exit`](Self::complete_exit) and restore
    /// the saved recursion depth. Returns `false` on a deflation race, like
    /// [`enter`](Self::enter).
    pub fn relock(&self, current: VmThread, recursions: isize) -> bool {
        if !self.enter(current) {
            return false;
        }
        debug_assert_eq!(self.recursions(), 0);
        self.recursions.store(recursions, Ordering::Relaxed);
        true
    }

    // ------------------------------------------------------------------
    // Wait / notify

    fn check_owner(&self, current: VmThread) -> Result<(), MonitorError> {
        if self.is_owner(current) {
            Ok(())
        } else {
            Err(MonitorError::NotOwner)
        }
    }

    /// Release the monitor and wait for a notification, timeout
    /// (`millis > 0`) or interrupt. On return the monitor is owned again
    /// with the pre-call recursion depth. Spurious wakeups report as
    /// timeouts.
    pub fn wait(&self, millis: i64, current: VmThread) -> Result<(), MonitorError> {
        self.check_owner(current)?;

        let my_tid = ThreadOf::<R>::id(current);
        let tls = ThreadOf::<R>::tls(current);

        if ThreadOf::<R>::is_interrupted(current, true) {
            // Pending interrupt: raise without ever enqueueing, so this
            // thread cannot be made successor and no unpark is consumed.
            return Err(MonitorError::Interrupted);
        }

        let node = ObjectWaiter::new_wait(current);
        tls.park_event.reset();
        // ST into the park event, then LD of the interrupt flag below.
        fence(Ordering::SeqCst);

        self.wait_set_lock.acquire();
        unsafe {
            self.add_waiter(&node);
        }
        self.wait_set_lock.release();

        self.responsible.store(NO_TID, Ordering::Relaxed);

        let save = self.recursions.load(Ordering::Relaxed);
        node.saved_recursions.store(save, Ordering::Relaxed);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.recursions.store(0, Ordering::Relaxed);
        self.exit(current, true);
        debug_assert!(!self.is_owner(current));

        let interrupted = ThreadOf::<R>::is_interrupted(current, false);
        if !interrupted && !node.was_notified() {
            if millis <= 0 {
                tls.park_event.park();
            } else {
                tls.park_event.park_timed(millis as u64);
            }
        }

        // The node may be on the wait_set, on a contention list, or in
        // transition between them. Double-checked locking: a stale Wait
        // reading fails toward taking the lock and re-reading.
        if node.state() == WaiterState::Wait {
            self.wait_set_lock.acquire();
            if node.state() == WaiterState::Wait {
                unsafe {
                    self.dequeue_specific_waiter(&node);
                }
                debug_assert!(!node.was_notified());
                node.set_state(WaiterState::Run);
            }
            self.wait_set_lock.release();
        }

        // From here the node state is stable: no other thread mutates it.
        debug_assert!(node.state() != WaiterState::Wait);
        fence(Ordering::Acquire);
        self.clear_succ_if(my_tid);
        let was_notified = node.was_notified();
        fence(Ordering::SeqCst);

        debug_assert!(!self.is_owner(current));
        match node.state() {
            WaiterState::Run => {
                // Timed out or interrupted before any notify: the node left
                // every queue, reenter through the full protocol. Deflation
                // cannot win while waiters is still elevated.
                let entered = self.enter(current);
                debug_assert!(entered, "deflation raced a monitor with waiters");
            }
            WaiterState::Enter | WaiterState::Cxq => {
                self.reenter_queued(current, &node);
            }
            WaiterState::Wait => unreachable!(),
        }

        debug_assert_eq!(node.state(), WaiterState::Run);
        debug_assert!(self.is_owner(current));
        debug_assert_eq!(self.recursions(), 0);
        self.recursions
            .store(node.saved_recursions.load(Ordering::Relaxed), Ordering::Relaxed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        if !was_notified {
            // Timeout, interrupt or a spurious wake. Notification takes
            // precedence over interrupt; a timeout is the silent default.
            if ThreadOf::<R>::is_interrupted(current, true) {
                return Err(MonitorError::Interrupted);
            }
        }
        Ok(())
    }

    /// Transfer the head of the wait_set to the contention queues. The
    /// notifyee stays parked; the current owner's exit will unpark it.
    /// Unparking here would only let the notifyee impale itself on the
    /// still-held lock.
    fn inotify(&self, current: VmThread) {
        self.wait_set_lock.acquire();
        let iterator = unsafe { self.dequeue_waiter() };
        if !iterator.is_null() {
            unsafe {
                debug_assert_eq!((*iterator).state(), WaiterState::Wait);
                debug_assert!(!(*iterator).was_notified());

                (*iterator).set_state(WaiterState::Enter);
                (*iterator).notified.store(true, Ordering::Release);
                (*iterator)
                    .notifier_tid
                    .store(ThreadOf::<R>::id(current), Ordering::Relaxed);

                let list = self.entry_list.load(Ordering::Relaxed);
                if list.is_null() {
                    (*iterator).next.store(std::ptr::null_mut(), Ordering::Relaxed);
                    (*iterator).prev.store(std::ptr::null_mut(), Ordering::Relaxed);
                    self.entry_list.store(iterator, Ordering::Relaxed);
                } else {
                    debug_assert!((*list).prev.load(Ordering::Relaxed).is_null());
                    // Prepend to the cxq instead of walking to the
                    // entry_list tail.
                    (*iterator).set_state(WaiterState::Cxq);
                    loop {
                        let front = self.cxq.load(Ordering::Relaxed);
                        (*iterator).next.store(front, Ordering::Relaxed);
                        if self
                            .cxq
                            .compare_exchange(
                                front,
                                iterator,
                                Ordering::SeqCst,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            break;
                        }
                    }
                }
            }
            MonitorStats::bump(&self.stats().notifications);
        }
        self.wait_set_lock.release();
    }

    pub fn notify(&self, current: VmThread) -> Result<(), MonitorError> {
        self.check_owner(current)?;
        if self.wait_set.load(Ordering::Relaxed).is_null() {
            return Ok(());
        }
        self.inotify(current);
        Ok(())
    }

    /// Transfers waiters one at a time; in prepend mode the transferred
    /// waiters end up in reverse wait order ahead of prior entry_list
    /// threads. Only set membership is guaranteed.
    pub fn notify_all(&self, current: VmThread) -> Result<(), MonitorError> {
        self.check_owner(current)?;
        while !self.wait_set.load(Ordering::Relaxed).is_null() {
            self.inotify(current);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // WaitSet list management (all under wait_set_lock)

    /// # Safety
    ///
    /// `wait_set_lock` held; node not on any list.
    unsafe fn add_waiter(&self, node: &ObjectWaiter) {
        debug_assert!(node.prev.load(Ordering::Relaxed).is_null());
        debug_assert!(node.next.load(Ordering::Relaxed).is_null());

        let head = self.wait_set.load(Ordering::Relaxed);
        if head.is_null() {
            // Singleton circular list.
            node.prev.store(node.as_ptr(), Ordering::Relaxed);
            node.next.store(node.as_ptr(), Ordering::Relaxed);
            self.wait_set.store(node.as_ptr(), Ordering::Relaxed);
        } else {
            // Splice at the tail of the circular list.
            let tail = (*head).prev.load(Ordering::Relaxed);
            debug_assert_eq!((*tail).next.load(Ordering::Relaxed), head);
            (*tail).next.store(node.as_ptr(), Ordering::Relaxed);
            (*head).prev.store(node.as_ptr(), Ordering::Relaxed);
            node.next.store(head, Ordering::Relaxed);
            node.prev.store(tail, Ordering::Relaxed);
        }
    }

    /// Dequeue the first (oldest) waiter, or null.
    ///
    /// # Safety
    ///
    /// `wait_set_lock` held.
    unsafe fn dequeue_waiter(&self) -> *mut ObjectWaiter {
        let waiter = self.wait_set.load(Ordering::Relaxed);
        if !waiter.is_null() {
            self.dequeue_specific_waiter(&*waiter);
        }
        waiter
    }

    /// # Safety
    ///
    /// `wait_set_lock` held; node on the wait_set.
    unsafe fn dequeue_specific_waiter(&self, node: &ObjectWaiter) {
        let next = node.next.load(Ordering::Relaxed);
        let prev = node.prev.load(Ordering::Relaxed);
        debug_assert!(!next.is_null());
        debug_assert!(!prev.is_null());

        if next == node.as_ptr() {
            debug_assert_eq!(prev, node.as_ptr());
            self.wait_set.store(std::ptr::null_mut(), Ordering::Relaxed);
        } else {
            debug_assert_eq!((*prev).next.load(Ordering::Relaxed), node.as_ptr());
            debug_assert_eq!((*next).prev.load(Ordering::Relaxed), node.as_ptr());
            (*next).prev.store(prev, Ordering::Relaxed);
            (*prev).next.store(next, Ordering::Relaxed);
            if self.wait_set.load(Ordering::Relaxed) == node.as_ptr() {
                self.wait_set.store(next, Ordering::Relaxed);
            }
        }
        node.next.store(std::ptr::null_mut(), Ordering::Relaxed);
        node.prev.store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Adaptive spin

    /// Short unconditional try-lock burst. With `adapt` a win feeds the
    /// duration controller, which keeps a zero duration from becoming an
    /// absorbing state.
    fn short_fixed_spin(&self, current: VmThread, spin_count: i32, adapt: bool) -> bool {
        for _ in 0..spin_count {
            match self.try_lock(current) {
                TryLockResult::Success => {
                    if adapt {
                        let t = self.tunables();
                        self.spin_duration.store(
                            adjust_up(self.spin_duration.load(Ordering::Relaxed), t),
                            Ordering::Relaxed,
                        );
                    }
                    return true;
                }
                TryLockResult::Interference => break,
                TryLockResult::HasOwner => {}
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Spin-then-block admission control: fixed frequency, adaptive
    /// duration. The duration converges on the recent success rate, which
    /// predicts whether the owner releases within a context-switch time.
    /// Single-threaded per caller; polls the safepoint word so a spinner
    /// never delays a stop-the-world request.
    fn try_spin(&self, current: VmThread) -> bool {
        let t = self.tunables();

        if t.fixed_spin > 0 {
            return self.short_fixed_spin(current, t.fixed_spin, false);
        }

        if self.short_fixed_spin(current, t.pre_spin, true) {
            return true;
        }

        let mut ctr = self.spin_duration.load(Ordering::Relaxed);
        if ctr <= 0 {
            return false;
        }

        let my_tid = ThreadOf::<R>::id(current);
        if self.succ.load(Ordering::Relaxed) == NO_TID {
            // Publish as heir presumptive so an exiting thread abdicates to
            // us instead of waking a parked thread.
            self.succ.store(my_tid, Ordering::Relaxed);
        }

        let mut prv = NO_OWNER;
        loop {
            ctr -= 1;
            if ctr < 0 {
                break;
            }

            if (ctr & 0xFF) == 0 {
                if ThreadOf::<R>::safepoint_poll_armed(current) {
                    break;
                }
                std::hint::spin_loop();
            }

            let ox = self.owner.load(Ordering::Acquire);
            if ox == NO_OWNER {
                if self
                    .try_set_owner_from(Owner::None, Owner::Thread(my_tid))
                    == Owner::None
                {
                    self.clear_succ_if(my_tid);
                    self.spin_duration.store(
                        adjust_up(self.spin_duration.load(Ordering::Relaxed), t),
                        Ordering::Relaxed,
                    );
                    return true;
                }
                // CAS is high latency; a failed one means the lock was just
                // taken. Abort rather than chase it.
                break;
            }

            // Ownership flicker between two observations predicts a long
            // wait ahead; abort without running down the counter.
            if prv != NO_OWNER && ox != prv {
                break;
            }
            prv = ox;

            if self.succ.load(Ordering::Relaxed) == NO_TID {
                self.succ.store(my_tid, Ordering::Relaxed);
            }
        }

        // Only a full countdown is failure with prejudice.
        if ctr < 0 {
            self.spin_duration.store(
                adjust_down(self.spin_duration.load(Ordering::Relaxed), t),
                Ordering::Relaxed,
            );
        }

        if self.succ.load(Ordering::Relaxed) == my_tid {
            self.succ.store(NO_TID, Ordering::Relaxed);
            // After un-publishing, the owner word must be retried once or an
            // exit that abdicated to us strands everyone.
            fence(Ordering::SeqCst);
            if self.try_lock(current) == TryLockResult::Success {
                return true;
            }
        }

        false
    }

    // ------------------------------------------------------------------
    // Deflation

    /// Deflate this monitor if not in use. Called from the registry's
    /// background scavenge; returns `true` once the monitor is terminal.
    ///
    /// Step one parks `Deflater` in the owner word to force contenders into
    /// the slow path; step two flips a still-zero `contentions` to
    /// `i32::MIN`. Either step can lose to a contender, in which case the
    /// owner word is handed back (or, if a contender already cancelled, the
    /// cancellation's extra increment is balanced here).
    pub fn deflate(&self) -> bool {
        if self.is_busy() {
            return false;
        }

        let obj = self.object_peek();

        if obj.is_none() {
            // The object died and GC broke the association; no racer can
            // reach this monitor through a header anymore.
            if self.try_set_owner_from(Owner::None, Owner::Deflater) != Owner::None {
                return false;
            }
            debug_assert!(self.contentions() >= 0);
            self.contentions.store(i32::MIN, Ordering::SeqCst);
        } else {
            if self.try_set_owner_from(Owner::None, Owner::Deflater) != Owner::None {
                return false;
            }

            if self.contentions() > 0 || self.waiters() != 0 {
                // A thread raced in after the busy check. Hand the owner
                // word back unless an enterer already took it from us, in
                // which case complete that cancellation's accounting.
                if self.try_set_owner_from(Owner::Deflater, Owner::None) != Owner::Deflater {
                    self.add_to_contentions(-1);
                }
                return false;
            }

            if self
                .contentions
                .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                if self.try_set_owner_from(Owner::Deflater, Owner::None) != Owner::Deflater {
                    self.add_to_contentions(-1);
                }
                return false;
            }
        }

        assert_eq!(self.owner_raw(), Owner::Deflater);
        assert!(self.contentions() < 0);
        assert_eq!(self.waiters(), 0);
        assert!(self.cxq.load(Ordering::Relaxed).is_null());
        assert!(self.entry_list.load(Ordering::Relaxed).is_null());

        if let Some(obj) = obj {
            log::trace!(
                target: "objsync::deflation",
                "deflated monitor {:p} for object {:p}",
                self,
                obj.to_raw_address()
            );
            self.install_displaced_header(obj);
        }

        MonitorStats::bump(&self.stats().deflations);

        // Owner stays Deflater and contentions stays negative so racers keep
        // retrying against the object header.
        true
    }

    /// Restore the saved neutral header into the object. Idempotent: called
    /// by the deflater and by every thread that detected the deflation race;
    /// whichever CAS wins, the header ends up restored and losers are
    /// silent.
    pub fn install_displaced_header(&self, obj: ObjectRef) {
        // contentions and the saved header are written by different threads;
        // observers must see them in the same order.
        fence(Ordering::SeqCst);

        let Some(l_object) = self.object_peek() else {
            return;
        };
        debug_assert_eq!(l_object, obj);

        let dmw = self.header();
        debug_assert!(dmw.is_neutral(), "displaced header must be neutral");

        let expected = HeaderWord::encode_monitor(self);
        let res = obj.cas_set_mark(dmw, expected);
        if res != expected {
            log::info!(
                target: "objsync::deflation",
                "lost header installation race: expected {:?}, found {:?}",
                expected,
                res
            );
        }
    }

    // ------------------------------------------------------------------
    // Registry binding

    /// Bind this monitor to an object about to be inflated.
    pub(crate) fn prepare(&self, displaced: HeaderWord, slot: *mut WeakSlot) {
        debug_assert!(displaced.is_neutral());
        let tunables = self.tunables();

        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.recursions.store(0, Ordering::Relaxed);
        self.succ.store(NO_TID, Ordering::Relaxed);
        self.responsible.store(NO_TID, Ordering::Relaxed);
        self.previous_owner_tid.store(NO_TID, Ordering::Relaxed);
        self.spin_duration
            .store(tunables.spin_limit, Ordering::Relaxed);
        self.header.store(displaced.value(), Ordering::Relaxed);
        self.object.store(slot, Ordering::Release);
        // Publish the live state last; a stale holder keeps seeing the
        // terminal negative count until here.
        self.contentions.store(0, Ordering::SeqCst);
    }

    pub(crate) fn clear_object(&self) {
        self.object
            .store(std::ptr::null_mut(), Ordering::Release);
        self.header.store(0, Ordering::Relaxed);
    }
}

impl<R: Runtime> Default for ObjectMonitor<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> std::fmt::Debug for ObjectMonitor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("owner", &self.owner_raw())
            .field("recursions", &self.recursions())
            .field("contentions", &self.contentions())
            .field("waiters", &self.waiters())
            .field("cxq", &self.cxq.load(Ordering::Relaxed))
            .field("entry_list", &self.entry_list.load(Ordering::Relaxed))
            .field("spin_duration", &self.spin_duration())
            .finish()
    }
}

fn adjust_up(spin_duration: i32, t: &MonitorTunables) -> i32 {
    let x = spin_duration;
    if x < t.spin_limit {
        // Pull impoverished durations back into profitable territory before
        // applying the bonus.
        x.max(t.spin_poverty) + t.spin_bonus
    } else {
        spin_duration
    }
}

fn adjust_down(spin_duration: i32, t: &MonitorTunables) -> i32 {
    let x = spin_duration;
    if x > 0 {
        (x - t.spin_penalty).max(0)
    } else {
        spin_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockVM};
    use std::sync::Arc;
    use std::time::Duration;

    type Monitor = ObjectMonitor<MockVM>;

    fn new_monitor() -> Arc<Monitor> {
        // Touch the registry so tunables exist before any monitor call.
        let _ = MockVM::registry();
        let m = Arc::new(Monitor::new());
        m.spin_duration.store(
            MockVM::registry().tunables().spin_limit,
            std::sync::atomic::Ordering::Relaxed,
        );
        m
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let mut tries = 0;
        while !cond() {
            tries += 1;
            assert!(tries < 10_000, "condition never became true");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn owner_word_roundtrip() {
        for owner in [
            Owner::None,
            Owner::Deflater,
            Owner::Thread(42),
            Owner::Thread(0),
            Owner::StackLock(0x1000),
        ] {
            assert_eq!(Owner::decode(owner.encode()), owner);
        }
    }

    #[test]
    fn uncontended_enter_exit() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        assert!(m.enter(current));
        assert!(m.is_owner(current));
        assert_eq!(m.recursions(), 0);
        assert_eq!(m.contentions(), 0);
        let before = m.spin_duration();

        m.exit(current, true);
        assert_eq!(m.owner_raw(), Owner::None);
        assert_eq!(m.contentions(), 0);
        assert_eq!(m.spin_duration(), before);
        assert_eq!(
            m.previous_owner_tid(),
            <MockVM as Runtime>::Thread::id(current)
        );
    }

    #[test]
    fn recursive_enter() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        assert!(m.enter(current));
        assert!(m.enter(current));
        assert!(m.enter(current));
        assert_eq!(m.recursions(), 2);
        m.exit(current, true);
        assert_eq!(m.recursions(), 1);
        assert!(m.is_owner(current));
        m.exit(current, true);
        m.exit(current, true);
        assert_eq!(m.owner_raw(), Owner::None);
    }

    #[test]
    fn try_enter_reports_owner() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));

        let m2 = m.clone();
        std::thread::spawn(move || {
            let other = mock::attach_current_thread();
            assert_eq!(m2.try_enter(other), TryLockResult::HasOwner);
        })
        .join()
        .unwrap();

        m.exit(current, true);
        assert_eq!(m.try_enter(current), TryLockResult::Success);
        m.exit(current, true);
    }

    #[test]
    fn contended_enter_parks_until_exit() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));

        let m2 = m.clone();
        let t = std::thread::spawn(move || {
            let other = mock::attach_current_thread();
            assert!(m2.enter(other));
            assert!(m2.is_owner(other));
            m2.exit(other, true);
        });

        // Give the contender time to run down its spin and park.
        std::thread::sleep(Duration::from_millis(100));
        m.exit(current, true);
        t.join().unwrap();

        assert_eq!(m.owner_raw(), Owner::None);
        assert_eq!(m.contentions(), 0);
        assert!(m.cxq.load(Ordering::Relaxed).is_null());
        assert!(m.entry_list.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn many_contenders_all_acquire() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));

        let threads: Vec<_> = (0..6)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    let me = mock::attach_current_thread();
                    assert!(m.enter(me));
                    std::thread::sleep(Duration::from_millis(1));
                    m.exit(me, true);
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        m.exit(current, true);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(m.owner_raw(), Owner::None);
        assert_eq!(m.contentions(), 0);
    }

    #[test]
    fn wait_requires_ownership() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert_eq!(m.wait(0, current), Err(MonitorError::NotOwner));
        assert_eq!(m.notify(current), Err(MonitorError::NotOwner));
        assert_eq!(m.notify_all(current), Err(MonitorError::NotOwner));
    }

    #[test]
    fn wait_timeout_reacquires() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));
        assert!(m.enter(current));

        assert_eq!(m.wait(30, current), Ok(()));
        assert!(m.is_owner(current));
        assert_eq!(m.recursions(), 1);
        assert_eq!(m.waiters(), 0);

        m.exit(current, true);
        m.exit(current, true);
    }

    #[test]
    fn notify_transfer() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        let m2 = m.clone();
        let waiter = std::thread::spawn(move || {
            let me = mock::attach_current_thread();
            assert!(m2.enter(me));
            assert!(m2.enter(me));
            assert_eq!(m2.recursions(), 1);
            // Releases the monitor, parks, reacquires on notify.
            assert_eq!(m2.wait(0, me), Ok(()));
            assert!(m2.is_owner(me));
            assert_eq!(m2.recursions(), 1);
            m2.exit(me, true);
            m2.exit(me, true);
        });

        wait_until(|| m.waiters() == 1);
        assert!(m.enter(current));

        assert_eq!(m.notify(current), Ok(()));
        // The waiter moved off the wait_set onto a contention list and is
        // still parked until we exit.
        assert!(m.wait_set.load(Ordering::Relaxed).is_null());
        assert!(
            !m.entry_list.load(Ordering::Relaxed).is_null()
                || !m.cxq.load(Ordering::Relaxed).is_null()
        );
        m.exit(current, true);

        waiter.join().unwrap();
        assert_eq!(m.waiters(), 0);
        assert_eq!(m.owner_raw(), Owner::None);
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        const WAITERS: usize = 4;

        let threads: Vec<_> = (0..WAITERS)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    let me = mock::attach_current_thread();
                    assert!(m.enter(me));
                    assert_eq!(m.wait(0, me), Ok(()));
                    let notifier = ThreadOf::<MockVM>::id(me);
                    m.exit(me, true);
                    notifier
                })
            })
            .collect();

        wait_until(|| m.waiters() == WAITERS as i32);
        assert!(m.enter(current));
        assert_eq!(m.notify_all(current), Ok(()));
        assert!(m.wait_set.load(Ordering::Relaxed).is_null());
        m.exit(current, true);

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(m.waiters(), 0);
        assert_eq!(m.owner_raw(), Owner::None);
    }

    #[test]
    fn interrupt_during_wait() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        let m2 = m.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let me = mock::attach_current_thread();
            tx.send(me).unwrap();
            assert!(m2.enter(me));
            let res = m2.wait(10_000, me);
            assert!(m2.is_owner(me));
            assert_eq!(m2.recursions(), 0);
            m2.exit(me, true);
            res
        });

        let waiter_thread = rx.recv().unwrap();
        wait_until(|| m.waiters() == 1);
        ThreadOf::<MockVM>::interrupt(waiter_thread);

        assert_eq!(waiter.join().unwrap(), Err(MonitorError::Interrupted));
        assert_eq!(m.waiters(), 0);
        assert_eq!(m.owner_raw(), Owner::None);
        let _ = current;
    }

    #[test]
    fn pending_interrupt_short_circuits_wait() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));

        ThreadOf::<MockVM>::tls(current)
            .interrupted
            .store(true, Ordering::Release);
        assert_eq!(m.wait(0, current), Err(MonitorError::Interrupted));
        // Still owner, never enqueued, flag consumed.
        assert!(m.is_owner(current));
        assert_eq!(m.waiters(), 0);
        assert!(!ThreadOf::<MockVM>::is_interrupted(current, false));
        // The interruptor's unpark (not issued here) must not linger either;
        // a subsequent timed wait times out normally.
        assert_eq!(m.wait(20, current), Ok(()));

        m.exit(current, true);
    }

    #[test]
    fn complete_exit_and_relock() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));
        assert!(m.enter(current));
        assert!(m.enter(current));

        let depth = m.complete_exit(current);
        assert_eq!(depth, 2);
        assert_eq!(m.owner_raw(), Owner::None);

        assert!(m.relock(current, depth));
        assert!(m.is_owner(current));
        assert_eq!(m.recursions(), 2);

        m.exit(current, true);
        m.exit(current, true);
        m.exit(current, true);
        assert_eq!(m.owner_raw(), Owner::None);
    }

    #[test]
    fn wait_set_queue_is_fifo() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        let nodes: Vec<ObjectWaiter> =
            (0..4).map(|_| ObjectWaiter::new_wait(current)).collect();
        for node in &nodes {
            unsafe {
                m.add_waiter(node);
            }
        }
        for node in &nodes {
            let head = unsafe { m.dequeue_waiter() };
            assert_eq!(head, node.as_ptr());
        }
        assert!(unsafe { m.dequeue_waiter() }.is_null());
    }

    #[test]
    fn spin_duration_adapts() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        let t = MockVM::registry().tunables();

        // Success at the cap leaves the duration alone.
        assert_eq!(m.spin_duration(), t.spin_limit);
        assert!(m.try_spin(current));
        assert_eq!(m.spin_duration(), t.spin_limit);
        m.exit(current, true);

        // A poverty-level duration is pulled up to poverty + bonus.
        m.spin_duration.store(100, Ordering::Relaxed);
        assert!(m.try_spin(current));
        assert_eq!(m.spin_duration(), t.spin_poverty + t.spin_bonus);
        m.exit(current, true);

        // A full countdown against a held lock pays the penalty.
        let m2 = m.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let me = mock::attach_current_thread();
            assert!(m2.enter(me));
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
            m2.exit(me, true);
        });
        rx.recv().unwrap();

        let before = m.spin_duration();
        assert!(!m.try_spin(current));
        assert_eq!(m.spin_duration(), before - t.spin_penalty);
        assert_eq!(m.succ.load(Ordering::Relaxed), NO_TID);

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn safepoint_poll_aborts_spin() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        let m2 = m.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let me = mock::attach_current_thread();
            assert!(m2.enter(me));
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
            m2.exit(me, true);
        });
        rx.recv().unwrap();

        ThreadOf::<MockVM>::tls(current)
            .take_yieldpoint
            .store(1, Ordering::Relaxed);
        let before = m.spin_duration();
        assert!(!m.try_spin(current));
        // Aborted early, so no full-countdown penalty.
        assert_eq!(m.spin_duration(), before);
        ThreadOf::<MockVM>::tls(current)
            .take_yieldpoint
            .store(0, Ordering::Relaxed);

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn deflation_of_dead_object_monitor() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        // Unbound monitor, object slot null: the uncontested path.
        assert!(m.deflate());
        assert_eq!(m.owner_raw(), Owner::Deflater);
        assert!(m.is_being_async_deflated());

        // A late enterer observes the terminal state and is told to retry.
        assert!(!m.enter(current));
    }

    #[test]
    fn deflation_skips_busy_monitor() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));
        assert!(!m.deflate());
        m.exit(current, true);
    }

    #[test]
    fn deflation_cancelled_by_enterer() {
        let current = mock::attach_current_thread();
        let m = new_monitor();

        // Deflater completed step one and stalls between the steps.
        assert_eq!(m.try_set_owner_from(Owner::None, Owner::Deflater), Owner::None);

        // The enterer pushes contentions positive, sees the marker and
        // cancels; enter reports OWNED, not RETRY.
        assert!(m.enter(current));
        assert!(m.is_owner(current));
        // Net: +1 from the cancellation (the enter-side increment was
        // paired with its own decrement).
        assert_eq!(m.contentions(), 1);

        // The stalled deflater resumes: step two fails, the owner word can
        // no longer be handed back, so it balances the cancellation.
        assert!(m
            .contentions
            .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err());
        assert_ne!(m.try_set_owner_from(Owner::Deflater, Owner::None), Owner::Deflater);
        m.add_to_contentions(-1);

        assert_eq!(m.contentions(), 0);
        assert!(m.is_owner(current));
        m.exit(current, true);
        assert_eq!(m.owner_raw(), Owner::None);
    }

    #[test]
    fn exit_by_non_owner_is_rejected() {
        let current = mock::attach_current_thread();
        let m = new_monitor();
        assert!(m.enter(current));

        let m2 = m.clone();
        std::thread::spawn(move || {
            let other = mock::attach_current_thread();
            // Debug builds assert; this test only runs the release-shaped
            // diagnostic path.
            if !cfg!(debug_assertions) {
                m2.exit(other, true);
                assert!(!m2.is_owner(other));
            }
        })
        .join()
        .unwrap();

        assert!(m.is_owner(current));
        m.exit(current, true);
    }
}
