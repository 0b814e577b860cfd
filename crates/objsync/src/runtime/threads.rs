use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicI8, Ordering},
};

use crate::{runtime::park::ParkEvent, Runtime, ThreadOf};

/// Opaque handle to a runtime thread. The embedding runtime decides what it
/// points at; this crate only threads it through to [`Thread`] accessors.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct VmThread(*const u8);

unsafe impl Send for VmThread {}
unsafe impl Sync for VmThread {}

impl VmThread {
    pub const UNINITIALIZED: VmThread = VmThread(std::ptr::null());

    /// # Safety
    ///
    /// `addr` must be a value previously produced by the embedder for a
    /// thread that outlives every use of the handle.
    pub unsafe fn from_address(addr: *const u8) -> Self {
        Self(addr)
    }

    pub fn to_address(self) -> *const u8 {
        self.0
    }
}

/// Thread-local state the monitor subsystem needs from every attached
/// thread: the parking primitive, the interrupt flag and the safepoint poll
/// word. Embedders keep one of these per thread and hand out references via
/// [`Thread::tls`].
pub struct ThreadData {
    pub park_event: ParkEvent,
    pub interrupted: AtomicBool,
    /// Non-zero when a safepoint/handshake wants this thread to stop
    /// spinning and reach a poll.
    pub take_yieldpoint: AtomicI8,
}

impl ThreadData {
    pub const fn new() -> Self {
        Self {
            park_event: ParkEvent::new(),
            interrupted: AtomicBool::new(false),
            take_yieldpoint: AtomicI8::new(0),
        }
    }
}

impl Default for ThreadData {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Thread<R: Runtime>: 'static {
    /// Unique thread ID. Used as the owner identity in monitor words, so it
    /// must fit 63 bits and never be reused while the thread can appear in
    /// any monitor.
    fn id(thread: VmThread) -> u64;

    fn tls<'a>(thread: VmThread) -> &'a ThreadData;

    fn is_interrupted(thread: VmThread, clear: bool) -> bool {
        let tls = Self::tls(thread);
        if clear {
            tls.interrupted.swap(false, Ordering::AcqRel)
        } else {
            tls.interrupted.load(Ordering::Acquire)
        }
    }

    /// Post an interrupt: set the flag, then unpark so a thread blocked in
    /// `wait` observes it.
    fn interrupt(thread: VmThread) {
        let tls = Self::tls(thread);
        tls.interrupted.store(true, Ordering::Release);
        tls.park_event.unpark();
    }

    fn safepoint_poll_armed(thread: VmThread) -> bool {
        Self::tls(thread).take_yieldpoint.load(Ordering::Relaxed) != 0
    }
}

thread_local! {
    static THREAD: Cell<VmThread> = const { Cell::new(VmThread::UNINITIALIZED) };
}

/// Bind `thread` as the calling OS thread's identity for
/// [`Runtime::current_thread`].
pub fn register_current_thread(thread: VmThread) {
    THREAD.with(|t| t.set(thread));
}

pub fn current_thread() -> VmThread {
    THREAD.with(|t| t.get())
}

/// Debug helper mirroring the owner identity of `thread`.
pub fn thread_id_of<R: Runtime>(thread: VmThread) -> u64 {
    ThreadOf::<R>::id(thread)
}
