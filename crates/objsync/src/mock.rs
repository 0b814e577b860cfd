//! Simple MockVM used in tests and by embedders that want a trivial
//! threading model.

use std::{
    ptr::NonNull,
    sync::{atomic::AtomicUsize, LazyLock},
};

use crate::{
    objectmodel::{header::HeaderWord, ObjectRef},
    runtime::{
        options::MonitorTunables,
        threads::{self, Thread, ThreadData, VmThread},
    },
    MonitorRegistry, Runtime,
};

pub struct MockVM;

impl Runtime for MockVM {
    type Thread = MockThread;

    fn registry() -> &'static MonitorRegistry<Self> {
        &REGISTRY
    }
}

static REGISTRY: LazyLock<MonitorRegistry<MockVM>> =
    LazyLock::new(|| MonitorRegistry::new(MonitorTunables::default()));

pub struct MockThread {
    data: ThreadData,
}

impl Thread<MockVM> for MockThread {
    fn id(thread: VmThread) -> u64 {
        thread.to_address() as u64
    }

    fn tls<'a>(thread: VmThread) -> &'a ThreadData {
        unsafe { &(*(thread.to_address() as *const MockThread)).data }
    }
}

impl MockThread {
    /// Allocate a thread record. Leaked: monitors may keep the identity and
    /// park event reachable for the life of the process.
    pub fn allocate() -> VmThread {
        let raw: &'static MockThread = Box::leak(Box::new(MockThread {
            data: ThreadData::new(),
        }));
        unsafe { VmThread::from_address(raw as *const MockThread as *const u8) }
    }
}

/// Bind a MockThread to the calling OS thread, or return the one already
/// bound.
pub fn attach_current_thread() -> VmThread {
    let current = threads::current_thread();
    if current != VmThread::UNINITIALIZED {
        return current;
    }
    let thread = MockThread::allocate();
    threads::register_current_thread(thread);
    thread
}

/// A heap object reduced to its mark word. Storage is leaked so monitors
/// and weak slots may outlive the test that created it.
#[derive(Copy, Clone)]
pub struct MockObject {
    header: &'static AtomicUsize,
}

impl MockObject {
    pub fn new(hash: usize) -> Self {
        Self {
            header: Box::leak(Box::new(AtomicUsize::new(HeaderWord::neutral(hash).value()))),
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        unsafe {
            ObjectRef::from_raw_address(NonNull::new_unchecked(
                self.header as *const AtomicUsize as *mut u8,
            ))
        }
    }
}
