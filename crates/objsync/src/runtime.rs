use crate::sync::registry::MonitorRegistry;

pub mod options;
pub mod park;
pub mod threads;

pub use threads::{Thread, ThreadData, VmThread};

/// The embedding runtime. Mirrors the shape of a VM binding: one type
/// implementing this trait per embedder, with associated thread machinery
/// and a process-wide registry owning monitor storage and tunables.
pub trait Runtime: 'static + Sized + Send + Sync {
    type Thread: threads::Thread<Self>;

    /// Identity of the calling thread. The default resolves through the
    /// thread-local registered with
    /// [`register_current_thread`](threads::register_current_thread).
    fn current_thread() -> VmThread {
        threads::current_thread()
    }

    fn registry() -> &'static MonitorRegistry<Self>;
}
