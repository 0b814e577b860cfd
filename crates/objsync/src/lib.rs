pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;

pub type ThreadOf<R> = <R as Runtime>::Thread;

pub use runtime::Runtime;
pub use sync::object_monitor::ObjectMonitor;
pub use sync::registry::MonitorRegistry;
