/// A view of the CPU resources of the node. The pool uses this as a sizing
/// hint for prestart and idle eviction, assuming the common case where each
/// task holds one CPU.
pub trait NodeResources: Send + Sync + 'static {
    fn available_cpus(&self) -> i64;
}

/// Reports the total CPU count of the machine. The daemon substitutes a view
/// backed by its resource accounting when one is available.
pub struct SystemNodeResources;

impl NodeResources for SystemNodeResources {
    fn available_cpus(&self) -> i64 {
        num_cpus::get() as i64
    }
}
