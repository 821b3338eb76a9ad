/// Run lifecycle notifications. Each method is called at most once per run,
/// from whichever thread observes the transition first.
pub trait LifecycleListener: Send + Sync {
    /// Every sink has finished and all records have been processed.
    fn on_topology_finished(&self) {}

    /// A stop was requested through the controller or an OS signal.
    fn on_stop_requested(&self) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl LifecycleListener for NullListener {}
