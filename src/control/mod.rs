mod controller;
mod listener;
pub(crate) mod run_state;
mod services;

pub use controller::{ProcessingController, RunStatus, StopHandle};
pub use listener::{LifecycleListener, NullListener};
pub use services::ServiceRegistry;
