pub mod arrow;
pub mod config;
pub mod control;
pub mod error;
pub mod mailbox;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod topology;
pub mod utils;
pub mod worker;

pub mod prelude;

pub use utils::logger::Throttle;
