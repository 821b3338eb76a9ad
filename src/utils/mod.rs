pub use core_pinner::*;
pub use stop_signal::*;

pub mod backoff;
mod core_pinner;
pub mod logger;
pub mod params_io;
mod stop_signal;
