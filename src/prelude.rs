pub use crate::arrow::{
    ArrowKind, ArrowStatus, Emit, IterSource, ParallelProcessor, RecordProcessor, RecordSource,
    SubeventProcessor,
};
pub use crate::config::EngineConfig;
pub use crate::control::{
    LifecycleListener, NullListener, ProcessingController, RunStatus, ServiceRegistry, StopHandle,
};
pub use crate::error::{EngineError, EngineResult, PoolError, TopologyError};
pub use crate::mailbox::{Mailbox, MailboxMode, Message, Pop};
pub use crate::metrics::ComponentSummary;
pub use crate::pool::{PoolConfig, Pooled, ResourcePool};
pub use crate::scheduler::SchedulerPolicy;
pub use crate::topology::{MailboxId, Topology, TopologyBuilder};
pub use crate::utils::logger::{LogOutput, LogRotation, LoggerConfig};
