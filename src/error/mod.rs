use std::{error::Error, fmt};
use thiserror::Error;

const ERR_MSG_MAILBOX_FULL: &str = "mailbox is full";
const ERR_MSG_MAILBOX_CLOSED: &str = "mailbox is closed";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PushFailReason {
    /// Capacity reached, or a barrier is waiting for the queue to empty.
    Full,
    /// The producing side already closed the mailbox.
    Closed,
}

impl fmt::Display for PushFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushFailReason::Full => write!(f, "{ERR_MSG_MAILBOX_FULL}"),
            PushFailReason::Closed => write!(f, "{ERR_MSG_MAILBOX_CLOSED}"),
        }
    }
}

/// Rejected push. The value is handed back so the caller can hold and retry it.
#[derive(Debug)]
pub struct PushError<T> {
    pub value: T,
    pub reason: PushFailReason,
}

impl<T> PushError<T> {
    pub fn full(value: T) -> Self {
        Self {
            value,
            reason: PushFailReason::Full,
        }
    }

    pub fn closed(value: T) -> Self {
        Self {
            value,
            reason: PushFailReason::Closed,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.reason == PushFailReason::Full
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for PushError<T> {}

/// Malformed graph, raised by `TopologyBuilder::build` before any worker starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no arrows")]
    Empty,
    #[error("topology has no source arrow")]
    NoSource,
    #[error("duplicate arrow name '{0}'")]
    DuplicateName(String),
    #[error("mailbox id {0} was not created by this builder")]
    UnknownMailbox(usize),
    #[error("mailbox '{0}' has no producing arrow")]
    NoProducer(String),
    #[error("mailbox '{mailbox}' is produced by both '{first}' and '{second}'")]
    MultipleProducers {
        mailbox: String,
        first: String,
        second: String,
    },
    #[error("mailbox '{0}' has no consuming arrow")]
    NoConsumer(String),
    #[error("mailbox '{mailbox}' is consumed by both '{first}' and '{second}'; use a split arrow")]
    MultipleConsumers {
        mailbox: String,
        first: String,
        second: String,
    },
    #[error("arrow '{arrow}' is wired to mailbox '{mailbox}' more than once")]
    SelfLoop { arrow: String, mailbox: String },
    #[error("arrow '{0}' needs at least one input and one output")]
    Unwired(String),
    #[error("topology contains a cycle through {0:?}")]
    Cycle(Vec<String>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Soft limit reached; retry after something is checked back in.
    #[error("resource pool soft limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    /// Checkin of a ticket that is not currently checked out of this pool.
    #[error("double checkin of pool slot {slot} (generation {generation})")]
    DoubleCheckin { slot: usize, generation: u64 },
    #[error("checkout cancelled")]
    Cancelled,
    #[error("checkout timed out")]
    Timeout,
}

impl PoolError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::CapacityExceeded { .. } | PoolError::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("arrow '{arrow}' failed: {detail}")]
    ArrowFailed { arrow: String, detail: String },
    /// Raised by user callbacks to stop the run instead of dropping one record.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("invalid engine config: {0}")]
    Config(String),
    /// A worker spent longer than the configured timeout inside one execution.
    #[error("worker {worker_id} stuck in arrow '{arrow}' for {elapsed_ms} ms")]
    WorkerTimeout {
        worker_id: usize,
        arrow: String,
        elapsed_ms: u64,
    },
    #[error("controller already started")]
    AlreadyStarted,
    #[error("controller not started")]
    NotStarted,
    #[error("failed to spawn worker {worker_id}: {source}")]
    WorkerSpawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn fatal(detail: impl Into<String>) -> Self {
        EngineError::Fatal(detail.into())
    }
}

/// Whether an error returned by user code must terminate the run.
///
/// Pool misuse and explicit [`EngineError::Fatal`] values are fatal; everything
/// else is treated as a transient, per-record failure.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    if let Some(engine) = err.downcast_ref::<EngineError>() {
        return matches!(
            engine,
            EngineError::Fatal(_)
                | EngineError::ArrowFailed { .. }
                | EngineError::Pool(PoolError::DoubleCheckin { .. })
        );
    }
    matches!(
        err.downcast_ref::<PoolError>(),
        Some(PoolError::DoubleCheckin { .. })
    )
}
