use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(r: LogRotation) -> Self {
        match r {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Where log lines go. In a config file:
///
/// ```toml
/// [logger.output]
/// kind = "file"
/// dir = "/var/log/arrowrt"
/// rotation = "hourly"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogOutput {
    #[default]
    Stdout,
    File {
        dir: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        rotation: LogRotation,
        /// Rotated files kept on disk. At least one.
        #[serde(default = "default_max_files")]
        max_files: usize,
    },
}

fn default_prefix() -> String {
    "arrowrt".to_string()
}

fn default_max_files() -> usize {
    4
}

/// `logger` section of the engine config. The controller installs it on
/// `start`; embedders with their own subscriber leave the section out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`. Anything else reads as `info`.
    pub level: String,
    pub output: LogOutput,
    /// Include the emitting thread name (`arrowrt-worker-N`) in each line.
    pub thread_names: bool,
    /// Colored output. Never applied to files.
    pub ansi: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            thread_names: true,
            ansi: true,
        }
    }
}

impl LoggerConfig {
    pub fn level(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::INFO)
    }

    /// Opens the rolling file for a `File` output; `None` for stdout.
    pub fn rolling_appender(&self) -> anyhow::Result<Option<RollingFileAppender>> {
        let LogOutput::File {
            dir,
            prefix,
            rotation,
            max_files,
        } = &self.output
        else {
            return Ok(None);
        };
        let appender = RollingFileAppender::builder()
            .rotation((*rotation).into())
            .max_log_files((*max_files).max(1))
            .filename_prefix(prefix)
            .filename_suffix("log")
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {}", dir.display()))?;
        Ok(Some(appender))
    }

    /// Installs the global subscriber. A subscriber that is already installed
    /// is left alone. Keep the returned guard alive while logging to a file.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let fmt = tracing_subscriber::fmt()
            .with_max_level(self.level())
            .with_thread_names(self.thread_names);

        match self.rolling_appender()? {
            Some(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                if fmt.with_ansi(false).with_writer(writer).try_init().is_err() {
                    tracing::debug!("[Logger] subscriber already installed; file output unused");
                }
                tracing::info!("[Logger] logging to {:?}", self.output);
                Ok(Some(guard))
            }
            None => {
                if fmt.with_ansi(self.ansi).try_init().is_err() {
                    tracing::debug!("[Logger] subscriber already installed");
                }
                Ok(None)
            }
        }
    }
}

/// Rate limiter for a single log callsite.
///
/// Messages inside `interval` of the previous emitted one are dropped and
/// counted; the next emitted message carries the count as `suppressed`.
///
/// ```ignore
/// warn_throttled!(Duration::from_secs(5), arrow = name, "record dropped: {err:#}");
/// ```
pub struct Throttle {
    last: Mutex<Instant>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        let start = Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(Instant::now);
        Self {
            last: Mutex::new(start),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed_since_last)` when the caller may emit.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        if self.interval.as_nanos() > 0
            && let Some(guard) = self.last.try_lock()
        {
            if guard.elapsed() < self.interval {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            drop(guard);
        }

        let mut last = self.last.lock();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Level-generic form: `log_throttled!(warn, interval, ...)`.
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::Throttle> = std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! error_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! info_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(info,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! debug_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(debug, $interval, $($arg)*); } }
