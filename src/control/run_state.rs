use crate::control::LifecycleListener;
use crate::error::EngineError;
use crate::utils::StopSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// State shared by the controller and every worker of one run.
pub(crate) struct RunState {
    pub(crate) epoch: Instant,
    stop: StopSignal,
    finished: StopSignal,
    failure: Mutex<Option<(String, String)>>,
    listener: Mutex<Option<Arc<dyn LifecycleListener>>>,
}

impl RunState {
    pub(crate) fn new(listener: Option<Arc<dyn LifecycleListener>>) -> Self {
        Self {
            epoch: Instant::now(),
            stop: StopSignal::new(),
            finished: StopSignal::new(),
            failure: Mutex::new(None),
            listener: Mutex::new(listener),
        }
    }

    #[inline]
    pub(crate) fn should_exit(&self) -> bool {
        self.stop.is_triggered() || self.finished.is_triggered()
    }

    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.is_triggered()
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.is_triggered()
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn LifecycleListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn LifecycleListener>> {
        self.listener.lock().clone()
    }

    /// Cooperative stop. The listener hears about it once.
    pub(crate) fn request_stop(&self) {
        if self.stop.trigger() {
            tracing::info!("[Controller] stop requested");
            if let Some(listener) = self.listener() {
                listener.on_stop_requested();
            }
        }
    }

    pub(crate) fn notify_finished(&self) {
        if self.finished.trigger() {
            tracing::info!("[Controller] topology finished");
            if let Some(listener) = self.listener() {
                listener.on_topology_finished();
            }
        }
    }

    /// Keeps the first failure and halts every worker.
    pub(crate) fn fail(&self, arrow: &str, err: EngineError) {
        let (arrow, detail) = match err {
            EngineError::ArrowFailed { arrow, detail } => (arrow, detail),
            other => (arrow.to_string(), other.to_string()),
        };
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                tracing::error!("[Controller] arrow '{arrow}' failed: {detail}");
                *failure = Some((arrow, detail));
            }
        }
        self.stop.trigger();
    }

    pub(crate) fn failure(&self) -> Option<EngineError> {
        self.failure
            .lock()
            .as_ref()
            .map(|(arrow, detail)| EngineError::ArrowFailed {
                arrow: arrow.clone(),
                detail: detail.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        finished: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl LifecycleListener for Counting {
        fn on_topology_finished(&self) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }

        fn on_stop_requested(&self) {
            self.stopped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn notifications_are_delivered_once() {
        let listener = Arc::new(Counting::default());
        let run = RunState::new(Some(listener.clone()));
        run.request_stop();
        run.request_stop();
        run.notify_finished();
        run.notify_finished();
        assert_eq!(listener.stopped.load(Ordering::Relaxed), 1);
        assert_eq!(listener.finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn first_failure_wins_and_stops_run() {
        let run = RunState::new(None);
        run.fail("a", EngineError::fatal("first"));
        run.fail("b", EngineError::fatal("second"));
        assert!(run.should_exit());
        match run.failure() {
            Some(EngineError::ArrowFailed { arrow, detail }) => {
                assert_eq!(arrow, "a");
                assert_eq!(detail, "fatal: first");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }
}
