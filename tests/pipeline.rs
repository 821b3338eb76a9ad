use arrowrt::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(20);

fn config(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        mailbox_capacity: 16,
        stop_grace_ms: 2_000,
        poll_interval_ms: 2,
        ..EngineConfig::default()
    }
}

fn run_to_end<T: Send + 'static>(topology: Topology<T>, workers: usize) -> ProcessingController<T> {
    let mut ctrl = ProcessingController::new(topology, config(workers));
    ctrl.start(0).expect("start");
    let status = ctrl.wait_until_finished(LONG).expect("run");
    assert_eq!(status, RunStatus::Finished);
    ctrl
}

#[test]
fn doubled_records_reach_the_sink_and_everything_closes() {
    let sum = Arc::new(AtomicU64::new(0));
    let mut b = TopologyBuilder::<u64>::from_config(&config(4));
    let q1 = b.mailbox("raw");
    let q2 = b.mailbox("doubled");
    let total = sum.clone();
    b.source("numbers", IterSource::new(0..100u64), q1)
        .processor(
            "doubler",
            |v: &mut u64| -> anyhow::Result<()> {
                *v *= 2;
                Ok(())
            },
            q1,
            q2,
        )
        .sink(
            "adder",
            move |v: &mut u64| -> anyhow::Result<()> {
                total.fetch_add(*v, Ordering::Relaxed);
                Ok(())
            },
            q2,
        );

    let ctrl = run_to_end(b.build().expect("valid"), 4);
    assert_eq!(sum.load(Ordering::Relaxed), 9_900);

    let topo = ctrl.topology();
    topo.promote_drained();
    assert!(topo.arrows().iter().all(|a| a.status() == ArrowStatus::Finished));
    assert!(topo.mailboxes().iter().all(|m| m.is_closed() && m.depth() == 0));

    let summary = ctrl.snapshot_metrics();
    assert_eq!(summary.total_processed, 100);
    assert_eq!(summary.total_transient_errors, 0);
    assert_eq!(summary.thread_count, 4);
}

#[test]
fn split_routes_by_parity() {
    let evens = Arc::new(Mutex::new(Vec::new()));
    let odds = Arc::new(Mutex::new(Vec::new()));
    let mut b = TopologyBuilder::<u32>::new();
    let input = b.mailbox("in");
    let even_q = b.mailbox("even");
    let odd_q = b.mailbox("odd");
    let (e, o) = (evens.clone(), odds.clone());
    b.source("numbers", IterSource::new(0..50u32), input)
        .split("parity", input, &[even_q, odd_q], |v: &u32| (*v % 2) as usize)
        .sink(
            "evens",
            move |v: &mut u32| -> anyhow::Result<()> {
                e.lock().push(*v);
                Ok(())
            },
            even_q,
        )
        .sink(
            "odds",
            move |v: &mut u32| -> anyhow::Result<()> {
                o.lock().push(*v);
                Ok(())
            },
            odd_q,
        );

    run_to_end(b.build().expect("valid"), 3);
    let evens = evens.lock();
    let odds = odds.lock();
    assert_eq!(evens.len(), 25);
    assert_eq!(odds.len(), 25);
    assert!(evens.iter().all(|v| v % 2 == 0));
    assert!(odds.iter().all(|v| v % 2 == 1));
    // Sequential stages keep the source order.
    assert!(evens.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn merge_delivers_every_input() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut b = TopologyBuilder::<u32>::new();
    let a = b.mailbox("a");
    let c = b.mailbox("c");
    let merged = b.mailbox("merged");
    let s = seen.clone();
    b.source("low", IterSource::new(0..20u32), a)
        .source("high", IterSource::new(100..120u32), c)
        .merge("fan_in", &[a, c], merged)
        .sink(
            "collect",
            move |v: &mut u32| -> anyhow::Result<()> {
                s.lock().push(*v);
                Ok(())
            },
            merged,
        );

    run_to_end(b.build().expect("valid"), 2);
    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..20).chain(100..120).collect();
    assert_eq!(seen, expected);
}

#[test]
fn barrier_orders_records_through_a_parallel_stage() {
    let mut script: VecDeque<Emit<u32>> = (1..=5).map(Emit::Record).collect();
    script.push_back(Emit::Barrier(100));
    script.extend((6..=10).map(Emit::Record));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut b = TopologyBuilder::<u32>::new();
    let gated = b.barrier_mailbox("gated", 8);
    let out = b.mailbox("out");
    let seen = order.clone();
    b.source(
        "script",
        move || script.pop_front().unwrap_or(Emit::EndOfStream),
        gated,
    )
    .parallel_processor(
        "jitter",
        |v: &mut u32| -> anyhow::Result<()> {
            thread::sleep(Duration::from_micros(u64::from(*v % 3) * 200));
            Ok(())
        },
        gated,
        out,
    )
    .sink(
        "collect",
        move |v: &mut u32| -> anyhow::Result<()> {
            seen.lock().push(*v);
            Ok(())
        },
        out,
    );

    run_to_end(b.build().expect("valid"), 4);
    let order = order.lock();
    assert_eq!(order.len(), 11);
    let barrier_at = order.iter().position(|&v| v == 100).expect("barrier delivered");
    assert_eq!(barrier_at, 5);
    assert!(order[..5].iter().all(|&v| v <= 5));
    assert!(order[6..].iter().all(|&v| (6..=10).contains(&v)));
}

struct Doubler;

impl SubeventProcessor<Vec<u64>, u64> for Doubler {
    fn split(&self, parent: &mut Vec<u64>) -> anyhow::Result<Vec<u64>> {
        Ok(std::mem::take(parent))
    }

    fn process(&self, sub: &mut u64) -> anyhow::Result<()> {
        *sub *= 2;
        Ok(())
    }

    fn merge(&self, parent: &mut Vec<u64>, subs: Vec<u64>) -> anyhow::Result<()> {
        parent.extend(subs);
        Ok(())
    }
}

#[test]
fn subevent_results_merge_back_in_order() {
    let parents = Arc::new(Mutex::new(Vec::new()));
    let mut b = TopologyBuilder::<Vec<u64>>::new();
    let q1 = b.mailbox("parents");
    let q2 = b.mailbox("merged");
    let p = parents.clone();
    b.source(
        "events",
        IterSource::new((0..20u64).map(|i| vec![i, i + 1, i + 2])),
        q1,
    )
    .subevent_with_window("hits", Doubler, q1, q2, 4)
    .sink(
        "collect",
        move |v: &mut Vec<u64>| -> anyhow::Result<()> {
            p.lock().push(v.clone());
            Ok(())
        },
        q2,
    );

    run_to_end(b.build().expect("valid"), 4);
    let parents = parents.lock();
    assert_eq!(parents.len(), 20);
    for parent in parents.iter() {
        let i = parent[0] / 2;
        assert_eq!(parent, &vec![2 * i, 2 * i + 2, 2 * i + 4]);
    }
    let total: u64 = parents.iter().flatten().sum();
    assert_eq!(total, 1_260);
}

#[test]
fn mailbox_depth_never_exceeds_capacity() {
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox_with_capacity("narrow", 4);
    b.source("fast", IterSource::new(0..300u32), q).sink(
        "slow",
        |_: &mut u32| -> anyhow::Result<()> {
            thread::sleep(Duration::from_micros(100));
            Ok(())
        },
        q,
    );

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(3));
    ctrl.start(0).expect("start");
    let narrow = ctrl.topology().mailbox_by_name("narrow").expect("mailbox").clone();
    loop {
        assert!(narrow.depth() <= 4);
        match ctrl.wait_until_finished(Duration::from_millis(1)).expect("run") {
            RunStatus::Finished => break,
            RunStatus::TimedOut => continue,
            RunStatus::Stopped => panic!("nobody asked to stop"),
        }
    }
    assert_eq!(ctrl.snapshot_metrics().total_processed, 300);
}

#[test]
fn sequential_stage_never_runs_on_two_workers() {
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut b = TopologyBuilder::<u32>::new();
    let q1 = b.mailbox("in");
    let q2 = b.mailbox("out");
    let (inside_c, peak_c) = (inside.clone(), peak.clone());
    b.source("numbers", IterSource::new(0..200u32), q1)
        .processor(
            "stateful",
            move |_: &mut u32| -> anyhow::Result<()> {
                let now = inside_c.fetch_add(1, Ordering::SeqCst) + 1;
                peak_c.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(20));
                inside_c.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
            q1,
            q2,
        )
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q2);

    run_to_end(b.build().expect("valid"), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn transient_errors_drop_only_the_failing_record() {
    let kept = Arc::new(AtomicUsize::new(0));
    let mut b = TopologyBuilder::<u32>::new();
    let q1 = b.mailbox("in");
    let q2 = b.mailbox("out");
    let k = kept.clone();
    b.source("numbers", IterSource::new(0..30u32), q1)
        .processor(
            "picky",
            |v: &mut u32| -> anyhow::Result<()> {
                if *v % 10 == 0 {
                    anyhow::bail!("record {v} rejected");
                }
                Ok(())
            },
            q1,
            q2,
        )
        .sink(
            "count",
            move |_: &mut u32| -> anyhow::Result<()> {
                k.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            q2,
        );

    let ctrl = run_to_end(b.build().expect("valid"), 2);
    assert_eq!(kept.load(Ordering::Relaxed), 27);
    let summary = ctrl.snapshot_metrics();
    assert_eq!(summary.arrow("picky").map(|a| a.transient_errors), Some(3));
}

#[test]
fn double_checkin_fails_the_run() {
    let pool = ResourcePool::<Vec<u8>>::with_default(PoolConfig::default());
    let mut b = TopologyBuilder::<u32>::new();
    let q1 = b.mailbox("in");
    let q2 = b.mailbox("out");
    b.source("numbers", IterSource::new(0..10u32), q1)
        .processor(
            "pooler",
            move |v: &mut u32| -> anyhow::Result<()> {
                let (item, ticket) = pool.try_checkout()?.detach();
                pool.checkin_ticket(item, ticket)?;
                if *v == 3 {
                    pool.checkin_ticket(Vec::new(), ticket)?;
                }
                Ok(())
            },
            q1,
            q2,
        )
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q2);

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2));
    ctrl.start(0).expect("start");
    match ctrl.wait_until_finished(LONG) {
        Err(EngineError::ArrowFailed { arrow, detail }) => {
            assert_eq!(arrow, "pooler");
            assert!(detail.contains("double checkin"), "{detail}");
        }
        other => panic!("expected arrow failure, got {other:?}"),
    }
    assert!(ctrl.is_stopped());
}

#[test]
fn panicking_arrow_fails_the_run() {
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..10u32), q).sink(
        "fragile",
        |v: &mut u32| -> anyhow::Result<()> {
            if *v == 5 {
                panic!("cannot handle five");
            }
            Ok(())
        },
        q,
    );

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2));
    ctrl.start(0).expect("start");
    match ctrl.wait_until_finished(LONG) {
        Err(EngineError::ArrowFailed { arrow, detail }) => {
            assert_eq!(arrow, "fragile");
            assert!(detail.contains("cannot handle five"), "{detail}");
        }
        other => panic!("expected arrow failure, got {other:?}"),
    }
}

#[test]
fn stop_leaves_queued_records_behind() {
    let mut n = 0u32;
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox_with_capacity("backlog", 1_000);
    b.source(
        "endless",
        move || {
            n = n.wrapping_add(1);
            Emit::Record(n)
        },
        q,
    )
    .sink(
        "slow",
        |_: &mut u32| -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        },
        q,
    );

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2));
    ctrl.start(0).expect("start");
    thread::sleep(Duration::from_millis(100));
    ctrl.request_stop();
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Stopped);
    assert!(!ctrl.is_finished());
    assert_eq!(ctrl.detached_workers(), 0);
    let backlog = ctrl.topology().mailbox_by_name("backlog").expect("mailbox");
    assert!(backlog.depth() > 0);
}

#[derive(Default)]
struct Counting {
    finished: AtomicUsize,
    stopped: AtomicUsize,
}

impl LifecycleListener for Counting {
    fn on_topology_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stop_requested(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn listener_hears_finish_exactly_once() {
    let listener = Arc::new(Counting::default());
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..50u32), q)
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(4))
        .with_listener(listener.clone());
    ctrl.start(0).expect("start");
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Finished);
    drop(ctrl);
    assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
    assert_eq!(listener.stopped.load(Ordering::SeqCst), 0);
}

#[test]
fn idle_run_times_out_then_stops() {
    let listener = Arc::new(Counting::default());
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("quiet", || Emit::<u32>::NotReady, q)
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2))
        .with_listener(listener.clone());
    ctrl.start(0).expect("start");
    assert_eq!(
        ctrl.wait_until_finished(Duration::from_millis(30)).expect("run"),
        RunStatus::TimedOut
    );
    ctrl.request_stop();
    ctrl.request_stop();
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Stopped);
    assert_eq!(listener.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(listener.finished.load(Ordering::SeqCst), 0);
}

#[test]
fn scale_only_grows_and_lifecycle_calls_are_checked() {
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..500u32), q)
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(1));
    assert!(matches!(ctrl.scale(2), Err(EngineError::NotStarted)));
    assert!(matches!(
        ctrl.wait_until_finished(Duration::ZERO),
        Err(EngineError::NotStarted)
    ));

    ctrl.start(1).expect("start");
    assert!(matches!(ctrl.start(1), Err(EngineError::AlreadyStarted)));
    ctrl.scale(3).expect("grow");
    assert_eq!(ctrl.worker_count(), 3);
    ctrl.scale(2).expect("shrink is ignored");
    assert_eq!(ctrl.worker_count(), 3);

    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Finished);
    assert_eq!(ctrl.snapshot_metrics().total_processed, 500);
}

#[test]
fn open_hooks_see_registered_services() {
    struct Calibration(u32);

    struct Scaled {
        factor: u32,
    }

    impl RecordProcessor<u32> for Scaled {
        fn open(&mut self, services: &ServiceRegistry) -> anyhow::Result<()> {
            self.factor = services.require::<Calibration>()?.0;
            Ok(())
        }

        fn process(&mut self, record: &mut u32) -> anyhow::Result<()> {
            *record *= self.factor;
            Ok(())
        }
    }

    let sum = Arc::new(AtomicU64::new(0));
    let mut b = TopologyBuilder::<u32>::new();
    let q1 = b.mailbox("in");
    let q2 = b.mailbox("out");
    let s = sum.clone();
    b.source("numbers", IterSource::new(1..=4u32), q1)
        .processor("scale", Scaled { factor: 0 }, q1, q2)
        .sink(
            "sum",
            move |v: &mut u32| -> anyhow::Result<()> {
                s.fetch_add(u64::from(*v), Ordering::Relaxed);
                Ok(())
            },
            q2,
        );

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2))
        .with_services(ServiceRegistry::new().with(Calibration(3)));
    ctrl.start(0).expect("start");
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Finished);
    assert_eq!(sum.load(Ordering::Relaxed), 30);
}

fn endless_topology() -> Topology<u32> {
    let mut n = 0u32;
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source(
        "endless",
        move || {
            n = n.wrapping_add(1);
            Emit::Record(n)
        },
        q,
    )
    .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);
    b.build().expect("valid")
}

#[test]
fn unbounded_wait_and_grace_are_accepted() {
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..50u32), q)
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);
    let mut ctrl = ProcessingController::new(b.build().expect("valid"), config(2));
    ctrl.start(0).expect("start");
    assert_eq!(
        ctrl.wait_until_finished(Duration::MAX).expect("run"),
        RunStatus::Finished
    );

    let cfg = EngineConfig {
        stop_grace_ms: u64::MAX,
        ..config(2)
    };
    let mut ctrl = ProcessingController::new(endless_topology(), cfg);
    ctrl.start(0).expect("start");
    thread::sleep(Duration::from_millis(20));
    ctrl.request_stop();
    assert_eq!(
        ctrl.wait_until_finished(Duration::MAX).expect("run"),
        RunStatus::Stopped
    );
    assert_eq!(ctrl.detached_workers(), 0);
}

#[test]
fn stop_handle_ends_a_wait_from_another_thread() {
    let listener = Arc::new(Counting::default());
    let ctrl = ProcessingController::new(endless_topology(), config(2));
    let handle = ctrl.stop_handle();
    let mut ctrl = ctrl.with_listener(listener.clone());
    ctrl.start(0).expect("start");

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.request_stop();
        handle.is_stop_requested()
    });
    let started = std::time::Instant::now();
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Stopped);
    assert!(started.elapsed() < LONG);
    assert!(stopper.join().expect("stopper thread"));
    assert!(ctrl.is_stopped());
    assert_eq!(listener.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn stuck_worker_fails_the_run() {
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..3u32), q).sink(
        "sleepy",
        |_: &mut u32| -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(600));
            Ok(())
        },
        q,
    );
    let cfg = EngineConfig {
        worker_timeout_ms: 100,
        warmup_timeout_ms: 100,
        stop_grace_ms: 50,
        ..config(1)
    };

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), cfg);
    ctrl.start(0).expect("start");
    match ctrl.wait_until_finished(LONG) {
        Err(EngineError::ArrowFailed { arrow, detail }) => {
            assert_eq!(arrow, "sleepy");
            assert!(detail.contains("stuck"), "detail: {detail}");
            assert!(detail.contains("worker 0"), "detail: {detail}");
        }
        other => panic!("expected a worker timeout, got {other:?}"),
    }
    assert_eq!(ctrl.detached_workers(), 1);
}

#[test]
fn file_logger_writes_into_the_configured_dir() {
    let dir = std::env::temp_dir().join(format!("arrowrt-pipeline-log-{}", std::process::id()));
    let cfg = EngineConfig {
        logger: Some(LoggerConfig {
            level: "debug".into(),
            output: LogOutput::File {
                dir: dir.clone(),
                prefix: "pipeline".into(),
                rotation: LogRotation::Never,
                max_files: 1,
            },
            ..LoggerConfig::default()
        }),
        ..config(2)
    };
    let mut b = TopologyBuilder::<u32>::new();
    let q = b.mailbox("in");
    b.source("numbers", IterSource::new(0..20u32), q)
        .sink("drop", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);

    let mut ctrl = ProcessingController::new(b.build().expect("valid"), cfg);
    ctrl.start(0).expect("start");
    assert_eq!(ctrl.wait_until_finished(LONG).expect("run"), RunStatus::Finished);
    drop(ctrl);
    assert!(dir.join("pipeline.log").exists());
    std::fs::remove_dir_all(&dir).ok();
}
