use crate::arrow::{ArrowKind, ArrowStatus};
use crate::mailbox::MailboxSnapshot;
use crate::topology::Topology;
use crate::worker::WorkerHandle;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct ArrowSummary {
    pub name: String,
    pub kind: ArrowKind,
    pub status: ArrowStatus,
    pub parallel: bool,
    pub active_executors: usize,
    pub processed: u64,
    pub transient_errors: u64,
    pub executions: u64,
    pub idle_visits: u64,
    pub busy_ms: f64,
    pub wait_ms: f64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: f64,
    /// Records waiting in the arrow's input mailboxes.
    pub queue_depth: usize,
    pub held: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub cpu_id: Option<usize>,
    pub running: bool,
    pub visits: u64,
    pub assignments: u64,
    pub useful_ms: f64,
    pub idle_ms: f64,
    pub scheduler_ms: f64,
    pub utilization: f64,
    pub last_heartbeat_ms_ago: f64,
    pub current_arrow: Option<String>,
}

/// Point-in-time report over the whole run. Rates that cannot be computed
/// yet are reported as zero.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSummary {
    pub uptime_s: f64,
    pub thread_count: usize,
    /// Records consumed by sinks.
    pub total_processed: u64,
    pub total_transient_errors: u64,
    pub avg_throughput_hz: f64,
    pub latest_throughput_hz: f64,
    /// Throughput ceiling set by the slowest non-parallel arrow.
    pub avg_seq_bottleneck_hz: f64,
    /// Throughput ceiling of the slowest parallel arrow given every worker.
    pub avg_par_bottleneck_hz: f64,
    /// Mean worker utilization.
    pub efficiency: f64,
    pub deadlock_warnings: u64,
    pub arrows: Vec<ArrowSummary>,
    pub workers: Vec<WorkerSummary>,
    pub mailboxes: Vec<MailboxSnapshot>,
}

#[inline]
fn ms(ns: u64) -> f64 {
    ns as f64 / 1e6
}

impl ComponentSummary {
    pub(crate) fn collect<T: Send + 'static>(
        topology: &Topology<T>,
        workers: &[WorkerHandle],
        uptime: Duration,
        heartbeat_epoch: Instant,
        deadlock_warnings: u64,
    ) -> Self {
        let arrows: Vec<ArrowSummary> = topology
            .arrows()
            .iter()
            .map(|a| {
                let m = a.metrics().snapshot();
                ArrowSummary {
                    name: a.name().to_string(),
                    kind: a.kind(),
                    status: a.status(),
                    parallel: a.core().is_parallel(),
                    active_executors: a.core().active_executors(),
                    processed: m.processed,
                    transient_errors: m.transient_errors,
                    executions: m.executions,
                    idle_visits: m.idle_visits,
                    busy_ms: ms(m.busy_ns),
                    wait_ms: ms(m.wait_ns),
                    avg_latency_ms: m.avg_latency_ms(),
                    last_latency_ms: ms(m.last_latency_ns),
                    queue_depth: a.inputs().iter().map(|q| q.depth()).sum(),
                    held: a.held(),
                }
            })
            .collect();

        let workers: Vec<WorkerSummary> = workers
            .iter()
            .map(|w| {
                let m = w.metrics().snapshot();
                WorkerSummary {
                    worker_id: w.id(),
                    cpu_id: m.cpu_id,
                    running: !w.is_done(),
                    visits: m.visits,
                    assignments: m.assignments,
                    useful_ms: ms(m.useful_ns),
                    idle_ms: ms(m.idle_ns),
                    scheduler_ms: ms(m.scheduler_ns),
                    utilization: m.utilization(),
                    last_heartbeat_ms_ago: m.heartbeat_age(heartbeat_epoch).as_secs_f64() * 1e3,
                    current_arrow: m
                        .current_arrow
                        .and_then(|i| topology.arrows().get(i))
                        .map(|a| a.name().to_string()),
                }
            })
            .collect();

        let total_processed = topology
            .sinks()
            .iter()
            .map(|&i| topology.arrows()[i].metrics().processed())
            .sum();
        let total_transient_errors = arrows.iter().map(|a| a.transient_errors).sum();

        let uptime_s = uptime.as_secs_f64();
        let avg_throughput_hz = if uptime_s > 0.0 {
            total_processed as f64 / uptime_s
        } else {
            0.0
        };

        let thread_count = workers.len();
        let bottleneck = |parallel: bool| {
            arrows
                .iter()
                .filter(|a| a.parallel == parallel && a.avg_latency_ms > 0.0)
                .map(|a| {
                    let per_exec = 1000.0 / a.avg_latency_ms;
                    if parallel {
                        per_exec * thread_count.max(1) as f64
                    } else {
                        per_exec
                    }
                })
                .min_by(|a, b| a.total_cmp(b))
                .unwrap_or(0.0)
        };
        let avg_seq_bottleneck_hz = bottleneck(false);
        let avg_par_bottleneck_hz = bottleneck(true);

        let efficiency = if workers.is_empty() {
            0.0
        } else {
            workers.iter().map(|w| w.utilization).sum::<f64>() / workers.len() as f64
        };

        Self {
            uptime_s,
            thread_count,
            total_processed,
            total_transient_errors,
            avg_throughput_hz,
            latest_throughput_hz: 0.0,
            avg_seq_bottleneck_hz,
            avg_par_bottleneck_hz,
            efficiency,
            deadlock_warnings,
            arrows,
            workers,
            mailboxes: topology.mailboxes().iter().map(|m| m.snapshot()).collect(),
        }
    }

    pub(crate) fn with_latest_throughput(mut self, hz: f64) -> Self {
        self.latest_throughput_hz = hz;
        self
    }

    pub fn arrow(&self, name: &str) -> Option<&ArrowSummary> {
        self.arrows.iter().find(|a| a.name == name)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for ComponentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "uptime {:.2}s | threads {} | processed {} | errors {} | avg {:.1} Hz | latest {:.1} Hz | eff {:.1}% | stalls {}",
            self.uptime_s,
            self.thread_count,
            self.total_processed,
            self.total_transient_errors,
            self.avg_throughput_hz,
            self.latest_throughput_hz,
            self.efficiency * 100.0,
            self.deadlock_warnings,
        )?;
        writeln!(
            f,
            "bottleneck seq {:.1} Hz | par {:.1} Hz",
            self.avg_seq_bottleneck_hz, self.avg_par_bottleneck_hz
        )?;
        writeln!(
            f,
            "{:<20} {:<10} {:<9} {:>10} {:>7} {:>6} {:>5} {:>10}",
            "arrow", "kind", "status", "processed", "errors", "queue", "held", "avg ms"
        )?;
        for a in &self.arrows {
            writeln!(
                f,
                "{:<20} {:<10} {:<9} {:>10} {:>7} {:>6} {:>5} {:>10.4}",
                a.name,
                a.kind.to_string(),
                format!("{:?}", a.status),
                a.processed,
                a.transient_errors,
                a.queue_depth,
                a.held,
                a.avg_latency_ms,
            )?;
        }
        for w in &self.workers {
            writeln!(
                f,
                "worker {:>3} cpu {:>4} util {:>5.1}% visits {:>8} current {}",
                w.worker_id,
                w.cpu_id.map_or_else(|| "-".to_string(), |c| c.to_string()),
                w.utilization * 100.0,
                w.visits,
                w.current_arrow.as_deref().unwrap_or("-"),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::IterSource;
    use crate::control::ServiceRegistry;
    use crate::topology::TopologyBuilder;

    #[test]
    fn collects_one_row_per_arrow_and_mailbox() {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        b.source("src", IterSource::new(0..2u32), q)
            .sink("sink", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);
        let topo = b.build().expect("valid");
        topo.activate_initial_sources(&ServiceRegistry::new())
            .expect("activate");

        let summary = ComponentSummary::collect(&topo, &[], Duration::ZERO, Instant::now(), 0);
        assert_eq!(summary.arrows.len(), 2);
        assert_eq!(summary.mailboxes.len(), 1);
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.avg_throughput_hz, 0.0);
        assert_eq!(summary.avg_seq_bottleneck_hz, 0.0);
        assert_eq!(summary.arrow("sink").map(|a| a.kind), Some(ArrowKind::Sink));

        let text = summary.to_string();
        assert!(text.contains("src"));
        let json = summary.to_json().expect("json");
        assert!(json.contains("\"total_processed\": 0"));
    }
}
