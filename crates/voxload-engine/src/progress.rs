//! Periodic progress logging.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use voxload_core::ThresholdConfig;

use crate::aggregator::MetricsAggregator;
use crate::orchestrator::Phase;

/// Point-in-time view of a running test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub elapsed_ms: u64,
    pub active_sessions: usize,
    pub sessions_started: u64,
    /// Successful / started, in percent.
    pub success_rate: f64,
    /// Successful / completed, in percent. Judged against the threshold.
    pub settled_success_rate: Option<f64>,
    pub average_response_time_ms: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

impl ProgressSnapshot {
    pub fn capture(aggregator: &MetricsAggregator, phase: Phase) -> Self {
        let sample = aggregator.latest_sample();
        Self {
            phase,
            elapsed_ms: aggregator.elapsed_ms(),
            active_sessions: aggregator.active_count(),
            sessions_started: aggregator.counters().started,
            success_rate: aggregator.success_rate(),
            settled_success_rate: aggregator.settled_success_rate(),
            average_response_time_ms: aggregator.average_response_time_ms(),
            cpu_percent: sample.map(|s| s.cpu_percent),
            memory_percent: sample.map(|s| s.memory_percent),
        }
    }

    /// Human-readable threshold breaches, empty when healthy.
    pub fn breaches(&self, thresholds: &ThresholdConfig) -> Vec<String> {
        let mut breaches = Vec::new();
        if let Some(cpu) = self.cpu_percent.filter(|cpu| *cpu > thresholds.max_cpu_percent) {
            breaches.push(format!(
                "CPU {:.1}% above {:.1}%",
                cpu, thresholds.max_cpu_percent
            ));
        }
        if let Some(memory) = self
            .memory_percent
            .filter(|memory| *memory > thresholds.max_memory_percent)
        {
            breaches.push(format!(
                "memory {:.1}% above {:.1}%",
                memory, thresholds.max_memory_percent
            ));
        }
        if let Some(ms) = self
            .average_response_time_ms
            .filter(|ms| *ms > thresholds.max_response_time_ms as f64)
        {
            breaches.push(format!(
                "average response time {:.0}ms above {}ms",
                ms, thresholds.max_response_time_ms
            ));
        }
        // Same rule as the hard stop: in-flight sessions are not failures.
        if let Some(rate) = self
            .settled_success_rate
            .filter(|_| self.sessions_started >= thresholds.min_sessions_for_success_check)
            .filter(|rate| *rate < thresholds.min_success_rate)
        {
            breaches.push(format!(
                "success rate {:.1}% below {:.1}%",
                rate, thresholds.min_success_rate
            ));
        }
        breaches
    }
}

/// Logs a [`ProgressSnapshot`] every interval until aborted.
pub struct ProgressReporter {
    aggregator: Arc<MetricsAggregator>,
    thresholds: ThresholdConfig,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(aggregator: Arc<MetricsAggregator>, thresholds: ThresholdConfig, interval: Duration) -> Self {
        Self {
            aggregator,
            thresholds,
            interval,
        }
    }

    pub async fn run(self, phase: watch::Receiver<Phase>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = *phase.borrow();
            if current == Phase::Done {
                break;
            }

            let snapshot = ProgressSnapshot::capture(&self.aggregator, current);
            info!(
                phase = %snapshot.phase,
                elapsed_s = snapshot.elapsed_ms / 1000,
                active_sessions = snapshot.active_sessions,
                sessions_started = snapshot.sessions_started,
                success_rate = format_args!("{:.1}", snapshot.success_rate),
                avg_response_ms = snapshot.average_response_time_ms.map(|ms| ms.round() as u64),
                cpu_percent = snapshot.cpu_percent.map(|cpu| cpu.round() as u64),
                memory_percent = snapshot.memory_percent.map(|mem| mem.round() as u64),
                "Progress"
            );
            for breach in snapshot.breaches(&self.thresholds) {
                warn!(phase = %snapshot.phase, breach = %breach, "Threshold breached");
            }
        }
    }
}
