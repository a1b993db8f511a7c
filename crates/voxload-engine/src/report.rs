//! Report generation.
//!
//! Turns the aggregator's final [`RunData`] into a [`LoadTestReport`]. Pure
//! over its inputs apart from the generation timestamp.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use voxload_core::{
    Bottleneck, BottleneckKind, CapacityEstimate, CriticalIssue, CriticalIssueKind, ErrorCount,
    LatencyPercentiles, LoadTestConfig, LoadTestReport, MetricAssessment, PilotReadiness,
    ProfileBreakdown, ReportMetrics, ReportSummary, RunId, RunStatus,
};

use crate::aggregator::RunData;

/// Average CPU above which the run is classified CPU-bound.
pub const CPU_BOUND_PERCENT: f64 = 75.0;
/// Average memory above which the run is classified memory-bound.
pub const MEMORY_BOUND_PERCENT: f64 = 80.0;
/// Average response time above which the run is classified latency-bound.
pub const LATENCY_BOUND_MS: f64 = 2_500.0;

/// Success rate below which a critical issue is raised.
pub const CRITICAL_SUCCESS_RATE: f64 = 90.0;
/// Any single response slower than this is a critical issue.
pub const CRITICAL_RESPONSE_TIME_MS: f64 = 5_000.0;
/// Error rate above which a critical issue is raised.
pub const CRITICAL_ERROR_RATE: f64 = 10.0;

const CONSERVATIVE_SHARE: f64 = 0.6;
const REALISTIC_SHARE: f64 = 0.8;
const TOP_ERRORS: usize = 10;

pub struct ReportGenerator<'a> {
    config: &'a LoadTestConfig,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(config: &'a LoadTestConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, run_id: RunId, data: &RunData, run_status: RunStatus) -> LoadTestReport {
        let summary = summarize(data);
        let metrics = self.assess(data);
        let bottlenecks = detect_bottlenecks(&metrics);
        let recommendations = bottlenecks.iter().map(|b| recommendation(b.kind)).collect();
        let critical_issues = critical_issues(&summary, &metrics);
        let capacity = estimate_capacity(data.peak_active, &bottlenecks);
        let readiness = self.readiness(&capacity, &critical_issues, &run_status);

        LoadTestReport {
            run_id,
            generated_at: Utc::now(),
            run_status,
            duration_ms: data.duration_ms,
            summary,
            metrics,
            response_time_percentiles: LatencyPercentiles {
                p50_ms: data.response_time_percentile(0.50),
                p95_ms: data.response_time_percentile(0.95),
                p99_ms: data.response_time_percentile(0.99),
                max_ms: data.response_times_ms().into_iter().max().unwrap_or(0),
            },
            profiles: profile_breakdown(data),
            bottlenecks,
            recommendations,
            critical_issues,
            capacity,
            readiness,
            top_errors: top_errors(data),
        }
    }

    fn assess(&self, data: &RunData) -> ReportMetrics {
        let thresholds = &self.config.thresholds;
        let (cpu_avg, cpu_max) = data.snapshot_stats(|s| s.cpu_percent);
        let (mem_avg, mem_max) = data.snapshot_stats(|s| s.memory_percent);
        let (rt_avg, rt_max) = data.response_time_stats();
        let (tp_avg, tp_max) = data.snapshot_stats(|s| s.throughput);

        ReportMetrics {
            cpu_percent: MetricAssessment::new(cpu_avg, cpu_max, Some(thresholds.max_cpu_percent)),
            memory_percent: MetricAssessment::new(
                mem_avg,
                mem_max,
                Some(thresholds.max_memory_percent),
            ),
            response_time_ms: MetricAssessment::new(
                rt_avg,
                rt_max,
                Some(thresholds.max_response_time_ms as f64),
            ),
            throughput: MetricAssessment::new(tp_avg, tp_max, None),
        }
    }

    fn readiness(
        &self,
        capacity: &CapacityEstimate,
        critical_issues: &[CriticalIssue],
        run_status: &RunStatus,
    ) -> PilotReadiness {
        let target_sessions = self.config.load.pilot_target();
        let mut blocking_issues: Vec<String> =
            critical_issues.iter().map(|issue| issue.message.clone()).collect();

        if capacity.recommended < target_sessions {
            blocking_issues.push(format!(
                "recommended capacity {} is below the pilot target of {} sessions",
                capacity.recommended, target_sessions
            ));
        }
        match run_status {
            RunStatus::Aborted { message } => {
                blocking_issues.push(format!("run aborted: {}", message));
            }
            RunStatus::Interrupted => {
                blocking_issues.push("run interrupted before all phases completed".to_string());
            }
            RunStatus::Completed | RunStatus::Halted { .. } => {}
        }

        PilotReadiness {
            target_sessions,
            can_handle_pilot_load: blocking_issues.is_empty(),
            blocking_issues,
        }
    }
}

fn summarize(data: &RunData) -> ReportSummary {
    let counters = data.counters;
    ReportSummary {
        sessions_started: counters.started,
        sessions_successful: counters.successful,
        sessions_failed: counters.failed,
        creation_failures: counters.creation_failures,
        peak_concurrency: data.peak_active,
        total_chunks_sent: counters.chunks_sent,
        total_bytes_sent: counters.bytes_sent,
        success_rate: data.success_rate(),
        error_count: data.error_count(),
        error_rate: data.error_rate(),
    }
}

/// Classifies run averages against the fixed bottleneck limits.
pub fn detect_bottlenecks(metrics: &ReportMetrics) -> Vec<Bottleneck> {
    [
        (
            BottleneckKind::CpuBound,
            metrics.cpu_percent.average,
            CPU_BOUND_PERCENT,
        ),
        (
            BottleneckKind::MemoryBound,
            metrics.memory_percent.average,
            MEMORY_BOUND_PERCENT,
        ),
        (
            BottleneckKind::LatencyBound,
            metrics.response_time_ms.average,
            LATENCY_BOUND_MS,
        ),
    ]
    .into_iter()
    .filter(|(_, average, limit)| average > limit)
    .map(|(kind, average, limit)| Bottleneck {
        kind,
        average,
        limit,
    })
    .collect()
}

/// One remediation per bottleneck.
pub fn recommendation(kind: BottleneckKind) -> String {
    match kind {
        BottleneckKind::CpuBound => {
            "Scale the streaming service horizontally or move it to instances with more CPU cores"
        }
        BottleneckKind::MemoryBound => {
            "Raise the memory allocation per instance and audit per-session buffers for leaks"
        }
        BottleneckKind::LatencyBound => {
            "Add workers to the response pipeline or shed load earlier to cut response latency"
        }
    }
    .to_string()
}

/// Discounts the observed peak by every detected bottleneck.
pub fn estimate_capacity(peak_active: usize, bottlenecks: &[Bottleneck]) -> CapacityEstimate {
    let factor: f64 = bottlenecks.iter().map(|b| b.kind.capacity_factor()).product();
    let recommended = (peak_active as f64 * factor).floor() as usize;
    CapacityEstimate {
        recommended,
        conservative: (recommended as f64 * CONSERVATIVE_SHARE).floor() as usize,
        realistic: (recommended as f64 * REALISTIC_SHARE).floor() as usize,
        maximum: recommended,
    }
}

fn critical_issues(summary: &ReportSummary, metrics: &ReportMetrics) -> Vec<CriticalIssue> {
    let mut issues = Vec::new();

    if summary.sessions_started > 0 && summary.success_rate < CRITICAL_SUCCESS_RATE {
        issues.push(CriticalIssue {
            kind: CriticalIssueKind::LowSuccessRate,
            message: format!(
                "success rate {:.1}% is below {:.0}%",
                summary.success_rate, CRITICAL_SUCCESS_RATE
            ),
            observed: summary.success_rate,
            limit: CRITICAL_SUCCESS_RATE,
        });
    }

    if metrics.response_time_ms.maximum > CRITICAL_RESPONSE_TIME_MS {
        issues.push(CriticalIssue {
            kind: CriticalIssueKind::SlowResponse,
            message: format!(
                "slowest response took {:.0}ms, above {:.0}ms",
                metrics.response_time_ms.maximum, CRITICAL_RESPONSE_TIME_MS
            ),
            observed: metrics.response_time_ms.maximum,
            limit: CRITICAL_RESPONSE_TIME_MS,
        });
    }

    if summary.error_rate > CRITICAL_ERROR_RATE {
        issues.push(CriticalIssue {
            kind: CriticalIssueKind::HighErrorRate,
            message: format!(
                "error rate {:.1}% is above {:.0}%",
                summary.error_rate, CRITICAL_ERROR_RATE
            ),
            observed: summary.error_rate,
            limit: CRITICAL_ERROR_RATE,
        });
    }

    issues
}

fn profile_breakdown(data: &RunData) -> Vec<ProfileBreakdown> {
    #[derive(Default)]
    struct Totals {
        started: u64,
        successful: u64,
        failed: u64,
        response_sum_ms: u64,
        responses: u64,
    }

    let mut by_profile: BTreeMap<&str, Totals> = BTreeMap::new();
    for record in &data.sessions {
        let totals = by_profile.entry(record.profile.as_str()).or_default();
        totals.started += 1;
        if record.is_terminal() {
            if record.successful {
                totals.successful += 1;
            } else {
                totals.failed += 1;
            }
        }
        if let Some(ms) = record.response_time_ms {
            totals.response_sum_ms += ms;
            totals.responses += 1;
        }
    }

    by_profile
        .into_iter()
        .map(|(profile, totals)| ProfileBreakdown {
            profile: profile.to_string(),
            sessions_started: totals.started,
            sessions_successful: totals.successful,
            sessions_failed: totals.failed,
            average_response_time_ms: (totals.responses > 0)
                .then(|| totals.response_sum_ms as f64 / totals.responses as f64),
        })
        .collect()
}

fn top_errors(data: &RunData) -> Vec<ErrorCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for error in data.sessions.iter().flat_map(|r| r.errors.iter()) {
        *counts.entry(error.message.as_str()).or_default() += 1;
    }

    let mut errors: Vec<ErrorCount> = counts
        .into_iter()
        .map(|(message, count)| ErrorCount {
            message: message.to_string(),
            count,
        })
        .collect();
    errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    errors.truncate(TOP_ERRORS);
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SessionCounters;
    use voxload_core::{
        CloseReason, HaltReason, MetricsSnapshot, SessionId, SessionRecord, SessionState,
    };

    fn snapshot(cpu: f64, memory: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp_ms: 0,
            cpu_percent: cpu,
            memory_percent: memory,
            active_sessions: 10,
            throughput: 1.0,
        }
    }

    fn session(id: u64, response_ms: Option<u64>, error: Option<&str>) -> SessionRecord {
        let mut record = SessionRecord::new(SessionId::from_raw(id), "stockholm", 0);
        record.mark_connected(0).unwrap();
        if let Some(ms) = response_ms {
            record.record_response(ms);
        }
        if let Some(message) = error {
            record.record_error(message, 10);
        }
        record
            .finish(SessionState::Closed, CloseReason::DurationElapsed, 100)
            .unwrap();
        record
    }

    fn run_data(sessions: Vec<SessionRecord>, snapshots: Vec<MetricsSnapshot>) -> RunData {
        let successful = sessions.iter().filter(|r| r.successful).count() as u64;
        let started = sessions.len() as u64;
        RunData {
            duration_ms: 10_000,
            peak_active: sessions.len(),
            counters: SessionCounters {
                started,
                successful,
                failed: started - successful,
                errors: sessions.iter().map(|r| r.errors.len() as u64).sum(),
                ..Default::default()
            },
            sessions,
            snapshots,
        }
    }

    fn config(pilot_target: usize) -> LoadTestConfig {
        let mut config = LoadTestConfig::default();
        config.load.pilot_target_sessions = Some(pilot_target);
        config
    }

    #[test]
    fn test_healthy_run() {
        let sessions = (1..=10).map(|id| session(id, Some(400), None)).collect();
        let data = run_data(sessions, vec![snapshot(40.0, 50.0); 5]);
        let report = ReportGenerator::new(&config(10)).generate(RunId::new(), &data, RunStatus::Completed);

        assert_eq!(report.summary.success_rate, 100.0);
        assert!(report.bottlenecks.is_empty());
        assert!(report.recommendations.is_empty());
        assert!(!report.has_critical_issues());
        assert_eq!(report.capacity.recommended, 10);
        assert_eq!(report.capacity.conservative, 6);
        assert_eq!(report.capacity.realistic, 8);
        assert!(report.readiness.can_handle_pilot_load);
        assert!(report.metrics.cpu_percent.within_threshold);
    }

    #[test]
    fn test_bottlenecks_compound_capacity() {
        let sessions = (1..=100).map(|id| session(id, Some(2_600), None)).collect();
        let data = run_data(sessions, vec![snapshot(78.0, 82.0); 3]);
        let report = ReportGenerator::new(&config(50)).generate(RunId::new(), &data, RunStatus::Completed);

        assert!(report.has_bottleneck(BottleneckKind::CpuBound));
        assert!(report.has_bottleneck(BottleneckKind::MemoryBound));
        assert!(report.has_bottleneck(BottleneckKind::LatencyBound));
        assert_eq!(report.recommendations.len(), 3);
        // 100 * 0.7 * 0.8 * 0.6 = 33.6
        assert_eq!(report.capacity.recommended, 33);
        assert!(!report.readiness.can_handle_pilot_load);
    }

    #[test]
    fn test_bottleneck_limits_are_exclusive() {
        let sessions = vec![session(1, Some(2_500), None)];
        let data = run_data(sessions, vec![snapshot(75.0, 80.0)]);
        let report = ReportGenerator::new(&config(1)).generate(RunId::new(), &data, RunStatus::Completed);
        assert!(report.bottlenecks.is_empty());
    }

    #[test]
    fn test_critical_issues() {
        let mut sessions: Vec<SessionRecord> =
            (1..=8).map(|id| session(id, Some(300), None)).collect();
        sessions.push(session(9, Some(6_000), Some("response time 6000ms exceeds threshold 3000ms")));
        sessions.push(session(10, None, Some("connection refused")));
        let data = run_data(sessions, vec![snapshot(30.0, 30.0)]);

        let report = ReportGenerator::new(&config(10)).generate(RunId::new(), &data, RunStatus::Completed);
        let kinds: Vec<CriticalIssueKind> = report.critical_issues.iter().map(|i| i.kind).collect();

        assert_eq!(report.summary.success_rate, 80.0);
        assert_eq!(report.summary.error_rate, 20.0);
        assert_eq!(
            kinds,
            vec![
                CriticalIssueKind::LowSuccessRate,
                CriticalIssueKind::SlowResponse,
                CriticalIssueKind::HighErrorRate
            ]
        );
        assert!(!report.readiness.can_handle_pilot_load);
        assert_eq!(report.top_errors.len(), 2);
    }

    #[test]
    fn test_empty_run() {
        let data = RunData::default();
        let report = ReportGenerator::new(&config(0)).generate(RunId::new(), &data, RunStatus::Completed);

        assert_eq!(report.summary.sessions_started, 0);
        assert_eq!(report.summary.success_rate, 0.0);
        assert_eq!(report.summary.error_rate, 0.0);
        assert!(report.critical_issues.is_empty());
        assert_eq!(report.capacity.recommended, 0);
        assert!(report.profiles.is_empty());
        assert_eq!(report.response_time_percentiles, LatencyPercentiles::default());
    }

    #[test]
    fn test_halted_cpu_bound_run_recommends_below_peak() {
        let sessions = vec![session(1, Some(200), None)];
        let data = run_data(sessions, vec![snapshot(95.0, 40.0); 4]);
        let status = RunStatus::Halted {
            reason: HaltReason::CpuExceeded {
                cpu_percent: 95.0,
                limit: 80.0,
            },
        };
        let report = ReportGenerator::new(&config(1)).generate(RunId::new(), &data, status);

        assert!(report.has_bottleneck(BottleneckKind::CpuBound));
        assert!(report.capacity.recommended < report.summary.peak_concurrency);
        assert!(!report.metrics.cpu_percent.within_threshold);
    }

    #[test]
    fn test_aborted_run_blocks_readiness() {
        let sessions = (1..=4).map(|id| session(id, Some(100), None)).collect();
        let data = run_data(sessions, vec![snapshot(10.0, 10.0)]);
        let status = RunStatus::Aborted {
            message: "metrics monitor stopped unexpectedly".to_string(),
        };
        let report = ReportGenerator::new(&config(2)).generate(RunId::new(), &data, status);

        assert!(!report.readiness.can_handle_pilot_load);
        assert!(report.readiness.blocking_issues[0].starts_with("run aborted"));
    }

    #[test]
    fn test_interrupted_run_blocks_readiness() {
        let sessions = (1..=4).map(|id| session(id, Some(100), None)).collect();
        let data = run_data(sessions, vec![snapshot(10.0, 10.0)]);
        let report =
            ReportGenerator::new(&config(2)).generate(RunId::new(), &data, RunStatus::Interrupted);

        assert!(report.critical_issues.is_empty());
        assert!(!report.readiness.can_handle_pilot_load);
        assert!(report
            .readiness
            .blocking_issues
            .iter()
            .any(|issue| issue.contains("interrupted")));
    }

    #[test]
    fn test_profile_breakdown() {
        let mut failed = SessionRecord::new(SessionId::from_raw(3), "malmo", 0);
        failed.record_error("refused", 0);
        failed
            .finish(SessionState::Failed, CloseReason::TransportError, 0)
            .unwrap();
        let sessions = vec![session(1, Some(100), None), session(2, Some(300), None), failed];
        let data = run_data(sessions, Vec::new());

        let profiles = profile_breakdown(&data);
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].profile, "malmo");
        assert_eq!(profiles[0].sessions_failed, 1);
        assert_eq!(profiles[0].average_response_time_ms, None);
        assert_eq!(profiles[1].profile, "stockholm");
        assert_eq!(profiles[1].sessions_successful, 2);
        assert_eq!(profiles[1].average_response_time_ms, Some(200.0));
    }
}
