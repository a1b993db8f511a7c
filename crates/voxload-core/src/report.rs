//! Final load-test report.
//!
//! Field names and classification labels are part of the output contract:
//! downstream dashboards and CI gates compare reports across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::RunId;

/// Why the hard-stop predicate halted further session creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    CpuExceeded { cpu_percent: f64, limit: f64 },
    MemoryExceeded { memory_percent: f64, limit: f64 },
    SuccessRateBelowMinimum { success_rate: f64, limit: f64 },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuExceeded { cpu_percent, limit } => {
                write!(f, "CPU {:.1}% exceeds {:.1}%", cpu_percent, limit)
            }
            Self::MemoryExceeded {
                memory_percent,
                limit,
            } => write!(f, "memory {:.1}% exceeds {:.1}%", memory_percent, limit),
            Self::SuccessRateBelowMinimum {
                success_rate,
                limit,
            } => write!(f, "success rate {:.1}% below {:.1}%", success_rate, limit),
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// All phases ran to completion.
    Completed,
    /// Ramp-up stopped early because the hard-stop predicate tripped.
    Halted { reason: HaltReason },
    /// Orchestration failed; the report covers the data collected until then.
    Aborted { message: String },
    /// A shutdown signal ended the run before its phases completed.
    Interrupted,
}

impl RunStatus {
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Session counters for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub sessions_started: u64,
    pub sessions_successful: u64,
    pub sessions_failed: u64,
    pub creation_failures: u64,
    pub peak_concurrency: usize,
    pub total_chunks_sent: u64,
    pub total_bytes_sent: u64,
    /// Successful sessions / sessions started, in percent. 0 when nothing started.
    pub success_rate: f64,
    pub error_count: u64,
    /// Recorded errors / sessions started, in percent. 0 when nothing started.
    pub error_rate: f64,
}

/// Average and maximum of one tracked metric against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricAssessment {
    pub average: f64,
    pub maximum: f64,
    pub threshold: Option<f64>,
    pub within_threshold: bool,
}

impl MetricAssessment {
    /// Compares the average against `threshold`; no threshold means within.
    #[must_use]
    pub fn new(average: f64, maximum: f64, threshold: Option<f64>) -> Self {
        let within_threshold = threshold.map_or(true, |limit| average <= limit);
        Self {
            average,
            maximum,
            threshold,
            within_threshold,
        }
    }
}

/// Per-metric assessments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetrics {
    pub cpu_percent: MetricAssessment,
    pub memory_percent: MetricAssessment,
    pub response_time_ms: MetricAssessment,
    pub throughput: MetricAssessment,
}

/// Response-time distribution over sessions that recorded one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Outcome totals for one traffic profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileBreakdown {
    pub profile: String,
    pub sessions_started: u64,
    pub sessions_successful: u64,
    pub sessions_failed: u64,
    pub average_response_time_ms: Option<f64>,
}

/// Named limiting dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottleneckKind {
    #[serde(rename = "CPU-bound")]
    CpuBound,
    #[serde(rename = "memory-bound")]
    MemoryBound,
    #[serde(rename = "latency-bound")]
    LatencyBound,
}

impl BottleneckKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CpuBound => "CPU-bound",
            Self::MemoryBound => "memory-bound",
            Self::LatencyBound => "latency-bound",
        }
    }

    /// Multiplier applied to observed peak concurrency when this bottleneck is present.
    #[must_use]
    pub const fn capacity_factor(&self) -> f64 {
        match self {
            Self::CpuBound => 0.7,
            Self::MemoryBound => 0.8,
            Self::LatencyBound => 0.6,
        }
    }
}

impl fmt::Display for BottleneckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    /// Observed run average of the metric.
    pub average: f64,
    /// Classification limit the average exceeded.
    pub limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalIssueKind {
    LowSuccessRate,
    SlowResponse,
    HighErrorRate,
}

/// Condition severe enough to fail a CI gate on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalIssue {
    pub kind: CriticalIssueKind,
    pub message: String,
    pub observed: f64,
    pub limit: f64,
}

/// Three-tier concurrent-session recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEstimate {
    /// Observed peak discounted by each detected bottleneck.
    pub recommended: usize,
    /// 60% of recommended.
    pub conservative: usize,
    /// 80% of recommended.
    pub realistic: usize,
    /// 100% of recommended.
    pub maximum: usize,
}

/// Whether the measured capacity supports the pilot target load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PilotReadiness {
    pub target_sessions: usize,
    pub can_handle_pilot_load: bool,
    pub blocking_issues: Vec<String>,
}

/// Number of times one error message was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: u64,
}

/// Produced once per run from the aggregator's final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub run_id: RunId,
    pub generated_at: DateTime<Utc>,
    pub run_status: RunStatus,
    pub duration_ms: u64,
    pub summary: ReportSummary,
    pub metrics: ReportMetrics,
    pub response_time_percentiles: LatencyPercentiles,
    pub profiles: Vec<ProfileBreakdown>,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<String>,
    pub critical_issues: Vec<CriticalIssue>,
    pub capacity: CapacityEstimate,
    pub readiness: PilotReadiness,
    pub top_errors: Vec<ErrorCount>,
}

impl LoadTestReport {
    /// Returns true when the report carries any critical issue.
    #[must_use]
    pub fn has_critical_issues(&self) -> bool {
        !self.critical_issues.is_empty()
    }

    /// Returns true when `kind` was detected as a bottleneck.
    #[must_use]
    pub fn has_bottleneck(&self, kind: BottleneckKind) -> bool {
        self.bottlenecks.iter().any(|b| b.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottleneck_labels_are_stable() {
        let json = serde_json::to_string(&BottleneckKind::CpuBound).unwrap();
        assert_eq!(json, "\"CPU-bound\"");
        let json = serde_json::to_string(&BottleneckKind::LatencyBound).unwrap();
        assert_eq!(json, "\"latency-bound\"");
    }

    #[test]
    fn test_run_status_is_tagged() {
        let status = RunStatus::Halted {
            reason: HaltReason::CpuExceeded {
                cpu_percent: 95.0,
                limit: 80.0,
            },
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "halted");
        assert_eq!(value["reason"]["kind"], "cpu_exceeded");
    }

    #[test]
    fn test_metric_assessment_without_threshold_is_within() {
        let assessment = MetricAssessment::new(12.0, 30.0, None);
        assert!(assessment.within_threshold);

        let assessment = MetricAssessment::new(85.0, 90.0, Some(80.0));
        assert!(!assessment.within_threshold);
    }
}
