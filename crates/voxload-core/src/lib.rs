//! Core domain types for the voxload streaming load tester.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod report;
pub mod session;

pub use config::{
    EndpointConfig, LoadConfig, LoadTestConfig, LoggingConfig, MonitoringConfig, SessionConfig,
    ThresholdConfig, ThrottleConfig, TrafficProfile,
};
pub use error::{CoreError, CoreResult, TransportError};
pub use ids::{RunId, SessionId, SessionIdAllocator};
pub use metrics::{MetricsSnapshot, ResourceSample};
pub use report::{
    Bottleneck, BottleneckKind, CapacityEstimate, CriticalIssue, CriticalIssueKind, ErrorCount,
    HaltReason, LatencyPercentiles, LoadTestReport, MetricAssessment, PilotReadiness,
    ProfileBreakdown, ReportMetrics, ReportSummary, RunStatus,
};
pub use session::{CloseReason, SessionError, SessionRecord, SessionState};
