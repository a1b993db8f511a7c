use serde::{Deserialize, Serialize};

/// Point-in-time host utilization, both values 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl ResourceSample {
    #[must_use]
    pub const fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
        }
    }
}

/// One entry of the append-only metrics time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Milliseconds since run start. Non-decreasing across the series.
    pub timestamp_ms: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_sessions: usize,
    /// Sessions started per second of elapsed run time.
    pub throughput: f64,
}
