//! Adaptive concurrency control.
//!
//! Two independent checks:
//!
//! - **Soft throttle**: shrinks the concurrency target multiplicatively while
//!   recent averages show pressure. Existing sessions are never cut.
//! - **Hard stop**: a predicate that blocks any new session while the host or
//!   the success rate is past its limit.

use voxload_core::{HaltReason, LoadTestConfig, ThresholdConfig, ThrottleConfig};

use crate::aggregator::MetricsAggregator;
use crate::orchestrator::Phase;

/// Health inputs of the soft throttle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSignals {
    /// CPU averaged over the recent window.
    pub cpu_percent: Option<f64>,
    /// Memory averaged over the recent window.
    pub memory_percent: Option<f64>,
    /// Mean response time of all recorded responses.
    pub response_time_ms: Option<f64>,
}

impl HealthSignals {
    pub fn observe(aggregator: &MetricsAggregator) -> Self {
        let window = aggregator.window_average();
        Self {
            cpu_percent: window.map(|s| s.cpu_percent),
            memory_percent: window.map(|s| s.memory_percent),
            response_time_ms: aggregator.average_response_time_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveConcurrencyController {
    max_sessions: usize,
    throttle: ThrottleConfig,
    thresholds: ThresholdConfig,
}

impl AdaptiveConcurrencyController {
    pub fn new(config: &LoadTestConfig) -> Self {
        Self {
            max_sessions: config.load.max_concurrent_sessions,
            throttle: config.throttle.clone(),
            thresholds: config.thresholds.clone(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Current concurrency target for `phase`.
    pub fn target(&self, aggregator: &MetricsAggregator, phase: Phase) -> usize {
        self.target_for(&HealthSignals::observe(aggregator), phase)
    }

    /// Applies every triggered throttle factor to the configured maximum.
    ///
    /// While sessions are being created the target never drops below 1, so
    /// the run keeps measuring.
    pub fn target_for(&self, health: &HealthSignals, phase: Phase) -> usize {
        let mut target = self.max_sessions as f64;
        if health.cpu_percent.is_some_and(|cpu| cpu > self.throttle.cpu_percent) {
            target *= self.throttle.cpu_factor;
        }
        if health
            .memory_percent
            .is_some_and(|memory| memory > self.throttle.memory_percent)
        {
            target *= self.throttle.memory_factor;
        }
        if health
            .response_time_ms
            .is_some_and(|ms| ms > self.throttle.response_time_ms)
        {
            target *= self.throttle.response_time_factor;
        }

        let target = target.floor() as usize;
        if self.max_sessions > 0 && phase.creates_sessions() {
            target.max(1)
        } else {
            target
        }
    }

    /// Hard-stop predicate, evaluated before every session creation.
    ///
    /// Reads only the latest sample and the running counters. Without a
    /// sample, or before the first session, nothing blocks.
    pub fn should_halt(&self, aggregator: &MetricsAggregator) -> Option<HaltReason> {
        let counters = aggregator.counters();
        if counters.started == 0 {
            return None;
        }

        if let Some(sample) = aggregator.latest_sample() {
            if sample.cpu_percent > self.thresholds.max_cpu_percent {
                return Some(HaltReason::CpuExceeded {
                    cpu_percent: sample.cpu_percent,
                    limit: self.thresholds.max_cpu_percent,
                });
            }
            if sample.memory_percent > self.thresholds.max_memory_percent {
                return Some(HaltReason::MemoryExceeded {
                    memory_percent: sample.memory_percent,
                    limit: self.thresholds.max_memory_percent,
                });
            }
        }

        if counters.started >= self.thresholds.min_sessions_for_success_check {
            if let Some(rate) = aggregator.settled_success_rate() {
                if rate < self.thresholds.min_success_rate {
                    return Some(HaltReason::SuccessRateBelowMinimum {
                        success_rate: rate,
                        limit: self.thresholds.min_success_rate,
                    });
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::StaticSampler;
    use voxload_core::{CloseReason, SessionId, SessionRecord, SessionState};

    fn controller(max: usize) -> AdaptiveConcurrencyController {
        let mut config = LoadTestConfig::default();
        config.load.max_concurrent_sessions = max;
        AdaptiveConcurrencyController::new(&config)
    }

    fn start_session(aggregator: &MetricsAggregator, id: u64) -> SessionId {
        let id = SessionId::from_raw(id);
        aggregator
            .register_session(SessionRecord::new(id, "stockholm", 0))
            .unwrap();
        id
    }

    #[test]
    fn test_healthy_target_is_max() {
        let health = HealthSignals {
            cpu_percent: Some(40.0),
            memory_percent: Some(50.0),
            response_time_ms: Some(800.0),
        };
        assert_eq!(controller(100).target_for(&health, Phase::Sustained), 100);
        assert_eq!(
            controller(100).target_for(&HealthSignals::default(), Phase::RampUp),
            100
        );
    }

    #[test]
    fn test_factors_compound() {
        let c = controller(100);
        let cpu_only = HealthSignals {
            cpu_percent: Some(75.0),
            ..Default::default()
        };
        assert_eq!(c.target_for(&cpu_only, Phase::Sustained), 80);

        let all = HealthSignals {
            cpu_percent: Some(75.0),
            memory_percent: Some(80.0),
            response_time_ms: Some(3500.0),
        };
        // 100 * 0.8 * 0.9 * 0.85 = 61.2
        assert_eq!(c.target_for(&all, Phase::Sustained), 61);
    }

    #[test]
    fn test_throttle_thresholds_are_exclusive() {
        let at_limit = HealthSignals {
            cpu_percent: Some(70.0),
            memory_percent: Some(75.0),
            response_time_ms: Some(3000.0),
        };
        assert_eq!(controller(50).target_for(&at_limit, Phase::Sustained), 50);
    }

    #[test]
    fn test_target_floor_of_one_while_creating() {
        let pressure = HealthSignals {
            cpu_percent: Some(99.0),
            memory_percent: Some(99.0),
            response_time_ms: Some(9000.0),
        };
        assert_eq!(controller(1).target_for(&pressure, Phase::RampUp), 1);
        assert_eq!(controller(1).target_for(&pressure, Phase::RampDown), 0);
        assert_eq!(controller(0).target_for(&pressure, Phase::Sustained), 0);
    }

    #[tokio::test]
    async fn test_no_halt_without_samples() {
        let aggregator = MetricsAggregator::new(10);
        start_session(&aggregator, 1);
        assert_eq!(controller(10).should_halt(&aggregator), None);
    }

    #[tokio::test]
    async fn test_first_session_is_never_blocked() {
        let aggregator = MetricsAggregator::new(10);
        aggregator.sample(&StaticSampler::new(99.0, 99.0));
        assert_eq!(controller(10).should_halt(&aggregator), None);
    }

    #[tokio::test]
    async fn test_halts_on_cpu_and_memory() {
        let aggregator = MetricsAggregator::new(10);
        start_session(&aggregator, 1);

        aggregator.sample(&StaticSampler::new(95.0, 40.0));
        assert!(matches!(
            controller(10).should_halt(&aggregator),
            Some(HaltReason::CpuExceeded { .. })
        ));

        aggregator.sample(&StaticSampler::new(50.0, 90.0));
        assert!(matches!(
            controller(10).should_halt(&aggregator),
            Some(HaltReason::MemoryExceeded { .. })
        ));

        aggregator.sample(&StaticSampler::new(80.0, 85.0));
        assert_eq!(controller(10).should_halt(&aggregator), None);
    }

    #[tokio::test]
    async fn test_success_rate_check_waits_for_enough_sessions() {
        let aggregator = MetricsAggregator::new(10);
        aggregator.sample(&StaticSampler::idle());

        for i in 1..=49 {
            let id = start_session(&aggregator, i);
            aggregator.fail_session(id, "refused", CloseReason::TransportError);
        }
        assert_eq!(controller(100).should_halt(&aggregator), None);

        let id = start_session(&aggregator, 50);
        aggregator.mark_connected(id);
        aggregator
            .complete_session(id, SessionState::Closed, CloseReason::DurationElapsed)
            .unwrap();
        assert!(matches!(
            controller(100).should_halt(&aggregator),
            Some(HaltReason::SuccessRateBelowMinimum { .. })
        ));
    }
}
