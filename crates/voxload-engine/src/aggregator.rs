//! Central run state: session registry, counters and the metrics time series.
//!
//! All mutation goes through [`MetricsAggregator`], guarded by one lock so the
//! accounting invariant `active + completed == started` holds at every
//! observation point. The lock is never held across an await.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, warn};
use voxload_core::{
    CloseReason, CoreError, CoreResult, MetricsSnapshot, ResourceSample, SessionId, SessionRecord,
    SessionState,
};

use crate::sampler::ResourceSampler;

/// Monotonic session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub started: u64,
    pub successful: u64,
    pub failed: u64,
    /// Creation attempts that never produced a session.
    pub creation_failures: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ResponseStats {
    sum_ms: u64,
    count: u64,
    max_ms: u64,
}

#[derive(Debug, Default)]
struct AggregatorState {
    snapshots: Vec<MetricsSnapshot>,
    active: HashMap<SessionId, SessionRecord>,
    completed: Vec<SessionRecord>,
    counters: SessionCounters,
    responses: ResponseStats,
    peak_active: usize,
    latest_sample: Option<ResourceSample>,
}

/// Shared accumulator for one run.
#[derive(Debug)]
pub struct MetricsAggregator {
    started_at: Instant,
    health_window: usize,
    state: RwLock<AggregatorState>,
}

impl MetricsAggregator {
    /// Starts the run clock. `health_window` is the number of recent snapshots
    /// averaged by [`window_average`](Self::window_average).
    pub fn new(health_window: usize) -> Self {
        Self {
            started_at: Instant::now(),
            health_window: health_window.max(1),
            state: RwLock::new(AggregatorState::default()),
        }
    }

    /// Milliseconds since the aggregator was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Adds a freshly created session. Duplicate ids are rejected and not
    /// counted as started.
    pub fn register_session(&self, record: SessionRecord) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.active.contains_key(&record.id) || state.completed.iter().any(|r| r.id == record.id)
        {
            return Err(CoreError::already_exists("session", record.id.to_string()));
        }

        state.active.insert(record.id, record);
        state.counters.started += 1;
        state.peak_active = state.peak_active.max(state.active.len());
        Ok(())
    }

    /// Counts a creation attempt that failed before a session existed.
    pub fn record_creation_failure(&self) {
        self.state.write().counters.creation_failures += 1;
    }

    /// `Connecting -> Connected`. Returns false when the session is no longer
    /// active or the transition is invalid.
    pub fn mark_connected(&self, id: SessionId) -> bool {
        let now = self.elapsed_ms();
        let mut state = self.state.write();
        let Some(record) = state.active.get_mut(&id) else {
            return false;
        };
        match record.mark_connected(now) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Rejected connect transition");
                false
            }
        }
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.state.read().active.contains_key(&id)
    }

    /// Counts one sent chunk. Returns false once the session is terminal,
    /// which tells the driver to stop its cadence.
    pub fn record_chunk_sent(&self, id: SessionId, bytes: usize) -> bool {
        let mut state = self.state.write();
        let Some(record) = state.active.get_mut(&id) else {
            return false;
        };
        if record.record_chunk(bytes).is_err() {
            return false;
        }
        state.counters.chunks_sent += 1;
        state.counters.bytes_sent += bytes as u64;
        true
    }

    /// Records the first timed response. Returns true only for the first one.
    pub fn record_response(&self, id: SessionId, response_time_ms: u64) -> bool {
        let mut state = self.state.write();
        let recorded = state
            .active
            .get_mut(&id)
            .map_or(false, |record| record.record_response(response_time_ms));
        if recorded {
            let stats = &mut state.responses;
            stats.sum_ms += response_time_ms;
            stats.count += 1;
            stats.max_ms = stats.max_ms.max(response_time_ms);
        }
        recorded
    }

    /// Appends an error to an active session.
    pub fn record_error(&self, id: SessionId, message: impl Into<String>) -> bool {
        let now = self.elapsed_ms();
        let mut state = self.state.write();
        let recorded = state
            .active
            .get_mut(&id)
            .map_or(false, |record| record.record_error(message, now));
        if recorded {
            state.counters.errors += 1;
        }
        recorded
    }

    /// Moves a session from active to completed.
    ///
    /// Returns `Ok(false)` when the session already completed, so repeated
    /// completion is a no-op. An invalid transition leaves the session active.
    pub fn complete_session(
        &self,
        id: SessionId,
        terminal: SessionState,
        reason: CloseReason,
    ) -> CoreResult<bool> {
        let now = self.elapsed_ms();
        let mut state = self.state.write();
        let Some(record) = state.active.get_mut(&id) else {
            return Ok(false);
        };
        record.finish(terminal, reason, now)?;

        if let Some(record) = state.active.remove(&id) {
            if record.successful {
                state.counters.successful += 1;
            } else {
                state.counters.failed += 1;
            }
            debug!(
                session_id = %id,
                state = record.state.as_str(),
                successful = record.successful,
                "Session completed"
            );
            state.completed.push(record);
        }
        Ok(true)
    }

    /// Records `message` and completes the session as `Failed`.
    pub fn fail_session(&self, id: SessionId, message: impl Into<String>, reason: CloseReason) -> bool {
        self.record_error(id, message);
        match self.complete_session(id, SessionState::Failed, reason) {
            Ok(completed) => completed,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to complete session");
                false
            }
        }
    }

    /// Takes one resource sample and appends a snapshot.
    ///
    /// The sampler runs outside the lock. Timestamps never decrease.
    pub fn sample(&self, sampler: &dyn ResourceSampler) -> MetricsSnapshot {
        let sample = sampler.sample();
        let elapsed_ms = self.elapsed_ms();

        let mut state = self.state.write();
        let timestamp_ms = state
            .snapshots
            .last()
            .map_or(elapsed_ms, |last| elapsed_ms.max(last.timestamp_ms));
        let throughput = if elapsed_ms == 0 {
            0.0
        } else {
            state.counters.started as f64 / (elapsed_ms as f64 / 1000.0)
        };

        let snapshot = MetricsSnapshot {
            timestamp_ms,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            active_sessions: state.active.len(),
            throughput,
        };
        state.snapshots.push(snapshot);
        state.latest_sample = Some(sample);
        snapshot
    }

    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.state.read().active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn counters(&self) -> SessionCounters {
        self.state.read().counters
    }

    pub fn peak_active(&self) -> usize {
        self.state.read().peak_active
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.read().snapshots.len()
    }

    /// Copy of one session record, active or completed.
    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        let state = self.state.read();
        state
            .active
            .get(&id)
            .or_else(|| state.completed.iter().find(|r| r.id == id))
            .cloned()
    }

    /// Successful / started, in percent. 0 when nothing started.
    pub fn success_rate(&self) -> f64 {
        let counters = self.counters();
        percent(counters.successful, counters.started)
    }

    /// Successful / completed, in percent. `None` until a session completed.
    pub fn settled_success_rate(&self) -> Option<f64> {
        let counters = self.counters();
        let settled = counters.successful + counters.failed;
        (settled > 0).then(|| percent(counters.successful, settled))
    }

    /// Mean of recorded response times.
    pub fn average_response_time_ms(&self) -> Option<f64> {
        let stats = self.state.read().responses;
        (stats.count > 0).then(|| stats.sum_ms as f64 / stats.count as f64)
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.state.read().latest_sample
    }

    /// Mean CPU and memory over the last `health_window` snapshots.
    pub fn window_average(&self) -> Option<ResourceSample> {
        let state = self.state.read();
        let len = state.snapshots.len();
        if len == 0 {
            return None;
        }
        let window = &state.snapshots[len.saturating_sub(self.health_window)..];
        let n = window.len() as f64;
        Some(ResourceSample::new(
            window.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            window.iter().map(|s| s.memory_percent).sum::<f64>() / n,
        ))
    }

    /// Verifies `active + completed == started`.
    pub fn check_invariant(&self) -> CoreResult<()> {
        let state = self.state.read();
        let tracked = (state.active.len() + state.completed.len()) as u64;
        if tracked != state.counters.started {
            return Err(CoreError::internal(format!(
                "session accounting mismatch: {} active + {} completed != {} started",
                state.active.len(),
                state.completed.len(),
                state.counters.started
            )));
        }
        Ok(())
    }

    /// Copies the full run history for report generation.
    pub fn run_data(&self) -> RunData {
        let duration_ms = self.elapsed_ms();
        let state = self.state.read();
        let mut sessions: Vec<SessionRecord> = state.completed.clone();
        sessions.extend(state.active.values().cloned());
        sessions.sort_by_key(|r| r.id);

        RunData {
            duration_ms,
            snapshots: state.snapshots.clone(),
            sessions,
            counters: state.counters,
            peak_active: state.peak_active,
        }
    }
}

/// Immutable copy of a run's history.
#[derive(Debug, Clone, Default)]
pub struct RunData {
    pub duration_ms: u64,
    pub snapshots: Vec<MetricsSnapshot>,
    /// Every session record, ordered by id.
    pub sessions: Vec<SessionRecord>,
    pub counters: SessionCounters,
    pub peak_active: usize,
}

impl RunData {
    /// Successful / started, in percent. 0 when nothing started.
    pub fn success_rate(&self) -> f64 {
        percent(self.counters.successful, self.counters.started)
    }

    /// Total errors recorded across all sessions.
    pub fn error_count(&self) -> u64 {
        self.sessions.iter().map(|r| r.errors.len() as u64).sum()
    }

    /// Errors / started, in percent. 0 when nothing started.
    pub fn error_rate(&self) -> f64 {
        percent(self.error_count(), self.counters.started)
    }

    /// Response times of sessions that recorded one.
    pub fn response_times_ms(&self) -> Vec<u64> {
        self.sessions.iter().filter_map(|r| r.response_time_ms).collect()
    }

    /// Mean and maximum of `metric` over the snapshot series; zeros when empty.
    pub fn snapshot_stats(&self, metric: impl Fn(&MetricsSnapshot) -> f64) -> (f64, f64) {
        mean_and_max(self.snapshots.iter().map(metric))
    }

    /// Mean and maximum response time; zeros when nothing was recorded.
    pub fn response_time_stats(&self) -> (f64, f64) {
        mean_and_max(self.response_times_ms().into_iter().map(|ms| ms as f64))
    }

    /// Nearest-rank percentile of recorded response times.
    pub fn response_time_percentile(&self, p: f64) -> u64 {
        let mut sorted = self.response_times_ms();
        if sorted.is_empty() {
            return 0;
        }
        sorted.sort_unstable();

        let index = ((sorted.len() as f64) * p) as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

fn mean_and_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (count, sum, max) = values.fold((0usize, 0.0, f64::MIN), |(n, sum, max), v| {
        (n + 1, sum + v, max.max(v))
    });
    if count == 0 {
        (0.0, 0.0)
    } else {
        (sum / count as f64, max)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{ScriptedSampler, StaticSampler};

    fn register(aggregator: &MetricsAggregator, id: u64) -> SessionId {
        let id = SessionId::from_raw(id);
        aggregator
            .register_session(SessionRecord::new(id, "stockholm", aggregator.elapsed_ms()))
            .unwrap();
        id
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let aggregator = MetricsAggregator::new(10);
        let id = register(&aggregator, 1);

        let duplicate = aggregator.register_session(SessionRecord::new(id, "malmo", 0));
        assert!(matches!(duplicate, Err(CoreError::AlreadyExists { .. })));
        assert_eq!(aggregator.counters().started, 1);
        aggregator.check_invariant().unwrap();
    }

    #[tokio::test]
    async fn test_successful_lifecycle() {
        let aggregator = MetricsAggregator::new(10);
        let id = register(&aggregator, 1);

        assert!(aggregator.mark_connected(id));
        assert!(aggregator.record_chunk_sent(id, 3200));
        assert!(aggregator.record_response(id, 120));
        assert!(!aggregator.record_response(id, 400));
        assert!(aggregator
            .complete_session(id, SessionState::Closed, CloseReason::DurationElapsed)
            .unwrap());

        let counters = aggregator.counters();
        assert_eq!(counters.successful, 1);
        assert_eq!(counters.bytes_sent, 3200);
        assert_eq!(aggregator.active_count(), 0);
        assert_eq!(aggregator.average_response_time_ms(), Some(120.0));
        assert_eq!(aggregator.success_rate(), 100.0);
        aggregator.check_invariant().unwrap();
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let aggregator = MetricsAggregator::new(10);
        let id = register(&aggregator, 1);
        aggregator.mark_connected(id);

        assert!(aggregator
            .complete_session(id, SessionState::Closed, CloseReason::Cancelled)
            .unwrap());
        let before = aggregator.session(id).unwrap();

        assert!(!aggregator
            .complete_session(id, SessionState::Failed, CloseReason::Forced)
            .unwrap());
        assert!(!aggregator.record_error(id, "late error"));
        assert!(!aggregator.record_chunk_sent(id, 10));
        assert_eq!(aggregator.session(id).unwrap(), before);
        assert_eq!(aggregator.counters().failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_keeps_session_active() {
        let aggregator = MetricsAggregator::new(10);
        let id = register(&aggregator, 1);

        let result = aggregator.complete_session(id, SessionState::Closed, CloseReason::Cancelled);
        assert!(matches!(result, Err(CoreError::InvalidTransition { .. })));
        assert!(aggregator.is_active(id));
        aggregator.check_invariant().unwrap();
    }

    #[tokio::test]
    async fn test_empty_run_has_zero_rates() {
        let aggregator = MetricsAggregator::new(10);
        assert_eq!(aggregator.success_rate(), 0.0);
        assert_eq!(aggregator.settled_success_rate(), None);

        let data = aggregator.run_data();
        assert_eq!(data.success_rate(), 0.0);
        assert_eq!(data.error_rate(), 0.0);
        assert_eq!(data.response_time_percentile(0.95), 0);
        assert_eq!(data.snapshot_stats(|s| s.cpu_percent), (0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_timestamps_and_window() {
        let aggregator = MetricsAggregator::new(2);
        let sampler = ScriptedSampler::new(vec![
            Some(ResourceSample::new(10.0, 20.0)),
            Some(ResourceSample::new(50.0, 40.0)),
            Some(ResourceSample::new(70.0, 60.0)),
        ]);

        let mut last = 0;
        for _ in 0..3 {
            let snapshot = aggregator.sample(&sampler);
            assert!(snapshot.timestamp_ms >= last);
            last = snapshot.timestamp_ms;
            tokio::time::advance(std::time::Duration::from_millis(1000)).await;
        }

        assert_eq!(aggregator.snapshot_count(), 3);
        assert_eq!(aggregator.window_average(), Some(ResourceSample::new(60.0, 50.0)));
        assert_eq!(aggregator.latest_sample(), Some(ResourceSample::new(70.0, 60.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_counts_started_per_second() {
        let aggregator = MetricsAggregator::new(10);
        register(&aggregator, 1);
        register(&aggregator, 2);
        tokio::time::advance(std::time::Duration::from_secs(2)).await;

        let snapshot = aggregator.sample(&StaticSampler::idle());
        assert_eq!(snapshot.active_sessions, 2);
        assert!((snapshot.throughput - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles() {
        let mut data = RunData::default();
        for (i, ms) in [100, 200, 300, 400, 500].into_iter().enumerate() {
            let mut record = SessionRecord::new(SessionId::from_raw(i as u64 + 1), "malmo", 0);
            record.mark_connected(0).unwrap();
            record.record_response(ms);
            data.sessions.push(record);
        }

        assert_eq!(data.response_time_percentile(0.50), 300);
        assert_eq!(data.response_time_percentile(0.99), 500);
        assert_eq!(data.response_time_stats(), (300.0, 500.0));
    }
}
