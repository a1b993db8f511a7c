//! Phase-driven load orchestration.
//!
//! A run walks `RampUp -> Sustained -> RampDown -> Done` exactly once:
//!
//! 1. **RampUp** creates sessions one at a time, evenly spaced, up to the
//!    configured maximum. The hard-stop predicate is checked before each
//!    creation and ends the phase early when it trips.
//! 2. **Sustained** re-evaluates the concurrency target on every adjustment
//!    tick and tops up finished sessions while the hard stop allows.
//! 3. **RampDown** cancels the remaining sessions evenly spaced, waits for
//!    graceful closes and force-completes stragglers.
//!
//! A fatal error or a shutdown signal skips straight to ramp-down, so every
//! run still produces a report. A run with no sessions configured goes
//! directly to the report.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use voxload_core::{
    CloseReason, CoreError, CoreResult, HaltReason, LoadTestConfig, LoadTestReport, RunId,
    RunStatus, SessionConfig, SessionId, SessionIdAllocator, SessionRecord,
};

use crate::aggregator::MetricsAggregator;
use crate::controller::AdaptiveConcurrencyController;
use crate::progress::ProgressReporter;
use crate::report::ReportGenerator;
use crate::sampler::ResourceSampler;
use crate::session::{SessionDriver, SessionHandle, SessionPlan};
use crate::transport::Connector;

/// Run phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RampUp,
    Sustained,
    RampDown,
    Done,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RampUp => "ramp_up",
            Self::Sustained => "sustained",
            Self::RampDown => "ramp_down",
            Self::Done => "done",
        }
    }

    /// Phases in which new sessions may be created.
    pub const fn creates_sessions(&self) -> bool {
        matches!(self, Self::RampUp | Self::Sustained)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run that failed before completing its phases.
///
/// Carries the report built from everything collected until the failure.
#[derive(Debug, thiserror::Error)]
#[error("load test aborted: {error}")]
pub struct RunAborted {
    pub error: CoreError,
    pub report: Box<LoadTestReport>,
}

/// Drives one load-test run.
pub struct LoadProfileOrchestrator {
    config: LoadTestConfig,
    session_config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    sampler: Arc<dyn ResourceSampler>,
    aggregator: Arc<MetricsAggregator>,
    controller: AdaptiveConcurrencyController,
    ids: SessionIdAllocator,
    sessions: HashMap<SessionId, SessionHandle>,
    phase: watch::Sender<Phase>,
    rng: StdRng,
    run_id: RunId,
    monitor: Option<JoinHandle<()>>,
    halt: Option<HaltReason>,
    hard_stop_engaged: bool,
}

impl LoadProfileOrchestrator {
    /// Validates `config` and prepares a run. The run clock starts here.
    pub fn new(
        config: LoadTestConfig,
        connector: Arc<dyn Connector>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> CoreResult<Self> {
        config.validate()?;

        let (phase, _) = watch::channel(Phase::RampUp);
        Ok(Self {
            session_config: Arc::new(config.session.clone()),
            aggregator: Arc::new(MetricsAggregator::new(config.monitoring.health_window)),
            controller: AdaptiveConcurrencyController::new(&config),
            config,
            connector,
            sampler,
            ids: SessionIdAllocator::new(),
            sessions: HashMap::new(),
            phase,
            rng: StdRng::from_entropy(),
            run_id: RunId::new(),
            monitor: None,
            halt: None,
            hard_stop_engaged: false,
        })
    }

    /// Seeds profile and duration draws for reproducible runs.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watches phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Cancels one running session. Repeated calls and unknown ids are no-ops.
    pub fn cancel_session(&mut self, id: SessionId) -> bool {
        self.sessions
            .get_mut(&id)
            .map_or(false, |handle| handle.cancel())
    }

    /// Runs all phases and returns the final report.
    pub async fn run(self) -> Result<LoadTestReport, RunAborted> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but resolving `shutdown` ends the current
    /// phase early. Remaining sessions are still ramped down and the report
    /// carries [`RunStatus::Interrupted`].
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<LoadTestReport, RunAborted>
    where
        F: Future<Output = ()>,
    {
        info!(
            run_id = %self.run_id,
            max_sessions = self.config.load.max_concurrent_sessions,
            ramp_up_ms = self.config.load.ramp_up_ms,
            sustained_ms = self.config.load.sustained_ms,
            ramp_down_ms = self.config.load.ramp_down_ms,
            "Starting load test"
        );

        self.monitor = Some(self.spawn_monitor());
        let progress = tokio::spawn(
            ProgressReporter::new(
                Arc::clone(&self.aggregator),
                self.config.thresholds.clone(),
                self.config.monitoring.report_interval(),
            )
            .run(self.subscribe()),
        );

        let idle = self.controller.max_sessions() == 0;
        let mut interrupted = false;
        let result = if idle {
            info!("No sessions configured, skipping to report");
            Ok(())
        } else {
            tokio::pin!(shutdown);
            let driven = tokio::select! {
                result = self.drive() => Some(result),
                _ = &mut shutdown => None,
            };
            driven.unwrap_or_else(|| {
                interrupted = true;
                Ok(())
            })
        };
        if let Err(e) = &result {
            error!(run_id = %self.run_id, error = %e, "Load test aborted, ramping down");
        }
        if interrupted {
            warn!(run_id = %self.run_id, phase = %self.phase(), "Shutdown requested, ramping down");
        }

        if !idle {
            self.advance(Phase::RampDown);
            self.ramp_down().await;
        }
        self.advance(Phase::Done);

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        progress.abort();

        if let Err(e) = self.aggregator.check_invariant() {
            error!(error = %e, "Session accounting mismatch after ramp-down");
        }

        let status = match (&result, self.halt) {
            (Err(e), _) => RunStatus::Aborted {
                message: e.to_string(),
            },
            (Ok(()), _) if interrupted => RunStatus::Interrupted,
            (Ok(()), Some(reason)) => RunStatus::Halted { reason },
            (Ok(()), None) => RunStatus::Completed,
        };
        let report =
            ReportGenerator::new(&self.config).generate(self.run_id, &self.aggregator.run_data(), status);

        info!(
            run_id = %self.run_id,
            sessions_started = report.summary.sessions_started,
            sessions_successful = report.summary.sessions_successful,
            sessions_failed = report.summary.sessions_failed,
            peak_concurrency = report.summary.peak_concurrency,
            recommended_capacity = report.capacity.recommended,
            critical_issues = report.critical_issues.len(),
            "Load test finished"
        );

        match result {
            Ok(()) => Ok(report),
            Err(error) => Err(RunAborted {
                error,
                report: Box::new(report),
            }),
        }
    }

    async fn drive(&mut self) -> CoreResult<()> {
        self.ramp_up().await?;
        self.advance(Phase::Sustained);
        self.sustain().await
    }

    async fn ramp_up(&mut self) -> CoreResult<()> {
        let max = self.controller.max_sessions();
        let spacing = self.config.load.ramp_up().div_f64(max as f64);
        debug!(spacing_ms = spacing.as_millis() as u64, "Ramp-up started");

        for _ in 0..max {
            self.checkpoint()?;
            if let Some(reason) = self.controller.should_halt(&self.aggregator) {
                warn!(
                    reason = %reason,
                    sessions_started = self.aggregator.counters().started,
                    "Hard stop tripped, halting ramp-up"
                );
                self.halt = Some(reason);
                self.hard_stop_engaged = true;
                break;
            }
            self.create_session();
            tokio::time::sleep(spacing).await;
        }

        Ok(())
    }

    async fn sustain(&mut self) -> CoreResult<()> {
        let phase_end = tokio::time::sleep(self.config.load.sustained());
        tokio::pin!(phase_end);
        let mut ticker = tokio::time::interval(self.config.monitoring.adjust_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_target = self.controller.max_sessions();

        loop {
            tokio::select! {
                biased;
                _ = &mut phase_end => break,
                _ = ticker.tick() => {}
            }

            self.checkpoint()?;
            let target = self.controller.target(&self.aggregator, Phase::Sustained);
            if target != last_target {
                info!(
                    previous = last_target,
                    target,
                    max = self.controller.max_sessions(),
                    "Concurrency target adjusted"
                );
                last_target = target;
            }

            let active = self.aggregator.active_count();
            for _ in active..target {
                if !self.hard_stop_permits() {
                    break;
                }
                self.create_session();
            }
        }

        Ok(())
    }

    async fn ramp_down(&mut self) {
        self.reap_finished();
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        info!(remaining = ids.len(), "Ramping down");

        if !ids.is_empty() {
            let spacing = self.config.load.ramp_down().div_f64(ids.len() as f64);
            for id in ids {
                self.cancel_session(id);
                tokio::time::sleep(spacing).await;
            }
        }

        let deadline = Instant::now() + self.config.session.close_timeout();
        let aggregator = Arc::clone(&self.aggregator);
        for (id, mut handle) in self.sessions.drain() {
            if !handle.wait_until(deadline).await {
                warn!(session_id = %id, "Session did not close in time, forcing");
                handle.abort();
            }
            if aggregator.is_active(id) {
                aggregator.fail_session(id, "forced close during ramp-down", CloseReason::Forced);
            }
        }
    }

    /// Evaluates the hard stop, logging only when its state changes.
    fn hard_stop_permits(&mut self) -> bool {
        match self.controller.should_halt(&self.aggregator) {
            Some(reason) => {
                if !self.hard_stop_engaged {
                    warn!(reason = %reason, "Hard stop engaged, blocking new sessions");
                    self.hard_stop_engaged = true;
                }
                false
            }
            None => {
                if self.hard_stop_engaged {
                    info!("Hard stop released");
                    self.hard_stop_engaged = false;
                }
                true
            }
        }
    }

    /// Fails the run if the monitor died or accounting drifted.
    fn checkpoint(&mut self) -> CoreResult<()> {
        if self.monitor.as_ref().is_some_and(JoinHandle::is_finished) {
            return Err(CoreError::internal("metrics monitor stopped unexpectedly"));
        }
        self.reap_finished();
        self.aggregator.check_invariant()
    }

    fn create_session(&mut self) {
        let id = self.ids.next_id();
        match self.try_create_session(id) {
            Ok(()) => trace!(session_id = %id, "Session created"),
            Err(e) => {
                self.aggregator.record_creation_failure();
                warn!(session_id = %id, error = %e, "Session creation failed");
            }
        }
    }

    fn try_create_session(&mut self, id: SessionId) -> CoreResult<()> {
        let plan = SessionPlan::draw(id, &self.config, &mut self.rng)?;
        self.aggregator.register_session(SessionRecord::new(
            id,
            plan.profile.clone(),
            self.aggregator.elapsed_ms(),
        ))?;

        let driver = SessionDriver::new(
            plan,
            Arc::clone(&self.connector),
            Arc::clone(&self.aggregator),
            Arc::clone(&self.session_config),
            self.config.thresholds.max_response_time_ms,
        );
        self.sessions.insert(id, SessionHandle::spawn(driver));
        Ok(())
    }

    /// Drops handles of finished tasks. A task that ended without completing
    /// its record (a panic) is force-completed as failed.
    fn reap_finished(&mut self) {
        let finished: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|handle| handle.is_finished())
            .map(SessionHandle::id)
            .collect();

        for id in finished {
            let Some(mut handle) = self.sessions.remove(&id) else {
                continue;
            };
            if let Some(Err(e)) = handle.try_join() {
                error!(session_id = %id, error = %e, "Session task failed");
            }
            if self.aggregator.is_active(id) {
                self.aggregator.fail_session(
                    id,
                    "session task ended without completing",
                    CloseReason::Forced,
                );
            }
        }
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let aggregator = Arc::clone(&self.aggregator);
        let sampler = Arc::clone(&self.sampler);
        let period = self.config.monitoring.sample_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = aggregator.sample(sampler.as_ref());
                trace!(
                    cpu_percent = snapshot.cpu_percent,
                    memory_percent = snapshot.memory_percent,
                    active_sessions = snapshot.active_sessions,
                    "Resource sample"
                );
            }
        })
    }

    fn advance(&mut self, next: Phase) {
        let current = self.phase();
        if next <= current {
            return;
        }
        info!(from = %current, to = %next, "Phase transition");
        self.phase.send_replace(next);
    }
}
