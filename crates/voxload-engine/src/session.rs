//! Session drivers: one task per simulated client.
//!
//! A driver connects, streams one chunk per tick, times the first matching
//! response and closes when its duration elapses or it is cancelled. Every
//! state change goes through the [`MetricsAggregator`].

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use voxload_core::{
    CloseReason, CoreResult, LoadTestConfig, SessionConfig, SessionId, SessionState,
    TransportError,
};

use crate::aggregator::MetricsAggregator;
use crate::payload::{choose_profile, session_duration, synthesize_chunk};
use crate::transport::{
    ConnectRequest, Connector, ControlMessage, DuplexConnection, FrameSink, InboundMessage,
    OutboundFrame,
};

/// Randomized parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub id: SessionId,
    pub profile: String,
    pub duration: Duration,
    /// Chunk sent on every tick.
    pub chunk: Bytes,
}

impl SessionPlan {
    /// Draws profile, duration and payload for session `id`.
    pub fn draw<R: Rng + ?Sized>(id: SessionId, config: &LoadTestConfig, rng: &mut R) -> CoreResult<Self> {
        let profile = choose_profile(&config.profiles, rng)?;
        Ok(Self {
            id,
            profile: profile.name.clone(),
            duration: session_duration(&config.session, rng),
            chunk: synthesize_chunk(profile, config.session.chunk_size_bytes, rng),
        })
    }
}

/// How a driver's streaming loop ended.
enum Outcome {
    Closed(CloseReason),
    Failed(String, CloseReason),
    /// The record was completed elsewhere; nothing left to account.
    Detached,
}

/// Drives one session against a [`Connector`].
pub struct SessionDriver {
    plan: SessionPlan,
    connector: Arc<dyn Connector>,
    aggregator: Arc<MetricsAggregator>,
    config: Arc<SessionConfig>,
    latency_threshold_ms: u64,
}

impl SessionDriver {
    pub fn new(
        plan: SessionPlan,
        connector: Arc<dyn Connector>,
        aggregator: Arc<MetricsAggregator>,
        config: Arc<SessionConfig>,
        latency_threshold_ms: u64,
    ) -> Self {
        Self {
            plan,
            connector,
            aggregator,
            config,
            latency_threshold_ms,
        }
    }

    /// Runs the session to a terminal state. Resolving `cancel` (or dropping
    /// its sender) triggers a graceful close.
    pub async fn run(self, mut cancel: oneshot::Receiver<()>) {
        let id = self.plan.id;
        let request = ConnectRequest {
            session_id: id,
            profile: self.plan.profile.clone(),
        };

        let connected = tokio::select! {
            result = self.connector.connect(&request) => result,
            _ = &mut cancel => {
                self.aggregator.fail_session(id, "cancelled while connecting", CloseReason::Cancelled);
                return;
            }
        };

        let DuplexConnection { mut sink, mut stream } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                debug!(session_id = %id, error = %e, "Connection failed");
                self.aggregator
                    .fail_session(id, e.to_string(), CloseReason::TransportError);
                return;
            }
        };

        let connected_at = Instant::now();
        if !self.aggregator.mark_connected(id) {
            let _ = sink.close().await;
            return;
        }
        debug!(session_id = %id, profile = %self.plan.profile, "Session connected");

        let interval = self.config.chunk_interval();
        let mut ticker = tokio::time::interval_at(connected_at + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let session_end = tokio::time::sleep(self.plan.duration);
        tokio::pin!(session_end);
        let mut awaiting_response = true;

        let outcome = loop {
            tokio::select! {
                _ = &mut session_end => {
                    break self.close_gracefully(sink.as_mut(), CloseReason::DurationElapsed).await;
                }
                _ = &mut cancel => {
                    break self.close_gracefully(sink.as_mut(), CloseReason::Cancelled).await;
                }
                _ = ticker.tick() => {
                    if !self.aggregator.is_active(id) {
                        break Outcome::Detached;
                    }
                    let chunk = self.plan.chunk.clone();
                    let bytes = chunk.len();
                    if let Err(e) = sink.send(OutboundFrame::Chunk(chunk)).await {
                        break Outcome::Failed(e.to_string(), CloseReason::TransportError);
                    }
                    if !self.aggregator.record_chunk_sent(id, bytes) {
                        break Outcome::Detached;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        if awaiting_response && self.config.is_response_type(&message.message_type) {
                            awaiting_response = false;
                            self.record_first_response(&message, connected_at);
                        }
                    }
                    Some(Err(TransportError::Protocol(detail))) => {
                        debug!(session_id = %id, detail = %detail, "Ignoring malformed message");
                    }
                    Some(Err(e)) => break Outcome::Failed(e.to_string(), CloseReason::TransportError),
                    None => {
                        break Outcome::Failed(
                            TransportError::ClosedAbnormally("remote closed the connection".to_string())
                                .to_string(),
                            CloseReason::TransportError,
                        );
                    }
                },
            }
        };

        // The cadence stopped with the loop; account the terminal state.
        match outcome {
            Outcome::Closed(reason) => {
                if let Err(e) = self
                    .aggregator
                    .complete_session(id, SessionState::Closed, reason)
                {
                    warn!(session_id = %id, error = %e, "Failed to close session");
                }
            }
            Outcome::Failed(message, reason) => {
                debug!(session_id = %id, error = %message, "Session failed");
                self.aggregator.fail_session(id, message, reason);
            }
            Outcome::Detached => {
                let _ = sink.close().await;
            }
        }
    }

    fn record_first_response(&self, message: &InboundMessage, connected_at: Instant) {
        let id = self.plan.id;
        let response_time_ms = connected_at.elapsed().as_millis() as u64;
        if !self.aggregator.record_response(id, response_time_ms) {
            return;
        }
        debug!(
            session_id = %id,
            message_type = %message.message_type,
            response_time_ms,
            "First response received"
        );
        if response_time_ms > self.latency_threshold_ms {
            warn!(
                session_id = %id,
                response_time_ms,
                threshold_ms = self.latency_threshold_ms,
                "Response time exceeds threshold"
            );
            self.aggregator.record_error(
                id,
                format!(
                    "response time {}ms exceeds threshold {}ms",
                    response_time_ms, self.latency_threshold_ms
                ),
            );
        }
    }

    /// Sends `end_session` and closes, bounded by the close timeout.
    async fn close_gracefully(&self, sink: &mut dyn FrameSink, reason: CloseReason) -> Outcome {
        let id = self.plan.id;
        let close = async {
            sink.send(OutboundFrame::Control(ControlMessage::end_session(id)))
                .await?;
            sink.close().await?;
            Ok::<(), TransportError>(())
        };

        match tokio::time::timeout(self.config.close_timeout(), close).await {
            Ok(Ok(())) => Outcome::Closed(reason),
            Ok(Err(e)) => Outcome::Failed(e.to_string(), CloseReason::TransportError),
            Err(_) => Outcome::Failed(
                format!(
                    "graceful close timed out after {}ms",
                    self.config.close_timeout_ms
                ),
                CloseReason::Forced,
            ),
        }
    }
}

/// Orchestrator-side handle to a running session task.
pub struct SessionHandle {
    id: SessionId,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawns `driver` on the current runtime.
    pub fn spawn(driver: SessionDriver) -> Self {
        let id = driver.plan.id;
        let (cancel, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(cancel_rx));
        Self {
            id,
            cancel: Some(cancel),
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Requests a graceful close. Only the first call has any effect.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task until `deadline`. Returns false on timeout.
    pub async fn wait_until(&mut self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(session_id = %self.id, error = %e, "Session task ended abnormally");
                true
            }
            Err(_) => false,
        }
    }

    /// Result of a finished task without blocking. `None` while running.
    pub fn try_join(&mut self) -> Option<Result<(), String>> {
        (&mut self.task)
            .now_or_never()
            .map(|result| result.map_err(|e| e.to_string()))
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockEndpoint, MockEndpointConfig};
    use voxload_core::SessionRecord;

    struct Fixture {
        endpoint: MockEndpoint,
        aggregator: Arc<MetricsAggregator>,
    }

    impl Fixture {
        fn new(endpoint: MockEndpoint) -> Self {
            Self {
                endpoint,
                aggregator: Arc::new(MetricsAggregator::new(10)),
            }
        }

        fn spawn(&self, id: u64, duration: Duration) -> SessionHandle {
            let id = SessionId::from_raw(id);
            self.aggregator
                .register_session(SessionRecord::new(id, "stockholm", 0))
                .unwrap();
            let plan = SessionPlan {
                id,
                profile: "stockholm".to_string(),
                duration,
                chunk: Bytes::from_static(&[0u8; 320]),
            };
            let config = SessionConfig {
                chunk_interval_ms: 100,
                close_timeout_ms: 1_000,
                ..Default::default()
            };
            SessionHandle::spawn(SessionDriver::new(
                plan,
                Arc::new(self.endpoint.clone()),
                Arc::clone(&self.aggregator),
                Arc::new(config),
                3_000,
            ))
        }

        fn record(&self, id: u64) -> SessionRecord {
            self.aggregator.session(SessionId::from_raw(id)).unwrap()
        }
    }

    async fn finish(handle: &mut SessionHandle) {
        assert!(handle.wait_until(Instant::now() + Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closes_after_duration() {
        let fixture = Fixture::new(MockEndpoint::healthy());
        let mut handle = fixture.spawn(1, Duration::from_millis(1_050));
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Closed);
        assert_eq!(record.close_reason, Some(CloseReason::DurationElapsed));
        assert_eq!(record.chunks_sent, 10);
        assert_eq!(record.bytes_sent, 3_200);
        assert_eq!(record.response_time_ms, Some(100));
        assert!(record.successful);
        assert_eq!(fixture.endpoint.graceful_closes(), 1);
        assert_eq!(fixture.endpoint.control_messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_fails() {
        let fixture = Fixture::new(MockEndpoint::refusing_every(1));
        let mut handle = fixture.spawn(1, Duration::from_secs(5));
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.close_reason, Some(CloseReason::TransportError));
        assert_eq!(record.errors.len(), 1);
        assert!(!record.successful);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_records_latency_error() {
        let fixture = Fixture::new(MockEndpoint::slow(Duration::from_millis(4_000)));
        let mut handle = fixture.spawn(1, Duration::from_secs(6));
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Closed);
        assert_eq!(record.response_time_ms, Some(4_100));
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].message.contains("exceeds threshold"));
        assert!(!record.successful);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_fails_session() {
        let fixture = Fixture::new(MockEndpoint::new(MockEndpointConfig {
            drop_after_chunks: Some(3),
            ..Default::default()
        }));
        let mut handle = fixture.spawn(1, Duration::from_secs(10));
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.chunks_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let fixture = Fixture::new(MockEndpoint::healthy());
        let mut handle = fixture.spawn(1, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(handle.cancel());
        finish(&mut handle).await;
        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Closed);
        assert_eq!(record.close_reason, Some(CloseReason::Cancelled));
        assert!(record.successful);

        assert!(!handle.cancel());
        assert_eq!(fixture.record(1), record);
        assert_eq!(fixture.endpoint.graceful_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_connecting_fails() {
        let fixture = Fixture::new(MockEndpoint::new(MockEndpointConfig {
            connect_latency: Duration::from_secs(5),
            ..Default::default()
        }));
        let mut handle = fixture.spawn(1, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.close_reason, Some(CloseReason::Cancelled));
        assert_eq!(record.connected_at_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_close_is_forced_after_timeout() {
        let fixture = Fixture::new(MockEndpoint::hanging_on_close());
        let mut handle = fixture.spawn(1, Duration::from_millis(500));
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.close_reason, Some(CloseReason::Forced));
        assert_eq!(record.closed_at_ms, Some(1_500));
        assert!(record.errors[0].message.contains("timed out"));
        assert!(!record.successful);
        assert_eq!(fixture.endpoint.control_messages().len(), 1);
        assert_eq!(fixture.endpoint.graceful_closes(), 0);
        assert!(!fixture.aggregator.is_active(SessionId::from_raw(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_completion_stops_cadence() {
        let fixture = Fixture::new(MockEndpoint::healthy());
        let mut handle = fixture.spawn(1, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(250)).await;
        fixture
            .aggregator
            .fail_session(SessionId::from_raw(1), "forced", CloseReason::Forced);
        finish(&mut handle).await;

        let record = fixture.record(1);
        assert_eq!(record.chunks_sent, 2);
        assert_eq!(fixture.endpoint.chunks_received(), 2);
        assert_eq!(record.close_reason, Some(CloseReason::Forced));
    }

    #[test]
    fn test_plan_draws_configured_profile() {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let config = LoadTestConfig::default();

        let plan = SessionPlan::draw(SessionId::from_raw(1), &config, &mut rng).unwrap();
        assert!(config.profiles.iter().any(|p| p.name == plan.profile));
        assert_eq!(plan.chunk.len(), config.session.chunk_size_bytes);
        assert!(plan.duration >= Duration::from_millis(config.session.min_duration_ms));
    }
}
