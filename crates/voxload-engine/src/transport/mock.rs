//! In-process streaming endpoint for tests and dry runs.
//!
//! Simulates a real endpoint without any network:
//!
//! - **Refusals**: every Nth connection attempt is refused
//! - **Latency**: configurable connect delay and response delay
//! - **Abnormal closes**: the connection drops after N chunks
//! - **Stuck closes**: the close handshake never completes
//! - **Stalls**: sends block forever after N chunks
//! - **Counters**: attempts, chunks and control messages for assertions
//!
//! Every received chunk is answered with one JSON message of the configured
//! response type.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voxload_core::TransportError;

use super::{
    ConnectRequest, Connector, ControlMessage, DuplexConnection, FrameSink, InboundMessage,
    OutboundFrame,
};

/// Behaviour of a [`MockEndpoint`].
#[derive(Debug, Clone)]
pub struct MockEndpointConfig {
    /// Delay before a connection attempt resolves.
    pub connect_latency: Duration,

    /// Delay between receiving a chunk and answering it.
    pub response_delay: Duration,

    /// `type` of the answer messages.
    pub response_type: String,

    /// Refuse attempts N, 2N, 3N, ... (1-based).
    pub refuse_every_nth: Option<u64>,

    /// Drop the connection abnormally after this many chunks.
    pub drop_after_chunks: Option<u64>,

    /// Never complete `close`, so callers must give up on their own.
    pub hang_on_close: bool,

    /// Block every chunk send after this many chunks.
    pub stall_after_chunks: Option<u64>,
}

impl Default for MockEndpointConfig {
    fn default() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            response_delay: Duration::ZERO,
            response_type: "transcription".to_string(),
            refuse_every_nth: None,
            drop_after_chunks: None,
            hang_on_close: false,
            stall_after_chunks: None,
        }
    }
}

#[derive(Debug, Default)]
struct MockCounters {
    attempts: AtomicU64,
    refused: AtomicU64,
    chunks: AtomicU64,
    closes: AtomicU64,
}

/// Mock endpoint implementing [`Connector`].
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    config: MockEndpointConfig,
    counters: Arc<MockCounters>,
    control_messages: Arc<Mutex<Vec<ControlMessage>>>,
}

impl MockEndpoint {
    pub fn new(config: MockEndpointConfig) -> Self {
        Self {
            config,
            counters: Arc::new(MockCounters::default()),
            control_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Accepts everything and answers immediately.
    pub fn healthy() -> Self {
        Self::new(MockEndpointConfig::default())
    }

    /// Refuses every `n`th connection attempt.
    pub fn refusing_every(n: u64) -> Self {
        Self::new(MockEndpointConfig {
            refuse_every_nth: Some(n),
            ..Default::default()
        })
    }

    /// Answers every chunk after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self::new(MockEndpointConfig {
            response_delay: delay,
            ..Default::default()
        })
    }

    /// Accepts and answers normally but never finishes a close.
    pub fn hanging_on_close() -> Self {
        Self::new(MockEndpointConfig {
            hang_on_close: true,
            ..Default::default()
        })
    }

    pub fn connect_attempts(&self) -> u64 {
        self.counters.attempts.load(Ordering::SeqCst)
    }

    pub fn refused_connections(&self) -> u64 {
        self.counters.refused.load(Ordering::SeqCst)
    }

    pub fn chunks_received(&self) -> u64 {
        self.counters.chunks.load(Ordering::SeqCst)
    }

    /// Connections closed gracefully by the client.
    pub fn graceful_closes(&self) -> u64 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn control_messages(&self) -> Vec<ControlMessage> {
        self.control_messages.lock().clone()
    }
}

#[async_trait]
impl Connector for MockEndpoint {
    async fn connect(&self, request: &ConnectRequest) -> Result<DuplexConnection, TransportError> {
        let attempt = self.counters.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.config.connect_latency.is_zero() {
            tokio::time::sleep(self.config.connect_latency).await;
        }

        if let Some(n) = self.config.refuse_every_nth {
            if n > 0 && attempt % n == 0 {
                self.counters.refused.fetch_add(1, Ordering::SeqCst);
                return Err(TransportError::ConnectRefused(format!(
                    "mock endpoint refused attempt {} (session {})",
                    attempt, request.session_id
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(DuplexConnection {
            sink: Box::new(MockSink {
                endpoint: self.clone(),
                inbound: Some(tx),
                chunks: 0,
            }),
            stream,
        })
    }
}

type Inbound = mpsc::UnboundedSender<Result<InboundMessage, TransportError>>;

struct MockSink {
    endpoint: MockEndpoint,
    /// Dropping the sender ends the session's inbound stream.
    inbound: Option<Inbound>,
    chunks: u64,
}

impl MockSink {
    fn respond(&self, inbound: &Inbound) {
        let message = InboundMessage::new(self.endpoint.config.response_type.clone());
        let delay = self.endpoint.config.response_delay;
        if delay.is_zero() {
            let _ = inbound.send(Ok(message));
            return;
        }

        let inbound = inbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver is gone once the session finished.
            let _ = inbound.send(Ok(message));
        });
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let Some(inbound) = self.inbound.as_ref() else {
            return Err(TransportError::SendFailed("connection closed".to_string()));
        };

        match frame {
            OutboundFrame::Chunk(_) => {
                if self
                    .endpoint
                    .config
                    .stall_after_chunks
                    .is_some_and(|n| self.chunks >= n)
                {
                    std::future::pending::<()>().await;
                }
                self.chunks += 1;
                self.endpoint.counters.chunks.fetch_add(1, Ordering::SeqCst);

                if self.endpoint.config.drop_after_chunks == Some(self.chunks) {
                    let _ = inbound.send(Err(TransportError::ClosedAbnormally(format!(
                        "mock endpoint dropped the connection after {} chunks",
                        self.chunks
                    ))));
                    self.inbound = None;
                    return Ok(());
                }

                self.respond(inbound);
            }
            OutboundFrame::Control(control) => {
                self.endpoint.control_messages.lock().push(control);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.endpoint.config.hang_on_close {
            std::future::pending::<()>().await;
        }
        if self.inbound.take().is_none() {
            return Err(TransportError::ClosedAbnormally(
                "connection already closed".to_string(),
            ));
        }
        self.endpoint.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};
    use voxload_core::SessionId;

    fn request(id: u64) -> ConnectRequest {
        ConnectRequest {
            session_id: SessionId::from_raw(id),
            profile: "stockholm".to_string(),
        }
    }

    #[tokio::test]
    async fn test_answers_every_chunk() {
        let endpoint = MockEndpoint::healthy();
        let mut connection = endpoint.connect(&request(1)).await.unwrap();

        assert_ok!(
            connection
                .sink
                .send(OutboundFrame::Chunk(Bytes::from_static(&[0; 4])))
                .await
        );
        let message = connection.stream.next().await.unwrap().unwrap();

        assert_eq!(message.message_type, "transcription");
        assert_eq!(endpoint.chunks_received(), 1);
    }

    #[tokio::test]
    async fn test_refuses_every_third_attempt() {
        let endpoint = MockEndpoint::refusing_every(3);
        let mut refused = Vec::new();
        for id in 1..=9 {
            if endpoint.connect(&request(id)).await.is_err() {
                refused.push(id);
            }
        }

        assert_eq!(refused, vec![3, 6, 9]);
        assert_eq!(endpoint.connect_attempts(), 9);
        assert_eq!(endpoint.refused_connections(), 3);
    }

    #[tokio::test]
    async fn test_drop_after_chunks_ends_stream_with_error() {
        let endpoint = MockEndpoint::new(MockEndpointConfig {
            drop_after_chunks: Some(2),
            ..Default::default()
        });
        let mut connection = endpoint.connect(&request(1)).await.unwrap();

        for _ in 0..2 {
            connection
                .sink
                .send(OutboundFrame::Chunk(Bytes::from_static(&[0; 4])))
                .await
                .unwrap();
        }

        assert!(connection.stream.next().await.unwrap().is_ok());
        assert!(matches!(
            connection.stream.next().await,
            Some(Err(TransportError::ClosedAbnormally(_)))
        ));
        assert!(connection.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_records_control_and_ends_stream() {
        let endpoint = MockEndpoint::healthy();
        let mut connection = endpoint.connect(&request(5)).await.unwrap();

        connection
            .sink
            .send(OutboundFrame::Control(ControlMessage::end_session(
                SessionId::from_raw(5),
            )))
            .await
            .unwrap();
        assert_ok!(connection.sink.close().await);

        assert!(connection.stream.next().await.is_none());
        assert_eq!(endpoint.graceful_closes(), 1);
        assert!(matches!(
            endpoint.control_messages().as_slice(),
            [ControlMessage::EndSession { session_id, .. }] if session_id.as_u64() == 5
        ));
        assert_err!(connection.sink.close().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_close_never_completes() {
        let endpoint = MockEndpoint::hanging_on_close();
        let mut connection = endpoint.connect(&request(2)).await.unwrap();

        let close = tokio::time::timeout(Duration::from_secs(30), connection.sink.close()).await;

        assert!(close.is_err());
        assert_eq!(endpoint.graceful_closes(), 0);
    }
}
