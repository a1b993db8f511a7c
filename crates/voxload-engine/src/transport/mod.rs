//! Transport abstraction between session drivers and the streaming endpoint.
//!
//! A [`Connector`] opens one full-duplex connection per session. The driver
//! pushes [`OutboundFrame`]s into the [`FrameSink`] half and reads
//! [`InboundMessage`]s from the [`FrameStream`] half. Implementations:
//!
//! - [`WebSocketConnector`]: the real endpoint, over `tokio-tungstenite`
//! - [`MockEndpoint`]: in-process endpoint with scripted failures for tests

mod mock;
mod websocket;

pub use mock::{MockEndpoint, MockEndpointConfig};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use voxload_core::{SessionId, TransportError};

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    /// Traffic profile name, forwarded so the server can tag the session.
    pub profile: String,
}

/// Control messages sent as JSON text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Announces a graceful end of the audio stream.
    EndSession {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Wall-clock unix milliseconds.
        timestamp: i64,
    },
}

impl ControlMessage {
    pub fn end_session(session_id: SessionId) -> Self {
        Self::EndSession {
            session_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// Frame written by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Opaque binary audio chunk.
    Chunk(Bytes),
    Control(ControlMessage),
}

/// Decoded inbound JSON message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Value of the `type` field, empty when absent.
    pub message_type: String,
    pub body: serde_json::Value,
}

impl InboundMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        let message_type = message_type.into();
        let body = serde_json::json!({ "type": message_type });
        Self { message_type, body }
    }

    /// Parses a JSON text frame. Non-JSON payloads are protocol errors, which
    /// sessions ignore.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let body: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON message: {}", e)))?;
        let message_type = body
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self { message_type, body })
    }
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Initiates a graceful close of the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection. Ends when the remote side closes.
pub type FrameStream = BoxStream<'static, Result<InboundMessage, TransportError>>;

/// Both halves of an open connection.
pub struct DuplexConnection {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

/// Opens connections to the endpoint under test.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<DuplexConnection, TransportError>;
}
