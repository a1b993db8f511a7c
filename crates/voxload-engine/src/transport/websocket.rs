use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use voxload_core::{EndpointConfig, TransportError};

use super::{ConnectRequest, Connector, DuplexConnection, FrameSink, InboundMessage, OutboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects sessions to a WebSocket streaming endpoint.
///
/// Each session gets its own connection at
/// `<url>?session=<id>&profile=<name>`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn session_url(&self, request: &ConnectRequest) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}session={}&profile={}",
            self.url, separator, request.session_id, request.profile
        )
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<DuplexConnection, TransportError> {
        let url = self.session_url(request);
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::ConnectFailed(format!(
                    "timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(map_connect_error)?;

        debug!(session_id = %request.session_id, url = %url, "WebSocket connected");

        let (sink, stream) = socket.split();
        Ok(DuplexConnection {
            sink: Box::new(WebSocketSink { inner: sink }),
            stream: inbound(stream).boxed(),
        })
    }
}

fn map_connect_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::ConnectRefused(e.to_string())
        }
        tungstenite::Error::Http(response) => {
            TransportError::ConnectRefused(format!("HTTP {}", response.status()))
        }
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

/// Turns raw frames into inbound messages. Binary, ping and pong frames are
/// skipped; a close frame ends the stream.
fn inbound(
    stream: SplitStream<WsStream>,
) -> impl futures::Stream<Item = Result<InboundMessage, TransportError>> + Send + 'static {
    futures::stream::unfold(stream, |mut stream| async move {
        loop {
            let Some(frame) = stream.next().await else {
                return None;
            };
            match frame {
                Ok(Message::Text(text)) => return Some((InboundMessage::parse(&text), stream)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => {
                    return Some((Err(TransportError::ReceiveFailed(e.to_string())), stream))
                }
            }
        }
    })
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let message = match frame {
            OutboundFrame::Chunk(bytes) => Message::Binary(bytes.to_vec()),
            OutboundFrame::Control(control) => Message::Text(control.to_json()?),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::ClosedAbnormally(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxload_core::SessionId;

    fn request() -> ConnectRequest {
        ConnectRequest {
            session_id: SessionId::from_raw(7),
            profile: "malmo".to_string(),
        }
    }

    #[test]
    fn test_session_url_appends_query() {
        let connector = WebSocketConnector::new(&EndpointConfig {
            url: "ws://localhost:8080/stream".to_string(),
            connect_timeout_ms: 1000,
        });
        assert_eq!(
            connector.session_url(&request()),
            "ws://localhost:8080/stream?session=7&profile=malmo"
        );

        let connector = WebSocketConnector::new(&EndpointConfig {
            url: "ws://localhost:8080/stream?lang=sv".to_string(),
            connect_timeout_ms: 1000,
        });
        assert_eq!(
            connector.session_url(&request()),
            "ws://localhost:8080/stream?lang=sv&session=7&profile=malmo"
        );
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(&EndpointConfig {
            url: format!("ws://{}/stream", addr),
            connect_timeout_ms: 1000,
        });
        let result = connector.connect(&request()).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectRefused(_)) | Err(TransportError::ConnectFailed(_))
        ));
    }
}
