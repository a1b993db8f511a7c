//! Session lifecycle state and the per-session record.
//!
//! A session moves strictly forward through
//! `Connecting -> Connected -> {Closed | Failed}` (or `Connecting -> Failed`
//! when the connection never establishes). Streaming is a sub-phase of
//! `Connected`: chunks flow while the record is in that state.
//!
//! All timestamps are milliseconds since the start of the run.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::SessionId;

/// Lifecycle state of a simulated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Duplex connection is being opened. Only initial state.
    Connecting,
    /// Connection established; payload chunks are streaming.
    Connected,
    /// Session ended through a graceful close.
    Closed,
    /// Session ended through a transport failure.
    Failed,
}

impl SessionState {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Closed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Returns true when the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Failed)
                | (Self::Connected, Self::Closed)
                | (Self::Connected, Self::Failed)
        )
    }
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The sampled session duration elapsed.
    DurationElapsed,
    /// The orchestrator closed the session during ramp-down or cleanup.
    Cancelled,
    /// A transport error ended the session.
    TransportError,
    /// The graceful close did not finish in time and the session was torn down.
    Forced,
}

/// One error observed during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// Milliseconds since run start.
    pub timestamp_ms: u64,
    pub message: String,
}

/// Everything recorded about one simulated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub state: SessionState,
    /// Name of the traffic profile driving this session's payload.
    pub profile: String,
    pub created_at_ms: u64,
    pub connected_at_ms: Option<u64>,
    pub closed_at_ms: Option<u64>,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    /// Time from connection to the first timed response.
    pub response_time_ms: Option<u64>,
    pub errors: Vec<SessionError>,
    pub close_reason: Option<CloseReason>,
    /// Set on terminal transition: no errors and a response time recorded.
    pub successful: bool,
}

impl SessionRecord {
    /// Creates a record in the `Connecting` state.
    #[must_use]
    pub fn new(id: SessionId, profile: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            profile: profile.into(),
            created_at_ms,
            connected_at_ms: None,
            closed_at_ms: None,
            chunks_sent: 0,
            bytes_sent: 0,
            response_time_ms: None,
            errors: Vec::new(),
            close_reason: None,
            successful: false,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves `Connecting -> Connected` and stamps the connect time.
    pub fn mark_connected(&mut self, at_ms: u64) -> CoreResult<()> {
        self.transition(SessionState::Connected)?;
        self.connected_at_ms = Some(at_ms);
        Ok(())
    }

    /// Counts one sent chunk. Rejected once the record is terminal.
    pub fn record_chunk(&mut self, bytes: usize) -> CoreResult<()> {
        if self.state != SessionState::Connected {
            return Err(CoreError::invalid_state(format!(
                "session {} cannot send in state {}",
                self.id,
                self.state.as_str()
            )));
        }
        self.chunks_sent += 1;
        self.bytes_sent += bytes as u64;
        Ok(())
    }

    /// Stores the first response time. Returns false if one was already
    /// recorded or the record is terminal.
    pub fn record_response(&mut self, response_time_ms: u64) -> bool {
        if self.is_terminal() || self.response_time_ms.is_some() {
            return false;
        }
        self.response_time_ms = Some(response_time_ms);
        true
    }

    /// Appends an error. No-op once terminal.
    pub fn record_error(&mut self, message: impl Into<String>, at_ms: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.errors.push(SessionError {
            timestamp_ms: at_ms,
            message: message.into(),
        });
        true
    }

    /// Moves the record into `terminal` and classifies the outcome.
    ///
    /// Success requires a graceful close, an empty error list and a recorded
    /// response time.
    pub fn finish(&mut self, terminal: SessionState, reason: CloseReason, at_ms: u64) -> CoreResult<()> {
        if !terminal.is_terminal() {
            return Err(CoreError::invalid_state(format!(
                "{} is not a terminal state",
                terminal.as_str()
            )));
        }
        self.transition(terminal)?;
        self.closed_at_ms = Some(at_ms);
        self.close_reason = Some(reason);
        self.successful = terminal == SessionState::Closed
            && self.errors.is_empty()
            && self.response_time_ms.is_some();
        Ok(())
    }

    fn transition(&mut self, next: SessionState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
