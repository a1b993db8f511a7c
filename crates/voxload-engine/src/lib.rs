//! Adaptive load-test engine for real-time audio streaming endpoints.
//!
//! The [`LoadProfileOrchestrator`] ramps simulated sessions up to a target,
//! holds them under adaptive throttling and ramps them down, then hands the
//! collected data to the [`ReportGenerator`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use voxload_core::LoadTestConfig;
//! use voxload_engine::{LoadProfileOrchestrator, MockEndpoint, StaticSampler};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = LoadProfileOrchestrator::new(
//!     LoadTestConfig::default(),
//!     Arc::new(MockEndpoint::healthy()),
//!     Arc::new(StaticSampler::idle()),
//! )?;
//! let report = orchestrator.run().await?;
//! println!("recommended capacity: {}", report.capacity.recommended);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod controller;
pub mod orchestrator;
pub mod payload;
pub mod progress;
pub mod report;
pub mod sampler;
pub mod session;
pub mod transport;
pub mod writer;

pub use aggregator::{MetricsAggregator, RunData, SessionCounters};
pub use controller::{AdaptiveConcurrencyController, HealthSignals};
pub use orchestrator::{LoadProfileOrchestrator, Phase, RunAborted};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use report::ReportGenerator;
pub use sampler::{ResourceSampler, ScriptedSampler, StaticSampler, SystemSampler};
pub use session::{SessionDriver, SessionHandle, SessionPlan};
pub use transport::{
    ConnectRequest, Connector, ControlMessage, DuplexConnection, FrameSink, FrameStream,
    InboundMessage, MockEndpoint, MockEndpointConfig, OutboundFrame, WebSocketConnector,
};
pub use writer::{ReportFormat, ReportWriter};
