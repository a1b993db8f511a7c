//! Load-test configuration.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables, `VOXLOAD__<SECTION>__<FIELD>` (highest priority)
//! 2. Configuration file (TOML, YAML or JSON, chosen by extension)
//! 3. Default values (lowest priority)
//!
//! The configuration is supplied wholesale at test start and validated once.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Root configuration for one load-test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    /// Concurrency profile and phase durations
    #[serde(default)]
    pub load: LoadConfig,

    /// Per-session traffic shape
    #[serde(default)]
    pub session: SessionConfig,

    /// Hard-stop and report thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Soft throttle applied by the concurrency controller
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Sampling, adjustment and reporting ticks
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Streaming endpoint under test
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Named traffic profiles sessions are drawn from
    #[serde(default = "default_profiles")]
    pub profiles: Vec<TrafficProfile>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Concurrency target and phase durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Target maximum concurrent sessions (default: 100)
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    /// Ramp-up phase length in milliseconds (default: 60s)
    #[serde(default = "default_ramp_up_ms")]
    pub ramp_up_ms: u64,

    /// Sustained phase length in milliseconds (default: 5min)
    #[serde(default = "default_sustained_ms")]
    pub sustained_ms: u64,

    /// Ramp-down phase length in milliseconds (default: 30s)
    #[serde(default = "default_ramp_down_ms")]
    pub ramp_down_ms: u64,

    /// Session count the pilot readiness check must support.
    /// Defaults to `max_concurrent_sessions` when unset.
    #[serde(default)]
    pub pilot_target_sessions: Option<usize>,
}

/// Shape of the synthetic traffic each session produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Payload chunk size in bytes (default: 3200, 100ms of 16kHz PCM16)
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Interval between chunks in milliseconds (default: 100)
    #[serde(default = "default_chunk_interval_ms")]
    pub chunk_interval_ms: u64,

    /// Shortest session duration in milliseconds (default: 30s)
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u64,

    /// Longest session duration in milliseconds (default: 2min)
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,

    /// Grace period for a graceful close before forced teardown (default: 5s)
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Inbound message types that count as a timed response
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
}

/// Thresholds for the hard-stop predicate and the final report.
///
/// Percentages are 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// CPU above which ramp-up halts (default: 80)
    #[serde(default = "default_max_cpu")]
    pub max_cpu_percent: f64,

    /// Memory above which ramp-up halts (default: 85)
    #[serde(default = "default_max_memory")]
    pub max_memory_percent: f64,

    /// Response time above which a session records a latency error (default: 3000)
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: u64,

    /// Success rate below which ramp-up halts (default: 95)
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,

    /// Sessions that must be started before the success rate is trusted (default: 50)
    #[serde(default = "default_min_sessions_for_success_check")]
    pub min_sessions_for_success_check: u64,
}

/// Soft throttle: multiplicative target reductions under pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Window-average CPU that triggers the CPU factor (default: 70)
    #[serde(default = "default_throttle_cpu")]
    pub cpu_percent: f64,

    /// Target multiplier under CPU pressure (default: 0.8)
    #[serde(default = "default_throttle_cpu_factor")]
    pub cpu_factor: f64,

    /// Window-average memory that triggers the memory factor (default: 75)
    #[serde(default = "default_throttle_memory")]
    pub memory_percent: f64,

    /// Target multiplier under memory pressure (default: 0.9)
    #[serde(default = "default_throttle_memory_factor")]
    pub memory_factor: f64,

    /// Average response time that triggers the latency factor (default: 3000)
    #[serde(default = "default_throttle_response_time_ms")]
    pub response_time_ms: f64,

    /// Target multiplier under latency pressure (default: 0.85)
    #[serde(default = "default_throttle_response_time_factor")]
    pub response_time_factor: f64,
}

/// Tick intervals for the background tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Resource sampling interval in milliseconds (default: 1000)
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Progress log interval in milliseconds (default: 10000)
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Sustained-phase concurrency adjustment interval (default: 1000)
    #[serde(default = "default_adjust_interval_ms")]
    pub adjust_interval_ms: u64,

    /// Number of recent snapshots averaged by the controller (default: 10)
    #[serde(default = "default_health_window")]
    pub health_window: usize,
}

/// Streaming endpoint the sessions connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL (default: "ws://localhost:8080/stream")
    #[serde(default = "default_endpoint_url")]
    pub url: String,

    /// Connect timeout in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Named set of payload-shaping parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficProfile {
    pub name: String,

    /// Relative selection weight (default: 1.0)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Fundamental frequency of the synthetic voice in Hz
    pub base_frequency_hz: f32,

    /// Peak amplitude, 0.0-1.0
    pub amplitude: f32,

    /// Share of white noise mixed into the signal, 0.0-1.0
    #[serde(default)]
    pub noise_ratio: f32,

    /// PCM sample rate (default: 16000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_sessions() -> usize {
    100
}

fn default_ramp_up_ms() -> u64 {
    60_000
}

fn default_sustained_ms() -> u64 {
    300_000
}

fn default_ramp_down_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    3_200
}

fn default_chunk_interval_ms() -> u64 {
    100
}

fn default_min_duration_ms() -> u64 {
    30_000
}

fn default_max_duration_ms() -> u64 {
    120_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_response_types() -> Vec<String> {
    vec!["transcription".to_string(), "response".to_string()]
}

fn default_max_cpu() -> f64 {
    80.0
}

fn default_max_memory() -> f64 {
    85.0
}

fn default_max_response_time_ms() -> u64 {
    3_000
}

fn default_min_success_rate() -> f64 {
    95.0
}

fn default_min_sessions_for_success_check() -> u64 {
    50
}

fn default_throttle_cpu() -> f64 {
    70.0
}

fn default_throttle_cpu_factor() -> f64 {
    0.8
}

fn default_throttle_memory() -> f64 {
    75.0
}

fn default_throttle_memory_factor() -> f64 {
    0.9
}

fn default_throttle_response_time_ms() -> f64 {
    3_000.0
}

fn default_throttle_response_time_factor() -> f64 {
    0.85
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_report_interval_ms() -> u64 {
    10_000
}

fn default_adjust_interval_ms() -> u64 {
    1_000
}

fn default_health_window() -> usize {
    10
}

fn default_endpoint_url() -> String {
    "ws://localhost:8080/stream".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_weight() -> f64 {
    1.0
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_profiles() -> Vec<TrafficProfile> {
    vec![
        TrafficProfile::new("stockholm", 180.0, 0.6, 0.05),
        TrafficProfile::new("gothenburg", 210.0, 0.55, 0.08),
        TrafficProfile::new("malmo", 160.0, 0.65, 0.1),
    ]
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            session: SessionConfig::default(),
            thresholds: ThresholdConfig::default(),
            throttle: ThrottleConfig::default(),
            monitoring: MonitoringConfig::default(),
            endpoint: EndpointConfig::default(),
            profiles: default_profiles(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            ramp_up_ms: default_ramp_up_ms(),
            sustained_ms: default_sustained_ms(),
            ramp_down_ms: default_ramp_down_ms(),
            pilot_target_sessions: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            chunk_interval_ms: default_chunk_interval_ms(),
            min_duration_ms: default_min_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            response_types: default_response_types(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu(),
            max_memory_percent: default_max_memory(),
            max_response_time_ms: default_max_response_time_ms(),
            min_success_rate: default_min_success_rate(),
            min_sessions_for_success_check: default_min_sessions_for_success_check(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_percent: default_throttle_cpu(),
            cpu_factor: default_throttle_cpu_factor(),
            memory_percent: default_throttle_memory(),
            memory_factor: default_throttle_memory_factor(),
            response_time_ms: default_throttle_response_time_ms(),
            response_time_factor: default_throttle_response_time_factor(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            report_interval_ms: default_report_interval_ms(),
            adjust_interval_ms: default_adjust_interval_ms(),
            health_window: default_health_window(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TrafficProfile {
    /// Creates a profile with default weight and sample rate.
    #[must_use]
    pub fn new(name: impl Into<String>, base_frequency_hz: f32, amplitude: f32, noise_ratio: f32) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            base_frequency_hz,
            amplitude,
            noise_ratio,
            sample_rate_hz: default_sample_rate(),
        }
    }
}

impl LoadConfig {
    pub fn ramp_up(&self) -> Duration {
        Duration::from_millis(self.ramp_up_ms)
    }

    pub fn sustained(&self) -> Duration {
        Duration::from_millis(self.sustained_ms)
    }

    pub fn ramp_down(&self) -> Duration {
        Duration::from_millis(self.ramp_down_ms)
    }

    /// Pilot target, falling back to the configured maximum.
    pub fn pilot_target(&self) -> usize {
        self.pilot_target_sessions
            .unwrap_or(self.max_concurrent_sessions)
    }
}

impl SessionConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Returns true when `message_type` is one of the timed response types.
    pub fn is_response_type(&self, message_type: &str) -> bool {
        self.response_types.iter().any(|t| t == message_type)
    }
}

impl MonitoringConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl LoadTestConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// When `path` is `None`, the `VOXLOAD_CONFIG` environment variable is
    /// consulted. The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else if let Ok(config_path) = std::env::var("VOXLOAD_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        // Example: VOXLOAD__LOAD__MAX_CONCURRENT_SESSIONS=500
        builder = builder.add_source(
            Environment::with_prefix("VOXLOAD")
                .separator("__")
                .try_parsing(true),
        );

        let config: LoadTestConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let config: LoadTestConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> CoreResult<()> {
        if self.session.chunk_size_bytes == 0 {
            return Err(CoreError::Config(
                "session.chunk_size_bytes must be > 0".to_string(),
            ));
        }

        if self.session.chunk_interval_ms == 0 {
            return Err(CoreError::Config(
                "session.chunk_interval_ms must be > 0".to_string(),
            ));
        }

        if self.session.min_duration_ms > self.session.max_duration_ms {
            return Err(CoreError::Config(
                "session.min_duration_ms must be <= session.max_duration_ms".to_string(),
            ));
        }

        if self.session.response_types.is_empty() {
            return Err(CoreError::Config(
                "session.response_types cannot be empty".to_string(),
            ));
        }

        if self.monitoring.sample_interval_ms == 0
            || self.monitoring.report_interval_ms == 0
            || self.monitoring.adjust_interval_ms == 0
        {
            return Err(CoreError::Config(
                "monitoring intervals must be > 0".to_string(),
            ));
        }

        if self.monitoring.health_window == 0 {
            return Err(CoreError::Config(
                "monitoring.health_window must be > 0".to_string(),
            ));
        }

        let percentages = [
            ("thresholds.max_cpu_percent", self.thresholds.max_cpu_percent),
            ("thresholds.max_memory_percent", self.thresholds.max_memory_percent),
            ("thresholds.min_success_rate", self.thresholds.min_success_rate),
            ("throttle.cpu_percent", self.throttle.cpu_percent),
            ("throttle.memory_percent", self.throttle.memory_percent),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(CoreError::Config(format!(
                    "{} must be between 0 and 100",
                    name
                )));
            }
        }

        let factors = [
            ("throttle.cpu_factor", self.throttle.cpu_factor),
            ("throttle.memory_factor", self.throttle.memory_factor),
            ("throttle.response_time_factor", self.throttle.response_time_factor),
        ];
        for (name, value) in factors {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CoreError::Config(format!("{} must be in (0, 1]", name)));
            }
        }

        if self.profiles.is_empty() {
            return Err(CoreError::Config(
                "at least one traffic profile is required".to_string(),
            ));
        }

        for profile in &self.profiles {
            if profile.name.is_empty() {
                return Err(CoreError::Config(
                    "traffic profile name cannot be empty".to_string(),
                ));
            }
            if !(profile.weight > 0.0) {
                return Err(CoreError::Config(format!(
                    "profile `{}` weight must be > 0",
                    profile.name
                )));
            }
            if profile.sample_rate_hz == 0 {
                return Err(CoreError::Config(format!(
                    "profile `{}` sample_rate_hz must be > 0",
                    profile.name
                )));
            }
        }

        if self.endpoint.url.is_empty() {
            return Err(CoreError::Config("endpoint.url cannot be empty".to_string()));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(CoreError::Config(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(CoreError::Config(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }

    /// Serialize the effective configuration as TOML.
    pub fn to_toml(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::SerializationError(e.to_string()))
    }
}
