use crate::aggregate::DEFAULT_GRACE_PERIOD;
use crate::controller::{
    ControllerParams, DEFAULT_CYCLE_SECS, DEFAULT_MAX_GREEN_SECS, DEFAULT_MIN_GREEN_SECS,
    DirectionLanes,
};
use crate::error::InvalidParameterError;
use crate::ingest::SensorId;
use crate::metrics::SignalTiming;
use crate::source::DEFAULT_POLL_INTERVAL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_SENSOR_ID: SensorId = 1;
pub const DEFAULT_DIRECTIONS: [&str; 4] = ["North", "South", "East", "West"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub aggregator: Option<AggregatorSection>,
    #[serde(default)]
    pub controller: Option<ControllerSection>,
    #[serde(default)]
    pub source: Option<SourceSection>,
    #[serde(default)]
    pub sink: Option<SinkSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

/// Static signal timing for the queue model. Only `saturation_flow` has a
/// built-in default.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TimingSection {
    pub green_time: Option<f64>,
    pub red_time: Option<f64>,
    pub car_length: Option<f64>,
    pub saturation_flow: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorSection {
    /// Out-of-order tolerance in milliseconds (default: 1000)
    pub grace_period_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSection {
    pub min_green_duration: Option<f64>,
    pub max_green_duration: Option<f64>,
    pub cycle_duration: Option<f64>,
    /// Fixed direction order; the first entry wins ties.
    #[serde(default)]
    pub directions: Vec<DirectionLanes>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceSection {
    pub path: Option<PathBuf>,
    /// Poll interval in seconds (default: 5)
    pub poll_interval_secs: Option<u64>,
    pub sensor_id: Option<SensorId>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkSection {
    /// JSON-lines file metrics are appended to
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|path| !path.as_os_str().is_empty())
}

impl Config {
    /// Validated timing; green, red and car length must be given explicitly.
    pub fn signal_timing(&self) -> Result<SignalTiming, InvalidParameterError> {
        let timing = &self.timing;
        SignalTiming::new(
            timing
                .green_time
                .ok_or(InvalidParameterError::Missing("green_time"))?,
            timing
                .red_time
                .ok_or(InvalidParameterError::Missing("red_time"))?,
            timing
                .car_length
                .ok_or(InvalidParameterError::Missing("car_length"))?,
            timing.saturation_flow,
        )
    }

    /// Returns the grace period (default: 1 second)
    pub fn grace_period(&self) -> Duration {
        self.aggregator
            .as_ref()
            .and_then(|a| a.grace_period_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD)
    }

    pub fn controller_params(&self) -> ControllerParams {
        let section = self.controller.as_ref();
        ControllerParams {
            min_green_duration: section
                .and_then(|c| c.min_green_duration)
                .unwrap_or(DEFAULT_MIN_GREEN_SECS),
            max_green_duration: section
                .and_then(|c| c.max_green_duration)
                .unwrap_or(DEFAULT_MAX_GREEN_SECS),
            cycle_duration: section
                .and_then(|c| c.cycle_duration)
                .unwrap_or(DEFAULT_CYCLE_SECS),
        }
    }

    /// Configured directions in order, or the four compass directions
    /// without lanes when none are configured.
    pub fn directions(&self) -> Vec<DirectionLanes> {
        match &self.controller {
            Some(section) if !section.directions.is_empty() => section.directions.clone(),
            _ => DEFAULT_DIRECTIONS
                .iter()
                .map(|name| DirectionLanes {
                    name: name.to_string(),
                    lanes: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn source_path(&self) -> Option<&Path> {
        non_empty(self.source.as_ref()?.path.as_deref())
    }

    /// Returns the poll interval (default: 5 seconds)
    pub fn poll_interval(&self) -> Duration {
        self.source
            .as_ref()
            .and_then(|s| s.poll_interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn sensor_id(&self) -> SensorId {
        self.source
            .as_ref()
            .and_then(|s| s.sensor_id)
            .unwrap_or(DEFAULT_SENSOR_ID)
    }

    pub fn sink_path(&self) -> Option<&Path> {
        non_empty(self.sink.as_ref()?.path.as_deref())
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Parsed `[logging].level`, `INFO` when unrecognised.
    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}
