//! Gateway configuration – reads `~/.fastlab/config.toml`.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fastlab_broker::StreamPacing;
use fastlab_types::{InstrumentEndpoint, InstrumentKind};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Whole-process configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub motor: MotorConfig,
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Upper bound on threads running blocking instrument calls.
    pub max_blocking_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            max_blocking_threads: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Serialize all motor sessions.
    pub exclusive: bool,
    /// Spacing of `/motor/ws/status` samples; `0` streams as fast as the
    /// motor answers.
    pub stream_interval_ms: u64,
    /// Artificial per-call latency of the simulated motor.
    pub sim_latency_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7200,
            connect_timeout_ms: 10_000,
            exclusive: false,
            stream_interval_ms: 100,
            sim_latency_ms: 0,
        }
    }
}

impl MotorConfig {
    pub fn endpoint(&self) -> InstrumentEndpoint {
        InstrumentEndpoint::new(InstrumentKind::Motor, &self.host, self.port)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn stream_pacing(&self) -> StreamPacing {
        pacing(self.stream_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub exclusive: bool,
    pub stream_interval_ms: u64,
    /// JPEG quality, 1-100.
    pub jpeg_quality: u8,
    pub sim_latency_ms: u64,
    pub sim_width: u32,
    pub sim_height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7100,
            connect_timeout_ms: 10_000,
            exclusive: false,
            stream_interval_ms: 0,
            jpeg_quality: 85,
            sim_latency_ms: 0,
            sim_width: 320,
            sim_height: 240,
        }
    }
}

impl CameraConfig {
    pub fn endpoint(&self) -> InstrumentEndpoint {
        InstrumentEndpoint::new(InstrumentKind::Camera, &self.host, self.port)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn stream_pacing(&self) -> StreamPacing {
        pacing(self.stream_interval_ms)
    }
}

fn pacing(interval_ms: u64) -> StreamPacing {
    if interval_ms == 0 {
        StreamPacing::default()
    } else {
        StreamPacing::every(Duration::from_millis(interval_ms))
    }
}

impl Config {
    /// Reject settings the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid(
                "server.max_blocking_threads must be greater than 0".into(),
            ));
        }
        if self.motor.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "motor.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.camera.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be within 1..=100, got {}",
                self.camera.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Return the path to `~/.fastlab/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fastlab").join("config.toml")
}

/// Load, override from the environment, and validate.
///
/// `path` defaults to [`config_path`].
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file exists but cannot be read or
/// parsed, or when the resulting settings are invalid.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut cfg = match path {
        Some(path) => load_from(path)?,
        None => load_from(&config_path())?,
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Read a config file. A missing file yields the defaults.
pub(crate) fn load_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `FASTLAB_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FASTLAB_PORT` | `server.port` |
/// | `FASTLAB_MOTOR_HOST` | `motor.host` |
/// | `FASTLAB_MOTOR_PORT` | `motor.port` |
/// | `FASTLAB_CAMERA_HOST` | `camera.host` |
/// | `FASTLAB_CAMERA_PORT` | `camera.port` |
/// | `FASTLAB_CONNECT_TIMEOUT_MS` | `motor.connect_timeout_ms` and `camera.connect_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(port) = env_parsed::<u16>("FASTLAB_PORT") {
        cfg.server.port = port;
    }
    if let Ok(host) = std::env::var("FASTLAB_MOTOR_HOST") {
        cfg.motor.host = host;
    }
    if let Some(port) = env_parsed::<u16>("FASTLAB_MOTOR_PORT") {
        cfg.motor.port = port;
    }
    if let Ok(host) = std::env::var("FASTLAB_CAMERA_HOST") {
        cfg.camera.host = host;
    }
    if let Some(port) = env_parsed::<u16>("FASTLAB_CAMERA_PORT") {
        cfg.camera.port = port;
    }
    if let Some(timeout) = env_parsed::<u64>("FASTLAB_CONNECT_TIMEOUT_MS") {
        cfg.motor.connect_timeout_ms = timeout;
        cfg.camera.connect_timeout_ms = timeout;
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}
