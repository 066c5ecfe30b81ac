//! `fastlab-types` – shared vocabulary for the fastlab workspace.
//!
//! * [`InstrumentEndpoint`] – where a remote instrument-control server lives
//!   and how long we are willing to wait for it.
//! * [`InstrumentFault`] – the failure raised by a vendor client call.
//! * [`LabError`] – the typed failure every operation reports, with its
//!   machine-readable [`ErrorKind`].
//! * Request value objects ([`MoveRequest`], [`SpeedRequest`],
//!   [`ExposureRequest`], [`GainRequest`]) and their [`Validate`] checks.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connect timeout used when the configuration does not name one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Instruments and endpoints
// ────────────────────────────────────────────────────────────────────────────

/// The class of instrument an endpoint, session or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Motorized stage driven through the motor client.
    Motor,
    /// Camera driven through the camera client.
    Camera,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Motor => write!(f, "motor"),
            InstrumentKind::Camera => write!(f, "camera"),
        }
    }
}

/// Address and connect budget of one remote instrument-control server.
///
/// Built once at process start and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentEndpoint {
    pub kind: InstrumentKind,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl InstrumentEndpoint {
    /// Endpoint with the [`DEFAULT_CONNECT_TIMEOUT`].
    pub fn new(kind: InstrumentKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout (builder-style).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port`, for logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// A failure raised by an instrument client call (connect, move, close, …).
///
/// Carries the client's own message unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{0}")]
pub struct InstrumentFault(String);

impl InstrumentFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Machine-readable classification of a [`LabError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ConnectTimeout,
    ConnectionUnavailable,
    ConnectionError,
    OperationFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ConnectTimeout => "ConnectTimeout",
            ErrorKind::ConnectionUnavailable => "ConnectionUnavailable",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::OperationFailed => "OperationFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way an instrument operation can fail.
///
/// The `Display` output is the human-readable detail returned to clients;
/// [`LabError::kind`] is the machine-readable part.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabError {
    /// Input rejected before any network activity.
    #[error("Invalid {field}: {details}")]
    Validation { field: String, details: String },

    #[error(
        "Timeout connecting to {instrument} server on {host}:{port} after {timeout_ms} ms. \
         Server might be unresponsive."
    )]
    ConnectTimeout {
        instrument: InstrumentKind,
        host: String,
        port: u16,
        timeout_ms: u64,
    },

    /// The server answered but did not hand out a working client.
    #[error("Failed to obtain {instrument} client from {host}:{port}: {details}")]
    ConnectionUnavailable {
        instrument: InstrumentKind,
        host: String,
        port: u16,
        details: String,
    },

    #[error("Could not connect to {instrument} on {host}:{port}: {cause}")]
    ConnectionError {
        instrument: InstrumentKind,
        host: String,
        port: u16,
        cause: InstrumentFault,
    },

    /// The instrument call itself failed.
    #[error("Could not {operation}{}: {cause}", input_suffix(.input))]
    OperationFailed {
        instrument: InstrumentKind,
        operation: String,
        input: Option<String>,
        cause: InstrumentFault,
    },
}

fn input_suffix(input: &Option<String>) -> String {
    match input {
        Some(value) => format!(" (input: {value})"),
        None => String::new(),
    }
}

impl LabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Validation { .. } => ErrorKind::ValidationError,
            LabError::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            LabError::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            LabError::ConnectionError { .. } => ErrorKind::ConnectionError,
            LabError::OperationFailed { .. } => ErrorKind::OperationFailed,
        }
    }

    pub fn validation(field: impl Into<String>, details: impl Into<String>) -> Self {
        LabError::Validation {
            field: field.into(),
            details: details.into(),
        }
    }

    /// Wrap a failed instrument call together with the input it was given.
    pub fn operation_failed(
        instrument: InstrumentKind,
        operation: impl Into<String>,
        input: Option<String>,
        cause: InstrumentFault,
    ) -> Self {
        LabError::OperationFailed {
            instrument,
            operation: operation.into(),
            input,
            cause,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Requests
// ────────────────────────────────────────────────────────────────────────────

/// Shape and range checks applied at the protocol boundary.
pub trait Validate {
    /// # Errors
    ///
    /// Returns [`LabError::Validation`] naming the offending field.
    fn validate(&self) -> Result<(), LabError>;
}

/// Target position for a motor move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub position: f64,
}

/// Motor speed setting; must be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRequest {
    pub speed: f64,
}

/// Camera exposure time in microseconds; must be strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureRequest {
    pub exposure_time_us: f64,
}

/// Camera gain; must be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainRequest {
    pub gain: f64,
}

fn require_finite(field: &str, value: f64) -> Result<(), LabError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LabError::validation(field, "must be a finite number"))
    }
}

impl Validate for MoveRequest {
    fn validate(&self) -> Result<(), LabError> {
        require_finite("position", self.position)
    }
}

impl Validate for SpeedRequest {
    fn validate(&self) -> Result<(), LabError> {
        require_finite("speed", self.speed)?;
        if self.speed < 0.0 {
            return Err(LabError::validation(
                "speed",
                format!("must be greater than or equal to 0, got {}", format_number(self.speed)),
            ));
        }
        Ok(())
    }
}

impl Validate for ExposureRequest {
    fn validate(&self) -> Result<(), LabError> {
        require_finite("exposure_time_us", self.exposure_time_us)?;
        if self.exposure_time_us <= 0.0 {
            return Err(LabError::validation(
                "exposure_time_us",
                format!(
                    "must be greater than 0, got {}",
                    format_number(self.exposure_time_us)
                ),
            ));
        }
        Ok(())
    }
}

impl Validate for GainRequest {
    fn validate(&self) -> Result<(), LabError> {
        require_finite("gain", self.gain)?;
        if self.gain < 0.0 {
            return Err(LabError::validation(
                "gain",
                format!("must be greater than or equal to 0, got {}", format_number(self.gain)),
            ));
        }
        Ok(())
    }
}

/// Render a number for a user-facing message.
///
/// Whole numbers keep one decimal place (`50.0`, not `50`) so messages read
/// the same as the float the client sent. Magnitudes below `1e-4` or from
/// `1e16` up switch to exponent form with a signed, two-digit exponent
/// (`1e-07`, `2.5e+16`).
pub fn format_number(value: f64) -> String {
    if !value.is_finite() || value == 0.0 {
        return format!("{value:.1}");
    }
    let exact = format!("{value:e}");
    let Some((mantissa, exponent)) = exact.split_once('e') else {
        return exact;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        if value.fract() == 0.0 {
            format!("{value:.1}")
        } else {
            format!("{value}")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_fields() -> (InstrumentKind, String, u16) {
        (InstrumentKind::Motor, "localhost".to_string(), 7200)
    }

    #[test]
    fn endpoint_defaults_to_ten_second_timeout() {
        let ep = InstrumentEndpoint::new(InstrumentKind::Camera, "10.0.0.5", 7100);
        assert_eq!(ep.connect_timeout, Duration::from_secs(10));
        assert_eq!(ep.address(), "10.0.0.5:7100");

        let ep = ep.with_connect_timeout(Duration::from_millis(250));
        assert_eq!(ep.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn error_kinds_map_one_to_one() {
        let (instrument, host, port) = endpoint_fields();
        let cases = [
            (LabError::validation("speed", "negative"), ErrorKind::ValidationError),
            (
                LabError::ConnectTimeout {
                    instrument,
                    host: host.clone(),
                    port,
                    timeout_ms: 10,
                },
                ErrorKind::ConnectTimeout,
            ),
            (
                LabError::ConnectionUnavailable {
                    instrument,
                    host: host.clone(),
                    port,
                    details: "no client".to_string(),
                },
                ErrorKind::ConnectionUnavailable,
            ),
            (
                LabError::ConnectionError {
                    instrument,
                    host,
                    port,
                    cause: InstrumentFault::new("refused"),
                },
                ErrorKind::ConnectionError,
            ),
            (
                LabError::operation_failed(
                    instrument,
                    "move motor",
                    Some("1.0".to_string()),
                    InstrumentFault::new("stalled"),
                ),
                ErrorKind::OperationFailed,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn connect_timeout_display_names_host_and_port() {
        let err = LabError::ConnectTimeout {
            instrument: InstrumentKind::Motor,
            host: "stage.lab".to_string(),
            port: 7200,
            timeout_ms: 10_000,
        };
        let text = err.to_string();
        assert!(text.contains("motor"));
        assert!(text.contains("stage.lab:7200"));
        assert!(text.contains("10000 ms"));
    }

    #[test]
    fn operation_failed_display_includes_input_and_cause() {
        let err = LabError::operation_failed(
            InstrumentKind::Motor,
            "move motor",
            Some("12.5".to_string()),
            InstrumentFault::new("axis not homed"),
        );
        assert_eq!(err.to_string(), "Could not move motor (input: 12.5): axis not homed");

        let err = LabError::operation_failed(
            InstrumentKind::Motor,
            "get motor position",
            None,
            InstrumentFault::new("link down"),
        );
        assert_eq!(err.to_string(), "Could not get motor position: link down");
    }

    #[test]
    fn lab_error_survives_json() {
        let err = LabError::ConnectionError {
            instrument: InstrumentKind::Camera,
            host: "cam".to_string(),
            port: 7100,
            cause: InstrumentFault::new("connection refused"),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: LabError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn speed_must_be_non_negative() {
        assert!(SpeedRequest { speed: 0.0 }.validate().is_ok());
        assert!(SpeedRequest { speed: 100.0 }.validate().is_ok());

        let err = SpeedRequest { speed: -3.0 }.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("speed"));
    }

    #[test]
    fn position_must_be_finite() {
        assert!(MoveRequest { position: -12.5 }.validate().is_ok());
        assert!(MoveRequest { position: f64::NAN }.validate().is_err());
        assert!(MoveRequest { position: f64::INFINITY }.validate().is_err());
    }

    #[test]
    fn exposure_must_be_strictly_positive() {
        assert!(ExposureRequest { exposure_time_us: 5000.0 }.validate().is_ok());
        assert!(ExposureRequest { exposure_time_us: 0.0 }.validate().is_err());
        assert!(ExposureRequest { exposure_time_us: -1.0 }.validate().is_err());
    }

    #[test]
    fn gain_must_be_non_negative() {
        assert!(GainRequest { gain: 0.0 }.validate().is_ok());
        assert!(GainRequest { gain: 2.5 }.validate().is_ok());
        assert!(GainRequest { gain: -0.5 }.validate().is_err());
    }

    #[test]
    fn requests_parse_from_json_bodies() {
        let req: MoveRequest = serde_json::from_str(r#"{"position": 12.5}"#).unwrap();
        assert_eq!(req.position, 12.5);
        assert!(serde_json::from_str::<MoveRequest>(r#"{"position": "far"}"#).is_err());
        assert!(serde_json::from_str::<SpeedRequest>(r#"{}"#).is_err());
    }

    #[test]
    fn format_number_keeps_one_decimal_for_whole_values() {
        assert_eq!(format_number(50.0), "50.0");
        assert_eq!(format_number(12.5), "12.5");
        assert_eq!(format_number(-3.0), "-3.0");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(0.0), "0.0");
    }

    #[test]
    fn format_number_uses_exponents_at_the_extremes() {
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(0.0000001), "1e-07");
        assert_eq!(format_number(-0.000015), "-1.5e-05");
        assert_eq!(format_number(1e15), "1000000000000000.0");
        assert_eq!(format_number(1e16), "1e+16");
        assert_eq!(format_number(2.5e300), "2.5e+300");
    }
}
