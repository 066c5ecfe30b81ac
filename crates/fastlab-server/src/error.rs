//! Mapping of [`LabError`] onto HTTP responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fastlab_types::{ErrorKind, InstrumentEndpoint, InstrumentFault, LabError, Validate};
use serde::{Deserialize, Serialize};
use tracing::error;

/// JSON body of every failed request: `{"kind": "...", "detail": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub detail: String,
}

/// A [`LabError`] on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub LabError);

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = ErrorBody {
            kind: kind.as_str().to_string(),
            detail: self.0.to_string(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ConnectTimeout | ErrorKind::ConnectionUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ConnectionError => StatusCode::BAD_GATEWAY,
        ErrorKind::OperationFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unwrap a JSON body and run its range checks.
///
/// Malformed bodies are reported as validation errors so that nothing
/// reaches an instrument before its input is known to be sane.
pub fn accept<T: Validate>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    let Json(request) = body.map_err(|rejection| LabError::validation("request body", rejection.body_text()))?;
    request.validate()?;
    Ok(request)
}

/// Wrap a failed instrument call, logging where it went and what it was given.
pub fn operation_failed(
    endpoint: &InstrumentEndpoint,
    operation: &str,
    input: Option<String>,
    cause: InstrumentFault,
) -> LabError {
    error!(
        instrument = %endpoint.kind,
        host = %endpoint.host,
        port = endpoint.port,
        input = input.as_deref().unwrap_or("-"),
        error = %cause,
        "could not {operation}"
    );
    LabError::operation_failed(endpoint.kind, operation, input, cause)
}
