//! Gateway errors and the JSON error responses callers return for them

use crate::sandbox::SandboxError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Unrecoverable failures of `ensure_gateway`
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Required settings are absent
    #[error("missing required configuration: {0}")]
    ConfigMissing(String),

    /// Storage mount precondition failed before any process logic ran
    #[error("storage precondition failed: {0}")]
    Storage(#[source] SandboxError),

    /// The sandbox refused to start the gateway
    #[error("failed to start gateway process '{command}': {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: SandboxError,
    },

    /// The gateway never became reachable; logs were captured
    #[error("gateway failed to start. Stderr: {}", display_or_empty(.stderr))]
    StartupFailed {
        stdout: String,
        stderr: String,
        #[source]
        source: SandboxError,
    },

    /// The gateway never became reachable and logs could not be fetched
    #[error("gateway not reachable on port {port} after {timeout:?}: {source}")]
    StartupTimeout {
        port: u16,
        timeout: Duration,
        #[source]
        source: SandboxError,
    },
}

fn display_or_empty(s: &str) -> &str {
    if s.is_empty() {
        "(empty)"
    } else {
        s
    }
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::ConfigMissing(_) => GatewayErrorCode::ConfigMissing,
            GatewayError::Storage(_) => GatewayErrorCode::StorageUnavailable,
            GatewayError::LaunchFailed { .. } => GatewayErrorCode::GatewayLaunchFailed,
            GatewayError::StartupFailed { .. } => GatewayErrorCode::GatewayStartFailed,
            GatewayError::StartupTimeout { .. } => GatewayErrorCode::GatewayTimeout,
        }
    }

    /// Render this error as the 5xx response a routing layer returns
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// Error codes exposed to callers of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Required configuration is missing
    ConfigMissing,
    /// Storage could not be mounted
    StorageUnavailable,
    /// Sandbox refused to start the gateway
    GatewayLaunchFailed,
    /// Gateway started but never became reachable
    GatewayStartFailed,
    /// Gateway never became reachable and no diagnostics were available
    GatewayTimeout,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ConfigMissing => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::StorageUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::GatewayLaunchFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::GatewayStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ConfigMissing => "CONFIG_MISSING",
            GatewayErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            GatewayErrorCode::GatewayLaunchFailed => "GATEWAY_LAUNCH_FAILED",
            GatewayErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            GatewayErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-gateway-error",
        HeaderValue::from_static(code.as_header_value()),
    );
    response
}
