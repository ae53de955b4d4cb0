// crates/ecmaster-rs-panel/src/error.rs

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ecmaster_rs::{ConfigurationError, MasterError};
use core::fmt;
use serde_json::json;

/// Why a panel request could not be served.
#[derive(Debug)]
pub enum PanelError {
    /// The request does not fit the current bus phase.
    Refused(&'static str),
    /// Not enough successful samples for latency statistics.
    InsufficientData,
    /// The bus manager reported an error.
    Bus(MasterError),
}

impl fmt::Display for PanelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(reason) => f.write_str(reason),
            Self::InsufficientData => f.write_str("Insufficient data captured"),
            Self::Bus(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PanelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bus(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MasterError> for PanelError {
    fn from(e: MasterError) -> Self {
        Self::Bus(e)
    }
}

impl From<ConfigurationError> for PanelError {
    fn from(e: ConfigurationError) -> Self {
        Self::Bus(MasterError::Configuration(e))
    }
}

impl PanelError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Refused(_) => StatusCode::CONFLICT,
            Self::InsufficientData => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Bus(MasterError::Configuration(ConfigurationError::Document(_))) => {
                StatusCode::BAD_REQUEST
            }
            Self::Bus(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.to_string() });
        if let Self::Bus(e) = &self {
            if let Some(report) = e.report() {
                body["report"] = json!(report);
            }
        }
        (self.status(), Json(body)).into_response()
    }
}
