//! Error envelope for the JSON boundary.
//!
//! Every failure renders as `{error: {code, message}}` with 400 for
//! validation and missing-session, 404 for unknown resources, 500 otherwise.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use outpost_cdp_client::CdpError;
use outpost_core_types::ConnectionId;
use outpost_port_forward::ForwardError;
use outpost_remote_browser::BrowserError;
use outpost_session_kernel::SessionError;
use outpost_ssh_transport::TransportError;

use crate::config::ConfigError;

#[derive(Clone, Debug)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: &str) -> Self {
        Self::new("validation", format!("field `{field}` is invalid"))
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new("not-found", format!("{what} not found"))
    }

    pub fn no_session() -> Self {
        Self::new("session/not-active", "no session is active")
    }

    pub fn connection_not_found(id: &ConnectionId) -> Self {
        Self::not_found(format!("connection {id}"))
    }

    fn status(&self) -> StatusCode {
        if self.code == "not-found" {
            StatusCode::NOT_FOUND
        } else if self.code == "validation" || self.code == "session/not-active" {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(json!({ "error": { "code": self.code, "message": self.message } })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<BrowserError> for ApiError {
    fn from(err: BrowserError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<ForwardError> for ApiError {
    fn from(err: ForwardError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<CdpError> for ApiError {
    fn from(err: CdpError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_code() {
        assert_eq!(ApiError::validation("port").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::no_session().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::not_found("connection x").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::new("cdp/timeout", "slow").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
