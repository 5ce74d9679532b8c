//! Error replies produced by the web proxy itself
//!
//! Every reply the proxy generates, rather than relays, is JSON and carries
//! an `X-Proxy-Error` header so clients can tell it from a backend error.

use crate::scale::WakeError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

pub const PROXY_ERROR_HEADER: &str = "X-Proxy-Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    MissingHostHeader,
    /// No service claims the requested domain
    UnknownHost,
    /// Crash-looping; traffic will not wake it
    ServiceSuspended,
    WakeTimeout,
    /// Scale status could not be read or written
    WakeFailed,
    RequestTimeout,
    ConnectionFailed,
    InternalError,
}

impl ProxyErrorCode {
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::MissingHostHeader => StatusCode::BAD_REQUEST,
            Self::UnknownHost => StatusCode::NOT_FOUND,
            Self::ServiceSuspended | Self::WakeTimeout | Self::WakeFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionFailed => StatusCode::BAD_GATEWAY,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name, shared by the header and the JSON `code` field
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingHostHeader => "MISSING_HOST_HEADER",
            Self::UnknownHost => "UNKNOWN_HOST",
            Self::ServiceSuspended => "SERVICE_SUSPENDED",
            Self::WakeTimeout => "WAKE_TIMEOUT",
            Self::WakeFailed => "WAKE_FAILED",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Body of a proxy-generated error
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: code.status_code().as_u16(),
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let code = self.code;
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| format!(r#"{{"code":"{}"}}"#, code.as_str()).into_bytes());

        let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
        *response.status_mut() = code.status_code();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(PROXY_ERROR_HEADER, HeaderValue::from_static(code.as_str()));
        response
    }
}

impl From<&WakeError> for ErrorResponse {
    fn from(err: &WakeError) -> Self {
        match err {
            WakeError::Suspended(_) => Self::new(
                ProxyErrorCode::ServiceSuspended,
                "Service is suspended after repeated crashes",
            ),
            WakeError::Timeout { timeout, .. } => Self::new(
                ProxyErrorCode::WakeTimeout,
                format!("Service did not start within {} seconds", timeout.as_secs()),
            ),
            WakeError::Failed { .. } => Self::new(ProxyErrorCode::WakeFailed, "Service could not be started"),
        }
    }
}

/// Shorthand for `ErrorResponse::new(code, message).into_response()`
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ServiceKey;
    use std::time::Duration;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProxyErrorCode::MissingHostHeader.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::WakeFailed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_serde_name_matches_header_value() {
        for code in [
            ProxyErrorCode::MissingHostHeader,
            ProxyErrorCode::ServiceSuspended,
            ProxyErrorCode::InternalError,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
    }

    #[test]
    fn test_response_body_and_headers() {
        let response = json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("content-type").unwrap(), "application/json");
        assert_eq!(response.headers().get(PROXY_ERROR_HEADER).unwrap(), "UNKNOWN_HOST");

        let body = serde_json::to_value(ErrorResponse::new(ProxyErrorCode::UnknownHost, "nope")).unwrap();
        assert_eq!(body["code"], "UNKNOWN_HOST");
        assert_eq!(body["status"], 404);
    }

    #[test]
    fn test_wake_errors() {
        let key = ServiceKey::new("tenant", "web");
        let suspended = ErrorResponse::from(&WakeError::Suspended(key.clone()));
        assert_eq!(suspended.code, ProxyErrorCode::ServiceSuspended);

        let timeout = ErrorResponse::from(&WakeError::Timeout {
            key,
            timeout: Duration::from_secs(60),
        });
        assert_eq!(timeout.code, ProxyErrorCode::WakeTimeout);
        assert_eq!(timeout.message, "Service did not start within 60 seconds");
        assert_eq!(timeout.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
