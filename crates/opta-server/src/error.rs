//! Mapping of [`DaemonError`] onto HTTP responses.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use opta_core::errors::DaemonError;

/// Error body: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub DaemonError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DaemonError::Validation(_) => StatusCode::BAD_REQUEST,
            DaemonError::Auth(_) => StatusCode::UNAUTHORIZED,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Overload { .. } => StatusCode::TOO_MANY_REQUESTS,
            DaemonError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            // Cancellation is reported through events; a request that still
            // runs into it conflicted with a concurrent cancel.
            DaemonError::Cancelled => StatusCode::CONFLICT,
            DaemonError::Store(_) | DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DaemonError> for ApiError {
    fn from(e: DaemonError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(DaemonError::Validation(e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(DaemonError::Validation(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.0.retry_after() {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (DaemonError::Validation("x".into()), 400),
            (DaemonError::Auth("x".into()), 401),
            (DaemonError::NotFound("x".into()), 404),
            (DaemonError::Internal("x".into()), 500),
            (DaemonError::Store("x".into()), 500),
            (DaemonError::UpstreamUnavailable { attempts: vec![] }, 502),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }

    #[test]
    fn overload_sets_retry_after() {
        let response = ApiError(DaemonError::Overload {
            message: "full".into(),
            retry_after: Duration::from_millis(1500),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
