//! API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use powerd_core::Error;
use serde_json::json;

/// Engine errors rendered as JSON HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::LeaseUnavailable(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_error_kind() {
        let cases = [
            (Error::not_found("x"), StatusCode::NOT_FOUND),
            (Error::invalid_state("x"), StatusCode::CONFLICT),
            (Error::invalid_configuration("x"), StatusCode::BAD_REQUEST),
            (Error::permission_denied("x"), StatusCode::FORBIDDEN),
            (Error::lease_unavailable("x"), StatusCode::CONFLICT),
            (Error::timeout("x"), StatusCode::GATEWAY_TIMEOUT),
            (
                Error::dependency_unavailable("x"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
