use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use v6_types::V6Error;

/// Wrapper so `v6_types::V6Error` (shared with the node agent) can impl
/// `IntoResponse` without `v6-types` taking on an axum dependency.
pub struct ApiError(pub V6Error);

impl From<V6Error> for ApiError {
    fn from(err: V6Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "msg": self.0.to_string() }));
        (status, body).into_response()
    }
}
