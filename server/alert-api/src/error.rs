//! Maps engine errors onto HTTP responses.

use alert_engine::EngineError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
  fn from(err: EngineError) -> Self {
    Self(err)
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match &self.0 {
      EngineError::Validation { field, reason } => (
        StatusCode::BAD_REQUEST,
        json!({ "error": reason, "field": field }),
      ),
      EngineError::Configuration { id, field, reason } => (
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({ "error": reason, "id": id, "field": field }),
      ),
      EngineError::Throttled {
        scope,
        retry_after,
        retry_after_seconds,
      } => {
        let mut response = (
          StatusCode::TOO_MANY_REQUESTS,
          Json(json!({ "error": "throttled", "scope": scope, "retry_after": retry_after })),
        )
          .into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
          response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
      }
      EngineError::NotFound(what) => (StatusCode::NOT_FOUND, json!({ "error": format!("not found: {}", what) })),
      other => {
        tracing::error!(error = %other, "internal error");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          json!({ "error": "internal error" }),
        )
      }
    };
    (status, Json(body)).into_response()
  }
}
