use axum::{
  Router,
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};

mod join;
mod status;

pub fn router() -> Router {
  Router::new()
    .route("/version", get(|| async { env!("CARGO_PKG_VERSION") }))
    .route("/v1/internal/join", post(join::handler))
    .route("/v1/network/status", get(status::handler))
}

/// Error response carrying the status code and the full anyhow chain.
/// The join client surfaces this body verbatim to the operator.
pub struct ApiError(pub StatusCode, pub anyhow::Error);

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.0, format!("{:#}", self.1)).into_response()
  }
}

impl From<anyhow::Error> for ApiError {
  fn from(e: anyhow::Error) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e)
  }
}
