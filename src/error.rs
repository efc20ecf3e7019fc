//! The boundary-facing error type. Internal components return `anyhow::Result`;
//! `ProxyHandler` is the sole place that converts failure into an HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing or empty url query parameter")]
    BadRequest,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { total_size: u64 },

    #[error("origin fetch failed: {0}")]
    BadGateway(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::BadRequest => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            ProxyError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, self.to_string()).into_response()
            }
            ProxyError::RangeNotSatisfiable { total_size } => {
                let mut response = (StatusCode::RANGE_NOT_SATISFIABLE, self.to_string())
                    .into_response();
                if let Ok(value) =
                    axum::http::HeaderValue::from_str(&crate::range::format_unsatisfiable_content_range(total_size))
                {
                    response.headers_mut().insert("Content-Range", value);
                }
                response
            }
            ProxyError::BadGateway(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
            ProxyError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                    .into_response()
            }
        }
    }
}
