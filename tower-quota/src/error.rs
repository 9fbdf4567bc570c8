use http::HeaderValue;
use http::Response;
use http::StatusCode;
use http::header::CONTENT_TYPE;

use quota_limit::Decision;
use quota_limit::Rejection;

use crate::service::append_headers;

/// Errors produced by the quota middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    /// The request exceeded its quota.
    ///
    /// Carries the structured 429 body and the quota headers of the
    /// decision, `Retry-After` included.
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error(
        "Rate limit exceeded for {}; retry after {}s",
        .rejection.path,
        .rejection.rate_limit_details.retry_after_seconds
    )]
    RateLimited {
        rejection: Box<Rejection>,
        headers: Vec<(&'static str, String)>,
    },

    /// The quota store failed and the limiter is configured to fail closed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Quota store unavailable: {0}")]
    Unavailable(String),
}

impl QuotaError {
    pub(crate) fn from_decision(decision: &Decision, path: &str) -> Self {
        if decision.is_error() {
            return Self::Unavailable(decision.reason().unwrap_or_default().to_string());
        }
        Self::RateLimited {
            rejection: Box::new(decision.rejection(path)),
            headers: decision.headers().to_vec(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Render the error as a response, independent of any web framework.
    pub fn to_response(&self) -> Response<String> {
        let (body, content_type) = match self {
            Self::RateLimited { rejection, .. } => match serde_json::to_string(rejection) {
                Ok(json) => (json, "application/json"),
                Err(_) => (self.to_string(), "text/plain; charset=utf-8"),
            },
            Self::Unavailable(_) => (self.to_string(), "text/plain; charset=utf-8"),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Self::RateLimited { headers, .. } = self {
            append_headers(response.headers_mut(), headers);
        }
        response
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for QuotaError {
    fn into_response(self) -> axum::response::Response {
        self.to_response().into_response()
    }
}
